pub mod candidate;
pub mod coordinate_mapper;
pub mod geometry;
pub mod stability;
pub mod suppressor;
pub mod translation_cache;
