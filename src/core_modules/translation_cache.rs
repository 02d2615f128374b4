// THEORY:
// Translation is the slowest collaborator the pipeline talks to, and a user
// pointing a camera at a sign will see the same words over and over. The
// `TranslationCache` memoizes successful translations for the lifetime of one
// pipeline instance, keyed by a strongly typed `(text, source, target)` triple.
//
// The cache is a plain map behind a mutex. It has no eviction policy; its size
// is bounded by the vocabulary of a session. Failed translations are never
// stored, so a transient network error is retried on the next sighting.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A language tag such as `en` or `my`, stored trimmed and lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for LanguageCode {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

impl From<&str> for LanguageCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<LanguageCode> for String {
    fn from(code: LanguageCode) -> Self {
        code.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source and target language of a translation request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: LanguageCode,
    pub target: LanguageCode,
}

impl LanguagePair {
    pub fn new(source: impl Into<LanguageCode>, target: impl Into<LanguageCode>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

/// Collapses runs of whitespace and trims, so OCR spacing noise shares a cache slot.
pub fn normalize_source_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranslationKey {
    pub text: String,
    pub languages: LanguagePair,
}

impl TranslationKey {
    pub fn new(text: &str, languages: &LanguagePair) -> Self {
        Self {
            text: normalize_source_text(text),
            languages: languages.clone(),
        }
    }
}

/// Memo of successful translations, shared between concurrent translation tasks.
#[derive(Debug, Default)]
pub struct TranslationCache {
    entries: Mutex<HashMap<TranslationKey, String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-written.
    fn lock(&self) -> MutexGuard<'_, HashMap<TranslationKey, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &TranslationKey) -> Option<String> {
        let found = self.lock().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, key: TranslationKey, translated: String) {
        self.lock().insert(key, translated);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_normalize_whitespace_but_not_languages_order() {
        let en_my = LanguagePair::new("EN", " my ");
        let my_en = LanguagePair::new("my", "en");
        assert_eq!(en_my.source.as_str(), "en");
        assert_eq!(
            TranslationKey::new("  hello \n world ", &en_my),
            TranslationKey::new("hello world", &en_my)
        );
        assert_ne!(TranslationKey::new("hello", &en_my), TranslationKey::new("hello", &my_en));
    }

    #[test]
    fn cache_counts_hits_and_misses() {
        let cache = TranslationCache::new();
        let key = TranslationKey::new("hello", &LanguagePair::new("en", "my"));
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), "မင်္ဂလာပါ".into());
        assert_eq!(cache.get(&key).as_deref(), Some("မင်္ဂလာပါ"));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn language_pair_deserializes_normalized() {
        let pair: LanguagePair =
            toml::from_str("source = \"EN\"\ntarget = \"my\"").expect("valid toml");
        assert_eq!(pair, LanguagePair::new("en", "my"));
        assert_eq!(pair.to_string(), "en->my");
    }
}
