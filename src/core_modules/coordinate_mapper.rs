// THEORY:
// The `CoordinateMapper` is the bridge between what the detector sees and where
// the overlay must be drawn. The detector reports boxes in a unit square with a
// bottom-left origin covering the visible part of the video. The overlay is
// drawn in the hosting view, top-left origin, after the video layer has scaled
// and cropped the video to fit.
//
// The mapper composes one affine transform from the live view geometry and
// reuses it for every box until the layout changes:
//   1. The video's unit rect is projected into the layer (the "metadata to
//      layer" conversion), honouring the layer's gravity.
//   2. The projection is intersected with the view bounds: the visible rect.
//   3. `to_screen = scale(1, -1) . translate(0, 1) . scale(vw, vh) . translate(vx, vy)`,
//      that is `scale(vw, -vh)` followed by a shift to the visible origin.
//
// It also knows how the same normalized boxes land on the captured pixel grid,
// so the pipeline can crop exactly what the user is looking at.

use crate::core_modules::geometry::{
    AffineTransform, CoordinateSpace, DetectorNormalized, ImagePixel, Point, Quad, Rect,
    ScreenView, Size,
};

/// How the video layer fits the video into its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoGravity {
    /// Stretch to fill, ignoring aspect ratio.
    Resize,
    /// Fit inside, letterboxed.
    ResizeAspect,
    /// Fill, cropping the overflow.
    #[default]
    ResizeAspectFill,
}

/// Everything the mapper needs to know about the current layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewGeometry {
    /// Bounds of the hosting view.
    pub view_bounds: Rect<ScreenView>,
    /// Frame of the video preview layer inside the view.
    pub layer_frame: Rect<ScreenView>,
    /// Display-oriented size of the video in pixels.
    pub video_size: Size,
    pub gravity: VideoGravity,
    /// Rotation from display orientation to the raw capture buffer, in radians.
    pub buffer_rotation: f64,
}

impl ViewGeometry {
    /// A full-view layer showing `video_size` with the given gravity.
    pub fn fullscreen(view_size: Size, video_size: Size, gravity: VideoGravity) -> Self {
        let bounds = Rect::new(0.0, 0.0, view_size.width, view_size.height);
        Self {
            view_bounds: bounds,
            layer_frame: bounds,
            video_size,
            gravity,
            buffer_rotation: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateMapper {
    geometry: ViewGeometry,
    /// Where the whole video lands in view space.
    video_rect: Rect<ScreenView>,
    /// The part of `video_rect` inside the view bounds.
    visible: Rect<ScreenView>,
    to_screen: AffineTransform,
    from_screen: AffineTransform,
}

impl CoordinateMapper {
    pub fn new(geometry: ViewGeometry) -> Self {
        let video_rect = metadata_to_layer(&geometry);
        let visible = video_rect
            .intersection(&geometry.view_bounds)
            .unwrap_or_else(|| Rect::new(geometry.view_bounds.x, geometry.view_bounds.y, 0.0, 0.0));

        let to_screen = AffineTransform::scale(1.0, -1.0)
            .then(&AffineTransform::translate(0.0, 1.0))
            .then(&AffineTransform::scale(visible.width, visible.height))
            .then(&AffineTransform::translate(visible.x, visible.y));
        // A collapsed visible rect has no inverse; map everything to the origin.
        let from_screen = to_screen.invert().unwrap_or(AffineTransform::scale(0.0, 0.0));

        tracing::debug!(
            visible_x = visible.x,
            visible_y = visible.y,
            visible_w = visible.width,
            visible_h = visible.height,
            "coordinate mapper rebuilt"
        );
        Self {
            geometry,
            video_rect,
            visible,
            to_screen,
            from_screen,
        }
    }

    pub fn geometry(&self) -> &ViewGeometry {
        &self.geometry
    }

    pub fn visible_rect(&self) -> Rect<ScreenView> {
        self.visible
    }

    /// The composed detector-to-screen transform.
    pub fn transform(&self) -> AffineTransform {
        self.to_screen
    }

    pub fn to_screen(&self, rect: &Rect<DetectorNormalized>) -> Rect<ScreenView> {
        map_rect(rect, &self.to_screen)
    }

    pub fn to_detector(&self, rect: &Rect<ScreenView>) -> Rect<DetectorNormalized> {
        map_rect(rect, &self.from_screen)
    }

    pub fn quad_to_screen(&self, quad: &Quad<DetectorNormalized>) -> Quad<ScreenView> {
        quad.apply_affine(&self.to_screen).reorganize().cast_space()
    }

    pub fn quad_to_detector(&self, quad: &Quad<ScreenView>) -> Quad<DetectorNormalized> {
        quad.apply_affine(&self.from_screen).reorganize().cast_space()
    }

    /// The visible portion of the video on the display-oriented pixel grid.
    pub fn visible_region(&self) -> Rect<ImagePixel> {
        let video = self.video_rect;
        if video.is_degenerate() {
            return Rect::new(0.0, 0.0, 0.0, 0.0);
        }
        let sx = self.geometry.video_size.width / video.width;
        let sy = self.geometry.video_size.height / video.height;
        Rect::new(
            (self.visible.x - video.x) * sx,
            (self.visible.y - video.y) * sy,
            self.visible.width * sx,
            self.visible.height * sy,
        )
    }

    pub fn to_image_pixel(&self, rect: &Rect<DetectorNormalized>) -> Rect<ImagePixel> {
        let region = self.visible_region();
        let top_down = rect.flip_vertical(1.0);
        Rect::new(
            region.x + top_down.x * region.width,
            region.y + top_down.y * region.height,
            top_down.width * region.width,
            top_down.height * region.height,
        )
    }

    pub fn from_image_pixel(&self, rect: &Rect<ImagePixel>) -> Rect<DetectorNormalized> {
        let region = self.visible_region();
        if region.is_degenerate() {
            return Rect::new(0.0, 0.0, 0.0, 0.0);
        }
        let top_down: Rect<DetectorNormalized> = Rect::new(
            (rect.x - region.x) / region.width,
            (rect.y - region.y) / region.height,
            rect.width / region.width,
            rect.height / region.height,
        );
        top_down.flip_vertical(1.0)
    }

    /// Maps a screen box onto the raw capture buffer of size `buffer_size`,
    /// undoing the display rotation.
    pub fn to_buffer_pixel(&self, quad: &Quad<ScreenView>, buffer_size: Size) -> Quad<ImagePixel> {
        let detector = self.quad_to_detector(quad).bounding_rect();
        let display = self.to_image_pixel(&detector).to_quad();
        display.scale_to_fit(self.geometry.video_size, buffer_size, self.geometry.buffer_rotation)
    }
}

fn map_rect<S: CoordinateSpace, T: CoordinateSpace>(
    rect: &Rect<S>,
    transform: &AffineTransform,
) -> Rect<T> {
    let p = transform.apply(rect.origin());
    let q = transform.apply(Point::new(rect.x + rect.width, rect.y + rect.height));
    Rect::<T>::from_corners(p, q)
}

/// Projects the video's unit rect into view space according to gravity.
fn metadata_to_layer(geometry: &ViewGeometry) -> Rect<ScreenView> {
    let layer = geometry.layer_frame;
    let video = geometry.video_size;
    if video.is_empty() || layer.is_degenerate() || geometry.gravity == VideoGravity::Resize {
        return layer;
    }
    let fit = layer.width / video.width;
    let fill = layer.height / video.height;
    let scale = match geometry.gravity {
        VideoGravity::ResizeAspect => fit.min(fill),
        _ => fit.max(fill),
    };
    let (w, h) = (video.width * scale, video.height * scale);
    Rect::new(layer.x + (layer.width - w) / 2.0, layer.y + (layer.height - h) / 2.0, w, h)
}
