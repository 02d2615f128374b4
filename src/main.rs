// A small end-to-end run of the `lingo_vision` library against a simulated
// camera. Two painted signs jitter a little from frame to frame; the pipeline
// waits for them to settle, reads them once, translates them and prints where
// the overlay labels would go.

use anyhow::Context;
use clap::Parser;
use futures::future::{BoxFuture, FutureExt};
use image::{Rgba, RgbaImage};
use lingo_vision::core_modules::candidate::{Candidate, Frame};
use lingo_vision::core_modules::coordinate_mapper::{
    CoordinateMapper, VideoGravity, ViewGeometry,
};
use lingo_vision::core_modules::geometry::{DetectorNormalized, Rect, Size};
use lingo_vision::core_modules::translation_cache::LanguagePair;
use lingo_vision::interfaces::DetectionRequest;
use lingo_vision::{
    Collaborators, Detector, PipelineConfig, PipelineController, PipelineState, Recognizer,
    RenderEvent, RenderSink, Translator, frame_driver,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Run the text overlay pipeline against a simulated camera")]
struct Args {
    /// TOML pipeline configuration. Defaults are used for missing keys.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of frames the simulated camera produces.
    #[arg(long, default_value_t = 90)]
    frames: u64,

    /// Keep scanning after each completed cycle.
    #[arg(long)]
    repeat: bool,

    /// Simulated camera rate.
    #[arg(long, default_value_t = 30.0)]
    camera_fps: f64,

    #[arg(long, default_value = "en")]
    source: String,

    #[arg(long, default_value = "es")]
    target: String,
}

struct Sign {
    rect: Rect<DetectorNormalized>,
    color: Rgba<u8>,
    text: &'static str,
}

const RED: Rgba<u8> = Rgba([200, 30, 30, 255]);
const BLUE: Rgba<u8> = Rgba([30, 60, 200, 255]);

fn signs() -> Vec<Sign> {
    vec![
        Sign {
            rect: Rect::new(0.1, 0.6, 0.5, 0.12),
            color: RED,
            text: "EXIT",
        },
        Sign {
            rect: Rect::new(0.2, 0.2, 0.6, 0.1),
            color: BLUE,
            text: "Hello   world",
        },
    ]
}

/// Paints the signs where the camera would see them.
fn render_frame(id: u64, timestamp: Duration, mapper: &CoordinateMapper, video: Size) -> Frame {
    let background = Rgba([240, 240, 240, 255]);
    let mut image = RgbaImage::from_pixel(video.width as u32, video.height as u32, background);
    for sign in signs() {
        let area = mapper.to_image_pixel(&sign.rect);
        let x0 = area.min_x().max(0.0) as u32;
        let y0 = area.min_y().max(0.0) as u32;
        let x1 = (area.max_x().min(video.width) as u32).min(image.width());
        let y1 = (area.max_y().min(video.height) as u32).min(image.height());
        for y in y0..y1 {
            for x in x0..x1 {
                image.put_pixel(x, y, sign.color);
            }
        }
    }
    Frame::new(id, timestamp, image)
}

/// Reports the true sign boxes with a little wobble, and drops out now and then.
struct JitteryDetector;

impl Detector for JitteryDetector {
    fn detect(
        &self,
        request: DetectionRequest,
    ) -> BoxFuture<'_, anyhow::Result<Vec<Candidate<DetectorNormalized>>>> {
        async move {
            let id = request.frame.id;
            if id % 11 == 5 {
                return Ok(Vec::new());
            }
            let wobble = 0.003 * (id as f64 * 1.7).sin();
            let candidates = signs()
                .iter()
                .map(|sign| {
                    let r = sign.rect;
                    let rect = Rect::new(r.x + wobble, r.y - wobble, r.width, r.height);
                    Candidate::from_rect(rect, 0.8)
                })
                .collect();
            Ok(candidates)
        }
        .boxed()
    }
}

/// Reads a sign by its paint colour.
struct ColourRecognizer;

impl Recognizer for ColourRecognizer {
    fn recognize(&self, region: RgbaImage) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        async move {
            if region.width() == 0 || region.height() == 0 {
                return Ok(None);
            }
            let centre = region.get_pixel(region.width() / 2, region.height() / 2);
            let text = signs()
                .into_iter()
                .find(|sign| sign.color == *centre)
                .map(|sign| sign.text.to_string());
            Ok(text)
        }
        .boxed()
    }
}

struct PhrasebookTranslator {
    phrases: HashMap<&'static str, &'static str>,
}

impl PhrasebookTranslator {
    fn new() -> Self {
        Self {
            phrases: HashMap::from([("EXIT", "SALIDA"), ("Hello world", "Hola mundo")]),
        }
    }
}

impl Translator for PhrasebookTranslator {
    fn translate(
        &self,
        text: String,
        languages: LanguagePair,
    ) -> BoxFuture<'_, anyhow::Result<String>> {
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.phrases
                .get(text.as_str())
                .map(|t| t.to_string())
                .with_context(|| format!("no {languages} phrase for {text:?}"))
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.repeat |= args.repeat;
    if config.languages.is_none() {
        config.languages = Some(LanguagePair::new(args.source.as_str(), args.target.as_str()));
    }
    config.validate()?;

    let video = Size::new(480.0, 640.0);
    let view = Size::new(400.0, 800.0);
    let geometry = ViewGeometry::fullscreen(view, video, VideoGravity::ResizeAspectFill);
    let mapper = CoordinateMapper::new(geometry);

    let collaborators = Collaborators {
        detector: Arc::new(JitteryDetector),
        recognizer: Arc::new(ColourRecognizer),
        translator: Arc::new(PhrasebookTranslator::new()),
    };
    let (sink, mut events) = RenderSink::channel();
    let controller = PipelineController::new(config, geometry, collaborators, sink)?;
    let (handle, actor) = frame_driver::spawn(controller);

    let printer = tokio::spawn(async move {
        let mut cycle = 0;
        while let Some(event) = events.recv().await {
            match event {
                RenderEvent::Placements(records) => {
                    cycle += 1;
                    println!("cycle {cycle}: {} placement(s)", records.len());
                    for record in records {
                        let b = record.screen_rect.bounding_rect();
                        println!(
                            "  {:?} -> {:?} at ({:.0}, {:.0}) {:.0}x{:.0}",
                            record.source_text,
                            record.display_text(),
                            b.x,
                            b.y,
                            b.width,
                            b.height
                        );
                    }
                }
                RenderEvent::Unstable(hint) => tracing::trace!(?hint, "hint"),
                RenderEvent::HintCleared => tracing::trace!("hint cleared"),
            }
        }
    });

    handle.start().await?;
    let spacing = Duration::from_secs_f64(1.0 / args.camera_fps);
    for id in 0..args.frames {
        let frame = render_frame(id, spacing * id as u32, &mapper, video);
        handle.send_frame(frame).await?;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // Let a cycle that is still in flight finish.
    for _ in 0..100 {
        if handle.snapshot().await?.state != PipelineState::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = handle.snapshot().await?;
    println!("{:#?}", snapshot.stats);

    handle.shutdown()?;
    actor.await?;
    printer.await?;
    Ok(())
}
