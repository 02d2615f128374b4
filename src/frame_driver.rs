// THEORY:
// The `frame_driver` runs a `PipelineController` on its own task so that the
// frame source, the UI and the processing cycle never block one another.
//
// Three channels feed one actor loop:
//   - a command channel for start, stop, reconfigure and layout changes;
//   - a frame slot holding at most one pending frame. `submit_frame` never
//     waits: if the slot is taken the new frame is dropped, so frames arriving
//     while the actor is busy (or while a cycle is in flight) cost nothing;
//   - a completion channel fed by detached processing tasks.
//
// Because the controller is only touched from the actor, every state change is
// serialized. The detector call for an admitted frame is held by the loop and
// raced against commands, so a slow detector never delays `stop`. No new frame
// is taken while a detection is pending. A finished detection and a detached
// cycle both carry the generation they started under, and the controller
// decides by generation whether their results still count.

use crate::config::PipelineConfig;
use crate::core_modules::candidate::Frame;
use crate::core_modules::coordinate_mapper::ViewGeometry;
use crate::error::{Error, Result};
use crate::pipeline::{
    CycleOutcome, CycleTicket, DetectedFrame, FrameAdmission, FrameDisposition,
    PipelineController, PipelineState, PipelineStats,
};
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop,
    Reconfigure(PipelineConfig, oneshot::Sender<Result<()>>),
    Layout(ViewGeometry),
    Snapshot(oneshot::Sender<PipelineSnapshot>),
    Shutdown,
}

/// A point-in-time view of a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    pub generation: u64,
    pub stats: PipelineStats,
    /// Frames dropped at the slot before the actor ever saw them.
    pub frames_dropped: u64,
}

/// A cheap, cloneable handle onto a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::UnboundedSender<Command>,
    frames: mpsc::Sender<Frame>,
    dropped: Arc<AtomicU64>,
}

impl PipelineHandle {
    /// Offers a frame without waiting. Returns false if it was dropped.
    pub fn submit_frame(&self, frame: Frame) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Waits for the slot to free up, for sources that prefer back-pressure.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.frames.send(frame).await.map_err(|_| Error::Closed)
    }

    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    pub async fn reconfigure(&self, config: PipelineConfig) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reconfigure(config, tx))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub fn update_geometry(&self, geometry: ViewGeometry) -> Result<()> {
        self.send(Command::Layout(geometry))
    }

    pub async fn snapshot(&self) -> Result<PipelineSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Ends the actor loop. In-flight cycles are abandoned.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }
}

/// Spawns the actor for `controller` on the current tokio runtime.
pub fn spawn(controller: PipelineController) -> (PipelineHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel(1);
    let dropped = Arc::new(AtomicU64::new(0));

    let actor = Actor {
        controller,
        commands: command_rx,
        frames: frame_rx,
        dropped: Arc::clone(&dropped),
    };
    let task = tokio::spawn(actor.run());

    let handle = PipelineHandle {
        commands: command_tx,
        frames: frame_tx,
        dropped,
    };
    (handle, task)
}

struct Actor {
    controller: PipelineController,
    commands: mpsc::UnboundedReceiver<Command>,
    frames: mpsc::Receiver<Frame>,
    dropped: Arc<AtomicU64>,
}

impl Actor {
    async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CycleOutcome>();
        let mut detecting: Option<BoxFuture<'static, DetectedFrame>> = None;
        tracing::debug!("pipeline actor started");

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(outcome) = done_rx.recv() => {
                    self.controller.complete_cycle(outcome);
                }
                Some(detected) = OptionFuture::from(detecting.as_mut()), if detecting.is_some() => {
                    detecting = None;
                    let disposition = self.controller.finish_frame(detected);
                    if let FrameDisposition::Captured(ticket) = disposition {
                        self.spawn_cycle(ticket, &done_tx);
                    }
                }
                Some(frame) = self.frames.recv(), if detecting.is_none() => {
                    if let FrameAdmission::Detect(pending) = self.controller.admit_frame(frame) {
                        detecting = Some(pending.run().boxed());
                    }
                }
            }
        }

        self.controller.stop();
        tracing::debug!("pipeline actor stopped");
    }

    fn spawn_cycle(&self, ticket: CycleTicket, done: &mpsc::UnboundedSender<CycleOutcome>) {
        let job = self.controller.processing_job(ticket);
        let done = done.clone();
        tokio::spawn(async move {
            let _ = done.send(job.await);
        });
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.controller.start());
            }
            Command::Stop => self.controller.stop(),
            Command::Reconfigure(config, reply) => {
                let _ = reply.send(self.controller.reconfigure(config));
            }
            Command::Layout(geometry) => self.controller.update_geometry(geometry),
            Command::Snapshot(reply) => {
                let _ = reply.send(PipelineSnapshot {
                    state: self.controller.state(),
                    generation: self.controller.generation(),
                    stats: self.controller.stats(),
                    frames_dropped: self.dropped.load(Ordering::Relaxed),
                });
            }
            Command::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::candidate::PlacementRecord;
    use crate::core_modules::coordinate_mapper::CoordinateMapper;
    use crate::core_modules::geometry::{Rect, ScreenView};
    use crate::core_modules::translation_cache::LanguagePair;
    use crate::interfaces::{Collaborators, Recognizer, RenderEvent, RenderSink};
    use crate::test_utils::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Rig {
        handle: PipelineHandle,
        task: JoinHandle<()>,
        events: mpsc::UnboundedReceiver<RenderEvent>,
        clock: FrameClock,
        detector: Arc<ScriptedDetector>,
        translator: Arc<DictionaryTranslator>,
    }

    fn rig(config: PipelineConfig, recognizer: Arc<dyn Recognizer>) -> Rig {
        let geometry = identity_geometry();
        let boxes: Vec<Rect<ScreenView>> = vec![Rect::new(10.0, 10.0, 100.0, 40.0)];
        let detector = Arc::new(ScriptedDetector::new(CoordinateMapper::new(geometry), boxes));
        let translator = Arc::new(DictionaryTranslator::default());
        let collaborators = Collaborators {
            detector: detector.clone(),
            recognizer,
            translator: translator.clone(),
        };
        let (sink, events) = RenderSink::channel();
        let controller =
            PipelineController::new(config, geometry, collaborators, sink).expect("valid config");
        let (handle, task) = spawn(controller);
        Rig {
            handle,
            task,
            events,
            clock: FrameClock::default(),
            detector,
            translator,
        }
    }

    async fn wait_for(
        handle: &PipelineHandle,
        done: impl Fn(&PipelineSnapshot) -> bool,
    ) -> PipelineSnapshot {
        tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = handle.snapshot().await.expect("actor alive");
                if done(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition reached in time")
    }

    async fn next_placements(
        events: &mut mpsc::UnboundedReceiver<RenderEvent>,
    ) -> Vec<PlacementRecord> {
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await.expect("sink open") {
                    RenderEvent::Placements(records) => return records,
                    _ => continue,
                }
            }
        })
        .await
        .expect("placements in time")
    }

    #[tokio::test]
    async fn delivers_translated_placements() {
        let config = PipelineConfig {
            languages: Some(LanguagePair::new("en", "my")),
            ..PipelineConfig::default()
        };
        let mut rig = rig(config, Arc::new(FixedRecognizer::new("Hello")));
        rig.translator.insert("Hello", "မင်္ဂလာပါ");
        rig.handle.start().await.expect("start");

        for _ in 0..3 {
            rig.handle.send_frame(rig.clock.next_frame()).await.expect("sent");
        }
        let records = next_placements(&mut rig.events).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_text, "Hello");
        assert_eq!(records[0].translated_text.as_deref(), Some("မင်္ဂလာပါ"));

        let snapshot = wait_for(&rig.handle, |s| s.state == PipelineState::Idle).await;
        assert_eq!(snapshot.stats.cycles_completed, 1);
        rig.handle.shutdown().expect("shutdown");
        rig.task.await.expect("actor exits");
    }

    #[tokio::test]
    async fn stop_during_processing_discards_cycle() {
        let gate = GatedRecognizer::new("hello");
        let mut rig = rig(PipelineConfig::default(), Arc::new(gate.clone()));
        rig.handle.start().await.expect("start");
        for _ in 0..3 {
            rig.handle.send_frame(rig.clock.next_frame()).await.expect("sent");
        }
        wait_for(&rig.handle, |s| s.state == PipelineState::Processing).await;

        rig.handle.stop().expect("stop");
        gate.open();
        let snapshot = wait_for(&rig.handle, |s| s.stats.stale_outcomes == 1).await;
        assert_eq!(snapshot.state, PipelineState::Idle);
        assert_eq!(snapshot.stats.cycles_cancelled, 1);
        assert_eq!(snapshot.stats.cycles_completed, 0);

        while let Ok(event) = rig.events.try_recv() {
            assert!(!matches!(event, RenderEvent::Placements(_)), "cancelled cycle rendered");
        }
    }

    #[tokio::test]
    async fn stop_is_served_while_detection_is_pending() {
        let config = PipelineConfig {
            reliability: 1,
            ..PipelineConfig::default()
        };
        let recognizer = Arc::new(FixedRecognizer::new("hello"));
        let mut rig = rig(config, recognizer.clone());
        let gate = rig.detector.hold();
        rig.handle.start().await.expect("start");
        rig.handle.send_frame(rig.clock.next_frame()).await.expect("sent");
        wait_for(&rig.handle, |s| s.stats.frames_analyzed == 1).await;

        // The detector is still holding the frame.
        rig.handle.stop().expect("stop");
        let snapshot = wait_for(&rig.handle, |s| s.state == PipelineState::Idle).await;
        assert_eq!(snapshot.stats.stale_detections, 0);

        gate.add_permits(1);
        let snapshot = wait_for(&rig.handle, |s| s.stats.stale_detections == 1).await;
        assert_eq!(snapshot.state, PipelineState::Idle);
        assert_eq!(snapshot.stats.cycles_started, 0);
        assert_eq!(recognizer.calls(), 0);
        assert!(rig.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_wait_in_the_slot_while_detecting() {
        let rig = rig(PipelineConfig::default(), Arc::new(FixedRecognizer::new("hello")));
        let mut clock = rig.clock;
        let gate = rig.detector.hold();
        rig.handle.start().await.expect("start");
        rig.handle.send_frame(clock.next_frame()).await.expect("sent");
        wait_for(&rig.handle, |s| s.stats.frames_analyzed == 1).await;

        // One frame fits in the slot; the actor does not take it yet.
        rig.handle.send_frame(clock.next_frame()).await.expect("sent");
        assert!(!rig.handle.submit_frame(clock.next_frame()));
        let snapshot = rig.handle.snapshot().await.expect("actor alive");
        assert_eq!(snapshot.stats.frames_received, 1);
        assert_eq!(snapshot.frames_dropped, 1);

        gate.add_permits(2);
        let snapshot = wait_for(&rig.handle, |s| s.stats.frames_analyzed == 2).await;
        assert_eq!(snapshot.stats.frames_received, 2);
        assert_eq!(rig.detector.calls(), 2);
    }

    #[tokio::test]
    async fn frames_during_a_cycle_are_ignored() {
        let gate = GatedRecognizer::new("hello");
        let rig = rig(PipelineConfig::default(), Arc::new(gate.clone()));
        let mut clock = rig.clock;
        rig.handle.start().await.expect("start");
        for _ in 0..3 {
            rig.handle.send_frame(clock.next_frame()).await.expect("sent");
        }
        wait_for(&rig.handle, |s| s.state == PipelineState::Processing).await;

        for _ in 0..4 {
            rig.handle.send_frame(clock.next_frame()).await.expect("sent");
        }
        let snapshot = wait_for(&rig.handle, |s| s.stats.frames_received == 7).await;
        assert_eq!(snapshot.stats.frames_analyzed, 3);
        assert_eq!(snapshot.stats.frames_ignored, 4);

        gate.open();
        wait_for(&rig.handle, |s| s.state == PipelineState::Idle).await;
    }

    #[tokio::test]
    async fn full_slot_drops_frames() {
        let rig = rig(PipelineConfig::default(), Arc::new(FixedRecognizer::new("hello")));
        let mut clock = rig.clock;
        // The actor has not been polled yet on this single-threaded runtime,
        // so only the first frame fits in the slot.
        assert!(rig.handle.submit_frame(clock.next_frame()));
        assert!(!rig.handle.submit_frame(clock.next_frame()));
        assert!(!rig.handle.submit_frame(clock.next_frame()));

        let snapshot = wait_for(&rig.handle, |s| s.stats.frames_received == 1).await;
        assert_eq!(snapshot.frames_dropped, 2);
        assert_eq!(snapshot.stats.frames_ignored, 1, "not started yet");
    }

    #[tokio::test]
    async fn handle_reports_closed_after_shutdown() {
        let rig = rig(PipelineConfig::default(), Arc::new(FixedRecognizer::new("hello")));
        rig.handle.shutdown().expect("shutdown");
        rig.task.await.expect("actor exits");
        assert!(matches!(rig.handle.start().await, Err(Error::Closed)));
        let frame = Frame::new(0, Duration::ZERO, image::RgbaImage::new(1, 1));
        assert!(!rig.handle.submit_frame(frame));
    }

    #[tokio::test]
    async fn invalid_reconfigure_is_reported() {
        let rig = rig(PipelineConfig::default(), Arc::new(FixedRecognizer::new("hello")));
        let bad = PipelineConfig {
            max_boxes: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(rig.handle.reconfigure(bad).await, Err(Error::InvalidConfig(_))));
        rig.handle.reconfigure(PipelineConfig::default()).await.expect("valid");
    }
}
