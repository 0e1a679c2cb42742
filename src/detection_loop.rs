use crate::bounding_box::DetectionCounters;
use crate::camera::{CapturedFrame, FrameSource};
use crate::detection_client::{DetectionClientError, Detector};
use crate::overlay::{Canvas, OverlayRenderer};
use crate::telemetry::Metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{interval, Instant, Interval, MissedTickBehavior},
};
use tracing::instrument;

pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;

#[derive(Error, Debug)]
pub enum DetectionLoopError {
    #[error("Detection error: {last} ({streak} consecutive failures)")]
    SustainedFailure {
        streak: u32,
        last: DetectionClientError,
    },
}

/// Hands control back to the runtime between ticks.
#[async_trait]
pub trait Scheduler: Send {
    async fn next_tick(&mut self);
}

/// Paces ticks at a display-refresh rate. A slow tick delays the next one
/// instead of bursting to catch up.
pub struct FrameClock {
    interval: Interval,
}

impl FrameClock {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Scheduler for FrameClock {
    async fn next_tick(&mut self) {
        self.interval.tick().await;
    }
}

#[derive(Debug, Default)]
pub struct YieldScheduler;

#[async_trait]
impl Scheduler for YieldScheduler {
    async fn next_tick(&mut self) {
        tokio::task::yield_now().await;
    }
}

/// Shared run flag. Starts out running; once stopped it stays stopped.
#[derive(Debug, Clone)]
pub struct LoopControl {
    running: Arc<watch::Sender<bool>>,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopControl {
    pub fn new() -> Self {
        let (running, _) = watch::channel(true);
        Self {
            running: Arc::new(running),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Returns `true` if this call is the one that stopped the loop.
    pub fn stop(&self) -> bool {
        self.running.send_replace(false)
    }

    pub async fn stopped(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub consecutive_error_count: u32,
    pub last_frame_at: Option<Instant>,
    pub fps: Option<u32>,
}

impl LoopState {
    /// No FPS is derived from the very first frame, and a zero interval keeps
    /// the previous value.
    pub fn record_frame(&mut self, now: Instant) {
        if let Some(previous) = self.last_frame_at {
            let delta_ms = now.duration_since(previous).as_secs_f64() * 1000.0;
            if delta_ms > 0.0 {
                self.fps = Some((1000.0 / delta_ms).round() as u32);
            }
        }
        self.last_frame_at = Some(now);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoopSnapshot {
    pub running: bool,
    pub fps: Option<u32>,
    pub counters: DetectionCounters,
    pub consecutive_errors: u32,
    pub frames_processed: u64,
    pub terminal_error: Option<String>,
}

/// The latest overlay together with the frame it was drawn for.
#[derive(Debug, Clone, Default)]
pub struct RenderedFrame<C> {
    pub overlay: C,
    pub frame: Option<CapturedFrame>,
}

impl<C> RenderedFrame<C> {
    pub fn new(overlay: C) -> Self {
        Self {
            overlay,
            frame: None,
        }
    }
}

enum Tick {
    Continue,
    Halt,
}

pub struct DetectionLoop<F: FrameSource + ?Sized, D: Detector + ?Sized, C: Canvas> {
    source: Arc<F>,
    detector: Arc<D>,
    rendered: Arc<Mutex<RenderedFrame<C>>>,
    renderer: OverlayRenderer,
    control: LoopControl,
    state: LoopState,
    counters: DetectionCounters,
    frames_processed: u64,
    terminal_error: Option<String>,
    max_consecutive_errors: u32,
    snapshot_tx: watch::Sender<LoopSnapshot>,
    metrics: Option<Arc<Metrics>>,
}

impl<F, D, C> DetectionLoop<F, D, C>
where
    F: FrameSource + ?Sized,
    D: Detector + ?Sized,
    C: Canvas + Send,
{
    pub fn new(source: Arc<F>, detector: Arc<D>, rendered: Arc<Mutex<RenderedFrame<C>>>) -> Self {
        let (snapshot_tx, _) = watch::channel(LoopSnapshot {
            running: true,
            ..LoopSnapshot::default()
        });
        Self {
            source,
            detector,
            rendered,
            renderer: OverlayRenderer::new(),
            control: LoopControl::new(),
            state: LoopState::default(),
            counters: DetectionCounters::default(),
            frames_processed: 0,
            terminal_error: None,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            snapshot_tx,
            metrics: None,
        }
    }

    pub fn with_max_consecutive_errors(mut self, max_consecutive_errors: u32) -> Self {
        self.max_consecutive_errors = max_consecutive_errors;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn counters(&self) -> DetectionCounters {
        self.counters
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        LoopSnapshot {
            running: self.control.is_running(),
            fps: self.state.fps,
            counters: self.counters,
            consecutive_errors: self.state.consecutive_error_count,
            frames_processed: self.frames_processed,
            terminal_error: self.terminal_error.clone(),
        }
    }

    /// Runs ticks back to back until stopped or until the failure streak is
    /// exceeded. Only the latter is reported as an error.
    pub async fn run<S: Scheduler>(&mut self, scheduler: &mut S) -> Result<(), DetectionLoopError> {
        tracing::info!("Detection loop started");
        loop {
            let tick = self.tick().await;
            self.snapshot_tx.send_replace(self.snapshot());

            match tick {
                Ok(Tick::Continue) => scheduler.next_tick().await,
                Ok(Tick::Halt) => {
                    tracing::info!("Detection loop stopped");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(streak = self.state.consecutive_error_count))]
    async fn tick(&mut self) -> Result<Tick, DetectionLoopError> {
        if !self.control.is_running() {
            return Ok(Tick::Halt);
        }

        if !self.source.is_ready() {
            return Ok(Tick::Continue);
        }
        let frame = match self.source.capture().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Tick::Continue),
            Err(err) => {
                tracing::debug!("Frame not available yet: {}", err);
                return Ok(Tick::Continue);
            }
        };
        if !self.control.is_running() {
            return Ok(Tick::Halt);
        }

        self.state.record_frame(Instant::now());
        if let (Some(metrics), Some(fps)) = (&self.metrics, self.state.fps) {
            metrics.record_detection_fps(fps as f64);
        }

        let started = Instant::now();
        let result = tokio::select! {
            result = self.detector.detect(&frame) => result,
            _ = self.control.stopped() => return Ok(Tick::Halt),
        };
        if !self.control.is_running() {
            // Result of a request that outlived `stop()`; discard it.
            return Ok(Tick::Halt);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_detection_duration(started.elapsed().as_millis() as u64);
        }

        match result {
            Ok(batch) => {
                self.state.consecutive_error_count = 0;
                self.counters = DetectionCounters::from_batch(&batch);
                self.frames_processed += 1;

                let mut rendered = self.rendered.lock();
                self.renderer
                    .render(&mut rendered.overlay, &batch, frame.width, frame.height);
                rendered.frame = Some(frame);
                Ok(Tick::Continue)
            }
            Err(err) => {
                self.state.consecutive_error_count += 1;
                let streak = self.state.consecutive_error_count;
                if let Some(metrics) = &self.metrics {
                    metrics.record_detection_error(err.kind());
                }

                if streak > self.max_consecutive_errors {
                    let err = DetectionLoopError::SustainedFailure { streak, last: err };
                    tracing::error!("{}", err);
                    self.terminal_error = Some(err.to_string());
                    self.control.stop();
                    return Err(err);
                }

                if err.is_transport() {
                    tracing::warn!("Detection request failed to reach backend: {}", err);
                } else {
                    tracing::warn!("Backend rejected detection request: {}", err);
                }
                Ok(Tick::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::{BoundingBox, DetectionBatch, Prediction};
    use crate::camera::CameraError;
    use crate::overlay::{DisplayList, DrawCommand};
    use bytes::Bytes;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn frame() -> CapturedFrame {
        CapturedFrame {
            jpeg: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            width: 640,
            height: 480,
        }
    }

    fn prediction(label: &str) -> Prediction {
        Prediction {
            bbox: BoundingBox::new(10.0, 30.0, 40.0, 40.0),
            label: label.to_string(),
            confidence: 0.8,
        }
    }

    fn backend_error() -> DetectionClientError {
        DetectionClientError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "Model not loaded".into(),
        }
    }

    struct MockSource {
        frames: Mutex<VecDeque<Option<CapturedFrame>>>,
    }

    impl MockSource {
        fn warming_up_for(ticks: usize) -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(std::iter::repeat(None).take(ticks).collect()),
            })
        }
    }

    #[async_trait]
    impl FrameSource for MockSource {
        fn is_ready(&self) -> bool {
            true
        }

        async fn capture(&self) -> Result<Option<CapturedFrame>, CameraError> {
            Ok(self.frames.lock().pop_front().unwrap_or_else(|| Some(frame())))
        }
    }

    /// Plays back scripted results, then stops the loop once the script runs out.
    struct ScriptedDetector {
        results: Mutex<VecDeque<Result<DetectionBatch, DetectionClientError>>>,
        calls: AtomicUsize,
        control: Mutex<Option<LoopControl>>,
    }

    impl ScriptedDetector {
        fn new(results: Vec<Result<DetectionBatch, DetectionClientError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
                control: Mutex::new(None),
            })
        }

        fn attach(&self, control: LoopControl) {
            *self.control.lock() = Some(control);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        async fn detect(&self, _frame: &CapturedFrame) -> Result<DetectionBatch, DetectionClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.results.lock().pop_front();
            match next {
                Some(result) => result,
                None => {
                    if let Some(control) = self.control.lock().as_ref() {
                        control.stop();
                    }
                    Ok(vec![prediction("person")])
                }
            }
        }
    }

    #[derive(Default)]
    struct PendingDetector {
        entered: Notify,
    }

    #[async_trait]
    impl Detector for PendingDetector {
        async fn detect(&self, _frame: &CapturedFrame) -> Result<DetectionBatch, DetectionClientError> {
            self.entered.notify_one();
            std::future::pending().await
        }
    }

    fn detection_loop<D: Detector>(
        source: Arc<MockSource>,
        detector: Arc<D>,
    ) -> (
        DetectionLoop<MockSource, D, DisplayList>,
        Arc<Mutex<RenderedFrame<DisplayList>>>,
    ) {
        let rendered = Arc::new(Mutex::new(RenderedFrame::new(DisplayList::new())));
        (DetectionLoop::new(source, detector, rendered.clone()), rendered)
    }

    #[tokio::test]
    async fn test_sustained_failures_stop_the_loop_once() {
        let detector = ScriptedDetector::new((0..6).map(|_| Err(backend_error())).collect());
        let (mut detection_loop, _) = detection_loop(MockSource::warming_up_for(0), detector.clone());
        let control = detection_loop.control();
        detector.attach(control.clone());

        let result = detection_loop.run(&mut YieldScheduler).await;

        match result {
            Err(DetectionLoopError::SustainedFailure { streak, .. }) => assert_eq!(streak, 6),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(detector.calls(), 6);
        assert!(!control.is_running());
        // The loop already performed the only stop.
        assert!(!control.stop());

        let snapshot = detection_loop.snapshot();
        assert!(!snapshot.running);
        assert!(snapshot
            .terminal_error
            .as_deref()
            .is_some_and(|e| e.contains("Model not loaded")));
    }

    #[tokio::test]
    async fn test_success_resets_the_streak() {
        let mut script: Vec<_> = (0..5).map(|_| Err(backend_error())).collect();
        script.push(Ok(vec![prediction("person")]));
        let detector = ScriptedDetector::new(script);
        let (mut detection_loop, _) = detection_loop(MockSource::warming_up_for(0), detector.clone());
        detector.attach(detection_loop.control());
        let snapshots = detection_loop.subscribe();

        detection_loop.run(&mut YieldScheduler).await.unwrap();

        // Five failures, one success, then the stopping call.
        assert_eq!(detector.calls(), 7);
        assert_eq!(detection_loop.state().consecutive_error_count, 0);
        assert_eq!(snapshots.borrow().terminal_error, None);
        assert_eq!(detection_loop.snapshot().frames_processed, 1);
    }

    #[tokio::test]
    async fn test_configurable_streak_threshold() {
        let detector = ScriptedDetector::new((0..3).map(|_| Err(backend_error())).collect());
        let (detection_loop, _) = detection_loop(MockSource::warming_up_for(0), detector.clone());
        let mut detection_loop = detection_loop.with_max_consecutive_errors(2);

        let result = detection_loop.run(&mut YieldScheduler).await;
        assert!(matches!(
            result,
            Err(DetectionLoopError::SustainedFailure { streak: 3, .. })
        ));
        assert_eq!(detector.calls(), 3);
    }

    #[tokio::test]
    async fn test_counters_are_replaced_and_overlay_redrawn() {
        let detector = ScriptedDetector::new(vec![
            Ok(vec![
                prediction("person"),
                prediction("person"),
                prediction("cell phone"),
            ]),
            Ok(vec![prediction("cell phone")]),
        ]);
        let (mut detection_loop, rendered) =
            detection_loop(MockSource::warming_up_for(0), detector.clone());
        detector.attach(detection_loop.control());

        detection_loop.run(&mut YieldScheduler).await.unwrap();

        // Accumulating would have left two people and two devices.
        assert_eq!(detection_loop.snapshot().frames_processed, 2);
        assert_eq!(
            detection_loop.counters(),
            DetectionCounters {
                person_count: 0,
                device_count: 1
            }
        );

        let rendered = rendered.lock();
        assert_eq!(rendered.overlay.dimensions(), (640, 480));
        let boxes = rendered
            .overlay
            .commands()
            .iter()
            .filter(|c| matches!(c, DrawCommand::StrokeRect { .. }))
            .count();
        assert_eq!(boxes, 1);
    }

    struct NumberedSource {
        next: AtomicUsize,
    }

    #[async_trait]
    impl FrameSource for NumberedSource {
        fn is_ready(&self) -> bool {
            true
        }

        async fn capture(&self) -> Result<Option<CapturedFrame>, CameraError> {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(CapturedFrame {
                jpeg: Bytes::from(vec![n as u8]),
                width: 320 * n as u32,
                height: 240,
            }))
        }
    }

    #[tokio::test]
    async fn test_overlay_is_kept_with_the_frame_it_was_drawn_for() {
        let source = Arc::new(NumberedSource {
            next: AtomicUsize::new(0),
        });
        let detector = ScriptedDetector::new(vec![
            Ok(vec![prediction("person")]),
            Ok(vec![prediction("person")]),
        ]);
        let rendered = Arc::new(Mutex::new(RenderedFrame::new(DisplayList::new())));
        let mut detection_loop = DetectionLoop::new(source, detector.clone(), rendered.clone());
        detector.attach(detection_loop.control());

        detection_loop.run(&mut YieldScheduler).await.unwrap();

        // The third frame was captured but its result arrived after stop.
        assert_eq!(detector.calls(), 3);
        let rendered = rendered.lock();
        let frame = rendered.frame.as_ref().unwrap();
        assert_eq!(&frame.jpeg[..], &[2]);
        assert_eq!(rendered.overlay.dimensions(), (frame.width, frame.height));
    }

    #[tokio::test]
    async fn test_unavailable_frames_are_not_errors() {
        let detector = ScriptedDetector::new(vec![Ok(vec![])]);
        let (mut detection_loop, _) = detection_loop(MockSource::warming_up_for(3), detector.clone());
        detector.attach(detection_loop.control());

        detection_loop.run(&mut YieldScheduler).await.unwrap();

        assert_eq!(detector.calls(), 2);
        assert_eq!(detection_loop.state().consecutive_error_count, 0);
        assert_eq!(detection_loop.snapshot().terminal_error, None);
    }

    #[tokio::test]
    async fn test_stop_aborts_in_flight_request() {
        let detector = Arc::new(PendingDetector::default());
        let (mut detection_loop, rendered) =
            detection_loop(MockSource::warming_up_for(0), detector.clone());
        let control = detection_loop.control();

        let runner = tokio::spawn(async move { detection_loop.run(&mut YieldScheduler).await });
        detector.entered.notified().await;

        assert!(control.stop());
        runner.await.unwrap().unwrap();
        let rendered = rendered.lock();
        assert!(rendered.overlay.commands().is_empty());
        assert!(rendered.frame.is_none());
    }

    #[tokio::test]
    async fn test_stopped_loop_does_no_work() {
        let detector = ScriptedDetector::new(vec![]);
        let (mut detection_loop, _) = detection_loop(MockSource::warming_up_for(0), detector.clone());
        detection_loop.control().stop();

        detection_loop.run(&mut YieldScheduler).await.unwrap();
        assert_eq!(detector.calls(), 0);
    }

    #[test]
    fn test_fps_from_frame_interval() {
        let mut state = LoopState::default();
        let start = Instant::now();

        state.record_frame(start);
        assert_eq!(state.fps, None);

        state.record_frame(start + Duration::from_millis(1000));
        assert_eq!(state.fps, Some(1));

        state.record_frame(start + Duration::from_millis(1040));
        assert_eq!(state.fps, Some(25));

        // Zero interval keeps the last value.
        state.record_frame(start + Duration::from_millis(1040));
        assert_eq!(state.fps, Some(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_clock_paces_ticks() {
        let mut clock = FrameClock::new(Duration::from_millis(16));
        let start = Instant::now();

        clock.next_tick().await;
        clock.next_tick().await;
        clock.next_tick().await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(32) && elapsed < Duration::from_millis(33));
    }
}
