use crate::camera::FrameSource;
use crate::config::{DetectionConfig, ReadinessConfig};
use crate::detection_client::Backend;
use crate::detection_loop::{DetectionLoop, FrameClock, LoopControl, LoopSnapshot, RenderedFrame};
use crate::overlay::DisplayList;
use crate::readiness::{ReadinessMonitor, ReadinessState};
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

type SessionLoop = DetectionLoop<dyn FrameSource, dyn Backend, DisplayList>;

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub readiness: ReadinessState,
    pub backend_polling: bool,
    pub detecting: bool,
    pub camera_ready: bool,
    pub forced_start: bool,
    pub detection: LoopSnapshot,
    pub error: Option<String>,
}

struct Runner {
    control: LoopControl,
    snapshot_rx: watch::Receiver<LoopSnapshot>,
    handle: JoinHandle<()>,
}

impl Runner {
    fn is_active(&self) -> bool {
        self.control.is_running() && !self.handle.is_finished()
    }
}

/// Wires start/stop intent to the readiness monitor and the detection loop.
pub struct Session {
    source: Arc<dyn FrameSource>,
    backend: Arc<dyn Backend>,
    monitor: ReadinessMonitor<dyn Backend>,
    rendered: Arc<Mutex<RenderedFrame<DisplayList>>>,
    max_consecutive_errors: u32,
    tick_interval: Duration,
    metrics: Option<Arc<Metrics>>,
    runner: Mutex<Option<Runner>>,
}

impl Session {
    pub fn new(
        source: Arc<dyn FrameSource>,
        backend: Arc<dyn Backend>,
        readiness: &ReadinessConfig,
        detection: &DetectionConfig,
    ) -> Self {
        Self {
            source,
            monitor: ReadinessMonitor::new(backend.clone(), readiness),
            backend,
            rendered: Arc::new(Mutex::new(RenderedFrame::new(DisplayList::new()))),
            max_consecutive_errors: detection.max_consecutive_errors,
            tick_interval: detection.get_tick_interval(),
            metrics: None,
            runner: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns `false` if a session is already running. A backend in `Error`
    /// is health-checked again even when a loop is armed.
    pub fn start(&self) -> bool {
        let backend_failed = matches!(self.monitor.state(), ReadinessState::Error(_));
        if self.is_active() && !backend_failed {
            tracing::debug!("Session already running");
            return false;
        }
        tracing::info!("Starting detection session");
        self.monitor.start();
        self.ensure_runner();
        true
    }

    /// Returns `true` if a running detection loop was stopped. Readiness
    /// keeps its last state; see [`ReadinessMonitor::stop`].
    pub fn stop(&self) -> bool {
        let stopped = self.stop_runner();
        self.monitor.stop();
        tracing::info!("Detection session stopped");
        stopped
    }

    /// Reconnects to the backend. Any running loop is stopped first, so
    /// detection resumes with a clean error streak only once the backend is
    /// `Ready` again.
    pub fn retry_backend(&self) {
        if self.stop_runner() {
            tracing::info!("Detection paused until the backend is ready again");
        }
        self.monitor.retry();
        self.ensure_runner();
    }

    /// Returns `false` and changes nothing when the backend was already
    /// `Ready`.
    pub fn force_start(&self) -> bool {
        let forced = self.monitor.force_ready();
        if forced {
            self.ensure_runner();
        }
        forced
    }

    pub fn overlay(&self) -> DisplayList {
        self.rendered.lock().overlay.clone()
    }

    pub fn rendered_frame(&self) -> RenderedFrame<DisplayList> {
        self.rendered.lock().clone()
    }

    pub fn status(&self) -> SessionStatus {
        let readiness = self.monitor.state();
        let runner = self.runner.lock();
        let (active, detection) = match runner.as_ref() {
            Some(runner) => {
                let mut detection = runner.snapshot_rx.borrow().clone();
                // A loop stopped before it ever ticked never published.
                detection.running &= runner.control.is_running();
                (runner.is_active(), detection)
            }
            None => (false, LoopSnapshot::default()),
        };

        let error = match &readiness {
            ReadinessState::Error(cause) => Some(cause.clone()),
            _ => detection.terminal_error.clone(),
        };

        SessionStatus {
            detecting: active && readiness == ReadinessState::Ready,
            readiness,
            backend_polling: self.monitor.is_polling(),
            camera_ready: self.source.is_ready(),
            forced_start: self.monitor.forced_transitions() > 0,
            detection,
            error,
        }
    }

    pub fn is_active(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .map(Runner::is_active)
            .unwrap_or(false)
    }

    fn stop_runner(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .is_some_and(|runner| runner.control.stop())
    }

    fn ensure_runner(&self) {
        let mut runner = self.runner.lock();
        if runner.as_ref().is_some_and(Runner::is_active) {
            return;
        }

        let mut detection_loop: SessionLoop =
            DetectionLoop::new(self.source.clone(), self.backend.clone(), self.rendered.clone())
                .with_max_consecutive_errors(self.max_consecutive_errors);
        if let Some(metrics) = &self.metrics {
            detection_loop = detection_loop.with_metrics(metrics.clone());
        }

        let control = detection_loop.control();
        let snapshot_rx = detection_loop.subscribe();
        let handle = tokio::spawn(drive(
            detection_loop,
            control.clone(),
            self.monitor.subscribe(),
            self.tick_interval,
        ));

        *runner = Some(Runner {
            control,
            snapshot_rx,
            handle,
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.lock().take() {
            runner.control.stop();
            runner.handle.abort();
        }
    }
}

async fn drive(
    mut detection_loop: SessionLoop,
    control: LoopControl,
    mut readiness: watch::Receiver<ReadinessState>,
    tick_interval: Duration,
) {
    tokio::select! {
        ready = readiness.wait_for(|state| *state == ReadinessState::Ready) => {
            if ready.is_err() {
                return;
            }
        }
        _ = control.stopped() => return,
    }

    let mut clock = FrameClock::new(tick_interval);
    if let Err(err) = detection_loop.run(&mut clock).await {
        tracing::error!("Detection session ended: {}", err);
    }
}
