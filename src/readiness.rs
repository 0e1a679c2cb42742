//! Backend readiness state machine.
//!
//! A single monitor task owns both the re-poll delay and the watchdog, and
//! every transition goes through [`ReadinessMachine`]. Each `start`/`retry`
//! opens a new epoch; health results and timer fires that belong to an older
//! epoch, or arrive after a terminal state, are dropped.

use crate::config::ReadinessConfig;
use crate::detection_client::DetectionClientError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};

const UNREACHABLE_CAUSE: &str =
    "Cannot connect to the backend. Please make sure the detection server is running.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum ReadinessState {
    Connecting,
    ModelLoading,
    Ready,
    Error(String),
}

impl ReadinessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadinessState::Ready | ReadinessState::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn check(&self) -> Result<HealthStatus, DetectionClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    PollAfterDelay,
    Halt,
}

#[derive(Debug)]
pub struct ReadinessMachine {
    state: ReadinessState,
    epoch: u64,
    forced: u32,
}

impl Default for ReadinessMachine {
    fn default() -> Self {
        Self {
            state: ReadinessState::Connecting,
            epoch: 0,
            forced: 0,
        }
    }
}

impl ReadinessMachine {
    pub fn state(&self) -> &ReadinessState {
        &self.state
    }

    /// Forced transitions since the last `begin`.
    pub fn forced_transitions(&self) -> u32 {
        self.forced
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && !self.state.is_terminal()
    }

    /// Resets to `Connecting` and returns the epoch of the new polling run.
    pub fn begin(&mut self) -> u64 {
        self.epoch += 1;
        self.state = ReadinessState::Connecting;
        self.forced = 0;
        self.epoch
    }

    /// Invalidates any running poll without touching the state.
    pub fn halt(&mut self) {
        self.epoch += 1;
    }

    pub fn apply_health(
        &mut self,
        epoch: u64,
        result: Result<HealthStatus, DetectionClientError>,
    ) -> Next {
        if !self.is_current(epoch) {
            return Next::Halt;
        }

        match result {
            Ok(HealthStatus {
                model_loaded: true, ..
            }) => {
                self.state = ReadinessState::Ready;
                Next::Halt
            }
            Ok(_) => {
                self.state = ReadinessState::ModelLoading;
                Next::PollAfterDelay
            }
            Err(err) => {
                self.state = ReadinessState::Error(error_cause(&err));
                Next::Halt
            }
        }
    }

    /// Returns `false` when already `Ready`.
    pub fn force_ready(&mut self) -> bool {
        if self.state == ReadinessState::Ready {
            return false;
        }
        self.state = ReadinessState::Ready;
        self.epoch += 1;
        self.forced += 1;
        true
    }

    pub fn watchdog_fired(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.force_ready()
    }
}

fn error_cause(err: &DetectionClientError) -> String {
    match err {
        DetectionClientError::Transport(_) => UNREACHABLE_CAUSE.to_string(),
        DetectionClientError::Status { status, .. } => format!(
            "Backend service returned an error (status {}). Please check the detection server logs.",
            status.as_u16()
        ),
        DetectionClientError::MalformedBody(e) => {
            format!("Backend health response could not be understood: {}", e)
        }
    }
}

struct Shared {
    machine: Mutex<ReadinessMachine>,
    state_tx: watch::Sender<ReadinessState>,
}

impl Shared {
    fn update<R>(&self, f: impl FnOnce(&mut ReadinessMachine) -> R) -> R {
        let mut machine = self.machine.lock();
        let before = machine.state().clone();
        let result = f(&mut *machine);
        if *machine.state() != before {
            tracing::info!("Backend readiness: {:?} -> {:?}", before, machine.state());
            self.state_tx.send_replace(machine.state().clone());
        }
        result
    }
}

pub struct ReadinessMonitor<P: HealthProbe + ?Sized> {
    probe: Arc<P>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    poll_delay: Duration,
    watchdog: Duration,
}

impl<P: HealthProbe + ?Sized> ReadinessMonitor<P> {
    pub fn new(probe: Arc<P>, config: &ReadinessConfig) -> Self {
        let (state_tx, _) = watch::channel(ReadinessState::Connecting);
        Self {
            probe,
            shared: Arc::new(Shared {
                machine: Mutex::new(ReadinessMachine::default()),
                state_tx,
            }),
            task: Mutex::new(None),
            poll_delay: config.get_poll_delay(),
            watchdog: config.get_watchdog(),
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.shared.machine.lock().state().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.shared.state_tx.subscribe()
    }

    pub fn forced_transitions(&self) -> u32 {
        self.shared.machine.lock().forced_transitions()
    }

    pub fn start(&self) {
        self.cancel_task();
        let watchdog_deadline = Instant::now() + self.watchdog;
        let epoch = self.shared.update(ReadinessMachine::begin);
        tracing::info!("Checking backend status...");

        let handle = tokio::spawn(poll_backend(
            self.probe.clone(),
            self.shared.clone(),
            epoch,
            self.poll_delay,
            watchdog_deadline,
        ));
        *self.task.lock() = Some(handle);
    }

    pub fn retry(&self) {
        tracing::info!("Retrying backend connection");
        self.start();
    }

    pub fn force_ready(&self) -> bool {
        let forced = self.shared.update(ReadinessMachine::force_ready);
        if forced {
            tracing::warn!("Forcing detection start without backend confirmation");
            self.cancel_task();
        }
        forced
    }

    /// Halts polling. The last observed state is kept as-is, so a stop during
    /// `ModelLoading` leaves it there with [`is_polling`](Self::is_polling)
    /// reporting `false` until the next `start`/`retry`.
    pub fn stop(&self) {
        self.shared.update(ReadinessMachine::halt);
        self.cancel_task();
    }

    pub fn is_polling(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn cancel_task(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl<P: HealthProbe + ?Sized> Drop for ReadinessMonitor<P> {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

async fn poll_backend<P: HealthProbe + ?Sized>(
    probe: Arc<P>,
    shared: Arc<Shared>,
    epoch: u64,
    poll_delay: Duration,
    watchdog_deadline: Instant,
) {
    let watchdog_timer = sleep_until(watchdog_deadline);
    tokio::pin!(watchdog_timer);

    loop {
        let result = tokio::select! {
            biased;
            _ = &mut watchdog_timer => {
                fire_watchdog(&shared, epoch);
                return;
            }
            result = probe.check() => result,
        };

        if let Err(ref err) = result {
            tracing::error!("Backend health check failed ({}): {}", err.kind(), err);
        }
        match shared.update(|m| m.apply_health(epoch, result)) {
            Next::Halt => return,
            Next::PollAfterDelay => {
                tracing::debug!("Model still loading, polling again in {:?}", poll_delay)
            }
        }

        tokio::select! {
            biased;
            _ = &mut watchdog_timer => {
                fire_watchdog(&shared, epoch);
                return;
            }
            _ = sleep(poll_delay) => {}
        }
    }
}

fn fire_watchdog(shared: &Shared, epoch: u64) {
    if shared.update(|m| m.watchdog_fired(epoch)) {
        tracing::warn!("Loading timeout reached, forcing start");
    }
}
