//! Client-side loop that drives a sweep one batch per interval.
//!
//! The local loop is guarded by a [`CancellationToken`]. `pause` and `stop`
//! cancel it before talking to the server, and every batch response is
//! checked against the token once it resolves, so an acknowledgement that
//! lands after a stop is dropped instead of re-arming the timer.
use crate::error::SweepError;
use crate::model::{SweepKind, SweepOptions, SweepStatus};
use crate::service::{SweepApi, SweepResponse};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retries after a transient failure, doubling the delay each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    BatchApplied(SweepResponse),
    Completed(SweepResponse),
    /// The server reports the sweep is no longer running (paused or stopped
    /// elsewhere); the local loop ended.
    Halted(SweepResponse),
    /// A response arrived after the loop was cancelled and was ignored.
    Discarded,
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Retries exhausted or a permanent error. The server sweep is untouched.
    Failed { error: String },
}

#[derive(Default)]
struct LoopSlot {
    token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct LoopContext {
    api: Arc<dyn SweepApi>,
    kind: SweepKind,
    interval: Duration,
    retry: RetryPolicy,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    in_flight: Arc<tokio::sync::Mutex<()>>,
}

impl LoopContext {
    fn emit(&self, event: OrchestratorEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

pub struct ClientOrchestrator {
    ctx: LoopContext,
    slot: Mutex<LoopSlot>,
}

impl ClientOrchestrator {
    pub fn new(
        api: Arc<dyn SweepApi>,
        kind: SweepKind,
        interval: Duration,
        retry: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            ctx: LoopContext {
                api,
                kind,
                interval,
                retry,
                events,
                in_flight: Arc::new(tokio::sync::Mutex::new(())),
            },
            slot: Mutex::new(LoopSlot::default()),
        };
        (orchestrator, rx)
    }

    pub fn kind(&self) -> SweepKind {
        self.ctx.kind
    }

    /// Whether the local loop is issuing batch calls.
    pub fn is_running(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.token.as_ref().map_or(false, |t| !t.is_cancelled()))
            .unwrap_or(false)
    }

    /// Start a sweep on the server, then drive it locally.
    pub async fn start(&self, options: Option<SweepOptions>) -> Result<SweepResponse, SweepError> {
        let response = self.ctx.api.start(self.ctx.kind, options).await?;
        info!(kind = %self.ctx.kind, total = response.state.total, "sweep started; driving batches");
        self.spawn_loop();
        Ok(response)
    }

    /// Resume a paused sweep, or re-attach to one that is already running.
    pub async fn resume(&self) -> Result<SweepResponse, SweepError> {
        let status = self.ctx.api.status(self.ctx.kind).await?;
        let response = match status.state.status {
            SweepStatus::Running => status,
            SweepStatus::Paused => self.ctx.api.resume(self.ctx.kind).await?,
            _ => return Err(SweepError::NotPaused(self.ctx.kind)),
        };
        self.spawn_loop();
        Ok(response)
    }

    /// Stop issuing calls, then ask the server to pause. If the server
    /// refuses, the local loop is restored.
    pub async fn pause(&self) -> Result<SweepResponse, SweepError> {
        let was_running = self.cancel_loop();
        match self.ctx.api.pause(self.ctx.kind).await {
            Ok(response) => {
                info!(kind = %self.ctx.kind, "sweep paused");
                Ok(response)
            }
            Err(err) => {
                warn!(kind = %self.ctx.kind, %err, "server pause failed");
                if was_running {
                    self.spawn_loop();
                }
                Err(err)
            }
        }
    }

    /// The local flag clears before the server is asked, so any batch still
    /// in flight is discarded when it returns.
    pub async fn stop(&self) -> Result<SweepResponse, SweepError> {
        self.cancel_loop();
        let response = self.ctx.api.stop(self.ctx.kind).await?;
        info!(kind = %self.ctx.kind, "sweep stopped");
        Ok(response)
    }

    /// Wait for the current loop task to exit.
    pub async fn wait(&self) {
        let task = self.slot.lock().ok().and_then(|mut slot| slot.task.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "orchestrator loop panicked");
            }
        }
    }

    fn spawn_loop(&self) {
        let Ok(mut slot) = self.slot.lock() else {
            return;
        };
        if slot.token.as_ref().map_or(false, |t| !t.is_cancelled()) {
            debug!(kind = %self.ctx.kind, "loop already running");
            return;
        }
        let token = CancellationToken::new();
        let ctx = self.ctx.clone();
        slot.task = Some(tokio::spawn(run_loop(ctx, token.clone())));
        slot.token = Some(token);
    }

    /// Returns whether a live loop was cancelled.
    fn cancel_loop(&self) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        match slot.token.take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

impl Drop for ClientOrchestrator {
    fn drop(&mut self) {
        self.cancel_loop();
    }
}

async fn run_loop(ctx: LoopContext, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            break;
        }
        let outcome = call_with_retry(&ctx, &token).await;
        if token.is_cancelled() {
            debug!(kind = %ctx.kind, "response after cancellation discarded");
            ctx.emit(OrchestratorEvent::Discarded);
            break;
        }
        match outcome {
            Ok(response) if response.complete => {
                info!(kind = %ctx.kind, processed = response.state.processed, "sweep complete");
                ctx.emit(OrchestratorEvent::Completed(response));
                break;
            }
            Ok(response) if response.state.status != SweepStatus::Running => {
                info!(kind = %ctx.kind, status = response.state.status.as_str(), "sweep no longer running");
                ctx.emit(OrchestratorEvent::Halted(response));
                break;
            }
            Ok(response) => ctx.emit(OrchestratorEvent::BatchApplied(response)),
            Err(err) => {
                warn!(kind = %ctx.kind, %err, "batch call failed; local loop ends");
                ctx.emit(OrchestratorEvent::Failed {
                    error: err.to_string(),
                });
                break;
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(ctx.interval) => {}
        }
    }
    token.cancel();
}

async fn call_with_retry(
    ctx: &LoopContext,
    token: &CancellationToken,
) -> Result<SweepResponse, SweepError> {
    let mut attempt = 0;
    loop {
        let result = {
            let _guard = ctx.in_flight.lock().await;
            ctx.api.process_batch(ctx.kind).await
        };
        let err = match result {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        if !err.is_transient() || attempt >= ctx.retry.max_retries || token.is_cancelled() {
            return Err(err);
        }
        attempt += 1;
        let delay = ctx.retry.delay_for(attempt);
        warn!(kind = %ctx.kind, attempt, ?delay, %err, "transient failure; retrying");
        ctx.emit(OrchestratorEvent::RetryScheduled {
            attempt,
            delay,
            error: err.to_string(),
        });
        tokio::select! {
            _ = token.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
