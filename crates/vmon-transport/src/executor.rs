//! Command Stream Executor: runs one command against the device and streams
//! its output into a display region.
//!
//! Per run:
//! - output is written as deltas of the growing response, escaped by the region;
//! - an idle [`Watchdog`] aborts the request when no chunk arrives in time;
//! - explicit cancellation aborts the request the same way;
//! - the loading indicator, the watchdog and the region permit are released
//!   on every exit path.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

use vmon_core::{
    DeltaTracker, DisplayRegion, OutputMode, OutputWriter, RegionId, ResponseText, TimeoutPolicy,
};

use crate::error::CommandError;
use crate::runner::CommandRunner;

/// A display region shared between the presentation layer and runs.
pub type SharedRegion = Arc<Mutex<dyn DisplayRegion>>;

pub fn shared_region<R: DisplayRegion + 'static>(region: R) -> SharedRegion {
    Arc::new(Mutex::new(region))
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// Stand-in deadline for periods too long to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Idle timer owned by a run. Resolves once `period` passes without a reset.
/// Dropping it clears it.
#[derive(Debug)]
pub struct Watchdog {
    period: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl Watchdog {
    pub fn start(period: Duration) -> Self {
        Self {
            period,
            sleep: Box::pin(tokio::time::sleep(period)),
        }
    }

    pub fn reset(&mut self) {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.period)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.sleep.as_mut().reset(deadline);
    }
}

impl Future for Watchdog {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.get_mut().sleep.as_mut().poll(cx)
    }
}

// ---------------------------------------------------------------------------
// Region exclusivity
// ---------------------------------------------------------------------------

/// Regions that currently have a run writing to them.
#[derive(Debug, Clone, Default)]
pub struct ActiveRegions {
    inner: Arc<StdMutex<HashSet<RegionId>>>,
}

impl ActiveRegions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `region`, or `None` if another run holds it.
    pub fn try_acquire(&self, region: &RegionId) -> Option<RegionPermit> {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(region.clone()) {
            return None;
        }
        Some(RegionPermit {
            region: region.clone(),
            owner: Arc::clone(&self.inner),
        })
    }

    pub fn is_active(&self, region: &RegionId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(region)
    }
}

/// Exclusive claim on a region; released on drop.
#[derive(Debug)]
pub struct RegionPermit {
    region: RegionId,
    owner: Arc<StdMutex<HashSet<RegionId>>>,
}

impl Drop for RegionPermit {
    fn drop(&mut self) {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.region);
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub mode: OutputMode,
    /// Overrides the policy's timeout for this run.
    pub idle_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn replace() -> Self {
        Self::default()
    }

    pub fn append() -> Self {
        Self {
            mode: OutputMode::Append,
            idle_timeout: None,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Full response text.
    pub output: String,
    pub chunks: usize,
}

/// Cancellable handle to a spawned run.
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<RunOutcome, CommandError>>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RunOutcome, CommandError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(CommandError::Task(e.to_string())),
        }
    }
}

pub struct CommandStreamExecutor<R> {
    runner: Arc<R>,
    policy: Arc<TimeoutPolicy>,
    active: ActiveRegions,
}

impl<R> Clone for CommandStreamExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            policy: Arc::clone(&self.policy),
            active: self.active.clone(),
        }
    }
}

impl<R: CommandRunner> CommandStreamExecutor<R> {
    pub fn new(runner: R, policy: TimeoutPolicy) -> Self {
        Self {
            runner: Arc::new(runner),
            policy: Arc::new(policy),
            active: ActiveRegions::new(),
        }
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    pub fn active_regions(&self) -> &ActiveRegions {
        &self.active
    }

    /// Start a run in the background.
    pub fn execute(
        &self,
        command: impl Into<String>,
        region_id: RegionId,
        region: SharedRegion,
        options: RunOptions,
    ) -> RunHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.clone();
        let command = command.into();
        let join = tokio::spawn(async move {
            this.run(&command, &region_id, &region, options, token).await
        });
        RunHandle { cancel, join }
    }

    /// Run to completion in the caller's task.
    pub async fn run(
        &self,
        command: &str,
        region_id: &RegionId,
        region: &SharedRegion,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, CommandError> {
        let Some(permit) = self.active.try_acquire(region_id) else {
            tracing::debug!(command, region = %region_id, "region busy, run rejected");
            return Err(CommandError::RegionBusy(region_id.clone()));
        };

        let idle = options
            .idle_timeout
            .unwrap_or_else(|| self.policy.idle_timeout(command));
        let mut writer = OutputWriter::new(options.mode, command);

        {
            let mut r = region.lock().await;
            r.set_loading(true);
            r.scroll_to_end();
        }
        tracing::debug!(command, region = %region_id, idle_secs = idle.as_secs(), "command run started");

        let result = self
            .stream_output(command, region, &mut writer, idle, &cancel)
            .await;

        {
            let mut r = region.lock().await;
            if let Err(e) = &result {
                writer.write_error(&mut *r, &e.display_text());
            }
            r.set_loading(false);
        }
        drop(permit);

        match &result {
            Ok(outcome) => {
                tracing::debug!(command, region = %region_id, chunks = outcome.chunks, "command run finished")
            }
            Err(e) if e.is_timeout() => {
                tracing::warn!(command, region = %region_id, "command run stalled: {e}")
            }
            Err(e) => tracing::info!(command, region = %region_id, "command run failed: {e}"),
        }
        result
    }

    async fn stream_output(
        &self,
        command: &str,
        region: &SharedRegion,
        writer: &mut OutputWriter,
        idle: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, CommandError> {
        let mut watchdog = Watchdog::start(idle);

        let mut body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CommandError::Cancelled),
            () = &mut watchdog => return Err(CommandError::Timeout { idle }),
            opened = self.runner.open(command) => opened?,
        };

        let mut response = ResponseText::new();
        let mut tracker = DeltaTracker::new();
        let mut chunks = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CommandError::Cancelled),
                () = &mut watchdog => return Err(CommandError::Timeout { idle }),
                next = body.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(chunk) => chunk?,
            };
            watchdog.reset();
            chunks += 1;

            let delta = tracker.delta(response.push(&chunk));
            if !delta.is_empty() {
                let mut r = region.lock().await;
                writer.write_chunk(&mut *r, delta);
            }
        }

        let delta = tracker.delta(response.finish());
        if !delta.is_empty() {
            let mut r = region.lock().await;
            writer.write_chunk(&mut *r, delta);
        }

        Ok(RunOutcome {
            output: response.as_str().to_string(),
            chunks,
        })
    }
}
