//! Execution dispatcher: runs one action against its resolved machines

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spooky_exec::{CommandChannel, ExecError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::ChannelOpener;
use crate::config::{Action, ActionTask, Machine};
use crate::error::CoreError;
use crate::event::DispatchEvent;
use crate::outcome::{ActionResult, Outcome};
use crate::pool::{WorkerOutcome, WorkerPool};

/// Tunables for a dispatcher, fixed for its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Timeout for actions that do not set one
    pub default_timeout: Duration,
    /// Bound on opening a channel, separate from the command timeout
    pub connect_timeout: Duration,
    /// Parallel worker bound, 0 for one worker per machine
    pub max_workers: usize,
    /// Extra attempts when opening a channel fails with a retryable error
    pub retries: u32,
    /// Pause between open attempts
    pub retry_delay: Duration,
    /// Event channel capacity
    pub event_channel_capacity: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_workers: 0,
            retries: 0,
            retry_delay: Duration::from_secs(1),
            event_channel_capacity: 1024,
        }
    }
}

/// Owned copy of what an action runs, movable into worker tasks
#[derive(Debug, Clone)]
enum Job {
    Command(String),
    Script(PathBuf),
}

impl From<ActionTask<'_>> for Job {
    fn from(task: ActionTask<'_>) -> Self {
        match task {
            ActionTask::Command(cmd) => Job::Command(cmd.to_string()),
            ActionTask::Script(path) => Job::Script(path.to_path_buf()),
        }
    }
}

impl Job {
    async fn run(&self, channel: &dyn CommandChannel) -> Result<String, ExecError> {
        match self {
            Job::Command(cmd) => channel.run(cmd).await,
            Job::Script(path) => channel.run_script(path).await,
        }
    }
}

/// Runs actions over command channels
///
/// Sequential actions stop at the first failing machine. Parallel actions
/// wait for every machine and record each outcome.
#[derive(Clone)]
pub struct Dispatcher {
    opener: Arc<dyn ChannelOpener>,
    options: DispatchOptions,
    event_tx: broadcast::Sender<DispatchEvent>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("options", &self.options)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher using `opener` for every machine
    pub fn new(opener: Arc<dyn ChannelOpener>, options: DispatchOptions) -> Self {
        let (event_tx, _) = broadcast::channel(options.event_channel_capacity.max(1));
        Self {
            opener,
            options,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon in-flight work when `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Get a receiver for progress events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_tx.subscribe()
    }

    /// Options in effect
    #[must_use]
    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Token that cancels this dispatcher's work
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `action` on `machines`, in the order given
    ///
    /// Per-machine failures never surface as `Err`; they are recorded in
    /// the returned outcomes.
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` if the action has neither or both of
    /// command and script.
    #[instrument(skip(self, action, machines), fields(action = %action.name, targets = machines.len()))]
    pub async fn execute(
        &self,
        action: &Action,
        machines: &[&Machine],
    ) -> Result<ActionResult, CoreError> {
        let job = Job::from(action.task()?);
        let timeout = action.timeout_or(self.options.default_timeout);

        info!(parallel = action.parallel, ?timeout, "executing action");
        let _ = self.event_tx.send(DispatchEvent::ActionStarted {
            action: action.name.clone(),
            targets: machines.len(),
            parallel: action.parallel,
        });

        let outcomes = if action.parallel {
            self.execute_parallel(&action.name, &job, timeout, machines)
                .await
        } else {
            self.execute_sequential(&action.name, &job, timeout, machines)
                .await
        };

        let result = ActionResult::from_outcomes(action.name.clone(), outcomes);
        let failed = result.failures().count();

        if result.success {
            info!(machines = result.outcomes.len(), "action succeeded");
        } else {
            warn!(machines = result.outcomes.len(), failed, "action failed");
        }
        let _ = self.event_tx.send(DispatchEvent::ActionFinished {
            action: action.name.clone(),
            succeeded: result.outcomes.len() - failed,
            failed,
        });

        Ok(result)
    }

    async fn execute_sequential(
        &self,
        action: &str,
        job: &Job,
        timeout: Duration,
        machines: &[&Machine],
    ) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(machines.len());

        for machine in machines {
            if self.cancel.is_cancelled() {
                warn!(machine = %machine.name, "cancelled, skipping remaining machines");
                outcomes.push(Outcome::failed(&machine.name, ExecError::Cancelled, Duration::ZERO));
                break;
            }

            let outcome = self
                .run_on_machine(action, machine, job, timeout, &self.cancel)
                .await;
            let failed = !outcome.success;
            outcomes.push(outcome);

            if failed {
                debug!(machine = %machine.name, "stopping after first failure");
                break;
            }
        }

        outcomes
    }

    async fn execute_parallel(
        &self,
        action: &str,
        job: &Job,
        timeout: Duration,
        machines: &[&Machine],
    ) -> Vec<Outcome> {
        let pool = WorkerPool::new(self.options.max_workers).with_cancellation(self.cancel.clone());
        let owned: Vec<Machine> = machines.iter().map(|m| (*m).clone()).collect();
        let names: Vec<String> = owned.iter().map(|m| m.name.clone()).collect();

        let results = pool
            .run(owned, |machine, token| {
                let this = self.clone();
                let action = action.to_string();
                let job = job.clone();
                async move {
                    this.run_on_machine(&action, &machine, &job, timeout, &token)
                        .await
                }
            })
            .await;

        let mut outcomes: Vec<Outcome> = results
            .into_iter()
            .zip(names)
            .map(|(result, name)| match result {
                WorkerOutcome::Completed(outcome) => outcome,
                WorkerOutcome::Cancelled => {
                    Outcome::failed(name, ExecError::Cancelled, Duration::ZERO)
                }
                WorkerOutcome::Panicked(msg) => Outcome::failed(
                    name,
                    ExecError::IoError(format!("worker panicked: {msg}")),
                    Duration::ZERO,
                ),
            })
            .collect();

        outcomes.sort_by(|a, b| a.machine.cmp(&b.machine));
        outcomes
    }

    async fn run_on_machine(
        &self,
        action: &str,
        machine: &Machine,
        job: &Job,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Outcome {
        let start = Instant::now();
        let _ = self.event_tx.send(DispatchEvent::MachineStarted {
            action: action.to_string(),
            machine: machine.name.clone(),
        });

        let result = match self.open(machine, cancel).await {
            Ok(channel) => {
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ExecError::Cancelled),
                    res = tokio::time::timeout(timeout, job.run(channel.as_ref())) => {
                        res.unwrap_or(Err(ExecError::Timeout { timeout }))
                    }
                };

                if let Err(e) = channel.close().await {
                    warn!(machine = %machine.name, error = %e, "failed to close channel");
                }
                result
            }
            Err(e) => Err(e),
        };

        let duration = start.elapsed();
        let outcome = match result {
            Ok(output) => {
                info!(machine = %machine.name, ?duration, "machine succeeded");
                Outcome::ok(&machine.name, output, duration)
            }
            Err(e) => {
                error!(machine = %machine.name, error = %e, kind = e.kind(), ?duration, "machine failed");
                Outcome::failed(&machine.name, e, duration)
            }
        };

        let _ = self.event_tx.send(DispatchEvent::MachineFinished {
            action: action.to_string(),
            machine: machine.name.clone(),
            success: outcome.success,
            duration,
        });

        outcome
    }

    /// Opener call bounded by `connect_timeout`, whatever the opener does
    async fn bounded_open(&self, machine: &Machine) -> Result<Arc<dyn CommandChannel>, ExecError> {
        let limit = self.options.connect_timeout;
        match tokio::time::timeout(limit, self.opener.open(machine, limit)).await {
            Ok(res) => res,
            Err(_) => Err(ExecError::ConnectionFailed(format!(
                "open timed out after {limit:?}"
            ))),
        }
    }

    async fn open(
        &self,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn CommandChannel>, ExecError> {
        let mut attempt = 0;
        loop {
            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ExecError::Cancelled),
                res = self.bounded_open(machine) => res,
            };

            match opened {
                Ok(channel) => {
                    debug!(machine = %machine.name, channel = channel.channel_type(), "channel open");
                    return Ok(channel);
                }
                Err(e) if e.is_retryable() && attempt < self.options.retries => {
                    attempt += 1;
                    warn!(
                        machine = %machine.name,
                        error = %e,
                        attempt,
                        retries = self.options.retries,
                        "open failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(ExecError::Cancelled),
                        () = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
