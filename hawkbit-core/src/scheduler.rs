//! Polling scheduler: the update cycle as a host-driven state machine.
//!
//! The host feeds events (timer fired, poll reply, deployment fetched, download result,
//! installer notifications) and executes the returned [`Command`]s in order. The scheduler
//! never performs I/O and owns the single-cycle invariant: at most one of Polling,
//! Downloading or Installing is active, and a forced check that arrives meanwhile is
//! coalesced into one follow-up cycle.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::feedback::FeedbackMessage;
use crate::resolver::{Artifact, Cancel, Deployment, PollAction, PollReply};

/// Poll interval when the server does not suggest one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default wait after a retryable failure.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(5 * 60);

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Timer armed for the next poll.
    Idle,
    /// Poll (and deployment/cancel fetch) in flight.
    Polling,
    Downloading,
    Installing,
    /// Reboot requested; terminal for the process.
    AwaitingReboot,
    /// Waiting `retry_wait` after a retryable failure.
    BackoffWait,
}

impl CycleState {
    /// True while a cycle owns the device.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CycleState::Polling | CycleState::Downloading | CycleState::Installing
        )
    }
}

/// How a failed step affects the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Network or server trouble: back off, then poll again.
    Retryable,
    /// 401/403: backed off like `Retryable`, counted against the auth failure limit.
    Auth,
    /// Unparseable reply: skip this cycle, keep the current schedule.
    Skip,
    /// This deployment cannot succeed (bad digest, size, no space): report and go idle.
    Rejected,
    /// The process cannot continue.
    Fatal,
}

/// A failed step with the detail that goes into logs and feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub failure: Failure,
    pub detail: String,
}

impl CycleError {
    pub fn new(failure: Failure, detail: impl Into<String>) -> Self {
        Self {
            failure,
            detail: detail.into(),
        }
    }
}

/// Why the scheduler asks the host to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Run-once mode finished its cycle.
    RunOnceComplete,
    Fatal(String),
}

/// Work for the host, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// GET the controller resource and report via [`Scheduler::on_poll_reply`].
    Poll,
    /// PUT the device attributes. Failures are logged only.
    Identify,
    /// GET the deployment base and report via [`Scheduler::on_deployment`].
    FetchDeployment { url: String },
    /// GET the cancel action and report via [`Scheduler::on_cancel`].
    FetchCancel { url: String },
    /// Download and verify, then report via [`Scheduler::on_download`].
    Download(Artifact),
    /// POST feedback. Failures are logged only.
    SendFeedback {
        url: String,
        message: FeedbackMessage,
    },
    /// Hand the verified bundle to the installer.
    Install { bundle: PathBuf },
    /// (Re)arm the poll timer; call [`Scheduler::on_timer`] when it fires.
    Arm(Duration),
    /// Sync and reboot.
    Reboot,
    Exit(ExitReason),
}

/// Static scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_interval: Duration,
    pub retry_wait: Duration,
    pub run_once: bool,
    /// Consecutive auth failures before giving up; 0 retries forever.
    pub auth_failure_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_POLL_INTERVAL,
            retry_wait: DEFAULT_RETRY_WAIT,
            run_once: false,
            auth_failure_limit: 0,
        }
    }
}

/// Process control flags. Mutated only through scheduler request methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    force_check: bool,
    run_once: bool,
}

impl ControlState {
    pub fn force_check_pending(&self) -> bool {
        self.force_check
    }

    pub fn run_once(&self) -> bool {
        self.run_once
    }
}

/// Deployment currently being downloaded or installed.
struct ActiveDeployment {
    action_id: String,
    feedback_url: String,
    artifact_name: String,
}

/// The update cycle state machine. Host passes events; scheduler returns commands.
pub struct Scheduler {
    config: SchedulerConfig,
    state: CycleState,
    control: ControlState,
    interval: Duration,
    active: Option<ActiveDeployment>,
    auth_failures: u32,
    cycles: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let control = ControlState {
            force_check: false,
            run_once: config.run_once,
        };
        Self {
            interval: config.default_interval,
            config,
            state: CycleState::Idle,
            control,
            active: None,
            auth_failures: 0,
            cycles: 0,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn control(&self) -> ControlState {
        self.control
    }

    /// Interval used when re-arming from Idle.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Startup: identify once, then poll immediately.
    pub fn start(&mut self) -> Vec<Command> {
        let mut out = vec![Command::Identify];
        if self.state == CycleState::Idle {
            out.extend(self.begin_cycle());
        }
        out
    }

    /// Request an immediate check. Starts a cycle when none is active, otherwise coalesces
    /// into a single follow-up cycle once the current one ends.
    pub fn request_force_check(&mut self) -> Vec<Command> {
        match self.state {
            CycleState::Idle | CycleState::BackoffWait => self.begin_cycle(),
            CycleState::AwaitingReboot => vec![],
            _ => {
                debug!(state = ?self.state, "forced check coalesced into running cycle");
                self.control.force_check = true;
                vec![]
            }
        }
    }

    /// Switch run-once mode on: the process exits after the current or next cycle.
    pub fn request_run_once(&mut self) {
        self.control.run_once = true;
    }

    /// Poll timer fired. Stale timers during an active cycle are ignored.
    pub fn on_timer(&mut self) -> Vec<Command> {
        match self.state {
            CycleState::Idle | CycleState::BackoffWait => self.begin_cycle(),
            _ => vec![],
        }
    }

    pub fn on_poll_reply(&mut self, reply: Result<PollReply, CycleError>) -> Vec<Command> {
        if self.state != CycleState::Polling {
            warn!(state = ?self.state, "unexpected poll reply ignored");
            return vec![];
        }
        let reply = match reply {
            Ok(r) => r,
            Err(e) => return self.fail(e),
        };
        self.auth_failures = 0;
        self.interval = reply.sleep.unwrap_or(self.config.default_interval);
        let mut out = Vec::new();
        if reply.config_data_requested {
            out.push(Command::Identify);
        }
        match reply.action {
            PollAction::NoAction => {
                debug!(interval = ?self.interval, "no action pending");
                self.finish_cycle(out)
            }
            PollAction::DeploymentBase { href } => {
                out.push(Command::FetchDeployment { url: href });
                out
            }
            PollAction::CancelAction { href } => {
                out.push(Command::FetchCancel { url: href });
                out
            }
        }
    }

    pub fn on_deployment(&mut self, deployment: Result<Deployment, CycleError>) -> Vec<Command> {
        if self.state != CycleState::Polling {
            warn!(state = ?self.state, "unexpected deployment ignored");
            return vec![];
        }
        let d = match deployment {
            Ok(d) => d,
            Err(e) => return self.fail(e),
        };
        info!(
            action_id = %d.action_id,
            artifact = %d.artifact.name,
            version = %d.artifact.version,
            size = d.artifact.size,
            "new deployment"
        );
        self.state = CycleState::Downloading;
        let detail = format!(
            "Downloading {} {} ({} bytes)",
            d.artifact.name, d.artifact.version, d.artifact.size
        );
        self.active = Some(ActiveDeployment {
            action_id: d.action_id.clone(),
            feedback_url: d.feedback_url.clone(),
            artifact_name: d.artifact.name.clone(),
        });
        vec![
            Command::SendFeedback {
                url: d.feedback_url,
                message: FeedbackMessage::proceeding(&d.action_id, detail),
            },
            Command::Download(d.artifact),
        ]
    }

    pub fn on_cancel(&mut self, cancel: Result<Cancel, CycleError>) -> Vec<Command> {
        if self.state != CycleState::Polling {
            warn!(state = ?self.state, "unexpected cancel ignored");
            return vec![];
        }
        let c = match cancel {
            Ok(c) => c,
            Err(e) => return self.fail(e),
        };
        info!(action_id = %c.action_id, stop_id = %c.stop_id, "action cancelled by server");
        let out = vec![Command::SendFeedback {
            message: FeedbackMessage::success(&c.action_id, "Action cancelled"),
            url: c.feedback_url,
        }];
        self.finish_cycle(out)
    }

    pub fn on_download(&mut self, result: Result<PathBuf, CycleError>) -> Vec<Command> {
        if self.state != CycleState::Downloading {
            warn!(state = ?self.state, "unexpected download result ignored");
            return vec![];
        }
        let Some(active) = self.active.as_ref() else {
            return self.finish_cycle(vec![]);
        };
        match result {
            Ok(bundle) => {
                self.state = CycleState::Installing;
                vec![
                    Command::SendFeedback {
                        url: active.feedback_url.clone(),
                        message: FeedbackMessage::proceeding(
                            &active.action_id,
                            "Download complete, checksum verified",
                        ),
                    },
                    Command::Install { bundle },
                ]
            }
            Err(e) => {
                warn!(
                    action_id = %active.action_id,
                    artifact = %active.artifact_name,
                    failure = ?e.failure,
                    "download failed: {}",
                    e.detail
                );
                let out = vec![Command::SendFeedback {
                    url: active.feedback_url.clone(),
                    message: FeedbackMessage::failure(
                        &active.action_id,
                        format!("Download failed: {}", e.detail),
                    ),
                }];
                self.active = None;
                match e.failure {
                    Failure::Retryable | Failure::Auth => self.backoff(out),
                    Failure::Fatal => self.exit_fatal(out, e.detail),
                    Failure::Skip | Failure::Rejected => self.finish_cycle(out),
                }
            }
        }
    }

    /// Installer progress line, relayed as `proceeding` feedback.
    pub fn on_install_progress(&mut self, line: &str) -> Vec<Command> {
        match (&self.state, &self.active) {
            (CycleState::Installing, Some(active)) => vec![Command::SendFeedback {
                url: active.feedback_url.clone(),
                message: FeedbackMessage::install_progress(&active.action_id, line),
            }],
            _ => {
                debug!(state = ?self.state, "install progress outside an install ignored");
                vec![]
            }
        }
    }

    /// Installer finished. `reboot_requested` is honoured only on success.
    pub fn on_install_complete(&mut self, success: bool, reboot_requested: bool) -> Vec<Command> {
        if self.state != CycleState::Installing {
            warn!(state = ?self.state, "unexpected install completion ignored");
            return vec![];
        }
        let Some(active) = self.active.take() else {
            return self.finish_cycle(vec![]);
        };
        let message = if success {
            info!(action_id = %active.action_id, artifact = %active.artifact_name, "installation succeeded");
            FeedbackMessage::success(&active.action_id, "Software bundle installed successfully.")
        } else {
            warn!(action_id = %active.action_id, artifact = %active.artifact_name, "installation failed");
            FeedbackMessage::failure(&active.action_id, "Failed to install software bundle.")
        };
        let mut out = vec![Command::SendFeedback {
            url: active.feedback_url,
            message,
        }];
        if success && reboot_requested {
            self.state = CycleState::AwaitingReboot;
            out.push(Command::Reboot);
            return out;
        }
        self.finish_cycle(out)
    }

    /// The host could not reboot; resume polling instead of hanging.
    pub fn on_reboot_failed(&mut self) -> Vec<Command> {
        if self.state != CycleState::AwaitingReboot {
            return vec![];
        }
        self.finish_cycle(vec![])
    }

    fn begin_cycle(&mut self) -> Vec<Command> {
        self.state = CycleState::Polling;
        self.control.force_check = false;
        self.cycles += 1;
        debug!(cycle = self.cycles, "poll cycle started");
        vec![Command::Poll]
    }

    fn fail(&mut self, e: CycleError) -> Vec<Command> {
        match e.failure {
            Failure::Retryable => {
                warn!("poll cycle failed, backing off: {}", e.detail);
                self.backoff(vec![])
            }
            Failure::Auth => {
                self.auth_failures += 1;
                let limit = self.config.auth_failure_limit;
                warn!(attempt = self.auth_failures, "authentication rejected: {}", e.detail);
                if limit > 0 && self.auth_failures >= limit {
                    let reason = format!("authentication rejected {} times in a row", limit);
                    return self.exit_fatal(vec![], reason);
                }
                self.backoff(vec![])
            }
            Failure::Skip | Failure::Rejected => {
                warn!("skipping poll cycle: {}", e.detail);
                self.finish_cycle(vec![])
            }
            Failure::Fatal => self.exit_fatal(vec![], e.detail),
        }
    }

    /// Cycle ended normally: back to Idle and re-arm (or exit in run-once mode).
    fn finish_cycle(&mut self, out: Vec<Command>) -> Vec<Command> {
        self.active = None;
        self.state = CycleState::Idle;
        let delay = self.interval;
        self.rearm(out, delay)
    }

    /// Cycle ended with a retryable failure.
    fn backoff(&mut self, out: Vec<Command>) -> Vec<Command> {
        self.active = None;
        self.state = CycleState::BackoffWait;
        let delay = self.config.retry_wait;
        self.rearm(out, delay)
    }

    fn rearm(&mut self, mut out: Vec<Command>, delay: Duration) -> Vec<Command> {
        if self.control.run_once {
            out.push(Command::Exit(ExitReason::RunOnceComplete));
        } else if self.control.force_check {
            self.control.force_check = false;
            out.push(Command::Arm(Duration::ZERO));
        } else {
            out.push(Command::Arm(delay));
        }
        out
    }

    fn exit_fatal(&mut self, mut out: Vec<Command>, reason: String) -> Vec<Command> {
        self.active = None;
        self.state = CycleState::Idle;
        out.push(Command::Exit(ExitReason::Fatal(reason)));
        out
    }
}
