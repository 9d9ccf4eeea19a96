//! hawkBit DDI update agent core.
//! Host-driven: no I/O; host passes events and receives commands.

pub mod checksum;
pub mod ddi;
pub mod download;
pub mod endpoint;
pub mod feedback;
pub mod resolver;
pub mod scheduler;

pub use checksum::{Algorithm, Checksum, Digests, ExpectedDigest};
pub use download::{DownloadState, StreamError, VerificationError};
pub use endpoint::Endpoint;
pub use feedback::FeedbackMessage;
pub use resolver::{
    resolve_cancel, resolve_deployment, resolve_poll, Artifact, Cancel, Deployment, PollAction,
    PollReply, ResolverError,
};
pub use scheduler::{
    Command, ControlState, CycleError, CycleState, ExitReason, Failure, Scheduler,
    SchedulerConfig, DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_WAIT,
};
