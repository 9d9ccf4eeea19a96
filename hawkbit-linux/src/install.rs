//! Install bridge: hand a verified bundle to the installer and relay its notifications
//! back to the reactor over a bounded FIFO channel.
//!
//! Installers report from their own threads. `InstallNotifier` is the only producer-side
//! handle; the reactor owns the receiver and turns each event into feedback, in the order
//! the installer produced them.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queue depth between installer and reactor. A full queue blocks the installer thread,
/// never the reactor.
pub const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    Progress(String),
    Completed { success: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("cannot start installer {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("bundle {0} does not exist")]
    MissingBundle(PathBuf),
}

/// Producer side of the install channel. Blocking: call from installer threads only.
#[derive(Clone)]
pub struct InstallNotifier {
    tx: mpsc::Sender<InstallEvent>,
}

impl InstallNotifier {
    /// Queue a progress line. Returns false once the reactor is gone.
    pub fn progress(&self, message: impl Into<String>) -> bool {
        self.tx
            .blocking_send(InstallEvent::Progress(message.into()))
            .is_ok()
    }

    pub fn completed(&self, success: bool) -> bool {
        self.tx
            .blocking_send(InstallEvent::Completed { success })
            .is_ok()
    }
}

pub fn channel() -> (InstallNotifier, mpsc::Receiver<InstallEvent>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (InstallNotifier { tx }, rx)
}

/// External bundle installer. `start` returns once the install is handed off; progress and
/// the single completion arrive through `notifier`.
pub trait Installer: Send + Sync {
    fn start(&self, bundle: &Path, notifier: InstallNotifier) -> Result<(), InstallError>;
}

/// Runs `<program> install <bundle>`; each stdout line is a progress message and the exit
/// status decides success.
pub struct CommandInstaller {
    program: String,
}

impl CommandInstaller {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Installer for CommandInstaller {
    fn start(&self, bundle: &Path, notifier: InstallNotifier) -> Result<(), InstallError> {
        if !bundle.exists() {
            return Err(InstallError::MissingBundle(bundle.to_path_buf()));
        }
        let mut child = Command::new(&self.program)
            .arg("install")
            .arg(bundle)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| InstallError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        info!(program = %self.program, bundle = %bundle.display(), "installer started");
        let stdout = child.stdout.take();
        std::thread::Builder::new()
            .name("installer".into())
            .spawn(move || {
                if let Some(out) = stdout {
                    for line in BufReader::new(out).lines().map_while(Result::ok) {
                        let line = line.trim();
                        if !line.is_empty() && !notifier.progress(line) {
                            break;
                        }
                    }
                }
                let success = match child.wait() {
                    Ok(status) => {
                        debug!(%status, "installer exited");
                        status.success()
                    }
                    Err(e) => {
                        warn!("waiting for installer failed: {}", e);
                        false
                    }
                };
                notifier.completed(success);
            })
            .map_err(|source| InstallError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        Ok(())
    }
}

/// Reboot marker check at install completion.
pub fn reboot_requested(marker: &Path) -> bool {
    marker.exists()
}

/// Flush filesystems and restart the machine. Only returns on failure.
pub fn reboot() -> nix::Result<()> {
    nix::unistd::sync();
    nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT)
        .map(|never| match never {})
}
