//! Service supervisor adapter: readiness and watchdog pings, invoked by the reactor.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

pub trait Supervisor {
    /// Startup finished.
    fn ready(&self);
    /// Liveness ping.
    fn watchdog(&self);
    /// How often the reactor should call `watchdog`; `None` disables pings.
    fn watchdog_interval(&self) -> Option<Duration>;
}

/// No supervisor: all calls are no-ops.
pub struct NoSupervisor;

impl Supervisor for NoSupervisor {
    fn ready(&self) {}
    fn watchdog(&self) {}
    fn watchdog_interval(&self) -> Option<Duration> {
        None
    }
}

/// systemd `sd_notify` protocol over `$NOTIFY_SOCKET`.
pub struct SystemdNotify {
    socket: PathBuf,
    watchdog: Option<Duration>,
}

impl SystemdNotify {
    /// `None` unless running under a unit with `Type=notify`.
    pub fn from_env() -> Option<Self> {
        let socket = std::env::var_os("NOTIFY_SOCKET")?;
        let watchdog = std::env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .and_then(watchdog_interval);
        Some(Self {
            socket: PathBuf::from(socket),
            watchdog,
        })
    }

    fn notify(&self, state: &str) -> io::Result<()> {
        let sock = UnixDatagram::unbound()?;
        let path = self.socket.to_string_lossy();
        if let Some(name) = path.strip_prefix('@') {
            use std::os::linux::net::SocketAddrExt;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
            sock.send_to_addr(state.as_bytes(), &addr)?;
        } else {
            sock.send_to(state.as_bytes(), &self.socket)?;
        }
        Ok(())
    }

    fn send(&self, state: &str) {
        match self.notify(state) {
            Ok(()) => debug!(state, "supervisor notified"),
            Err(e) => warn!(state, "supervisor notification failed: {}", e),
        }
    }
}

impl Supervisor for SystemdNotify {
    fn ready(&self) {
        self.send("READY=1");
    }

    fn watchdog(&self) {
        self.send("WATCHDOG=1");
    }

    fn watchdog_interval(&self) -> Option<Duration> {
        self.watchdog
    }
}

/// Ping at half the supervisor's timeout.
fn watchdog_interval(usec: u64) -> Option<Duration> {
    if usec == 0 {
        None
    } else {
        Some(Duration::from_micros(usec / 2))
    }
}
