//! Agent reactor: runs the scheduler's commands on a single-threaded runtime.
//!
//! Event sources are the poll timer, installer notifications, forced-check requests, the
//! supervisor watchdog and shutdown. Network commands race against shutdown and are dropped
//! (aborted) when it fires; an install already handed off is awaited before returning.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hawkbit_core::{Cancel, Command, CycleError, Deployment, ExitReason, PollReply, Scheduler};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::client::DdiClient;
use crate::config::Config;
use crate::download;
use crate::identity;
use crate::install::{self, InstallEvent, InstallNotifier, Installer};
use crate::supervisor::Supervisor;

/// How the reactor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    RunOnceComplete,
    Shutdown,
    Fatal(String),
}

/// Result of one executed command, fed back into the scheduler.
enum Event {
    Done,
    Poll(Result<PollReply, CycleError>),
    Deployment(Result<Deployment, CycleError>),
    Cancel(Result<Cancel, CycleError>),
    Download(Result<PathBuf, CycleError>),
    InstallStarted,
    InstallFailed,
}

/// Everything a command needs; borrowed immutably while a command runs.
struct Executor {
    client: DdiClient,
    installer: Arc<dyn Installer>,
    config: Config,
}

impl Executor {
    async fn run(&self, cmd: Command, notifier: &InstallNotifier) -> Event {
        match cmd {
            Command::Poll => Event::Poll(self.client.poll().await.map_err(Into::into)),
            Command::Identify => {
                let attrs = identity::device_attributes(&self.config);
                if let Err(e) = self.client.identify(&attrs).await {
                    warn!("identification failed: {}", e);
                }
                Event::Done
            }
            Command::FetchDeployment { url } => {
                Event::Deployment(self.client.fetch_deployment(&url).await.map_err(Into::into))
            }
            Command::FetchCancel { url } => {
                Event::Cancel(self.client.fetch_cancel(&url).await.map_err(Into::into))
            }
            Command::Download(artifact) => {
                let dest = &self.config.client.bundle_download_location;
                let res =
                    download::download_artifact(self.client.transport(), &artifact, dest).await;
                Event::Download(res.map_err(Into::into))
            }
            Command::SendFeedback { url, message } => {
                if let Err(e) = self.client.send_feedback(&url, &message).await {
                    warn!(
                        action_id = %message.action_id,
                        url = %url,
                        "feedback not delivered: {}",
                        e
                    );
                }
                Event::Done
            }
            Command::Install { bundle } => match self.installer.start(&bundle, notifier.clone()) {
                Ok(()) => Event::InstallStarted,
                Err(e) => {
                    error!("installation could not start: {}", e);
                    Event::InstallFailed
                }
            },
            // Timer, reboot and exit are handled by the reactor itself.
            Command::Arm(_) | Command::Reboot | Command::Exit(_) => Event::Done,
        }
    }
}

pub struct Agent {
    exec: Executor,
    scheduler: Scheduler,
    supervisor: Box<dyn Supervisor>,
    reboot: fn() -> nix::Result<()>,
}

impl Agent {
    pub fn new(
        config: Config,
        client: DdiClient,
        installer: Arc<dyn Installer>,
        supervisor: Box<dyn Supervisor>,
        run_once: bool,
    ) -> Self {
        let scheduler = Scheduler::new(config.scheduler_config(run_once));
        Self {
            exec: Executor {
                client,
                installer,
                config,
            },
            scheduler,
            supervisor,
            reboot: install::reboot,
        }
    }

    /// Replace the reboot action.
    #[cfg(test)]
    pub fn with_reboot(mut self, reboot: fn() -> nix::Result<()>) -> Self {
        self.reboot = reboot;
        self
    }

    /// Run until run-once completes, a fatal error, or `shutdown` resolves.
    pub async fn run<S>(self, mut force_rx: mpsc::UnboundedReceiver<()>, shutdown: S) -> Outcome
    where
        S: Future<Output = ()>,
    {
        let Agent {
            exec,
            mut scheduler,
            supervisor,
            reboot,
        } = self;
        let (notifier, mut install_rx) = install::channel();
        let mut watchdog = supervisor.watchdog_interval().map(tokio::time::interval);
        let timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(timer);
        tokio::pin!(shutdown);
        let mut armed = false;
        let mut install_pending = false;

        supervisor.ready();
        let mut queue: VecDeque<Command> = scheduler.start().into();

        'reactor: loop {
            while let Some(cmd) = queue.pop_front() {
                match cmd {
                    Command::Arm(delay) => {
                        debug!(?delay, "next poll armed");
                        timer.as_mut().reset(deadline(delay));
                        armed = true;
                    }
                    Command::Exit(ExitReason::RunOnceComplete) => {
                        info!("single check finished, exiting");
                        return Outcome::RunOnceComplete;
                    }
                    Command::Exit(ExitReason::Fatal(reason)) => {
                        error!("giving up: {}", reason);
                        return Outcome::Fatal(reason);
                    }
                    Command::Reboot => {
                        info!("rebooting");
                        if let Err(e) = reboot() {
                            error!("reboot failed: {}", e);
                            queue.extend(scheduler.on_reboot_failed());
                        }
                    }
                    cmd => {
                        let fut = exec.run(cmd, &notifier);
                        tokio::pin!(fut);
                        let event = loop {
                            tokio::select! {
                                biased;
                                _ = &mut shutdown => break None,
                                _ = tick(&mut watchdog) => supervisor.watchdog(),
                                ev = &mut fut => break Some(ev),
                            }
                        };
                        let Some(event) = event else {
                            info!("shutdown requested, in-flight request aborted");
                            break 'reactor;
                        };
                        if matches!(event, Event::InstallStarted) {
                            install_pending = true;
                        }
                        queue.extend(apply(&mut scheduler, event));
                    }
                }
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break 'reactor;
                }
                Some(ev) = install_rx.recv() => {
                    if matches!(ev, InstallEvent::Completed { .. }) {
                        install_pending = false;
                    }
                    queue.extend(on_install_event(&mut scheduler, &exec.config, ev));
                }
                _ = tick(&mut watchdog) => supervisor.watchdog(),
                Some(()) = force_rx.recv() => {
                    info!("forced check requested");
                    queue.extend(scheduler.request_force_check());
                }
                _ = &mut timer, if armed => {
                    armed = false;
                    queue.extend(scheduler.on_timer());
                }
            }
        }

        if install_pending {
            let drain = Drain {
                exec: &exec,
                notifier: &notifier,
                supervisor: supervisor.as_ref(),
                reboot,
            };
            drain.run(&mut install_rx, &mut scheduler, &mut watchdog).await;
        }
        Outcome::Shutdown
    }
}

fn apply(scheduler: &mut Scheduler, event: Event) -> Vec<Command> {
    match event {
        Event::Poll(r) => scheduler.on_poll_reply(r),
        Event::Deployment(r) => scheduler.on_deployment(r),
        Event::Cancel(r) => scheduler.on_cancel(r),
        Event::Download(r) => scheduler.on_download(r),
        Event::InstallFailed => scheduler.on_install_complete(false, false),
        Event::Done | Event::InstallStarted => vec![],
    }
}

fn on_install_event(scheduler: &mut Scheduler, config: &Config, ev: InstallEvent) -> Vec<Command> {
    match ev {
        InstallEvent::Progress(line) => {
            info!("Installing: {}", line);
            scheduler.on_install_progress(&line)
        }
        InstallEvent::Completed { success } => {
            let reboot = success && install::reboot_requested(&config.client.reboot_marker);
            scheduler.on_install_complete(success, reboot)
        }
    }
}

/// Deadline `delay` from now. Delays past what `Instant` can represent wait a year instead.
fn deadline(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600))
}

/// On shutdown, let a handed-off install finish and report it; no further polling.
struct Drain<'a> {
    exec: &'a Executor,
    notifier: &'a InstallNotifier,
    supervisor: &'a dyn Supervisor,
    reboot: fn() -> nix::Result<()>,
}

impl Drain<'_> {
    async fn run(
        &self,
        install_rx: &mut mpsc::Receiver<InstallEvent>,
        scheduler: &mut Scheduler,
        watchdog: &mut Option<Interval>,
    ) {
        info!("waiting for running installation to finish");
        loop {
            let ev = tokio::select! {
                ev = install_rx.recv() => ev,
                _ = tick(watchdog) => {
                    self.supervisor.watchdog();
                    continue;
                }
            };
            let Some(ev) = ev else { break };
            let done = matches!(ev, InstallEvent::Completed { .. });
            for cmd in on_install_event(scheduler, &self.exec.config, ev) {
                match cmd {
                    Command::SendFeedback { .. } => {
                        self.exec.run(cmd, self.notifier).await;
                    }
                    Command::Reboot => {
                        info!("rebooting");
                        if let Err(e) = (self.reboot)() {
                            error!("reboot failed: {}", e);
                        }
                    }
                    _ => {}
                }
            }
            if done {
                break;
            }
        }
    }
}

async fn tick(watchdog: &mut Option<Interval>) {
    match watchdog {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::install::InstallError;
    use crate::supervisor::NoSupervisor;
    use crate::testutil::{deployment_json, FixtureServer, Recorded, Reply, SHA1_1K_ZEROS};

    const CONTROLLER: &str = "/DEFAULT/controller/v1/dev01";

    struct FakeInstaller {
        starts: Arc<AtomicUsize>,
        success: bool,
        delay: Duration,
    }

    impl Installer for FakeInstaller {
        fn start(&self, bundle: &Path, notifier: InstallNotifier) -> Result<(), InstallError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let ok = self.success && bundle.exists();
            let delay = self.delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                notifier.progress("0% Installing");
                notifier.progress("50% Copying image");
                notifier.progress("100% Installing done.");
                notifier.completed(ok);
            });
            Ok(())
        }
    }

    struct Fixture {
        server: FixtureServer,
        dir: tempfile::TempDir,
        starts: Arc<AtomicUsize>,
    }

    impl Fixture {
        async fn new() -> Self {
            let server = FixtureServer::with_routes(vec![
                ("PUT", "/DEFAULT/controller/v1/dev01/configData", Reply::json(200, "")),
                (
                    "POST",
                    "/DEFAULT/controller/v1/dev01/deploymentBase/7/feedback",
                    Reply::json(200, ""),
                ),
            ])
            .await;
            Self {
                server,
                dir: tempfile::tempdir().unwrap(),
                starts: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Poll announces deployment 7 whose artifact is served by `download`.
        fn offer_deployment(&self, download: Reply) {
            let s = &self.server;
            let poll = format!(
                r#"{{"config":{{"polling":{{"sleep":"00:00:30"}}}},"_links":{{"deploymentBase":{{"href":"{}"}}}}}}"#,
                s.url(&format!("{}/deploymentBase/7", CONTROLLER))
            );
            s.route("GET", CONTROLLER, Reply::json(200, &poll));
            s.route(
                "GET",
                &format!("{}/deploymentBase/7", CONTROLLER),
                Reply::json(200, &deployment_json("7", &s.url("/dl"), 1024, SHA1_1K_ZEROS)),
            );
            s.route("GET", "/dl", download);
        }

        fn config(&self, extra: &str) -> Config {
            let c = Config::parse(&format!(
                r#"
[client]
hawkbit_server = "{}"
target_name = "dev01"
auth_token = "tok"
ssl = false
connect_timeout = 2
timeout = 5
bundle_download_location = {:?}
reboot_marker = {:?}
{}
[device]
hw = "rev-b"
"#,
                self.server.base(),
                self.dir.path().join("bundle.raucb"),
                self.dir.path().join(".do_reboot"),
                extra
            ))
            .unwrap();
            c.validate().unwrap();
            c
        }

        fn agent(&self, config: Config, run_once: bool, success: bool) -> Agent {
            let client = DdiClient::from_config(&config, "dev01").unwrap();
            let installer = Arc::new(FakeInstaller {
                starts: self.starts.clone(),
                success,
                delay: Duration::ZERO,
            });
            Agent::new(config, client, installer, Box::new(NoSupervisor), run_once)
        }

        fn feedback(&self) -> Vec<serde_json::Value> {
            self.server
                .requests()
                .iter()
                .filter(|r| r.method == "POST")
                .map(Recorded::json)
                .collect()
        }

        fn polls(&self) -> usize {
            self.server
                .requests()
                .iter()
                .filter(|r| r.method == "GET" && r.path == CONTROLLER)
                .count()
        }
    }

    fn idle_forever() -> (mpsc::UnboundedSender<()>, mpsc::UnboundedReceiver<()>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn deployment_installed_and_reported() {
        let fx = Fixture::new().await;
        fx.offer_deployment(Reply::bytes(200, vec![0u8; 1024]));
        let (_force_tx, force_rx) = idle_forever();
        let outcome = fx
            .agent(fx.config(""), true, true)
            .run(force_rx, std::future::pending())
            .await;
        assert_eq!(outcome, Outcome::RunOnceComplete);
        assert_eq!(fx.starts.load(Ordering::SeqCst), 1);

        let identify = fx
            .server
            .requests()
            .into_iter()
            .find(|r| r.method == "PUT")
            .unwrap();
        assert_eq!(identify.json()["data"]["hw"], "rev-b");

        let fb = fx.feedback();
        let last = fb.last().unwrap();
        assert_eq!(last["id"], "7");
        assert_eq!(last["status"]["execution"], "closed");
        assert_eq!(last["status"]["result"]["finished"], "success");
        let progress: Vec<u64> = fb
            .iter()
            .filter_map(|v| v["status"]["result"]["progress"]["cnt"].as_u64())
            .collect();
        assert_eq!(progress, vec![0, 50, 100]);
        assert!(fb[..fb.len() - 1]
            .iter()
            .all(|v| v["status"]["execution"] == "proceeding"));
    }

    #[tokio::test]
    async fn truncated_download_reported_without_install() {
        let fx = Fixture::new().await;
        fx.offer_deployment(Reply::truncated(vec![0u8; 1024], 512));
        let (_force_tx, force_rx) = idle_forever();
        let outcome = fx
            .agent(fx.config(""), true, true)
            .run(force_rx, std::future::pending())
            .await;
        assert_eq!(outcome, Outcome::RunOnceComplete);
        assert_eq!(fx.starts.load(Ordering::SeqCst), 0);
        let fb = fx.feedback();
        let last = fb.last().unwrap();
        assert_eq!(last["status"]["execution"], "closed");
        assert_eq!(last["status"]["result"]["finished"], "failure");
        assert!(!fx.dir.path().join("bundle.raucb").exists());
    }

    #[tokio::test]
    async fn failed_install_reported() {
        let fx = Fixture::new().await;
        fx.offer_deployment(Reply::bytes(200, vec![0u8; 1024]));
        let (_force_tx, force_rx) = idle_forever();
        fx.agent(fx.config(""), true, false)
            .run(force_rx, std::future::pending())
            .await;
        let fb = fx.feedback();
        assert_eq!(fb.last().unwrap()["status"]["result"]["finished"], "failure");
    }

    static REBOOTED: AtomicBool = AtomicBool::new(false);

    fn fake_reboot() -> nix::Result<()> {
        REBOOTED.store(true, Ordering::SeqCst);
        Err(nix::errno::Errno::EPERM)
    }

    #[tokio::test]
    async fn reboot_marker_triggers_reboot() {
        let fx = Fixture::new().await;
        fx.offer_deployment(Reply::bytes(200, vec![0u8; 1024]));
        std::fs::write(fx.dir.path().join(".do_reboot"), b"").unwrap();
        let (_force_tx, force_rx) = idle_forever();
        let outcome = fx
            .agent(fx.config(""), true, true)
            .with_reboot(fake_reboot)
            .run(force_rx, std::future::pending())
            .await;
        assert!(REBOOTED.load(Ordering::SeqCst));
        // Reboot failed, so the cycle ended normally.
        assert_eq!(outcome, Outcome::RunOnceComplete);
    }

    #[tokio::test]
    async fn auth_failure_limit_is_fatal() {
        let fx = Fixture::new().await;
        fx.server.route("GET", CONTROLLER, Reply::json(401, ""));
        let (_force_tx, force_rx) = idle_forever();
        let outcome = fx
            .agent(fx.config("auth_failure_limit = 1\n"), false, true)
            .run(force_rx, std::future::pending())
            .await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
        assert_eq!(fx.polls(), 1);
    }

    #[tokio::test]
    async fn forced_check_polls_again_then_shutdown() {
        let fx = Fixture::new().await;
        fx.server.route(
            "GET",
            CONTROLLER,
            Reply::json(200, r#"{"config":{"polling":{"sleep":"01:00:00"}}}"#),
        );
        let (force_tx, force_rx) = idle_forever();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let agent = fx.agent(fx.config(""), false, true);
        let driver = async {
            while fx.polls() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            force_tx.send(()).unwrap();
            while fx.polls() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            stop_tx.send(()).unwrap();
        };
        let (outcome, ()) = tokio::join!(
            agent.run(force_rx, async {
                let _ = stop_rx.await;
            }),
            driver
        );
        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(fx.polls(), 2);
    }

    #[tokio::test]
    async fn shutdown_aborts_hanging_poll() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let fx = Fixture::new().await;
        let mut config = fx.config("");
        config.client.hawkbit_server = format!("http://{}", addr);
        config.client.timeout = 60;
        let (_force_tx, force_rx) = idle_forever();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            fx.agent(config, false, true)
                .run(force_rx, tokio::time::sleep(Duration::from_millis(200))),
        )
        .await
        .expect("shutdown did not abort the request");
        assert_eq!(outcome, Outcome::Shutdown);
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }

    #[tokio::test]
    async fn feedback_failure_does_not_block_cycle() {
        // Deployment and artifact live on `fx.server`; the controller (and so every feedback
        // URL) lives on `bare`, which answers 404 to feedback.
        let fx = Fixture::new().await;
        fx.offer_deployment(Reply::bytes(200, vec![0u8; 1024]));
        let bare = FixtureServer::with_routes(vec![]).await;
        let poll = format!(
            r#"{{"_links":{{"deploymentBase":{{"href":"{}"}}}}}}"#,
            fx.server.url(&format!("{}/deploymentBase/7", CONTROLLER))
        );
        bare.route("GET", CONTROLLER, Reply::json(200, &poll));
        let mut config = fx.config("");
        config.client.hawkbit_server = bare.base();
        let (_force_tx, force_rx) = idle_forever();
        let outcome = fx
            .agent(config, true, true)
            .run(force_rx, std::future::pending())
            .await;
        assert_eq!(outcome, Outcome::RunOnceComplete);
        assert_eq!(fx.starts.load(Ordering::SeqCst), 1);
        assert!(bare.requests().iter().any(|r| r.method == "POST"));
    }

    #[tokio::test]
    async fn huge_retry_wait_does_not_crash_reactor() {
        let fx = Fixture::new().await;
        fx.server.route("GET", CONTROLLER, Reply::json(503, ""));
        let config = fx.config("retry_wait = 9223372036854775807\n");
        let (_force_tx, force_rx) = idle_forever();
        let shutdown = async {
            while fx.polls() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        let outcome = fx.agent(config, false, true).run(force_rx, shutdown).await;
        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(fx.polls(), 1);
    }

    #[test]
    fn deadline_saturates() {
        let far = deadline(Duration::from_secs(u64::MAX));
        assert!(far > Instant::now() + Duration::from_secs(364 * 24 * 3600));
        let near = deadline(Duration::from_secs(30));
        assert!(near <= Instant::now() + Duration::from_secs(30));
    }

    struct CountingSupervisor {
        pings: Arc<AtomicUsize>,
    }

    impl Supervisor for CountingSupervisor {
        fn ready(&self) {}
        fn watchdog(&self) {
            self.pings.fetch_add(1, Ordering::SeqCst);
        }
        fn watchdog_interval(&self) -> Option<Duration> {
            Some(Duration::from_millis(10))
        }
    }

    #[tokio::test]
    async fn watchdog_pinged_while_install_drains() {
        let fx = Fixture::new().await;
        fx.offer_deployment(Reply::bytes(200, vec![0u8; 1024]));
        let config = fx.config("");
        let client = DdiClient::from_config(&config, "dev01").unwrap();
        let installer = Arc::new(FakeInstaller {
            starts: fx.starts.clone(),
            success: true,
            delay: Duration::from_millis(300),
        });
        let pings = Arc::new(AtomicUsize::new(0));
        let supervisor = Box::new(CountingSupervisor {
            pings: pings.clone(),
        });
        let at_shutdown = AtomicUsize::new(0);
        let shutdown = async {
            while fx.starts.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            at_shutdown.store(pings.load(Ordering::SeqCst), Ordering::SeqCst);
        };
        let (_force_tx, force_rx) = idle_forever();
        let outcome = Agent::new(config, client, installer, supervisor, false)
            .run(force_rx, shutdown)
            .await;
        assert_eq!(outcome, Outcome::Shutdown);
        assert!(pings.load(Ordering::SeqCst) > at_shutdown.load(Ordering::SeqCst));
        let fb = fx.feedback();
        assert_eq!(fb.last().unwrap()["status"]["result"]["finished"], "success");
    }
}
