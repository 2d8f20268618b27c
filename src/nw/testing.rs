use crate::nw::process::{ExitCause, ExitSender, Launch, ProcessControl, ProcessExit, Usage};
use crate::nw::registry::Registry;
use crate::nw::state::{pump_exits, Supervision, WatchState};
use crate::nw::tasks::TaskTracker;
use crate::nw::watch::Watch;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory `ProcessControl`: pids are counters, exits are sent by hand or by signals.
pub(crate) struct FakeControl {
    next_pid: AtomicU32,
    inner: Mutex<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    alive: HashMap<u32, ExitSender>,
    spawned: Vec<Vec<String>>,
    ran: Vec<Vec<String>>,
    signals: Vec<(u32, Signal)>,
    usage: HashMap<u32, Usage>,
    fail_spawn: bool,
    ignore_term: bool,
}

impl FakeControl {
    pub(crate) fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            inner: Mutex::new(FakeInner::default()),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, FakeInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_fail_spawn(&self, on: bool) {
        self.inner().fail_spawn = on;
    }

    pub(crate) fn set_ignore_term(&self, on: bool) {
        self.inner().ignore_term = on;
    }

    pub(crate) fn set_usage(&self, pid: u32, usage: Usage) {
        self.inner().usage.insert(pid, usage);
    }

    pub(crate) fn spawned(&self) -> Vec<Vec<String>> {
        self.inner().spawned.clone()
    }

    pub(crate) fn ran(&self) -> Vec<Vec<String>> {
        self.inner().ran.clone()
    }

    pub(crate) fn signals(&self) -> Vec<(u32, Signal)> {
        self.inner().signals.clone()
    }

    pub(crate) fn alive_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.inner().alive.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// The process dies and its exit is reported.
    pub(crate) fn crash(&self, pid: u32, code: i32) -> bool {
        self.exit(pid, ExitCause::Exited(code))
    }

    /// The process dies without any exit report.
    pub(crate) fn vanish(&self, pid: u32) -> bool {
        self.inner().alive.remove(&pid).is_some()
    }

    fn exit(&self, pid: u32, cause: ExitCause) -> bool {
        let tx = self.inner().alive.remove(&pid);
        match tx {
            Some(tx) => {
                let _ = tx.send(ProcessExit { pid, cause });
                true
            }
            None => false,
        }
    }
}

impl ProcessControl for FakeControl {
    fn spawn(&self, launch: &Launch<'_>, exits: ExitSender) -> anyhow::Result<u32> {
        let mut inner = self.inner();
        anyhow::ensure!(!inner.fail_spawn, "spawn {:?}: no such file", launch.argv);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        inner.alive.insert(pid, exits);
        inner.spawned.push(launch.argv.to_vec());
        Ok(pid)
    }

    fn run(&self, launch: &Launch<'_>, _timeout: Duration) -> anyhow::Result<()> {
        self.inner().ran.push(launch.argv.to_vec());
        Ok(())
    }

    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()> {
        let ignore = {
            let mut inner = self.inner();
            inner.signals.push((pid, signal));
            inner.ignore_term
        };
        if !ignore {
            self.exit(pid, ExitCause::Signaled(signal as i32));
        }
        Ok(())
    }

    fn force_kill(&self, pid: u32) -> anyhow::Result<()> {
        self.inner().signals.push((pid, Signal::SIGKILL));
        self.exit(pid, ExitCause::Signaled(Signal::SIGKILL as i32));
        Ok(())
    }

    fn is_running(&self, pid: u32) -> bool {
        self.inner().alive.contains_key(&pid)
    }

    fn usage(&self, pid: u32) -> Option<Usage> {
        self.inner().usage.get(&pid).copied()
    }
}

/// Supervision wired to `control`; the caller owns the exit receiver.
pub(crate) fn supervision(
    control: Arc<FakeControl>,
) -> (Supervision, mpsc::UnboundedReceiver<ProcessExit>) {
    let (exits, rx) = mpsc::unbounded_channel();
    let sup = Supervision {
        control,
        exits,
        shutting_down: Arc::new(AtomicBool::new(false)),
        check_interval: Duration::from_secs(10),
        history_size: 20,
        tasks: TaskTracker::new(),
    };
    (sup, rx)
}

/// Registry + fake control + a running exit pump.
pub(crate) struct Harness {
    pub control: Arc<FakeControl>,
    pub registry: Arc<Registry>,
    pub sup: Supervision,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_check_interval(Duration::from_secs(10))
    }

    pub(crate) fn with_check_interval(check_interval: Duration) -> Self {
        let control = Arc::new(FakeControl::new());
        let (mut sup, rx) = supervision(Arc::clone(&control));
        sup.check_interval = check_interval;
        let registry = Arc::new(Registry::new());
        tokio::spawn(pump_exits(Arc::clone(&registry), rx));
        Self {
            control,
            registry,
            sup,
        }
    }

    pub(crate) fn add(&self, watch: Watch) -> Arc<WatchState> {
        let ws = WatchState::spawn(Arc::new(watch), &self.sup);
        self.registry
            .insert(Arc::clone(&ws))
            .expect("duplicate watch in test");
        ws
    }
}

/// Polls `cond` for up to five seconds.
pub(crate) async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
