use crate::nw::history::History;
use crate::nw::probe;
use crate::nw::process::{ExitCause, ExitSender, Launch, ProcessControl, ProcessExit};
use crate::nw::registry::Registry;
use crate::nw::tasks::TaskTracker;
use crate::nw::watch::Watch;
use nix::sys::signal::Signal;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often liveness is re-checked while waiting for a stopping process.
const LIVENESS_TICK: Duration = Duration::from_millis(250);
/// Grace after SIGKILL before giving up on the pid.
const KILL_SETTLE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Init,
    Unmonitored,
    Starting,
    Running,
    Stopping,
    Stopped,
    Restarting,
    Quit,
}

impl State {
    pub fn as_human(&self) -> &'static str {
        match self {
            State::Init => "initialized",
            State::Unmonitored => "unmonitored",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Restarting => "restarting",
            State::Quit => "quit",
        }
    }

    /// What a request for `requested` turns into when the watch is in `self`.
    /// `None` means the request changes nothing and is dropped.
    pub fn resolve_request(self, requested: State) -> Option<State> {
        use State::*;
        match (self, requested) {
            (Quit, _) => None,
            (_, Quit) => Some(Quit),
            (Init | Unmonitored | Stopped, Starting | Restarting) => Some(Starting),
            (Starting | Running, Restarting) => Some(Restarting),
            (Starting | Running | Restarting, Stopping) => Some(Stopping),
            (Init | Stopped, Unmonitored) => Some(Unmonitored),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_human())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    /// 0 when no process is running.
    pub pid: u32,
}

enum Request {
    Transition(State),
    Exited { pid: u32, cause: ExitCause },
    Rebind(Arc<Watch>),
    Retire,
}

/// Daemon-wide pieces every supervision loop needs.
#[derive(Clone)]
pub struct Supervision {
    pub control: Arc<dyn ProcessControl>,
    pub exits: ExitSender,
    pub shutting_down: Arc<AtomicBool>,
    pub check_interval: Duration,
    pub history_size: usize,
    pub tasks: TaskTracker,
}

/// Runtime record of one watch. Status, pid and history are written only by the watch's own
/// supervision task; everyone else reads them or enqueues a request.
pub struct WatchState {
    name: String,
    record: Arc<Record>,
    tx: mpsc::UnboundedSender<Request>,
}

struct Record {
    watch: RwLock<Arc<Watch>>,
    status: RwLock<Status>,
    history: RwLock<History<State>>,
}

impl Record {
    fn watch(&self) -> Arc<Watch> {
        Arc::clone(&self.watch.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn status(&self) -> Status {
        *self.status.read().unwrap_or_else(|p| p.into_inner())
    }

    fn set_pid(&self, pid: u32) {
        self.status.write().unwrap_or_else(|p| p.into_inner()).pid = pid;
    }

    fn swap_state(&self, next: State) -> State {
        let mut st = self.status.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut st.state, next)
    }
}

impl WatchState {
    /// Creates the record in `INIT` and starts its supervision task.
    pub fn spawn(watch: Arc<Watch>, sup: &Supervision) -> Arc<WatchState> {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = watch.name.clone();
        let record = Arc::new(Record {
            watch: RwLock::new(watch),
            status: RwLock::new(Status {
                state: State::Init,
                pid: 0,
            }),
            history: RwLock::new(History::new(sup.history_size)),
        });
        let supervisor = Supervisor {
            name: name.clone(),
            record: Arc::clone(&record),
            rx,
            rx_closed: false,
            backlog: VecDeque::new(),
            checks: None,
            sup: sup.clone(),
        };
        sup.tasks.spawn(supervisor.run());
        Arc::new(WatchState { name, record, tx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watch(&self) -> Arc<Watch> {
        self.record.watch()
    }

    pub fn status(&self) -> Status {
        self.record.status()
    }

    pub fn state(&self) -> State {
        self.status().state
    }

    pub fn pid(&self) -> u32 {
        self.status().pid
    }

    /// Snapshot of the transition log.
    pub fn history(&self) -> History<State> {
        self.record
            .history
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Enqueues a transition request and returns immediately. False once the loop is gone.
    pub fn request(&self, state: State) -> bool {
        self.send(Request::Transition(state))
    }

    pub(crate) fn notify_exit(&self, pid: u32, cause: ExitCause) -> bool {
        self.send(Request::Exited { pid, cause })
    }

    /// Replaces the bound watch; takes effect at the next start or stop.
    pub(crate) fn rebind(&self, watch: Arc<Watch>) -> bool {
        self.send(Request::Rebind(watch))
    }

    /// Stops the process if one is running, then ends the supervision task.
    pub(crate) fn retire(&self) -> bool {
        self.send(Request::Retire)
    }

    fn send(&self, req: Request) -> bool {
        self.tx.send(req).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn push_history_at(&self, timestamp: i64, state: State) {
        self.record
            .history
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .append_at(timestamp, state);
    }
}

/// Routes an OS exit report to the watch that owns `pid`. Returns whether a watch matched.
pub fn dispatch_event(registry: &Registry, pid: u32, cause: ExitCause) -> bool {
    match registry.find_by_pid(pid) {
        Some(ws) => {
            debug!(watch = %ws.name(), "event=exit pid={pid} {cause}");
            ws.notify_exit(pid, cause)
        }
        None => {
            warn!("event=exit pid={pid} {cause} outcome=no_matching_watch");
            false
        }
    }
}

/// Poll fallback: a dead pid whose watch is `RUNNING` is treated as an unexpected exit.
pub fn dispatch_poll_result(registry: &Registry, pid: u32, running: bool) -> bool {
    if running {
        return false;
    }
    match registry.find_by_pid(pid) {
        Some(ws) if ws.state() == State::Running => {
            debug!(watch = %ws.name(), "event=poll pid={pid} running=false");
            ws.notify_exit(pid, ExitCause::Vanished)
        }
        Some(_) => false,
        None => {
            warn!("event=poll pid={pid} running=false outcome=no_matching_watch");
            false
        }
    }
}

/// Drains the exit channel into `dispatch_event` until every sender is gone.
pub async fn pump_exits(registry: Arc<Registry>, mut exits: mpsc::UnboundedReceiver<ProcessExit>) {
    while let Some(exit) = exits.recv().await {
        dispatch_event(&registry, exit.pid, exit.cause);
    }
}

enum Wake {
    Request(Request),
    Inspect,
    Closed,
}

/// The per-watch supervision task.
struct Supervisor {
    name: String,
    record: Arc<Record>,
    rx: mpsc::UnboundedReceiver<Request>,
    rx_closed: bool,
    /// Requests that arrived while a stop was in progress.
    backlog: VecDeque<Request>,
    /// Armed only while running with limits or probes configured.
    checks: Option<Interval>,
    sup: Supervision,
}

async fn tick(checks: &mut Option<Interval>) {
    match checks {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Supervisor {
    async fn run(mut self) {
        debug!(watch = %self.name, "supervisor=started");
        loop {
            match self.next_wake().await {
                Wake::Request(Request::Transition(requested)) => {
                    let current = self.record.status().state;
                    let Some(next) = current.resolve_request(requested) else {
                        debug!(watch = %self.name, "request={requested} state={current} outcome=ignored");
                        continue;
                    };
                    if !self.apply(next).await {
                        break;
                    }
                }
                Wake::Request(Request::Exited { pid, cause }) => self.on_exit(pid, cause).await,
                Wake::Request(Request::Rebind(watch)) => self.rebind(watch),
                Wake::Request(Request::Retire) => {
                    let state = self.record.status().state;
                    if matches!(state, State::Starting | State::Running | State::Restarting) {
                        self.set_state(State::Stopping);
                        self.stop().await;
                    }
                    info!(watch = %self.name, "supervisor=retired");
                    break;
                }
                Wake::Inspect => self.inspect().await,
                Wake::Closed => break,
            }
        }
        debug!(watch = %self.name, "supervisor=exited");
    }

    async fn next_wake(&mut self) -> Wake {
        if let Some(req) = self.backlog.pop_front() {
            return Wake::Request(req);
        }
        if self.rx_closed {
            return Wake::Closed;
        }
        let rx = &mut self.rx;
        let checks = &mut self.checks;
        tokio::select! {
            r = rx.recv() => match r {
                Some(req) => Wake::Request(req),
                None => Wake::Closed,
            },
            _ = tick(checks) => Wake::Inspect,
        }
    }

    /// Returns false when the loop must end.
    async fn apply(&mut self, next: State) -> bool {
        match next {
            State::Starting => {
                self.set_state(State::Starting);
                self.start().await;
            }
            State::Stopping => {
                self.set_state(State::Stopping);
                self.stop().await;
            }
            State::Restarting => {
                self.set_state(State::Restarting);
                self.set_state(State::Stopping);
                self.stop().await;
                self.set_state(State::Starting);
                self.start().await;
            }
            State::Quit => {
                self.set_state(State::Quit);
                self.checks = None;
                info!(watch = %self.name, "supervisor=quit pid={}", self.record.status().pid);
                return false;
            }
            other => self.set_state(other),
        }
        true
    }

    /// Records the change in history before anything acts on it.
    fn set_state(&mut self, next: State) {
        let prev = self.record.swap_state(next);
        if prev == next {
            return;
        }
        self.record
            .history
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .append(next);
        info!(watch = %self.name, "transition from={prev} to={next}");
    }

    fn arm_checks(&mut self, watch: &Watch) {
        self.checks = watch.needs_checks().then(|| {
            let period = self.sup.check_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
    }

    fn rebind(&mut self, watch: Arc<Watch>) {
        *self.record.watch.write().unwrap_or_else(|p| p.into_inner()) = Arc::clone(&watch);
        info!(watch = %self.name, "event=rebind");
        if self.record.status().state == State::Running {
            self.arm_checks(&watch);
        } else {
            self.checks = None;
        }
    }

    async fn start(&mut self) {
        let watch = self.record.watch();
        info!(watch = %self.name, "attempt=start argv={:?}", watch.start);
        let control = Arc::clone(&self.sup.control);
        let exits = self.sup.exits.clone();
        let w = Arc::clone(&watch);
        let res = tokio::task::spawn_blocking(move || control.spawn(&Launch::start(&w), exits))
            .await
            .map_err(|e| anyhow::anyhow!("join error: {e}"))
            .and_then(|r| r);
        match res {
            Ok(pid) => {
                self.record.set_pid(pid);
                self.set_state(State::Running);
                info!(watch = %self.name, "outcome=started pid={pid}");
                self.arm_checks(&watch);
                // An exit reported before the pid was recorded matched no watch.
                if !self.sup.control.is_running(pid) {
                    self.backlog.push_back(Request::Exited {
                        pid,
                        cause: ExitCause::Vanished,
                    });
                }
            }
            Err(e) => {
                error!(watch = %self.name, "outcome=start_failed err={e:#}");
                self.record.set_pid(0);
                self.set_state(State::Stopped);
            }
        }
    }

    fn terminate(&self, pid: u32) {
        match self.sup.control.signal(pid, Signal::SIGTERM) {
            Ok(()) => info!(watch = %self.name, "attempt=signal sig=SIGTERM pid={pid}"),
            Err(e) => warn!(watch = %self.name, "outcome=signal_failed pid={pid} err={e:#}"),
        }
    }

    async fn stop(&mut self) {
        self.checks = None;
        let pid = self.record.status().pid;
        if pid == 0 || !self.sup.control.is_running(pid) {
            self.record.set_pid(0);
            self.set_state(State::Stopped);
            return;
        }

        let watch = self.record.watch();
        let timeout = watch.stop_timeout();
        let deadline = Instant::now() + timeout;
        if watch.stop.is_empty() {
            self.terminate(pid);
        } else {
            info!(watch = %self.name, "attempt=stop_command argv={:?}", watch.stop);
            let control = Arc::clone(&self.sup.control);
            let w = Arc::clone(&watch);
            let res = tokio::task::spawn_blocking(move || control.run(&Launch::stop(&w), timeout))
                .await
                .map_err(|e| anyhow::anyhow!("join error: {e}"))
                .and_then(|r| r);
            if let Err(e) = res {
                warn!(watch = %self.name, "outcome=stop_command_error fallback=signal err={e:#}");
                self.terminate(pid);
            }
        }

        if !self.wait_for_exit(pid, deadline).await {
            warn!(
                watch = %self.name,
                "outcome=stop_timeout pid={pid} stop_timeout_s={} decision=kill",
                watch.stop_timeout
            );
            if let Err(e) = self.sup.control.force_kill(pid) {
                error!(watch = %self.name, "outcome=kill_failed pid={pid} err={e:#}");
            }
            if !self.wait_for_exit(pid, Instant::now() + KILL_SETTLE).await {
                error!(watch = %self.name, "outcome=still_running_after_kill pid={pid}");
            }
        }
        self.record.set_pid(0);
        self.set_state(State::Stopped);
    }

    /// Waits for `pid` to go away, deferring unrelated requests. False on deadline.
    async fn wait_for_exit(&mut self, pid: u32, deadline: Instant) -> bool {
        loop {
            if !self.sup.control.is_running(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let nap = (deadline - now).min(LIVENESS_TICK);
            if self.rx_closed {
                tokio::time::sleep(nap).await;
                continue;
            }
            tokio::select! {
                r = self.rx.recv() => match r {
                    Some(Request::Exited { pid: p, cause }) if p == pid => {
                        info!(watch = %self.name, "event=exit pid={pid} {cause} during=stop");
                        return true;
                    }
                    Some(other) => self.backlog.push_back(other),
                    None => self.rx_closed = true,
                },
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn on_exit(&mut self, pid: u32, cause: ExitCause) {
        let status = self.record.status();
        if pid == 0 || pid != status.pid {
            debug!(watch = %self.name, "event=exit pid={pid} current_pid={} outcome=stale", status.pid);
            return;
        }
        match status.state {
            State::Stopping => {
                self.record.set_pid(0);
                self.set_state(State::Stopped);
            }
            State::Running | State::Starting => {
                warn!(watch = %self.name, "event=exit pid={pid} {cause} outcome=unexpected");
                self.checks = None;
                self.record.set_pid(0);
                if self.sup.shutting_down.load(Ordering::Relaxed) {
                    self.set_state(State::Stopped);
                } else {
                    self.set_state(State::Starting);
                    self.start().await;
                }
            }
            other => {
                debug!(watch = %self.name, "event=exit pid={pid} state={other} outcome=ignored");
            }
        }
    }

    async fn inspect(&mut self) {
        let status = self.record.status();
        if status.state != State::Running || status.pid == 0 {
            self.checks = None;
            return;
        }
        let watch = self.record.watch();
        if let Some(failure) = probe::inspect(Arc::clone(&self.sup.control), watch, status.pid).await {
            warn!(watch = %self.name, "outcome=check_failed pid={} {failure} decision=restart", status.pid);
            self.apply(State::Restarting).await;
        }
    }
}
