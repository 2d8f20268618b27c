use crate::nw::watch::Watch;
use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{setsid, Gid, Pid, Uid};
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::sync::mpsc;

/// Why a supervised process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    Exited(i32),
    Signaled(i32),
    /// Liveness poll found the pid gone; no status is available.
    Vanished,
}

impl From<ExitStatus> for ExitCause {
    fn from(st: ExitStatus) -> Self {
        match (st.code(), st.signal()) {
            (Some(code), _) => ExitCause::Exited(code),
            (None, Some(sig)) => ExitCause::Signaled(sig),
            (None, None) => ExitCause::Vanished,
        }
    }
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Exited(code) => write!(f, "exit_code={code}"),
            ExitCause::Signaled(sig) => write!(f, "signal={sig}"),
            ExitCause::Vanished => f.write_str("vanished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub cause: ExitCause,
}

pub type ExitSender = mpsc::UnboundedSender<ProcessExit>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub memory_bytes: u64,
    /// Percent of one core.
    pub cpu_percent: f32,
}

/// Everything needed to exec one argv in a watch's context.
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    pub argv: &'a [String],
    pub dir: Option<&'a Path>,
    pub uid: Option<&'a str>,
    pub gid: Option<&'a str>,
    pub env: &'a BTreeMap<String, String>,
}

impl<'a> Launch<'a> {
    pub fn start(watch: &'a Watch) -> Self {
        Self::with_argv(watch, &watch.start)
    }

    pub fn stop(watch: &'a Watch) -> Self {
        Self::with_argv(watch, &watch.stop)
    }

    fn with_argv(watch: &'a Watch, argv: &'a [String]) -> Self {
        Self {
            argv,
            dir: watch.dir.as_deref(),
            uid: watch.uid.as_deref(),
            gid: watch.gid.as_deref(),
            env: &watch.env,
        }
    }
}

/// OS-facing side of supervision. All methods may block; the state machine calls the
/// expensive ones from the blocking pool.
pub trait ProcessControl: Send + Sync + 'static {
    /// Starts the process and returns its pid. The implementation must report the process's
    /// termination on `exits`.
    fn spawn(&self, launch: &Launch<'_>, exits: ExitSender) -> anyhow::Result<u32>;

    /// Runs a helper command (the stop command) to completion, killing it after `timeout`.
    fn run(&self, launch: &Launch<'_>, timeout: Duration) -> anyhow::Result<()>;

    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()>;

    fn force_kill(&self, pid: u32) -> anyhow::Result<()>;

    fn is_running(&self, pid: u32) -> bool;

    fn usage(&self, pid: u32) -> Option<Usage>;
}

/// `ProcessControl` backed by fork/exec, kill(2) and /proc sampling.
pub struct SystemControl {
    system: Mutex<System>,
}

impl SystemControl {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemControl {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_uid(name_or_id: &str) -> anyhow::Result<Uid> {
    if let Ok(n) = name_or_id.parse::<u32>() {
        return Ok(Uid::from_raw(n));
    }
    let u = users::get_user_by_name(name_or_id).ok_or_else(|| anyhow::anyhow!("user not found: {name_or_id}"))?;
    Ok(Uid::from_raw(u.uid()))
}

fn resolve_gid(name_or_id: &str) -> anyhow::Result<Gid> {
    if let Ok(n) = name_or_id.parse::<u32>() {
        return Ok(Gid::from_raw(n));
    }
    let g = users::get_group_by_name(name_or_id).ok_or_else(|| anyhow::anyhow!("group not found: {name_or_id}"))?;
    Ok(Gid::from_raw(g.gid()))
}

fn to_pid(pid: u32) -> anyhow::Result<Pid> {
    let raw = i32::try_from(pid).map_err(|_| anyhow::anyhow!("pid out of range: {pid}"))?;
    anyhow::ensure!(raw > 0, "refusing to signal pid {pid}");
    Ok(Pid::from_raw(raw))
}

/// Builds the command in a fresh session with the watch's directory, environment and
/// credentials. uid/gid are resolved in the parent; the child only calls setgid/setuid.
fn build_command(launch: &Launch<'_>) -> anyhow::Result<Command> {
    let program = launch
        .argv
        .first()
        .ok_or_else(|| anyhow::anyhow!("empty argv"))?;
    let uid = launch.uid.map(resolve_uid).transpose()?;
    let gid = launch.gid.map(resolve_gid).transpose()?;

    let mut cmd = Command::new(program);
    cmd.args(&launch.argv[1..]);
    if let Some(dir) = launch.dir {
        anyhow::ensure!(
            dir.is_dir(),
            "working directory {} does not exist",
            dir.display()
        );
        cmd.current_dir(dir);
    }
    cmd.envs(launch.env);
    cmd.stdin(Stdio::null());

    unsafe {
        cmd.pre_exec(move || {
            let _ = setsid();
            // Group first: after setuid we may no longer be allowed to change it.
            if let Some(gid) = gid {
                nix::unistd::setgid(gid)?;
            }
            if let Some(uid) = uid {
                nix::unistd::setuid(uid)?;
            }
            Ok(())
        });
    }
    Ok(cmd)
}

impl ProcessControl for SystemControl {
    fn spawn(&self, launch: &Launch<'_>, exits: ExitSender) -> anyhow::Result<u32> {
        let mut cmd = build_command(launch)?;
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "spawn argv={:?} cwd={}",
                launch.argv,
                launch.dir.map(|d| d.display().to_string()).unwrap_or_else(|| ".".to_string())
            )
        })?;
        let pid = child.id();
        std::thread::Builder::new()
            .name(format!("wait-{pid}"))
            .spawn(move || {
                let cause = match child.wait() {
                    Ok(st) => ExitCause::from(st),
                    Err(_) => ExitCause::Vanished,
                };
                let _ = exits.send(ProcessExit { pid, cause });
            })
            .context("spawn exit waiter thread")?;
        Ok(pid)
    }

    fn run(&self, launch: &Launch<'_>, timeout: Duration) -> anyhow::Result<()> {
        let mut cmd = build_command(launch)?;
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn argv={:?}", launch.argv))?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(st) = child.try_wait()? {
                anyhow::ensure!(st.success(), "{:?} failed: {}", launch.argv, ExitCause::from(st));
                return Ok(());
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("{:?} timed out after {}ms", launch.argv, timeout.as_millis());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()> {
        kill(to_pid(pid)?, signal).with_context(|| format!("kill pid={pid} sig={signal}"))
    }

    fn force_kill(&self, pid: u32) -> anyhow::Result<()> {
        let p = to_pid(pid)?;
        // The child is a session leader, so its pid is also its process group.
        match killpg(p, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(_) => kill(p, Signal::SIGKILL).with_context(|| format!("kill pid={pid} sig=SIGKILL")),
        }
    }

    fn is_running(&self, pid: u32) -> bool {
        let Ok(p) = to_pid(pid) else {
            return false;
        };
        match kill(p, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn usage(&self, pid: u32) -> Option<Usage> {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        let sp = SysPid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sp]), true);
        system.process(sp).map(|p| Usage {
            memory_bytes: p.memory(),
            cpu_percent: p.cpu_usage(),
        })
    }
}
