use crate::nw::build_info;
use crate::nw::cli::Args;
use crate::nw::command;
use crate::nw::config::{self, DaemonConfig};
use crate::nw::process::{ProcessControl, ProcessExit, SystemControl};
use crate::nw::registry::{Registry, RegistryError};
use crate::nw::rpc::{self, Completion};
use crate::nw::state::{dispatch_poll_result, pump_exits, State, Supervision, WatchState};
use crate::nw::tasks::TaskTracker;
use crate::nw::watch::Watch;
use anyhow::Context as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::net::UnixListener as TokioUnixListener;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for supervision loops to finish.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub type TerminateHook = Box<dyn Fn() + Send + Sync>;

/// Receivers the background tasks consume; handed back by `Daemon::new`.
pub struct DaemonEvents {
    exits: mpsc::UnboundedReceiver<ProcessExit>,
    reloads: mpsc::UnboundedReceiver<()>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

/// Process-wide context handed to every command handler.
pub struct Daemon {
    registry: Arc<Registry>,
    supervision: Supervision,
    config_file: Option<PathBuf>,
    poll_interval: Duration,
    shutting_down: Arc<AtomicBool>,
    shutdown_notify: Notify,
    reload_tx: mpsc::UnboundedSender<()>,
    terminate_hook: OnceLock<TerminateHook>,
}

impl Daemon {
    pub fn new(
        cfg: &DaemonConfig,
        config_file: Option<PathBuf>,
        control: Arc<dyn ProcessControl>,
    ) -> (Arc<Daemon>, DaemonEvents) {
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let (reload_tx, reloads) = mpsc::unbounded_channel();
        let shutting_down = Arc::new(AtomicBool::new(false));
        let supervision = Supervision {
            control,
            exits: exits_tx,
            shutting_down: Arc::clone(&shutting_down),
            check_interval: cfg.check_interval,
            history_size: cfg.history_size,
            tasks: TaskTracker::new(),
        };
        let daemon = Arc::new(Daemon {
            registry: Arc::new(Registry::new()),
            supervision,
            config_file,
            poll_interval: cfg.poll_interval,
            shutting_down,
            shutdown_notify: Notify::new(),
            reload_tx,
            terminate_hook: OnceLock::new(),
        });
        (daemon, DaemonEvents { exits, reloads })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Called once from `terminate`. Only the first hook is kept.
    pub fn set_terminate_hook(&self, hook: TerminateHook) -> bool {
        self.terminate_hook.set(hook).is_ok()
    }

    /// Flags shutdown and wakes the server loop; the loops are told to quit by `shutdown_watches`.
    pub fn terminate(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
        if let Some(hook) = self.terminate_hook.get() {
            hook();
        }
    }

    pub fn request_reload(&self) -> bool {
        !self.is_shutting_down() && self.reload_tx.send(()).is_ok()
    }

    /// Registers a watch and asks for its initial state: `STARTING` when autostart is set,
    /// `UNMONITORED` otherwise.
    pub fn register(&self, watch: Watch) -> Result<Arc<WatchState>, RegistryError> {
        if self.registry.get(&watch.name).is_some() {
            return Err(RegistryError::Duplicate(watch.name));
        }
        let autostart = watch.autostart;
        let ws = WatchState::spawn(Arc::new(watch), &self.supervision);
        self.registry.insert(Arc::clone(&ws))?;
        ws.request(if autostart {
            State::Starting
        } else {
            State::Unmonitored
        });
        Ok(ws)
    }

    /// Reconciles the registry against a freshly loaded config.
    pub fn apply_config(&self, cfg: &DaemonConfig) -> ReloadSummary {
        let wanted = config::watches_by_name(cfg);
        let mut summary = ReloadSummary::default();

        for ws in self.registry.all() {
            if !wanted.contains_key(ws.name()) {
                if let Some(ws) = self.registry.remove(ws.name()) {
                    ws.retire();
                    summary.removed.push(ws.name().to_string());
                }
            }
        }

        for watch in &cfg.watches {
            match self.registry.get(&watch.name) {
                Some(ws) => {
                    if *ws.watch() != *watch {
                        ws.rebind(Arc::new(watch.clone()));
                        summary.changed.push(watch.name.clone());
                    }
                }
                None => match self.register(watch.clone()) {
                    Ok(_) => summary.added.push(watch.name.clone()),
                    Err(e) => warn!("reload register failed: {e}"),
                },
            }
        }
        summary
    }

    /// Re-reads the config file. Errors leave the running set untouched.
    pub fn reload(&self) -> anyhow::Result<ReloadSummary> {
        let path = self
            .config_file
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no config file to reload"))?;
        let cfg = config::load_config(path)?;
        Ok(self.apply_config(&cfg))
    }

    /// Starts the exit pump, the liveness poller and the reload listener.
    pub fn start_background(self: &Arc<Self>, events: DaemonEvents) {
        let DaemonEvents { exits, mut reloads } = events;
        tokio::spawn(pump_exits(Arc::clone(&self.registry), exits));

        let daemon = Arc::clone(self);
        tokio::spawn(async move { daemon.poll_liveness().await });

        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            while reloads.recv().await.is_some() {
                match daemon.reload() {
                    Ok(s) => info!(
                        "reload outcome=ok added={:?} removed={:?} changed={:?}",
                        s.added, s.removed, s.changed
                    ),
                    Err(e) => error!("reload outcome=failed err={e:#}"),
                }
            }
        });
    }

    async fn poll_liveness(&self) {
        let period = self.poll_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !self.is_shutting_down() {
            ticker.tick().await;
            for ws in self.registry.all() {
                let status = ws.status();
                if status.state != State::Running || status.pid == 0 {
                    continue;
                }
                let running = self.supervision.control.is_running(status.pid);
                dispatch_poll_result(&self.registry, status.pid, running);
            }
        }
    }

    /// Tells every loop to quit and waits for them, bounded by `grace`.
    pub async fn shutdown_watches(&self, grace: Duration) -> bool {
        self.shutting_down.store(true, Ordering::Relaxed);
        for ws in self.registry.all() {
            ws.request(State::Quit);
        }
        self.supervision.tasks.wait_idle(grace).await
    }

    /// Accepts control connections until shutdown is requested.
    pub async fn serve(self: Arc<Self>, listener: TokioUnixListener) -> anyhow::Result<()> {
        while !self.is_shutting_down() {
            tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, _addr)) => {
                            let daemon = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(daemon, stream).await {
                                    warn!("rpc error: {e:#}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                            tokio::time::sleep(Duration::from_millis(200)).await;
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {}
                // periodic wake so a terminate that raced the notify is still observed
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
        Ok(())
    }
}

/// One request per line. Response lines go out space-prefixed, then a `+OK` / `-ERR` trailer.
async fn handle_connection(daemon: Arc<Daemon>, stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = TokioBufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut out: Vec<String> = Vec::new();
        let completion = match command::dispatch(&line, &mut out, &daemon) {
            Ok(true) => Completion::Ok,
            Ok(false) => Completion::Failed,
            Err(e) => {
                debug!("rpc rejected line={line:?} err={e}");
                Completion::Rejected(e.to_string())
            }
        };
        let mut buf = String::new();
        for l in &out {
            rpc::push_data_line(&mut buf, l);
        }
        buf.push_str(&completion.to_string());
        buf.push('\n');
        write.write_all(buf.as_bytes()).await?;
        write.flush().await?;
    }
    Ok(())
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!(
                "failed to create socket directory {}: {e}",
                parent.display()
            )
        })?;
    }

    if sock.exists() {
        // If something is already listening, fail. Otherwise remove stale socket.
        match UnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "nightwatch already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

/// Binds the control socket, replacing a stale file, and applies `mode`.
pub fn bind_socket(sock: &Path, mode: u32) -> anyhow::Result<TokioUnixListener> {
    prepare_socket(sock)?;
    let listener = TokioUnixListener::bind(sock)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", sock.display()))?;
    fs::set_permissions(sock, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {}", mode, sock.display()))?;
    Ok(listener)
}

fn start_signal_listener(daemon: Arc<Daemon>) -> anyhow::Result<()> {
    let mut term = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut hup = unix_signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("signal=SIGTERM decision=shutdown");
                    daemon.terminate();
                }
                _ = int.recv() => {
                    info!("signal=SIGINT decision=shutdown");
                    daemon.terminate();
                }
                _ = hup.recv() => {
                    info!("signal=SIGHUP decision=reload");
                    if !daemon.request_reload() {
                        warn!("reload ignored: no config file or shutting down");
                    }
                }
            }
        }
    });
    Ok(())
}

/// Turns the command line into a config: either a config file or a single trailing command.
pub fn resolve_config(args: &Args) -> anyhow::Result<(DaemonConfig, Option<PathBuf>)> {
    let (mut cfg, config_file) = match (&args.config, args.command.is_empty()) {
        (Some(_), false) => anyhow::bail!("pass either --config or a command, not both"),
        (Some(path), true) => (config::load_config(path)?, Some(path.clone())),
        (None, false) => {
            let mut cfg = DaemonConfig::default();
            cfg.watches.push(config::single_command_watch(args.command.clone())?);
            (cfg, None)
        }
        (None, true) => {
            anyhow::bail!("nothing to supervise: pass --config FILE or -- COMMAND [ARGS...]")
        }
    };
    if let Some(sock) = &args.socket {
        cfg.socket = sock.clone();
    }
    Ok((cfg, config_file))
}

pub fn run_daemon(args: &Args) -> anyhow::Result<()> {
    let (cfg, config_file) = resolve_config(args)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_daemon_async(cfg, config_file))
}

pub async fn run_daemon_async(cfg: DaemonConfig, config_file: Option<PathBuf>) -> anyhow::Result<()> {
    let sock = cfg.socket.clone();
    let listener = bind_socket(&sock, cfg.socket_mode)?;

    info!("boot {}", build_info::banner());

    let control: Arc<dyn ProcessControl> = Arc::new(SystemControl::new());
    let (daemon, events) = Daemon::new(&cfg, config_file, control);
    daemon.start_background(events);
    start_signal_listener(Arc::clone(&daemon))?;

    for watch in cfg.watches.iter().cloned() {
        daemon.register(watch)?;
    }

    info!("rpc listening sock={} watches={}", sock.display(), daemon.registry().len());
    Arc::clone(&daemon).serve(listener).await?;

    info!("shutdown signal received; stopping supervision");
    if !daemon.shutdown_watches(SHUTDOWN_GRACE).await {
        warn!(
            "shutdown outcome=timeout grace_s={} remaining={}",
            SHUTDOWN_GRACE.as_secs(),
            daemon.supervision.tasks.active_count()
        );
    }
    // Best-effort: remove socket file so clients fail fast until restarted.
    let _ = fs::remove_file(&sock);
    info!("shutdown done");
    Ok(())
}
