use crate::nw::build_info;
use crate::nw::daemon::Daemon;
use crate::nw::state::State;
use crate::nw::watch::Watch;
use chrono::{Local, TimeZone as _};
use std::fmt;
use std::io;
use tracing::{debug, error};

/// Sink for response lines. Returns false when the peer can no longer be written to.
pub trait Sender {
    fn send(&mut self, line: fmt::Arguments<'_>) -> bool;
}

impl Sender for Vec<String> {
    fn send(&mut self, line: fmt::Arguments<'_>) -> bool {
        self.push(line.to_string());
        true
    }
}

pub type Handler = fn(&mut dyn Sender, &[&str], &Daemon) -> bool;

pub struct Command {
    pub name: &'static str,
    pub handler: Handler,
    /// Arguments required after the command name.
    pub min_args: usize,
    pub description: &'static str,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    EmptyInput,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("command '{command}' requires at least {min_args} argument(s)")]
    InsufficientArgs {
        command: &'static str,
        min_args: usize,
    },
}

pub static COMMANDS: &[Command] = &[
    Command {
        name: "ping",
        handler: handle_ping,
        min_args: 0,
        description: "ping the nightwatch daemon",
    },
    Command {
        name: "version",
        handler: handle_version,
        min_args: 0,
        description: "request the daemon version",
    },
    Command {
        name: "watches",
        handler: handle_watches,
        min_args: 0,
        description: "get the list of watches",
    },
    Command {
        name: "start",
        handler: handle_start,
        min_args: 1,
        description: "start the specified watch",
    },
    Command {
        name: "stop",
        handler: handle_stop,
        min_args: 1,
        description: "stop the specified watch",
    },
    Command {
        name: "restart",
        handler: handle_restart,
        min_args: 1,
        description: "restart the specified watch",
    },
    Command {
        name: "status",
        handler: handle_status,
        min_args: 1,
        description: "request the watch's status",
    },
    Command {
        name: "history",
        handler: handle_history,
        min_args: 1,
        description: "get the latest events of the specified watch",
    },
    Command {
        name: "config",
        handler: handle_config,
        min_args: 1,
        description: "get the configuration of the specified watch",
    },
    Command {
        name: "reload",
        handler: handle_reload,
        min_args: 0,
        description: "reload the configuration file",
    },
    Command {
        name: "terminate",
        handler: handle_terminate,
        min_args: 0,
        description: "terminate the daemon",
    },
    Command {
        name: "quit",
        handler: handle_quit,
        min_args: 0,
        description: "stop the daemon and all watched processes",
    },
];

/// First entry of `table` whose name is a prefix of `token`; table order breaks ties.
fn find_command<'t>(table: &'t [Command], token: &str) -> Option<&'t Command> {
    table.iter().find(|c| token.starts_with(c.name))
}

/// Maps tokens to a command; the first entry whose name is a prefix of the first token wins.
pub fn parse_command(tokens: &[&str]) -> Result<&'static Command, ParseError> {
    let first = *tokens.first().ok_or(ParseError::EmptyInput)?;
    let cmd = find_command(COMMANDS, first)
        .ok_or_else(|| ParseError::UnknownCommand(first.to_string()))?;
    let args = tokens.len() - 1;
    if args < cmd.min_args {
        error!(
            "command={} expects at least {} argument(s), got {args}",
            cmd.name, cmd.min_args
        );
        return Err(ParseError::InsufficientArgs {
            command: cmd.name,
            min_args: cmd.min_args,
        });
    }
    Ok(cmd)
}

/// Tokenizes one request line and runs its handler. `Ok(false)` is a handler failure.
pub fn dispatch(line: &str, sender: &mut dyn Sender, daemon: &Daemon) -> Result<bool, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let cmd = parse_command(&tokens)?;
    debug!("command={} args={:?}", cmd.name, &tokens[1..]);
    Ok((cmd.handler)(sender, &tokens, daemon))
}

/// Help table: each name padded to the longest name plus two.
pub fn print_commands(out: &mut dyn io::Write) -> io::Result<()> {
    let pad = COMMANDS.iter().map(|c| c.name.len()).max().unwrap_or(0) + 2;
    for cmd in COMMANDS {
        writeln!(out, "  {:<pad$}{}", cmd.name, cmd.description)?;
    }
    Ok(())
}

fn unknown_watch(cb: &mut dyn Sender, name: &str) -> bool {
    cb.send(format_args!("unknown watch '{name}'"));
    false
}

fn handle_status_change(cb: &mut dyn Sender, input: &[&str], daemon: &Daemon, state: State) -> bool {
    let name = input[1];
    let Some(ws) = daemon.registry().get(name) else {
        return unknown_watch(cb, name);
    };
    ws.request(state);
    cb.send(format_args!("requested {state} for watch '{name}'"));
    true
}

fn handle_ping(cb: &mut dyn Sender, _input: &[&str], _daemon: &Daemon) -> bool {
    cb.send(format_args!("pong"))
}

fn handle_version(cb: &mut dyn Sender, _input: &[&str], _daemon: &Daemon) -> bool {
    cb.send(format_args!("{}", build_info::VERSION))
}

fn handle_watches(cb: &mut dyn Sender, _input: &[&str], daemon: &Daemon) -> bool {
    for name in daemon.registry().names() {
        cb.send(format_args!("{name}"));
    }
    true
}

fn handle_start(cb: &mut dyn Sender, input: &[&str], daemon: &Daemon) -> bool {
    handle_status_change(cb, input, daemon, State::Starting)
}

fn handle_stop(cb: &mut dyn Sender, input: &[&str], daemon: &Daemon) -> bool {
    handle_status_change(cb, input, daemon, State::Stopping)
}

fn handle_restart(cb: &mut dyn Sender, input: &[&str], daemon: &Daemon) -> bool {
    handle_status_change(cb, input, daemon, State::Restarting)
}

fn handle_status(cb: &mut dyn Sender, input: &[&str], daemon: &Daemon) -> bool {
    let name = input[1];
    let Some(ws) = daemon.registry().get(name) else {
        return unknown_watch(cb, name);
    };
    let status = ws.status();
    if status.state == State::Running && status.pid > 0 {
        cb.send(format_args!("{name}: {} (PID {})", status.state, status.pid));
    } else {
        cb.send(format_args!("{name}: {}", status.state));
    }
    true
}

fn handle_history(cb: &mut dyn Sender, input: &[&str], daemon: &Daemon) -> bool {
    let name = input[1];
    let Some(ws) = daemon.registry().get(name) else {
        return unknown_watch(cb, name);
    };
    for entry in ws.history().entries_newest_first() {
        let Some(at) = Local.timestamp_opt(entry.timestamp, 0).single() else {
            continue;
        };
        if !cb.send(format_args!("{}: {}", at.format("%Y-%m-%dT%H:%M:%S"), entry.value)) {
            break;
        }
    }
    true
}

fn send_strings(cb: &mut dyn Sender, label: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    cb.send(format_args!("{label}:"));
    for v in values {
        cb.send(format_args!("  '{v}'"));
    }
}

fn send_config(cb: &mut dyn Sender, watch: &Watch) {
    cb.send(format_args!("name: {}", watch.name));
    send_strings(cb, "start", &watch.start);
    send_strings(cb, "stop", &watch.stop);
    if watch.stop_timeout > 0 {
        cb.send(format_args!("stop_timeout: {}", watch.stop_timeout));
    }
    if let Some(dir) = &watch.dir {
        cb.send(format_args!("dir: {}", dir.display()));
    }
    if let Some(uid) = &watch.uid {
        cb.send(format_args!("uid: {uid}"));
    }
    if let Some(gid) = &watch.gid {
        cb.send(format_args!("gid: {gid}"));
    }
    if watch.max_memory > 0 {
        cb.send(format_args!("max_memory: {}", watch.max_memory));
    }
    if watch.max_cpu > 0 {
        cb.send(format_args!("max_cpu: {}", watch.max_cpu));
    }
    if watch.port_check > 0 {
        cb.send(format_args!("port_check: {}", watch.port_check));
    }
    if let Some(http) = &watch.http_check {
        cb.send(format_args!("http_check: {http}"));
        cb.send(format_args!("http_check_method: {}", watch.http_check_method));
        cb.send(format_args!("http_check_port: {}", watch.http_port()));
    }
    if !watch.env.is_empty() {
        cb.send(format_args!("env:"));
        for (key, value) in &watch.env {
            cb.send(format_args!("  {key}: {value}"));
        }
    }
}

fn handle_config(cb: &mut dyn Sender, input: &[&str], daemon: &Daemon) -> bool {
    let name = input[1];
    let Some(ws) = daemon.registry().get(name) else {
        return unknown_watch(cb, name);
    };
    send_config(cb, &ws.watch());
    true
}

fn handle_reload(cb: &mut dyn Sender, _input: &[&str], daemon: &Daemon) -> bool {
    if daemon.config_file().is_none() {
        cb.send(format_args!("no config file to reload"));
        return false;
    }
    if !daemon.request_reload() {
        cb.send(format_args!("reload is not available while shutting down"));
        return false;
    }
    cb.send(format_args!("ok"));
    true
}

fn handle_terminate(cb: &mut dyn Sender, _input: &[&str], daemon: &Daemon) -> bool {
    daemon.terminate();
    cb.send(format_args!("ok"));
    true
}

fn handle_quit(cb: &mut dyn Sender, input: &[&str], daemon: &Daemon) -> bool {
    for ws in daemon.registry().all() {
        if ws.state() != State::Stopped {
            ws.request(State::Stopping);
        }
    }
    handle_terminate(cb, input, daemon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nw::config::DaemonConfig;
    use crate::nw::testing::{wait_until, FakeControl};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixture {
        daemon: Arc<Daemon>,
        control: Arc<FakeControl>,
    }

    fn fixture(config_file: Option<PathBuf>) -> Fixture {
        let control = Arc::new(FakeControl::new());
        let (daemon, events) = Daemon::new(&DaemonConfig::default(), config_file, control.clone());
        daemon.start_background(events);
        Fixture { daemon, control }
    }

    fn run(f: &Fixture, line: &str) -> (Result<bool, ParseError>, Vec<String>) {
        let mut out = Vec::new();
        let r = dispatch(line, &mut out, &f.daemon);
        (r, out)
    }

    fn manual(name: &str) -> Watch {
        let mut w = Watch::new(name, vec!["/bin/sleep".into(), "1000".into()]);
        w.autostart = false;
        w
    }

    #[test]
    fn table_order_and_lookup() {
        let names: Vec<&str> = COMMANDS.iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec![
                "ping", "version", "watches", "start", "stop", "restart", "status", "history",
                "config", "reload", "terminate", "quit"
            ]
        );
        assert_eq!(parse_command(&["status", "web"]).unwrap().name, "status");
        assert_eq!(parse_command(&[]).unwrap_err(), ParseError::EmptyInput);
        assert_eq!(
            parse_command(&["stat", "web"]).unwrap_err(),
            ParseError::UnknownCommand("stat".to_string())
        );
    }

    #[test]
    fn registered_name_matches_as_a_prefix_of_the_token() {
        assert_eq!(parse_command(&["statusx", "web"]).unwrap().name, "status");
        assert_eq!(parse_command(&["stopall", "web"]).unwrap().name, "stop");
        assert_eq!(parse_command(&["pingpong"]).unwrap().name, "ping");
        assert_eq!(
            parse_command(&["stopall"]).unwrap_err(),
            ParseError::InsufficientArgs {
                command: "stop",
                min_args: 1
            }
        );
    }

    #[test]
    fn overlapping_names_resolve_in_table_order() {
        fn entry(name: &'static str) -> Command {
            Command {
                name,
                handler: handle_ping,
                min_args: 0,
                description: "",
            }
        }
        let short_first = [entry("stat"), entry("status")];
        assert_eq!(find_command(&short_first, "status").unwrap().name, "stat");
        assert_eq!(find_command(&short_first, "stat").unwrap().name, "stat");

        let long_first = [entry("status"), entry("stat")];
        assert_eq!(find_command(&long_first, "status").unwrap().name, "status");
        assert_eq!(find_command(&long_first, "statu").unwrap().name, "stat");
        assert!(find_command(&long_first, "sta").is_none());
    }

    #[test]
    fn missing_argument_is_rejected_before_the_handler() {
        let err = parse_command(&["start"]).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientArgs {
                command: "start",
                min_args: 1
            }
        );
        assert_eq!(err.to_string(), "command 'start' requires at least 1 argument(s)");
    }

    #[test]
    fn help_table_is_padded() {
        let mut buf = Vec::new();
        print_commands(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), COMMANDS.len());
        assert_eq!(lines[0], "  ping       ping the nightwatch daemon");
        assert_eq!(lines[10], "  terminate  terminate the daemon");
    }

    #[tokio::test]
    async fn ping_version_and_watches() {
        let f = fixture(None);
        f.daemon.register(manual("b")).unwrap();
        f.daemon.register(manual("a")).unwrap();
        assert_eq!(run(&f, "ping"), (Ok(true), vec!["pong".to_string()]));
        assert_eq!(run(&f, "version").1, vec![build_info::VERSION.to_string()]);
        assert_eq!(run(&f, "  watches  ").1, vec!["b", "a"]);
        assert_eq!(run(&f, "").0, Err(ParseError::EmptyInput));
    }

    #[tokio::test]
    async fn unknown_watch_fails() {
        let f = fixture(None);
        for cmd in ["start", "stop", "restart", "status", "history", "config"] {
            let (r, out) = run(&f, &format!("{cmd} foo"));
            assert_eq!(r, Ok(false), "{cmd}");
            assert_eq!(out, vec!["unknown watch 'foo'"]);
        }
        let (r, out) = run(&f, "start");
        assert!(matches!(r, Err(ParseError::InsufficientArgs { .. })));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn start_then_status_shows_pid() {
        let f = fixture(None);
        let ws = f.daemon.register(manual("myapp")).unwrap();
        wait_until("unmonitored", || ws.state() == State::Unmonitored).await;
        assert_eq!(run(&f, "status myapp").1, vec!["myapp: unmonitored"]);
        let (r, out) = run(&f, "start myapp");
        assert_eq!(r, Ok(true));
        assert_eq!(out, vec!["requested starting for watch 'myapp'"]);
        wait_until("running", || ws.state() == State::Running).await;
        let pid = ws.pid();
        assert_eq!(run(&f, "status myapp").1, vec![format!("myapp: running (PID {pid})")]);

        run(&f, "stop myapp");
        wait_until("stopped", || ws.state() == State::Stopped).await;
        assert_eq!(run(&f, "status myapp").1, vec!["myapp: stopped"]);
        assert_eq!(f.control.spawned().len(), 1);
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let f = fixture(None);
        let ws = f.daemon.register(manual("myapp")).unwrap();
        wait_until("unmonitored", || ws.state() == State::Unmonitored).await;
        ws.push_history_at(1_700_000_000, State::Starting);
        ws.push_history_at(1_700_000_001, State::Running);
        ws.push_history_at(1_700_000_002, State::Stopping);
        let (r, out) = run(&f, "history myapp");
        assert_eq!(r, Ok(true));
        assert_eq!(out.len(), 4);
        let expect = |ts: i64, s: &str| {
            let at = Local.timestamp_opt(ts, 0).single().unwrap();
            format!("{}: {s}", at.format("%Y-%m-%dT%H:%M:%S"))
        };
        assert_eq!(out[0], expect(1_700_000_002, "stopping"));
        assert_eq!(out[1], expect(1_700_000_001, "running"));
        assert_eq!(out[2], expect(1_700_000_000, "starting"));
        assert!(out[3].ends_with(": unmonitored"));
        for line in &out {
            let (stamp, _) = line.split_at(19);
            assert!(chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S").is_ok());
        }
    }

    #[tokio::test]
    async fn config_dump() {
        let f = fixture(None);
        let mut w = manual("web");
        w.stop = vec!["/bin/kill-web".into()];
        w.dir = Some("/srv/web".into());
        w.uid = Some("www".into());
        w.max_cpu = 80;
        w.http_check = Some("/health".into());
        w.env.insert("MODE".into(), "prod".into());
        f.daemon.register(w).unwrap();
        let (r, out) = run(&f, "config web");
        assert_eq!(r, Ok(true));
        assert_eq!(
            out,
            vec![
                "name: web",
                "start:",
                "  '/bin/sleep'",
                "  '1000'",
                "stop:",
                "  '/bin/kill-web'",
                "stop_timeout: 5",
                "dir: /srv/web",
                "uid: www",
                "max_cpu: 80",
                "http_check: /health",
                "http_check_method: GET",
                "http_check_port: 80",
                "env:",
                "  MODE: prod",
            ]
        );
    }

    #[tokio::test]
    async fn reload_without_config_file_fails() {
        let f = fixture(None);
        assert_eq!(
            run(&f, "reload"),
            (Ok(false), vec!["no config file to reload".to_string()])
        );
    }

    #[tokio::test]
    async fn terminate_calls_the_hook() {
        let f = fixture(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        assert!(f.daemon.set_terminate_hook(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(run(&f, "terminate"), (Ok(true), vec!["ok".to_string()]));
        assert!(f.daemon.is_shutting_down());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn quit_stops_only_running_watches() {
        let f = fixture(None);
        let up = f.daemon.register(manual("up")).unwrap();
        let down = f.daemon.register(manual("down")).unwrap();
        up.request(State::Starting);
        down.request(State::Starting);
        wait_until("both running", || {
            up.state() == State::Running && down.state() == State::Running
        })
        .await;
        down.request(State::Stopping);
        wait_until("down stopped", || down.state() == State::Stopped).await;
        let down_history = down.history().len();
        let up_pid = up.pid();

        assert_eq!(run(&f, "quit"), (Ok(true), vec!["ok".to_string()]));
        assert!(f.daemon.is_shutting_down());
        wait_until("up stopped", || up.state() == State::Stopped).await;
        assert_eq!(down.history().len(), down_history);
        assert!(f
            .control
            .signals()
            .iter()
            .any(|(pid, sig)| *pid == up_pid && *sig == nix::sys::signal::Signal::SIGTERM));
    }
}
