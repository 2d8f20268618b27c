use crate::nw::command::print_commands;
use crate::nw::config;
use crate::nw::rpc::{self, Completion};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
/// No response: the daemon could not be reached or hung up early.
pub const EXIT_NO_RESPONSE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "nwctl", version, about = "nightwatch control client")]
pub struct NwctlArgs {
    /// Unix socket path to the nightwatch daemon
    #[arg(short = 's', long = "sock", env = "NWCTL_SOCK")]
    pub sock: Option<PathBuf>,

    /// List the commands the daemon understands
    #[arg(long = "commands")]
    pub list_commands: bool,

    /// Command and its arguments, e.g. `status web`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn resolve_sock(args: &NwctlArgs) -> PathBuf {
    args.sock
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(config::default_socket)
}

/// Runs one invocation and returns the process exit code.
pub fn execute(args: &NwctlArgs, out: &mut dyn Write, err: &mut dyn Write) -> io::Result<u8> {
    if args.list_commands {
        print_commands(out)?;
        return Ok(EXIT_OK);
    }
    if args.command.is_empty() {
        writeln!(err, "usage: nwctl [-s SOCKET] <command> [args...]")?;
        writeln!(err)?;
        print_commands(err)?;
        return Ok(EXIT_NO_RESPONSE);
    }

    let sock = resolve_sock(args);
    let reply = match rpc::client_call(&sock, &args.command.join(" ")) {
        Ok(r) => r,
        Err(e) => {
            writeln!(err, "nwctl: {e:#}")?;
            return Ok(EXIT_NO_RESPONSE);
        }
    };
    for line in &reply.lines {
        writeln!(out, "{line}")?;
    }
    Ok(match reply.completion {
        Completion::Ok => EXIT_OK,
        Completion::Failed => EXIT_FAILED,
        Completion::Rejected(msg) => {
            writeln!(err, "nwctl: {msg}")?;
            EXIT_FAILED
        }
    })
}

pub fn run() -> anyhow::Result<ExitCode> {
    let args = NwctlArgs::parse();
    let code = execute(&args, &mut io::stdout().lock(), &mut io::stderr().lock())?;
    Ok(ExitCode::from(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_words_are_collected() {
        let args = NwctlArgs::try_parse_from(["nwctl", "-s", "/tmp/nw.sock", "status", "web"]).unwrap();
        assert_eq!(resolve_sock(&args), PathBuf::from("/tmp/nw.sock"));
        assert_eq!(args.command, vec!["status", "web"]);
    }

    #[test]
    fn commands_flag_prints_the_table() {
        let args = NwctlArgs::try_parse_from(["nwctl", "--commands"]).unwrap();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        assert_eq!(execute(&args, &mut out, &mut err).unwrap(), EXIT_OK);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("  quit"));
        assert!(err.is_empty());
    }

    #[test]
    fn unreachable_daemon_is_no_response() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("nw.sock");
        let args = NwctlArgs::try_parse_from(["nwctl", "-s", sock.to_str().unwrap(), "ping"]).unwrap();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        assert_eq!(execute(&args, &mut out, &mut err).unwrap(), EXIT_NO_RESPONSE);
        assert!(String::from_utf8(err).unwrap().contains("nw.sock"));
    }
}
