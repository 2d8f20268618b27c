use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

pub const TRAILER_OK: &str = "+OK";
pub const TRAILER_ERR: &str = "-ERR";
/// Leads every data line on the wire; trailers never start with it.
pub const DATA_PREFIX: char = ' ';

/// Last line of every response on the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The handler succeeded.
    Ok,
    /// The handler ran and reported failure.
    Failed,
    /// The line was not a valid command; carries the parse error.
    Rejected(String),
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Ok => f.write_str(TRAILER_OK),
            Completion::Failed => f.write_str(TRAILER_ERR),
            Completion::Rejected(msg) => write!(f, "{TRAILER_ERR} {msg}"),
        }
    }
}

pub fn parse_trailer(line: &str) -> Option<Completion> {
    if line == TRAILER_OK {
        return Some(Completion::Ok);
    }
    if line == TRAILER_ERR {
        return Some(Completion::Failed);
    }
    line.strip_prefix("-ERR ")
        .map(|msg| Completion::Rejected(msg.to_string()))
}

/// Appends `line` to `buf` as data lines. Embedded newlines start a new data line.
pub fn push_data_line(buf: &mut String, line: &str) {
    let mut parts = line.split('\n').peekable();
    while let Some(part) = parts.next() {
        let part = part.strip_suffix('\r').unwrap_or(part);
        if part.is_empty() && parts.peek().is_none() && line.ends_with('\n') {
            break;
        }
        buf.push(DATA_PREFIX);
        buf.push_str(part);
        buf.push('\n');
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub completion: Completion,
}

/// Sends one command line and collects the response up to its trailer.
pub fn client_call(sock: &Path, command: &str) -> anyhow::Result<Reply> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!(
            "failed to connect to nightwatch socket {}: {e}",
            sock.display()
        )
    })?;

    let line = command.trim_end().to_string() + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let reader = BufReader::new(stream);
    let mut lines = Vec::new();
    for l in reader.lines() {
        let l = l?;
        if let Some(data) = l.strip_prefix(DATA_PREFIX) {
            lines.push(data.to_string());
            continue;
        }
        match parse_trailer(&l) {
            Some(completion) => return Ok(Reply { lines, completion }),
            None => anyhow::bail!("malformed response line from daemon: {l:?}"),
        }
    }
    anyhow::bail!("connection closed before the daemon finished responding")
}
