use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "nightwatch", version, about = "nightwatch process supervisor")]
pub struct Args {
    /// Path to the YAML config (watches + daemon options)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Control socket path (overrides daemon.socket)
    #[arg(short = 's', long = "socket")]
    pub socket: Option<PathBuf>,

    /// Supervise a single command instead of a config file: `nightwatch -- prog args...`
    #[arg(last = true)]
    pub command: Vec<String>,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    crate::nw::logging::init()?;
    crate::nw::daemon::run_daemon(&args)
}
