pub mod build_info;
pub mod cli;
pub mod command;
pub mod config;
pub mod ctl_cli;
pub mod daemon;
pub mod history;
pub mod logging;
pub mod probe;
pub mod process;
pub mod registry;
pub mod rpc;
pub mod state;
pub mod tasks;
#[cfg(test)]
pub(crate) mod testing;
pub mod watch;
