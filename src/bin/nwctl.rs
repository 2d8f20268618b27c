use std::process::ExitCode;

fn main() -> ExitCode {
    match nightwatch::nw::ctl_cli::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nwctl: {e:#}");
            ExitCode::from(nightwatch::nw::ctl_cli::EXIT_NO_RESPONSE)
        }
    }
}
