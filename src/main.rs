use std::panic::{self, AssertUnwindSafe};
use std::process;

use anyhow::Context;
use tracing::{error, info};

use redis_clone::config::Config;
use redis_clone::{server, threaded};

const USAGE: &str = "usage: redis-clone [--mode={eventloop|threaded}] [--port=N] [N]";

#[derive(Clone, Copy, Debug, PartialEq)]
enum Mode {
    EventLoop,
    Threaded,
}

struct CliArgs {
    mode: Mode,
    port: Option<u16>,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut mode = Mode::EventLoop;
    let mut port = None;
    for arg in args {
        if let Some(value) = arg.strip_prefix("--mode=") {
            mode = match value {
                "eventloop" => Mode::EventLoop,
                "threaded" => Mode::Threaded,
                other => return Err(format!("unknown mode '{other}'")),
            };
        } else if let Some(value) = arg.strip_prefix("--port=") {
            port = Some(
                value
                    .parse()
                    .map_err(|_| format!("invalid port '{value}'"))?,
            );
        } else if arg.starts_with('-') {
            return Err(format!("unrecognized flag '{arg}'"));
        } else {
            port = Some(arg.parse().map_err(|_| format!("invalid port '{arg}'"))?);
        }
    }
    Ok(CliArgs { mode, port })
}

fn main() {
    process::exit(real_main());
}

fn real_main() -> i32 {
    tracing_subscriber::fmt::init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            return 1;
        }
    };

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    info!(
        port = config.port,
        pid = process::id(),
        mode = ?args.mode,
        "starting redis-clone"
    );

    let result = panic::catch_unwind(AssertUnwindSafe(|| match args.mode {
        Mode::EventLoop => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build runtime")?;
            runtime.block_on(server::run(config))
        }
        Mode::Threaded => threaded::run(config),
    }));

    match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!(error = %e, "fatal error");
            1
        }
        Err(_) => {
            error!("unknown fatal error");
            2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(parts: &[&str]) -> Result<CliArgs, String> {
        parse_args(parts.iter().map(|s| s.to_string()))
    }

    #[test]
    fn no_args_defaults_to_event_loop() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.mode, Mode::EventLoop);
        assert!(args.port.is_none());
    }

    #[test]
    fn mode_flag_selects_threaded() {
        assert_eq!(parse(&["--mode=threaded"]).unwrap().mode, Mode::Threaded);
    }

    #[test]
    fn unknown_mode_is_an_error() {
        assert!(parse(&["--mode=forking"]).is_err());
    }

    #[test]
    fn port_flag_and_positional_port_both_work() {
        assert_eq!(parse(&["--port=7000"]).unwrap().port, Some(7000));
        assert_eq!(parse(&["7000"]).unwrap().port, Some(7000));
    }

    #[test]
    fn invalid_port_is_an_error() {
        assert!(parse(&["--port=banana"]).is_err());
        assert!(parse(&["99999"]).is_err());
    }

    #[test]
    fn unrecognized_flag_is_an_error() {
        assert!(parse(&["--daemonize"]).is_err());
    }
}
