use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use tenant_routing_cni::config::{Args, Command, NetConf};
use tenant_routing_cni::{CNI_VERSION, Result, add, check, delete, version};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_DIR: &str = "/var/log/tenant-routing-cni";

fn main() -> ExitCode {
    let _guard = setup_logging();
    let args = Args::parse();
    let resp = match args.command {
        Command::Add => match parse_input() {
            Ok(conf) => add::add(&args, conf),
            Err(e) => e.into_response(CNI_VERSION),
        },
        Command::Check => match parse_input() {
            Ok(conf) => check::check(&args, conf),
            Err(e) => e.into_response(CNI_VERSION),
        },
        Command::Delete => delete::delete(&args, &read_raw()),
        Command::Version => version::version(),
    };

    resp.write_out()
}

fn parse_input() -> Result<NetConf> {
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf)?;
    NetConf::parse(&buf)
}

fn read_raw() -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
        warn!(%e, "failed to read stdin");
    }
    buf
}

// Stdout carries the CNI result, so logs go to a rolling file, or stderr if
// the log directory is unusable.
fn setup_logging() -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tenant_routing_cni=info".into());
    match std::fs::create_dir_all(LOG_DIR) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(LOG_DIR, "cni.log");
            let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(nonblocking))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}
