// src/main.rs

//! The main entry point for the Beryl controller daemon.

use anyhow::Result;
use beryld::config::Config;
use beryld::core::lifecycle::{daemonize, pidfile};
use beryld::server;
use std::env;
use std::fs::File;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
Usage: beryld [OPTIONS]
  -c         cold start: ignore all saved state
  -d         run as a daemon (default)
  -D         run in the foreground
  -f <file>  configuration file path (default beryl.toml)
  -i         ignore an existing pidfile
  -L <file>  write log output to <file>
  -r         warm start: recover jobs and node admin state (default)
  -R         full state recovery
  -v         increase verbosity (repeatable)
  -V         print version and exit
  -h         this message";

struct Options {
    config_path: String,
    log_file: Option<String>,
    recovery: u8,
    daemonize: bool,
    ignore_pidfile: bool,
    verbosity: u8,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options {
        config_path: "beryl.toml".to_string(),
        log_file: None,
        recovery: 1,
        daemonize: true,
        ignore_pidfile: false,
        verbosity: 0,
    };
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" => opts.recovery = 0,
            "-r" => opts.recovery = 1,
            "-R" => opts.recovery = 2,
            "-d" => opts.daemonize = true,
            "-D" => opts.daemonize = false,
            "-i" => opts.ignore_pidfile = true,
            "-v" => opts.verbosity += 1,
            "-f" => {
                opts.config_path = iter
                    .next()
                    .ok_or_else(|| "-f requires a file path".to_string())?
                    .clone();
            }
            "-L" => {
                opts.log_file = Some(
                    iter.next()
                        .ok_or_else(|| "-L requires a file path".to_string())?
                        .clone(),
                );
            }
            "-V" => {
                println!("beryld version {VERSION}");
                std::process::exit(0);
            }
            "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => return Err(format!("unknown option '{other}'")),
        }
    }
    Ok(opts)
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let opts = match parse_args(&args) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    // The configuration must parse before anything else happens; the
    // daemon cannot run without it.
    let config = match Config::from_file(&opts.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!(
                "Failed to load configuration from \"{}\": {e:#}",
                opts.config_path
            );
            std::process::exit(1);
        }
    };

    // Wait out any previous instance, then daemonise before the runtime
    // exists (forking a threaded runtime is not an option).
    if let Err(e) = pidfile::kill_old_instance(&config.pidfile, opts.ignore_pidfile) {
        eprintln!("pidfile check failed: {e:#}");
        std::process::exit(1);
    }
    if opts.daemonize
        && let Err(e) = daemonize::daemonize()
    {
        eprintln!("daemonize failed: {e:#}");
        std::process::exit(1);
    }
    let _pidfile = match pidfile::create_pidfile(&config.pidfile) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    // Logging with a reloadable filter: SIGUSR2 and reconfigure can
    // change the level at runtime.
    let level = match opts.verbosity {
        0 => env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match &opts.log_file {
        Some(path) => {
            let file = match File::create(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("cannot open log file '{path}': {e}");
                    std::process::exit(1);
                }
            };
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
                .init();
        }
    }
    let reload_handle = Arc::new(reload_handle);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot build the async runtime: {e}");
            std::process::exit(1);
        }
    };

    let pidfile_path = config.pidfile.clone();
    let result = runtime.block_on(server::run(
        config,
        opts.config_path.clone(),
        opts.recovery,
        Some(reload_handle),
    ));
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    pidfile::remove_pidfile(&pidfile_path);

    match result {
        Ok(true) => std::process::abort(),
        Ok(false) => std::process::exit(0),
        Err(e) => {
            error!("controller runtime error: {e:#}");
            std::process::exit(1);
        }
    }
}
