//! `heron_helper`, the per-segment backup/restore data-plane agent.
//!
//! Exit codes: 0 success, 1 usage error, 2 terminated by signal, 3 fatal
//! helper error (the `<pipe-file>_error` sentinel is written).

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, warn};

use heron_helper::{
    run_backup_agent, run_restore_agent, AgentKind, HelperConfig, HelperState,
};

#[derive(Debug, Parser)]
#[command(
    name = "heron_helper",
    about = "Per-segment helper agent for Heron backup and restore",
    version,
    disable_version_flag = true
)]
struct Args {
    /// Run as an agent for backup
    #[arg(long, conflicts_with = "restore_agent")]
    backup_agent: bool,

    /// Run as an agent for restore
    #[arg(long)]
    restore_agent: bool,

    /// Content id of the corresponding segment
    #[arg(long, default_value_t = -2, allow_hyphen_values = true)]
    content: i32,

    /// Gzip compression level; 0 means no compression
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=9))]
    compression_level: u32,

    /// Absolute path to the consolidated data file (or per-oid prefix)
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Absolute path to the file listing oids to back up or restore
    #[arg(long)]
    oid_file: Option<PathBuf>,

    /// Absolute path prefix for the pipe files (`<prefix>_<oid>`)
    #[arg(long)]
    pipe_file: Option<PathBuf>,

    /// Absolute path to the data table of contents file
    #[arg(long)]
    toc_file: Option<PathBuf>,

    /// Configuration file for a storage plugin
    #[arg(long)]
    plugin_config: Option<PathBuf>,

    /// Restore only the oids in the oid file (table/schema filters)
    #[arg(long)]
    with_filters: bool,

    /// How many table copies to keep queued ahead of the database
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    copy_prefetch: u64,

    /// Continue the restore when individual table copies fail
    #[arg(long)]
    on_error_continue: bool,

    /// All tables share one consolidated data file
    #[arg(long)]
    single_data_file: bool,

    /// Print the version number and exit
    #[arg(long)]
    version: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ClapErrorKind::DisplayHelp) => {
            print!("{}", e);
            exit(0);
        }
        Err(e) => {
            eprint!("{}", e);
            exit(1);
        }
    };

    if args.version {
        println!("heron_helper version {}", env!("CARGO_PKG_VERSION"));
        exit(0);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let agent = match (args.backup_agent, args.restore_agent) {
        (true, false) => AgentKind::Backup,
        (false, true) => AgentKind::Restore,
        _ => {
            eprintln!("exactly one of --backup-agent and --restore-agent is required");
            exit(1);
        }
    };
    if args.on_error_continue && agent != AgentKind::Restore {
        eprintln!("--on-error-continue can only be used with --restore-agent");
        exit(1);
    }
    if args.with_filters && agent != AgentKind::Restore {
        eprintln!("--with-filters can only be used with --restore-agent");
        exit(1);
    }
    if args.plugin_config.is_some() && !args.single_data_file {
        eprintln!("--plugin-config requires --single-data-file");
        exit(1);
    }

    let require = |path: Option<PathBuf>, flag: &str| -> PathBuf {
        path.unwrap_or_else(|| {
            eprintln!("--{} is required", flag);
            exit(1);
        })
    };
    let data_file = require(args.data_file, "data-file");
    let oid_file = require(args.oid_file, "oid-file");
    let pipe_file = require(args.pipe_file, "pipe-file");
    let toc_file = require(args.toc_file, "toc-file");

    let state = Arc::new(HelperState::new(HelperConfig {
        agent,
        content: args.content,
        compression_level: args.compression_level,
        data_file,
        oid_file,
        pipe_file,
        toc_file,
        plugin_config: args.plugin_config,
        with_filters: args.with_filters,
        copy_prefetch: args.copy_prefetch as usize,
        on_error_continue: args.on_error_continue,
        single_data_file: args.single_data_file,
    }));

    install_signal_handler(state.clone());

    let result = match agent {
        AgentKind::Backup => run_backup_agent(&state),
        AgentKind::Restore => run_restore_agent(&state),
    };

    match result {
        Ok(()) => {
            state.cleanup(false);
            exit(0);
        }
        Err(e) if e.is_termination() => {
            state.cleanup(true);
            exit(2);
        }
        Err(e) => {
            error!(content = state.config.content, "helper agent failed: {}", e);
            state.cleanup(true);
            exit(3);
        }
    }
}

/// One dedicated thread owns signal delivery. It sets the termination
/// flag (waking any parked waits), runs cleanup, and exits 2; the data
/// loop observes the flag at its next check if it gets there first.
fn install_signal_handler(state: Arc<HelperState>) {
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!("unable to install signal handler: {}", e);
            exit(3);
        }
    };
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            warn!(
                content = state.config.content,
                "received a termination signal, aborting helper agent"
            );
            state.termination().terminate();
            state.cleanup(true);
            exit(2);
        }
    });
}
