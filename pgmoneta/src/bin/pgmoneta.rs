//! Daemon entry point. Parses the small set of process-startup flags
//! pgmoneta itself needs (`-D`/`--config-dir`); the `pgmoneta-cli`
//! management command surface is a separate, external collaborator
//! (spec.md §1 Non-goals) and is not implemented by this binary.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Arg, ArgAction, Command};
use pgmoneta::operations::LiveOperations;
use pgmoneta::shmem::RunningFlag;
use pgmoneta::supervisor::Supervisor;
use pgmoneta::{config, credentials, logging};
use std::sync::Arc;
use tracing::info;

fn cli() -> Command {
    Command::new("pgmoneta")
        .arg(
            Arg::new("config-dir")
                .short('D')
                .long("config-dir")
                .action(ArgAction::Set)
                .help("directory containing pgmoneta.toml"),
        )
        .arg(
            Arg::new("users-path")
                .short('u')
                .long("users")
                .action(ArgAction::Set)
                .help("path to the pgmoneta_users.conf credentials file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .action(ArgAction::SetTrue)
                .help("emit structured JSON logs instead of text"),
        )
}

fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let config_dir = config::resolve_config_dir(matches.get_one::<String>("config-dir").map(|s| s.as_str()))
        .context("could not resolve a configuration directory")?;
    let cfg = config::load(&config_dir).context("failed to load pgmoneta.toml")?;
    let users_path = config::resolve_users_path(
        matches.get_one::<String>("users-path").map(|s| s.as_str()),
        &cfg,
        &config_dir,
    );
    let users = credentials::load_users(&users_path)
        .with_context(|| format!("failed to load credentials file '{users_path}'"))?;

    let log_format = if matches.get_flag("log-json") {
        logging::LogFormat::Json
    } else {
        logging::LogFormat::Text
    };
    logging::init(log_format)?;

    write_pid_file(&cfg)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the tokio runtime")?;
    runtime.block_on(run(cfg, users))
}

async fn run(cfg: config::Config, users: std::collections::BTreeMap<String, String>) -> anyhow::Result<()> {
    let running = RunningFlag::new();
    install_signal_handlers(running.clone());

    info!(servers = cfg.servers.len(), "starting pgmoneta");
    let ops = LiveOperations::new(cfg.clone(), users);
    let supervisor = Arc::new(Supervisor::new(cfg, running, ops));
    supervisor.run().await.context("supervisor event loop exited with an error")
}

/// `TERM`/`INT` flip `running := false` (spec.md §5 "Cancellation").
/// `HUP`/`USR1` are named by the same section for reconfiguration but are
/// not yet wired to a config-reload path; they are logged and ignored.
fn install_signal_handlers(running: RunningFlag) {
    tokio::spawn(async move {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");
        let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler");
        let mut usr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
            .expect("failed to install SIGUSR1 handler");
        loop {
            tokio::select! {
                _ = term.recv() => { info!("received SIGTERM, shutting down"); running.stop(); return; }
                _ = int.recv() => { info!("received SIGINT, shutting down"); running.stop(); return; }
                _ = hup.recv() => { info!("received SIGHUP (full reload not yet implemented)"); }
                _ = usr1.recv() => { info!("received SIGUSR1 (live reconfiguration not yet implemented)"); }
            }
        }
    });
}

fn write_pid_file(cfg: &config::Config) -> anyhow::Result<()> {
    let pid_path: Utf8PathBuf = cfg.unix_socket_dir.join("pgmoneta.all.pid");
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("writing PID file '{pid_path}'"))
}
