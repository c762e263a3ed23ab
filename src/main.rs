mod attest;
mod capability;
mod config;
mod manifest;
mod runtime;
mod sandbox;
mod server;
mod value;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::capability::{Capabilities, Database};
use crate::config::Config;
use crate::runtime::{Dispatcher, EngineKind};
use crate::sandbox::{SandboxPlan, SandboxStatus};
use crate::server::HostJob;

fn print_help() {
    println!(
        "\
capsule-host v{}

Runs an untrusted Lua or WebAssembly web application behind a
capability layer and a kernel sandbox.

USAGE:
    capsule-host [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/host.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit
        --check      Verify and load the application, print its manifest
                     as JSON, then exit without serving

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, capsule_host=debug,app=info)

EXAMPLES:
    capsule-host                          # uses config/host.toml
    capsule-host /etc/capsule/host.toml   # custom config path
    capsule-host --check                  # print the declared manifest
    RUST_LOG=debug capsule-host           # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

fn main() -> Result<()> {
    let mut check_only = false;
    let mut config_path = None;

    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("capsule-host v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--check" => check_only = true,
            other if other.starts_with('-') => {
                return Err(anyhow!("Unknown option {other} (see --help)"));
            }
            other => config_path = Some(other.to_string()),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("capsule_host=info,app=info")),
        )
        .init();

    if !check_only {
        println!(
            r#"
   ___                      _        _  _           _
  / __|__ _ _ __ ____  _ _ | |___   | || |___ ___ _| |_
 | (__/ _` | '_ (_-< || || | / -_)  | __ / _ (_-<|_   _|
  \___\__,_| .__/__/\_,_||_|_\___|  |_||_\___/__/  |_|
           |_|                                  v{}
"#,
            env!("CARGO_PKG_VERSION")
        );
    }

    let config_path = config_path.unwrap_or_else(|| "config/host.toml".to_string());
    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    let mut dispatcher = start(&config)?;

    if check_only {
        let manifest = dispatcher.host().extract_manifest()?;
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        dispatcher.shutdown();
        return Ok(());
    }

    // ── Sandbox ────────────────────────────────────────────
    // Irreversible; nothing below may need paths outside the plan.
    let manifest = dispatcher.host().extract_manifest()?;
    let status = SandboxPlan::with_data_dir(&manifest, &config.database.path, &config.app.data_dir)
        .allow_read(config.app_dir())
        .allow_bind(config.server.listen.port())
        .apply()
        .context("Cannot apply sandbox")?;
    match status {
        SandboxStatus::Enforced { full: true } => info!("Sandbox: fully enforced"),
        SandboxStatus::Enforced { full: false } => warn!("Sandbox: partially enforced"),
        SandboxStatus::Unsupported => warn!("Sandbox: unsupported on this system"),
        SandboxStatus::Skipped => warn!("Sandbox: skipped (no manifest)"),
    }

    // ── Serve ──────────────────────────────────────────────
    let max_body = dispatcher
        .host()
        .limits()
        .max_body_bytes(dispatcher.host().engine());
    let (job_tx, mut job_rx) = mpsc::channel::<HostJob>(server::QUEUE_DEPTH);
    let http = server::spawn(config.server.listen, job_tx, max_body)?;

    while let Some(job) = job_rx.blocking_recv() {
        let result = dispatcher.dispatch(&job.request);
        if job.reply.send(result).is_err() {
            warn!(
                "Client went away before {} {} completed",
                job.request.method, job.request.path
            );
        }
    }

    dispatcher.shutdown();
    if http.join().is_err() {
        error!("HTTP thread panicked");
    }
    info!("Bye");
    Ok(())
}

/// Attestation, engine start-up, application load and capability grant.
/// Any failure here is fatal and happens before a socket is opened.
fn start(config: &Config) -> Result<Dispatcher> {
    let entry = &config.app.entry;

    let attestation = match &config.attestation {
        Some(att) => Some(
            attest::verify_startup(entry, &att.public_key)
                .context("Startup attestation failed")?,
        ),
        None => {
            warn!("Attestation disabled: application files are not verified");
            None
        }
    };

    let kind = EngineKind::for_entry(entry)?;
    info!("Engine: {} ({})", kind.name(), entry.display());
    let mut host = runtime::init(kind, config.limits.initial())?;
    host.load_app(entry)?;
    info!("Routes: {} registered", host.routes().len());

    let manifest = host.extract_manifest()?;
    if let Some(att) = &attestation {
        att.check_manifest(&manifest)
            .context("Declared manifest does not match the signed one")?;
    }
    info!("Manifest: {}", manifest.summary());

    let limits = config.limits.resolve(&manifest.limits);
    host.set_limits(limits)?;
    info!(
        "Limits: heap {} bytes, stack {} bytes, {} ops per request",
        limits.heap_bytes, limits.stack_bytes, limits.instruction_budget
    );

    ensure_dir(&config.app.data_dir)?;
    if let Some(parent) = config.database.path.parent() {
        ensure_dir(parent)?;
    }
    let db = Database::open(&config.database.path, config.database.statement_cache)?;
    let caps = Capabilities::from_manifest(&manifest, &config.app.data_dir, &config.http, db)?;
    if caps.is_permissive() {
        warn!("Capability allowlists are permissive: declare a manifest to restrict them");
    }
    host.grant(caps)?;

    Ok(Dispatcher::new(host))
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("Cannot create directory {}", path.display()))
}
