//! capsule CLI entry point.
//!
//! Serves registered modules over HTTP, or runs one job and exits with
//! `--exec`.

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use capsule_common::ConfigFile;
use capsule_core::{
    Bus, Engine, Executor, LocalBus, ModuleRef, RetryPolicy, connect_static_peers,
};
use capsule_host::default_api;
use capsule_server::{AppState, CapsuleServer, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "capsule", version, about)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "CAPSULE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP server, overriding the config file.
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON.
    #[arg(long, env = "CAPSULE_JSON_LOGS")]
    json_logs: bool,

    /// Comma-separated bus peers, overriding the config file.
    #[arg(long, env = "CAPSULE_STATIC_PEERS")]
    static_peers: Option<String>,

    /// Run one job with this input, print its output and exit.
    #[arg(long, value_name = "INPUT")]
    exec: Option<String>,

    /// Job type for `--exec`; defaults to the only registered module.
    #[arg(long, requires = "exec")]
    job: Option<String>,

    /// Modules to register, as `<job_type>=<path>` or just `<path>` to use
    /// the file stem as job type.
    modules: Vec<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Split a `<job_type>=<path>` argument.
fn parse_module_arg(arg: &str) -> (String, PathBuf) {
    if let Some((job_type, path)) = arg.split_once('=') {
        if !job_type.is_empty() {
            return (job_type.to_string(), PathBuf::from(path));
        }
    }

    let path = PathBuf::from(arg);
    let job_type = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module")
        .to_string();
    (job_type, path)
}

fn load_module(path: &Path, version: Option<&str>) -> anyhow::Result<ModuleRef> {
    let module_ref = ModuleRef::from_file(path)
        .with_context(|| format!("Failed to read module '{}'", path.display()))?;
    Ok(match version {
        Some(version) => module_ref.with_version(version),
        None => module_ref,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = match &args.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };
    if let Some(peers) = args.static_peers.clone() {
        config.bus.static_peers = peers;
    }
    info!(
        backend = %config.runtime.engine.backend,
        modules = config.modules.len() + args.modules.len(),
        "Starting capsule"
    );

    let api = default_api(config.runtime.capabilities.clone())?;
    let engine = Engine::from_config(&config.runtime, api)?;
    let options = engine.default_options();

    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
    let mut executor = Executor::new(engine);
    executor.use_bus(Arc::clone(&bus));

    let peers = config.bus.peers();
    if !peers.is_empty() {
        tokio::spawn(async move {
            let connected = connect_static_peers(bus.as_ref(), &peers, RetryPolicy::default()).await;
            info!(connected, total = peers.len(), "Static peers dialed");
        });
    }

    for entry in &config.modules {
        let module_ref = load_module(Path::new(&entry.path), entry.version.as_deref())?;
        executor
            .register(&entry.id, module_ref, options.clone())
            .with_context(|| format!("Failed to register '{}'", entry.id))?;
    }
    for arg in &args.modules {
        let (job_type, path) = parse_module_arg(arg);
        let module_ref = load_module(&path, None)?;
        executor
            .register(&job_type, module_ref, options.clone())
            .with_context(|| format!("Failed to register '{job_type}'"))?;
    }

    if let Some(input) = args.exec {
        let registered = executor.engine().map(Engine::registered).unwrap_or_default();
        let job_type = match (args.job, registered.as_slice()) {
            (Some(job_type), _) => job_type,
            (None, [only]) => only.clone(),
            (None, []) => bail!("--exec needs a module to run"),
            (None, _) => bail!("--exec with several modules needs --job"),
        };

        let output = executor
            .do_job(&job_type, &Uuid::new_v4().to_string(), input.into_bytes())
            .await?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&output)?;
        stdout.write_all(b"\n")?;
        return Ok(());
    }

    let mut server_config = ServerConfig::from_file(&config.server, &config.admin)?;
    if let Some(bind) = args.bind {
        server_config = server_config.with_bind_addr(bind);
    }
    if config.admin.enabled && server_config.admin.is_none() {
        warn!("Admin API enabled without a token; not mounting it");
    }

    CapsuleServer::new(AppState::new(executor), server_config)
        .run()
        .await?;

    Ok(())
}
