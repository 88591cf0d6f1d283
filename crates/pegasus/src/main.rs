mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;

use pegasus_core::cfgclient::CfgClient;
use pegasus_core::config::ConfigSchema;
use pegasus_core::{Registry, WorkerRegForm};
use pegasus_master::{MASTER_CFG_PATH, MasterCfg, MasterState};
use pegasus_worker::{TaskEngine, WORKER_CFG_PATH, WorkerCfg};

use crate::cli::{Cli, Command, DumpCfgArgs, MasterArgs, RunArgs, StatusArgs, WorkerArgs};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_registry() -> anyhow::Result<Arc<Registry>> {
    let mut registry = Registry::new();
    registry.register_project(pegasus_mergesort::project_factory)?;
    Ok(Arc::new(registry))
}

fn config_schema() -> anyhow::Result<ConfigSchema> {
    let mut schema = ConfigSchema::new();
    schema.register_entry(MASTER_CFG_PATH, &MasterCfg::default())?;
    schema.register_entry(WORKER_CFG_PATH, &WorkerCfg::default())?;
    Ok(schema)
}

fn load_cfg_entry<T>(cfg_file: Option<&std::path::Path>, path: &str) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut schema = config_schema()?;
    if let Some(file) = cfg_file {
        schema.load_file(file)?;
    }
    schema.get(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::Master(args) => run_master(args).await,
        Command::Worker(args) => run_worker(args).await,
        Command::Run(args) => run_project(args).await,
        Command::Status(args) => show_status(args).await,
        Command::DumpCfg(args) => dump_cfg(args),
    }
}

async fn run_master(args: MasterArgs) -> anyhow::Result<()> {
    let cfg: MasterCfg = load_cfg_entry(args.cfg_file.as_deref(), MASTER_CFG_PATH)?;
    let registry = build_registry()?;

    let state = MasterState::new(cfg.clone(), registry)?;
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    let addr = listener.local_addr()?;

    if let Some(cfg_server) = args.cfg_server {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let cfg_client = CfgClient::new(http, cfg_server);
        cfg_client.wait_up().await?;
        if !cfg.allow_master_takeover {
            if let Some(existing) = cfg_client.fetch_master_addr().await? {
                anyhow::bail!("master {existing:?} already registered on cfg server");
            }
        }
        cfg_client.register_master_addr(&addr.to_string()).await?;
        tracing::info!(%addr, "registered on cfg server");
    }

    let monitor = state.pool.spawn_monitor();
    let res = tokio::select! {
        res = pegasus_master::serve(state, listener) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down master");
            Ok(())
        }
    };
    monitor.abort();
    res
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let cfg: WorkerCfg = load_cfg_entry(args.cfg_file.as_deref(), WORKER_CFG_PATH)?;
    let registry = build_registry()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let master = match (args.master, args.cfg_server) {
        (Some(master), _) => master,
        (None, Some(cfg_server)) => {
            let cfg_client = CfgClient::new(http.clone(), cfg_server);
            cfg_client.wait_up().await?;
            wait_for_master_addr(&cfg_client).await?
        }
        (None, None) => {
            anyhow::bail!("either --master or --cfg-server is required");
        }
    };

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    let addr = listener.local_addr()?;
    let ip = args.advertise_ip.unwrap_or_else(|| addr.ip());
    let form = WorkerRegForm {
        name: args.name.unwrap_or_else(|| format!("worker@{addr}")),
        ip: ip.to_string(),
        port: addr.port(),
    };

    let client = Arc::new(pegasus_worker::register(http, master, &form).await?);
    let engine = Arc::new(TaskEngine::new(registry, client.clone(), cfg));

    let hb = pegasus_worker::start_heartbeat(client).await?;
    let monitor = pegasus_worker::spawn_status_monitor(engine.clone());

    let res = tokio::select! {
        res = pegasus_worker::serve(engine, listener) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down worker");
            Ok(())
        }
    };
    hb.abort();
    monitor.abort();
    res
}

async fn wait_for_master_addr(cfg_client: &CfgClient) -> anyhow::Result<Url> {
    loop {
        match cfg_client.fetch_master_addr().await {
            Ok(Some(addr)) => {
                tracing::info!(%addr, "got master address");
                return Ok(Url::parse(&format!("http://{addr}"))?);
            }
            Ok(None) => tracing::info!("master not ready"),
            Err(err) => tracing::warn!(error = %err, "fail to get master address"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn run_project(args: RunArgs) -> anyhow::Result<()> {
    let url = args
        .master
        .join(&format!("project?proj={}", args.project))?;
    let http = reqwest::Client::new();
    let res = http.post(url).body(args.config).send().await?;
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("http {status}: {body}");
    }
    println!("{body}");
    Ok(())
}

async fn show_status(args: StatusArgs) -> anyhow::Result<()> {
    let url = args.master.join("project/status")?;
    let http = reqwest::Client::new();
    let res = http.get(url).send().await?;
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("http {status}: {body}");
    }
    println!("{body}");
    Ok(())
}

fn dump_cfg(args: DumpCfgArgs) -> anyhow::Result<()> {
    let schema = config_schema()?;
    schema.save_defaults(&args.path)?;
    println!("Default config written to {}", args.path.display());
    Ok(())
}
