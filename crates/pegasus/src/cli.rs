use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::Url;

fn default_master_url() -> Url {
    Url::parse("http://127.0.0.1:8080").expect("default master URL must parse")
}

#[derive(Debug, Parser)]
#[command(name = "pegasus", version, about = "Pegasus distributed job runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the master node.
    Master(MasterArgs),
    /// Run a worker node.
    Worker(WorkerArgs),
    /// Start a project on the master.
    Run(RunArgs),
    /// Show the master's project status.
    Status(StatusArgs),
    /// Write the default config file and exit.
    DumpCfg(DumpCfgArgs),
}

#[derive(Debug, Parser)]
pub struct MasterArgs {
    #[arg(long, env = "PEGASUS_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Config-server base URL; when set, the master registers its address
    /// there after startup.
    #[arg(long, env = "PEGASUS_CFG_SERVER")]
    pub cfg_server: Option<Url>,

    /// Config file written by `pegasus dump-cfg`.
    #[arg(long, env = "PEGASUS_CFG_FILE")]
    pub cfg_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct WorkerArgs {
    #[arg(long, env = "PEGASUS_LISTEN", default_value = "127.0.0.1:0")]
    pub listen: SocketAddr,

    /// Master base URL; resolved from the config server when omitted.
    #[arg(long, env = "PEGASUS_MASTER")]
    pub master: Option<Url>,

    /// Config-server base URL used to discover the master.
    #[arg(long, env = "PEGASUS_CFG_SERVER")]
    pub cfg_server: Option<Url>,

    /// Address workers advertise to the master; defaults to the bound
    /// listen address.
    #[arg(long, env = "PEGASUS_ADVERTISE_IP")]
    pub advertise_ip: Option<IpAddr>,

    /// Display name sent in the registration form.
    #[arg(long, env = "PEGASUS_WORKER_NAME")]
    pub name: Option<String>,

    #[arg(long, env = "PEGASUS_CFG_FILE")]
    pub cfg_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    #[arg(long, env = "PEGASUS_MASTER", default_value_t = default_master_url())]
    pub master: Url,

    /// Registered project name, e.g. `Mergesort`.
    #[arg(long)]
    pub project: String,

    /// Project config JSON passed to the project's init.
    #[arg(long, default_value = "{}")]
    pub config: String,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    #[arg(long, env = "PEGASUS_MASTER", default_value_t = default_master_url())]
    pub master: Url,
}

#[derive(Debug, Parser)]
pub struct DumpCfgArgs {
    #[arg(long, default_value = "pegasus-cfg.json")]
    pub path: PathBuf,
}
