use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use provd::config::AppConfig;
use provd::core::models::{DeviceClass, Job, JobCreated, JobStatus, JobWithHistory, NewJobRequest};
use provd::core::vpn::VpnSession;
use provd::logging::{self, LogConfig};
use provd::rpc::{RpcClient, RpcServer};
use provd::web::WebServer;
use provd::{adapters, context::AppContext, core::Orchestrator, db};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "provd")]
#[command(about = "Network-boot device provisioning daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator, the RPC server and the callback server
    Daemon(DaemonArgs),
    /// Show daemon health
    Status,
    #[command(subcommand)]
    Jobs(JobCommands),
    /// Show the current VPN session
    Vpn,
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    auto_finalize: Option<bool>,
}

#[derive(Subcommand)]
enum JobCommands {
    /// Start a provisioning job
    Create {
        #[arg(long)]
        customer: String,
        #[arg(long)]
        class: DeviceClass,
        #[arg(long)]
        image: String,
        #[arg(long)]
        interface: String,
        #[arg(long)]
        vpn_profile: Option<String>,
    },
    Get {
        id: String,
    },
    /// Show a job with its status log
    History {
        id: String,
    },
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    Cancel {
        id: String,
    },
    /// Acknowledge a READY job
    Finalize {
        id: String,
    },
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.to_uppercase().replace('-', "_").parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(Some(args))?,
        _ => AppConfig::new(None::<&DaemonArgs>)?,
    };

    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Failed to start daemon")?,
        Commands::Status => run_status(&config)
            .await
            .context("Failed to check status of daemon")?,
        Commands::Jobs(cmd) => run_jobs(&config, cmd).await?,
        Commands::Vpn => {
            let client = RpcClient::new(config.rpc_bind);
            let session: VpnSession = client.call_no_params("vpn.session").await?;
            print_json(&session)?;
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    logging::init(LogConfig::from(&config));

    let db_conn = db::init(&config.database_path)
        .await
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;

    let simulation = config.simulation;
    let (rpc_bind, http_bind) = (config.rpc_bind, config.http_bind);
    let ctx = AppContext::new(config, db_conn)?;
    let orchestrator = Orchestrator::new(ctx);

    let rpc = Arc::new(
        RpcServer::bind(orchestrator.clone(), rpc_bind)
            .await
            .with_context(|| format!("Failed to bind RPC server on {}", rpc_bind))?,
    );
    let web = WebServer::bind(orchestrator.clone(), http_bind)
        .await
        .with_context(|| format!("Failed to bind callback server on {}", http_bind))?;
    let web_shutdown = web.shutdown_handle();

    orchestrator.start().await?;
    if simulation {
        adapters::start_simulator(orchestrator.gateway());
    }

    let mut rpc_task = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.start().await }
    });
    let mut web_task = tokio::spawn(web.start());

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
        res = &mut rpc_task => {
            error!(result = ?res, "RPC server stopped");
        }
        res = &mut web_task => {
            error!(result = ?res, "Callback server stopped");
        }
    }

    orchestrator.shutdown();
    orchestrator.ctx().tunnels.shutdown().await;
    rpc.shutdown();
    let _ = web_shutdown.send(());
    if !rpc_task.is_finished() {
        let _ = rpc_task.await;
    }
    if !web_task.is_finished() {
        let _ = web_task.await;
    }

    info!("Daemon stopped");
    Ok(())
}

async fn run_status(config: &AppConfig) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let status: Value = client.call_no_params("daemon.status").await?;

    println!("provd {}", status["version"].as_str().unwrap_or("?"));
    println!("  uptime:        {}s", status["uptime_secs"]);
    println!("  active jobs:   {}", status["active_jobs"]);
    println!("  pending binds: {}", status["pending_correlations"]);
    println!(
        "  vpn:           {} {}",
        status["vpn"]["state"].as_str().unwrap_or("?"),
        status["vpn"]["active_profile_id"].as_str().unwrap_or("")
    );
    if status["simulation"].as_bool() == Some(true) {
        println!("  (simulation mode)");
    }
    Ok(())
}

async fn run_jobs(config: &AppConfig, cmd: JobCommands) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);

    match cmd {
        JobCommands::Create {
            customer,
            class,
            image,
            interface,
            vpn_profile,
        } => {
            let request = NewJobRequest {
                customer_id: customer,
                device_class: class,
                image_ref: image,
                vpn_profile_id: vpn_profile,
                interface_id: interface,
            };
            let created: JobCreated = client
                .call("jobs.create", Some(serde_json::to_value(request)?))
                .await?;
            println!("{} {}", created.job_id, created.status);
        }
        JobCommands::Get { id } => {
            let job: Job = client.call("jobs.get", Some(json!({ "id": id }))).await?;
            print_json(&job)?;
        }
        JobCommands::History { id } => {
            let job: JobWithHistory = client
                .call("jobs.history", Some(json!({ "id": id })))
                .await?;
            print_json(&job)?;
        }
        JobCommands::List {
            status,
            limit,
            offset,
        } => {
            let jobs: Vec<Job> = client
                .call(
                    "jobs.list",
                    Some(json!({ "limit": limit, "offset": offset, "status": status })),
                )
                .await?;
            for job in jobs {
                println!(
                    "{}  {:<13}  {:<8}  {}",
                    job.id,
                    job.status.as_str(),
                    job.customer_id,
                    job.name.as_deref().unwrap_or("-")
                );
            }
        }
        JobCommands::Cancel { id } => {
            let job: Job = client.call("jobs.cancel", Some(json!({ "id": id }))).await?;
            println!("{} {}", job.id, job.status);
        }
        JobCommands::Finalize { id } => {
            let job: Job = client
                .call("jobs.finalize", Some(json!({ "id": id })))
                .await?;
            println!("{} {}", job.id, job.status);
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
