//! Procwarden CLI - command-line interface
//!
//! This binary runs the per-machine agent daemon and provides driver
//! commands to operate a running agent over RPC.
//!
//! # Architecture
//!
//! - `Cli` / `Commands`: argument parsing (clap)
//! - `agent`: runs the daemon, either listening for driver connections or
//!   dialing a supervisor in a reconnect loop
//! - `start` / `stop` / `list`: RPC driver commands against a listening
//!   agent
//! - `drive`: local end-to-end exercise of the supervision API
//! - `CliError`: centralized error handling with user-friendly messages

mod error;

use clap::{Parser, Subcommand, ValueEnum};
use error::CliError;
use procwarden::agent::Agent;
use procwarden::backend::{Backend, LoggedBackend, OsBackend, ProcessId};
use procwarden::config::{
    AgentSettings, PolicyKind, PolicySettings, DEFAULT_STOP_TIMEOUT, DEFAULT_SUPERVISOR_ADDR,
};
use procwarden::logging::init_logging;
use procwarden::rpc::{AgentClient, AgentServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

// ============================================================================
// CLI Argument Definitions
// ============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyChoice {
    /// Cycle every instance concurrently.
    AllAtOnce,
    /// Cycle one instance at a time.
    Rolling,
}

impl From<PolicyChoice> for PolicyKind {
    fn from(choice: PolicyChoice) -> Self {
        match choice {
            PolicyChoice::AllAtOnce => PolicyKind::AllAtOnce,
            PolicyChoice::Rolling => PolicyKind::Rolling,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "procwarden", version = procwarden::VERSION, about = "Per-machine supervisor for long-running programs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent daemon.
    Agent {
        /// Listen for driver connections on this address instead of dialing
        /// out.
        #[arg(long, conflicts_with = "supervisor")]
        listen: Option<String>,

        /// Supervisor address to dial and keep reconnecting to.
        #[arg(long, default_value = DEFAULT_SUPERVISOR_ADDR)]
        supervisor: String,
    },

    /// Start a process of a program on a listening agent.
    Start {
        /// Agent address to connect to.
        #[arg(long)]
        agent: String,

        /// Program name, e.g. "echoer v1".
        program: String,
    },

    /// Stop a process on a listening agent.
    Stop {
        /// Agent address to connect to.
        #[arg(long)]
        agent: String,

        /// Process ID as printed by start or list.
        process_id: String,

        /// Graceful-stop timeout in seconds; 0 kills immediately.
        #[arg(long, default_value_t = 1)]
        timeout_secs: u64,
    },

    /// List all programs and processes on a listening agent.
    List {
        /// Agent address to connect to.
        #[arg(long)]
        agent: String,
    },

    /// Exercise the supervision API locally: start two instances, restart
    /// them under the policy, optionally upgrade, then stop everything.
    Drive {
        /// Program name, e.g. "echoer v1".
        program: String,

        /// Upgrade the program to this one after restarting.
        #[arg(long)]
        upgrade_to: Option<String>,

        /// Cycle ordering policy.
        #[arg(long, value_enum, default_value = "all-at-once")]
        policy: PolicyChoice,

        /// Stop old instances before starting their replacements.
        #[arg(long)]
        stop_before_start: bool,

        /// Graceful-stop timeout in seconds for policy-driven cycles.
        #[arg(long, default_value_t = DEFAULT_STOP_TIMEOUT.as_secs())]
        stop_timeout_secs: u64,
    },
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _logging_guard = match init_logging("logs", "procwarden.log") {
        Ok(guard) => guard,
        Err(source) => {
            eprintln!("error: {}", CliError::LoggingInit(source));
            std::process::exit(1);
        }
    };
    info!("procwarden v{}", procwarden::VERSION);

    let outcome = match cli.command {
        Commands::Agent { listen, supervisor } => run_agent(listen, supervisor).await,
        Commands::Start { agent, program } => run_start(&agent, &program).await,
        Commands::Stop {
            agent,
            process_id,
            timeout_secs,
        } => run_stop(&agent, &process_id, timeout_secs).await,
        Commands::List { agent } => run_list(&agent).await,
        Commands::Drive {
            program,
            upgrade_to,
            policy,
            stop_before_start,
            stop_timeout_secs,
        } => {
            let settings = PolicySettings {
                kind: policy.into(),
                start_before_stop: !stop_before_start,
                stop_timeout: Duration::from_secs(stop_timeout_secs),
            };
            run_drive(&program, upgrade_to.as_deref(), settings).await
        }
    };

    if let Err(cli_error) = outcome {
        error!(error = %cli_error, "command failed");
        eprintln!("error: {cli_error}");
        std::process::exit(1);
    }
}

// ============================================================================
// Agent daemon
// ============================================================================

async fn run_agent(listen: Option<String>, supervisor: String) -> Result<(), CliError> {
    let backend = LoggedBackend::new(OsBackend::new());
    let agent = Arc::new(Agent::new(backend));
    let server = Arc::new(AgentServer::new(agent));

    match listen {
        Some(addr) => serve_drivers(server, &addr).await,
        None => {
            let settings = AgentSettings {
                supervisor_addr: supervisor,
                ..AgentSettings::default()
            };
            dial_supervisor(server, &settings).await
        }
    }
}

/// Accepts driver connections and services each on its own task.
async fn serve_drivers(
    server: Arc<AgentServer<LoggedBackend<OsBackend>>>,
    addr: &str,
) -> Result<(), CliError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| CliError::Listen {
        addr: addr.to_string(),
        source,
    })?;
    info!(addr, "agent listening for drivers");

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!(peer = %peer, "driver connected");
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    if let Err(rpc_error) = server.serve(socket).await {
                        warn!(peer = %peer, error = %rpc_error, "connection ended");
                    }
                });
            }
            Err(source) => {
                warn!(error = %source, "failed accepting driver connection");
            }
        }
    }
}

/// Dials the supervisor and services the connection, reconnecting forever.
async fn dial_supervisor(
    server: Arc<AgentServer<LoggedBackend<OsBackend>>>,
    settings: &AgentSettings,
) -> Result<(), CliError> {
    info!(supervisor = %settings.supervisor_addr, "agent dialing supervisor");
    loop {
        let connected = tokio::time::timeout(
            settings.dial_timeout,
            TcpStream::connect(&settings.supervisor_addr),
        )
        .await;

        match connected {
            Ok(Ok(socket)) => {
                info!(supervisor = %settings.supervisor_addr, "connected to supervisor");
                if let Err(rpc_error) = server.serve(socket).await {
                    error!(error = %rpc_error, "can't operate agent over RPC");
                }
            }
            Ok(Err(source)) => {
                error!(supervisor = %settings.supervisor_addr, error = %source, "can't dial supervisor");
            }
            Err(_) => {
                error!(supervisor = %settings.supervisor_addr, "timed out dialing supervisor");
            }
        }
        tokio::time::sleep(settings.redial_delay).await;
    }
}

// ============================================================================
// Driver commands
// ============================================================================

async fn connect(addr: &str) -> Result<AgentClient<TcpStream>, CliError> {
    let socket = TcpStream::connect(addr)
        .await
        .map_err(|source| CliError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    Ok(AgentClient::new(socket))
}

async fn run_start(addr: &str, program: &str) -> Result<(), CliError> {
    let mut client = connect(addr).await?;
    let process_id = client.start_process(program).await?;
    println!("{process_id}");
    Ok(())
}

async fn run_stop(addr: &str, process_id: &str, timeout_secs: u64) -> Result<(), CliError> {
    let mut client = connect(addr).await?;
    client
        .stop_process(
            &ProcessId::new(process_id),
            Duration::from_secs(timeout_secs),
        )
        .await?;
    println!("stopped {process_id}");
    Ok(())
}

async fn run_list(addr: &str) -> Result<(), CliError> {
    let mut client = connect(addr).await?;
    let running = client.list_all().await?;
    if running.is_empty() {
        println!("no processes running");
        return Ok(());
    }
    for (program_id, process_ids) in running {
        println!("{program_id}:");
        for process_id in process_ids {
            println!("  {process_id}");
        }
    }
    Ok(())
}

// ============================================================================
// Local driver
// ============================================================================

/// Exercises the full supervision API against a local agent, the way a
/// deployment would: run two instances, cycle them, upgrade, tear down.
async fn run_drive(
    program: &str,
    upgrade_to: Option<&str>,
    settings: PolicySettings,
) -> Result<(), CliError> {
    let backend = LoggedBackend::new(OsBackend::new());
    let program_id = backend.program_id(program);
    let agent = Agent::new(backend);
    let policy = settings.build();

    info!(program_id = %program_id, "starting program");
    agent.start_process(&program_id).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    agent.start_process(&program_id).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    info!("restarting");
    agent.restart_program(policy.as_ref(), &program_id).await?;
    info!("restarted, running");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let final_program = match upgrade_to {
        Some(next) => {
            let next_id = agent.backend().program_id(next);
            info!(to = %next_id, "upgrading");
            agent
                .upgrade_program(policy.as_ref(), &program_id, &next_id)
                .await?;
            info!("upgraded, running");
            tokio::time::sleep(Duration::from_secs(3)).await;
            next_id
        }
        None => program_id,
    };

    info!("stopping all processes");
    agent
        .stop_program(&final_program, Duration::from_secs(10))
        .await?;
    info!("all done");
    Ok(())
}
