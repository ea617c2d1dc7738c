use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use consist_k8s::controller::{self, WorkSetState};
use consist_k8s::expectations::ExpectationLedger;
use consist_k8s::Error;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Seconds after which an unsatisfied expectation is treated as
    /// satisfied. Too short risks duplicate mutations; too long stalls
    /// convergence after a lost watch event.
    #[arg(long, env = "EXPECTATION_TIMEOUT_SECS", default_value_t = 300)]
    expectation_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,

    /// Disable the traffic consist controller
    #[arg(long, env = "DISABLE_TRAFFIC_CONTROLLER")]
    no_traffic: bool,

    /// Disable the WorkSet claim controller
    #[arg(long, env = "DISABLE_WORKSET_CONTROLLER")]
    no_workset: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("consist-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if args.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }

    info!("consist-operator v{} starting", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;

    // One ledger for the whole process, injected into every controller
    let ledger = Arc::new(ExpectationLedger::with_timeout(Duration::from_secs(
        args.expectation_timeout_secs,
    )));

    let traffic = {
        let client = client.clone();
        let ledger = ledger.clone();
        async move {
            if args.no_traffic {
                info!("traffic controller disabled");
                return Ok(());
            }
            controller::run_traffic_controller(client, ledger).await
        }
    };

    let workset = {
        let state = Arc::new(WorkSetState {
            client: client.clone(),
            ledger: ledger.clone(),
        });
        async move {
            if args.no_workset {
                info!("WorkSet controller disabled");
                return Ok(());
            }
            controller::run_workset_controller(state).await
        }
    };

    tokio::try_join!(traffic, workset)?;

    info!("consist-operator shut down");
    Ok(())
}
