use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use remote_exec::RemoteExecutor;
use soakctl::{
    CleanupStack, GcloudProvisioner, LaunchArgs, RunController, RunPlan, SshKeyStore,
    SshTransport, WorkloadArgs,
};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "soakctl", version, about = "Launch long-running logging agent soak tests")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a VM and start the soak workload on it
    Launch(LaunchArgs),
    /// Print the agent config and stage scripts without contacting any VM
    Render(RenderArgs),
    /// Print version and exit
    Version,
}

#[derive(Args)]
struct RenderArgs {
    #[command(flatten)]
    workload: WorkloadArgs,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.cmd {
        Commands::Launch(args) => {
            let code = launch(args).await?;
            std::process::exit(code);
        }
        Commands::Render(args) => {
            let platform = args.workload.validate()?;
            let plan = RunPlan::build(
                platform,
                args.workload.log_rate,
                args.workload.log_size_in_bytes,
            )?;
            print!("{}", plan.render_text()?);
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

async fn launch(args: LaunchArgs) -> Result<i32> {
    let config = args.into_run_config().context("Invalid launch configuration")?;
    let plan = RunPlan::for_config(&config).context("Failed to render remote scripts")?;

    let keys = Arc::new(SshKeyStore::new(config.ssh_user.clone()));
    let mut cleanup = CleanupStack::new();
    {
        let keys = keys.clone();
        cleanup.register("ssh-key", move || {
            keys.release();
        });
    }

    let provisioner = GcloudProvisioner::new(keys.clone(), config.timing.boot_timeout);
    let executor = RemoteExecutor::new(SshTransport::new(keys), config.executor_config());

    let report = RunController::new(config, plan, provisioner, executor, cleanup)
        .run()
        .await;
    report.log_summary();
    println!("{}", serde_json::to_string_pretty(&report.summary())?);
    Ok(report.exit_code())
}
