use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dagfleet_core::cluster::{PartitionOutcome, ServeAction, ServeOptions};
use dagfleet_core::health::{HealthFormat, HealthOutcome, SlaOverrides};
use dagfleet_core::types::{AppEnv, ModeBits};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

mod context;
mod workers;

use context::{collect_destinations, parse_destination, parse_target_args, CliContext};

#[derive(Parser, Debug)]
#[command(name = "dagfleet", version)]
#[command(about = "Distribute DAG workloads across a cluster of workers", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dagfleet.toml", env = "DAGFLEET_CONFIG", global = true)]
    config: PathBuf,

    /// Directory holding one sub-directory per application
    #[arg(long, default_value = "apps", env = "DAGFLEET_APPS_PATH", global = true)]
    apps_path: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install an application on every destination
    Install {
        #[command(flatten)]
        app: AppArgs,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Build (or reuse) the distribution plan and execute it
    Run {
        #[command(flatten)]
        app: AppArgs,
        #[command(flatten)]
        cluster: ClusterArgs,
        /// Invocation arguments: inline JSON or @file.json
        #[arg(long)]
        args: Option<String>,
    },
    /// Manage the scheduler and worker process group
    Serve {
        /// start, status, stop or health
        action: ServeAction,
        #[command(flatten)]
        app: AppArgs,
        #[command(flatten)]
        cluster: ClusterArgs,
        /// Leave worker processes running on stop
        #[arg(long)]
        no_shutdown: bool,
        #[command(flatten)]
        sla: SlaArgs,
    },
    /// Evaluate the application's session against its SLA
    Health {
        #[command(flatten)]
        app: AppArgs,
        #[command(flatten)]
        sla: SlaArgs,
    },
    /// Execute one slot of a plan file (worker side of a remote run)
    Exec {
        #[arg(long)]
        app: String,
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        index: usize,
        #[arg(short, long, default_value_t = ModeBits::PYTHON.0)]
        mode: u32,
    },
}

#[derive(clap::Args, Debug)]
struct AppArgs {
    /// Application name
    #[arg(long)]
    app: String,

    /// Target identity (defaults to the application name)
    #[arg(long)]
    target: Option<String>,

    /// Worker base class, e.g. pandas-worker
    #[arg(long)]
    base_worker: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ClusterArgs {
    /// Destination as host=units, repeatable or comma separated
    #[arg(short = 'd', long = "destination", value_parser = parse_destination, value_delimiter = ',')]
    destinations: Vec<(String, u32)>,

    /// Mode bitmask: python=1, cython=2, dask=4, rapids=16
    #[arg(short, long, default_value_t = ModeBits::PYTHON.0)]
    mode: u32,

    /// Scheduler host, or host:port of a running scheduler
    #[arg(long)]
    scheduler: Option<String>,
}

#[derive(clap::Args, Debug)]
struct SlaArgs {
    #[arg(long, overrides_with = "no_allow_idle")]
    allow_idle: bool,

    #[arg(long, overrides_with = "allow_idle")]
    no_allow_idle: bool,

    #[arg(long)]
    max_unhealthy: Option<u32>,

    #[arg(long)]
    max_restart_rate: Option<f64>,

    /// Also write the report to this file
    #[arg(long)]
    health_output_path: Option<PathBuf>,

    /// json or prometheus
    #[arg(long, default_value = "json")]
    format: HealthFormat,
}

impl SlaArgs {
    fn overrides(&self) -> SlaOverrides {
        let allow_idle = match (self.allow_idle, self.no_allow_idle) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        SlaOverrides {
            allow_idle,
            max_unhealthy: self.max_unhealthy,
            max_restart_rate: self.max_restart_rate,
        }
    }
}

fn env_for(context: &CliContext, app: &AppArgs) -> AppEnv {
    context.env(&app.app, app.target.as_deref(), app.base_worker.as_deref())
}

fn serve_options(cluster: &ClusterArgs, sla: Option<&SlaArgs>) -> ServeOptions {
    let mut options = ServeOptions {
        scheduler: cluster.scheduler.clone(),
        destinations: collect_destinations(&cluster.destinations),
        mode: ModeBits(cluster.mode),
        ..ServeOptions::default()
    };
    if let Some(sla) = sla {
        options.sla = sla.overrides();
        options.health_output_path = sla.health_output_path.clone();
        options.health_format = sla.format;
    }
    options
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the rendered report, then the verdict line on stderr
fn report_health(outcome: &HealthOutcome, format: HealthFormat) -> Result<ExitCode> {
    print!("{}", outcome.render(format)?);
    if format == HealthFormat::Json {
        println!();
    }
    if outcome.passed() {
        eprintln!("OK: {} is {}", outcome.report.app, outcome.report.status);
    } else {
        eprintln!("FAIL: {}", outcome.reason);
    }
    Ok(ExitCode::from(outcome.exit_code as u8))
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dagfleet=info,dagfleet_core=info,dagfleet_cli=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let context = CliContext::load(&args.config, args.apps_path)?;
    let distributor = context.distributor();

    match args.command {
        Command::Install { app, cluster } => {
            let env = env_for(&context, &app);
            let report = distributor
                .install(
                    &env,
                    &collect_destinations(&cluster.destinations),
                    ModeBits(cluster.mode),
                    cluster.scheduler.as_deref(),
                )
                .await
                .context("Install failed")?;
            print_json(&report)?;
            Ok(if report.success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }

        Command::Run { app, cluster, args } => {
            let env = env_for(&context, &app);
            let mode = ModeBits(cluster.mode);
            let target_args = parse_target_args(args.as_deref())?;
            let session = if mode.pooled() {
                Some(distributor.load_session(&env, mode)?)
            } else {
                None
            };

            let report = distributor
                .run(
                    &env,
                    mode,
                    cluster.scheduler.as_deref(),
                    &collect_destinations(&cluster.destinations),
                    &target_args,
                    session.as_ref(),
                )
                .await
                .context("Run failed")?;
            if let Some(session) = &session {
                distributor.save_session(&env, session).await?;
            }

            print_json(&report)?;
            Ok(if report.success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }

        Command::Serve {
            action,
            app,
            cluster,
            no_shutdown,
            sla,
        } => {
            let env = env_for(&context, &app);
            let mut options = serve_options(&cluster, Some(&sla));
            options.shutdown_on_stop = !no_shutdown;
            let session = distributor.load_session(&env, options.mode)?;

            let payload = distributor
                .serve(&env, action, &options, &session)
                .await
                .with_context(|| format!("serve {action:?} failed"))?;

            match &payload.health {
                Some(outcome) => report_health(outcome, options.health_format),
                None => {
                    print_json(&payload)?;
                    Ok(ExitCode::SUCCESS)
                }
            }
        }

        Command::Health { app, sla } => {
            let env = env_for(&context, &app);
            let options = ServeOptions {
                sla: sla.overrides(),
                health_output_path: sla.health_output_path.clone(),
                health_format: sla.format,
                ..ServeOptions::default()
            };
            let session = distributor.load_session(&env, options.mode)?;
            let outcome = distributor.health(&env, &options, &session).await?;
            report_health(&outcome, sla.format)
        }

        Command::Exec {
            app,
            plan,
            index,
            mode,
        } => {
            let result = distributor.exec_partition(&app, &plan, index, ModeBits(mode)).await;
            let outcome = PartitionOutcome::from_result(index, "local", result);
            print_json(&outcome)?;
            Ok(if outcome.succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}
