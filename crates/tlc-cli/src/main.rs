use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tlc_core::{Category, ExtractDescriptor, Period};
use tlc_pipeline::{build_scheduler, MonthlyLoadJob, PipelineConfig, RunRequest};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tlc")]
#[command(about = "Monthly NYC TLC trip data loader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download one month's extract and merge it into Postgres
    Run {
        /// Taxi category (green or yellow)
        #[arg(long, default_value = "green")]
        taxi: String,
        /// Month to load, YYYY-MM or a partition key YYYY-MM-DD
        #[arg(long)]
        month: Period,
    },
    /// Create target and staging tables
    Migrate {
        /// Only this category; both when omitted
        #[arg(long)]
        taxi: Option<String>,
    },
    /// Print the resolved source URL, file and tables without doing any I/O
    Describe {
        #[arg(long)]
        taxi: String,
        #[arg(long)]
        month: Period,
    },
    /// Run the monthly schedules until interrupted
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Run { taxi, month } => {
            let job = MonthlyLoadJob::from_config(&config)?;
            let outcome = job.run(&RunRequest::new(taxi, month)).await;
            println!("{}", serde_json::to_string(&outcome)?);
            if !outcome.is_success() {
                bail!("run {} failed", outcome.run_key);
            }
        }
        Commands::Migrate { taxi } => {
            let categories = match taxi {
                Some(taxi) => vec![taxi.parse::<Category>()?],
                None => Category::ALL.to_vec(),
            };
            let job = MonthlyLoadJob::from_config(&config)?;
            for category in categories {
                job.warehouse()
                    .ensure_schema(category)
                    .await
                    .with_context(|| format!("ensuring {category} tables"))?;
                let schema = category.schema();
                println!("ensured {} and {}", schema.target_table, schema.staging_table);
            }
        }
        Commands::Describe { taxi, month } => {
            let descriptor = ExtractDescriptor::new(taxi.parse()?, month);
            let schema = descriptor.schema();
            let described = serde_json::json!({
                "run_key": descriptor.run_key(),
                "url": descriptor.url(&config.source_base_url),
                "local_path": config.storage_dir.join(descriptor.filename()),
                "target_table": schema.target_table,
                "staging_table": schema.staging_table,
                "columns": schema.column_names().collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&described)?);
        }
        Commands::Schedule => {
            let job = Arc::new(MonthlyLoadJob::from_config(&config)?);
            let mut sched = build_scheduler(job, &config).await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
