use std::path::PathBuf;
use std::time::Duration;

use analysis_agents::{check_endpoint, workers_for, AgentsConfig, OpenAiChat};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coordination::{
    CoordinationConfig, InMemoryStore, PhaseSequencer, Pipeline, PipelineEvent, RunSettings,
    RunStatus, SharedRunStore,
};
use tracing::{info, warn};

/// Multi-agent investment analysis pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one analysis end to end and print the final run as JSON
    Run {
        /// Ticker to analyse
        #[arg(long)]
        ticker: String,

        /// Requesting user
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Coordination config (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Debate rounds (overrides the config default)
        #[arg(long)]
        rounds: Option<u32>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 1800)]
        wait_secs: u64,

        /// Postgres connection string; the in-memory store is used when absent
        #[cfg(feature = "postgres")]
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Print the phase table
    Phases,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Phases => print_phases(),
        Command::Run {
            ticker,
            owner,
            config,
            rounds,
            wait_secs,
            #[cfg(feature = "postgres")]
            database_url,
        } => {
            let coordination = match config {
                Some(path) => CoordinationConfig::load(&path)?,
                None => CoordinationConfig::default(),
            };
            #[cfg(feature = "postgres")]
            let store = open_store(database_url.as_deref()).await?;
            #[cfg(not(feature = "postgres"))]
            let store: SharedRunStore = InMemoryStore::new().shared();

            run(store, coordination, &ticker, &owner, rounds, wait_secs).await
        }
    }
}

fn print_phases() -> Result<()> {
    let sequencer = PhaseSequencer::standard();
    for phase in sequencer.phases() {
        let agents: Vec<String> = phase
            .ordered_agents()
            .map(|a| {
                if a.required {
                    a.name.clone()
                } else {
                    format!("{} (optional)", a.name)
                }
            })
            .collect();
        let debate = match &phase.debate {
            Some(pair) => format!(" [debate: {} vs {}]", pair.bull, pair.bear),
            None => String::new(),
        };
        let next = phase.next.map(|p| p.to_string()).unwrap_or_else(|| "end".into());
        println!("{}{debate}: {} -> {next}", phase.id, agents.join(", "));
    }
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_store(database_url: Option<&str>) -> Result<SharedRunStore> {
    let Some(url) = database_url else {
        let store: SharedRunStore = InMemoryStore::new().shared();
        return Ok(store);
    };
    let store = coordination::PostgresStore::connect(url)
        .await
        .context("Failed to connect to Postgres")?;
    store.migrate().await.context("Failed to create tables")?;
    info!("Using Postgres run store");
    Ok(std::sync::Arc::new(store))
}

async fn run(
    store: SharedRunStore,
    config: CoordinationConfig,
    ticker: &str,
    owner: &str,
    rounds: Option<u32>,
    wait_secs: u64,
) -> Result<()> {
    let agents_config = AgentsConfig::default();
    info!(
        url = %agents_config.llm_url,
        model = %agents_config.model,
        "Analysis pipeline starting"
    );
    if !check_endpoint(&agents_config.llm_url).await {
        warn!(url = %agents_config.llm_url, "Chat endpoint not reachable, agents will retry");
    }

    let model = OpenAiChat::new(&agents_config)
        .context("Failed to build chat client")?
        .shared();
    let sequencer = PhaseSequencer::standard();
    let workers = workers_for(&sequencer, model);

    let mut settings: RunSettings = config.default_settings.clone();
    if let Some(rounds) = rounds {
        settings.max_debate_rounds = rounds;
    }

    let pipeline = Pipeline::builder(store, config)
        .sequencer(sequencer)
        .workers(workers)
        .build();

    let run_id = pipeline.create_run(ticker, owner, Some(settings)).await?;
    let mut events = pipeline.subscribe_run(&run_id);
    let progress = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
            if event.is_terminal() {
                break;
            }
        }
    });

    pipeline.start_run(&run_id).await?;
    let result = pipeline
        .wait_for_terminal(&run_id, Duration::from_secs(wait_secs))
        .await;
    progress.abort();

    let run = match result {
        Ok(run) => run,
        Err(e) => {
            let status = pipeline.cancel_run(&run_id).await?;
            warn!(run_id = %run_id, %status, "Run did not finish in time");
            pipeline.shutdown().await;
            return Err(e.into());
        }
    };
    pipeline.shutdown().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&run).context("Failed to serialize run")?
    );
    if run.payload.run_status != RunStatus::Completed {
        bail!("run {} ended {}", run_id, run.payload.run_status);
    }
    Ok(())
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::PhaseAdvanced { from, to, .. } => info!(%from, %to, "Phase advanced"),
        PipelineEvent::AgentCompleted { agent, round, .. } => {
            info!(agent = %agent, ?round, "Agent completed")
        }
        PipelineEvent::AgentDegraded {
            agent, error_type, ..
        } => warn!(agent = %agent, %error_type, "Agent degraded"),
        PipelineEvent::RetryScheduled {
            agent,
            attempt,
            error_type,
            ..
        } => warn!(agent = %agent, attempt, %error_type, "Retry scheduled"),
        PipelineEvent::StuckWorker {
            agent, waited_ms, ..
        } => warn!(agent = %agent, waited_ms, "Worker may be stuck"),
        other => info!(event = other.event_type(), "Pipeline event"),
    }
}
