mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loom_core::app::{Broker, WorkerGroup};
use loom_core::config::LoomConfig;
use loom_core::domain::{Job, Message, MessageId, MessageState};
use loom_core::impls::LocalBrokerClient;
use loom_core::logging;

use crate::cli::{CliArgs, Command};

const WATCH_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("loom error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args = CliArgs::parse();
    logging::init_logging(args.log_level.map(|l| l.as_str()))?;

    let config = match &args.config {
        Some(path) => LoomConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LoomConfig::default(),
    };

    match args.command {
        Command::Run { topic, job } => run_job(config, topic, &job).await,
        Command::Get { topic, id } => get_message(&config, &topic, &id),
    }
}

async fn run_job(mut config: LoomConfig, topic: Option<String>, job_path: &Path) -> Result<()> {
    if let Some(topic) = topic {
        config.worker.topic = topic;
    }
    let raw = tokio::fs::read_to_string(job_path)
        .await
        .with_context(|| format!("reading job {}", job_path.display()))?;
    let job: Job = serde_json::from_str(&raw)
        .with_context(|| format!("parsing job {}", job_path.display()))?;

    let broker = Arc::new(Broker::new(&config.broker)?);
    broker.init().await?;

    let token = CancellationToken::new();
    let client = Arc::new(LocalBrokerClient::new(Arc::clone(&broker)));
    let group = WorkerGroup::spawn(config.worker.clone(), client, token.clone()).await?;

    let topic = config.worker.topic.as_str();
    let pushed = broker.push_message(topic, job).await?;
    info!(%topic, id = %pushed.id, "job pushed");

    let finished = tokio::select! {
        msg = wait_terminal(&broker, topic, &pushed.id) => Some(msg?),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; cancelling running jobs");
            group.cancel_jobs();
            None
        }
    };

    group.shutdown_and_join().await;
    token.cancel();
    let last = broker.get_message(topic, &pushed.id)?;
    broker.shutdown().await?;

    print_message(&last)?;
    match finished {
        Some(msg) if msg.state == MessageState::Failure => bail!("message {} failed", msg.id),
        Some(_) => Ok(()),
        None => bail!("interrupted before message {} finished", pushed.id),
    }
}

async fn wait_terminal(broker: &Broker, topic: &str, id: &MessageId) -> loom_core::Result<Message> {
    loop {
        let msg = broker.get_message(topic, id)?;
        if msg.is_terminal() {
            return Ok(msg);
        }
        tokio::time::sleep(WATCH_INTERVAL).await;
    }
}

fn get_message(config: &LoomConfig, topic: &str, id: &str) -> Result<()> {
    let id: MessageId = id.parse().with_context(|| format!("bad message id {id:?}"))?;
    let msg = Broker::read_message(&config.broker, topic, &id)?;
    print_message(&msg)
}

fn print_message(msg: &Message) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&msg.view())?);
    Ok(())
}
