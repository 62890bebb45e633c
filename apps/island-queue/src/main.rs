mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cli::Cli;
use island_queue_core::QueueError;
use island_queue_core::api::ReqwestIslandApi;
use island_queue_core::config::QueueConfig;
use island_queue_core::discovery::{self, Target};
use island_queue_core::queue::{QueueEvent, RunState, cancellable};
use island_queue_core::telemetry::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("failed to initialise logging: {err}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("❌ {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = cli.to_config().context("invalid configuration")?;
    let api = Arc::new(config.api().context("failed to build http client")?);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received; abandoning queue run");
            ctrl_c.cancel();
        }
    });

    let Some(target) = resolve_target(&cli, &config, api.as_ref(), &cancel).await? else {
        println!("No islands were found.");
        return Ok(ExitCode::from(2));
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(render_events(target.name.clone(), rx));

    let mut queue_run = config
        .queue_run(api)
        .with_events(tx)
        .with_cancellation(cancel);
    println!("Generating visitor ID...");
    let result = queue_run.run(&target).await;
    drop(queue_run);
    let _ = printer.await;

    let claimed = result.with_context(|| format!("queue run for {} failed", target.name))?;
    println!("There you go: {}", claimed.code);
    Ok(ExitCode::SUCCESS)
}

async fn resolve_target(
    cli: &Cli,
    config: &QueueConfig,
    api: &ReqwestIslandApi,
    cancel: &CancellationToken,
) -> Result<Option<Target>, QueueError> {
    if let Some(code) = cli.island_code.as_deref() {
        println!("🔎 Searching for {code}...");
        return cancellable(cancel, discovery::lookup(api, code))
            .await
            .map(Some);
    }

    println!("🔎 Searching for islands you can visit...");
    let candidates = if cli.auto_verify {
        discovery::watch_for_new(api, cli.minimum_bells, config.poll_interval, cancel).await?
    } else {
        cancellable(cancel, discovery::list_candidates(api, cli.minimum_bells)).await?
    };
    Ok(candidates.into_iter().next().inspect(|target| {
        println!(
            "Picked {} - {} bells per turnip | {}",
            target.name, target.turnip_price, target.queued
        );
    }))
}

async fn render_events(island: String, mut rx: mpsc::UnboundedReceiver<QueueEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            QueueEvent::State(RunState::Abandoned) => println!("Left {island}'s queue"),
            QueueEvent::State(_) => {}
            QueueEvent::SessionEstablished { visitor_id } => {
                println!("✅ Your visitor ID: {visitor_id}")
            }
            QueueEvent::Enrolled { .. } => println!("✅ Joined {island}'s queue"),
            QueueEvent::EnrollmentRejected { message } => {
                println!("❌ Failed to join {island}: {message}")
            }
            QueueEvent::Position { position, total } => {
                println!("{island}'s queue position: {position}/{total}")
            }
            QueueEvent::StatusRejected { message } => {
                println!("❌ Failed to get {island}'s status: {message}")
            }
            QueueEvent::StatusFailed { error } => {
                println!("❌ Status check for {island} failed: {error}")
            }
            QueueEvent::Waiting { delay } => println!("⏱ Awaiting {}s...", delay.as_secs()),
            QueueEvent::ClaimRejected { message } => {
                println!("❌ Could not grab the dodo code for {island}: {message}")
            }
            QueueEvent::Claimed { .. } => {
                println!("🤩 Your Dodo Code for {island} is ready!")
            }
        }
    }
}
