use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cable_club::{
    config::Config,
    data::StaticTables,
    link::{ByteLink, DeviceLink, Voltage},
    mediator::Mediator,
    relay::RelayClient,
    types::{Generation, TradeMode, TradeTarget},
};
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".into());
    let config = Config::from_file(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    let generation = Generation::from_number(config.trade.generation)
        .with_context(|| format!("unsupported generation {}", config.trade.generation))?;
    let mode = match config.trade.mode.as_str() {
        "buffered" => TradeMode::Buffered,
        "synchronous" => TradeMode::Synchronous,
        other => anyhow::bail!("unknown trade mode {other:?}"),
    };
    let target = if config.relay.pool {
        TradeTarget::Pool
    } else {
        TradeTarget::Link
    };

    let tables = StaticTables::load(std::path::Path::new(&config.data.root), generation)
        .context("failed to load static tables")?;

    let mut link = DeviceLink::open(&config.adapter.device)
        .with_context(|| format!("failed to open adapter {}", config.adapter.device))?;
    let voltage = match config.adapter.voltage.as_str() {
        "gb" => Voltage::Gb,
        "gba" => Voltage::Gba,
        _ => Voltage::for_generation(generation),
    };
    link.set_voltage(voltage)?;
    tracing::info!("adapter {} ready at {voltage:?}", config.adapter.device);

    let relay = RelayClient::connect(
        &config.relay.url,
        &config.relay.room,
        Duration::from_millis(config.relay.poll_interval_ms),
    )
    .await?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                tracing::info!("stop requested, leaving the trade gracefully");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut mediator = Mediator::new(
        &mut link,
        &relay,
        &tables,
        config.data.sanity_checks,
        generation,
        mode,
        target,
        config.trade.japanese,
        stop,
    );
    mediator.set_join_timeout(Duration::from_secs(config.relay.join_timeout_secs));

    let result = mediator.run().await;
    for record in mediator.trade_log() {
        tracing::info!(
            "session log: sent {} received {} ({:?})",
            tables.name(record.sent_species),
            tables.name(record.received_species),
            record.outcome
        );
    }
    result.map_err(Into::into)
}
