#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use std::io::{BufWriter, Write};

use anyhow::Context;
use clap::Parser;
use config::{CliArgs, RunConfig};
use leafseg::{SegmentKeyGenerator, StoreRegistry};
use telemetry::init_telemetry;

fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let generators = (0..config.instances)
        .map(|_| {
            SegmentKeyGenerator::from_config(config.segment.clone(), StoreRegistry::with_defaults())
        })
        .collect::<Vec<_>>();

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for (n, generator) in (0..config.count).zip(generators.iter().cycle()) {
        let id = generator
            .generate()
            .with_context(|| format!("failed to generate id #{}", n + 1))?;
        writeln!(out, "{id}")?;
    }
    out.flush()?;

    if config.stats {
        for (instance, generator) in generators.iter().enumerate() {
            let stats = generator.stats();
            tracing::info!(
                instance,
                adoptions = stats.adoptions,
                reservations = stats.reservations_requested,
                handoffs = stats.handoffs,
                "generator stats"
            );
        }
    }

    Ok(())
}

fn log_startup_info(config: &RunConfig) {
    if cfg!(debug_assertions) {
        tracing::debug!("Starting with full config: {:#?}", config);
    }
    tracing::info!(
        key = %config.segment.key,
        step = config.segment.step,
        store = %config.segment.store.store_type,
        instances = config.instances,
        count = config.count,
        "issuing ids"
    );
}
