//! tflow2 entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tflow2::annotate::NullAugmenter;
use tflow2::config::{listen_addr, Config};
use tflow2::database::FlowDatabase;
use tflow2::decode::ipfix::IpfixDecoder;
use tflow2::decode::netflow_v9::NetflowV9Decoder;
use tflow2::decode::sflow::SflowDecoder;
use tflow2::decode::serve_udp;
use tflow2::iana::Protocols;
use tflow2::intfmapper::NullMapper;

/// Network-flow telemetry collector and query engine.
#[derive(Parser, Debug)]
#[command(name = "tflow2")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yml")]
    config: String,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration: {}", args.config))?;

    let fdb = FlowDatabase::new(
        config.database_settings(),
        Arc::new(NullMapper),
        Arc::new(NullAugmenter),
        Protocols::new(),
    );
    let (input, _workers) = fdb.start();

    if config.netflow_v9.is_enabled() {
        let listen = listen_addr(&config.netflow_v9.listen);
        let input = input.clone();
        let stats = fdb.stats_arc();
        tokio::spawn(async move {
            if let Err(err) =
                serve_udp(listen, NetflowV9Decoder::new(), input, stats, |s| {
                    &s.netflow_v9_packets
                })
                .await
            {
                tracing::error!(%err, "netflow v9 listener failed");
            }
        });
    }

    if config.ipfix.is_enabled() {
        let listen = listen_addr(&config.ipfix.listen);
        let input = input.clone();
        let stats = fdb.stats_arc();
        tokio::spawn(async move {
            if let Err(err) =
                serve_udp(listen, IpfixDecoder::new(), input, stats, |s| &s.ipfix_packets).await
            {
                tracing::error!(%err, "ipfix listener failed");
            }
        });
    }

    if config.sflow.is_enabled() {
        let listen = listen_addr(&config.sflow.listen);
        let input = input.clone();
        let stats = fdb.stats_arc();
        tokio::spawn(async move {
            if let Err(err) =
                serve_udp(listen, SflowDecoder::new(), input, stats, |s| &s.sflow_packets).await
            {
                tracing::error!(%err, "sflow listener failed");
            }
        });
    }

    drop(input);

    if config.frontend.is_enabled() {
        let listen = listen_addr(&config.frontend.listen);
        let fdb = Arc::clone(&fdb);
        tokio::spawn(async move {
            if let Err(err) = tflow2::frontend::serve(listen, fdb).await {
                tracing::error!(%err, "frontend failed");
            }
        });
    }

    info!(version = tflow2::VERSION, "tflow2 running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    info!("shutting down");

    Ok(())
}
