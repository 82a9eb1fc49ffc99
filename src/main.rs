//! Pricewire publisher agent
//!
//! Starts one runner per configured signature scheme, wires every ingress
//! source into each runner's queue, and exposes the publisher websocket
//! endpoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pricewire::config::AppConfig;
use pricewire::metadata::PublisherMetadataReporter;
use pricewire::net::incoming::{self, IngressState};
use pricewire::net::puller::IncomingWebsocketPuller;
use pricewire::runner::{PublisherAgentRunner, RunnerSettings};
use pricewire::signer::{SignatureType, Signer};
use pricewire::types::{AuthToken, PriceUpdate};

/// Capacity of each runner's ingress queue.
const INGRESS_QUEUE_CAPACITY: usize = 4096;

const DEFAULT_CONFIG_PATH: &str = "config/default";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load(&config_path)?;
    info!(config_path = %config_path, "initializing publisher agent");

    let num_runners = config.agent.signature_types.len();
    let mut update_txs: Vec<mpsc::Sender<PriceUpdate>> = Vec::with_capacity(num_runners);

    for signature_type in &config.agent.signature_types {
        let signer = match signature_type {
            SignatureType::Evm => Signer::new_evm(&config.keys.evm_private_key)
                .context("failed to create EVM signer")?,
            SignatureType::Stark => Signer::new_stark(
                &config.keys.stark_private_key,
                &config.keys.stark_public_key,
                &config.oracle_id(),
            )
            .context("failed to create Stark signer")?,
        };
        let signer = Arc::new(signer);
        info!(
            signature_type = %signature_type,
            publisher_key = %signer.publisher_key(),
            "starting runner"
        );

        let settings = RunnerSettings {
            oracle_id: config.oracle_id(),
            num_runners,
            clock_period: config.agent.clock_period(),
            delta_check_period: config.agent.delta_check_period(),
            change_threshold_proportion: config.agent.change_threshold_proportion(),
            sign_every_update: config.agent.sign_every_update,
            registry_base_url: config.agent.registry_base_url.clone(),
            registry_refresh_interval: config.agent.registry_refresh_interval(),
            broker_reconnect_delay: config.agent.broker_reconnect_delay(),
            auth_token: config.auth_token(),
        };

        let reporter = PublisherMetadataReporter::new(
            signer.publisher_key().clone(),
            *signature_type,
            config.agent.metadata_report_interval(),
            config.agent.registry_base_url.clone(),
            config.auth_token(),
        );
        tokio::spawn(reporter.run());

        let runner = PublisherAgentRunner::new(settings, signer);
        let (update_tx, update_rx) = mpsc::channel(INGRESS_QUEUE_CAPACITY);
        update_txs.push(update_tx);
        tokio::spawn(runner.run(update_rx));
    }

    if !config.agent.pull_based_ws_url.is_empty() {
        let puller = IncomingWebsocketPuller {
            url: config.agent.pull_based_ws_url.clone(),
            auth: AuthToken(config.keys.pull_based_auth_token.clone()),
            subscription_request: config.agent.pull_based_ws_subscription_request.clone(),
            reconnect_delay: config.agent.pull_based_ws_reconnect_delay(),
            read_timeout: config.agent.pull_based_ws_read_timeout(),
            update_txs: update_txs.clone(),
        };
        tokio::spawn(puller.run());
    }

    if config.agent.incoming_ws_port > 0 {
        let state = IngressState::new(update_txs);
        let app = incoming::router(state);
        let addr = format!("0.0.0.0:{}", config.agent.incoming_ws_port);
        info!(addr = %addr, "starting incoming http server");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        axum::serve(listener, app)
            .await
            .context("incoming http server failed")?;
    } else {
        info!("not running incoming http server because incoming ws port is not specified");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown signal received, exiting");
    }

    Ok(())
}
