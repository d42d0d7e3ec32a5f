mod config;
mod http;

use envconfig::Envconfig;
use flywheel_core::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    tracing_subscriber::fmt::init();

    let janitor_id = config.janitor_id();
    let bind = config.bind();
    info!(
        "starting janitor with id {:?}, listening at {}",
        janitor_id, bind
    );

    let storage = Storage::connect(&config.pool_config(), config.storage_options())
        .await
        .expect("failed to connect to storage");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for shutdown signal");
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let aggregator = storage.counters_aggregator();
    let aggregator_loop = tokio::spawn({
        let cancel = cancel.clone();
        async move { aggregator.run(cancel).await }
    });

    let expiration = storage.expiration_manager();
    let expiration_loop = tokio::spawn({
        let cancel = cancel.clone();
        async move { expiration.run(cancel).await }
    });

    let http_server = tokio::spawn(http::listen(http::app(janitor_id), bind));

    tokio::select! {
        res = aggregator_loop => {
            error!("counters aggregator exited");
            if let Err(e) = res {
                error!("counters aggregator failed with: {}", e)
            }
        }
        res = expiration_loop => {
            error!("expiration manager exited");
            if let Err(e) = res {
                error!("expiration manager failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e)
            }
        }
        _ = cancel.cancelled() => {
            info!("shutting down");
        }
    }

    storage.close().await;
    info!("exiting");
}
