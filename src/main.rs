use std::{error::Error, path::PathBuf, sync::Arc};

use clap::Parser;
use clap_derive::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rollupd::{
    api,
    config::RollupdConfig,
    pool::{SupervisorOptions, WorkerPool},
    queue::mqtt::MqttConnector,
    storage::{SqliteGateway, TimeoutGateway},
    worker::RedeliveryPolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// RON config file, missing file means defaults + env
    #[arg(short, long, default_value = "./config.ron")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = RollupdConfig::load(&args.config)?;
    info!(queue = %cfg.queue.name, host = %cfg.queue.host, "starting rollupd");

    let db = SqliteGateway::open(&cfg.storage.path, cfg.storage.rollup_mode).await?;
    let ct = CancellationToken::new();

    if let Some(listen) = cfg.api.listen.clone() {
        let app = api::router(api::ApiState {
            db: db.clone(),
            recent_limit: cfg.api.recent_limit,
        });
        let listener = tokio::net::TcpListener::bind(&listen).await?;
        info!(%listen, "serving api");
        let ct = ct.clone();
        tokio::spawn(async move {
            let res = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { ct.cancelled().await })
                .await;
            if let Err(e) = res {
                error!("api server: {e}");
            }
        });
    }

    {
        let ct = ct.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutting down"),
                Err(e) => error!("listening for ctrl-c: {e}"),
            }
            ct.cancel();
        });
    }

    let gateway = Arc::new(TimeoutGateway::new(db, cfg.storage.write_timeout()));
    let pool = WorkerPool::new(
        gateway,
        MqttConnector::new(cfg.queue.clone()),
        cfg.pool.workers,
        RedeliveryPolicy {
            max_redeliveries: cfg.queue.max_redeliveries,
        },
        SupervisorOptions::from(&cfg.pool),
    );
    let exits = pool.run(ct).await;
    info!(?exits, "all workers exited");

    Ok(())
}
