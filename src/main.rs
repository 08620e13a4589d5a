use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_tracker::{AppState, HttpRecords, LoopRoutes, MemoryRecords, Records, config, logging};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracking::{PositionStore, RoutePlan, Simulator, StreamGateway, SyncService};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;

    let engine = tracking::Config::from_env();
    let shutdown = CancellationToken::new();

    let store = PositionStore::new(&engine);
    let reaper = store.spawn_reaper(shutdown.clone());

    let records = Arc::new(match config::records_url() {
        Some(url) => {
            info!(url = %url, "syncing to records service");
            Records::Http(HttpRecords::new(&url)?)
        }
        None => {
            info!("RECORDS_URL not set, syncing to in-memory records");
            Records::Memory(MemoryRecords::new())
        }
    });

    let sync = Arc::new(SyncService::new(store.clone(), Arc::clone(&records), engine.sync.clone()));
    let sync_task = {
        let sync = Arc::clone(&sync);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sync.run(shutdown).await })
    };

    let routes = Arc::new(LoopRoutes::new(config::route_waypoints(), config::route_radius_km()));
    let simulator = Simulator::new(store.clone(), routes, engine.simulator.clone(), &shutdown);

    if config::seed_from_records()
        && let Err(e) = simulator.seed_from_records(records.as_ref()).await
    {
        warn!(error = %e, "failed to seed simulator from records");
    }
    for unit_id in config::sim_units() {
        let start = simulator.random_start();
        if let Err(e) = simulator.add(&unit_id, start, RoutePlan::Synthesize).await {
            warn!(unit_id = %unit_id, error = %e, "failed to start simulated unit");
        }
    }

    let state = AppState {
        store: store.clone(),
        simulator: simulator.clone(),
        gateway: StreamGateway::new(store.fanout().clone(), &shutdown),
        sync: sync.checkpoint(),
    };

    let addr = config::bind_addr();
    let listener =
        TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "fleet tracker listening");

    axum::serve(listener, fleet_tracker::router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("http server failed")?;

    shutdown.cancel();
    simulator.shutdown().await;
    if let Err(e) = sync_task.await {
        warn!(error = %e, "sync task ended abnormally");
    }
    if let Err(e) = reaper.await {
        warn!(error = %e, "reaper task ended abnormally");
    }

    info!("fleet tracker stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
        () = shutdown.cancelled() => {}
    }

    info!("shutting down");
    shutdown.cancel();
}
