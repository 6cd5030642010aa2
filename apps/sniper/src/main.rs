use std::sync::Arc;

use sniper::api_client::{HttpUpstreamApi, UpstreamApi};
use sniper::config::Config;
use sniper::coordinator::Coordinator;
use sniper::events::{self, SniperEvent};
use sniper::models::ProxyClass;
use sniper::passive_monitor::PassiveMonitor;
use sniper::prefetch;
use sniper::proxy_pool::{DatacenterRotation, ProxyPool};
use sniper::scanner::Scanner;
use sniper::scheduler::Scheduler;
use sniper::store::Store;
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let db_pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    sniper::db::run_migrations(&db_pool).await?;

    let store = Arc::new(Store::bootstrap(db_pool).await?);

    let datacenter_proxies = if config.use_proxies {
        store.proxies_by_class(ProxyClass::Datacenter)
    } else {
        Vec::new()
    };
    let datacenter_pool = Arc::new(DatacenterRotation::new(datacenter_proxies));
    let isp_pool = Arc::new(ProxyPool::new(store.proxies_by_class(ProxyClass::Isp)));

    let api: Arc<dyn UpstreamApi> =
        Arc::new(HttpUpstreamApi::new(config.api_base_url.clone(), config.api_key.clone())?);

    let (event_tx, _event_rx) = events::channel(256);
    let coordinator = Coordinator::new(store.clone(), isp_pool.clone(), api.clone(), config.dry_run, event_tx.clone());
    log_events(event_tx.subscribe());

    let (window_tx, mut window_rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = Scheduler::new(store.clone(), config.lead_time, window_tx);

    {
        let scheduler = scheduler.clone();
        store.set_blackout_predicate(Box::new(move || {
            scheduler.is_within_blackout(chrono::Utc::now(), chrono::Duration::seconds(sniper::store::SYNC_BLACKOUT_SECONDS))
        }));
    }

    scheduler.start();
    spawn_periodic_sync(store.clone(), scheduler.clone(), datacenter_pool.clone(), isp_pool.clone());

    if config.passive_monitor_enabled {
        let monitor = PassiveMonitor::new(store.clone(), api.clone(), coordinator.clone(), scheduler.clone(), config.passive_blackout_minutes);
        monitor.start(config.passive_poll_interval);
        tracing::info!("passive monitor enabled");
    }

    tracing::info!("reservation sniper started");

    loop {
        tokio::select! {
            window = window_rx.recv() => {
                let Some(window) = window else { break };
                let guard_key = window.guard_key();
                tracing::info!(guard_key = %guard_key, restaurants = window.restaurants.len(), target_date = %window.target_date, "window firing");
                let _ = event_tx.send(SniperEvent::WindowStart {
                    guard_key: guard_key.clone(),
                    restaurant_count: window.restaurants.len(),
                    target_date: window.target_date,
                });

                coordinator.reset();
                isp_pool.reset();

                let user_ids = prefetch::window_user_ids(&window.subscriptions);
                let exclusions = prefetch::build_account_exclusions(&store, &api, &user_ids, window.target_date).await;
                coordinator.set_account_exclusions(exclusions);

                let scanner = Scanner::with_timing(
                    store.clone(),
                    datacenter_pool.clone(),
                    api.clone(),
                    coordinator.clone(),
                    event_tx.clone(),
                    config.scan_interval,
                    config.scan_timeout,
                );
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    let stats = scanner.run(window.restaurants, window.target_date, window.release_date_time, guard_key.clone()).await;
                    let _ = event_tx.send(SniperEvent::ScanComplete { guard_key, ticks: stats.ticks });
                });
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received, finishing in-flight work");
                break;
            }
        }
    }

    tracing::info!("reservation sniper stopped");
    Ok(())
}

/// Waits for SIGINT (Ctrl+C) or, on unix, SIGTERM — whichever comes first
/// (spec.md §5 "On shutdown": the Scheduler stops firing new windows and the
/// Scanner stops further ticks; in-flight processors finish naturally since
/// this future only gates the outer select loop, not already-spawned work).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Background sync timer (spec.md §4.B "Periodic sync"): refreshes the
/// in-memory snapshot every 5 minutes, suppressed during the release
/// blackout window, and rebuilds the scheduler's and proxy pools' dependent
/// caches afterward.
fn spawn_periodic_sync(store: Arc<Store>, scheduler: Arc<Scheduler>, datacenter_pool: Arc<DatacenterRotation>, isp_pool: Arc<ProxyPool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sniper::store::SYNC_INTERVAL);
        loop {
            interval.tick().await;
            match store.maybe_sync().await {
                Ok(true) => {
                    datacenter_pool.refresh(store.proxies_by_class(ProxyClass::Datacenter));
                    isp_pool.refresh(store.proxies_by_class(ProxyClass::Isp));
                    scheduler.schedule_pending();
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "periodic store sync failed"),
            }
        }
    });
}

/// Subscribes a logging-only observer to the event bus (spec.md §9 "Callback
/// graph": typed fan-out, any number of independent observers). A future
/// dashboard bridge would subscribe the same way instead of replacing this.
fn log_events(mut rx: tokio::sync::broadcast::Receiver<SniperEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SniperEvent::WindowStart { guard_key, restaurant_count, target_date }) => {
                    tracing::info!(guard_key, restaurant_count, %target_date, "event: window_start");
                }
                Ok(SniperEvent::SlotsDiscovered { restaurant_id, slot_count }) => {
                    tracing::debug!(restaurant_id, slot_count, "event: slots_discovered");
                }
                Ok(SniperEvent::ScanComplete { guard_key, ticks }) => {
                    tracing::info!(guard_key, ticks, "event: scan_complete");
                }
                Ok(SniperEvent::BookingSuccess { user_id, restaurant_id, target_date, reservation_id }) => {
                    tracing::info!(user_id, restaurant_id, %target_date, reservation_id, "event: booking_success");
                }
                Ok(SniperEvent::BookingFailed { user_id, restaurant_id, target_date, message }) => {
                    tracing::warn!(user_id, restaurant_id, %target_date, message, "event: booking_failed");
                }
                Ok(SniperEvent::ProxyRateLimited { proxy_id, minutes }) => {
                    tracing::warn!(proxy_id, minutes, "event: proxy_rate_limited");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event log receiver lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
