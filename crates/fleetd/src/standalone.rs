//! Standalone mode: every subsystem in one process.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use fleet_core::config::FleetConfig;
use fleetgrid_events::{ChangeCoalescer, ChangeNotification, EventBus};
use fleetgrid_rollout::RolloutExecutor;
use fleetgrid_state::StateStore;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub async fn run_standalone(config: FleetConfig) -> anyhow::Result<()> {
    config.validate()?;
    info!("FleetGrid daemon starting in standalone mode");

    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.store.data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let bus = EventBus::new(config.events.bus_capacity);
    let coalescer = Arc::new(ChangeCoalescer::new(Arc::new(bus.clone())));
    info!(
        flush_interval_ms = config.events.flush_interval_ms,
        initial_delay_ms = config.events.initial_delay_ms,
        "change coalescer initialized"
    );

    let executor = RolloutExecutor::new(store, bus.clone(), config.rollout.action_batch);
    info!(
        check_interval_ms = config.rollout.check_interval_ms,
        batch = config.rollout.action_batch,
        "rollout executor initialized"
    );

    // ── Start background tasks ─────────────────────────────────

    let background = Background::spawn(&config, &bus, &coalescer, &executor);

    // ── Start API server ───────────────────────────────────────

    let router = fleetgrid_api::build_router(executor);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
    });

    server.await?;
    background.shutdown().await;

    info!("FleetGrid daemon stopped");
    Ok(())
}

/// A spawned task with its own stop signal.
struct Task {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Task {
    fn spawn<F, Fut>(name: &'static str, start: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stopped) = watch::channel(false);
        Self {
            name,
            stop,
            handle: tokio::spawn(start(stopped)),
        }
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "background task failed");
        }
        debug!(task = self.name, "background task stopped");
    }
}

/// Background tasks, stopped producer first so that every entity event
/// fired before shutdown still reaches the final flush.
struct Background {
    bus: EventBus,
    executor: Task,
    listener: Task,
    flusher: Task,
    changes: Task,
}

impl Background {
    fn spawn(
        config: &FleetConfig,
        bus: &EventBus,
        coalescer: &Arc<ChangeCoalescer>,
        executor: &RolloutExecutor,
    ) -> Self {
        let listener = {
            let (stop, stopped) = watch::channel(false);
            Task {
                name: "change listener",
                stop,
                handle: coalescer.clone().spawn_listener(bus, stopped),
            }
        };

        let flusher = {
            let coalescer = coalescer.clone();
            let events = config.events.clone();
            Task::spawn("change flusher", move |stopped| async move {
                coalescer
                    .run(events.initial_delay(), events.flush_interval(), stopped)
                    .await;
            })
        };

        let changes = {
            let receiver = bus.subscribe_changes();
            Task::spawn("change log", move |stopped| log_changes(receiver, stopped))
        };

        let executor = {
            let executor = executor.clone();
            let interval = config.rollout.check_interval();
            Task::spawn("rollout executor", move |stopped| async move {
                executor.run(interval, stopped).await;
            })
        };

        Self {
            bus: bus.clone(),
            executor,
            listener,
            flusher,
            changes,
        }
    }

    async fn shutdown(self) {
        self.executor.stop().await;
        self.listener.stop().await;
        self.flusher.stop().await;
        self.changes.stop().await;
        self.bus.close();
    }
}

/// Local consumer of coalesced notifications.
async fn log_changes(
    mut changes: broadcast::Receiver<ChangeNotification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = changes.recv() => match received {
                Ok(notification) => debug!(%notification, "change notification"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change notification consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => {
                while let Ok(notification) = changes.try_recv() {
                    debug!(%notification, "change notification");
                }
                break;
            }
        }
    }
}
