//! Background loops: health monitoring, orphan collection and the periodic
//! redundancy scan

use crate::engine::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Feed fabric events into the health tracker and probe nodes every
/// `health_check_interval`; OFFLINE nodes get their blocks repaired.
pub async fn health_loop(engine: Arc<Engine>) {
    let mut events = engine.fabric().subscribe();
    let mut ticker = ticker(engine.config().health_check_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    debug!(peer = %event.peer, kind = ?event.kind, "fabric event");
                    engine.apply_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "health monitor lagged behind fabric events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                let summary = engine.health_tick().await;
                if summary.scanned > 0 {
                    info!(?summary, "offline node repair finished");
                }
            }
        }
    }
}

/// Collect orphaned PENDING blocks every `gc_interval`
pub async fn orphan_gc_loop(engine: Arc<Engine>) {
    let mut ticker = ticker(engine.config().gc_interval());
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match engine.collect_orphans().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "orphan sweep"),
            Err(e) => warn!(error = %e, "orphan sweep failed"),
        }
    }
}

/// Full redundancy scan every `repair_interval`
pub async fn repair_loop(engine: Arc<Engine>) {
    let mut ticker = ticker(engine.config().repair_interval());
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = engine.initiate_repair().await {
            warn!(error = %e, "redundancy scan failed");
        }
    }
}

/// Handles of the engine's background loops
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn spawn(engine: &Arc<Engine>) -> Self {
        let handles = vec![
            tokio::spawn(health_loop(Arc::clone(engine))),
            tokio::spawn(orphan_gc_loop(Arc::clone(engine))),
            tokio::spawn(repair_loop(Arc::clone(engine))),
        ];
        info!(tasks = handles.len(), "engine background tasks started");
        Self { handles }
    }

    /// Stop every loop and wait for it to unwind
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("engine background tasks stopped");
    }
}
