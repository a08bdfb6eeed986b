//! The periodic supervisor.
//!
//! Once per `periodic_interval` the supervisor tops up the dialed connections of an active persistent gateway,
//! expires overdue exchanges, and stops the gateway if any task flagged a fatal condition.

use std::{sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use crate::{bus::ServiceBus, config::Role, gateway::Shared};

/// What one supervisor tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Dials started in the background, one per reserved slot.
    pub dials_started: u32,
    /// Exchanges expired by the sweep.
    pub expired: usize,
    /// Set when a fatal condition was found; the gateway is shutting down.
    pub shutdown_requested: Option<String>,
}

pub(crate) async fn run<B: ServiceBus>(shared: Arc<Shared<B>>) {
    let mut interval = time::interval(shared.config.periodic_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {
                if tick(&shared).shutdown_requested.is_some() {
                    break;
                }
            }
        }
    }
    debug!(gateway = %shared.config.name, "supervisor stopped");
}

/// Runs one tick. Never waits on the network: dials run as tracked tasks, so the sweep is not held up by a slow
/// or unreachable target.
pub(crate) fn tick<B: ServiceBus>(shared: &Arc<Shared<B>>) -> TickReport {
    let mut report = TickReport::default();

    if let Some(reason) = shared.fatal_reason() {
        error!(gateway = %shared.config.name, %reason, "shutdown requested");
        shared.shutdown.cancel();
        report.shutdown_requested = Some(reason);
        return report;
    }

    // Bus-to-net connections are dialed per send, not kept up.
    if shared.config.role == Role::Active
        && shared.config.reply_mode.is_persistent()
        && !shared.shutdown.is_cancelled()
    {
        // Slots are reserved here, so dials still in flight from an earlier tick are not doubled.
        while let Ok(id) = shared.registry.allocate() {
            let dialer = shared.clone();
            shared.tasks.spawn(async move {
                match dialer.dial_slot(id).await {
                    Ok(conn) => trace!(conn = %conn.id(), "dialed"),
                    Err(err) => {
                        warn!(address = %dialer.config.address, error = %err, "dial failed")
                    }
                }
            });
            report.dials_started += 1;
        }
    }

    report.expired = shared.correlations.sweep(Instant::now());
    if report.expired > 0 {
        debug!(expired = report.expired, "swept overdue exchanges");
    }
    report
}
