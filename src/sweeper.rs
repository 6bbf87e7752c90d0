use crate::clock::Clock;
use crate::config::SweeperConfig;
use crate::flood_control::{FloodControl, SlidingWindowFloodControl};
use crate::store::WindowStore;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Spawns a task that evicts expired requests on a fixed cadence.
///
/// Failed sweeps are logged and retried on the next tick; the task only
/// stops when its handle is aborted.
pub fn spawn_sweeper<S, C>(
    flood_control: Arc<SlidingWindowFloodControl<S, C>>,
    config: &SweeperConfig,
) -> JoinHandle<()>
where
    S: WindowStore + 'static,
    C: Clock + 'static,
{
    let period = config.interval();
    let reconcile_every = config.reconcile_every.filter(|&n| n > 0);

    tokio::spawn(async move {
        info!("Eviction sweeper started, interval {:?}", period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u32 = 0;

        loop {
            ticker.tick().await;
            ticks = ticks.wrapping_add(1);

            match flood_control.remove_old_requests().await {
                Ok(report) if report.evicted > 0 => {
                    debug!("Sweep evicted {} expired requests", report.evicted)
                }
                Ok(_) => {}
                Err(e) => error!("Eviction sweep failed: {}", e),
            }

            if let Some(every) = reconcile_every {
                if ticks % every == 0 {
                    if let Err(e) = flood_control.reconcile().await {
                        error!("Occupancy reconciliation failed: {}", e);
                    }
                }
            }
        }
    })
}
