//! Background reaping of retired browsers.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::PoolInner;

/// Periodic scan over retired instances.
///
/// Holds only a `Weak` to the pool, so an undisposed pool that gets dropped
/// still lets the task exit at the next tick.
pub(super) async fn reaper_loop(pool: Weak<PoolInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(pool) = pool.upgrade() else { break };
        if pool.destroyed.load(Ordering::SeqCst) {
            break;
        }
        reap_retired(&pool).await;
    }
    debug!("instance reaper exiting");
}

async fn reap_retired(pool: &Arc<PoolInner>) {
    let retired: Vec<_> = {
        let state = pool.state.lock().await;
        state.retired.values().cloned().collect()
    };

    for instance in retired {
        // Rule 1: too long since the last page was opened.
        if instance.idle_for() > pool.kill_instance_after {
            info!(
                id = instance.id,
                "killing retired browser after {:?} idle",
                instance.idle_for()
            );
            pool.kill_by_id(instance.id).await;
            continue;
        }

        // Rule 2: nothing left but the residual blank tab.
        match instance.browser_if_ready() {
            // still launching; look again next tick
            None => {}
            Some(Err(e)) => {
                warn!(
                    id = instance.id,
                    "killing retired browser whose launch failed: {e:#}"
                );
                pool.kill_by_id(instance.id).await;
            }
            Some(Ok(handle)) => match handle.pages().await {
                Err(e) => {
                    warn!(
                        id = instance.id,
                        "killing retired browser after page listing failed: {e:#}"
                    );
                    pool.kill_by_id(instance.id).await;
                }
                Ok(pages) if pages.len() <= 1 => {
                    debug!(id = instance.id, "killing retired browser with no pages left");
                    pool.kill_by_id(instance.id).await;
                }
                Ok(_) => {}
            },
        }
    }
}
