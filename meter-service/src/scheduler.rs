//! Independent repeating timers for the background loops.

use std::{future::Future, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

/// Delay from `now_ms` until the next multiple of `period` since the epoch.
/// Zero when `now_ms` sits exactly on a boundary.
pub fn next_boundary_delay(now_ms: i64, period: Duration) -> Duration {
    let period_ms = period.as_millis() as i64;
    if period_ms <= 0 {
        return Duration::ZERO;
    }
    let into = now_ms.rem_euclid(period_ms);
    if into == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((period_ms - into) as u64)
    }
}

/// Run `task` every `period`, first after `initial_delay`. A run that overlaps
/// the next tick delays it; missed ticks are skipped rather than bunched.
pub fn spawn_repeating<F, Fut>(name: &'static str, initial_delay: Duration, period: Duration, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + initial_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(task = name, period_ms = period.as_millis() as u64, "scheduled task started");

        loop {
            ticker.tick().await;
            let started = std::time::Instant::now();
            task().await;
            metrics::histogram!("scheduled_task_seconds", "task" => name).record(started.elapsed().as_secs_f64());
        }
    })
}
