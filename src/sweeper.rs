//! Background TTL sweeper (`spec.md` §3, §5 — period 3 hours by default).

use chrono::Utc;

use crate::call_store::CallStore;

pub async fn run(calls: CallStore, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; skip it so sweeping starts a full
    // period after startup rather than at t=0.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        calls.sweep_expired(Utc::now());
    }
}
