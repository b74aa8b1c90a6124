//! Periodic background schedulers
//!
//! Four loops, all owned by the server process:
//! - digest flush: consolidated auto-auth digests per project
//! - cache sweep: TTL eviction for the categorization cache
//! - classifier retrain: keeps the ML tier fresh
//! - health pass: R6 sweep over stale pending rows plus missing-info
//!   follow-ups

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info};

use crate::AppState;

pub fn start_schedulers(state: Arc<AppState>) {
    start_digest_loop(state.clone());
    start_cache_sweep_loop(state.clone());
    start_retrain_loop(state.clone());
    start_health_loop(state);
}

fn start_digest_loop(state: Arc<AppState>) {
    let hours = state.config.digest_interval_hours.max(1);
    info!("Digest scheduler: every {}h", hours);
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(hours * 3600));
        ticker.tick().await; // no flush at startup
        loop {
            ticker.tick().await;
            match state.db.projects_with_undigested_reports() {
                Ok(projects) => {
                    for project in projects {
                        if let Err(e) = state.engine.flush_digest(project) {
                            error!(project = %project, error = %e, "Digest flush failed");
                        }
                    }
                }
                Err(e) => error!(error = %e, "Digest scan failed"),
            }
        }
    });
}

fn start_cache_sweep_loop(state: Arc<AppState>) {
    let ttl_days = state.config.cache_ttl_days;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(24 * 3600));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.db.cache_sweep(ttl_days) {
                Ok(removed) if removed > 0 => {
                    info!(removed, "Cache sweep removed stale entries")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Cache sweep failed"),
            }
        }
    });
}

fn start_retrain_loop(state: Arc<AppState>) {
    let hours = state.config.retrain_interval_hours.max(1);
    info!("Classifier retrain: every {}h", hours);
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(hours * 3600));
        loop {
            ticker.tick().await;
            let db = state.db.clone();
            let classifier = state.classifier.clone();
            let result =
                tokio::task::spawn_blocking(move || classifier.ensure_trained(&db)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Classifier retrain failed"),
                Err(e) => error!(error = %e, "Classifier retrain panicked"),
            }
        }
    });
}

fn start_health_loop(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(24 * 3600));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = state.engine.health_sweep().await {
                error!(error = %e, "Health sweep failed");
            }
            match state.engine.run_followups() {
                Ok((reminded, escalated, stale)) => {
                    if reminded + escalated + stale > 0 {
                        info!(reminded, escalated, stale, "Missing-info follow-ups sent");
                    }
                }
                Err(e) => error!(error = %e, "Follow-up pass failed"),
            }
        }
    });
}
