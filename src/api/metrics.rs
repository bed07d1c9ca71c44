//! Prometheus metrics endpoint
//!
//! Counters are updated where the work happens; queue depth is a gauge
//! sampled from the jobs table on every scrape.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::data::{Database, JobStatus};
use crate::error::AppError;
use crate::federation::queues;
use crate::metrics::{QUEUE_DEPTH, REGISTRY};

const SAMPLED: [(JobStatus, &str); 2] = [(JobStatus::Pending, "pending"), (JobStatus::Running, "running")];

/// Refresh the queue depth gauges from the database
async fn sample_queue_depth(db: &Database) -> Result<(), AppError> {
    for queue in queues::ALL {
        for (status, label) in SAMPLED {
            let depth = db.count_jobs(queue, Some(status)).await?;
            QUEUE_DEPTH.with_label_values(&[queue, label]).set(depth);
        }
    }
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    if let Err(e) = sample_queue_depth(&state.db).await {
        // Serve the counters anyway; the gauges keep their last sample.
        tracing::warn!(error = %e, "Failed to sample queue depth");
    }

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Create metrics router
///
/// Exposes the unauthenticated `/metrics` endpoint.
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::{JobQueue, RetryPolicy};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn queue_depth_reflects_pending_jobs() {
        crate::metrics::init_metrics();
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let policy = RetryPolicy {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        let queue = JobQueue::new(db.clone(), policy);

        queue.enqueue(queues::FOLLOW_RESPONDER, &"{}").await.unwrap();
        queue.enqueue(queues::FOLLOW_RESPONDER, &"{}").await.unwrap();
        sample_queue_depth(&db).await.unwrap();

        let gauge = QUEUE_DEPTH.with_label_values(&[queues::FOLLOW_RESPONDER, "pending"]);
        assert!(gauge.get() >= 2);
    }
}
