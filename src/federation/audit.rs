//! Delivery audit trail
//!
//! Persists one `DeliveryEvent` per fan-out and one `DeliveryEventItem`
//! per destination.

use std::sync::Arc;

use chrono::Utc;

use super::retry::DestinationDelivery;
use crate::data::{Database, DeliveryEvent, DeliveryEventItem, DeliveryEventResult, EntityId};
use crate::error::AppError;
use crate::metrics::DELIVERY_EVENTS;

/// Summary of a concluded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub result: DeliveryEventResult,
    pub succeeded: usize,
    pub failed: usize,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct DeliveryAudit {
    db: Arc<Database>,
}

impl DeliveryAudit {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a `waiting` event and return its id.
    pub async fn open(
        &self,
        event_type: &str,
        actor_uri: &str,
        activity_uri: &str,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let event = DeliveryEvent {
            id: EntityId::new().0,
            event_type: event_type.to_string(),
            actor_uri: actor_uri.to_string(),
            activity_uri: activity_uri.to_string(),
            result: DeliveryEventResult::Waiting,
            attempts: 0,
            start_at: None,
            end_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_delivery_event(&event).await?;
        Ok(event.id)
    }

    /// Mark the event `processing`; called right before the first attempt.
    pub async fn start(&self, event_id: &str) -> Result<(), AppError> {
        if !self.db.mark_delivery_event_processing(event_id, Utc::now()).await? {
            tracing::warn!(event_id, "Delivery event was no longer waiting");
        }
        Ok(())
    }

    /// Append the terminal record of one destination, with its own timing.
    pub async fn record_item(&self, event_id: &str, destination: &DestinationDelivery) -> Result<(), AppError> {
        let now = Utc::now();
        let item = DeliveryEventItem {
            id: EntityId::new().0,
            event_id: event_id.to_string(),
            url: destination.url.clone(),
            is_success: destination.is_delivered(),
            attempts: i64::from(destination.attempts()),
            error_message: destination.last_error().map(str::to_string),
            start_at: destination.started_at().unwrap_or(now),
            end_at: destination.finished_at().unwrap_or(now),
            created_at: now,
        };
        self.db.insert_delivery_event_item(&item).await
    }

    /// Compute and store the terminal result from the items persisted for the event.
    pub async fn conclude(&self, event_id: &str) -> Result<DeliveryReport, AppError> {
        let totals = self.db.delivery_event_item_totals(event_id).await?;
        let succeeded = usize::try_from(totals.succeeded).unwrap_or_default();
        let failed = usize::try_from(totals.failed).unwrap_or_default();
        let result = DeliveryEventResult::conclude(succeeded, failed);

        let error_message = (failed > 0)
            .then(|| format!("{} of {} destinations failed", failed, succeeded + failed));
        self.finish(event_id, result, totals.attempts, error_message.as_deref())
            .await?;

        Ok(DeliveryReport {
            result,
            succeeded,
            failed,
            attempts: u32::try_from(totals.attempts).unwrap_or(u32::MAX),
        })
    }

    /// Close an event that cannot complete normally.
    ///
    /// Destinations without a stored item count as failed, so the result is
    /// `finishedWithErrors` if any stored item succeeded and `failed` otherwise.
    pub async fn abandon(&self, event_id: &str, reason: &str) -> Result<DeliveryEventResult, AppError> {
        let totals = self.db.delivery_event_item_totals(event_id).await?;
        let result = if totals.succeeded > 0 {
            DeliveryEventResult::FinishedWithErrors
        } else {
            DeliveryEventResult::Failed
        };
        let error_message = format!("Delivery abandoned: {}", reason);
        self.finish(event_id, result, totals.attempts, Some(&error_message))
            .await?;
        Ok(result)
    }

    /// Abandon every event left `waiting` or `processing` by a previous run.
    pub async fn recover(&self) -> Result<usize, AppError> {
        let ids = self.db.list_unfinished_delivery_event_ids().await?;
        for id in &ids {
            let result = self.abandon(id, "interrupted before completion").await?;
            tracing::warn!(event_id = %id, result = result.as_str(), "Recovered unfinished delivery event");
        }
        Ok(ids.len())
    }

    async fn finish(
        &self,
        event_id: &str,
        result: DeliveryEventResult,
        attempts: i64,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        let updated = self
            .db
            .finish_delivery_event(event_id, result, attempts, Utc::now(), error_message)
            .await?;
        if updated {
            DELIVERY_EVENTS.with_label_values(&[result.as_str()]).inc();
        } else {
            tracing::warn!(event_id, "Delivery event already terminal; result left unchanged");
        }
        Ok(())
    }
}
