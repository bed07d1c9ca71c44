//! Admin API request and response DTOs

use serde::{Deserialize, Serialize};

use crate::data::{DeliveryEventFilter, DeliveryEventResult, DeliveryEventSort, Page};
use crate::error::AppError;

/// Paged listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedResponse<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: i64,
}

impl<T> PagedResponse<T> {
    pub fn new(data: Vec<T>, page: Page, total: i64) -> Self {
        Self {
            data,
            page: page.page,
            size: page.size,
            total,
        }
    }
}

/// Query string of `GET /admin/delivery-events`
#[derive(Debug, Default, Deserialize)]
pub struct DeliveryEventQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub result: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

impl DeliveryEventQuery {
    pub fn page(&self) -> Page {
        paging(self.page, self.size)
    }

    pub fn filter(&self) -> Result<DeliveryEventFilter, AppError> {
        let result = self
            .result
            .as_deref()
            .map(|value| {
                DeliveryEventResult::parse(value)
                    .ok_or_else(|| AppError::Validation(format!("Unknown result: {}", value)))
            })
            .transpose()?;

        let sort = self
            .sort
            .as_deref()
            .map(|value| {
                DeliveryEventSort::parse(value)
                    .ok_or_else(|| AppError::Validation(format!("Unknown sort: {}", value)))
            })
            .transpose()?
            .unwrap_or_default();

        let ascending = match self.order.as_deref() {
            None | Some("desc") => false,
            Some("asc") => true,
            Some(other) => {
                return Err(AppError::Validation(format!("Unknown order: {}", other)));
            }
        };

        Ok(DeliveryEventFilter {
            event_type: self.event_type.clone().filter(|t| !t.is_empty()),
            result,
            sort,
            ascending,
        })
    }
}

/// Query string of `GET /admin/delivery-events/:id/items`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryItemQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
    #[serde(default)]
    pub only_errors: bool,
}

impl DeliveryItemQuery {
    pub fn page(&self) -> Page {
        paging(self.page, self.size)
    }
}

fn paging(page: Option<u32>, size: Option<u32>) -> Page {
    let default = Page::default();
    Page::new(page.unwrap_or(default.page), size.unwrap_or(default.size))
}

/// Body of `POST /admin/domain-blocks`
#[derive(Debug, Deserialize)]
pub struct BlockDomainRequest {
    pub domain: String,
    pub reason: Option<String>,
}

/// Body of `POST /admin/follow-requests/:decision`
#[derive(Debug, Deserialize)]
pub struct FollowRequestDecision {
    pub follower: String,
    pub target: String,
}
