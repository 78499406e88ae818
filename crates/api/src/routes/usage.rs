//! Usage ledger endpoints

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use nutravive_membership::{
    UsageAnalytics, UsageFilters, UsageItemInput, UsagePeriod, UsageUpdateResult,
};
use nutravive_shared::UserId;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageItemRequest {
    pub category_id: String,
    pub category_name: String,
    pub product_name: String,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyUsageRequest {
    pub user_id: Uuid,
    pub order_number: String,
    pub items: Vec<UsageItemRequest>,
}

/// Debit an order's items against the caller's active membership
pub async fn apply_usage(
    State(state): State<AppState>,
    Json(request): Json<ApplyUsageRequest>,
) -> ApiResult<Json<UsageUpdateResult>> {
    if request.order_number.trim().is_empty() {
        return Err(ApiError::Validation("orderNumber is required".to_string()));
    }
    validate_items(&request.items)?;

    let items: Vec<UsageItemInput> = request
        .items
        .into_iter()
        .map(|item| UsageItemInput {
            category_id: item.category_id,
            category_name: item.category_name,
            product_name: item.product_name,
            quantity: item.quantity,
        })
        .collect();

    let result = state
        .ledger
        .apply_usage(UserId(request.user_id), &request.order_number, &items)
        .await?;

    Ok(Json(result))
}

/// A debit must carry at least one item, each with a positive quantity;
/// zero or negative quantities would credit usage back through the ledger.
fn validate_items(items: &[UsageItemRequest]) -> Result<(), ApiError> {
    if items.is_empty() {
        return Err(ApiError::Validation(
            "at least one item is required".to_string(),
        ));
    }
    for item in items {
        if item.quantity < 1 {
            return Err(ApiError::Validation(format!(
                "quantity for category '{}' must be at least 1",
                item.category_id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageQuery {
    pub user_id: Uuid,
    pub period: Option<String>,
    pub category_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
}

/// Usage analytics for the caller's memberships
pub async fn get_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<Vec<UsageAnalytics>>> {
    let period = match query.period.as_deref() {
        None | Some("current") => UsagePeriod::Current,
        Some("all") => UsagePeriod::All,
        Some(other) => {
            return Err(ApiError::Validation(format!(
                "unknown period '{other}', expected 'current' or 'all'"
            )));
        }
    };

    let date_range = match (query.from, query.to) {
        (Some(from), Some(to)) => {
            if from > to {
                return Err(ApiError::Validation(
                    "'from' must not be after 'to'".to_string(),
                ));
            }
            Some((from, to))
        }
        (None, None) => None,
        _ => {
            return Err(ApiError::Validation(
                "'from' and 'to' must be provided together".to_string(),
            ));
        }
    };

    let filters = UsageFilters {
        period,
        category_id: query.category_id,
        date_range,
    };

    let analytics = state
        .ledger
        .get_usage(UserId(query.user_id), &filters)
        .await?;

    Ok(Json(analytics))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(category_id: &str, quantity: i32) -> UsageItemRequest {
        UsageItemRequest {
            category_id: category_id.to_string(),
            category_name: category_id.to_uppercase(),
            product_name: "Detox Tea".to_string(),
            quantity,
        }
    }

    #[test]
    fn test_empty_items_rejected() {
        assert!(matches!(
            validate_items(&[]),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn test_negative_quantity_rejected() {
        assert!(matches!(
            validate_items(&[item("tea", 2), item("juice", -1)]),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_quantity_rejected() {
        assert!(matches!(
            validate_items(&[item("tea", 0)]),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn test_positive_quantities_accepted() {
        assert!(validate_items(&[item("tea", 1), item("juice", 3)]).is_ok());
    }
}
