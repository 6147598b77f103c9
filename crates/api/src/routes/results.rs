//! Questionnaire results. Summaries are always visible; full scores are
//! gated on the subscription status.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use mindscore_shared::{NewTestResult, SubscriptionStatus, TestKind, TestResult};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct ResultSummary {
    pub id: Uuid,
    pub test_kind: TestKind,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    /// Whether `GET /results/{id}` will return the full scores.
    pub unlocked: bool,
}

#[derive(Debug, Serialize)]
pub struct ResultListResponse {
    pub results: Vec<ResultSummary>,
    pub subscription_status: SubscriptionStatus,
}

fn summary(result: &TestResult, unlocked: bool) -> ResultSummary {
    ResultSummary {
        id: result.id,
        test_kind: result.test_kind,
        completed_at: result.completed_at,
        unlocked,
    }
}

/// Store a finished questionnaire for the caller.
pub async fn create_result(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(input): Json<NewTestResult>,
) -> ApiResult<(StatusCode, Json<ResultSummary>)> {
    let result = TestResult::insert(&state.pool, auth_user.user_id, &input).await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        result_id = %result.id,
        test_kind = %result.test_kind,
        "Stored test result"
    );

    let unlocked = auth_user.subscription_status.grants_access();
    Ok((StatusCode::CREATED, Json(summary(&result, unlocked))))
}

pub async fn list_results(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ResultListResponse>> {
    let unlocked = auth_user.subscription_status.grants_access();
    let results = TestResult::list_for_user(&state.pool, auth_user.user_id)
        .await?
        .iter()
        .map(|r| summary(r, unlocked))
        .collect();

    Ok(Json(ResultListResponse {
        results,
        subscription_status: auth_user.subscription_status,
    }))
}

/// Full scores and answers. 402 unless the caller's status grants access.
pub async fn get_result(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(result_id): Path<Uuid>,
) -> ApiResult<Json<TestResult>> {
    let result = TestResult::find_for_user(&state.pool, auth_user.user_id, result_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if !auth_user.subscription_status.grants_access() {
        tracing::debug!(
            user_id = %auth_user.user_id,
            status = %auth_user.subscription_status.as_str(),
            "Result details denied"
        );
        return Err(ApiError::PaymentRequired);
    }

    Ok(Json(result))
}
