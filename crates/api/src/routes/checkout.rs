use axum::{extract::State, Json};

use mindscore_billing::{CheckoutRequest, SipayCheckoutResponse, StripeCheckoutResponse};

use crate::{error::ApiResult, state::AppState};

pub async fn create_stripe_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<StripeCheckoutResponse>> {
    let session = state.billing.checkout.create_stripe_session(&req).await?;
    Ok(Json(session))
}

pub async fn create_sipay_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<SipayCheckoutResponse>> {
    let payment = state.billing.checkout.create_sipay_payment(&req).await?;
    Ok(Json(payment))
}
