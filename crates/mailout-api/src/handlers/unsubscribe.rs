//! Unsubscribe handler
//!
//! Every mass mail carries a link to `/unsubscribe/{token}`. Following it
//! opts the recipient out for good. The response never reveals whether the
//! token was known.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::state::AppState;

const CONFIRMATION: &str = "You have been unsubscribed from our mailings.";

fn confirmation(state: &AppState) -> Response {
    match &state.redirect_url {
        Some(url) => Redirect::to(url).into_response(),
        None => (StatusCode::OK, CONFIRMATION).into_response(),
    }
}

/// Opt a recipient out of mass mail (GET and POST)
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Response {
    let Ok(token) = Uuid::parse_str(&token) else {
        debug!(token = %token, "Malformed unsubscribe token");
        return confirmation(&state);
    };

    match state.store.unsubscribe(token).await {
        Ok(Some(recipient)) => info!(%recipient, "Recipient unsubscribed"),
        Ok(None) => debug!(%token, "Unknown unsubscribe token"),
        Err(e) => {
            error!(error = %e, "Failed to record unsubscribe");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }
    confirmation(&state)
}
