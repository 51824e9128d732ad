use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use common::storage::types::user::User;

use crate::{error::GatewayError, state::GatewayState};

/// Resolve the bearer token to a user and stash it in request extensions.
pub async fn bearer_auth(
    State(state): State<GatewayState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let token = extract_bearer_token(&request)
        .ok_or_else(|| GatewayError::Unauthorized("You have to be authenticated".to_string()))?;

    let user = User::find_by_api_token(&token, &state.db).await?;
    let user = user
        .ok_or_else(|| GatewayError::Unauthorized("You have to be authenticated".to_string()))?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer ").map(str::trim))
        .map(String::from)
}
