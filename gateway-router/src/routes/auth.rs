use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use common::storage::types::user::User;
use serde::Deserialize;
use serde_json::json;

use crate::{error::GatewayError, state::GatewayState};

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

pub async fn register(
    State(state): State<GatewayState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, GatewayError> {
    if body.username.trim().is_empty() || body.password.len() < 6 {
        return Err(GatewayError::ValidationError(
            "Username must be non-empty and password at least 6 characters".to_string(),
        ));
    }

    let user = User::create_new(
        body.username.trim().to_string(),
        body.password,
        body.email,
        body.display_name,
        &state.db,
    )
    .await?;

    let token = user.api_token.clone().unwrap_or_default();
    Ok((
        StatusCode::CREATED,
        Json(json!({ "token": token, "user": user.public() })),
    ))
}

pub async fn login(
    State(state): State<GatewayState>,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let user = User::authenticate(&body.username, &body.password, &state.db)
        .await?
        .ok_or_else(|| GatewayError::Unauthorized("Invalid username or password".to_string()))?;

    let token = user.api_token.clone().unwrap_or_default();
    Ok(Json(json!({ "token": token, "user": user.public() })))
}

pub async fn me(Extension(user): Extension<User>) -> impl IntoResponse {
    Json(user.public())
}
