//! User endpoints.
//!
//! Identifiers are validated here: a malformed id never reaches the service.

use crate::api::ApiState;
use crate::api::error::ApiError;
use crate::api::extractors::RequestContext;
use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use user_service_core::cache::ProjectionCache;
use user_service_core::store::UserStore;
use user_service_core::{User, UserId, UserShortProjection};

/// Upper bound on ids per batch request.
pub const MAX_BATCH_IDS: usize = 500;

/// Full user record as served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    /// Internal identifier.
    pub id: UserId,
    /// Natural key.
    pub username: String,
    /// Public display name.
    pub display_name: String,
    /// Avatar URL.
    pub image_url: Option<String>,
    /// Free-form status.
    pub status_text: Option<String>,
    /// Creation time derived from the id.
    pub created_at: Option<DateTime<Utc>>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            created_at: user.created_at(),
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            image_url: user.image_url,
            status_text: user.status_text,
            updated_at: user.updated_at,
        }
    }
}

/// Body of `PUT /v1/users/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    /// New display name.
    pub display_name: String,
    /// New avatar URL, `null` to clear.
    #[serde(default)]
    pub image_url: Option<String>,
    /// New status, `null` to clear.
    #[serde(default)]
    pub status_text: Option<String>,
}

/// Query of `GET /v1/users/short`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShortQuery {
    /// Look up by id.
    pub id: Option<String>,
    /// Look up by username.
    pub username: Option<String>,
}

/// Body of `POST /v1/users/short/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Ids to look up.
    pub ids: Vec<String>,
}

/// Response of `POST /v1/users/short/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Projections of the requested users that exist.
    pub users: Vec<UserShortProjection>,
}

fn parse_id(raw: &str) -> Result<UserId, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{raw:?} is not a valid user id")))
}

/// `GET /v1/users/{id}`: the caller's own full record.
pub async fn get_user<S: UserStore, C: ProjectionCache>(
    State(state): State<ApiState<S, C>>,
    RequestContext(ctx): RequestContext,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    let id = parse_id(&id)?;
    let user = state.service.get(&ctx, id).await?;
    Ok(Json(user.into()))
}

/// `PUT /v1/users/{id}`: overwrite the caller's display fields.
pub async fn update_user<S: UserStore, C: ProjectionCache>(
    State(state): State<ApiState<S, C>>,
    RequestContext(ctx): RequestContext,
    Path(id): Path<String>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let id = parse_id(&id)?;
    let mut user = state.service.get(&ctx, id).await?;
    user.display_name = request.display_name;
    user.image_url = request.image_url;
    user.status_text = request.status_text;

    state.service.update(&ctx, &user).await?;
    let updated = state.service.get(&ctx, id).await?;
    Ok(Json(updated.into()))
}

/// `GET /v1/users/short?id=…` or `?username=…`.
pub async fn get_short_projection<S: UserStore, C: ProjectionCache>(
    State(state): State<ApiState<S, C>>,
    RequestContext(ctx): RequestContext,
    Query(query): Query<ShortQuery>,
) -> Result<Json<UserShortProjection>, ApiError> {
    let projection = match (query.id.as_deref(), query.username.as_deref()) {
        (Some(id), None) => {
            let id = parse_id(id)?;
            state.service.get_short_projection(&ctx, id).await?
        }
        (None, Some(username)) if !username.trim().is_empty() => {
            state
                .service
                .get_short_projection_by_username(&ctx, username.trim())
                .await?
        }
        (Some(_), Some(_)) => {
            return Err(ApiError::bad_request("specify either id or username, not both"));
        }
        _ => return Err(ApiError::bad_request("id or username is required")),
    };
    Ok(Json(projection))
}

/// `POST /v1/users/short/batch`.
pub async fn batch_get_short_projections<S: UserStore, C: ProjectionCache>(
    State(state): State<ApiState<S, C>>,
    RequestContext(ctx): RequestContext,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    if request.ids.is_empty() {
        return Err(ApiError::bad_request("ids must not be empty"));
    }
    if request.ids.len() > MAX_BATCH_IDS {
        return Err(ApiError::bad_request(format!(
            "at most {MAX_BATCH_IDS} ids per request"
        )));
    }
    let ids = request
        .ids
        .iter()
        .map(String::as_str)
        .map(parse_id)
        .collect::<Result<Vec<_>, _>>()?;

    let users = state.service.batch_get_short_projections(&ctx, &ids).await?;
    Ok(Json(BatchResponse { users }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn response_derives_creation_time_from_id() {
        let user = User::registered("alice");
        let created_at = user.created_at();
        let response = UserResponse::from(user);
        assert_eq!(response.created_at, created_at);
        assert!(response.created_at.is_some());
    }

    #[test]
    fn malformed_id_is_a_bad_request() {
        let error = parse_id("1234").unwrap_err();
        assert_eq!(error.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
