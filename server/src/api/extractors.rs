//! Request extractors.

use crate::api::error::ApiError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use user_service_core::{OperationContext, UserId};
use uuid::Uuid;

/// Header carrying the authenticated caller, set by the gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Correlation id from `x-correlation-id`, or a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok())
            .unwrap_or_else(Uuid::new_v4);
        Ok(Self(id))
    }
}

/// Authenticated caller from `x-user-id`, if present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Option<UserId>);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_ID_HEADER) else {
            return Ok(Self(None));
        };
        let caller = value
            .to_str()
            .ok()
            .and_then(|value| value.parse::<UserId>().ok())
            .ok_or_else(|| ApiError::bad_request(format!("{USER_ID_HEADER} is not a valid user id")))?;
        Ok(Self(Some(caller)))
    }
}

/// Operation context of a request: correlation id plus caller.
#[derive(Debug, Clone)]
pub struct RequestContext(pub OperationContext);

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Ok(CorrelationId(correlation_id)) = CorrelationId::from_request_parts(parts, state).await;
        let Caller(caller) = Caller::from_request_parts(parts, state).await?;

        let ctx = OperationContext::new().with_correlation_id(correlation_id);
        Ok(Self(match caller {
            Some(caller) => ctx.with_caller(caller),
            None => ctx,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut request = Request::builder().uri("/");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn correlation_id_is_read_from_header() {
        let id = Uuid::new_v4();
        let mut parts = parts(&[(CORRELATION_ID_HEADER, &id.to_string())]);
        let Ok(extracted) = CorrelationId::from_request_parts(&mut parts, &()).await;
        assert_eq!(extracted, CorrelationId(id));
    }

    #[tokio::test]
    async fn malformed_caller_is_rejected() {
        let mut parts = parts(&[(USER_ID_HEADER, "not-a-uuid")]);
        let rejection = Caller::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(rejection.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn context_carries_the_caller() {
        let caller = UserId::new();
        let mut parts = parts(&[(USER_ID_HEADER, &caller.to_string())]);
        let RequestContext(ctx) = RequestContext::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(ctx.caller(), Some(caller));
    }
}
