use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::router;

#[derive(Debug, Default, Deserialize)]
pub struct AcceptQuery {
    pub id: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ApiError {
    #[error("Missing required id parameter")]
    MissingId,
    #[error("Invalid id parameter, must be an integer")]
    InvalidId,
    #[error("Method not allowed")]
    MethodNotAllowed,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingId | ApiError::InvalidId => {
                (StatusCode::BAD_REQUEST, format!("{self}\n"))
            }
            ApiError::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, format!("{self}\n"))
            }
        }
        .into_response()
    }
}

/// An empty `id` counts as missing.
pub fn parse_id(raw: Option<&str>) -> Result<i64, ApiError> {
    match raw {
        None | Some("") => Err(ApiError::MissingId),
        Some(raw) => raw.parse::<i64>().map_err(|_| ApiError::InvalidId),
    }
}

/// `GET /api/verve/accept?id=<i64>[&endpoint=<url>]`
///
/// Store failures are not surfaced as HTTP errors: the request still gets a
/// 200, with `failed` instead of `ok` in the body.
#[instrument(skip_all, fields(id, endpoint))]
pub async fn accept(
    state: State<router::State>,
    method: Method,
    Query(query): Query<AcceptQuery>,
) -> Result<&'static str, ApiError> {
    // axum answers HEAD with the GET handler, HEAD must not record anything
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed);
    }

    let id = parse_id(query.id.as_deref())?;
    let endpoint = query.endpoint.as_deref().filter(|e| !e.is_empty());

    tracing::Span::current().record("id", id);
    if let Some(endpoint) = endpoint {
        tracing::Span::current().record("endpoint", endpoint);
    }

    match state.collector.process_request(id, endpoint).await {
        Ok(minute) => {
            debug!(%minute, "recorded id");
            Ok("ok\n")
        }
        Err(_) => Ok("failed\n"),
    }
}
