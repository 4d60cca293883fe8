use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use postline_core::DomainError;
use postline_infra::cache::CacheError;
use postline_infra::posts::DirectoryError;
use postline_queue::QueueError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn invalid_id_response(code: &'static str, err: DomainError) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, code, err.to_string())
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    tracing::error!(error = %err, "job queue unavailable");
    json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", err.to_string())
}

pub fn cache_error_to_response(err: CacheError) -> axum::response::Response {
    tracing::error!(error = %err, "status store unavailable");
    json_error(StatusCode::SERVICE_UNAVAILABLE, "status_unavailable", err.to_string())
}

pub fn directory_error_to_response(err: DirectoryError) -> axum::response::Response {
    tracing::error!(error = %err, "post directory unavailable");
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "post_directory_unavailable",
        err.to_string(),
    )
}

pub fn join_error_to_response(err: tokio::task::JoinError) -> axum::response::Response {
    tracing::error!(error = %err, "blocking task failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
}
