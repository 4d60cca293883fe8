//! Upload status: a one-shot JSON snapshot and a server-push stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use serde::Serialize;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

use postline_core::UploadId;
use postline_infra::cache::CacheError;
use postline_infra::notifier::{self, StatusFrame};

use crate::app::errors::{cache_error_to_response, invalid_id_response, join_error_to_response};
use crate::app::services::AppServices;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub upload_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// GET /uploads/:upload_id
pub async fn snapshot(
    Extension(services): Extension<Arc<AppServices>>,
    Path(upload_id): Path<String>,
) -> Response {
    let upload_id = match UploadId::parse(&upload_id) {
        Ok(id) => id,
        Err(e) => return invalid_id_response("invalid_upload_id", e),
    };

    let statuses = services.statuses.clone();
    let id = upload_id.clone();
    let read = tokio::task::spawn_blocking(move || {
        let status = statuses.get(&id)?;
        let location = if status.is_terminal() {
            statuses.location(&id)?
        } else {
            None
        };
        Ok::<_, CacheError>((status, location))
    })
    .await;

    match read {
        Ok(Ok((status, location))) => Json(StatusSnapshot {
            upload_id: upload_id.to_string(),
            status: status.as_str(),
            location,
        })
        .into_response(),
        Ok(Err(e)) => cache_error_to_response(e),
        Err(e) => join_error_to_response(e),
    }
}

/// GET /uploads/:upload_id/status
///
/// Streams `data: <status>` each time the upload moves forward and closes after
/// `success` or `failed`. A store failure ends the stream with one `event: error` frame.
pub async fn stream_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(upload_id): Path<String>,
) -> Response {
    let upload_id = match UploadId::parse(&upload_id) {
        Ok(id) => id,
        Err(e) => return invalid_id_response("invalid_upload_id", e),
    };

    tracing::debug!(upload_id = %upload_id, "status stream opened");
    let (rx, _task) = notifier::watch(
        services.statuses.clone(),
        upload_id,
        services.settings.poll_interval,
    );

    // Dropping the response body drops `rx`, which stops the poll task.
    let stream = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(to_sse_event(frame)));

    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

    (
        headers,
        Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)),
    )
        .into_response()
}

fn to_sse_event(frame: StatusFrame) -> SseEvent {
    match frame {
        StatusFrame::Status(status) => SseEvent::default().data(status.as_str()),
        StatusFrame::Error(message) => SseEvent::default().event("error").data(message),
    }
}
