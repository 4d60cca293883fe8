//! Attachment submission.
//!
//! `POST /posts/:post_id/attachments` takes a multipart form with one `file` field,
//! queues an upload job, and answers `202 Accepted` before any storage work happens.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Multipart, Path, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use postline_core::{PostId, UploadId, UploadJob, UploadStatus};
use postline_infra::posts::PostDirectory;
use postline_queue::JobQueue;

use crate::app::errors::{
    directory_error_to_response, invalid_id_response, join_error_to_response, json_error,
    queue_error_to_response,
};
use crate::app::services::AppServices;
use crate::context::RequestContext;

const FILE_FIELD: &str = "file";
const DEFAULT_FILE_NAME: &str = "attachment";
const DEFAULT_FILE_TYPE: &str = "application/octet-stream";

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub upload_id: String,
    pub status: &'static str,
    pub status_url: String,
}

struct ReceivedFile {
    name: String,
    content_type: String,
    data: Vec<u8>,
}

pub async fn submit_attachment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(post_id): Path<String>,
    multipart: Multipart,
) -> Response {
    let post_id = match PostId::parse(&post_id) {
        Ok(id) => id,
        Err(e) => return invalid_id_response("invalid_post_id", e),
    };

    match services.posts.post_exists(&post_id).await {
        Ok(true) => {}
        Ok(false) => {
            return json_error(
                StatusCode::NOT_FOUND,
                "post_not_found",
                format!("post {post_id} does not exist"),
            );
        }
        Err(e) => return directory_error_to_response(e),
    }

    let file = match read_file_field(multipart, services.settings.max_upload_bytes).await {
        Ok(file) => file,
        Err(response) => return response,
    };

    let upload_id = UploadId::new();
    let job = match UploadJob::new(
        upload_id.clone(),
        post_id.clone(),
        file.name,
        file.content_type,
        file.data,
    ) {
        Ok(job) => job.with_request_id(ctx.request_id()),
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_file", e.to_string()),
    };

    let payload = match job.to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "encode_error", e.to_string());
        }
    };

    let queue = services.queue.clone();
    let channel = services.settings.upload_channel.clone();
    match tokio::task::spawn_blocking(move || queue.publish(&channel, &payload)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return queue_error_to_response(e),
        Err(e) => return join_error_to_response(e),
    }

    tracing::info!(upload_id = %upload_id, post_id = %post_id, "attachment queued");

    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            status_url: format!("/uploads/{upload_id}/status"),
            upload_id: upload_id.to_string(),
            status: UploadStatus::Pending.as_str(),
        }),
    )
        .into_response()
}

async fn read_file_field(mut multipart: Multipart, max_bytes: usize) -> Result<ReceivedFile, Response> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error_to_response)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let name = field
            .file_name()
            .map(base_name)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_FILE_NAME)
            .to_string();
        let content_type = field
            .content_type()
            .unwrap_or(DEFAULT_FILE_TYPE)
            .to_string();
        let data = field.bytes().await.map_err(multipart_error_to_response)?;

        if data.is_empty() {
            return Err(json_error(StatusCode::BAD_REQUEST, "empty_file", "the file is empty"));
        }
        if data.len() > max_bytes {
            return Err(too_large(max_bytes));
        }

        return Ok(ReceivedFile {
            name,
            content_type,
            data: data.to_vec(),
        });
    }

    Err(json_error(
        StatusCode::BAD_REQUEST,
        "missing_file",
        format!("multipart field {FILE_FIELD:?} is required"),
    ))
}

/// Browsers may send a full client-side path; keep only the last component.
fn base_name(raw: &str) -> &str {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim()
}

fn too_large(max_bytes: usize) -> Response {
    json_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        "file_too_large",
        format!("files are limited to {max_bytes} bytes"),
    )
}

fn multipart_error_to_response(err: MultipartError) -> Response {
    let status = err.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return json_error(status, "file_too_large", err.body_text());
    }
    json_error(status, "invalid_multipart", err.body_text())
}
