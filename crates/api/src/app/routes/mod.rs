use axum::{
    Router,
    routing::{get, post},
};

pub mod status;
pub mod system;
pub mod uploads;

pub fn router() -> Router {
    Router::new()
        .route("/posts/:post_id/attachments", post(uploads::submit_attachment))
        .route("/uploads/:upload_id", get(status::snapshot))
        .route("/uploads/:upload_id/status", get(status::stream_status))
}
