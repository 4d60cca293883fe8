/// Correlation id for one request.
///
/// Taken from the caller's `x-request-id` header when it is usable, generated otherwise.
/// It is echoed back on the response and carried inside queued jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}
