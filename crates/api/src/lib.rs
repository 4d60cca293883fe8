//! HTTP API: attachment submission, upload status, and the process wiring around them.

pub mod app;
pub mod context;
pub mod middleware;
