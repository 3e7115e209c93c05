//! HTTP route handlers grouped by resource domain.
//!
//! Handlers are annotated with `#[openapi]` so `rocket_okapi` can derive an
//! OpenAPI document. Everything under `/admin` requires the [`AdminToken`]
//! guard.
//!
//! [`AdminToken`]: crate::auth::AdminToken

pub mod admin;
pub mod failed_emails;
pub mod health;
pub mod subscribers;
