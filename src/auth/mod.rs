//! Admin authentication: a static bearer token checked by a request guard.

pub mod config;
pub mod error;
pub mod guards;

pub use config::AdminConfig;
pub use error::{AdminAuthError, AdminAuthResult};
pub use guards::AdminToken;
