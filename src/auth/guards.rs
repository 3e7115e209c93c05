use rocket::Request;
use rocket::State;
use rocket::request::{FromRequest, Outcome};
use rocket_okapi::request::OpenApiFromRequest;

use crate::auth::{AdminAuthError, AdminAuthResult, AdminConfig};

/// Proof that the request carried the configured admin bearer token.
#[derive(Debug, OpenApiFromRequest)]
pub struct AdminToken;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminToken {
    type Error = AdminAuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match authorize(request).await {
            Ok(()) => Outcome::Success(AdminToken),
            Err(err) => {
                log::debug!("admin request rejected: {}", err);
                Outcome::Error((err.status(), err))
            }
        }
    }
}

async fn authorize(request: &Request<'_>) -> AdminAuthResult<()> {
    let config = request
        .guard::<&State<AdminConfig>>()
        .await
        .succeeded()
        .ok_or_else(|| AdminAuthError::Config("AdminConfig missing from state".into()))?;

    let token = bearer_token_from_request(request)?;
    if config.verify(token) {
        Ok(())
    } else {
        Err(AdminAuthError::InvalidToken)
    }
}

fn bearer_token_from_request<'a>(request: &'a Request<'_>) -> AdminAuthResult<&'a str> {
    let header = request
        .headers()
        .get_one("Authorization")
        .ok_or(AdminAuthError::MissingToken)?;
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    if scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty() {
        Ok(token)
    } else {
        Err(AdminAuthError::MissingToken)
    }
}
