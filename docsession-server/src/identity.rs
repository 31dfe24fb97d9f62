//! Requestor identity for HTTP handlers.
//!
//! Authentication happens upstream (a reverse proxy or gateway); this daemon
//! only reads the identity it forwards in request headers. Requests without
//! identity headers fall back to the daemon's default provider.

use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};
use docsession_core::IdentityProvider;
use docsession_types::Identity;

use crate::server::AppState;

pub const GROUP_HEADER: &str = "x-docsession-group";
pub const USER_HEADER: &str = "x-docsession-user";

/// Identity of the caller of the current request.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity(pub Identity);

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

impl FromRequestParts<AppState> for RequestIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let identity = Identity::new(header(parts, GROUP_HEADER), header(parts, USER_HEADER));
        if identity.is_anonymous() {
            return Ok(RequestIdentity(state.default_identity.current_identity()));
        }
        Ok(RequestIdentity(identity))
    }
}
