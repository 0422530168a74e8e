// ABOUTME: Error types for the grapevine-auth crate.
// ABOUTME: Separates transport, endpoint, and credential-validation failures.

use thiserror::Error;

/// Errors that can occur while producing a session.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The HTTP request itself failed (DNS, TLS, connect, body read).
    #[error("authentication request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint answered with a non-success status.
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    /// The user-info endpoint answered with a non-success status.
    #[error("user info endpoint returned {status}: {body}")]
    UserInfo { status: u16, body: String },

    /// The session login call answered with a non-success status.
    #[error("session login returned {status}: {body}")]
    SessionLogin { status: u16, body: String },

    /// A response was syntactically valid but missing an expected element.
    #[error("login response missing '{0}'")]
    MissingField(&'static str),

    /// A response body could not be parsed.
    #[error("unexpected response from identity endpoint: {0}")]
    InvalidResponse(String),

    /// Building or signing the JWT assertion failed.
    #[error("failed to sign JWT assertion: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Organization ids are exactly 15 or 18 characters.
    #[error("organization ID must be 15 or 18 characters, got {len} ('{id}')")]
    InvalidOrganizationId { id: String, len: usize },

    /// Instance URLs must use the https scheme.
    #[error("instance URL must use https: '{0}'")]
    InsecureInstanceUrl(String),
}
