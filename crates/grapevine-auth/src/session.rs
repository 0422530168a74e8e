// ABOUTME: Session metadata produced by authentication and its validation rules.
// ABOUTME: One SessionMetadata is owned per transport connection, immutable after creation.

use crate::error::AuthError;

/// Credentials and identity attached to one bus connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    /// Bearer token presented on every RPC.
    pub access_token: String,
    /// Base URL of the tenant instance; always an https URL.
    pub instance_url: String,
    /// Tenant identifier, 15 or 18 characters.
    pub organization_id: String,
    /// Principal the session was issued for, when the flow reports one.
    pub username: Option<String>,
}

/// Check that a tenant id has the canonical 15- or 18-character form.
pub fn validate_organization_id(id: &str) -> Result<(), AuthError> {
    let len = id.chars().count();
    if len == 15 || len == 18 {
        Ok(())
    } else {
        Err(AuthError::InvalidOrganizationId { id: id.to_string(), len })
    }
}

/// Check that an instance URL uses the secure scheme.
pub fn validate_instance_url(url: &str) -> Result<(), AuthError> {
    if url.starts_with("https://") {
        Ok(())
    } else {
        Err(AuthError::InsecureInstanceUrl(url.to_string()))
    }
}

/// Derive the tenant id embedded in a session token: everything before the
/// first `!`.
pub fn derive_organization_id(access_token: &str) -> String {
    access_token
        .split('!')
        .next()
        .unwrap_or_default()
        .to_string()
}
