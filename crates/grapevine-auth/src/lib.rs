// ABOUTME: Authentication flows for the grapevine event bus client.
// ABOUTME: Four flows (username-password, client-credentials, JWT bearer, user-supplied) produce one SessionMetadata shape.

pub mod config;
pub mod error;
pub mod provider;
pub mod session;

// Flow configuration
pub use config::AuthConfig;

// Error types
pub use error::AuthError;

// Provider
pub use provider::CredentialProvider;

// Session metadata and validation
pub use session::{
    derive_organization_id, validate_instance_url, validate_organization_id, SessionMetadata,
};
