// ABOUTME: Error types for the grapevine-client crate.
// ABOUTME: Distinguishes connection, per-RPC, and per-event failures so streams can survive bad events.

use grapevine_auth::AuthError;
use grapevine_codec::CodecError;
use grapevine_proto::ConsumerEvent;
use thiserror::Error;

/// Errors surfaced by the event bus client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to establish the gRPC channel.
    #[error("failed to connect to event bus: {0}")]
    Connection(String),

    /// The configured endpoint address could not be parsed.
    #[error("invalid endpoint address: {0}")]
    InvalidAddress(String),

    /// An authentication flow failed before any RPC was made.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// The subscribe RPC itself failed (not an individual event).
    #[error("subscribe failed: {0}")]
    Subscribe(tonic::Status),

    /// A topic or schema lookup RPC failed.
    #[error("schema fetch for '{key}' failed: {message}")]
    SchemaFetch { key: String, message: String },

    /// The publish RPC failed at the transport level.
    #[error("publish failed: {0}")]
    Publish(tonic::Status),

    /// The broker accepted the publish call but rejected the event.
    #[error("event rejected by broker ({code}): {message}")]
    PublishRejected { code: String, message: String },

    /// Payload or cursor encoding/decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Session metadata could not be turned into gRPC metadata values.
    #[error("invalid session metadata: {0}")]
    InvalidMetadata(String),

    /// A delivered event was structurally incomplete.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The subscription has already ended; no more requests can be sent.
    #[error("subscription stream is closed")]
    StreamClosed,
}

/// A single event that could not be decoded.
///
/// Carries enough context to resume past the bad event: the stream's latest
/// committed cursor and the raw bytes as delivered.
#[derive(Debug, Error)]
#[error("failed to parse event at replay {replay_id:?}: {cause}")]
pub struct EventParseError {
    /// Cursor of the failing event, when its bytes were at least decodable.
    pub replay_id: Option<u64>,
    /// Latest cursor committed by the broker for this batch.
    pub latest_replay_id: u64,
    /// The event exactly as delivered.
    pub raw_event: ConsumerEvent,
    #[source]
    pub cause: Box<ClientError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClientError::SchemaFetch {
            key: "/data/AccountChangeEvent".to_string(),
            message: "not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "schema fetch for '/data/AccountChangeEvent' failed: not found"
        );

        let err = ClientError::PublishRejected {
            code: "PUBLISH".to_string(),
            message: "schema mismatch".to_string(),
        };
        assert!(err.to_string().contains("PUBLISH"));
        assert!(err.to_string().contains("schema mismatch"));
    }

    #[test]
    fn test_codec_error_converts() {
        let codec_err = grapevine_codec::decode_replay_id(&[1, 2, 3]).unwrap_err();
        let err: ClientError = codec_err.into();
        assert!(matches!(err, ClientError::Codec(_)));
    }

    #[test]
    fn test_event_parse_error_display() {
        let err = EventParseError {
            replay_id: Some(42),
            latest_replay_id: 50,
            raw_event: ConsumerEvent::default(),
            cause: Box::new(ClientError::MalformedEvent("no payload".to_string())),
        };
        let text = err.to_string();
        assert!(text.contains("42"));
        assert!(text.contains("no payload"));
    }
}
