// ABOUTME: Re-exports protobuf types for the eventbus.v1 Pub/Sub service.
// ABOUTME: Single source of truth for the bus wire contract used by grapevine crates.

#![allow(clippy::derive_partial_eq_without_eq)]

/// Generated protobuf types for the eventbus.v1 protocol.
///
/// The contents of `eventbus.v1.rs` are vendored tonic-build output for
/// `proto/eventbus.proto`, checked in so the workspace builds without a
/// protoc toolchain.
pub mod eventbus {
    pub mod v1 {
        include!("eventbus.v1.rs");
    }
}

// Re-export commonly used types at crate root for convenience
pub use eventbus::v1::*;

// Re-export client types under a client module
pub mod client {
    pub use super::eventbus::v1::pub_sub_client::PubSubClient;
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_fetch_request_roundtrip() {
        let request = FetchRequest {
            topic_name: "/data/AccountChangeEvent".to_string(),
            replay_preset: ReplayPreset::Custom as i32,
            replay_id: vec![0, 0, 0, 0, 0, 0, 0, 42],
            num_requested: 10,
            auth_refresh: String::new(),
        };
        let bytes = request.encode_to_vec();
        let decoded = FetchRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.replay_preset(), ReplayPreset::Custom);
    }

    #[test]
    fn test_fetch_response_defaults() {
        let response = FetchResponse::default();
        assert!(response.events.is_empty());
        assert!(response.latest_replay_id.is_empty());
        assert_eq!(response.pending_num_requested, 0);
    }

    #[test]
    fn test_replay_preset_str_names() {
        assert_eq!(ReplayPreset::Latest.as_str_name(), "LATEST");
        assert_eq!(ReplayPreset::from_str_name("EARLIEST"), Some(ReplayPreset::Earliest));
        assert_eq!(ReplayPreset::from_str_name("bogus"), None);
    }

    #[test]
    fn test_publish_result_error_roundtrip() {
        let result = PublishResult {
            replay_id: 7u64.to_be_bytes().to_vec(),
            error: Some(Error {
                code: ErrorCode::Publish as i32,
                msg: "schema mismatch".to_string(),
            }),
            correlation_key: "key-1".to_string(),
        };
        let bytes = result.encode_to_vec();
        let decoded = PublishResult::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.error.as_ref().unwrap().msg, "schema mismatch");
        assert_eq!(decoded.replay_id.len(), 8);
    }
}
