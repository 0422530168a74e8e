// ABOUTME: Top-level event bus client: connect, subscribe, publish.
// ABOUTME: Owns the channel, session credentials, and the shared schema cache.

use std::sync::Arc;

use grapevine_auth::{AuthConfig, CredentialProvider, SessionMetadata};
use grapevine_codec::{decode_replay_id, encode_event};
use grapevine_proto::client::PubSubClient;
use grapevine_proto::{ErrorCode, FetchRequest, ProducerEvent, PublishRequest, PublishResult};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::info;
use uuid::Uuid;

use crate::channel::{create_channel, ChannelConfig};
use crate::error::ClientError;
use crate::interceptor::SessionInterceptor;
use crate::schema::{BusConnection, GrpcSchemaFetcher, SchemaCache};
use crate::subscription::{self, ReplayStart, Subscription, DEFAULT_DECODE_CONCURRENCY};

/// Buffer for outbound fetch requests on a subscribe stream.
const REQUEST_BUFFER: usize = 16;

/// Broker acknowledgment for one published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Cursor assigned to the event.
    pub replay_id: u64,
    /// Key identifying the event in the publish batch.
    pub correlation_key: String,
}

/// Connected event bus client.
///
/// Cheap to clone; clones share the channel and the schema cache.
#[derive(Clone)]
pub struct Client {
    pubsub: BusConnection,
    session: SessionMetadata,
    schemas: Arc<SchemaCache<GrpcSchemaFetcher>>,
    decode_concurrency: usize,
}

impl Client {
    /// Authenticate and connect in one step.
    pub async fn connect(
        auth: &AuthConfig,
        channel_config: &ChannelConfig,
    ) -> Result<Self, ClientError> {
        let session = CredentialProvider::new().authenticate(auth).await?;
        let channel = create_channel(channel_config).await?;
        Self::with_session(channel, session)
    }

    /// Build a client on an existing channel with an existing session.
    pub fn with_session(channel: Channel, session: SessionMetadata) -> Result<Self, ClientError> {
        let interceptor = SessionInterceptor::new(&session)?;
        let pubsub = PubSubClient::with_interceptor(channel, interceptor);
        let schemas = Arc::new(SchemaCache::new(GrpcSchemaFetcher::new(pubsub.clone())));
        Ok(Self {
            pubsub,
            session,
            schemas,
            decode_concurrency: DEFAULT_DECODE_CONCURRENCY,
        })
    }

    /// Cap on concurrent payload decodes per batch.
    pub fn with_decode_concurrency(mut self, cap: usize) -> Self {
        self.decode_concurrency = cap.max(1);
        self
    }

    /// Session this client authenticates with.
    pub fn session(&self) -> &SessionMetadata {
        &self.session
    }

    /// Open a flow-controlled subscription.
    ///
    /// `num_requested` is the initial event budget; top it up later with
    /// [`Subscription::request_more`]. The topic's schema is fetched before
    /// the stream opens so a bad topic fails here, not mid-stream.
    pub async fn subscribe(
        &self,
        topic_name: &str,
        num_requested: i32,
        replay: ReplayStart,
    ) -> Result<Subscription, ClientError> {
        self.schemas.topic_schema(topic_name).await?;

        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
        request_tx
            .send(initial_fetch_request(topic_name, num_requested, replay))
            .await
            .map_err(|_| ClientError::StreamClosed)?;

        let mut client = self.pubsub.clone();
        let response = client
            .subscribe(ReceiverStream::new(request_rx))
            .await
            .map_err(ClientError::Subscribe)?;

        info!(topic = %topic_name, num_requested, ?replay, "subscribed");

        Ok(subscription::spawn(
            topic_name.to_string(),
            response.into_inner(),
            self.schemas.clone(),
            request_tx,
            num_requested,
            self.decode_concurrency,
        ))
    }

    /// Publish one record to a topic.
    ///
    /// The record must match the topic's registered schema. A missing
    /// `correlation_key` gets a random one; the receipt echoes whichever key
    /// the broker saw.
    pub async fn publish(
        &self,
        topic_name: &str,
        record: &JsonValue,
        correlation_key: Option<String>,
    ) -> Result<PublishReceipt, ClientError> {
        let schema = self.schemas.topic_schema(topic_name).await?;
        let payload = encode_event(&schema.codec, record)?;
        let key = correlation_key.unwrap_or_else(|| Uuid::new_v4().to_string());

        let request = PublishRequest {
            topic_name: topic_name.to_string(),
            events: vec![ProducerEvent {
                id: key.clone(),
                schema_id: schema.id.clone(),
                payload,
                headers: vec![],
            }],
            auth_refresh: String::new(),
        };

        let mut client = self.pubsub.clone();
        let response = client
            .publish(request)
            .await
            .map_err(ClientError::Publish)?
            .into_inner();

        let result = response.results.into_iter().next().ok_or_else(|| {
            ClientError::MalformedEvent("publish response carried no result".to_string())
        })?;
        let receipt = receipt_from_result(result, key)?;

        info!(
            topic = %topic_name,
            replay_id = receipt.replay_id,
            correlation_key = %receipt.correlation_key,
            "published"
        );
        Ok(receipt)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("instance_url", &self.session.instance_url)
            .field("organization_id", &self.session.organization_id)
            .field("decode_concurrency", &self.decode_concurrency)
            .finish()
    }
}

/// First message on a subscribe stream. Only this one carries the replay
/// position; later requests just top up the budget.
fn initial_fetch_request(topic_name: &str, num_requested: i32, replay: ReplayStart) -> FetchRequest {
    let (preset, replay_id) = replay.to_wire();
    FetchRequest {
        topic_name: topic_name.to_string(),
        replay_preset: preset as i32,
        replay_id,
        num_requested,
        auth_refresh: String::new(),
    }
}

/// Turn a broker publish result into a receipt or a rejection.
fn receipt_from_result(
    result: PublishResult,
    fallback_key: String,
) -> Result<PublishReceipt, ClientError> {
    if let Some(error) = result.error {
        let code = ErrorCode::try_from(error.code)
            .unwrap_or(ErrorCode::Unknown)
            .as_str_name()
            .to_string();
        return Err(ClientError::PublishRejected {
            code,
            message: error.msg,
        });
    }
    let replay_id = decode_replay_id(&result.replay_id)?;
    let correlation_key = if result.correlation_key.is_empty() {
        fallback_key
    } else {
        result.correlation_key
    };
    Ok(PublishReceipt {
        replay_id,
        correlation_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use grapevine_codec::encode_replay_id;
    use grapevine_proto::{Error, ReplayPreset};

    #[test]
    fn test_initial_fetch_request_custom_replay() {
        let request = initial_fetch_request("/data/AccountChangeEvent", 10, ReplayStart::Custom(42));
        assert_eq!(request.topic_name, "/data/AccountChangeEvent");
        assert_eq!(request.num_requested, 10);
        assert_eq!(request.replay_preset, ReplayPreset::Custom as i32);
        assert_eq!(request.replay_id, vec![0, 0, 0, 0, 0, 0, 0, 42]);
    }

    #[test]
    fn test_initial_fetch_request_latest_has_no_cursor() {
        let request = initial_fetch_request("/data/AccountChangeEvent", 5, ReplayStart::Latest);
        assert_eq!(request.replay_preset, ReplayPreset::Latest as i32);
        assert!(request.replay_id.is_empty());
    }

    #[test]
    fn test_receipt_from_successful_result() {
        let result = PublishResult {
            replay_id: encode_replay_id(77).to_vec(),
            error: None,
            correlation_key: "key-1".to_string(),
        };
        let receipt = receipt_from_result(result, "fallback".to_string()).unwrap();
        assert_eq!(receipt.replay_id, 77);
        assert_eq!(receipt.correlation_key, "key-1");
    }

    #[test]
    fn test_receipt_falls_back_to_local_key() {
        let result = PublishResult {
            replay_id: encode_replay_id(1).to_vec(),
            error: None,
            correlation_key: String::new(),
        };
        let receipt = receipt_from_result(result, "local-key".to_string()).unwrap();
        assert_eq!(receipt.correlation_key, "local-key");
    }

    #[test]
    fn test_rejected_result_maps_error_code() {
        let result = PublishResult {
            replay_id: vec![],
            error: Some(Error {
                code: ErrorCode::Publish as i32,
                msg: "schema mismatch".to_string(),
            }),
            correlation_key: "key-1".to_string(),
        };
        let err = receipt_from_result(result, "key-1".to_string()).unwrap_err();
        match err {
            ClientError::PublishRejected { code, message } => {
                assert_eq!(code, "PUBLISH");
                assert_eq!(message, "schema mismatch");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_result_with_bad_cursor_is_codec_error() {
        let result = PublishResult {
            replay_id: vec![1, 2],
            error: None,
            correlation_key: "key-1".to_string(),
        };
        let err = receipt_from_result(result, "key-1".to_string()).unwrap_err();
        assert!(matches!(err, ClientError::Codec(_)));
    }
}
