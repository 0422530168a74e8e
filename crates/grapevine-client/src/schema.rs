// ABOUTME: Schema lookup and caching keyed by topic name and schema id.
// ABOUTME: Decoding never refetches a schema the cache has already parsed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use grapevine_codec::EventCodec;
use grapevine_proto::client::PubSubClient;
use grapevine_proto::{SchemaRequest, TopicRequest};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tracing::debug;

use crate::error::ClientError;
use crate::interceptor::SessionInterceptor;

/// The tonic client type every bus RPC goes through.
pub type BusConnection = PubSubClient<InterceptedService<Channel, SessionInterceptor>>;

/// A parsed writer schema and the broker id it was registered under.
pub struct BusSchema {
    pub id: String,
    pub codec: EventCodec,
}

impl std::fmt::Debug for BusSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSchema").field("id", &self.id).finish()
    }
}

/// Source of topic and schema definitions, usually the broker itself.
///
/// Abstracted so the cache (and everything downstream of it) can be tested
/// without a live gRPC endpoint.
#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    /// Resolve the current schema id registered for a topic.
    async fn topic_schema_id(&self, topic_name: &str) -> Result<String, ClientError>;

    /// Fetch the schema definition JSON for a schema id.
    async fn schema_json(&self, schema_id: &str) -> Result<String, ClientError>;
}

/// Resolves a schema id to a parsed schema. Implemented by [`SchemaCache`];
/// the subscription decoder depends only on this.
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn schema_by_id(&self, schema_id: &str) -> Result<Arc<BusSchema>, ClientError>;
}

/// Schema cache with two indexes: topic name and schema id.
///
/// Entries are never evicted; a topic's schema id is fixed for the life of a
/// subscription and stale ids simply stop being asked for. Concurrent misses
/// for the same key may fetch twice; the second insert wins and both callers
/// get an equivalent parsed schema.
pub struct SchemaCache<F> {
    fetcher: F,
    by_topic: Mutex<HashMap<String, Arc<BusSchema>>>,
    by_id: Mutex<HashMap<String, Arc<BusSchema>>>,
}

impl<F: SchemaFetcher> SchemaCache<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            by_topic: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
        }
    }

    /// Schema currently registered for a topic, fetching on first use.
    pub async fn topic_schema(&self, topic_name: &str) -> Result<Arc<BusSchema>, ClientError> {
        if let Some(schema) = self.by_topic.lock().unwrap().get(topic_name) {
            return Ok(schema.clone());
        }

        let schema_id = self.fetcher.topic_schema_id(topic_name).await?;
        let schema = self.fetch_by_id(&schema_id).await?;
        self.by_topic
            .lock()
            .unwrap()
            .insert(topic_name.to_string(), schema.clone());
        Ok(schema)
    }

    async fn fetch_by_id(&self, schema_id: &str) -> Result<Arc<BusSchema>, ClientError> {
        if let Some(schema) = self.by_id.lock().unwrap().get(schema_id) {
            return Ok(schema.clone());
        }

        let json = self.fetcher.schema_json(schema_id).await?;
        let codec = EventCodec::parse(&json)?;
        let schema = Arc::new(BusSchema {
            id: schema_id.to_string(),
            codec,
        });
        debug!(schema_id = %schema_id, "schema cached");
        self.by_id
            .lock()
            .unwrap()
            .insert(schema_id.to_string(), schema.clone());
        Ok(schema)
    }
}

#[async_trait]
impl<F: SchemaFetcher> SchemaResolver for SchemaCache<F> {
    async fn schema_by_id(&self, schema_id: &str) -> Result<Arc<BusSchema>, ClientError> {
        self.fetch_by_id(schema_id).await
    }
}

#[async_trait]
impl<R: SchemaResolver> SchemaResolver for Arc<R> {
    async fn schema_by_id(&self, schema_id: &str) -> Result<Arc<BusSchema>, ClientError> {
        (**self).schema_by_id(schema_id).await
    }
}

/// Fetcher backed by the GetTopic and GetSchema RPCs.
#[derive(Clone)]
pub struct GrpcSchemaFetcher {
    client: BusConnection,
}

impl GrpcSchemaFetcher {
    pub fn new(client: BusConnection) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SchemaFetcher for GrpcSchemaFetcher {
    async fn topic_schema_id(&self, topic_name: &str) -> Result<String, ClientError> {
        // tonic clients take &mut self; clone shares the underlying channel.
        let mut client = self.client.clone();
        let info = client
            .get_topic(TopicRequest {
                topic_name: topic_name.to_string(),
            })
            .await
            .map_err(|status| ClientError::SchemaFetch {
                key: topic_name.to_string(),
                message: status.to_string(),
            })?
            .into_inner();
        if info.schema_id.is_empty() {
            return Err(ClientError::SchemaFetch {
                key: topic_name.to_string(),
                message: "topic has no registered schema".to_string(),
            });
        }
        Ok(info.schema_id)
    }

    async fn schema_json(&self, schema_id: &str) -> Result<String, ClientError> {
        let mut client = self.client.clone();
        let info = client
            .get_schema(SchemaRequest {
                schema_id: schema_id.to_string(),
            })
            .await
            .map_err(|status| ClientError::SchemaFetch {
                key: schema_id.to_string(),
                message: status.to_string(),
            })?
            .into_inner();
        Ok(info.schema_json)
    }
}
