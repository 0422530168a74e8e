// ABOUTME: Event bus client: authenticated gRPC connection, flow-controlled subscriptions, publishing.
// ABOUTME: Ties together grapevine-auth sessions, grapevine-proto RPCs, and grapevine-codec decoding.

pub mod channel;
pub mod client;
pub mod error;
pub mod interceptor;
pub mod schema;
pub mod subscription;

// Client and connection config
pub use channel::{ChannelConfig, KeepAliveConfig};
pub use client::{Client, PublishReceipt};

// Error types
pub use error::{ClientError, EventParseError};

// Schema lookup
pub use schema::{BusSchema, SchemaCache, SchemaFetcher, SchemaResolver};

// Subscriptions
pub use subscription::{
    ReplayStart, StreamPhase, Subscription, SubscriptionError, SubscriptionNotice,
    SubscriptionState, DEFAULT_DECODE_CONCURRENCY,
};

// Re-export the decoded event shape consumers receive
pub use grapevine_codec::DecodedEvent;
