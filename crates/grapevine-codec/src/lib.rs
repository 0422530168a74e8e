// ABOUTME: Schema-driven payload codec and decode pipeline for the grapevine event bus.
// ABOUTME: Provides the Avro codec adapter, replay cursor codec, and bitmap field resolver.

pub mod bitmap;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod pipeline;
mod value;

// Codec adapter
pub use codec::EventCodec;

// Replay cursor wire codec
pub use cursor::{decode_replay_id, encode_replay_id};

// Error types
pub use error::CodecError;

// Decode pipeline
pub use pipeline::{
    decode_event, encode_event, flatten_single_key_values, DecodedEvent, CHANGE_EVENT_HEADER,
};
