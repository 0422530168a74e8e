// ABOUTME: Error types for the grapevine-codec crate.
// ABOUTME: Covers schema parsing, payload codec, cursor, and bitmap failures.

use thiserror::Error;

/// Errors that can occur while decoding or encoding event payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Schema JSON was rejected by the Avro parser.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Payload bytes did not decode against the schema.
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// Record could not be encoded against the schema.
    #[error("record encode failed: {0}")]
    Encode(String),

    /// Replay cursors are exactly 8 bytes on the wire.
    #[error("replay cursor must be exactly 8 bytes, got {0}")]
    CursorLength(usize),

    /// A change-event bitmap contained a non-hex character or malformed pair.
    #[error("bitmap '{0}' is not a valid hex bitmap")]
    InvalidBitmap(String),

    /// A parent-child bitmap referenced a field index the schema does not have.
    #[error("bitmap parent index {index} is out of range for schema with {field_count} fields")]
    BitmapIndex { index: usize, field_count: usize },

    /// Bitmap resolution and flattening only make sense for record schemas.
    #[error("schema root is not a record")]
    NotARecord,

    /// A record field was absent from the input and the schema has no default for it.
    #[error("record field '{0}' is missing and has no default")]
    MissingField(String),

    /// One of the change-event header bitmap fields failed to resolve.
    #[error("failed to resolve {field} bitmap: {source}")]
    HeaderField {
        field: &'static str,
        #[source]
        source: Box<CodecError>,
    },

    /// An Avro construct this client does not support appeared in the schema or value.
    #[error("unsupported avro construct: {0}")]
    Unsupported(String),
}
