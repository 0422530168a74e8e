// ABOUTME: Schema-bound event payload codec wrapping the Avro binary format.
// ABOUTME: Decodes raw datum bytes to JSON records and encodes JSON records for publishing.

use apache_avro::schema::{Name, ResolvedSchema, Schema};
use apache_avro::{from_avro_datum, to_avro_datum};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::error::CodecError;
use crate::value;

/// A decoder/encoder bound to one parsed schema definition.
///
/// Event payloads on the bus are single Avro datums without the object
/// container framing, so this codec works directly on datum bytes.
#[derive(Debug)]
pub struct EventCodec {
    schema: Schema,
}

impl EventCodec {
    /// Parse a schema JSON document into a codec handle.
    pub fn parse(schema_json: &str) -> Result<Self, CodecError> {
        let schema = Schema::parse_str(schema_json)
            .map_err(|e| CodecError::InvalidSchema(e.to_string()))?;
        Ok(Self { schema })
    }

    /// The parsed schema this codec is bound to.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Decode payload bytes into a JSON record.
    ///
    /// Union values come back as single-key wrapper objects; the decode
    /// pipeline flattens those away for everything but the change-event
    /// header. 64-bit integers are surfaced as native i64 numbers, so ids
    /// beyond the f64-safe range stay numerically exact.
    pub fn decode(&self, payload: &[u8]) -> Result<JsonValue, CodecError> {
        let mut reader = payload;
        let decoded = from_avro_datum(&self.schema, &mut reader, None)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let names = self.resolved_names()?;
        value::to_json(&decoded, &self.schema, &names)
    }

    /// Encode a JSON record into payload bytes for publishing.
    ///
    /// The record must already be shaped to the schema; no flattening or
    /// bitmap handling applies on this path.
    pub fn encode(&self, record: &JsonValue) -> Result<Vec<u8>, CodecError> {
        let names = self.resolved_names()?;
        let datum = value::from_json(record, &self.schema, &names)?;
        to_avro_datum(&self.schema, datum).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn resolved_names(&self) -> Result<HashMap<Name, &Schema>, CodecError> {
        let resolved = ResolvedSchema::try_from(&self.schema)
            .map_err(|e| CodecError::InvalidSchema(e.to_string()))?;
        Ok(resolved.get_names().clone())
    }
}
