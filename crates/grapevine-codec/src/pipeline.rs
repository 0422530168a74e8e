// ABOUTME: Event decode pipeline: cursor decode, payload decode, bitmap expansion, flattening.
// ABOUTME: Turns a raw event envelope into a usable JSON record plus a numeric replay cursor.

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::bitmap;
use crate::codec::EventCodec;
use crate::cursor::decode_replay_id;
use crate::error::CodecError;

/// Name of the change-event metadata sub-record. Its bitmap fields are
/// expanded in place and it is exempt from union flattening.
pub const CHANGE_EVENT_HEADER: &str = "ChangeEventHeader";

/// Header attributes that carry field bitmaps, in the order they are resolved.
const BITMAP_FIELDS: [&str; 3] = ["changedFields", "diffFields", "nulledFields"];

/// A fully decoded event: numeric replay cursor plus flattened JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub replay_id: u64,
    pub payload: JsonValue,
}

/// Decode one raw event envelope.
///
/// Decodes the 8-byte big-endian replay cursor, decodes the payload through
/// the schema codec, expands the change-event header bitmaps into field-name
/// lists, and flattens single-key union wrappers everywhere outside the
/// header.
pub fn decode_event(
    codec: &EventCodec,
    replay_id: &[u8],
    payload: &[u8],
) -> Result<DecodedEvent, CodecError> {
    let replay_id = decode_replay_id(replay_id)?;
    let mut record = codec.decode(payload)?;
    expand_header_bitmaps(codec, &mut record)?;
    flatten_single_key_values(&mut record);
    Ok(DecodedEvent { replay_id, payload: record })
}

/// Encode one record for publishing. Pure codec delegation: publishers supply
/// data already shaped to the schema, so no flattening or bitmap logic runs.
pub fn encode_event(codec: &EventCodec, record: &JsonValue) -> Result<Vec<u8>, CodecError> {
    codec.encode(record)
}

/// Replace the bitmap sequences in the change-event header, if present, with
/// resolved field-name lists. Each of the three bitmap attributes is resolved
/// independently; the first failure aborts with context naming the attribute.
fn expand_header_bitmaps(codec: &EventCodec, record: &mut JsonValue) -> Result<(), CodecError> {
    let Some(obj) = record.as_object_mut() else {
        return Ok(());
    };
    let Some(header) = obj
        .get_mut(CHANGE_EVENT_HEADER)
        .and_then(JsonValue::as_object_mut)
    else {
        return Ok(());
    };

    for field in BITMAP_FIELDS {
        let Some(raw) = header.get(field) else {
            continue;
        };
        let bitmaps = bitmap_strings(raw)
            .map_err(|source| CodecError::HeaderField { field, source: Box::new(source) })?;
        let resolved = bitmap::resolve(codec.schema(), &bitmaps)
            .map_err(|source| CodecError::HeaderField { field, source: Box::new(source) })?;
        header.insert(
            field.to_string(),
            JsonValue::Array(resolved.into_iter().map(JsonValue::String).collect()),
        );
    }
    Ok(())
}

fn bitmap_strings(value: &JsonValue) -> Result<Vec<String>, CodecError> {
    let items = value
        .as_array()
        .ok_or_else(|| CodecError::InvalidBitmap(value.to_string()))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| CodecError::InvalidBitmap(item.to_string()))
        })
        .collect()
}

/// Flatten single-key wrapper objects produced by union decoding.
///
/// For every attribute except the change-event header: if the value is an
/// object with exactly one key, it is replaced by the inner value, and the
/// replacement is flattened again if it is itself an object. The header is
/// left untouched so its metadata shape stays stable for consumers.
pub fn flatten_single_key_values(record: &mut JsonValue) {
    if let Some(obj) = record.as_object_mut() {
        flatten_object(obj);
    }
}

fn flatten_object(obj: &mut JsonMap<String, JsonValue>) {
    let keys: Vec<String> = obj.keys().cloned().collect();
    for key in keys {
        if key == CHANGE_EVENT_HEADER {
            continue;
        }
        let Some(value) = obj.get_mut(&key) else {
            continue;
        };
        let single = match value.as_object() {
            Some(inner) if inner.len() == 1 => inner.values().next().cloned(),
            _ => None,
        };
        if let Some(inner) = single {
            *value = inner;
            if let Some(sub) = value.as_object_mut() {
                flatten_object(sub);
            }
        }
    }
}
