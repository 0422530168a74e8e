// ABOUTME: Conversions between Avro values and JSON records, directed by the schema.
// ABOUTME: Unions decode to single-key wrapper objects; 64-bit integers stay lossless i64.

use std::collections::HashMap;

use apache_avro::schema::{Name, RecordSchema, Schema, UnionSchema};
use apache_avro::types::Value as AvroValue;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::error::CodecError;

/// Named-schema registry used to follow `Schema::Ref` nodes while walking.
pub(crate) type Names<'s> = HashMap<Name, &'s Schema>;

/// Convert a decoded Avro value into a JSON record.
///
/// Union values become single-key objects keyed by the branch type name
/// (`{"string": "x"}`), except nulls which collapse to JSON null. Long values
/// are carried as native i64 JSON numbers and never pass through f64, so the
/// full 64-bit range survives the conversion.
pub(crate) fn to_json(
    value: &AvroValue,
    schema: &Schema,
    names: &Names<'_>,
) -> Result<JsonValue, CodecError> {
    let schema = deref_schema(schema, names)?;
    match (value, schema) {
        (AvroValue::Null, _) => Ok(JsonValue::Null),
        (AvroValue::Boolean(b), _) => Ok(JsonValue::Bool(*b)),
        (AvroValue::Int(i), _) | (AvroValue::Date(i), _) | (AvroValue::TimeMillis(i), _) => {
            Ok(JsonValue::from(*i))
        }
        (AvroValue::Long(l), _)
        | (AvroValue::TimeMicros(l), _)
        | (AvroValue::TimestampMillis(l), _)
        | (AvroValue::TimestampMicros(l), _)
        | (AvroValue::TimestampNanos(l), _)
        | (AvroValue::LocalTimestampMillis(l), _)
        | (AvroValue::LocalTimestampMicros(l), _)
        | (AvroValue::LocalTimestampNanos(l), _) => Ok(JsonValue::from(*l)),
        (AvroValue::Float(f), _) => Ok(Number::from_f64(f64::from(*f))
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)),
        (AvroValue::Double(d), _) => Ok(Number::from_f64(*d)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)),
        (AvroValue::String(s), _) => Ok(JsonValue::String(s.clone())),
        (AvroValue::Enum(_, symbol), _) => Ok(JsonValue::String(symbol.clone())),
        (AvroValue::Uuid(u), _) => Ok(JsonValue::String(u.to_string())),
        (AvroValue::Bytes(b), _) | (AvroValue::Fixed(_, b), _) => {
            Ok(JsonValue::String(BASE64.encode(b)))
        }
        (AvroValue::Union(idx, inner), Schema::Union(union)) => {
            let variants = union.variants();
            let branch = variants.get(*idx as usize).ok_or_else(|| {
                CodecError::Decode(format!(
                    "union branch {idx} out of range ({} variants)",
                    variants.len()
                ))
            })?;
            if matches!(**inner, AvroValue::Null) {
                return Ok(JsonValue::Null);
            }
            let mut wrapper = JsonMap::with_capacity(1);
            wrapper.insert(branch_name(branch), to_json(inner, branch, names)?);
            Ok(JsonValue::Object(wrapper))
        }
        (AvroValue::Union(_, _), other) => Err(CodecError::Decode(format!(
            "union value decoded against non-union schema {}",
            branch_name(other)
        ))),
        (AvroValue::Array(items), Schema::Array(array)) => items
            .iter()
            .map(|item| to_json(item, &array.items, names))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        (AvroValue::Map(entries), Schema::Map(map)) => {
            let mut obj = JsonMap::with_capacity(entries.len());
            for (key, item) in entries {
                obj.insert(key.clone(), to_json(item, &map.types, names)?);
            }
            Ok(JsonValue::Object(obj))
        }
        (AvroValue::Record(fields), Schema::Record(record)) => {
            let mut obj = JsonMap::with_capacity(fields.len());
            for (name, item) in fields {
                let field_schema = record
                    .lookup
                    .get(name)
                    .and_then(|idx| record.fields.get(*idx))
                    .map(|field| &field.schema)
                    .ok_or_else(|| {
                        CodecError::Decode(format!("decoded field '{name}' not present in schema"))
                    })?;
                obj.insert(name.clone(), to_json(item, field_schema, names)?);
            }
            Ok(JsonValue::Object(obj))
        }
        (AvroValue::Record(_) | AvroValue::Array(_) | AvroValue::Map(_), other) => {
            Err(CodecError::Decode(format!(
                "container value decoded against mismatched schema {}",
                branch_name(other)
            )))
        }
        (other, _) => Err(CodecError::Unsupported(format!(
            "avro value variant {} in decoded payload",
            value_kind(other)
        ))),
    }
}

/// Convert a JSON record into an Avro value shaped for the given schema.
///
/// Publishers are expected to supply data already shaped to the schema; union
/// branches may be selected explicitly with a `{"branch": value}` wrapper or
/// implicitly by the first branch that accepts the value.
pub(crate) fn from_json(
    json: &JsonValue,
    schema: &Schema,
    names: &Names<'_>,
) -> Result<AvroValue, CodecError> {
    let schema = deref_schema(schema, names)?;
    match schema {
        Schema::Null => match json {
            JsonValue::Null => Ok(AvroValue::Null),
            other => Err(mismatch(other, "null")),
        },
        Schema::Boolean => json
            .as_bool()
            .map(AvroValue::Boolean)
            .ok_or_else(|| mismatch(json, "boolean")),
        Schema::Int => int32(json).map(AvroValue::Int),
        Schema::Date => int32(json).map(AvroValue::Date),
        Schema::TimeMillis => int32(json).map(AvroValue::TimeMillis),
        Schema::Long => int64(json).map(AvroValue::Long),
        Schema::TimeMicros => int64(json).map(AvroValue::TimeMicros),
        Schema::TimestampMillis => int64(json).map(AvroValue::TimestampMillis),
        Schema::TimestampMicros => int64(json).map(AvroValue::TimestampMicros),
        Schema::TimestampNanos => int64(json).map(AvroValue::TimestampNanos),
        Schema::LocalTimestampMillis => int64(json).map(AvroValue::LocalTimestampMillis),
        Schema::LocalTimestampMicros => int64(json).map(AvroValue::LocalTimestampMicros),
        Schema::LocalTimestampNanos => int64(json).map(AvroValue::LocalTimestampNanos),
        Schema::Float => json
            .as_f64()
            .map(|f| AvroValue::Float(f as f32))
            .ok_or_else(|| mismatch(json, "float")),
        Schema::Double => json
            .as_f64()
            .map(AvroValue::Double)
            .ok_or_else(|| mismatch(json, "double")),
        Schema::String => json
            .as_str()
            .map(|s| AvroValue::String(s.to_string()))
            .ok_or_else(|| mismatch(json, "string")),
        Schema::Uuid => json
            .as_str()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(AvroValue::Uuid)
            .ok_or_else(|| mismatch(json, "uuid string")),
        Schema::Bytes => bytes_from_json(json).map(AvroValue::Bytes),
        Schema::Fixed(fixed) => {
            let bytes = bytes_from_json(json)?;
            if bytes.len() != fixed.size {
                return Err(CodecError::Encode(format!(
                    "fixed '{}' expects {} bytes, got {}",
                    fixed.name,
                    fixed.size,
                    bytes.len()
                )));
            }
            Ok(AvroValue::Fixed(bytes.len(), bytes))
        }
        Schema::Enum(enumeration) => {
            let symbol = json.as_str().ok_or_else(|| mismatch(json, "enum symbol"))?;
            let position = enumeration
                .symbols
                .iter()
                .position(|candidate| candidate == symbol)
                .ok_or_else(|| {
                    CodecError::Encode(format!(
                        "'{symbol}' is not a symbol of enum '{}'",
                        enumeration.name
                    ))
                })?;
            Ok(AvroValue::Enum(position as u32, symbol.to_string()))
        }
        Schema::Array(array) => {
            let items = json.as_array().ok_or_else(|| mismatch(json, "array"))?;
            items
                .iter()
                .map(|item| from_json(item, &array.items, names))
                .collect::<Result<Vec<_>, _>>()
                .map(AvroValue::Array)
        }
        Schema::Map(map) => {
            let obj = json.as_object().ok_or_else(|| mismatch(json, "map"))?;
            let mut entries = HashMap::with_capacity(obj.len());
            for (key, item) in obj {
                entries.insert(key.clone(), from_json(item, &map.types, names)?);
            }
            Ok(AvroValue::Map(entries))
        }
        Schema::Union(union) => from_json_union(json, union, names),
        Schema::Record(record) => from_json_record(json, record, names),
        Schema::Decimal(_) | Schema::BigDecimal => Err(CodecError::Unsupported(
            "decimal logical type in encode path".to_string(),
        )),
        Schema::Duration => Err(CodecError::Unsupported(
            "duration logical type in encode path".to_string(),
        )),
        Schema::Ref { name } => Err(CodecError::Unsupported(format!(
            "unresolved schema reference '{name}'"
        ))),
    }
}

fn from_json_union(
    json: &JsonValue,
    union: &UnionSchema,
    names: &Names<'_>,
) -> Result<AvroValue, CodecError> {
    let variants = union.variants();
    if json.is_null() {
        if let Some(idx) = variants.iter().position(|v| matches!(v, Schema::Null)) {
            return Ok(AvroValue::Union(idx as u32, Box::new(AvroValue::Null)));
        }
        return Err(CodecError::Encode(
            "null value for a union without a null branch".to_string(),
        ));
    }
    // Explicit branch selection in the Avro JSON style: {"branch": value}.
    if let Some(obj) = json.as_object() {
        if obj.len() == 1 {
            let (key, inner) = obj.iter().next().expect("len checked");
            if let Some((idx, variant)) = variants
                .iter()
                .enumerate()
                .find(|(_, variant)| branch_name(variant) == *key)
            {
                let value = from_json(inner, variant, names)?;
                return Ok(AvroValue::Union(idx as u32, Box::new(value)));
            }
        }
    }
    // Otherwise take the first branch the value satisfies.
    for (idx, variant) in variants.iter().enumerate() {
        if matches!(variant, Schema::Null) {
            continue;
        }
        if let Ok(value) = from_json(json, variant, names) {
            return Ok(AvroValue::Union(idx as u32, Box::new(value)));
        }
    }
    Err(CodecError::Encode(format!(
        "no union branch matched value {json}"
    )))
}

fn from_json_record(
    json: &JsonValue,
    record: &RecordSchema,
    names: &Names<'_>,
) -> Result<AvroValue, CodecError> {
    let obj = json
        .as_object()
        .ok_or_else(|| mismatch(json, "record object"))?;
    let mut fields = Vec::with_capacity(record.fields.len());
    for field in &record.fields {
        let value = match obj.get(&field.name) {
            Some(present) => from_json(present, &field.schema, names)?,
            None => match &field.default {
                Some(default) => from_json(default, &field.schema, names)?,
                None if nullable(&field.schema) => {
                    from_json(&JsonValue::Null, &field.schema, names)?
                }
                None => return Err(CodecError::MissingField(field.name.clone())),
            },
        };
        fields.push((field.name.clone(), value));
    }
    Ok(AvroValue::Record(fields))
}

fn deref_schema<'s>(schema: &'s Schema, names: &Names<'s>) -> Result<&'s Schema, CodecError> {
    match schema {
        Schema::Ref { name } => names.get(name).copied().ok_or_else(|| {
            CodecError::Unsupported(format!("unresolved schema reference '{name}'"))
        }),
        other => Ok(other),
    }
}

/// Type name used to tag a union branch, matching the Avro JSON encoding.
/// Logical types tag with their underlying primitive; named types with their
/// simple name.
fn branch_name(schema: &Schema) -> String {
    match schema {
        Schema::Null => "null".to_string(),
        Schema::Boolean => "boolean".to_string(),
        Schema::Int | Schema::Date | Schema::TimeMillis => "int".to_string(),
        Schema::Long
        | Schema::TimeMicros
        | Schema::TimestampMillis
        | Schema::TimestampMicros
        | Schema::TimestampNanos
        | Schema::LocalTimestampMillis
        | Schema::LocalTimestampMicros
        | Schema::LocalTimestampNanos => "long".to_string(),
        Schema::Float => "float".to_string(),
        Schema::Double => "double".to_string(),
        Schema::Bytes | Schema::Decimal(_) | Schema::BigDecimal => "bytes".to_string(),
        Schema::String | Schema::Uuid => "string".to_string(),
        Schema::Array(_) => "array".to_string(),
        Schema::Map(_) => "map".to_string(),
        Schema::Duration => "fixed".to_string(),
        Schema::Union(_) => "union".to_string(),
        Schema::Record(record) => record.name.name.clone(),
        Schema::Enum(enumeration) => enumeration.name.name.clone(),
        Schema::Fixed(fixed) => fixed.name.name.clone(),
        Schema::Ref { name } => name.name.clone(),
    }
}

fn nullable(schema: &Schema) -> bool {
    match schema {
        Schema::Null => true,
        Schema::Union(union) => union.variants().iter().any(|v| matches!(v, Schema::Null)),
        _ => false,
    }
}

fn mismatch(json: &JsonValue, expected: &str) -> CodecError {
    CodecError::Encode(format!("expected {expected}, got {json}"))
}

fn int64(json: &JsonValue) -> Result<i64, CodecError> {
    json.as_i64().ok_or_else(|| mismatch(json, "long"))
}

fn int32(json: &JsonValue) -> Result<i32, CodecError> {
    int64(json)?
        .try_into()
        .map_err(|_| mismatch(json, "32-bit int"))
}

fn bytes_from_json(json: &JsonValue) -> Result<Vec<u8>, CodecError> {
    match json {
        JsonValue::String(s) => BASE64
            .decode(s)
            .map_err(|e| CodecError::Encode(format!("invalid base64 bytes value: {e}"))),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| mismatch(item, "byte (0-255)"))
            })
            .collect(),
        other => Err(mismatch(other, "base64 string or byte array")),
    }
}

fn value_kind(value: &AvroValue) -> &'static str {
    match value {
        AvroValue::Decimal(_) => "decimal",
        AvroValue::BigDecimal(_) => "big-decimal",
        AvroValue::Duration(_) => "duration",
        _ => "value",
    }
}
