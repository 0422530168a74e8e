// ABOUTME: Resolves change-event bitmaps into ordered field-name lists.
// ABOUTME: Handles top-level hex bitmaps and nested "<parentIndex>-<hex>" pairs.

use apache_avro::schema::{RecordField, Schema};

use crate::error::CodecError;

/// Resolve a sequence of bitmap strings against a record schema.
///
/// The bus encodes changed/diff/nulled field lists as hex bit vectors where
/// bit i (after reversing the expanded bit string) marks the i-th declared
/// field. A `"<parentIndex>-<hex>"` entry addresses the fields of a nested
/// record; its resolved names are emitted as `"parent.child"`.
pub fn resolve(schema: &Schema, bitmaps: &[String]) -> Result<Vec<String>, CodecError> {
    let fields = record_fields(schema)?;
    let mut names = Vec::new();
    if bitmaps.is_empty() {
        return Ok(names);
    }

    if bitmaps[0].starts_with("0x") {
        let top_level: Vec<&RecordField> = fields.iter().collect();
        names.extend(field_names_from_bitmap(&top_level, &bitmaps[0])?);
    }

    if bitmaps.last().is_some_and(|entry| entry.contains('-')) {
        for entry in bitmaps.iter().filter(|entry| entry.contains('-')) {
            let (index_str, child_hex) = entry.split_once('-').expect("filtered on '-'");
            let index: usize = index_str
                .parse()
                .map_err(|_| CodecError::InvalidBitmap(entry.clone()))?;
            let parent = fields.get(index).ok_or(CodecError::BitmapIndex {
                index,
                field_count: fields.len(),
            })?;
            let Some(child_fields) = nested_record_fields(&parent.schema) else {
                continue;
            };
            for child in field_names_from_bitmap(&child_fields, child_hex)? {
                names.push(format!("{}.{}", parent.name, child));
            }
        }
    }

    Ok(names)
}

/// Expand a hex bitmap into the names of the fields whose bits are set.
///
/// Each hex digit expands to 4 bits; the full bit string is then reversed so
/// bit 0 addresses the first declared field. Bits beyond the field count are
/// ignored.
fn field_names_from_bitmap(
    fields: &[&RecordField],
    bitmap: &str,
) -> Result<Vec<String>, CodecError> {
    let hex = bitmap.strip_prefix("0x").unwrap_or(bitmap);
    let mut bits = Vec::with_capacity(hex.len() * 4);
    for digit in hex.chars() {
        let value = digit
            .to_digit(16)
            .ok_or_else(|| CodecError::InvalidBitmap(bitmap.to_string()))?;
        for shift in (0..4).rev() {
            bits.push((value >> shift) & 1 == 1);
        }
    }
    bits.reverse();

    Ok(bits
        .iter()
        .take(fields.len())
        .enumerate()
        .filter(|(_, set)| **set)
        .map(|(i, _)| fields[i].name.clone())
        .collect())
}

fn record_fields(schema: &Schema) -> Result<&[RecordField], CodecError> {
    match schema {
        Schema::Record(record) => Ok(&record.fields),
        _ => Err(CodecError::NotARecord),
    }
}

/// Fields of the record type behind a field schema, looking through unions.
///
/// A union parent contributes the member fields of every record-typed branch,
/// concatenated in declaration order, so child bit indexes can address fields
/// of any branch.
fn nested_record_fields(schema: &Schema) -> Option<Vec<&RecordField>> {
    match schema {
        Schema::Record(record) => Some(record.fields.iter().collect()),
        Schema::Union(union) => {
            let fields: Vec<&RecordField> = union
                .variants()
                .iter()
                .filter_map(|variant| match variant {
                    Schema::Record(record) => Some(record.fields.iter()),
                    _ => None,
                })
                .flatten()
                .collect();
            if fields.is_empty() {
                None
            } else {
                Some(fields)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::parse_str(
            r#"{
                "type": "record",
                "name": "Event",
                "fields": [
                    {"name": "First", "type": "string"},
                    {"name": "Second", "type": "string"},
                    {"name": "Third", "type": "string"},
                    {"name": "Fourth", "type": "string"},
                    {"name": "Address", "type": ["null", {
                        "type": "record",
                        "name": "Address",
                        "fields": [
                            {"name": "Street", "type": "string"},
                            {"name": "City", "type": "string"}
                        ]
                    }]}
                ]
            }"#,
        )
        .unwrap()
    }

    fn resolve_all(bitmaps: &[&str]) -> Vec<String> {
        let owned: Vec<String> = bitmaps.iter().map(|s| s.to_string()).collect();
        resolve(&schema(), &owned).unwrap()
    }

    #[test]
    fn test_empty_sequence_resolves_empty() {
        assert!(resolve_all(&[]).is_empty());
    }

    #[test]
    fn test_single_bit() {
        assert_eq!(resolve_all(&["0x1"]), vec!["First"]);
        assert_eq!(resolve_all(&["0x8"]), vec!["Fourth"]);
    }

    #[test]
    fn test_multiple_bits_keep_declaration_order() {
        // 0x6 = 0b0110: bits 1 and 2 set.
        assert_eq!(resolve_all(&["0x6"]), vec!["Second", "Third"]);
        // 0xD = 0b1101: bits 0, 2, 3 set.
        assert_eq!(resolve_all(&["0xD"]), vec!["First", "Third", "Fourth"]);
    }

    #[test]
    fn test_multi_digit_bitmap() {
        // 0x11 = 0b00010001: bits 0 and 4 set.
        assert_eq!(resolve_all(&["0x11"]), vec!["First", "Address"]);
    }

    #[test]
    fn test_bits_beyond_field_count_are_ignored() {
        // 0xFF sets bits 0..8 but the schema has 5 fields.
        assert_eq!(
            resolve_all(&["0xFF"]),
            vec!["First", "Second", "Third", "Fourth", "Address"]
        );
    }

    #[test]
    fn test_parent_child_pairs_emit_dotted_names() {
        // Parent index 4 is Address; child 0x3 sets Street and City.
        assert_eq!(
            resolve_all(&["4-0x3"]),
            vec!["Address.Street", "Address.City"]
        );
        assert_eq!(resolve_all(&["4-0x2"]), vec!["Address.City"]);
    }

    #[test]
    fn test_top_level_and_nested_combine() {
        assert_eq!(
            resolve_all(&["0x2", "4-0x1"]),
            vec!["Second", "Address.Street"]
        );
    }

    #[test]
    fn test_union_parent_concatenates_all_record_branches() {
        // Contact is a union with two record branches; their member fields
        // concatenate, so bit 1 addresses the second branch's first field.
        let schema = Schema::parse_str(
            r#"{
                "type": "record",
                "name": "Event",
                "fields": [
                    {"name": "Contact", "type": ["null",
                        {"type": "record", "name": "Phone", "fields": [
                            {"name": "Number", "type": "string"}
                        ]},
                        {"type": "record", "name": "Email", "fields": [
                            {"name": "Address", "type": "string"}
                        ]}
                    ]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            resolve(&schema, &["0-0x1".to_string()]).unwrap(),
            vec!["Contact.Number"]
        );
        assert_eq!(
            resolve(&schema, &["0-0x2".to_string()]).unwrap(),
            vec!["Contact.Address"]
        );
        assert_eq!(
            resolve(&schema, &["0-0x3".to_string()]).unwrap(),
            vec!["Contact.Number", "Contact.Address"]
        );
    }

    #[test]
    fn test_pair_for_non_record_parent_is_skipped() {
        // Field 0 is a plain string; there is nothing nested to resolve.
        assert!(resolve_all(&["0-0x1"]).is_empty());
    }

    #[test]
    fn test_invalid_hex_is_rejected() {
        let err = resolve(&schema(), &["0xZZ".to_string()]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidBitmap(_)));
    }

    #[test]
    fn test_out_of_range_parent_index_is_rejected() {
        let err = resolve(&schema(), &["9-0x1".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::BitmapIndex {
                index: 9,
                field_count: 5
            }
        ));
    }

    #[test]
    fn test_non_record_schema_is_rejected() {
        let plain = Schema::parse_str(r#""string""#).unwrap();
        let err = resolve(&plain, &[]).unwrap_err();
        assert!(matches!(err, CodecError::NotARecord));
    }
}
