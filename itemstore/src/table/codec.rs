//! Item <-> property bag mapping
//!
//! Items live in the `items` partition under a row key equal to the
//! identifier zero-padded to 20 digits, so the store's lexicographic row
//! order is identifier order. `Version` is written as an `Edm.Int64` (a
//! decimal string on the wire) and the timestamps as `Edm.DateTime`.
//!
//! Decoding never panics: a missing or mistyped property is an `Opaque`
//! error tagged `decode`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use super::client::{TableEntity, PARTITION_KEY, ROW_KEY};
use crate::model::{Item, ItemId};
use crate::repository::{DbError, DbErrorKind, DbOperation, DbResult};

/// Partition holding every item
pub const ITEMS_PARTITION: &str = "items";

pub const NAME: &str = "Name";
pub const PRICE: &str = "Price";
pub const VERSION: &str = "Version";
pub const CREATED_AT: &str = "CreatedAt";
pub const UPDATED_AT: &str = "UpdatedAt";
pub const DELETED_AT: &str = "DeletedAt";

const EDM_INT64: &str = "Edm.Int64";
const EDM_DOUBLE: &str = "Edm.Double";
const EDM_DATETIME: &str = "Edm.DateTime";

/// Row key for an item identifier
///
/// ```rust
/// assert_eq!(itemstore::table::row_key(42), "00000000000000000042");
/// ```
pub fn row_key(id: ItemId) -> String {
    format!("{:020}", id)
}

fn annotate(entity: &mut TableEntity, property: &str, edm_type: &str) {
    entity.insert(format!("{}@odata.type", property), Value::from(edm_type));
}

fn put_timestamp(entity: &mut TableEntity, property: &str, at: DateTime<Utc>) {
    entity.insert(
        property.to_string(),
        Value::from(at.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    annotate(entity, property, EDM_DATETIME);
}

/// Property bag for a stored item
pub fn encode(item: &Item) -> TableEntity {
    let mut entity = TableEntity::new();
    entity.insert(PARTITION_KEY.to_string(), Value::from(ITEMS_PARTITION));
    entity.insert(ROW_KEY.to_string(), Value::from(row_key(item.id)));
    entity.insert(NAME.to_string(), Value::from(item.name.as_str()));
    entity.insert(PRICE.to_string(), Value::from(item.price));
    annotate(&mut entity, PRICE, EDM_DOUBLE);
    entity.insert(VERSION.to_string(), Value::from(item.version.to_string()));
    annotate(&mut entity, VERSION, EDM_INT64);
    put_timestamp(&mut entity, CREATED_AT, item.created_at);
    put_timestamp(&mut entity, UPDATED_AT, item.updated_at);
    if let Some(deleted_at) = item.deleted_at {
        put_timestamp(&mut entity, DELETED_AT, deleted_at);
    }
    entity
}

fn decode_error(detail: String) -> DbError {
    DbError::new(DbOperation::Decode, DbErrorKind::Opaque).with_detail(detail)
}

fn required<'a>(entity: &'a TableEntity, property: &str) -> DbResult<&'a Value> {
    entity
        .get(property)
        .filter(|v| !v.is_null())
        .ok_or_else(|| decode_error(format!("property {} is missing", property)))
}

fn text<'a>(entity: &'a TableEntity, property: &str) -> DbResult<&'a str> {
    required(entity, property)?
        .as_str()
        .ok_or_else(|| decode_error(format!("property {} is not a string", property)))
}

/// Int64 arrives as a decimal string; tolerate a bare JSON number too
fn unsigned(entity: &TableEntity, property: &str) -> DbResult<u64> {
    let value = required(entity, property)?;
    let parsed = match value {
        Value::String(s) => s.parse::<u64>().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    };
    parsed.ok_or_else(|| decode_error(format!("property {} is not an unsigned integer", property)))
}

fn double(entity: &TableEntity, property: &str) -> DbResult<f64> {
    let value = required(entity, property)?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| decode_error(format!("property {} is not a number", property)))
}

fn timestamp(entity: &TableEntity, property: &str) -> DbResult<DateTime<Utc>> {
    let raw = text(entity, property)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| {
            decode_error(format!("property {} is not a timestamp", property)).with_source(e)
        })
}

/// Typed item from a stored property bag
pub fn decode(entity: &TableEntity) -> DbResult<Item> {
    let raw_key = text(entity, ROW_KEY)?;
    let id = raw_key
        .parse::<ItemId>()
        .map_err(|e| decode_error(format!("row key '{}' is not an identifier", raw_key)).with_source(e))?;

    let deleted_at = match entity.get(DELETED_AT) {
        None | Some(Value::Null) => None,
        Some(_) => Some(timestamp(entity, DELETED_AT)?),
    };

    Ok(Item {
        id,
        name: text(entity, NAME)?.to_string(),
        price: double(entity, PRICE)?,
        version: unsigned(entity, VERSION)?,
        created_at: timestamp(entity, CREATED_AT)?,
        updated_at: timestamp(entity, UPDATED_AT)?,
        deleted_at,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::now_utc;

    fn stored_item() -> Item {
        let now = now_utc();
        let mut item = Item::new("Phone", 99.99).into_created(7, now);
        item.version = 3;
        item
    }

    #[test]
    fn test_row_key_is_zero_padded() {
        assert_eq!(row_key(1), "00000000000000000001");
        assert_eq!(row_key(u64::MAX), "18446744073709551615");
        assert!(row_key(9) < row_key(10));
    }

    #[test]
    fn test_encode_shape() {
        let entity = encode(&stored_item());
        assert_eq!(entity[PARTITION_KEY], json!("items"));
        assert_eq!(entity[ROW_KEY], json!("00000000000000000007"));
        assert_eq!(entity[VERSION], json!("3"));
        assert_eq!(entity["Version@odata.type"], json!("Edm.Int64"));
        assert_eq!(entity["CreatedAt@odata.type"], json!("Edm.DateTime"));
        assert!(!entity.contains_key(DELETED_AT));
    }

    #[test]
    fn test_decode_restores_item() {
        let item = stored_item();
        assert_eq!(decode(&encode(&item)).unwrap(), item);
    }

    #[test]
    fn test_decode_accepts_store_formatting() {
        // The store echoes DateTime with seven fractional digits and may
        // return Int64 as a bare number
        let entity = json!({
            "PartitionKey": "items",
            "RowKey": "00000000000000000002",
            "Timestamp": "2026-10-16T08:00:00.1234567Z",
            "Name": "Laptop",
            "Price": 1200,
            "Version": 4,
            "CreatedAt": "2026-10-16T08:00:00.1234560Z",
            "UpdatedAt": "2026-10-16T08:00:00.1234560Z"
        });
        let item = decode(entity.as_object().unwrap()).unwrap();
        assert_eq!(item.id, 2);
        assert_eq!(item.price, 1200.0);
        assert_eq!(item.version, 4);
        assert_eq!(item.created_at.timestamp_subsec_micros(), 123456);
    }

    #[test]
    fn test_decode_mistyped_property_is_opaque() {
        let mut entity = encode(&stored_item());
        entity.insert(VERSION.to_string(), json!("three"));
        let err = decode(&entity).unwrap_err();
        assert_eq!(err.kind(), DbErrorKind::Opaque);
        assert_eq!(err.operation(), DbOperation::Decode);

        let mut entity = encode(&stored_item());
        entity.remove(NAME);
        let err = decode(&entity).unwrap_err();
        assert!(err.to_string().contains("Name"));
    }
}
