//! Mapping between stored rows and typed entities
//!
//! A row holds the JSON payload, the surrogate id and any extra columns a
//! query selected. [`Mapping`] describes, per entity type, how those parts are
//! written into the entity. Rows are first converted into [`RowData`] so the
//! mapping itself does not depend on a live database row.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row};

use crate::error::{PersistError, Result};
use crate::sql::criteria::JSONB_FIELD;

/// Name of the surrogate id column
pub const ID_FIELD: &str = "_id";

/// Name of the windowed total-count column
pub const COUNT_FIELD: &str = "count";

/// Value of an extra selected column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(Option<String>),
    /// Column whose type could not be read as text
    Unsupported(String),
}

/// Database-independent view of one result row
#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    pub payload: Value,
    pub id: Option<String>,
    pub count: Option<i64>,
    pub columns: Vec<(String, ColumnValue)>,
}

impl RowData {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            id: None,
            count: None,
            columns: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_column(mut self, name: impl Into<String>, value: ColumnValue) -> Self {
        self.columns.push((name.into(), value));
        self
    }

    /// Read the known columns of a query row; every other column is kept as
    /// an extra column
    pub(crate) fn from_pg_row(row: &PgRow) -> Result<Self> {
        let payload: Value = row.try_get(JSONB_FIELD)?;
        let mut data = Self::new(payload);

        for column in row.columns() {
            let name = column.name();
            match name {
                JSONB_FIELD => {}
                ID_FIELD => data.id = row.try_get::<Option<String>, _>(name)?,
                COUNT_FIELD => data.count = row.try_get::<Option<i64>, _>(name)?,
                _ => {
                    let value = match row.try_get::<Option<String>, _>(name) {
                        Ok(text) => ColumnValue::Text(text),
                        Err(e) => ColumnValue::Unsupported(e.to_string()),
                    };
                    data.columns.push((name.to_string(), value));
                }
            }
        }

        Ok(data)
    }
}

/// Writes a column value into an entity field
pub type FieldSetter<T> = fn(&mut T, String);

struct Envelope<T> {
    new: fn() -> T,
    set_payload: fn(&mut T, Value),
}

/// Per-type mapping descriptor
///
/// By default the payload is deserialized into the entity. In envelope mode
/// the entity is constructed empty and receives the raw payload through a
/// setter, for wrapper types that carry the document next to row metadata.
pub struct Mapping<T> {
    envelope: Option<Envelope<T>>,
    fields: Vec<(&'static str, FieldSetter<T>)>,
    id: Option<FieldSetter<T>>,
}

impl<T> Default for Mapping<T> {
    fn default() -> Self {
        Self {
            envelope: None,
            fields: Vec::new(),
            id: None,
        }
    }
}

impl<T> fmt::Debug for Mapping<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("envelope", &self.envelope.is_some())
            .field("fields", &self.fields.iter().map(|(n, _)| *n).collect::<Vec<_>>())
            .field("id", &self.id.is_some())
            .finish()
    }
}

impl<T> Mapping<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to envelope mode
    pub fn envelope(mut self, new: fn() -> T, set_payload: fn(&mut T, Value)) -> Self {
        self.envelope = Some(Envelope { new, set_payload });
        self
    }

    /// Register a setter for the camelCase field `name`
    pub fn field(mut self, name: &'static str, setter: FieldSetter<T>) -> Self {
        self.fields.push((name, setter));
        self
    }

    /// Register the setter receiving the row id
    pub fn id(mut self, setter: FieldSetter<T>) -> Self {
        self.id = Some(setter);
        self
    }

    pub fn is_envelope(&self) -> bool {
        self.envelope.is_some()
    }

    fn setter(&self, field: &str) -> Option<FieldSetter<T>> {
        self.fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, setter)| *setter)
    }
}

impl<T: DeserializeOwned> Mapping<T> {
    /// Build one entity from a row
    ///
    /// Payload first, then extra columns, then the id when `set_id` is set.
    /// Extra columns without a matching field are logged and skipped.
    pub fn map_row(&self, row: RowData, set_id: bool) -> Result<T> {
        let mut entity = match &self.envelope {
            Some(envelope) => {
                let mut entity = (envelope.new)();
                (envelope.set_payload)(&mut entity, row.payload);
                entity
            }
            None => serde_json::from_value(row.payload)?,
        };

        for (column, value) in row.columns {
            let field = snake_to_camel(&column);
            match (self.setter(&field), value) {
                (Some(setter), ColumnValue::Text(Some(text))) => setter(&mut entity, text),
                (Some(_), ColumnValue::Text(None)) => {}
                (Some(_), ColumnValue::Unsupported(reason)) => {
                    log::warn!(
                        "Unable to populate field {} for object of type {}: {}",
                        field,
                        std::any::type_name::<T>(),
                        reason
                    );
                }
                (None, _) => {
                    log::warn!(
                        "No field {} on {} for column {}, skipping",
                        field,
                        std::any::type_name::<T>(),
                        column
                    );
                }
            }
        }

        if set_id {
            match (self.id, row.id) {
                (Some(setter), Some(id)) => setter(&mut entity, id),
                (None, Some(_)) => log::debug!(
                    "{} has no id setter, id not populated",
                    std::any::type_name::<T>()
                ),
                (_, None) => {}
            }
        }

        Ok(entity)
    }
}

/// Entity stored as a JSON document
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn mapping() -> Mapping<Self> {
        Mapping::new()
    }
}

impl Document for Value {}

/// Map every row or fail; the total is the windowed count when one was
/// selected, else the number of rows
pub fn map_rows<T: Document>(rows: Vec<RowData>, set_id: bool) -> Result<(Vec<T>, i64)> {
    let mapping = T::mapping();
    let count = rows.first().and_then(|r| r.count);
    let total = count.unwrap_or(rows.len() as i64);

    let entities = rows
        .into_iter()
        .map(|row| mapping.map_row(row, set_id))
        .collect::<Result<Vec<_>>>()
        .inspect_err(|e| {
            log::error!("Failed to map rows to {}: {}", std::any::type_name::<T>(), e);
        })?;

    Ok((entities, total))
}

/// `po_line_status` -> `poLineStatus`
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Decodes a stored payload into the normalized JSON form of a registered type
pub type Decoder = fn(Value) -> Result<Value>;

fn normalize<T: Document>(payload: Value) -> Result<Value> {
    let entity: T = serde_json::from_value(payload)?;
    Ok(serde_json::to_value(entity)?)
}

/// Type-tag registry used to decode rows whose type is only known by name
///
/// Filled at startup; lookups never construct types reflectively.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    decoders: HashMap<String, Decoder>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `tag`, replacing any previous registration
    pub fn register<T: Document>(&mut self, tag: impl Into<String>) -> &mut Self {
        self.decoders.insert(tag.into(), normalize::<T> as Decoder);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Decode `payload` as the type registered under `tag`
    pub fn decode(&self, tag: &str, payload: Value) -> Result<Value> {
        let decoder = self.decoders.get(tag).ok_or_else(|| {
            PersistError::configuration(format!("No type registered under tag '{}'", tag))
        })?;
        decoder(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct PoLine {
        #[serde(default)]
        id: Option<String>,
        title: String,
        #[serde(skip)]
        po_line_status: Option<String>,
    }

    impl Document for PoLine {
        fn mapping() -> Mapping<Self> {
            Mapping::new()
                .field("poLineStatus", |p: &mut PoLine, v| p.po_line_status = Some(v))
                .id(|p: &mut PoLine, id| p.id = Some(id))
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct AuditRecord {
        #[serde(skip)]
        jsonb: Value,
        #[serde(skip)]
        record_id: Option<String>,
        #[serde(skip)]
        action: Option<String>,
    }

    impl Document for AuditRecord {
        fn mapping() -> Mapping<Self> {
            Mapping::new()
                .envelope(AuditRecord::default, |a, payload| a.jsonb = payload)
                .field("action", |a: &mut AuditRecord, v| a.action = Some(v))
                .id(|a: &mut AuditRecord, id| a.record_id = Some(id))
        }
    }

    #[test]
    fn test_payload_is_deserialized() {
        let rows = vec![RowData::new(json!({"title": "Dune"}))];
        let (lines, total) = map_rows::<PoLine>(rows, false).unwrap();
        assert_eq!(total, 1);
        assert_eq!(lines[0].title, "Dune");
        assert!(lines[0].id.is_none());
    }

    #[test]
    fn test_id_is_written_last() {
        let rows = vec![RowData::new(json!({"id": "from-payload", "title": "Dune"})).with_id("row-id")];
        let (lines, _) = map_rows::<PoLine>(rows, true).unwrap();
        assert_eq!(lines[0].id.as_deref(), Some("row-id"));
    }

    #[test]
    fn test_id_ignored_without_set_id() {
        let rows = vec![RowData::new(json!({"id": "from-payload", "title": "Dune"})).with_id("row-id")];
        let (lines, _) = map_rows::<PoLine>(rows, false).unwrap();
        assert_eq!(lines[0].id.as_deref(), Some("from-payload"));
    }

    #[test]
    fn test_snake_case_column_maps_to_camel_case_field() {
        let rows = vec![
            RowData::new(json!({"title": "Dune"}))
                .with_column("po_line_status", ColumnValue::Text(Some("SENT".into())))
                .with_column("unknown_column", ColumnValue::Text(Some("x".into()))),
        ];
        let (lines, _) = map_rows::<PoLine>(rows, false).unwrap();
        assert_eq!(lines[0].po_line_status.as_deref(), Some("SENT"));
    }

    #[test]
    fn test_unsupported_column_is_skipped() {
        let rows = vec![
            RowData::new(json!({"title": "Dune"}))
                .with_column("po_line_status", ColumnValue::Unsupported("bytea".into())),
        ];
        let (lines, _) = map_rows::<PoLine>(rows, false).unwrap();
        assert!(lines[0].po_line_status.is_none());
    }

    #[test]
    fn test_envelope_receives_raw_payload() {
        let payload = json!({"anything": [1, 2, 3]});
        let rows = vec![
            RowData::new(payload.clone())
                .with_id("a1")
                .with_column("action", ColumnValue::Text(Some("CREATE".into()))),
        ];
        let (records, _) = map_rows::<AuditRecord>(rows, true).unwrap();
        assert_eq!(records[0].jsonb, payload);
        assert_eq!(records[0].action.as_deref(), Some("CREATE"));
        assert_eq!(records[0].record_id.as_deref(), Some("a1"));
        assert!(AuditRecord::mapping().is_envelope());
    }

    #[test]
    fn test_one_bad_row_fails_the_batch() {
        let rows = vec![
            RowData::new(json!({"title": "Dune"})),
            RowData::new(json!({"title": 42})),
        ];
        let result = map_rows::<PoLine>(rows, false);
        assert!(matches!(result, Err(PersistError::Serialization(_))));
    }

    #[test]
    fn test_total_comes_from_count_column() {
        let rows = vec![
            RowData::new(json!({"title": "a"})).with_count(57),
            RowData::new(json!({"title": "b"})).with_count(57),
        ];
        let (lines, total) = map_rows::<PoLine>(rows, false).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(total, 57);
    }

    #[test]
    fn test_empty_result() {
        let (lines, total) = map_rows::<PoLine>(Vec::new(), true).unwrap();
        assert!(lines.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_snake_to_camel() {
        assert_eq!(snake_to_camel("po_line_status"), "poLineStatus");
        assert_eq!(snake_to_camel("action"), "action");
        assert_eq!(snake_to_camel("_private"), "private");
        assert_eq!(snake_to_camel("alreadyCamel"), "alreadyCamel");
    }

    #[test]
    fn test_type_registry_decodes_by_tag() {
        let mut registry = TypeRegistry::new();
        registry.register::<PoLine>("po_line").register::<Value>("raw");

        let decoded = registry
            .decode("po_line", json!({"title": "Dune", "extra": true}))
            .unwrap();
        assert_eq!(decoded, json!({"id": null, "title": "Dune"}));
        assert_eq!(registry.tags(), vec!["po_line", "raw"]);
    }

    #[test]
    fn test_type_registry_unknown_tag() {
        let registry = TypeRegistry::new();
        let result = registry.decode("missing", json!({}));
        assert!(matches!(result, Err(PersistError::Configuration(_))));
    }

    #[test]
    fn test_type_registry_rejects_bad_payload() {
        let mut registry = TypeRegistry::new();
        registry.register::<PoLine>("po_line");
        assert!(registry.decode("po_line", json!({"title": 1})).is_err());
    }
}
