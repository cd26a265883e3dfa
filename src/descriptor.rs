//! Declarative table and view descriptors
//!
//! A module ships `templates/db_scripts/create_table.json` and
//! `create_view.json` describing the tables and views every tenant gets. A
//! [`SchemaMaker`] turns them into the DDL script for one tenant.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{PersistError, Result};

/// Table descriptor resource, relative to the resources root
pub const TABLE_JSON: &str = "templates/db_scripts/create_table.json";

/// View descriptor resource, relative to the resources root
pub const VIEW_JSON: &str = "templates/db_scripts/create_view.json";

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+(\.[0-9]+)*").expect("version pattern compiles"));

/// What happens to a table when its version is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableMode {
    #[default]
    New,
    Delete,
}

/// Expression index on one document field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub field_name: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    pub table_name: String,
    /// Module version that introduced (or removed) the table
    #[serde(default, deserialize_with = "version_string")]
    pub from_module_version: Option<String>,
    #[serde(default)]
    pub mode: TableMode,
    /// Add `creation_date` / `created_by` columns maintained by a trigger
    #[serde(default)]
    pub with_metadata: bool,
    #[serde(default)]
    pub index: Vec<IndexDescriptor>,
}

impl TableDescriptor {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            from_module_version: None,
            mode: TableMode::New,
            with_metadata: false,
            index: Vec::new(),
        }
    }
}

/// One side of a view join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSide {
    pub table_name: String,
    pub join_on_field: String,
    /// Column name the joined document is exposed under
    #[serde(default)]
    pub json_field_alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDescriptor {
    pub table: JoinSide,
    pub join_table: JoinSide,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDescriptor {
    pub view_name: String,
    #[serde(default)]
    pub join: Vec<JoinDescriptor>,
    #[serde(default, deserialize_with = "version_string")]
    pub from_module_version: Option<String>,
}

// Versions show up both as `"1.2"` and as `1.2`.
fn version_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "module version must be a string or a number, got {}",
            other
        ))),
    }
}

/// Numeric components of the last dotted version in `text`
///
/// `"mod-orders-1.2.0"` -> `[1, 2, 0]`, `"10.0"` -> `[10, 0]`.
pub fn parse_version(text: &str) -> Option<Vec<u64>> {
    let found = VERSION_PATTERN.find_iter(text).last()?;
    found
        .as_str()
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

/// True when `version` is strictly newer than `baseline`; missing trailing
/// components count as zero
pub fn is_newer(version: &[u64], baseline: &[u64]) -> bool {
    let len = version.len().max(baseline.len());
    for i in 0..len {
        let a = version.get(i).copied().unwrap_or(0);
        let b = baseline.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    false
}

/// Tables and views a module provisions for each tenant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDescriptors {
    pub tables: Vec<TableDescriptor>,
    pub views: Vec<ViewDescriptor>,
}

impl SchemaDescriptors {
    /// Parse descriptor documents; a missing document means an empty list
    pub fn from_json(tables: Option<&str>, views: Option<&str>) -> Result<Self> {
        let tables = match tables {
            Some(json) => serde_json::from_str(json).map_err(|e| {
                PersistError::template(format!("Invalid {}: {}", TABLE_JSON, e))
            })?,
            None => Vec::new(),
        };
        let views = match views {
            Some(json) => serde_json::from_str(json).map_err(|e| {
                PersistError::template(format!("Invalid {}: {}", VIEW_JSON, e))
            })?,
            None => Vec::new(),
        };
        Ok(Self { tables, views })
    }

    /// Load the descriptor resources under `root`
    ///
    /// Returns `Ok(None)` when neither resource exists.
    pub async fn load(root: impl AsRef<Path>) -> Result<Option<Self>> {
        let root = root.as_ref();
        let tables = read_optional(&root.join(TABLE_JSON)).await?;
        let views = read_optional(&root.join(VIEW_JSON)).await?;

        if tables.is_none() && views.is_none() {
            log::info!(
                "Could not find {} or {} under {}, no scripts will run",
                TABLE_JSON,
                VIEW_JSON,
                root.display()
            );
            return Ok(None);
        }

        Self::from_json(tables.as_deref(), views.as_deref()).map(Some)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.views.is_empty()
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Kind of schema script requested from a [`SchemaMaker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOperation {
    /// First provisioning of the tenant
    Create,
    /// Migration of an existing tenant from the given module version
    Update { from_version: String },
}

/// Everything a schema maker needs to render one tenant's script
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRequest {
    pub tenant_id: String,
    pub module_name: String,
    pub operation: SchemaOperation,
    pub descriptors: SchemaDescriptors,
}

/// Renders table/view descriptors into a DDL script
pub trait SchemaMaker: Send + Sync {
    fn generate_ddl(&self, request: &SchemaRequest) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_descriptors() {
        let descriptors = SchemaDescriptors::from_json(
            Some(
                r#"[
                    {"tableName": "item"},
                    {"tableName": "po_line", "fromModuleVersion": 2.1, "withMetadata": true,
                     "index": [{"fieldName": "title"}]},
                    {"tableName": "legacy", "fromModuleVersion": "3.0", "mode": "delete"}
                ]"#,
            ),
            None,
        )
        .unwrap();

        assert_eq!(descriptors.tables.len(), 3);
        assert_eq!(descriptors.tables[0], TableDescriptor::new("item"));
        assert_eq!(descriptors.tables[1].from_module_version.as_deref(), Some("2.1"));
        assert!(descriptors.tables[1].with_metadata);
        assert_eq!(descriptors.tables[1].index[0].field_name, "title");
        assert_eq!(descriptors.tables[2].mode, TableMode::Delete);
        assert!(descriptors.views.is_empty());
    }

    #[test]
    fn test_parse_view_descriptor() {
        let descriptors = SchemaDescriptors::from_json(
            None,
            Some(
                r#"[{"viewName": "instance_holding_view", "join": [{
                    "table": {"tableName": "instance", "joinOnField": "id"},
                    "joinTable": {"tableName": "holdings", "joinOnField": "instanceId", "jsonFieldAlias": "ho_jsonb"}
                }]}]"#,
            ),
        )
        .unwrap();

        let view = &descriptors.views[0];
        assert_eq!(view.view_name, "instance_holding_view");
        assert_eq!(view.join[0].join_table.json_field_alias.as_deref(), Some("ho_jsonb"));
    }

    #[test]
    fn test_invalid_descriptor_is_a_template_error() {
        let result = SchemaDescriptors::from_json(Some(r#"{"tableName": "x"}"#), None);
        assert!(matches!(result, Err(PersistError::Template(_))));

        let result = SchemaDescriptors::from_json(Some(r#"[{"tableName": "x", "fromModuleVersion": true}]"#), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("10.0"), Some(vec![10, 0]));
        assert_eq!(parse_version("mod-orders-1.2.0"), Some(vec![1, 2, 0]));
        assert_eq!(parse_version("3"), Some(vec![3]));
        assert_eq!(parse_version("no version"), None);
        assert_eq!(parse_version("v١٢"), None);
        assert_eq!(parse_version("mod-1.2-٣"), Some(vec![1, 2]));
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer(&[2, 1], &[2, 0]));
        assert!(is_newer(&[10], &[9, 9]));
        assert!(!is_newer(&[1, 2], &[1, 2, 0]));
        assert!(!is_newer(&[1, 0], &[1, 1]));
    }

    #[tokio::test]
    async fn test_load_missing_resources() {
        let root = std::env::temp_dir().join(format!("descriptors-{}", uuid::Uuid::new_v4()));
        assert!(SchemaDescriptors::load(&root).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_tables_only() {
        let root = std::env::temp_dir().join(format!("descriptors-{}", uuid::Uuid::new_v4()));
        let dir = root.join("templates/db_scripts");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("create_table.json"), r#"[{"tableName": "item"}]"#)
            .await
            .unwrap();

        let descriptors = SchemaDescriptors::load(&root).await.unwrap().unwrap();
        assert_eq!(descriptors.tables, vec![TableDescriptor::new("item")]);
        assert!(descriptors.views.is_empty());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
