//! DDL generation for tenant schemas
//!
//! Renders table and view descriptors into the provisioning script of one
//! tenant. Every statement ends with `;` at the end of a line so the script
//! runner can split it again.

use crate::descriptor::{
    SchemaMaker, SchemaOperation, SchemaRequest, TableDescriptor, TableMode, ViewDescriptor,
    is_newer, parse_version,
};
use crate::error::{PersistError, Result};
use crate::mapper::ID_FIELD;
use crate::sql::criteria::{JSONB_FIELD, json_accessor};
use crate::sql::sanitize::{qualified_table, quote_identifier, quote_literal, tenant_schema_name, validate_identifier};

/// Reference schema maker for JSONB document tables
///
/// Each table gets an `_id UUID` primary key, a `jsonb` payload column and a
/// GIN index over the payload. Field indexes, metadata columns and views are
/// added from the descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicSchemaMaker;

impl BasicSchemaMaker {
    pub fn new() -> Self {
        Self
    }

    /// Role, schema and search path owned by the tenant
    pub fn generate_tenant_setup(&self, schema: &str) -> Vec<String> {
        let role = quote_identifier(schema);
        vec![
            format!(
                "CREATE ROLE {} PASSWORD {} NOSUPERUSER NOCREATEDB INHERIT LOGIN;",
                role,
                quote_literal(schema)
            ),
            format!("GRANT {} TO CURRENT_USER;", role),
            format!("CREATE SCHEMA {} AUTHORIZATION {};", role, role),
            format!("ALTER ROLE {} SET search_path = {};", role, role),
        ]
    }

    /// Generate CREATE TABLE statement for a document table
    pub fn generate_create_table(&self, schema: &str, table_name: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} UUID PRIMARY KEY DEFAULT gen_random_uuid(), {} JSONB NOT NULL);",
            qualified_table(schema, table_name),
            ID_FIELD,
            JSONB_FIELD
        )
    }

    /// Generate DROP TABLE statement
    pub fn generate_drop_table(&self, schema: &str, table_name: &str) -> String {
        format!(
            "DROP TABLE IF EXISTS {} CASCADE;",
            qualified_table(schema, table_name)
        )
    }

    /// GIN index over the whole payload, used by containment queries
    pub fn generate_default_index(&self, schema: &str, table_name: &str) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING GIN ({});",
            quote_identifier(&format!("{}_{}_gin_idx", table_name, JSONB_FIELD)),
            qualified_table(schema, table_name),
            JSONB_FIELD
        )
    }

    /// Expression index on one (possibly dotted) payload field
    ///
    /// Case-insensitive indexes wrap the value in `lower()`, matching how
    /// ILIKE filters are written.
    pub fn generate_create_index(
        &self,
        schema: &str,
        table_name: &str,
        field_name: &str,
        case_sensitive: bool,
        unique: bool,
    ) -> String {
        let keys: Vec<String> = field_name.split('.').map(str::to_string).collect();
        let accessor = json_accessor(JSONB_FIELD, &keys, true);
        let expression = if case_sensitive {
            format!("({})", accessor)
        } else {
            format!("(lower({}))", accessor)
        };
        let index_name = format!("{}_{}_idx", table_name, keys.join("_"));
        let unique_clause = if unique { "UNIQUE " } else { "" };

        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});",
            unique_clause,
            quote_identifier(&index_name),
            qualified_table(schema, table_name),
            expression
        )
    }

    /// Creation metadata columns filled by a BEFORE INSERT trigger
    pub fn generate_metadata(&self, schema: &str, table_name: &str) -> Vec<String> {
        let table = qualified_table(schema, table_name);
        let function = qualified_table(schema, &format!("{}_set_md", table_name));
        let trigger = quote_identifier(&format!("set_{}_md_trigger", table_name));

        vec![
            format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS creation_date TIMESTAMP;", table),
            format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS created_by TEXT;", table),
            [
                format!("CREATE OR REPLACE FUNCTION {}() RETURNS TRIGGER AS $$", function),
                "BEGIN".to_string(),
                "  NEW.creation_date := now();".to_string(),
                format!(
                    "  NEW.created_by := NEW.{};",
                    json_accessor(
                        JSONB_FIELD,
                        &["metadata".to_string(), "createdByUserId".to_string()],
                        true
                    )
                ),
                "  RETURN NEW;".to_string(),
                "END;".to_string(),
                "$$ LANGUAGE plpgsql;".to_string(),
            ]
            .join("\n"),
            format!("DROP TRIGGER IF EXISTS {} ON {};", trigger, table),
            format!(
                "CREATE TRIGGER {} BEFORE INSERT ON {} FOR EACH ROW EXECUTE PROCEDURE {}();",
                trigger, table, function
            ),
        ]
    }

    /// All statements for one table
    pub fn generate_table(&self, schema: &str, table: &TableDescriptor) -> Result<Vec<String>> {
        checked_name(&table.table_name)?;

        if table.mode == TableMode::Delete {
            return Ok(vec![self.generate_drop_table(schema, &table.table_name)]);
        }

        let mut statements = vec![self.generate_create_table(schema, &table.table_name)];
        if table.with_metadata {
            statements.extend(self.generate_metadata(schema, &table.table_name));
        }
        statements.push(self.generate_default_index(schema, &table.table_name));
        for index in &table.index {
            statements.push(self.generate_create_index(
                schema,
                &table.table_name,
                &index.field_name,
                index.case_sensitive,
                index.unique,
            ));
        }
        Ok(statements)
    }

    /// CREATE OR REPLACE VIEW joining document tables on payload fields
    ///
    /// The first joined table is the base of the view and exposes `_id` and
    /// `jsonb`; every joined table adds its payload under its alias
    /// (`<table>_jsonb` by default).
    pub fn generate_view(&self, schema: &str, view: &ViewDescriptor) -> Result<String> {
        checked_name(&view.view_name)?;
        let first = view.join.first().ok_or_else(|| {
            PersistError::template(format!("View {} has no joins", view.view_name))
        })?;
        checked_name(&first.table.table_name)?;

        let mut aliases = vec![(first.table.table_name.as_str(), "t0".to_string())];
        let mut columns = vec![format!("t0.{}", ID_FIELD), format!("t0.{}", JSONB_FIELD)];
        let mut joins = Vec::new();

        for (i, join) in view.join.iter().enumerate() {
            checked_name(&join.join_table.table_name)?;
            let left = aliases
                .iter()
                .find(|(name, _)| *name == join.table.table_name)
                .map(|(_, alias)| alias.clone())
                .ok_or_else(|| {
                    PersistError::template(format!(
                        "View {} joins on {} before it is part of the view",
                        view.view_name, join.table.table_name
                    ))
                })?;
            let right = format!("t{}", i + 1);

            let payload_alias = join
                .join_table
                .json_field_alias
                .clone()
                .unwrap_or_else(|| format!("{}_{}", join.join_table.table_name, JSONB_FIELD));
            columns.push(format!(
                "{}.{} AS {}",
                right,
                JSONB_FIELD,
                quote_identifier(&payload_alias)
            ));
            joins.push(format!(
                "JOIN {} {} ON {} = {}",
                qualified_table(schema, &join.join_table.table_name),
                right,
                join_key(&left, &join.table.join_on_field),
                join_key(&right, &join.join_table.join_on_field)
            ));
            aliases.push((join.join_table.table_name.as_str(), right));
        }

        Ok(format!(
            "CREATE OR REPLACE VIEW {} AS SELECT {} FROM {} t0 {};",
            qualified_table(schema, &view.view_name),
            columns.join(", "),
            qualified_table(schema, &first.table.table_name),
            joins.join(" ")
        ))
    }

    pub fn generate_grants(&self, schema: &str) -> String {
        let role = quote_identifier(schema);
        format!(
            "GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA {} TO {};",
            role, role
        )
    }
}

impl SchemaMaker for BasicSchemaMaker {
    fn generate_ddl(&self, request: &SchemaRequest) -> Result<String> {
        let schema = tenant_schema_name(&request.tenant_id);
        validate_identifier(&schema, &[]).map_err(|e| {
            PersistError::tenant_conflict(format!("Tenant {}: {}", request.tenant_id, e))
        })?;

        let baseline = match &request.operation {
            SchemaOperation::Create => None,
            SchemaOperation::Update { from_version } => {
                Some(parse_version(from_version).ok_or_else(|| {
                    PersistError::template(format!("Not a module version: {}", from_version))
                })?)
            }
        };

        // On update only descriptors introduced after the installed version apply
        let applies = |version: &Option<String>| match (&baseline, version) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(from), Some(version)) => parse_version(version)
                .map(|v| is_newer(&v, from))
                .unwrap_or(false),
        };

        let mut statements = Vec::new();
        if baseline.is_none() {
            statements.extend(self.generate_tenant_setup(&schema));
        }

        for table in &request.descriptors.tables {
            if !applies(&table.from_module_version) {
                continue;
            }
            if baseline.is_none() && table.mode == TableMode::Delete {
                continue;
            }
            statements.extend(self.generate_table(&schema, table)?);
        }

        for view in &request.descriptors.views {
            if applies(&view.from_module_version) {
                statements.push(self.generate_view(&schema, view)?);
            }
        }

        statements.push(self.generate_grants(&schema));

        log::debug!(
            "Generated {} statements for tenant {} module {}",
            statements.len(),
            request.tenant_id,
            request.module_name
        );

        let mut script = format!(
            "-- Schema for module {}, tenant {}\n\n",
            request.module_name, schema
        );
        script.push_str(&statements.join("\n\n"));
        script.push('\n');
        Ok(script)
    }
}

fn checked_name(name: &str) -> Result<()> {
    validate_identifier(name, &[]).map_err(PersistError::template)
}

fn join_key(alias: &str, field: &str) -> String {
    if field == ID_FIELD {
        return format!("{}.{}::text", alias, ID_FIELD);
    }
    let keys: Vec<String> = field.split('.').map(str::to_string).collect();
    format!("({})", json_accessor(&format!("{}.{}", alias, JSONB_FIELD), &keys, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{IndexDescriptor, JoinDescriptor, JoinSide, SchemaDescriptors};
    use crate::script::split_statements;

    // ==================== Test Helpers ====================

    fn request(operation: SchemaOperation, descriptors: SchemaDescriptors) -> SchemaRequest {
        SchemaRequest {
            tenant_id: "Test_Lib".to_string(),
            module_name: "mod-items".to_string(),
            operation,
            descriptors,
        }
    }

    fn versioned(name: &str, version: &str) -> TableDescriptor {
        TableDescriptor {
            from_module_version: Some(version.to_string()),
            ..TableDescriptor::new(name)
        }
    }

    fn side(table: &str, field: &str) -> JoinSide {
        JoinSide {
            table_name: table.to_string(),
            join_on_field: field.to_string(),
            json_field_alias: None,
        }
    }

    // ==================== Statement Tests ====================

    #[test]
    fn test_generate_create_table() {
        let ddl = BasicSchemaMaker::new().generate_create_table("test_lib", "item");
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS \"test_lib\".\"item\" (_id UUID PRIMARY KEY DEFAULT gen_random_uuid(), jsonb JSONB NOT NULL);"
        );
    }

    #[test]
    fn test_generate_drop_table() {
        let ddl = BasicSchemaMaker::new().generate_drop_table("test_lib", "legacy");
        assert_eq!(ddl, "DROP TABLE IF EXISTS \"test_lib\".\"legacy\" CASCADE;");
    }

    #[test]
    fn test_generate_default_index() {
        let ddl = BasicSchemaMaker::new().generate_default_index("test_lib", "item");
        assert_eq!(
            ddl,
            "CREATE INDEX IF NOT EXISTS \"item_jsonb_gin_idx\" ON \"test_lib\".\"item\" USING GIN (jsonb);"
        );
    }

    #[test]
    fn test_generate_create_index_case_insensitive() {
        let ddl = BasicSchemaMaker::new().generate_create_index("test_lib", "item", "title", false, false);
        assert_eq!(
            ddl,
            "CREATE INDEX IF NOT EXISTS \"item_title_idx\" ON \"test_lib\".\"item\" ((lower(jsonb->>'title')));"
        );
    }

    #[test]
    fn test_generate_create_index_unique_nested() {
        let ddl = BasicSchemaMaker::new().generate_create_index("test_lib", "item", "status.code", true, true);
        assert_eq!(
            ddl,
            "CREATE UNIQUE INDEX IF NOT EXISTS \"item_status_code_idx\" ON \"test_lib\".\"item\" ((jsonb->'status'->>'code'));"
        );
    }

    #[test]
    fn test_generate_tenant_setup() {
        let statements = BasicSchemaMaker::new().generate_tenant_setup("test_lib");
        assert_eq!(
            statements[0],
            "CREATE ROLE \"test_lib\" PASSWORD 'test_lib' NOSUPERUSER NOCREATEDB INHERIT LOGIN;"
        );
        assert_eq!(statements[2], "CREATE SCHEMA \"test_lib\" AUTHORIZATION \"test_lib\";");
    }

    #[test]
    fn test_metadata_function_survives_splitting() {
        let statements = BasicSchemaMaker::new().generate_metadata("test_lib", "item");
        let script = statements.join("\n\n");
        let split = split_statements(&script);

        assert_eq!(split, statements);
        assert!(split[2].starts_with("CREATE OR REPLACE FUNCTION \"test_lib\".\"item_set_md\"()"));
        assert!(split[2].contains("NEW.jsonb->'metadata'->>'createdByUserId'"));
        assert!(split[4].contains("BEFORE INSERT ON \"test_lib\".\"item\""));
    }

    #[test]
    fn test_generate_view() {
        let view = ViewDescriptor {
            view_name: "instance_holding_view".to_string(),
            join: vec![JoinDescriptor {
                table: side("instance", "id"),
                join_table: JoinSide {
                    json_field_alias: Some("ho_jsonb".to_string()),
                    ..side("holdings", "instanceId")
                },
            }],
            from_module_version: None,
        };

        let ddl = BasicSchemaMaker::new().generate_view("test_lib", &view).unwrap();
        assert_eq!(
            ddl,
            "CREATE OR REPLACE VIEW \"test_lib\".\"instance_holding_view\" AS SELECT t0._id, t0.jsonb, t1.jsonb AS \"ho_jsonb\" FROM \"test_lib\".\"instance\" t0 JOIN \"test_lib\".\"holdings\" t1 ON (t0.jsonb->>'id') = (t1.jsonb->>'instanceId');"
        );
    }

    #[test]
    fn test_generate_view_rejects_unknown_join_side() {
        let view = ViewDescriptor {
            view_name: "broken_view".to_string(),
            join: vec![
                JoinDescriptor {
                    table: side("a", "id"),
                    join_table: side("b", "aId"),
                },
                JoinDescriptor {
                    table: side("c", "id"),
                    join_table: side("d", "cId"),
                },
            ],
            from_module_version: None,
        };
        let result = BasicSchemaMaker::new().generate_view("test_lib", &view);
        assert!(matches!(result, Err(PersistError::Template(_))));
    }

    #[test]
    fn test_generate_table_rejects_bad_name() {
        let result = BasicSchemaMaker::new().generate_table("test_lib", &TableDescriptor::new("items; DROP"));
        assert!(matches!(result, Err(PersistError::Template(_))));
    }

    // ==================== Script Tests ====================

    #[test]
    fn test_create_script() {
        let descriptors = SchemaDescriptors {
            tables: vec![TableDescriptor {
                index: vec![IndexDescriptor {
                    field_name: "title".to_string(),
                    case_sensitive: false,
                    unique: false,
                }],
                ..TableDescriptor::new("item")
            }],
            views: Vec::new(),
        };

        let script = BasicSchemaMaker::new()
            .generate_ddl(&request(SchemaOperation::Create, descriptors))
            .unwrap();

        assert!(script.starts_with("-- Schema for module mod-items, tenant test_lib"));
        assert!(script.contains("CREATE SCHEMA \"test_lib\""));
        assert!(script.contains("CREATE TABLE IF NOT EXISTS \"test_lib\".\"item\""));
        assert!(script.contains("\"item_title_idx\""));
        assert!(script.trim_end().ends_with(
            "GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA \"test_lib\" TO \"test_lib\";"
        ));

        // role, grant, schema, search path, table, gin, index, grants
        assert_eq!(split_statements(&script).len(), 8);
    }

    #[test]
    fn test_create_script_skips_deleted_tables() {
        let descriptors = SchemaDescriptors {
            tables: vec![
                TableDescriptor::new("item"),
                TableDescriptor {
                    mode: TableMode::Delete,
                    ..versioned("legacy", "2.0")
                },
            ],
            views: Vec::new(),
        };

        let script = BasicSchemaMaker::new()
            .generate_ddl(&request(SchemaOperation::Create, descriptors))
            .unwrap();
        assert!(!script.contains("legacy"));
    }

    #[test]
    fn test_update_script_applies_newer_tables_only() {
        let descriptors = SchemaDescriptors {
            tables: vec![
                TableDescriptor::new("item"),
                versioned("old_table", "1.0"),
                versioned("new_table", "2.1"),
                TableDescriptor {
                    mode: TableMode::Delete,
                    ..versioned("legacy", "3")
                },
            ],
            views: Vec::new(),
        };
        let operation = SchemaOperation::Update {
            from_version: "mod-items-2.0.0".to_string(),
        };

        let script = BasicSchemaMaker::new()
            .generate_ddl(&request(operation, descriptors))
            .unwrap();

        assert!(!script.contains("CREATE ROLE"));
        assert!(!script.contains("CREATE SCHEMA"));
        assert!(!script.contains("\"item\""));
        assert!(!script.contains("old_table"));
        assert!(script.contains("CREATE TABLE IF NOT EXISTS \"test_lib\".\"new_table\""));
        assert!(script.contains("DROP TABLE IF EXISTS \"test_lib\".\"legacy\" CASCADE;"));
    }

    #[test]
    fn test_update_with_unparseable_version() {
        let operation = SchemaOperation::Update {
            from_version: "latest".to_string(),
        };
        let result = BasicSchemaMaker::new().generate_ddl(&request(operation, SchemaDescriptors::default()));
        assert!(matches!(result, Err(PersistError::Template(_))));
    }

    #[test]
    fn test_invalid_tenant_is_a_conflict() {
        let mut request = request(SchemaOperation::Create, SchemaDescriptors::default());
        request.tenant_id = "bad-tenant".to_string();
        let result = BasicSchemaMaker::new().generate_ddl(&request);
        assert!(matches!(result, Err(PersistError::TenantConflict(_))));
    }
}
