//! Multi-statement SQL scripts
//!
//! Scripts are split line by line into statements and executed one at a time
//! on a dedicated autocommit connection. Function definitions span several
//! `;`-terminated lines, so a statement that opens with `CREATE [OR REPLACE]
//! FUNCTION` runs until its `LANGUAGE` clause plus any attribute lines that
//! directly follow it.

use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use sqlx::{Connection, Executor, PgConnection};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{PersistError, Result};

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r\n|\r|\n").expect("line break pattern compiles"));

static FUNCTION_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(CREATE OR REPLACE FUNCTION|CREATE FUNCTION)").expect("function pattern compiles")
});

static LANGUAGE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"LANGUAGE\s").expect("language pattern compiles"));

static FUNCTION_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(WINDOW|IMMUTABLE|STABLE|VOLATILE|CALLED ON NULL INPUT|RETURNS NULL ON NULL INPUT|STRICT|SECURITY INVOKER|SECURITY DEFINER|SET\s.*|AS\s.*|COST\s\d.*|ROWS\s.*);?$",
    )
    .expect("function attribute pattern compiles")
});

fn is_comment(line: &str) -> bool {
    line.trim_start()
        .trim_start_matches('\u{feff}')
        .starts_with("--")
}

fn flush(pending: &mut Vec<&str>, statements: &mut Vec<String>) {
    let statement = pending.join("\n").trim().to_string();
    if !statement.is_empty() {
        statements.push(statement);
    }
    pending.clear();
}

/// Split a script into executable statements
///
/// Blank lines and `--` comment lines are dropped. Outside a function
/// definition a statement ends on a line ending with `;`. Text after the last
/// terminator is returned as a final statement.
pub fn split_statements(script: &str) -> Vec<String> {
    let lines: Vec<&str> = LINE_BREAK.split(script).collect();
    let mut statements = Vec::new();
    let mut pending: Vec<&str> = Vec::new();
    let mut in_function = false;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        i += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() || is_comment(line) {
            continue;
        }

        let upper = trimmed.to_uppercase();
        pending.push(line);

        if !in_function && FUNCTION_START.is_match(&upper) {
            in_function = true;
        }

        // The opening line may carry the LANGUAGE clause itself
        if in_function {
            if LANGUAGE_CLAUSE.is_match(&upper) {
                if !trimmed.ends_with(';') {
                    while let Some(next) = lines.get(i) {
                        let next_trimmed = next.trim();
                        if !FUNCTION_ATTRIBUTE.is_match(&next_trimmed.to_uppercase()) {
                            break;
                        }
                        pending.push(next);
                        i += 1;
                        if next_trimmed.ends_with(';') {
                            break;
                        }
                    }
                }
                in_function = false;
                flush(&mut pending, &mut statements);
            }
        } else if trimmed.ends_with(';') {
            flush(&mut pending, &mut statements);
        }
    }

    flush(&mut pending, &mut statements);
    statements
}

/// Runs scripts on a dedicated, non-pooled connection
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    connection: ConnectionConfig,
}

impl ScriptRunner {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self { connection }
    }

    /// Split and run `script`, returning the statements that failed
    ///
    /// An empty list means every statement succeeded. Only a failure to
    /// connect is returned as an error.
    pub async fn run(&self, script: &str, stop_on_error: bool) -> Result<Vec<String>> {
        let statements = split_statements(script);
        self.execute(&statements, stop_on_error).await
    }

    /// Run `script` and fail on the first statement that does not succeed
    pub async fn run_strict(&self, script: &str) -> Result<()> {
        let failed = self.run(script, true).await?;
        match failed.into_iter().next() {
            Some(statement) => Err(PersistError::ScriptStatement(statement)),
            None => Ok(()),
        }
    }

    /// Run already split statements in order
    pub async fn execute(&self, statements: &[String], stop_on_error: bool) -> Result<Vec<String>> {
        let batch = Uuid::new_v4();
        let started = Instant::now();
        log::info!("Executing {} statements with id {}", statements.len(), batch);

        let mut conn = PgConnection::connect_with(&self.connection.connect_options())
            .await
            .map_err(|e| {
                log::error!("Batch {}: unable to connect: {}", batch, e);
                PersistError::connection(format!(
                    "Unable to connect to {}:{}/{}: {}",
                    self.connection.host, self.connection.port, self.connection.database, e
                ))
            })?;

        let mut failed = Vec::new();
        for statement in statements {
            log::debug!("Batch {}: trying to execute: {}", batch, statement);
            match (&mut conn).execute(sqlx::raw_sql(statement)).await {
                Ok(_) => log::debug!("Batch {}: successfully executed", batch),
                Err(e) => {
                    log::error!("Batch {}: {} failed: {}", batch, statement, e);
                    failed.push(statement.clone());
                    if stop_on_error {
                        break;
                    }
                }
            }
        }

        if let Err(e) = conn.close().await {
            log::warn!("Batch {}: closing connection failed: {}", batch, e);
        }

        log::info!(
            "Batch {} finished in {:?}, {} of {} statements failed",
            batch,
            started.elapsed(),
            failed.len(),
            statements.len()
        );
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple_statements() {
        let script = "CREATE TABLE a (id int);\nINSERT INTO a VALUES (1);\n";
        assert_eq!(
            split_statements(script),
            vec!["CREATE TABLE a (id int);", "INSERT INTO a VALUES (1);"]
        );
    }

    #[test]
    fn test_split_skips_comments_and_blank_lines() {
        let script = "\u{feff}-- header\n\n-- create\nCREATE TABLE a (\n  id int\n);\n\n   \n";
        assert_eq!(split_statements(script), vec!["CREATE TABLE a (\n  id int\n);"]);
    }

    #[test]
    fn test_split_handles_all_line_endings() {
        let script = "SELECT 1;\r\nSELECT 2;\rSELECT 3;\nSELECT 4;";
        assert_eq!(
            split_statements(script),
            vec!["SELECT 1;", "SELECT 2;", "SELECT 3;", "SELECT 4;"]
        );
    }

    #[test]
    fn test_split_keeps_function_body_together() {
        let script = r#"
CREATE OR REPLACE FUNCTION test_lib.touch() RETURNS trigger AS $$
BEGIN
  NEW.creation_date := now();
  RETURN NEW;
END;
$$ LANGUAGE plpgsql;
CREATE TRIGGER touch BEFORE INSERT ON test_lib.item FOR EACH ROW EXECUTE PROCEDURE test_lib.touch();
"#;
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE OR REPLACE FUNCTION"));
        assert!(statements[0].ends_with("$$ LANGUAGE plpgsql;"));
        assert!(statements[0].contains("RETURN NEW;"));
        assert!(statements[1].starts_with("CREATE TRIGGER"));
    }

    #[test]
    fn test_split_absorbs_function_attributes() {
        let script = "create function add(a int, b int) returns int as $$\n  select a + b;\n$$ language sql\nIMMUTABLE\nCOST 100;\nSELECT add(1, 2);";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("IMMUTABLE\nCOST 100;"));
        assert_eq!(statements[1], "SELECT add(1, 2);");
    }

    #[test]
    fn test_split_attribute_absorption_stops_at_other_lines() {
        let script = "CREATE FUNCTION f() RETURNS int AS $$ SELECT 1 $$\nLANGUAGE sql\nSTRICT\nSELECT f();";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("LANGUAGE sql\nSTRICT"));
        assert_eq!(statements[1], "SELECT f();");
    }

    #[test]
    fn test_split_single_line_function() {
        let script = "CREATE FUNCTION one() RETURNS int AS 'SELECT 1' LANGUAGE sql;\nSELECT one();\nSELECT 2;";
        assert_eq!(
            split_statements(script),
            vec![
                "CREATE FUNCTION one() RETURNS int AS 'SELECT 1' LANGUAGE sql;",
                "SELECT one();",
                "SELECT 2;"
            ]
        );
    }

    #[test]
    fn test_split_single_line_function_absorbs_attributes() {
        let script = "CREATE OR REPLACE FUNCTION one() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql\nIMMUTABLE;\nSELECT 2;";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("LANGUAGE sql\nIMMUTABLE;"));
        assert_eq!(statements[1], "SELECT 2;");
    }

    #[test]
    fn test_split_across_comment_lines() {
        assert_eq!(
            split_statements("SELECT 1;\n-- c\n\nSELECT 2;"),
            vec!["SELECT 1;", "SELECT 2;"]
        );
    }

    #[test]
    fn test_split_emits_trailing_statement() {
        let script = "SELECT 1;\nSELECT 2";
        assert_eq!(split_statements(script), vec!["SELECT 1;", "SELECT 2"]);
    }

    #[test]
    fn test_split_empty_script() {
        assert!(split_statements("").is_empty());
        assert!(split_statements("-- nothing\n\n").is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_database_is_a_connection_error() {
        let mut connection = ConnectionConfig::embedded_defaults();
        connection.port = 1;
        connection.connection_timeout_ms = 500;
        let runner = ScriptRunner::new(connection);

        let result = runner.run("SELECT 1;", true).await;
        assert!(matches!(result, Err(PersistError::Connection(_))));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_future_is_send() {
        let runner = ScriptRunner::new(ConnectionConfig::embedded_defaults());
        assert_send(&runner.run("SELECT 1;", false));
        assert_send(&runner.run_strict("SELECT 1;"));
    }
}
