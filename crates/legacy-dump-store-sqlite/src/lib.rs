use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path};

use anyhow::{anyhow, Context, Result};
use legacy_dump_core::{
    decode_with, quote_identifier, DecodeOptions, ExecutorError, ScalarValue, StatementExecutor,
    TableSnapshot,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};

pub const SNAPSHOT_FORMAT_VERSION: i64 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";

/// `SQLite`-backed statement executor with replace semantics for row inserts.
pub struct SqliteExecutor {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub table: String,
    pub path: String,
    pub sha256: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotManifest {
    pub format_version: i64,
    pub exported_at: String,
    pub tables: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobFailure {
    pub rowid: i64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobAudit {
    pub table: String,
    pub column: String,
    pub rows_scanned: usize,
    pub null_values: usize,
    pub valid: usize,
    pub invalid: Vec<BlobFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub tables: Vec<String>,
}

/// On-disk shape of one table snapshot. Cells are plain JSON scalars;
/// decimals travel as `{"decimal": "12.50"}` to keep their text.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    table: String,
    ddl: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl SqliteExecutor {
    /// Open a `SQLite` database as a restore target and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// # Errors
    /// Returns an error when `sqlite_master` cannot be queried.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![table],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to check if table exists: {table}"))?;
        Ok(exists == 1)
    }

    /// User tables in creation order.
    ///
    /// # Errors
    /// Returns an error when `sqlite_master` cannot be queried.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY rowid",
            )
            .context("failed to prepare table listing")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tables = Vec::new();
        for name in names {
            tables.push(name?);
        }
        Ok(tables)
    }

    /// Read every row of `table` in rowid order.
    ///
    /// # Errors
    /// Returns an error when the table cannot be read or holds values that have
    /// no scalar snapshot form (binary blobs, non-UTF-8 text).
    pub fn read_rows(&self, table: &str) -> Result<(Vec<String>, Vec<Vec<ScalarValue>>)> {
        let sql = format!("SELECT * FROM {} ORDER BY rowid", quote_identifier(table));
        let mut stmt =
            self.conn.prepare(&sql).with_context(|| format!("failed to read table {table}"))?;
        let columns = stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>();

        let mut rows = stmt.query([])?;
        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(columns.len());
            for (index, column) in columns.iter().enumerate() {
                let cell = scalar_from_sql(row.get_ref(index)?)
                    .with_context(|| format!("unsupported value in {table}.{column}"))?;
                cells.push(cell);
            }
            values.push(cells);
        }

        Ok((columns, values))
    }

    /// Capture one live table as a snapshot: stored DDL plus rows in rowid order.
    ///
    /// # Errors
    /// Returns an error when the table does not exist or cannot be read.
    pub fn export_table(&self, table: &str) -> Result<TableSnapshot> {
        let ddl = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get::<_, String>(0),
            )
            .with_context(|| format!("table does not exist: {table}"))?;
        let (columns, rows) = self.read_rows(table)?;

        Ok(TableSnapshot { table: table.to_string(), ddl, columns, rows })
    }

    /// Export tables as one JSON file each plus a digest manifest, in the
    /// order given.
    ///
    /// # Errors
    /// Returns an error when a table cannot be read or export files cannot be written.
    pub fn export_tables(&self, out_dir: &Path, tables: &[String]) -> Result<SnapshotManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut entries = Vec::with_capacity(tables.len());
        for table in tables {
            let snapshot = self.export_table(table)?;
            let file_name = format!("{table}.json");
            let bytes = serde_json::to_vec_pretty(&snapshot_to_file(&snapshot))
                .context("failed to serialize table snapshot")?;
            let path = out_dir.join(&file_name);
            fs::write(&path, &bytes)
                .with_context(|| format!("failed to write snapshot file {}", path.display()))?;

            info!(table = %table, rows = snapshot.rows.len(), "exported table");
            entries.push(ManifestEntry {
                table: table.clone(),
                path: file_name,
                sha256: sha256_hex(&bytes),
                rows: snapshot.rows.len(),
            });
        }

        let manifest = SnapshotManifest {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at: now_rfc3339()?,
            tables: entries,
        };
        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize snapshot manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write snapshot manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Decode every non-null value of one column and report what fails.
    ///
    /// # Errors
    /// Returns an error when the column cannot be read.
    pub fn audit_blob_column(
        &self,
        table: &str,
        column: &str,
        options: &DecodeOptions,
    ) -> Result<BlobAudit> {
        let sql = format!(
            "SELECT rowid, {} FROM {} ORDER BY rowid",
            quote_identifier(column),
            quote_identifier(table)
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to read column {table}.{column}"))?;
        let mut rows = stmt.query([])?;

        let mut audit = BlobAudit {
            table: table.to_string(),
            column: column.to_string(),
            rows_scanned: 0,
            null_values: 0,
            valid: 0,
            invalid: Vec::new(),
        };

        while let Some(row) = rows.next()? {
            audit.rows_scanned += 1;
            let rowid: i64 = row.get(0)?;
            let bytes = match row.get_ref(1)? {
                ValueRef::Null => {
                    audit.null_values += 1;
                    continue;
                }
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => bytes,
                ValueRef::Integer(_) | ValueRef::Real(_) => {
                    audit.invalid.push(BlobFailure {
                        rowid,
                        error: "value is numeric, not serialized text".to_string(),
                    });
                    continue;
                }
            };

            match decode_with(bytes, options) {
                Ok(_) => audit.valid += 1,
                Err(err) => audit.invalid.push(BlobFailure { rowid, error: err.to_string() }),
            }
        }

        Ok(audit)
    }

    /// Run `PRAGMA quick_check` and list the user tables.
    ///
    /// # Errors
    /// Returns an error when an integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            tables: self.list_tables()?,
        })
    }
}

impl StatementExecutor for SqliteExecutor {
    fn execute_ddl(&mut self, statement: &str) -> Result<(), ExecutorError> {
        debug!(statement, "executing ddl");
        self.conn.execute_batch(statement).map_err(|err| ExecutorError(err.to_string()))
    }

    fn execute_row_insert(
        &mut self,
        table: &str,
        columns: &[String],
        values: &[ScalarValue],
    ) -> Result<(), ExecutorError> {
        let column_list =
            columns.iter().map(|column| quote_identifier(column)).collect::<Vec<_>>().join(", ");
        let placeholders =
            (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({column_list}) VALUES ({placeholders})",
            quote_identifier(table)
        );

        let mut stmt = self.conn.prepare_cached(&sql).map_err(|err| ExecutorError(err.to_string()))?;
        stmt.execute(params_from_iter(values.iter().map(sql_from_scalar)))
            .map(|_| ())
            .map_err(|err| ExecutorError(err.to_string()))
    }

    fn begin_table(&mut self, _table: &str) -> Result<(), ExecutorError> {
        self.conn.execute_batch("BEGIN").map_err(|err| ExecutorError(err.to_string()))
    }

    fn end_table(&mut self, _table: &str) -> Result<(), ExecutorError> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT").map_err(|err| ExecutorError(err.to_string()))
    }

    /// Roll back the table's transaction, which also undoes its drop, then
    /// drop it again outside the transaction so it ends up absent.
    fn abort_table(&mut self, table: &str) -> Result<(), ExecutorError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK").map_err(|err| ExecutorError(err.to_string()))?;
        }
        let drop = self.drop_table_statement(table);
        self.execute_ddl(&drop)
    }
}

/// Load a snapshot directory: verify the manifest, then read each table file
/// in manifest order.
///
/// # Errors
/// Returns an error when the manifest is missing, unsupported, inconsistent
/// with the files on disk, or any table file fails to parse.
pub fn load_snapshot_dir(in_dir: &Path) -> Result<Vec<TableSnapshot>> {
    let manifest = read_manifest(&in_dir.join(MANIFEST_FILE))?;
    validate_manifest(&manifest)?;

    let mut snapshots = Vec::with_capacity(manifest.tables.len());
    for entry in &manifest.tables {
        let path = in_dir.join(&entry.path);
        let bytes = fs::read(&path)
            .with_context(|| format!("manifest references missing file {}", path.display()))?;

        let actual_sha256 = sha256_hex(&bytes);
        if actual_sha256 != entry.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {}: expected {}, got {}",
                entry.path,
                entry.sha256,
                actual_sha256
            ));
        }

        let snapshot = parse_snapshot(&bytes)
            .with_context(|| format!("failed to parse snapshot file {}", path.display()))?;
        if snapshot.table != entry.table {
            return Err(anyhow!(
                "snapshot file {} holds table {}, manifest expects {}",
                entry.path,
                snapshot.table,
                entry.table
            ));
        }
        if snapshot.rows.len() != entry.rows {
            return Err(anyhow!(
                "manifest row count mismatch for {}: expected {}, got {}",
                entry.table,
                entry.rows,
                snapshot.rows.len()
            ));
        }
        snapshots.push(snapshot);
    }

    Ok(snapshots)
}

/// Load one table snapshot file without a manifest.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_snapshot_file(path: &Path) -> Result<TableSnapshot> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read snapshot file {}", path.display()))?;
    parse_snapshot(&bytes).with_context(|| format!("failed to parse snapshot file {}", path.display()))
}

fn parse_snapshot(bytes: &[u8]) -> Result<TableSnapshot> {
    let file: SnapshotFile = serde_json::from_slice(bytes).context("invalid snapshot JSON")?;

    let mut rows = Vec::with_capacity(file.rows.len());
    for (row_index, row) in file.rows.into_iter().enumerate() {
        let mut cells = Vec::with_capacity(row.len());
        for (cell_index, cell) in row.into_iter().enumerate() {
            let scalar = scalar_from_json(cell).with_context(|| {
                format!("row {row_index} cell {cell_index} of table {}", file.table)
            })?;
            cells.push(scalar);
        }
        rows.push(cells);
    }

    Ok(TableSnapshot { table: file.table, ddl: file.ddl, columns: file.columns, rows })
}

fn snapshot_to_file(snapshot: &TableSnapshot) -> SnapshotFile {
    SnapshotFile {
        table: snapshot.table.clone(),
        ddl: snapshot.ddl.clone(),
        columns: snapshot.columns.clone(),
        rows: snapshot
            .rows
            .iter()
            .map(|row| row.iter().map(scalar_to_json).collect())
            .collect(),
    }
}

fn scalar_from_json(value: Value) -> Result<ScalarValue> {
    match value {
        Value::Null => Ok(ScalarValue::Null),
        Value::Bool(flag) => Ok(ScalarValue::Integer(i64::from(flag))),
        Value::Number(number) => Ok(match number.as_i64() {
            Some(integer) => ScalarValue::Integer(integer),
            None => ScalarValue::Decimal(number.to_string()),
        }),
        Value::String(text) => Ok(ScalarValue::Text(text)),
        Value::Object(object) => match (object.len(), object.get("decimal")) {
            (1, Some(Value::String(text))) => Ok(ScalarValue::Decimal(text.clone())),
            _ => Err(anyhow!("objects other than {{\"decimal\": \"...\"}} are not scalar cells")),
        },
        Value::Array(_) => Err(anyhow!("arrays are not scalar cells")),
    }
}

fn scalar_to_json(value: &ScalarValue) -> Value {
    match value {
        ScalarValue::Null => Value::Null,
        ScalarValue::Integer(integer) => Value::from(*integer),
        ScalarValue::Decimal(text) => serde_json::json!({ "decimal": text }),
        ScalarValue::Text(text) => Value::String(text.clone()),
    }
}

fn sql_from_scalar(value: &ScalarValue) -> SqlValue {
    match value {
        ScalarValue::Null => SqlValue::Null,
        ScalarValue::Integer(integer) => SqlValue::Integer(*integer),
        ScalarValue::Decimal(text) | ScalarValue::Text(text) => SqlValue::Text(text.clone()),
    }
}

fn scalar_from_sql(value: ValueRef<'_>) -> Result<ScalarValue> {
    match value {
        ValueRef::Null => Ok(ScalarValue::Null),
        ValueRef::Integer(integer) => Ok(ScalarValue::Integer(integer)),
        ValueRef::Real(real) => Ok(ScalarValue::Decimal(real.to_string())),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .map(|text| ScalarValue::Text(text.to_string()))
            .context("text is not valid UTF-8"),
        ValueRef::Blob(_) => Err(anyhow!("binary blobs have no snapshot form")),
    }
}

fn read_manifest(path: &Path) -> Result<SnapshotManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn validate_manifest(manifest: &SnapshotManifest) -> Result<()> {
    if manifest.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(anyhow!(
            "unsupported snapshot format version {}; expected {SNAPSHOT_FORMAT_VERSION}",
            manifest.format_version
        ));
    }

    let mut tables = BTreeSet::new();
    for entry in &manifest.tables {
        if !tables.insert(entry.table.as_str()) {
            return Err(anyhow!("manifest contains duplicate table entry: {}", entry.table));
        }
        let relative = Path::new(&entry.path);
        if entry.path.is_empty()
            || !relative.components().all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(anyhow!(
                "manifest path MUST be relative to the snapshot directory: {}",
                entry.path
            ));
        }
    }

    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
