use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::codec::{self, DecodeOptions, DEFAULT_MAX_DEPTH};

/// One literal cell of a seed row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScalarValue {
    Null,
    Integer(i64),
    /// Decimal literal, kept as text so scale and trailing zeros survive.
    Decimal(String),
    Text(String),
}

impl ScalarValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
        }
    }
}

/// Drop/create/seed definition of one table as captured in a dump.
///
/// `ddl` is passed to the executor verbatim. Each row is positional against
/// `columns`. Columns such as `shopid` or `parent_id` are plain values here;
/// the dump never declares them as constraints and nothing enforces them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSnapshot {
    pub table: String,
    pub ddl: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl TableSnapshot {
    /// Check the parts of a snapshot that must hold before any statement runs.
    ///
    /// # Errors
    /// Returns [`RestoreError::Snapshot`] for an empty table name, an empty
    /// column list, or duplicate column names.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let invalid = |reason: String| RestoreError::Snapshot { table: self.table.clone(), reason };

        if self.table.trim().is_empty() {
            return Err(invalid("table name MUST be non-empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(invalid("column list MUST be non-empty".to_string()));
        }

        let mut seen = BTreeSet::new();
        for column in &self.columns {
            if column.trim().is_empty() {
                return Err(invalid("column names MUST be non-empty".to_string()));
            }
            if !seen.insert(column.as_str()) {
                return Err(invalid(format!("duplicate column `{column}`")));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct ExecutorError(pub String);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RestoreError {
    #[error("invalid snapshot for table `{table}`: {reason}")]
    Snapshot { table: String, reason: String },
    #[error("ddl failed for table `{table}`: {message}")]
    Ddl { table: String, message: String },
    #[error("row {row_index} of table `{table}` failed: {message}")]
    Row { table: String, row_index: usize, message: String },
    #[error("transaction boundary failed for table `{table}`: {message}")]
    Transaction { table: String, message: String },
}

impl RestoreError {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Snapshot { table, .. }
            | Self::Ddl { table, .. }
            | Self::Row { table, .. }
            | Self::Transaction { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("invalid restore configuration: {0}")]
    Invalid(String),
}

/// The backing store the engine replays statements into.
pub trait StatementExecutor {
    /// Run one schema statement (drop or create).
    ///
    /// # Errors
    /// Returns [`ExecutorError`] when the store rejects the statement.
    fn execute_ddl(&mut self, statement: &str) -> Result<(), ExecutorError>;

    /// Insert one row, replacing any existing row with the same primary key.
    ///
    /// # Errors
    /// Returns [`ExecutorError`] when the store rejects the row.
    fn execute_row_insert(
        &mut self,
        table: &str,
        columns: &[String],
        values: &[ScalarValue],
    ) -> Result<(), ExecutorError>;

    fn drop_table_statement(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_identifier(table))
    }

    /// Called before the drop statement of each table.
    ///
    /// # Errors
    /// Returns [`ExecutorError`] when the store cannot open a unit of work.
    fn begin_table(&mut self, _table: &str) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Called once per table after its last statement succeeded.
    ///
    /// # Errors
    /// Returns [`ExecutorError`] when the store cannot close the unit of work.
    fn end_table(&mut self, _table: &str) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Called instead of [`end_table`](Self::end_table) after a fatal error
    /// for the table. The table MUST end up absent, never partly seeded.
    ///
    /// # Errors
    /// Returns [`ExecutorError`] when the partial work cannot be discarded.
    fn abort_table(&mut self, table: &str) -> Result<(), ExecutorError> {
        let drop = self.drop_table_statement(table);
        self.execute_ddl(&drop)
    }
}

#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RowFailurePolicy {
    #[default]
    Skip,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreConfig {
    pub max_depth: usize,
    pub allow_trailing_data: bool,
    pub strict_array_counts: bool,
    pub row_failure_policy: RowFailurePolicy,
    /// Write decodable blobs in canonical encoding instead of their source text.
    pub normalize_blobs: bool,
    /// Columns validated as blobs whatever their content looks like, by table.
    pub blob_columns: BTreeMap<String, Vec<String>>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            allow_trailing_data: false,
            strict_array_counts: false,
            row_failure_policy: RowFailurePolicy::Skip,
            normalize_blobs: false,
            blob_columns: BTreeMap::new(),
        }
    }
}

impl RestoreConfig {
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when a field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth MUST be >= 1".to_string()));
        }
        for (table, columns) in &self.blob_columns {
            if columns.iter().any(|column| column.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "blob_columns.{table} MUST NOT contain empty column names"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            max_depth: self.max_depth,
            allow_trailing_data: self.allow_trailing_data,
            strict_array_counts: self.strict_array_counts,
        }
    }

    #[must_use]
    pub fn is_declared_blob(&self, table: &str, column: &str) -> bool {
        self.blob_columns.get(table).is_some_and(|columns| columns.iter().any(|name| name == column))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    BlobDecode,
    RowSkipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowWarning {
    pub table: String,
    pub row_index: usize,
    pub column: Option<String>,
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub rows_total: usize,
    pub rows_applied: usize,
    pub rows_skipped: usize,
    pub blobs_checked: usize,
    pub blobs_invalid: usize,
    pub blobs_normalized: usize,
    pub warnings: Vec<RowWarning>,
}

impl TableReport {
    fn new(table: &str, rows_total: usize) -> Self {
        Self {
            table: table.to_string(),
            rows_total,
            rows_applied: 0,
            rows_skipped: 0,
            blobs_checked: 0,
            blobs_invalid: 0,
            blobs_normalized: 0,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Restored(TableReport),
    Failed { table: String, error: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreSummary {
    pub tables: Vec<TableOutcome>,
    pub cancelled: bool,
    pub not_started: Vec<String>,
}

impl RestoreSummary {
    #[must_use]
    pub fn failed_tables(&self) -> usize {
        self.tables.iter().filter(|outcome| matches!(outcome, TableOutcome::Failed { .. })).count()
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.tables
            .iter()
            .map(|outcome| match outcome {
                TableOutcome::Restored(report) => report.warnings.len(),
                TableOutcome::Failed { .. } => 0,
            })
            .sum()
    }
}

pub struct RestoreEngine<E> {
    executor: E,
    config: RestoreConfig,
}

impl<E: StatementExecutor> RestoreEngine<E> {
    pub fn new(executor: E, config: RestoreConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn into_executor(self) -> E {
        self.executor
    }

    /// Drop, recreate and seed one table.
    ///
    /// Blob decode failures and (under [`RowFailurePolicy::Skip`]) rejected
    /// rows are reported in the returned [`TableReport`], not as errors.
    ///
    /// # Errors
    /// Returns [`RestoreError`] when the snapshot is invalid, the drop or
    /// create statement fails, a row fails under [`RowFailurePolicy::Fail`],
    /// or the executor cannot open or close the table's unit of work. In every
    /// case after `begin_table` the executor's `abort_table` runs, so the table
    /// is left absent.
    pub fn apply(&mut self, snapshot: TableSnapshot) -> Result<TableReport, RestoreError> {
        snapshot.validate()?;
        let TableSnapshot { table, ddl, columns, rows } = snapshot;
        info!(table = %table, rows = rows.len(), "restoring table");

        self.executor.begin_table(&table).map_err(|err| RestoreError::Transaction {
            table: table.clone(),
            message: format!("begin failed: {err}"),
        })?;
        let result = self.apply_statements(&table, &ddl, &columns, rows).and_then(|report| {
            self.executor.end_table(&table).map(|()| report).map_err(|err| {
                RestoreError::Transaction { table: table.clone(), message: format!("end failed: {err}") }
            })
        });

        match result {
            Ok(report) => {
                info!(
                    table = %table,
                    applied = report.rows_applied,
                    skipped = report.rows_skipped,
                    blobs_checked = report.blobs_checked,
                    blobs_invalid = report.blobs_invalid,
                    "table restored"
                );
                Ok(report)
            }
            Err(err) => {
                error!(table = %table, error = %err, "table restore failed");
                if let Err(abort_err) = self.executor.abort_table(&table) {
                    error!(table = %table, error = %abort_err, "failed to discard partial table");
                }
                Err(err)
            }
        }
    }

    /// Apply snapshots in order, checking `cancel` before each table.
    ///
    /// A table that fails is recorded and the run moves on; once `cancel` is
    /// observed, no further table is started.
    pub fn apply_all<I>(&mut self, snapshots: I, cancel: &AtomicBool) -> RestoreSummary
    where
        I: IntoIterator<Item = TableSnapshot>,
    {
        let mut summary = RestoreSummary::default();

        for snapshot in snapshots {
            if summary.cancelled || cancel.load(Ordering::SeqCst) {
                if !summary.cancelled {
                    info!(table = %snapshot.table, "restore cancelled before table");
                }
                summary.cancelled = true;
                summary.not_started.push(snapshot.table);
                continue;
            }

            let outcome = match self.apply(snapshot) {
                Ok(report) => TableOutcome::Restored(report),
                Err(err) => {
                    TableOutcome::Failed { table: err.table().to_string(), error: err.to_string() }
                }
            };
            summary.tables.push(outcome);
        }

        summary
    }

    fn apply_statements(
        &mut self,
        table: &str,
        ddl: &str,
        columns: &[String],
        rows: Vec<Vec<ScalarValue>>,
    ) -> Result<TableReport, RestoreError> {
        let drop = self.executor.drop_table_statement(table);
        debug!(table, statement = %drop, "executing drop");
        self.executor.execute_ddl(&drop).map_err(|err| RestoreError::Ddl {
            table: table.to_string(),
            message: format!("drop failed: {err}"),
        })?;

        if ddl.trim().is_empty() {
            return Err(RestoreError::Ddl {
                table: table.to_string(),
                message: "creation definition is empty".to_string(),
            });
        }
        debug!(table, "executing creation definition");
        self.executor.execute_ddl(ddl).map_err(|err| RestoreError::Ddl {
            table: table.to_string(),
            message: format!("create failed: {err}"),
        })?;

        let mut report = TableReport::new(table, rows.len());
        for (row_index, mut row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                let message = format!(
                    "row has {} values but the table declares {} columns",
                    row.len(),
                    columns.len()
                );
                self.reject_row(&mut report, row_index, message)?;
                continue;
            }

            self.check_blobs(&mut report, row_index, columns, &mut row);

            if let Err(err) = self.executor.execute_row_insert(table, columns, &row) {
                self.reject_row(&mut report, row_index, err.to_string())?;
                continue;
            }
            report.rows_applied += 1;
        }

        Ok(report)
    }

    fn reject_row(
        &self,
        report: &mut TableReport,
        row_index: usize,
        message: String,
    ) -> Result<(), RestoreError> {
        match self.config.row_failure_policy {
            RowFailurePolicy::Fail => {
                Err(RestoreError::Row { table: report.table.clone(), row_index, message })
            }
            RowFailurePolicy::Skip => {
                warn!(table = %report.table, row_index, error = %message, "row skipped");
                report.rows_skipped += 1;
                report.warnings.push(RowWarning {
                    table: report.table.clone(),
                    row_index,
                    column: None,
                    kind: WarningKind::RowSkipped,
                    message,
                });
                Ok(())
            }
        }
    }

    /// Decode every blob-like text cell; failures become warnings and the
    /// cell is written unchanged.
    fn check_blobs(
        &self,
        report: &mut TableReport,
        row_index: usize,
        columns: &[String],
        row: &mut [ScalarValue],
    ) {
        let options = self.config.decode_options();

        for (column, cell) in columns.iter().zip(row.iter_mut()) {
            let ScalarValue::Text(text) = cell else {
                continue;
            };
            if !self.config.is_declared_blob(&report.table, column)
                && !codec::looks_serialized(text.as_bytes())
            {
                continue;
            }

            report.blobs_checked += 1;
            match codec::decode_with(text.as_bytes(), &options) {
                Ok(value) => {
                    if !self.config.normalize_blobs {
                        continue;
                    }
                    let normalized = value.canonicalize().encode();
                    if normalized != text.as_bytes() {
                        if let Ok(normalized) = String::from_utf8(normalized) {
                            *text = normalized;
                            report.blobs_normalized += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        table = %report.table,
                        row_index,
                        column = %column,
                        error = %err,
                        "blob failed to decode; writing original text"
                    );
                    report.blobs_invalid += 1;
                    report.warnings.push(RowWarning {
                        table: report.table.clone(),
                        row_index,
                        column: Some(column.clone()),
                        kind: WarningKind::BlobDecode,
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Begin(String),
        Ddl(String),
        Insert(String, Vec<ScalarValue>),
        End(String),
    }

    #[derive(Debug, Default)]
    struct RecordingExecutor {
        events: Vec<Event>,
        fail_ddl_containing: Option<&'static str>,
        reject_first_value: Option<ScalarValue>,
        cancel_on_end: Option<Arc<AtomicBool>>,
    }

    impl StatementExecutor for RecordingExecutor {
        fn execute_ddl(&mut self, statement: &str) -> Result<(), ExecutorError> {
            if let Some(needle) = self.fail_ddl_containing {
                if statement.contains(needle) {
                    return Err(ExecutorError(format!("syntax error near `{needle}`")));
                }
            }
            self.events.push(Event::Ddl(statement.to_string()));
            Ok(())
        }

        fn execute_row_insert(
            &mut self,
            table: &str,
            _columns: &[String],
            values: &[ScalarValue],
        ) -> Result<(), ExecutorError> {
            if self.reject_first_value.is_some() && values.first() == self.reject_first_value.as_ref()
            {
                return Err(ExecutorError("constraint violation".to_string()));
            }
            self.events.push(Event::Insert(table.to_string(), values.to_vec()));
            Ok(())
        }

        fn begin_table(&mut self, table: &str) -> Result<(), ExecutorError> {
            self.events.push(Event::Begin(table.to_string()));
            Ok(())
        }

        fn end_table(&mut self, table: &str) -> Result<(), ExecutorError> {
            self.events.push(Event::End(table.to_string()));
            if let Some(cancel) = &self.cancel_on_end {
                cancel.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn text(value: &str) -> ScalarValue {
        ScalarValue::Text(value.to_string())
    }

    fn shop_snapshot(rows: Vec<Vec<ScalarValue>>) -> TableSnapshot {
        TableSnapshot {
            table: "ims_shop".to_string(),
            ddl: "CREATE TABLE ims_shop (id INTEGER PRIMARY KEY, name TEXT, sendset TEXT)"
                .to_string(),
            columns: vec!["id".to_string(), "name".to_string(), "sendset".to_string()],
            rows,
        }
    }

    fn engine(config: RestoreConfig) -> RestoreEngine<RecordingExecutor> {
        RestoreEngine::new(RecordingExecutor::default(), config)
    }

    #[test]
    fn apply_drops_then_creates_then_inserts_in_source_order() {
        let mut engine = engine(RestoreConfig::default());
        let rows = vec![
            vec![ScalarValue::Integer(2), text("b"), ScalarValue::Null],
            vec![ScalarValue::Integer(1), text("a"), text("a:1:{s:6:\"pstype\";i:1;}")],
        ];

        let report = engine
            .apply(shop_snapshot(rows.clone()))
            .unwrap_or_else(|err| panic!("restore failed: {err}"));

        assert_eq!(
            engine.executor().events,
            vec![
                Event::Begin("ims_shop".to_string()),
                Event::Ddl("DROP TABLE IF EXISTS \"ims_shop\"".to_string()),
                Event::Ddl(
                    "CREATE TABLE ims_shop (id INTEGER PRIMARY KEY, name TEXT, sendset TEXT)"
                        .to_string()
                ),
                Event::Insert("ims_shop".to_string(), rows[0].clone()),
                Event::Insert("ims_shop".to_string(), rows[1].clone()),
                Event::End("ims_shop".to_string()),
            ]
        );
        assert_eq!(report.rows_applied, 2);
        assert_eq!(report.blobs_checked, 1);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn undecodable_blob_warns_with_context_and_keeps_original_text() {
        let mut engine = engine(RestoreConfig::default());
        let broken = "a:1:{s:9:\"pstype\";i:1;}";

        let report = engine
            .apply(shop_snapshot(vec![vec![ScalarValue::Integer(7), text("x"), text(broken)]]))
            .unwrap_or_else(|err| panic!("restore failed: {err}"));

        assert_eq!(report.rows_applied, 1);
        assert_eq!(report.blobs_invalid, 1);
        assert_eq!(report.warnings.len(), 1);
        let warning = &report.warnings[0];
        assert_eq!(warning.table, "ims_shop");
        assert_eq!(warning.row_index, 0);
        assert_eq!(warning.column.as_deref(), Some("sendset"));
        assert_eq!(warning.kind, WarningKind::BlobDecode);
        assert!(warning.message.contains("malformed length"), "{}", warning.message);

        assert!(engine.executor().events.contains(&Event::Insert(
            "ims_shop".to_string(),
            vec![ScalarValue::Integer(7), text("x"), text(broken)]
        )));
    }

    #[test]
    fn blob_with_trailing_newline_is_reported_invalid() {
        let mut engine = engine(RestoreConfig::default());
        let padded = "a:1:{s:6:\"pstype\";i:1;}\n";

        let report = engine
            .apply(shop_snapshot(vec![vec![ScalarValue::Integer(1), text("x"), text(padded)]]))
            .unwrap_or_else(|err| panic!("restore failed: {err}"));

        assert_eq!(report.blobs_checked, 1);
        assert_eq!(report.blobs_invalid, 1);
        assert!(report.warnings[0].message.contains("trailing"), "{}", report.warnings[0].message);
        assert!(engine.executor().events.contains(&Event::Insert(
            "ims_shop".to_string(),
            vec![ScalarValue::Integer(1), text("x"), text(padded)]
        )));
    }

    #[test]
    fn declared_blob_columns_are_checked_even_without_blob_shape() {
        let mut config = RestoreConfig::default();
        config.blob_columns.insert("ims_shop".to_string(), vec!["sendset".to_string()]);
        let mut engine = engine(config);

        let report = engine
            .apply(shop_snapshot(vec![vec![ScalarValue::Integer(1), text("x"), text("not a blob")]]))
            .unwrap_or_else(|err| panic!("restore failed: {err}"));

        assert_eq!(report.blobs_checked, 1);
        assert_eq!(report.blobs_invalid, 1);
        assert_eq!(report.rows_applied, 1);
    }

    #[test]
    fn normalization_rewrites_only_when_requested() {
        let source = "a:2:{s:5:\"price\";d:5.50;s:4:\"tags\";a:0:{}}";
        let row = || vec![vec![ScalarValue::Integer(1), text("x"), text(source)]];

        let mut plain = engine(RestoreConfig::default());
        let report = plain.apply(shop_snapshot(row())).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(report.blobs_normalized, 0);
        assert!(plain.executor().events.iter().any(|event| matches!(
            event,
            Event::Insert(_, values) if values[2] == text(source)
        )));

        let config = RestoreConfig { normalize_blobs: true, ..RestoreConfig::default() };
        let mut normalizing = engine(config);
        let report = normalizing.apply(shop_snapshot(row())).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(report.blobs_normalized, 1);
        assert!(normalizing.executor().events.iter().any(|event| matches!(
            event,
            Event::Insert(_, values)
                if values[2] == text("a:2:{s:5:\"price\";d:5.5;s:4:\"tags\";a:0:{}}")
        )));
    }

    #[test]
    fn malformed_row_is_skipped_by_default() {
        let mut engine = engine(RestoreConfig::default());
        let report = engine
            .apply(shop_snapshot(vec![
                vec![ScalarValue::Integer(1), text("short")],
                vec![ScalarValue::Integer(2), text("ok"), ScalarValue::Null],
            ]))
            .unwrap_or_else(|err| panic!("restore failed: {err}"));

        assert_eq!(report.rows_total, 2);
        assert_eq!(report.rows_applied, 1);
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(report.warnings[0].kind, WarningKind::RowSkipped);
        assert_eq!(report.warnings[0].row_index, 0);
    }

    #[test]
    fn malformed_row_is_fatal_under_fail_policy() {
        let config =
            RestoreConfig { row_failure_policy: RowFailurePolicy::Fail, ..RestoreConfig::default() };
        let mut engine = engine(config);
        engine.executor_mut().reject_first_value = Some(ScalarValue::Integer(2));

        let err = match engine.apply(shop_snapshot(vec![
            vec![ScalarValue::Integer(1), text("a"), ScalarValue::Null],
            vec![ScalarValue::Integer(2), text("b"), ScalarValue::Null],
            vec![ScalarValue::Integer(3), text("c"), ScalarValue::Null],
        ])) {
            Ok(report) => panic!("expected row failure, got {report:?}"),
            Err(err) => err,
        };

        assert_eq!(
            err,
            RestoreError::Row {
                table: "ims_shop".to_string(),
                row_index: 1,
                message: "constraint violation".to_string(),
            }
        );
        let events = &engine.executor().events;
        assert_eq!(events.last(), Some(&Event::Ddl("DROP TABLE IF EXISTS \"ims_shop\"".to_string())));
        assert!(!events.contains(&Event::End("ims_shop".to_string())));
    }

    #[test]
    fn failing_creation_definition_is_fatal_for_that_table_only() {
        let mut engine = engine(RestoreConfig::default());
        engine.executor_mut().fail_ddl_containing = Some("ims_broken (");

        let broken = TableSnapshot {
            table: "ims_broken".to_string(),
            ddl: "CREATE TABLE ims_broken (".to_string(),
            columns: vec!["id".to_string()],
            rows: vec![vec![ScalarValue::Integer(1)]],
        };
        let summary = engine.apply_all(
            vec![broken, shop_snapshot(vec![vec![ScalarValue::Integer(1), text("a"), ScalarValue::Null]])],
            &AtomicBool::new(false),
        );

        assert_eq!(summary.failed_tables(), 1);
        assert!(matches!(
            &summary.tables[0],
            TableOutcome::Failed { table, error } if table == "ims_broken" && error.contains("create failed")
        ));
        assert!(matches!(&summary.tables[1], TableOutcome::Restored(report) if report.rows_applied == 1));
        assert!(!engine
            .executor()
            .events
            .iter()
            .any(|event| matches!(event, Event::Insert(table, _) if table == "ims_broken")));
    }

    #[test]
    fn empty_creation_definition_is_a_ddl_error() {
        let mut engine = engine(RestoreConfig::default());
        let mut snapshot = shop_snapshot(Vec::new());
        snapshot.ddl = "  ".to_string();

        let result = engine.apply(snapshot);
        assert!(matches!(result, Err(RestoreError::Ddl { ref message, .. }) if message.contains("empty")));
    }

    #[test]
    fn invalid_snapshot_runs_no_statements() {
        let mut engine = engine(RestoreConfig::default());
        let mut snapshot = shop_snapshot(Vec::new());
        snapshot.columns = vec!["id".to_string(), "id".to_string()];

        let result = engine.apply(snapshot);
        assert!(matches!(result, Err(RestoreError::Snapshot { ref reason, .. }) if reason.contains("duplicate")));
        assert!(engine.executor().events.is_empty());
    }

    #[test]
    fn cancellation_is_honoured_between_tables() {
        let mut engine = engine(RestoreConfig::default());
        let cancel = AtomicBool::new(true);
        let summary = engine.apply_all(vec![shop_snapshot(Vec::new())], &cancel);

        assert!(summary.cancelled);
        assert!(summary.tables.is_empty());
        assert_eq!(summary.not_started, vec!["ims_shop".to_string()]);
        assert!(engine.executor().events.is_empty());
    }

    #[test]
    fn cancellation_raised_mid_run_lets_current_table_finish() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut engine = engine(RestoreConfig::default());
        engine.executor_mut().cancel_on_end = Some(Arc::clone(&cancel));

        let mut nav = shop_snapshot(vec![vec![ScalarValue::Integer(9), text("n"), ScalarValue::Null]]);
        nav.table = "ims_nav".to_string();
        let shop = shop_snapshot(vec![vec![ScalarValue::Integer(1), text("a"), ScalarValue::Null]]);
        let summary = engine.apply_all(vec![shop, nav], &cancel);

        assert!(summary.cancelled);
        assert_eq!(summary.tables.len(), 1);
        assert!(matches!(
            &summary.tables[0],
            TableOutcome::Restored(report) if report.table == "ims_shop" && report.rows_applied == 1
        ));
        assert_eq!(summary.not_started, vec!["ims_nav".to_string()]);

        let events = &engine.executor().events;
        assert_eq!(events.len(), 5);
        assert_eq!(events.last(), Some(&Event::End("ims_shop".to_string())));
        assert!(!events.iter().any(|event| matches!(
            event,
            Event::Begin(table) | Event::End(table) | Event::Insert(table, _) if table == "ims_nav"
        )));
    }

    #[test]
    fn config_deserializes_with_defaults_and_rejects_zero_depth() {
        let config: RestoreConfig = serde_json::from_str(
            r#"{"row_failure_policy":"fail","blob_columns":{"ims_shop":["sendset"]}}"#,
        )
        .unwrap_or_else(|err| panic!("config should parse: {err}"));
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(config.row_failure_policy, RowFailurePolicy::Fail);
        assert!(config.is_declared_blob("ims_shop", "sendset"));
        assert!(!config.is_declared_blob("ims_shop", "name"));
        assert!(config.validate().is_ok());

        let zero = RestoreConfig { max_depth: 0, ..RestoreConfig::default() };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn identifiers_are_quoted_for_drop() {
        assert_eq!(quote_identifier("ims_shop"), "\"ims_shop\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
