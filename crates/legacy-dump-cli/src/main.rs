use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use legacy_dump_core::{
    decode_prefix, decode_with, encode, CodecError, RestoreConfig, RestoreEngine, RowFailurePolicy,
    SerializedValue,
};
use legacy_dump_store_sqlite::{load_snapshot_dir, SqliteExecutor};
use serde_json::{Map, Number, Value};
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "LDR_LOG";

#[derive(Debug, Parser)]
#[command(name = "ldr")]
#[command(about = "Legacy dump restore CLI")]
struct Cli {
    #[arg(long, default_value = "./restore.sqlite3")]
    db: PathBuf,

    /// YAML restore configuration. Command flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Codec {
        #[command(subcommand)]
        command: CodecCommand,
    },
    /// Restore every selected table from a snapshot directory. The run is not
    /// interruptible between tables; each selected table is attempted.
    Restore(RestoreArgs),
    Export(ExportArgs),
    Audit(AuditArgs),
    IntegrityCheck,
}

#[derive(Debug, Subcommand)]
enum CodecCommand {
    /// Decode one serialized value and print it as JSON.
    Decode(CodecInputArgs),
    /// Encode a JSON document as a serialized value.
    Encode(EncodeArgs),
    /// Check that a serialized value decodes and re-encodes byte for byte.
    Verify(CodecInputArgs),
}

#[derive(Debug, Args)]
struct CodecInputArgs {
    #[arg(long, conflicts_with = "input", required_unless_present = "input")]
    text: Option<String>,
    #[arg(long = "in")]
    input: Option<PathBuf>,
    #[command(flatten)]
    decode: DecodeFlags,
}

#[derive(Debug, Args)]
struct EncodeArgs {
    #[arg(long, conflicts_with = "input", required_unless_present = "input")]
    json: Option<String>,
    #[arg(long = "in")]
    input: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DecodeFlags {
    #[arg(long)]
    max_depth: Option<usize>,
    #[arg(long, default_value_t = false)]
    allow_trailing_data: bool,
    #[arg(long, default_value_t = false)]
    strict_array_counts: bool,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Restore only these tables, in snapshot order.
    #[arg(long = "table")]
    tables: Vec<String>,
    #[arg(long, default_value_t = false)]
    fail_on_row_error: bool,
    #[arg(long, default_value_t = false)]
    normalize_blobs: bool,
    #[command(flatten)]
    decode: DecodeFlags,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: PathBuf,
    /// Export only these tables. Defaults to every user table.
    #[arg(long = "table")]
    tables: Vec<String>,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    column: String,
    #[command(flatten)]
    decode: DecodeFlags,
}

impl DecodeFlags {
    fn apply(&self, config: &mut RestoreConfig) {
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if self.allow_trailing_data {
            config.allow_trailing_data = true;
        }
        if self.strict_array_counts {
            config.strict_array_counts = true;
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Codec { command } => run_codec(command, config),
        Command::Restore(args) => run_restore(&args, &cli.db, config),
        Command::Export(args) => run_export(&args, &cli.db),
        Command::Audit(args) => run_audit(&args, &cli.db, config),
        Command::IntegrityCheck => run_integrity_check(&cli.db),
    }
}

fn load_config(path: Option<&Path>) -> Result<RestoreConfig> {
    let Some(path) = path else {
        return Ok(RestoreConfig::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: RestoreConfig = serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn run_codec(command: CodecCommand, config: RestoreConfig) -> Result<()> {
    match command {
        CodecCommand::Decode(args) => run_codec_decode(&args, config),
        CodecCommand::Encode(args) => run_codec_encode(&args),
        CodecCommand::Verify(args) => run_codec_verify(&args, config),
    }
}

fn run_codec_decode(args: &CodecInputArgs, mut config: RestoreConfig) -> Result<()> {
    args.decode.apply(&mut config);
    config.validate()?;
    let options = config.decode_options();
    let bytes = read_codec_input(args)?;

    let (value, consumed) = decode_prefix(&bytes, &options)?;
    let trailing = bytes.len() - consumed;
    if trailing > 0 && !options.allow_trailing_data {
        return Err(CodecError::TrailingData { offset: consumed, remaining: trailing }.into());
    }

    emit_json(serde_json::json!({
        "value": value_to_json(&value),
        "consumed": consumed,
        "trailing": trailing,
        "canonical": encode(&value) == bytes[..consumed]
    }))
}

fn run_codec_encode(args: &EncodeArgs) -> Result<()> {
    let body = match (&args.json, &args.input) {
        (Some(json), _) => json.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read JSON input {}", path.display()))?,
        (None, None) => return Err(anyhow!("either --json or --in is required")),
    };
    let document: Value = serde_json::from_str(&body).context("input is not valid JSON")?;
    let value = json_to_value(&document)?;
    let encoded =
        String::from_utf8(encode(&value)).context("encoded value is not valid UTF-8")?;

    emit_json(serde_json::json!({
        "encoded": encoded,
        "length": encoded.len()
    }))
}

fn run_codec_verify(args: &CodecInputArgs, mut config: RestoreConfig) -> Result<()> {
    args.decode.apply(&mut config);
    config.validate()?;
    let bytes = read_codec_input(args)?;

    match decode_with(&bytes, &config.decode_options()) {
        Ok(value) => {
            let reencoded = encode(&value);
            emit_json(serde_json::json!({
                "valid": true,
                "round_trip": reencoded == bytes,
                "length": bytes.len(),
                "reencoded_length": reencoded.len()
            }))
        }
        Err(err) => emit_json(serde_json::json!({
            "valid": false,
            "error_kind": codec_error_kind(&err),
            "error": err.to_string(),
            "length": bytes.len()
        })),
    }
}

fn run_restore(args: &RestoreArgs, db: &Path, mut config: RestoreConfig) -> Result<()> {
    args.decode.apply(&mut config);
    if args.fail_on_row_error {
        config.row_failure_policy = RowFailurePolicy::Fail;
    }
    if args.normalize_blobs {
        config.normalize_blobs = true;
    }
    config.validate()?;

    let run_id = Ulid::new();
    let started_at = now_rfc3339()?;
    let mut snapshots = load_snapshot_dir(&args.input)?;
    if !args.tables.is_empty() {
        if let Some(missing) = args
            .tables
            .iter()
            .find(|table| !snapshots.iter().any(|snapshot| &snapshot.table == *table))
        {
            return Err(anyhow!(
                "table {missing} is not in snapshot {}",
                args.input.display()
            ));
        }
        snapshots.retain(|snapshot| args.tables.contains(&snapshot.table));
    }

    info!(run_id = %run_id, tables = snapshots.len(), db = %db.display(), "starting restore");
    let executor = SqliteExecutor::open(db)?;
    let mut engine = RestoreEngine::new(executor, config);
    // ldr installs no interrupt handler, so this flag is never raised
    let never_cancelled = AtomicBool::new(false);
    let summary = engine.apply_all(snapshots, &never_cancelled);
    let failed = summary.failed_tables();

    emit_json(serde_json::json!({
        "run_id": run_id.to_string(),
        "started_at": started_at,
        "finished_at": now_rfc3339()?,
        "db": db.display().to_string(),
        "source": args.input.display().to_string(),
        "tables_restored": summary.tables.len() - failed,
        "tables_failed": failed,
        "warnings": summary.warning_count(),
        "summary": serde_json::to_value(&summary)?
    }))?;

    if failed > 0 {
        return Err(anyhow!("{failed} table(s) failed to restore"));
    }
    Ok(())
}

fn run_export(args: &ExportArgs, db: &Path) -> Result<()> {
    let executor = SqliteExecutor::open(db)?;
    let tables = if args.tables.is_empty() { executor.list_tables()? } else { args.tables.clone() };
    let manifest = executor.export_tables(&args.out, &tables)?;

    emit_json(serde_json::json!({
        "out": args.out.display().to_string(),
        "manifest": serde_json::to_value(&manifest)?
    }))
}

fn run_audit(args: &AuditArgs, db: &Path, mut config: RestoreConfig) -> Result<()> {
    args.decode.apply(&mut config);
    config.validate()?;
    let executor = SqliteExecutor::open(db)?;
    if !executor.table_exists(&args.table)? {
        return Err(anyhow!("table does not exist: {}", args.table));
    }

    let audit = executor.audit_blob_column(&args.table, &args.column, &config.decode_options())?;
    emit_json(serde_json::to_value(&audit)?)
}

fn run_integrity_check(db: &Path) -> Result<()> {
    let executor = SqliteExecutor::open(db)?;
    let report = executor.integrity_check()?;
    emit_json(serde_json::to_value(&report)?)
}

fn read_codec_input(args: &CodecInputArgs) -> Result<Vec<u8>> {
    match (&args.text, &args.input) {
        (Some(text), _) => Ok(text.as_bytes().to_vec()),
        (None, Some(path)) => {
            let mut bytes = fs::read(path)
                .with_context(|| format!("failed to read codec input {}", path.display()))?;
            // a complete value ends in `;` or `}`, so a final line break is never payload
            while matches!(bytes.last(), Some(b'\n' | b'\r')) {
                bytes.pop();
            }
            Ok(bytes)
        }
        (None, None) => Err(anyhow!("either --text or --in is required")),
    }
}

fn codec_error_kind(err: &CodecError) -> &'static str {
    match err {
        CodecError::UnexpectedEof { .. } => "unexpected_eof",
        CodecError::MalformedLength { .. } => "malformed_length",
        CodecError::UnknownTag { .. } => "unknown_tag",
        CodecError::UnexpectedByte { .. } => "unexpected_byte",
        CodecError::InvalidNumber { .. } => "invalid_number",
        CodecError::InvalidKey { .. } => "invalid_key",
        CodecError::TrailingData { .. } => "trailing_data",
        CodecError::DepthExceeded { .. } => "depth_exceeded",
    }
}

/// Render a decoded value as JSON for inspection.
///
/// Arrays become objects keyed by the key's text, so a repeated key keeps
/// only its last value. Byte strings that are not UTF-8 render as
/// `{"hex": "..."}`.
fn value_to_json(value: &SerializedValue) -> Value {
    match value {
        SerializedValue::Null => Value::Null,
        SerializedValue::Bool(flag) => Value::Bool(*flag),
        SerializedValue::Int(number) => Value::from(*number),
        SerializedValue::Float(float) => Number::from_f64(float.value())
            .map_or_else(|| Value::String(float.render().into_owned()), Value::Number),
        SerializedValue::Str(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => serde_json::json!({ "hex": hex::encode(bytes) }),
        },
        SerializedValue::Array(pairs) => {
            let mut object = Map::with_capacity(pairs.len());
            for (key, item) in pairs {
                object.insert(key_text(key), value_to_json(item));
            }
            Value::Object(object)
        }
    }
}

fn key_text(key: &SerializedValue) -> String {
    match key {
        SerializedValue::Int(number) => number.to_string(),
        SerializedValue::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => String::from_utf8_lossy(&encode(other)).into_owned(),
    }
}

/// Build a value from JSON. Object keys that spell a canonical integer become
/// integer keys; JSON arrays become arrays keyed `0..n`.
fn json_to_value(value: &Value) -> Result<SerializedValue> {
    Ok(match value {
        Value::Null => SerializedValue::Null,
        Value::Bool(flag) => SerializedValue::Bool(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SerializedValue::Int(integer),
            None => number
                .as_f64()
                .map(SerializedValue::float)
                .ok_or_else(|| anyhow!("number {number} cannot be represented"))?,
        },
        Value::String(text) => SerializedValue::str(text),
        Value::Array(items) => {
            let mut pairs = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                pairs.push((SerializedValue::Int(i64::try_from(index)?), json_to_value(item)?));
            }
            SerializedValue::Array(pairs)
        }
        Value::Object(object) => {
            let mut pairs = Vec::with_capacity(object.len());
            for (key, item) in object {
                pairs.push((json_key(key), json_to_value(item)?));
            }
            SerializedValue::Array(pairs)
        }
    })
}

fn json_key(key: &str) -> SerializedValue {
    match key.parse::<i64>() {
        Ok(integer) if integer.to_string() == key => SerializedValue::Int(integer),
        _ => SerializedValue::str(key),
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
