//! Codec for the legacy serialized-value format found in dump blob columns,
//! and the engine that replays table snapshots through a statement executor.

pub mod codec;
pub mod restore;

pub use codec::{
    decode, decode_prefix, decode_with, encode, encode_into, looks_serialized, CodecError,
    DecodeOptions, Float, SerializedValue, DEFAULT_MAX_DEPTH,
};
pub use restore::{
    quote_identifier, ConfigError, ExecutorError, RestoreConfig, RestoreEngine, RestoreError,
    RestoreSummary, RowFailurePolicy, RowWarning, ScalarValue, StatementExecutor, TableOutcome,
    TableReport, TableSnapshot, WarningKind,
};
