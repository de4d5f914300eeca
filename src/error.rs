//! Error taxonomy for the merge pipeline.
//!
//! Contract violations (`SchemaMismatch`, `IndexOutOfRange`) and structural
//! errors (`InvalidConfiguration`, `ScriptFormat`) abort the single call that
//! raised them. Operational errors raised by a stage during scripted playback
//! are logged and the playback continues, except `SourceNotFound`.

use std::path::PathBuf;

use thiserror::Error;

use crate::script::EngineMode;

/// Errors raised by the record store, the stages and the script engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("schema mismatch{}: {reason}", record_suffix(.record))]
    SchemaMismatch {
        record: Option<usize>,
        reason: String,
    },

    #[error("index {index} out of range (size {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{stage}: invalid configuration for '{param}': {reason}")]
    InvalidConfiguration {
        stage: String,
        param: String,
        reason: String,
    },

    #[error("source not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    #[error("parse error at line {line}: {reason}")]
    ParseError { line: usize, reason: String },

    #[error("unresolved placeholder '{{{{{placeholder}}}}}' in record {record}")]
    UnresolvedPlaceholder { placeholder: String, record: usize },

    #[error("destination {} is not writable: {reason}", .path.display())]
    DestinationUnwritable { path: PathBuf, reason: String },

    #[error("{stage} failed{}: {cause}", record_suffix(.record))]
    StageExecution {
        stage: String,
        record: Option<usize>,
        cause: String,
    },

    #[error("{}", conflict_message(.active, .requested))]
    ConflictingMode {
        active: EngineMode,
        requested: EngineMode,
    },

    #[error("script format error at line {line}: {reason}")]
    ScriptFormat { line: usize, reason: String },

    #[error("no handler registered for command '{command}'")]
    UnhandledCommand { command: String },

    #[error("playback cancelled after {completed} command(s)")]
    Cancelled { completed: usize },
}

fn conflict_message(active: &EngineMode, requested: &EngineMode) -> String {
    match requested {
        EngineMode::Idle => format!("cannot stop recording while {active}"),
        _ => format!("cannot start {requested} while {active}"),
    }
}

fn record_suffix(record: &Option<usize>) -> String {
    match record {
        Some(n) => format!(" at record {n}"),
        None => String::new(),
    }
}

impl MergeError {
    /// Shorthand for an `InvalidConfiguration` raised by `stage`.
    pub fn config(stage: &str, param: &str, reason: impl Into<String>) -> Self {
        MergeError::InvalidConfiguration {
            stage: stage.to_string(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a `StageExecution` error raised by `stage`.
    pub fn execution(stage: &str, record: Option<usize>, cause: impl Into<String>) -> Self {
        MergeError::StageExecution {
            stage: stage.to_string(),
            record,
            cause: cause.into(),
        }
    }

    /// Whether this error ends the current playback instead of being logged
    /// and skipped.
    pub fn is_fatal_to_playback(&self) -> bool {
        matches!(self, MergeError::SourceNotFound { .. })
    }

    /// Whether this error signals misuse of a contract rather than bad data.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            MergeError::SchemaMismatch { .. } | MergeError::IndexOutOfRange { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MergeError>;
