//! # textmerge-rs
//!
//! A script-driven record merge pipeline.
//!
//! Records are loaded from delimited text into a `RecordStore`, then passed
//! through a fixed set of stages:
//!
//! - **Input**: read a source file; the header names the fields
//! - **Filter**: drop records failing a boolean expression
//! - **Sort**: stable, multi-key reorder
//! - **Template**: render `{{ field }}` placeholders once per record
//! - **Output**: write the merged text (or the raw records) to a file
//!
//! Every stage call made through the `Controller` can be recorded into a
//! `Script`, saved as text, and replayed later against new data. Script
//! commands naming a stage this crate does not know are handed to the host
//! through `ScriptExecutor`.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use textmerge_rs::{Controller, MemorySink, MergeConfig, Severity, params};
//!
//! let dir = tempfile::tempdir().unwrap();
//! std::fs::write(dir.path().join("people.tab"), "name\tdept\nAnn\tSALES\nBob\tIT\n").unwrap();
//!
//! let log = Arc::new(MemorySink::new(Severity::Normal));
//! let config = MergeConfig::interactive().with_normalizer_path(dir.path());
//! let mut controller = Controller::new(config, log);
//!
//! controller.input(&params([("path", "people.tab")])).unwrap();
//! controller.filter(&params([("expr", "dept = sales")])).unwrap();
//! controller
//!     .template(&params([("text", "Hi {{name}}"), ("unresolved", "raise")]))
//!     .unwrap();
//!
//! let first = controller.store().record_at(0).unwrap();
//! assert_eq!(first.get("merged"), Some("Hi Ann"));
//! ```

pub mod callback;
pub mod config;
pub mod controller;
pub mod error;
pub mod log;
pub mod record;
pub mod script;
pub mod stage;
pub mod store;

pub use callback::{CallbackOutput, Invocation, RecordingExecutor, ScriptExecutor};
pub use config::MergeConfig;
pub use controller::{Controller, run_script, run_script_with, run_script_with_config};
pub use error::{MergeError, Result};
pub use log::{LogEvent, LogSink, MemorySink, Severity, TracingSink};
pub use record::{FieldDef, FieldType, Record, RecordRef, Schema};
pub use script::{
    CancelToken, EngineMode, PlayReport, PlayStatus, Script, ScriptCommand, ScriptEngine,
    parse_script, render_script,
};
pub use stage::{Params, Stage, StageId, StageReport, StageSet, UnresolvedPolicy, params};
pub use store::{ChangeKind, ListChange, ListObserver, ObserverHandle, RecordStore};
