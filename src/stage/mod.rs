//! Stage trait and the five built-in stages.
//!
//! Every stage is configured from a flat string parameter map and then
//! applied to the shared record store:
//!
//! - `INPUT open` - read a delimited text source into the store
//! - `FILTER apply` - drop records failing a boolean expression
//! - `SORT apply` - stable multi-key reorder
//! - `TEMPLATE merge` - render one text unit per record into a derived field
//! - `OUTPUT write` - write merged units (or raw records) to a file
//!
//! Any other stage identifier names a custom command handled by the host
//! through `ScriptExecutor`.

pub mod expr;
pub mod filter;
pub mod input;
pub mod output;
pub mod sort;
pub mod template;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{MergeError, Result};
use crate::record::{FieldType, Schema};
use crate::store::{ListChange, ListObserver, ObserverHandle, RecordStore};

pub use filter::FilterStage;
pub use input::InputStage;
pub use output::OutputStage;
pub use sort::SortStage;
pub use template::{TemplateStage, UnresolvedPolicy};

/// Stage configuration: parameter name to value, kept in key order.
pub type Params = BTreeMap<String, String>;

/// Build a `Params` map from pairs.
pub fn params<K, V, I>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Target of a script command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StageId {
    Input,
    Filter,
    Sort,
    Template,
    Output,
    /// Host-defined command, dispatched to the `ScriptExecutor`.
    Custom(String),
}

impl StageId {
    /// Map an identifier to a built-in stage, or keep it as a custom name.
    pub fn parse(ident: &str) -> Self {
        match ident.to_ascii_uppercase().as_str() {
            "INPUT" => StageId::Input,
            "FILTER" => StageId::Filter,
            "SORT" => StageId::Sort,
            "TEMPLATE" => StageId::Template,
            "OUTPUT" => StageId::Output,
            _ => StageId::Custom(ident.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StageId::Input => "INPUT",
            StageId::Filter => "FILTER",
            StageId::Sort => "SORT",
            StageId::Template => "TEMPLATE",
            StageId::Output => "OUTPUT",
            StageId::Custom(name) => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, StageId::Custom(_))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What one `apply` did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: StageId,
    pub records_in: usize,
    pub records_out: usize,
    pub detail: Option<String>,
}

impl StageReport {
    pub fn new(stage: StageId, records_in: usize, records_out: usize) -> Self {
        Self {
            stage,
            records_in,
            records_out,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {} records",
            self.stage, self.records_in, self.records_out
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// A pipeline stage.
pub trait Stage: Send {
    /// The operation word this stage answers to in scripts.
    fn operation(&self) -> &'static str;

    /// Validate and store settings. On error the previous settings remain.
    fn configure(&mut self, params: &Params) -> Result<()>;

    /// Transform the store according to the current settings.
    fn apply(&mut self, store: &mut RecordStore) -> Result<StageReport>;

    /// Current settings, in the form `configure` accepts.
    fn snapshot(&self) -> Params;

    /// Cache that must hear about store changes, if the stage keeps one.
    fn observer(&self) -> Option<ObserverHandle> {
        None
    }
}

/// Typed access to a parameter map on behalf of one stage.
pub(crate) struct ParamReader<'a> {
    stage: &'static str,
    params: &'a Params,
}

impl<'a> ParamReader<'a> {
    pub(crate) fn new(stage: &'static str, params: &'a Params) -> Self {
        Self { stage, params }
    }

    /// Fail on any parameter not in `allowed`.
    pub(crate) fn only(&self, allowed: &[&str]) -> Result<()> {
        match self.params.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(unknown) => Err(self.invalid(unknown, "unknown parameter")),
            None => Ok(()),
        }
    }

    pub(crate) fn optional(&self, key: &str) -> Option<&'a str> {
        self.params.get(key).map(String::as_str)
    }

    pub(crate) fn required(&self, key: &str) -> Result<&'a str> {
        match self.optional(key) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            Some(_) => Err(self.invalid(key, "must not be empty")),
            None => Err(self.invalid(key, "is required")),
        }
    }

    pub(crate) fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                _ => Err(self.invalid(key, format!("expected true or false, got '{v}'"))),
            },
        }
    }

    /// Case-sensitivity setting: `ignore` or `exact`.
    pub(crate) fn ignore_case(&self, default: bool) -> Result<bool> {
        match self.optional("case").map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "ignore" | "insensitive" => Ok(true),
                "exact" | "sensitive" => Ok(false),
                _ => Err(self.invalid("case", format!("expected ignore or exact, got '{v}'"))),
            },
        }
    }

    pub(crate) fn delimiter(&self, default: char) -> Result<char> {
        let Some(raw) = self.optional("delimiter") else {
            return Ok(default);
        };
        match raw.to_ascii_lowercase().as_str() {
            "tab" | "\t" => Ok('\t'),
            "comma" | "," => Ok(','),
            "semicolon" | ";" => Ok(';'),
            "pipe" | "|" => Ok('|'),
            _ => {
                let mut chars = raw.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c != '"' && c != '\n' => Ok(c),
                    _ => Err(self.invalid(
                        "delimiter",
                        format!("expected tab, comma or a single character, got '{raw}'"),
                    )),
                }
            }
        }
    }

    pub(crate) fn invalid(&self, key: &str, reason: impl Into<String>) -> MergeError {
        MergeError::config(self.stage, key, reason)
    }
}

/// Name of a delimiter as written back into a configuration snapshot.
pub(crate) fn delimiter_name(delimiter: char) -> String {
    match delimiter {
        '\t' => "tab".to_string(),
        ',' => "comma".to_string(),
        other => other.to_string(),
    }
}

/// Field-name lookups against the current schema, dropped whenever the
/// store's schema changes.
///
/// The cache also remembers the schema it was filled from, so a store that
/// never had the stages subscribed cannot hand back stale ordinals.
#[derive(Debug, Default)]
pub struct FieldBindings {
    schema: Option<Arc<Schema>>,
    resolved: HashMap<String, (usize, FieldType)>,
}

impl FieldBindings {
    pub fn shared() -> Arc<Mutex<FieldBindings>> {
        Arc::new(Mutex::new(FieldBindings::default()))
    }

    /// Ordinal and type of `name`, resolved once per schema.
    pub fn resolve(&mut self, schema: &Arc<Schema>, name: &str) -> Option<(usize, FieldType)> {
        if !self.schema.as_ref().is_some_and(|s| Arc::ptr_eq(s, schema)) {
            self.resolved.clear();
            self.schema = Some(Arc::clone(schema));
        }
        if let Some(hit) = self.resolved.get(name) {
            return Some(*hit);
        }
        let field = schema.field_named(name)?;
        let binding = (field.ordinal, field.kind);
        self.resolved.insert(name.to_string(), binding);
        Some(binding)
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.resolved.len()
    }
}

impl ListObserver for FieldBindings {
    fn list_changed(&mut self, change: &ListChange) {
        if change.kind.alters_schema() {
            self.resolved.clear();
            self.schema = None;
        }
    }
}

/// Resolve `name` through a shared binding cache, or fail on behalf of
/// `stage`.
pub(crate) fn bind_field(
    bindings: &Mutex<FieldBindings>,
    schema: &Arc<Schema>,
    stage: &str,
    name: &str,
) -> Result<(usize, FieldType)> {
    bindings
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .resolve(schema, name)
        .ok_or_else(|| MergeError::execution(stage, None, format!("unknown field '{name}'")))
}

/// The five built-in stages, dispatched by identifier.
#[derive(Debug)]
pub struct StageSet {
    pub input: InputStage,
    pub filter: FilterStage,
    pub sort: SortStage,
    pub template: TemplateStage,
    pub output: OutputStage,
}

impl StageSet {
    pub fn new(normalizer_path: Option<PathBuf>) -> Self {
        Self {
            input: InputStage::new(normalizer_path.clone()),
            filter: FilterStage::new(),
            sort: SortStage::new(),
            template: TemplateStage::new(normalizer_path.clone()),
            output: OutputStage::new(normalizer_path),
        }
    }

    /// Base directory for relative paths in every stage that reads or
    /// writes files.
    pub fn set_normalizer_path(&mut self, path: Option<&Path>) {
        let path = path.map(Path::to_path_buf);
        self.input.set_normalizer_path(path.clone());
        self.template.set_normalizer_path(path.clone());
        self.output.set_normalizer_path(path);
    }

    pub fn get_mut(&mut self, id: &StageId) -> Option<&mut dyn Stage> {
        match id {
            StageId::Input => Some(&mut self.input),
            StageId::Filter => Some(&mut self.filter),
            StageId::Sort => Some(&mut self.sort),
            StageId::Template => Some(&mut self.template),
            StageId::Output => Some(&mut self.output),
            StageId::Custom(_) => None,
        }
    }

    /// Register every stage cache with `store`.
    pub fn subscribe(&self, store: &mut RecordStore) {
        let stages: [&dyn Stage; 5] = [
            &self.input,
            &self.filter,
            &self.sort,
            &self.template,
            &self.output,
        ];
        for handle in stages.iter().filter_map(|s| s.observer()) {
            store.subscribe(&handle);
        }
    }

    /// Configure and apply one built-in stage.
    ///
    /// Returns the report and the configuration snapshot to record.
    pub fn run(
        &mut self,
        id: &StageId,
        operation: &str,
        params: &Params,
        store: &mut RecordStore,
    ) -> Result<(StageReport, Params)> {
        let Some(stage) = self.get_mut(id) else {
            return Err(MergeError::UnhandledCommand {
                command: id.name().to_string(),
            });
        };
        if !operation.eq_ignore_ascii_case(stage.operation()) {
            return Err(MergeError::config(
                id.name(),
                "operation",
                format!(
                    "unknown operation '{operation}' (expected '{}')",
                    stage.operation()
                ),
            ));
        }
        stage.configure(params)?;
        let report = stage.apply(store)?;
        Ok((report, stage.snapshot()))
    }
}
