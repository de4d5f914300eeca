//! TEMPLATE stage: render one text unit per record.
//!
//! Placeholders are written `{{ field }}`. The rendered text of every record
//! is stored in a derived field (`merged` unless configured otherwise) where
//! OUTPUT picks it up.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::resolve_against;
use crate::error::{MergeError, Result};
use crate::record::{FieldType, Record, Schema};
use crate::stage::{
    FieldBindings, ParamReader, Params, Stage, StageId, StageReport, bind_field, params,
};
use crate::store::{ObserverHandle, RecordStore};

const STAGE: &str = "TEMPLATE";
const DEFAULT_FIELD: &str = "merged";

/// What to do with a placeholder naming a field the schema lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    /// Fail with `UnresolvedPlaceholder` for the first such record.
    Raise,
    /// Copy the placeholder text through unchanged.
    PassThrough,
}

impl UnresolvedPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raise" | "error" => Some(UnresolvedPolicy::Raise),
            "pass-through" | "passthrough" | "keep" => Some(UnresolvedPolicy::PassThrough),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedPolicy::Raise => "raise",
            UnresolvedPolicy::PassThrough => "pass-through",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { name: String, raw: String },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Split `text` into literals and placeholders. An opening `{{` without
    /// a closing `}}` is literal text.
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                break;
            };
            let name = after[..end].trim();
            literal.push_str(&rest[..start]);
            if name.is_empty() {
                literal.push_str(&rest[start..start + 2 + end + 2]);
            } else {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder {
                    name: name.to_string(),
                    raw: rest[start..start + 2 + end + 2].to_string(),
                });
            }
            rest = &after[end + 2..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Self { segments }
    }

    /// Render one record. `number` is the 1-based record position used in
    /// errors.
    fn render(
        &self,
        bound: &[Option<usize>],
        record: &Record,
        number: usize,
        policy: UnresolvedPolicy,
    ) -> Result<String> {
        let mut out = String::new();
        let mut slot = 0;
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { name, raw } => {
                    let ordinal = bound.get(slot).copied().flatten();
                    slot += 1;
                    match (ordinal.and_then(|i| record.value(i)), policy) {
                        (Some(value), _) => out.push_str(value),
                        (None, UnresolvedPolicy::PassThrough) => out.push_str(raw),
                        (None, UnresolvedPolicy::Raise) => {
                            return Err(MergeError::UnresolvedPlaceholder {
                                placeholder: name.clone(),
                                record: number,
                            });
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn placeholder_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Placeholder { .. }))
            .count()
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateSource {
    Text(String),
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TemplateConfig {
    source: TemplateSource,
    policy: UnresolvedPolicy,
    field: String,
}

#[derive(Debug)]
pub struct TemplateStage {
    normalizer_path: Option<PathBuf>,
    config: Option<TemplateConfig>,
    bindings: Arc<Mutex<FieldBindings>>,
}

impl TemplateStage {
    pub fn new(normalizer_path: Option<PathBuf>) -> Self {
        Self {
            normalizer_path,
            config: None,
            bindings: FieldBindings::shared(),
        }
    }

    pub fn set_normalizer_path(&mut self, path: Option<PathBuf>) {
        self.normalizer_path = path;
    }

    fn load_template(&self, source: &TemplateSource) -> Result<Template> {
        match source {
            TemplateSource::Text(text) => Ok(Template::parse(text)),
            TemplateSource::Path(path) => {
                let path = resolve_against(self.normalizer_path.as_deref(), path);
                let text = fs::read_to_string(&path).map_err(|e| {
                    MergeError::execution(
                        STAGE,
                        None,
                        format!("cannot read template {}: {e}", path.display()),
                    )
                })?;
                Ok(Template::parse(&text))
            }
        }
    }

    fn bind(&self, template: &Template, schema: &Arc<Schema>) -> Vec<Option<usize>> {
        template
            .names()
            .map(|name| {
                bind_field(&self.bindings, schema, STAGE, name)
                    .ok()
                    .map(|(ordinal, _)| ordinal)
            })
            .collect()
    }
}

impl Stage for TemplateStage {
    fn operation(&self) -> &'static str {
        "merge"
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        let reader = ParamReader::new(STAGE, params);
        reader.only(&["text", "path", "unresolved", "field"])?;
        let source = match (reader.optional("text"), reader.optional("path")) {
            (Some(_), Some(_)) => {
                return Err(reader.invalid("text", "give either text or path, not both"));
            }
            (Some(text), None) => TemplateSource::Text(text.to_string()),
            (None, Some(_)) => TemplateSource::Path(PathBuf::from(reader.required("path")?)),
            (None, None) => return Err(reader.invalid("text", "text or path is required")),
        };
        let policy_value = reader.required("unresolved")?;
        let policy = UnresolvedPolicy::parse(policy_value).ok_or_else(|| {
            reader.invalid(
                "unresolved",
                format!("expected raise or pass-through, got '{policy_value}'"),
            )
        })?;
        let field = match reader.optional("field") {
            Some(_) => reader.required("field")?.trim().to_string(),
            None => DEFAULT_FIELD.to_string(),
        };
        self.config = Some(TemplateConfig {
            source,
            policy,
            field,
        });
        Ok(())
    }

    fn apply(&mut self, store: &mut RecordStore) -> Result<StageReport> {
        let Some(config) = &self.config else {
            return Err(MergeError::config(STAGE, "text", "stage is not configured"));
        };
        if !store.is_loaded() {
            return Err(MergeError::execution(STAGE, None, "no records are loaded"));
        }

        let template = self.load_template(&config.source)?;
        // The target field itself is never a placeholder source.
        let schema = store.shared_schema();
        let mut bound = self.bind(&template, &schema);
        for (slot, name) in template.names().enumerate() {
            if name == config.field
                && schema.field_named(name).is_some_and(|f| f.derived)
            {
                bound[slot] = None;
            }
        }

        let mut merged = Vec::with_capacity(store.size());
        for (i, record) in store.iter().enumerate() {
            merged.push(template.render(&bound, record.record(), i + 1, config.policy)?);
        }

        let count = merged.len();
        store
            .set_derived_field(&config.field, FieldType::Text, merged)
            .map_err(|e| MergeError::execution(STAGE, None, e.to_string()))?;
        debug!(
            field = %config.field,
            placeholders = template.placeholder_count(),
            records = count,
            "template merged"
        );
        Ok(StageReport::new(StageId::Template, count, count)
            .with_detail(format!("merged into '{}'", config.field)))
    }

    fn snapshot(&self) -> Params {
        let Some(c) = &self.config else {
            return Params::new();
        };
        let mut snapshot = params([
            ("unresolved", c.policy.as_str().to_string()),
            ("field", c.field.clone()),
        ]);
        match &c.source {
            TemplateSource::Text(text) => snapshot.insert("text".to_string(), text.clone()),
            TemplateSource::Path(path) => {
                snapshot.insert("path".to_string(), path.to_string_lossy().into_owned())
            }
        };
        snapshot
    }

    fn observer(&self) -> Option<ObserverHandle> {
        let handle: ObserverHandle = self.bindings.clone();
        Some(handle)
    }
}
