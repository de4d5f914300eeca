//! OUTPUT stage: write per-record results in store order.
//!
//! With a merge field (configured, or the one TEMPLATE last wrote) each
//! record contributes its merged text followed by a newline. Without one the
//! records are written as delimited text with a header line.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::resolve_against;
use crate::error::{MergeError, Result};
use crate::stage::{ParamReader, Params, Stage, StageId, StageReport, delimiter_name, params};
use crate::store::RecordStore;

const STAGE: &str = "OUTPUT";

#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputConfig {
    path: PathBuf,
    field: Option<String>,
    delimiter: char,
    append: bool,
}

#[derive(Debug, Default)]
pub struct OutputStage {
    normalizer_path: Option<PathBuf>,
    config: Option<OutputConfig>,
}

impl OutputStage {
    pub fn new(normalizer_path: Option<PathBuf>) -> Self {
        Self {
            normalizer_path,
            config: None,
        }
    }

    pub fn set_normalizer_path(&mut self, path: Option<PathBuf>) {
        self.normalizer_path = path;
    }
}

impl Stage for OutputStage {
    fn operation(&self) -> &'static str {
        "write"
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        let reader = ParamReader::new(STAGE, params);
        reader.only(&["path", "field", "delimiter", "append"])?;
        let field = match reader.optional("field") {
            Some(_) => Some(reader.required("field")?.trim().to_string()),
            None => None,
        };
        self.config = Some(OutputConfig {
            path: PathBuf::from(reader.required("path")?),
            field,
            delimiter: reader.delimiter('\t')?,
            append: reader.flag("append", false)?,
        });
        Ok(())
    }

    fn apply(&mut self, store: &mut RecordStore) -> Result<StageReport> {
        let Some(config) = &self.config else {
            return Err(MergeError::config(STAGE, "path", "stage is not configured"));
        };
        if !store.is_loaded() {
            return Err(MergeError::execution(STAGE, None, "no records are loaded"));
        }

        let field = match &config.field {
            Some(name) => {
                let ordinal = store.schema().ordinal_of(name).ok_or_else(|| {
                    MergeError::execution(STAGE, None, format!("unknown field '{name}'"))
                })?;
                Some(ordinal)
            }
            None => store
                .merge_field()
                .and_then(|name| store.schema().ordinal_of(name)),
        };

        let mut text = String::new();
        match field {
            Some(ordinal) => {
                for record in store.iter() {
                    let unit = record.value(ordinal).unwrap_or("");
                    text.push_str(unit);
                    if !unit.ends_with('\n') {
                        text.push('\n');
                    }
                }
            }
            None => {
                let header: Vec<&str> = store.schema().names().collect();
                push_row(&mut text, header.iter().copied(), config.delimiter);
                for record in store.iter() {
                    let values = record.record().values().iter().map(String::as_str);
                    push_row(&mut text, values, config.delimiter);
                }
            }
        }

        let path = resolve_against(self.normalizer_path.as_deref(), &config.path);
        write_destination(&path, &text, config.append)?;
        debug!(path = %path.display(), records = store.size(), "output written");

        let mode = if field.is_some() { "merged" } else { "raw" };
        Ok(StageReport::new(StageId::Output, store.size(), store.size())
            .with_detail(format!("{mode} to {}", path.display())))
    }

    fn snapshot(&self) -> Params {
        let Some(c) = &self.config else {
            return Params::new();
        };
        let mut snapshot = params([
            ("path", c.path.to_string_lossy().into_owned()),
            ("delimiter", delimiter_name(c.delimiter)),
            ("append", c.append.to_string()),
        ]);
        if let Some(field) = &c.field {
            snapshot.insert("field".to_string(), field.clone());
        }
        snapshot
    }
}

fn push_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>, delimiter: char) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        if cell.contains([delimiter, '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
}

fn write_destination(path: &Path, text: &str, append: bool) -> Result<()> {
    let unwritable = |e: std::io::Error| MergeError::DestinationUnwritable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(unwritable)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .map_err(unwritable)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(text.as_bytes()).map_err(unwritable)?;
    writer.flush().map_err(unwritable)
}
