//! INPUT stage: read a delimited text source into the record store.
//!
//! The first line names the fields unless `header="false"`. A header name
//! may carry a type hint (`salary:number`); other columns are inferred from
//! their values.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::config::resolve_against;
use crate::error::{MergeError, Result};
use crate::record::{FieldDef, FieldType, Record, Schema};
use crate::stage::{ParamReader, Params, Stage, StageId, StageReport, delimiter_name, params};
use crate::store::RecordStore;

const STAGE: &str = "INPUT";

#[derive(Debug, Clone, PartialEq, Eq)]
struct InputConfig {
    path: PathBuf,
    delimiter: char,
    header: bool,
}

/// Loads a text source into the store, replacing its contents.
#[derive(Debug, Default)]
pub struct InputStage {
    normalizer_path: Option<PathBuf>,
    config: Option<InputConfig>,
}

impl InputStage {
    pub fn new(normalizer_path: Option<PathBuf>) -> Self {
        Self {
            normalizer_path,
            ..Self::default()
        }
    }

    pub fn set_normalizer_path(&mut self, path: Option<PathBuf>) {
        self.normalizer_path = path;
    }
}

impl Stage for InputStage {
    fn operation(&self) -> &'static str {
        "open"
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        let reader = ParamReader::new(STAGE, params);
        reader.only(&["path", "delimiter", "header"])?;
        let config = InputConfig {
            path: PathBuf::from(reader.required("path")?),
            delimiter: reader.delimiter('\t')?,
            header: reader.flag("header", true)?,
        };
        self.config = Some(config);
        Ok(())
    }

    fn apply(&mut self, store: &mut RecordStore) -> Result<StageReport> {
        let Some(config) = &self.config else {
            return Err(MergeError::config(STAGE, "path", "stage is not configured"));
        };
        let path = resolve_against(self.normalizer_path.as_deref(), &config.path);
        if !path.is_file() {
            return Err(MergeError::SourceNotFound { path });
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| MergeError::execution(STAGE, None, format!("{}: {e}", path.display())))?;

        let (schema, records) = parse_delimited(&text, config.delimiter, config.header)?;
        let before = store.size();
        let fields = schema.len();
        store.load(schema, records)?;
        debug!(path = %path.display(), records = store.size(), fields, "source loaded");

        Ok(StageReport::new(StageId::Input, before, store.size())
            .with_detail(format!("{fields} field(s) from {}", path.display())))
    }

    fn snapshot(&self) -> Params {
        match &self.config {
            Some(c) => params([
                ("path", c.path.to_string_lossy().into_owned()),
                ("delimiter", delimiter_name(c.delimiter)),
                ("header", c.header.to_string()),
            ]),
            None => Params::new(),
        }
    }
}

/// Parse delimited text into a schema and its records.
///
/// Line numbers in errors are 1-based and count blank lines.
pub fn parse_delimited(text: &str, delimiter: char, header: bool) -> Result<(Schema, Vec<Record>)> {
    let mut rows: Vec<(usize, Vec<String>)> = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        let cells = split_line(line, delimiter).map_err(|reason| MergeError::ParseError {
            line: i + 1,
            reason,
        })?;
        rows.push((i + 1, cells));
    }

    let Some((first_line, first)) = rows.first() else {
        return Err(MergeError::ParseError {
            line: 1,
            reason: "source is empty".to_string(),
        });
    };
    let width = first.len();

    let (names, hints, body) = if header {
        let mut names = Vec::with_capacity(width);
        let mut hints = Vec::with_capacity(width);
        for (col, cell) in first.iter().enumerate() {
            let (name, hint) = split_hint(cell).map_err(|reason| MergeError::ParseError {
                line: *first_line,
                reason: format!("column {}: {reason}", col + 1),
            })?;
            names.push(name);
            hints.push(hint);
        }
        (names, hints, &rows[1..])
    } else {
        let names: Vec<String> = (1..=width).map(|i| format!("field{i}")).collect();
        (names, vec![None; width], &rows[..])
    };

    for (line, cells) in body {
        if cells.len() != width {
            return Err(MergeError::ParseError {
                line: *line,
                reason: format!("expected {width} value(s), found {}", cells.len()),
            });
        }
    }

    let fields = names
        .into_iter()
        .zip(hints)
        .enumerate()
        .map(|(col, (name, hint))| {
            let kind = hint.unwrap_or_else(|| {
                FieldType::infer(body.iter().map(|(_, cells)| cells[col].as_str()))
            });
            FieldDef::new(name, col, kind)
        })
        .collect();
    let schema = Schema::new(fields).map_err(|e| match e {
        MergeError::SchemaMismatch { reason, .. } => MergeError::ParseError {
            line: *first_line,
            reason,
        },
        other => other,
    })?;

    let records = body
        .iter()
        .map(|(_, cells)| Record::new(cells.clone()))
        .collect();
    Ok((schema, records))
}

/// `name:type` header cell into name and optional declared type.
fn split_hint(cell: &str) -> std::result::Result<(String, Option<FieldType>), String> {
    let cell = cell.trim();
    if let Some((name, hint)) = cell.rsplit_once(':')
        && let Some(kind) = FieldType::from_hint(hint)
    {
        return Ok((name.trim().to_string(), Some(kind)));
    }
    if cell.is_empty() {
        return Err("empty field name".to_string());
    }
    Ok((cell.to_string(), None))
}

/// Split one line on `delimiter`, honouring double-quoted cells with `""`
/// escapes.
fn split_line(line: &str, delimiter: char) -> std::result::Result<Vec<String>, String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut chars = line.chars().peekable();
    let mut at_cell_start = true;

    while let Some(c) = chars.next() {
        if at_cell_start && c == '"' {
            at_cell_start = false;
            let mut closed = false;
            while let Some(q) = chars.next() {
                if q == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        cell.push('"');
                    } else {
                        closed = true;
                        break;
                    }
                } else {
                    cell.push(q);
                }
            }
            if !closed {
                return Err("unterminated quoted value".to_string());
            }
            match chars.peek() {
                None => {}
                Some(&next) if next == delimiter => {}
                Some(_) => return Err("unexpected text after closing quote".to_string()),
            }
            continue;
        }
        if c == delimiter {
            cells.push(std::mem::take(&mut cell));
            at_cell_start = true;
        } else {
            cell.push(c);
            at_cell_start = false;
        }
    }
    cells.push(cell);
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn people_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("specs/people.tab")
    }

    #[test]
    fn test_parse_with_header_and_hints() {
        let text = "name\tage:text\tjoined\nAnn\t30\t2020-01-05\nBob\t41\t2019-07-30\n";
        let (schema, records) = parse_delimited(text, '\t', true).unwrap();
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["name", "age", "joined"]);
        assert_eq!(schema.field(1).unwrap().kind, FieldType::Text);
        assert_eq!(schema.field(2).unwrap().kind, FieldType::Date);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value(0), Some("Bob"));
    }

    #[test]
    fn test_parse_without_header() {
        let (schema, records) = parse_delimited("1,2\n3,4\n", ',', false).unwrap();
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["field1", "field2"]);
        assert_eq!(schema.field(0).unwrap().kind, FieldType::Number);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_quoted_cells() {
        let text = "name,quote\nAnn,\"Hello, \"\"world\"\"\"\n";
        let (_, records) = parse_delimited(text, ',', true).unwrap();
        assert_eq!(records[0].value(1), Some("Hello, \"world\""));
    }

    #[test]
    fn test_ragged_row_names_line() {
        let text = "a\tb\n1\t2\n\n3\n";
        let err = parse_delimited(text, '\t', true).unwrap_err();
        assert_eq!(
            err,
            MergeError::ParseError {
                line: 4,
                reason: "expected 2 value(s), found 1".to_string(),
            }
        );
    }

    #[test]
    fn test_empty_source_is_parse_error() {
        assert!(matches!(
            parse_delimited("\n\n", '\t', true),
            Err(MergeError::ParseError { line: 1, .. })
        ));
    }

    #[test]
    fn test_duplicate_header_is_parse_error() {
        assert!(matches!(
            parse_delimited("a,a\n1,2\n", ',', true),
            Err(MergeError::ParseError { line: 1, .. })
        ));
    }

    #[test]
    fn test_header_only_loads_zero_records() {
        let mut store = RecordStore::new();
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("empty.tab"), "name\tdept\n").unwrap();
        let mut stage = InputStage::new(Some(dir.path().to_path_buf()));
        stage.configure(&params([("path", "empty.tab")])).unwrap();
        stage.apply(&mut store).unwrap();
        assert!(store.is_loaded());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_open_fixture() {
        let mut store = RecordStore::new();
        let mut stage = InputStage::new(None);
        let path = people_path();
        stage
            .configure(&params([("path", path.to_string_lossy().as_ref())]))
            .unwrap();
        let report = stage.apply(&mut store).unwrap();
        assert_eq!(report.records_out, store.size());
        assert_eq!(store.size(), 6);
        assert_eq!(store.schema().field_named("salary").unwrap().kind, FieldType::Number);
        assert!(report.detail.unwrap().ends_with("people.tab"));
    }

    #[test]
    fn test_missing_source() {
        let dir = tempdir().unwrap();
        let mut stage = InputStage::new(Some(dir.path().to_path_buf()));
        stage.configure(&params([("path", "nope.tab")])).unwrap();
        let mut store = RecordStore::new();
        let err = stage.apply(&mut store).unwrap_err();
        assert_eq!(
            err,
            MergeError::SourceNotFound {
                path: dir.path().join("nope.tab")
            }
        );
        assert!(err.is_fatal_to_playback());
        assert!(!store.is_loaded());
    }

    #[test]
    fn test_bad_configuration_keeps_previous() {
        let mut stage = InputStage::new(None);
        stage.configure(&params([("path", "a.tab")])).unwrap();
        let before = stage.snapshot();
        assert!(stage.configure(&params([("delimiter", "comma")])).is_err());
        assert!(stage.configure(&params([("path", "b"), ("speed", "9")])).is_err());
        assert_eq!(stage.snapshot(), before);
        assert_eq!(before.get("delimiter").map(String::as_str), Some("tab"));
    }
}
