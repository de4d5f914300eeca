//! SORT stage: stable reorder by an ordered list of keys.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use crate::error::{MergeError, Result};
use crate::stage::{
    FieldBindings, ParamReader, Params, Stage, StageId, StageReport, bind_field, params,
};
use crate::store::{ObserverHandle, RecordStore};

const STAGE: &str = "SORT";

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    fn render(&self) -> String {
        let field = if self.field.contains([' ', ',']) {
            format!("[{}]", self.field)
        } else {
            self.field.clone()
        };
        let direction = if self.descending { "desc" } else { "asc" };
        format!("{field} {direction}")
    }
}

/// Parse `"last asc, first desc"` into keys. Direction defaults to
/// ascending; bracketed names may contain spaces.
pub fn parse_keys(text: &str) -> std::result::Result<Vec<SortKey>, String> {
    let mut keys = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err("empty sort key".to_string());
        }
        let (field, rest) = match part.strip_prefix('[') {
            Some(inner) => match inner.split_once(']') {
                Some((name, rest)) => (name.trim().to_string(), rest.trim()),
                None => return Err(format!("unclosed '[' in '{part}'")),
            },
            None => match part.split_once(char::is_whitespace) {
                Some((name, rest)) => (name.to_string(), rest.trim()),
                None => (part.to_string(), ""),
            },
        };
        if field.is_empty() {
            return Err(format!("missing field name in '{part}'"));
        }
        let descending = match rest.to_ascii_lowercase().as_str() {
            "" | "asc" | "ascending" => false,
            "desc" | "descending" => true,
            other => return Err(format!("unknown sort direction '{other}'")),
        };
        keys.push(SortKey { field, descending });
    }
    Ok(keys)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SortConfig {
    keys: Vec<SortKey>,
    ignore_case: bool,
}

#[derive(Debug)]
pub struct SortStage {
    config: Option<SortConfig>,
    bindings: Arc<Mutex<FieldBindings>>,
}

impl SortStage {
    pub fn new() -> Self {
        Self {
            config: None,
            bindings: FieldBindings::shared(),
        }
    }
}

impl Default for SortStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for SortStage {
    fn operation(&self) -> &'static str {
        "apply"
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        let reader = ParamReader::new(STAGE, params);
        reader.only(&["keys", "case"])?;
        let keys =
            parse_keys(reader.required("keys")?).map_err(|reason| reader.invalid("keys", reason))?;
        self.config = Some(SortConfig {
            keys,
            ignore_case: reader.ignore_case(false)?,
        });
        Ok(())
    }

    fn apply(&mut self, store: &mut RecordStore) -> Result<StageReport> {
        let Some(config) = &self.config else {
            return Err(MergeError::config(STAGE, "keys", "stage is not configured"));
        };
        if !store.is_loaded() {
            return Err(MergeError::execution(STAGE, None, "no records are loaded"));
        }

        let schema = store.shared_schema();
        let bound = config
            .keys
            .iter()
            .map(|key| {
                bind_field(&self.bindings, &schema, STAGE, &key.field)
                    .map(|(ordinal, kind)| (ordinal, kind, key.descending))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut order: Vec<usize> = (0..store.size()).collect();
        {
            let records: Vec<_> = store.iter().map(|r| r.record()).collect();
            order.sort_by(|&a, &b| {
                for &(ordinal, kind, descending) in &bound {
                    let left = records[a].value(ordinal).unwrap_or("");
                    let right = records[b].value(ordinal).unwrap_or("");
                    let ordering = kind.compare(left, right, config.ignore_case);
                    let ordering = if descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let size = store.size();
        if order.iter().enumerate().any(|(i, &j)| i != j) {
            store.reorder(&order)?;
        }
        Ok(StageReport::new(StageId::Sort, size, size))
    }

    fn snapshot(&self) -> Params {
        match &self.config {
            Some(c) => params([
                (
                    "keys",
                    c.keys
                        .iter()
                        .map(SortKey::render)
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
                (
                    "case",
                    if c.ignore_case { "ignore" } else { "exact" }.to_string(),
                ),
            ]),
            None => Params::new(),
        }
    }

    fn observer(&self) -> Option<ObserverHandle> {
        let handle: ObserverHandle = self.bindings.clone();
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldDef, FieldType, Record, Schema};

    fn pairs(store: &RecordStore) -> Vec<(String, String)> {
        store
            .iter()
            .map(|r| {
                (
                    r.get("last").unwrap_or("").to_string(),
                    r.get("first").unwrap_or("").to_string(),
                )
            })
            .collect()
    }

    fn names_store(rows: &[[&str; 2]]) -> RecordStore {
        let schema = Schema::from_names(["last", "first"]).unwrap();
        let records = rows.iter().map(|r| Record::from_values(r)).collect();
        let mut store = RecordStore::new();
        store.load(schema, records).unwrap();
        store
    }

    #[test]
    fn test_parse_keys() {
        let keys = parse_keys("last asc, first DESC, [zip code]").unwrap();
        assert_eq!(keys.len(), 3);
        assert!(!keys[0].descending);
        assert!(keys[1].descending);
        assert_eq!(keys[2].field, "zip code");
        assert!(parse_keys("last sideways").is_err());
        assert!(parse_keys("last,,first").is_err());
    }

    #[test]
    fn test_two_key_stable_sort() {
        let mut store = names_store(&[["Smith", "Bob"], ["Doe", "Ann"], ["Smith", "Al"]]);
        let mut stage = SortStage::new();
        stage
            .configure(&params([("keys", "last asc, first asc")]))
            .unwrap();
        stage.apply(&mut store).unwrap();
        let expected = vec![
            ("Doe".to_string(), "Ann".to_string()),
            ("Smith".to_string(), "Al".to_string()),
            ("Smith".to_string(), "Bob".to_string()),
        ];
        assert_eq!(pairs(&store), expected);
    }

    #[test]
    fn test_equal_keys_keep_relative_order() {
        let mut store = names_store(&[["B", "1"], ["A", "2"], ["B", "3"], ["A", "4"]]);
        let mut stage = SortStage::new();
        stage.configure(&params([("keys", "last")])).unwrap();
        stage.apply(&mut store).unwrap();
        let firsts: Vec<_> = pairs(&store).into_iter().map(|(_, f)| f).collect();
        assert_eq!(firsts, vec!["2", "4", "1", "3"]);
    }

    #[test]
    fn test_descending_numeric_key() {
        let fields = vec![
            FieldDef::new("name", 0, FieldType::Text),
            FieldDef::new("salary", 1, FieldType::Number),
        ];
        let mut store = RecordStore::new();
        store
            .load(
                Schema::new(fields).unwrap(),
                vec![
                    Record::from_values(&["a", "900"]),
                    Record::from_values(&["b", "1000"]),
                    Record::from_values(&["c", "95"]),
                ],
            )
            .unwrap();
        let mut stage = SortStage::new();
        stage
            .configure(&params([("keys", "salary desc")]))
            .unwrap();
        stage.apply(&mut store).unwrap();
        let order: Vec<_> = store.iter().map(|r| r.get("name").unwrap_or("")).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_sorted_store_is_not_renotified() {
        let mut store = names_store(&[["A", "1"], ["B", "2"]]);
        let generation = store.generation();
        let mut stage = SortStage::new();
        stage.configure(&params([("keys", "last")])).unwrap();
        stage.apply(&mut store).unwrap();
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_snapshot_reconfigures_identically() {
        let mut stage = SortStage::new();
        stage
            .configure(&params([("keys", "[zip code] desc,last"), ("case", "ignore")]))
            .unwrap();
        let snapshot = stage.snapshot();
        assert_eq!(
            snapshot.get("keys").map(String::as_str),
            Some("[zip code] desc, last asc")
        );
        let mut again = SortStage::new();
        again.configure(&snapshot).unwrap();
        assert_eq!(again.snapshot(), snapshot);
    }

    #[test]
    fn test_unknown_key_field() {
        let mut store = names_store(&[["A", "1"]]);
        let mut stage = SortStage::new();
        stage.configure(&params([("keys", "age")])).unwrap();
        assert!(matches!(
            stage.apply(&mut store),
            Err(MergeError::StageExecution { .. })
        ));
    }
}
