//! Records, field definitions and the schema that ties them together.
//!
//! A `Record` holds one value per schema field, stored by ordinal. Records do
//! not carry their schema; a `RecordRef` pairs a record with the schema of the
//! store it lives in so values can be looked up by field name.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDate;

use crate::error::{MergeError, Result};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Comparison hint attached to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Date,
}

impl FieldType {
    /// Parse a type hint such as the `number` in `amount:number`.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Some(FieldType::Text),
            "number" | "numeric" => Some(FieldType::Number),
            "date" => Some(FieldType::Date),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
        }
    }

    /// Infer a type from a column of values. Empty values don't vote; a
    /// column with no non-empty values is text.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut all_numbers = true;
        let mut all_dates = true;
        let mut seen = false;
        for value in values {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            seen = true;
            all_numbers &= parse_number(value).is_some();
            all_dates &= parse_date(value).is_some();
            if !all_numbers && !all_dates {
                break;
            }
        }
        match (seen, all_numbers, all_dates) {
            (true, true, _) => FieldType::Number,
            (true, false, true) => FieldType::Date,
            _ => FieldType::Text,
        }
    }

    /// Compare two values under this type.
    ///
    /// Values that parse under the type order before values that don't;
    /// two unparseable values fall back to text comparison.
    pub fn compare(&self, a: &str, b: &str, ignore_case: bool) -> Ordering {
        let typed = match self {
            FieldType::Text => None,
            FieldType::Number => Some(compare_parsed(parse_number(a), parse_number(b))),
            FieldType::Date => Some(compare_parsed(parse_date(a), parse_date(b))),
        };
        match typed {
            Some(Some(ordering)) => ordering,
            _ => compare_text(a, b, ignore_case),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn compare_parsed<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Option<Ordering> {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        (Some(_), None) => Some(Ordering::Less),
        (None, Some(_)) => Some(Ordering::Greater),
        (None, None) => None,
    }
}

pub(crate) fn compare_text(a: &str, b: &str, ignore_case: bool) -> Ordering {
    if ignore_case {
        a.to_lowercase().cmp(&b.to_lowercase())
    } else {
        a.cmp(b)
    }
}

pub(crate) fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

pub(crate) fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

/// One column of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ordinal: usize,
    pub kind: FieldType,
    /// Set on fields appended by a stage rather than read from the source.
    pub derived: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ordinal: usize, kind: FieldType) -> Self {
        Self {
            name: name.into(),
            ordinal,
            kind,
            derived: false,
        }
    }
}

/// Ordered field list shared by every record of a store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Build a schema, checking that names are unique and ordinals run
    /// contiguously from zero.
    pub fn new(fields: Vec<FieldDef>) -> Result<Self> {
        let mut names = HashSet::new();
        for (i, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(MergeError::SchemaMismatch {
                    record: None,
                    reason: format!("field {} has an empty name", i + 1),
                });
            }
            if field.ordinal != i {
                return Err(MergeError::SchemaMismatch {
                    record: None,
                    reason: format!(
                        "field '{}' has ordinal {}, expected {i}",
                        field.name, field.ordinal
                    ),
                });
            }
            if !names.insert(field.name.as_str()) {
                return Err(MergeError::SchemaMismatch {
                    record: None,
                    reason: format!("duplicate field name '{}'", field.name),
                });
            }
        }
        Ok(Self { fields })
    }

    /// Build a schema of text fields from a list of names.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| FieldDef::new(name, i, FieldType::Text))
            .collect();
        Self::new(fields)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, ordinal: usize) -> Option<&FieldDef> {
        self.fields.get(ordinal)
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn ordinal_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// A copy of this schema with one derived field appended.
    pub(crate) fn with_derived(&self, name: &str, kind: FieldType) -> Result<Schema> {
        let mut fields = self.fields.clone();
        fields.push(FieldDef {
            name: name.to_string(),
            ordinal: fields.len(),
            kind,
            derived: true,
        });
        Schema::new(fields)
    }
}

/// One row of values, positionally aligned with a schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    values: Vec<String>,
}

impl Record {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    /// Convenience constructor from string slices.
    pub fn from_values(values: &[&str]) -> Self {
        Self::new(values.iter().map(|v| v.to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, ordinal: usize) -> Option<&str> {
        self.values.get(ordinal).map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub(crate) fn set(&mut self, ordinal: usize, value: String) {
        if let Some(slot) = self.values.get_mut(ordinal) {
            *slot = value;
        }
    }

    pub(crate) fn push(&mut self, value: String) {
        self.values.push(value);
    }

    pub fn conforms_to(&self, schema: &Schema) -> bool {
        self.values.len() == schema.len()
    }
}

/// A record viewed through its store's schema.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    schema: &'a Schema,
    record: &'a Record,
}

impl<'a> RecordRef<'a> {
    pub(crate) fn new(schema: &'a Schema, record: &'a Record) -> Self {
        Self { schema, record }
    }

    /// Value of the named field, or `None` if the schema has no such field.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.schema
            .ordinal_of(name)
            .and_then(|i| self.record.value(i))
    }

    pub fn value(&self, ordinal: usize) -> Option<&'a str> {
        self.record.value(ordinal)
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    pub fn record(&self) -> &'a Record {
        self.record
    }

    /// Field/value pairs in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a FieldDef, &'a str)> + 'a {
        let record = self.record;
        self.schema
            .fields()
            .iter()
            .map(move |f| (f, record.value(f.ordinal).unwrap_or("")))
    }
}
