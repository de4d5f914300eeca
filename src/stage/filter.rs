//! FILTER stage: drop records for which an expression is false.
//!
//! Removal is physical. Applying the same filter twice leaves the store as
//! the first application did.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{MergeError, Result};
use crate::stage::expr::{Expr, parse_expr};
use crate::stage::{
    FieldBindings, ParamReader, Params, Stage, StageId, StageReport, bind_field, params,
};
use crate::store::{ObserverHandle, RecordStore};

const STAGE: &str = "FILTER";

#[derive(Debug, Clone, PartialEq)]
struct FilterConfig {
    source: String,
    expr: Expr,
    ignore_case: bool,
}

#[derive(Debug)]
pub struct FilterStage {
    config: Option<FilterConfig>,
    bindings: Arc<Mutex<FieldBindings>>,
}

impl FilterStage {
    pub fn new() -> Self {
        Self {
            config: None,
            bindings: FieldBindings::shared(),
        }
    }
}

impl Default for FilterStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for FilterStage {
    fn operation(&self) -> &'static str {
        "apply"
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        let reader = ParamReader::new(STAGE, params);
        reader.only(&["expr", "case"])?;
        let source = reader.required("expr")?;
        let expr = parse_expr(source).map_err(|reason| reader.invalid("expr", reason))?;
        self.config = Some(FilterConfig {
            source: source.to_string(),
            expr,
            ignore_case: reader.ignore_case(true)?,
        });
        Ok(())
    }

    fn apply(&mut self, store: &mut RecordStore) -> Result<StageReport> {
        let Some(config) = &self.config else {
            return Err(MergeError::config(STAGE, "expr", "stage is not configured"));
        };
        if !store.is_loaded() {
            return Err(MergeError::execution(STAGE, None, "no records are loaded"));
        }

        let schema = store.shared_schema();
        let mut unknown = None;
        let bound = config.expr.bind(&mut |name: &str| {
            match bind_field(&self.bindings, &schema, STAGE, name) {
                Ok(binding) => Some(binding),
                Err(e) => {
                    unknown.get_or_insert(e);
                    None
                }
            }
        });
        let bound = match (bound, unknown) {
            (Ok(bound), _) => bound,
            (Err(_), Some(e)) => return Err(e),
            (Err(reason), None) => return Err(MergeError::execution(STAGE, None, reason)),
        };

        let before = store.size();
        let ignore_case = config.ignore_case;
        let removed = store.retain(|r| bound.matches(r.record(), ignore_case));
        debug!(expr = %config.source, removed, "filter applied");
        Ok(StageReport::new(StageId::Filter, before, store.size())
            .with_detail(format!("{removed} removed")))
    }

    fn snapshot(&self) -> Params {
        match &self.config {
            Some(c) => params([
                ("expr", c.source.clone()),
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
