//! Filter materialization and evaluation.
//!
//! Transforms the declarative [`FilterExpr`] tree from a trigger into an
//! evaluable [`Filter`]. Compilation is all-or-nothing: a single invalid
//! node invalidates the whole filter, and the enclosing trigger is skipped
//! by reconciliation. No partial filter is ever installed.

use cloudevents::event::{AttributesReader, ExtensionValue};
use cloudevents::Event;

use crate::cesql::{self, CesqlError};
use crate::types::FilterExpr;

/// Outcome of evaluating a filter against an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Pass,
    Fail,
}

/// Filter materialization errors.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// Exact/Prefix/Suffix expressions must carry exactly one
    /// attribute/value pair.
    #[error("{kind} expression must have exactly one attribute, found {found}")]
    NotSingleEntry { kind: &'static str, found: usize },

    /// The CESQL expression failed to compile.
    #[error(transparent)]
    Cesql(#[from] CesqlError),
}

/// A compiled, stateless filter tree.
#[derive(Debug, Clone)]
pub enum Filter {
    Exact { attribute: String, value: String },
    Prefix { attribute: String, value: String },
    Suffix { attribute: String, value: String },
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Not(Box<Filter>),
    Sql(cesql::Program),
}

impl Filter {
    /// Evaluate the filter against an event. A missing attribute fails the
    /// leaf that references it.
    pub fn evaluate(&self, event: &Event) -> FilterResult {
        let pass = match self {
            Filter::Exact { attribute, value } => {
                attribute_string(event, attribute).is_some_and(|a| a == *value)
            }
            Filter::Prefix { attribute, value } => {
                attribute_string(event, attribute).is_some_and(|a| a.starts_with(value.as_str()))
            }
            Filter::Suffix { attribute, value } => {
                attribute_string(event, attribute).is_some_and(|a| a.ends_with(value.as_str()))
            }
            Filter::All(filters) => filters
                .iter()
                .all(|f| f.evaluate(event) == FilterResult::Pass),
            Filter::Any(filters) => filters
                .iter()
                .any(|f| f.evaluate(event) == FilterResult::Pass),
            Filter::Not(inner) => inner.evaluate(event) == FilterResult::Fail,
            Filter::Sql(program) => program.evaluate(event),
        };

        if pass {
            FilterResult::Pass
        } else {
            FilterResult::Fail
        }
    }
}

/// Materialize a trigger's filter list into a single filter with `All`
/// semantics. An empty list passes every event.
pub fn materialize(filters: &[FilterExpr]) -> Result<Filter, FilterError> {
    let compiled = filters
        .iter()
        .map(materialize_expr)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Filter::All(compiled))
}

fn materialize_expr(expr: &FilterExpr) -> Result<Filter, FilterError> {
    match expr {
        FilterExpr::Exact(map) => {
            let (attribute, value) = single_entry("exact", map)?;
            Ok(Filter::Exact { attribute, value })
        }
        FilterExpr::Prefix(map) => {
            let (attribute, value) = single_entry("prefix", map)?;
            Ok(Filter::Prefix { attribute, value })
        }
        FilterExpr::Suffix(map) => {
            let (attribute, value) = single_entry("suffix", map)?;
            Ok(Filter::Suffix { attribute, value })
        }
        FilterExpr::All(exprs) => {
            let compiled = exprs
                .iter()
                .map(materialize_expr)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Filter::All(compiled))
        }
        FilterExpr::Any(exprs) => {
            let compiled = exprs
                .iter()
                .map(materialize_expr)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Filter::Any(compiled))
        }
        FilterExpr::Not(inner) => Ok(Filter::Not(Box::new(materialize_expr(inner)?))),
        FilterExpr::Cesql(expression) => Ok(Filter::Sql(cesql::compile(expression)?)),
    }
}

fn single_entry(
    kind: &'static str,
    map: &std::collections::HashMap<String, String>,
) -> Result<(String, String), FilterError> {
    if map.len() != 1 {
        return Err(FilterError::NotSingleEntry {
            kind,
            found: map.len(),
        });
    }
    let (attribute, value) = map.iter().next().expect("len checked");
    Ok((attribute.clone(), value.clone()))
}

/// Resolve an event attribute to its canonical string form.
pub(crate) fn attribute_string(event: &Event, name: &str) -> Option<String> {
    match name {
        "specversion" => Some(event.specversion().to_string()),
        "id" => Some(event.id().to_string()),
        "source" => Some(event.source().to_string()),
        "type" => Some(event.ty().to_string()),
        "subject" => event.subject().map(str::to_string),
        "time" => event.time().map(|t| t.to_rfc3339()),
        "datacontenttype" => event.datacontenttype().map(str::to_string),
        "dataschema" => event.dataschema().map(ToString::to_string),
        _ => event.extension(name).map(|v| match v {
            ExtensionValue::String(s) => s.clone(),
            ExtensionValue::Boolean(b) => b.to_string(),
            ExtensionValue::Integer(i) => i.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudevents::{EventBuilder, EventBuilderV10};
    use std::collections::HashMap;

    fn test_event() -> Event {
        EventBuilderV10::new()
            .id("evt-1")
            .ty("com.example.order.created")
            .source("example/orders")
            .subject("order-42")
            .extension("empty", "")
            .build()
            .expect("valid test event")
    }

    fn pass(filter: &Filter, event: &Event) -> bool {
        filter.evaluate(event) == FilterResult::Pass
    }

    #[test]
    fn test_exact_matches_bytes() {
        let event = test_event();
        let filter =
            materialize(&[FilterExpr::exact("type", "com.example.order.created")]).unwrap();
        assert!(pass(&filter, &event));

        let filter = materialize(&[FilterExpr::exact("type", "com.example.order")]).unwrap();
        assert!(!pass(&filter, &event));
    }

    #[test]
    fn test_exact_empty_value_is_permitted() {
        let event = test_event();
        // The attribute exists with an empty value: pass.
        let filter = materialize(&[FilterExpr::exact("empty", "")]).unwrap();
        assert!(pass(&filter, &event));
        // The attribute is absent entirely: fail, even against empty.
        let filter = materialize(&[FilterExpr::exact("absent", "")]).unwrap();
        assert!(!pass(&filter, &event));
    }

    #[test]
    fn test_prefix_and_suffix() {
        let event = test_event();
        assert!(pass(
            &materialize(&[FilterExpr::prefix("type", "com.example.")]).unwrap(),
            &event
        ));
        assert!(pass(
            &materialize(&[FilterExpr::suffix("type", ".created")]).unwrap(),
            &event
        ));
        assert!(!pass(
            &materialize(&[FilterExpr::prefix("type", "net.")]).unwrap(),
            &event
        ));
        assert!(!pass(
            &materialize(&[FilterExpr::suffix("source", "/payments")]).unwrap(),
            &event
        ));
    }

    #[test]
    fn test_missing_attribute_fails() {
        let event = test_event();
        assert!(!pass(
            &materialize(&[FilterExpr::exact("nosuchattr", "x")]).unwrap(),
            &event
        ));
        assert!(!pass(
            &materialize(&[FilterExpr::prefix("nosuchattr", "")]).unwrap(),
            &event
        ));
    }

    #[test]
    fn test_empty_all_passes_empty_any_fails() {
        let event = test_event();
        assert!(pass(&materialize(&[FilterExpr::All(vec![])]).unwrap(), &event));
        assert!(!pass(&materialize(&[FilterExpr::Any(vec![])]).unwrap(), &event));
        // An empty filter list on a trigger also passes.
        assert!(pass(&materialize(&[]).unwrap(), &event));
    }

    #[test]
    fn test_any_and_all_combinators() {
        let event = test_event();
        let filter = materialize(&[FilterExpr::Any(vec![
            FilterExpr::exact("type", "nope"),
            FilterExpr::exact("subject", "order-42"),
        ])])
        .unwrap();
        assert!(pass(&filter, &event));

        let filter = materialize(&[FilterExpr::All(vec![
            FilterExpr::prefix("type", "com.example."),
            FilterExpr::exact("subject", "other"),
        ])])
        .unwrap();
        assert!(!pass(&filter, &event));
    }

    #[test]
    fn test_double_negation_is_identity() {
        let event = test_event();
        for expr in [
            FilterExpr::exact("type", "com.example.order.created"),
            FilterExpr::exact("type", "nope"),
            FilterExpr::Any(vec![]),
        ] {
            let plain = materialize(std::slice::from_ref(&expr)).unwrap();
            let doubled = materialize(&[FilterExpr::Not(Box::new(FilterExpr::Not(Box::new(
                expr,
            ))))])
            .unwrap();
            assert_eq!(plain.evaluate(&event), doubled.evaluate(&event));
        }
    }

    #[test]
    fn test_single_entry_validation() {
        let mut map = HashMap::new();
        map.insert("type".to_string(), "a".to_string());
        map.insert("source".to_string(), "b".to_string());
        let result = materialize(&[FilterExpr::Exact(map)]);
        assert!(matches!(
            result,
            Err(FilterError::NotSingleEntry { kind: "exact", found: 2 })
        ));

        let result = materialize(&[FilterExpr::Prefix(HashMap::new())]);
        assert!(matches!(
            result,
            Err(FilterError::NotSingleEntry { kind: "prefix", found: 0 })
        ));
    }

    #[test]
    fn test_not_propagates_child_compile_failure() {
        let result = materialize(&[FilterExpr::Not(Box::new(FilterExpr::Exact(
            HashMap::new(),
        )))]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_cesql_invalidates_whole_filter() {
        let result = materialize(&[
            FilterExpr::exact("type", "a"),
            FilterExpr::Cesql("type >>>> 1".to_string()),
        ]);
        assert!(matches!(result, Err(FilterError::Cesql(_))));
    }

    #[test]
    fn test_cesql_leaf_evaluates() {
        let event = test_event();
        let filter =
            materialize(&[FilterExpr::Cesql("subject LIKE 'order-%'".to_string())]).unwrap();
        assert!(pass(&filter, &event));
    }
}
