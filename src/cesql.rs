//! CloudEvents SQL expression compilation and evaluation.
//!
//! Compiles a boolean-valued expression over event attributes into an
//! evaluable program. Parsing is delegated to the SQL parser; the supported
//! subset is validated at compile time so that an invalid expression can
//! never be installed on a trigger:
//!
//! - string / integer / boolean literals and attribute identifiers
//! - `= != <> < <= > >=`
//! - `AND OR NOT`
//! - `LIKE` / `NOT LIKE` with `%` and `_` wildcards
//! - `IN (...)`
//! - `LOWER`, `UPPER`, `CONCAT`, `LENGTH`
//!
//! Evaluation is total: any runtime fault (missing attribute, type
//! mismatch) makes the expression evaluate to false.

use cloudevents::event::{AttributesReader, ExtensionValue};
use cloudevents::Event;
use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// CESQL compilation errors.
#[derive(Debug, thiserror::Error)]
pub enum CesqlError {
    /// The expression could not be parsed.
    #[error("invalid CESQL expression: {0}")]
    Parse(String),

    /// The expression parses but uses a construct outside the supported
    /// subset.
    #[error("unsupported CESQL construct: {0}")]
    Unsupported(String),
}

/// A compiled CESQL expression.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    expr: Expr,
}

/// Compile a CESQL expression into an evaluable program.
pub fn compile(expression: &str) -> Result<Program, CesqlError> {
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(expression)
        .map_err(|e| CesqlError::Parse(e.to_string()))?;
    let expr = parser
        .parse_expr()
        .map_err(|e| CesqlError::Parse(e.to_string()))?;

    validate(&expr)?;

    Ok(Program {
        source: expression.to_string(),
        expr,
    })
}

impl Program {
    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the expression against an event.
    ///
    /// Non-boolean results and runtime faults evaluate to false.
    pub fn evaluate(&self, event: &Event) -> bool {
        matches!(eval(&self.expr, event), Ok(Val::Bool(true)))
    }
}

/// Runtime value model: CESQL works over strings, integers and booleans.
#[derive(Debug, Clone, PartialEq)]
enum Val {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// Runtime evaluation faults. Internal only; they collapse to `false` at
/// the `Program::evaluate` boundary.
enum EvalError {
    MissingAttribute,
    TypeMismatch,
}

fn eval(expr: &Expr, event: &Event) -> Result<Val, EvalError> {
    match expr {
        Expr::Identifier(ident) => {
            attribute(event, &ident.value).ok_or(EvalError::MissingAttribute)
        }
        Expr::Value(value) => literal(&value.value),
        Expr::Nested(inner) => eval(inner, event),

        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: inner,
        } => {
            let v = eval_bool(inner, event)?;
            Ok(Val::Bool(!v))
        }
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match eval(inner, event)? {
            Val::Int(i) => Ok(Val::Int(-i)),
            _ => Err(EvalError::TypeMismatch),
        },

        Expr::BinaryOp { left, op, right } => eval_binary(left, op, right, event),

        Expr::Like {
            negated,
            expr: inner,
            pattern,
            ..
        } => {
            let text = eval_str(inner, event)?;
            let pattern = eval_str(pattern, event)?;
            let matched = like_match(&text, &pattern);
            Ok(Val::Bool(matched != *negated))
        }

        Expr::InList {
            expr: inner,
            list,
            negated,
        } => {
            let needle = eval(inner, event)?;
            let mut found = false;
            for item in list {
                if eval(item, event)? == needle {
                    found = true;
                    break;
                }
            }
            Ok(Val::Bool(found != *negated))
        }

        Expr::Function(func) => eval_function(func, event),

        _ => Err(EvalError::TypeMismatch),
    }
}

fn eval_binary(
    left: &Expr,
    op: &BinaryOperator,
    right: &Expr,
    event: &Event,
) -> Result<Val, EvalError> {
    match op {
        BinaryOperator::And => {
            // Short-circuit: a failed right side is never evaluated.
            if !eval_bool(left, event)? {
                return Ok(Val::Bool(false));
            }
            Ok(Val::Bool(eval_bool(right, event)?))
        }
        BinaryOperator::Or => {
            if eval_bool(left, event)? {
                return Ok(Val::Bool(true));
            }
            Ok(Val::Bool(eval_bool(right, event)?))
        }
        BinaryOperator::Eq => {
            let (l, r) = (eval(left, event)?, eval(right, event)?);
            same_type(&l, &r)?;
            Ok(Val::Bool(l == r))
        }
        BinaryOperator::NotEq => {
            let (l, r) = (eval(left, event)?, eval(right, event)?);
            same_type(&l, &r)?;
            Ok(Val::Bool(l != r))
        }
        BinaryOperator::Lt => int_compare(left, right, event, |o| o.is_lt()),
        BinaryOperator::LtEq => int_compare(left, right, event, |o| o.is_le()),
        BinaryOperator::Gt => int_compare(left, right, event, |o| o.is_gt()),
        BinaryOperator::GtEq => int_compare(left, right, event, |o| o.is_ge()),
        _ => Err(EvalError::TypeMismatch),
    }
}

fn eval_function(func: &sqlparser::ast::Function, event: &Event) -> Result<Val, EvalError> {
    let name = func.name.to_string().to_ascii_uppercase();
    let args = function_args(func).map_err(|_| EvalError::TypeMismatch)?;

    match name.as_str() {
        "LOWER" => {
            let [arg] = args.as_slice() else {
                return Err(EvalError::TypeMismatch);
            };
            Ok(Val::Str(eval_str(arg, event)?.to_lowercase()))
        }
        "UPPER" => {
            let [arg] = args.as_slice() else {
                return Err(EvalError::TypeMismatch);
            };
            Ok(Val::Str(eval_str(arg, event)?.to_uppercase()))
        }
        "LENGTH" => {
            let [arg] = args.as_slice() else {
                return Err(EvalError::TypeMismatch);
            };
            Ok(Val::Int(eval_str(arg, event)?.chars().count() as i64))
        }
        "CONCAT" => {
            let mut out = String::new();
            for arg in &args {
                out.push_str(&eval_str(arg, event)?);
            }
            Ok(Val::Str(out))
        }
        _ => Err(EvalError::TypeMismatch),
    }
}

fn eval_bool(expr: &Expr, event: &Event) -> Result<bool, EvalError> {
    match eval(expr, event)? {
        Val::Bool(b) => Ok(b),
        _ => Err(EvalError::TypeMismatch),
    }
}

fn eval_str(expr: &Expr, event: &Event) -> Result<String, EvalError> {
    match eval(expr, event)? {
        Val::Str(s) => Ok(s),
        _ => Err(EvalError::TypeMismatch),
    }
}

fn int_compare(
    left: &Expr,
    right: &Expr,
    event: &Event,
    check: fn(std::cmp::Ordering) -> bool,
) -> Result<Val, EvalError> {
    match (eval(left, event)?, eval(right, event)?) {
        (Val::Int(l), Val::Int(r)) => Ok(Val::Bool(check(l.cmp(&r)))),
        _ => Err(EvalError::TypeMismatch),
    }
}

fn same_type(l: &Val, r: &Val) -> Result<(), EvalError> {
    match (l, r) {
        (Val::Str(_), Val::Str(_)) | (Val::Int(_), Val::Int(_)) | (Val::Bool(_), Val::Bool(_)) => {
            Ok(())
        }
        _ => Err(EvalError::TypeMismatch),
    }
}

fn literal(value: &Value) -> Result<Val, EvalError> {
    match value {
        Value::Number(n, _) => n
            .parse::<i64>()
            .map(Val::Int)
            .map_err(|_| EvalError::TypeMismatch),
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(Val::Str(s.clone())),
        Value::Boolean(b) => Ok(Val::Bool(*b)),
        _ => Err(EvalError::TypeMismatch),
    }
}

/// Resolve an event attribute as a typed value. Extension attributes keep
/// their CloudEvents type; context attributes are strings.
fn attribute(event: &Event, name: &str) -> Option<Val> {
    match name {
        "specversion" => Some(Val::Str(event.specversion().to_string())),
        "id" => Some(Val::Str(event.id().to_string())),
        "source" => Some(Val::Str(event.source().to_string())),
        "type" => Some(Val::Str(event.ty().to_string())),
        "subject" => event.subject().map(|s| Val::Str(s.to_string())),
        "time" => event.time().map(|t| Val::Str(t.to_rfc3339())),
        "datacontenttype" => event.datacontenttype().map(|s| Val::Str(s.to_string())),
        "dataschema" => event.dataschema().map(|u| Val::Str(u.to_string())),
        _ => event.extension(name).map(|v| match v {
            ExtensionValue::String(s) => Val::Str(s.clone()),
            ExtensionValue::Boolean(b) => Val::Bool(*b),
            ExtensionValue::Integer(i) => Val::Int(*i),
        }),
    }
}

/// SQL LIKE matching with `%` (any run) and `_` (any single character).
fn like_match(text: &str, pattern: &str) -> bool {
    fn matches(text: &[char], pattern: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('%', rest)) => {
                (0..=text.len()).any(|skip| matches(&text[skip..], rest))
            }
            Some(('_', rest)) => match text.split_first() {
                Some((_, text_rest)) => matches(text_rest, rest),
                None => false,
            },
            Some((&c, rest)) => match text.split_first() {
                Some((&t, text_rest)) => t == c && matches(text_rest, rest),
                None => false,
            },
        }
    }

    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    matches(&text, &pattern)
}

/// Collect plain expression arguments of a function call; anything fancier
/// (named arguments, wildcards, clauses) is rejected.
fn function_args(func: &sqlparser::ast::Function) -> Result<Vec<Expr>, ()> {
    use sqlparser::ast::{FunctionArg, FunctionArgExpr, FunctionArguments};

    let list = match &func.args {
        FunctionArguments::List(list) => list,
        _ => return Err(()),
    };

    let mut out = Vec::with_capacity(list.args.len());
    for arg in &list.args {
        match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => out.push(e.clone()),
            _ => return Err(()),
        }
    }
    Ok(out)
}

/// Compile-time validation of the supported subset. Mirrors `eval`; any
/// node that `eval` cannot handle is rejected here so compilation failures
/// surface at reconciliation instead of silently failing events.
fn validate(expr: &Expr) -> Result<(), CesqlError> {
    let unsupported = || CesqlError::Unsupported(expr.to_string());

    match expr {
        Expr::Identifier(_) => Ok(()),
        Expr::Value(value) => match &value.value {
            Value::Number(n, _) => n
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| CesqlError::Unsupported(format!("non-integer number: {n}"))),
            Value::SingleQuotedString(_) | Value::DoubleQuotedString(_) | Value::Boolean(_) => {
                Ok(())
            }
            _ => Err(unsupported()),
        },
        Expr::Nested(inner) => validate(inner),
        Expr::UnaryOp {
            op: UnaryOperator::Not | UnaryOperator::Minus,
            expr: inner,
        } => validate(inner),
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And
            | BinaryOperator::Or
            | BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq => {
                validate(left)?;
                validate(right)
            }
            _ => Err(unsupported()),
        },
        Expr::Like {
            escape_char: None,
            expr: inner,
            pattern,
            ..
        } => {
            validate(inner)?;
            validate(pattern)
        }
        Expr::InList {
            expr: inner, list, ..
        } => {
            validate(inner)?;
            for item in list {
                validate(item)?;
            }
            Ok(())
        }
        Expr::Function(func) => {
            let name = func.name.to_string().to_ascii_uppercase();
            if !matches!(name.as_str(), "LOWER" | "UPPER" | "CONCAT" | "LENGTH") {
                return Err(CesqlError::Unsupported(format!("function {name}")));
            }
            let args = function_args(func).map_err(|()| unsupported())?;
            for arg in &args {
                validate(arg)?;
            }
            Ok(())
        }
        _ => Err(unsupported()),
    }
}
