//! Caveat evaluation.
//!
//! A caveat evaluates over the merge of the context written on the
//! relationship and the context supplied with the request; the written
//! context takes precedence. When declared parameters are missing the
//! result is a partial evaluation carried symbolically in the response.

use std::collections::BTreeMap;

use lattice_types::{
    CaveatDefinition, CaveatExpr, CaveatValue, CmpOp, ContextualizedCaveat,
};
use serde_json::Value;

use crate::{EngineError, Result};

/// The outcome of evaluating a caveat.
#[derive(Debug, Clone, PartialEq)]
pub enum CaveatOutcome {
    True,
    False,
    /// Declared parameters were missing; carries the context seen so far
    /// and the parameters still required.
    Partial(ContextualizedCaveat),
}

enum Tri {
    Known(CaveatValue),
    Unknown,
}

/// Evaluate `definition` over the relationship context merged with the
/// request context.
pub fn evaluate_caveat(
    definition: &CaveatDefinition,
    relationship_context: &serde_json::Map<String, Value>,
    request_context: &serde_json::Map<String, Value>,
) -> Result<CaveatOutcome> {
    let mut bindings: BTreeMap<String, CaveatValue> = BTreeMap::new();

    for (name, param_type) in &definition.parameters {
        let raw = relationship_context.get(name).or_else(|| request_context.get(name));
        if let Some(value) = raw {
            let converted = CaveatValue::from_json(value, *param_type).ok_or_else(|| {
                EngineError::CaveatTypeMismatch {
                    caveat: definition.name.clone(),
                    parameter: name.clone(),
                }
            })?;
            bindings.insert(name.clone(), converted);
        }
    }

    match eval_expr(&definition.expression, &bindings, definition)? {
        Tri::Known(CaveatValue::Bool(true)) => Ok(CaveatOutcome::True),
        Tri::Known(CaveatValue::Bool(false)) => Ok(CaveatOutcome::False),
        Tri::Known(_) => Err(EngineError::Evaluation(format!(
            "caveat `{}` did not evaluate to a boolean",
            definition.name
        ))),
        Tri::Unknown => {
            let mut context = serde_json::Map::new();
            for (name, value) in &bindings {
                context.insert(name.clone(), caveat_value_to_json(value));
            }
            let mut missing: Vec<String> = Vec::new();
            collect_params(&definition.expression, &mut missing);
            missing.retain(|p| !bindings.contains_key(p));
            missing.dedup();
            Ok(CaveatOutcome::Partial(ContextualizedCaveat {
                caveat_name: definition.name.clone(),
                context,
                missing_parameters: missing,
            }))
        }
    }
}

/// Reject context keys that the caveat does not declare. Used by the
/// write path so that a bad binding fails at write time, not at check
/// time.
pub fn validate_context_keys(
    definition: &CaveatDefinition,
    context: &serde_json::Map<String, Value>,
) -> Result<()> {
    for key in context.keys() {
        if definition.parameter_type(key).is_none() {
            return Err(EngineError::UnknownCaveatParameter {
                caveat: definition.name.clone(),
                parameter: key.clone(),
            });
        }
    }
    Ok(())
}

fn caveat_value_to_json(value: &CaveatValue) -> Value {
    match value {
        CaveatValue::Int(i) => Value::from(*i),
        CaveatValue::Double(d) => Value::from(*d),
        CaveatValue::Bool(b) => Value::from(*b),
        CaveatValue::String(s) => Value::from(s.clone()),
    }
}

fn collect_params(expr: &CaveatExpr, out: &mut Vec<String>) {
    match expr {
        CaveatExpr::Param(name) => out.push(name.clone()),
        CaveatExpr::Literal(_) => {}
        CaveatExpr::Compare { lhs, rhs, .. } => {
            collect_params(lhs, out);
            collect_params(rhs, out);
        }
        CaveatExpr::And(a, b) | CaveatExpr::Or(a, b) => {
            collect_params(a, out);
            collect_params(b, out);
        }
        CaveatExpr::Not(inner) => collect_params(inner, out),
    }
}

fn eval_expr(
    expr: &CaveatExpr,
    bindings: &BTreeMap<String, CaveatValue>,
    definition: &CaveatDefinition,
) -> Result<Tri> {
    match expr {
        CaveatExpr::Param(name) => {
            if definition.parameter_type(name).is_none() {
                return Err(EngineError::UnknownCaveatParameter {
                    caveat: definition.name.clone(),
                    parameter: name.clone(),
                });
            }
            Ok(bindings.get(name).cloned().map(Tri::Known).unwrap_or(Tri::Unknown))
        }
        CaveatExpr::Literal(value) => Ok(Tri::Known(value.clone())),
        CaveatExpr::Compare { op, lhs, rhs } => {
            let lhs = eval_expr(lhs, bindings, definition)?;
            let rhs = eval_expr(rhs, bindings, definition)?;
            match (lhs, rhs) {
                (Tri::Known(left), Tri::Known(right)) => {
                    compare(*op, &left, &right, &definition.name).map(|b| {
                        Tri::Known(CaveatValue::Bool(b))
                    })
                }
                _ => Ok(Tri::Unknown),
            }
        }
        CaveatExpr::And(a, b) => {
            let a = eval_bool(a, bindings, definition)?;
            let b = eval_bool(b, bindings, definition)?;
            Ok(match (a, b) {
                (Some(false), _) | (_, Some(false)) => Tri::Known(CaveatValue::Bool(false)),
                (Some(true), Some(true)) => Tri::Known(CaveatValue::Bool(true)),
                _ => Tri::Unknown,
            })
        }
        CaveatExpr::Or(a, b) => {
            let a = eval_bool(a, bindings, definition)?;
            let b = eval_bool(b, bindings, definition)?;
            Ok(match (a, b) {
                (Some(true), _) | (_, Some(true)) => Tri::Known(CaveatValue::Bool(true)),
                (Some(false), Some(false)) => Tri::Known(CaveatValue::Bool(false)),
                _ => Tri::Unknown,
            })
        }
        CaveatExpr::Not(inner) => Ok(match eval_bool(inner, bindings, definition)? {
            Some(b) => Tri::Known(CaveatValue::Bool(!b)),
            None => Tri::Unknown,
        }),
    }
}

fn eval_bool(
    expr: &CaveatExpr,
    bindings: &BTreeMap<String, CaveatValue>,
    definition: &CaveatDefinition,
) -> Result<Option<bool>> {
    match eval_expr(expr, bindings, definition)? {
        Tri::Known(CaveatValue::Bool(b)) => Ok(Some(b)),
        Tri::Known(_) => Err(EngineError::Evaluation(format!(
            "caveat `{}` applied a logical operator to a non-boolean",
            definition.name
        ))),
        Tri::Unknown => Ok(None),
    }
}

fn compare(op: CmpOp, left: &CaveatValue, right: &CaveatValue, caveat: &str) -> Result<bool> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (CaveatValue::Int(a), CaveatValue::Int(b)) => a.partial_cmp(b),
        (CaveatValue::Double(a), CaveatValue::Double(b)) => a.partial_cmp(b),
        (CaveatValue::Int(a), CaveatValue::Double(b)) => (*a as f64).partial_cmp(b),
        (CaveatValue::Double(a), CaveatValue::Int(b)) => a.partial_cmp(&(*b as f64)),
        (CaveatValue::String(a), CaveatValue::String(b)) => Some(a.cmp(b)),
        (CaveatValue::Bool(a), CaveatValue::Bool(b)) => match op {
            CmpOp::Eq | CmpOp::Ne => Some(a.cmp(b)),
            _ => None,
        },
        _ => None,
    };

    let ordering = ordering.ok_or_else(|| {
        EngineError::Evaluation(format!("caveat `{caveat}` compared incompatible values"))
    })?;

    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}
