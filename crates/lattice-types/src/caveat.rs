//! Caveat definitions and expressions.
//!
//! A caveat is a named, typed boolean expression evaluated over a context
//! map. Relationships may reference a caveat with a partial context; the
//! remainder of the context arrives with the request. Results that cannot
//! be fully decided are carried symbolically as [`CaveatExpression`] trees
//! and combined with and/or/not by the resolution engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declared caveat: a name, typed parameters, and a boolean expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaveatDefinition {
    pub name: String,
    /// Parameter name to declared type, in declaration order.
    pub parameters: Vec<(String, CaveatParamType)>,
    pub expression: CaveatExpr,
}

impl CaveatDefinition {
    pub fn new(
        name: impl Into<String>,
        parameters: Vec<(String, CaveatParamType)>,
        expression: CaveatExpr,
    ) -> Self {
        Self { name: name.into(), parameters, expression }
    }

    pub fn parameter_type(&self, name: &str) -> Option<&CaveatParamType> {
        self.parameters.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }
}

/// The parameter types a caveat may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaveatParamType {
    Int,
    Double,
    Bool,
    String,
}

/// A typed literal or context value inside a caveat expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaveatValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
}

impl CaveatValue {
    pub fn type_of(&self) -> CaveatParamType {
        match self {
            CaveatValue::Int(_) => CaveatParamType::Int,
            CaveatValue::Double(_) => CaveatParamType::Double,
            CaveatValue::Bool(_) => CaveatParamType::Bool,
            CaveatValue::String(_) => CaveatParamType::String,
        }
    }

    /// Convert a JSON context value into a typed caveat value, honoring
    /// the declared parameter type.
    pub fn from_json(value: &Value, expected: CaveatParamType) -> Option<Self> {
        match (expected, value) {
            (CaveatParamType::Int, Value::Number(n)) => n.as_i64().map(CaveatValue::Int),
            (CaveatParamType::Double, Value::Number(n)) => n.as_f64().map(CaveatValue::Double),
            (CaveatParamType::Bool, Value::Bool(b)) => Some(CaveatValue::Bool(*b)),
            (CaveatParamType::String, Value::String(s)) => Some(CaveatValue::String(s.clone())),
            _ => None,
        }
    }
}

/// Comparison operators usable inside a caveat expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// The body of a caveat: a boolean expression over parameters and literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaveatExpr {
    /// A declared parameter, bound from the context map at evaluation time.
    Param(String),
    Literal(CaveatValue),
    Compare { op: CmpOp, lhs: Box<CaveatExpr>, rhs: Box<CaveatExpr> },
    And(Box<CaveatExpr>, Box<CaveatExpr>),
    Or(Box<CaveatExpr>, Box<CaveatExpr>),
    Not(Box<CaveatExpr>),
}

impl CaveatExpr {
    pub fn param(name: impl Into<String>) -> Self {
        CaveatExpr::Param(name.into())
    }

    pub fn compare(op: CmpOp, lhs: CaveatExpr, rhs: CaveatExpr) -> Self {
        CaveatExpr::Compare { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }
}

/// A caveat bound to a relationship: the caveat's name plus the partial
/// context captured when the relationship was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatReference {
    pub caveat_name: String,
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
}

impl CaveatReference {
    pub fn named(caveat_name: impl Into<String>) -> Self {
        Self { caveat_name: caveat_name.into(), context: serde_json::Map::new() }
    }

    pub fn with_context(mut self, context: serde_json::Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// A caveat leaf carried in a conditional result: the referenced caveat
/// plus whatever context is already known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualizedCaveat {
    pub caveat_name: String,
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
    /// Parameter names still required before the caveat can be decided.
    #[serde(default)]
    pub missing_parameters: Vec<String>,
}

/// Logical operators over conditional results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaveatOp {
    And,
    Or,
    Not,
}

/// The symbolic expression attached to a `CONDITIONAL_MEMBER` result.
///
/// Union of conditional results disjoins their expressions, intersection
/// conjoins them, and exclusion conjoins the base with the negated
/// subtrahend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaveatExpression {
    Leaf(ContextualizedCaveat),
    Operation { op: CaveatOp, children: Vec<CaveatExpression> },
}

impl CaveatExpression {
    pub fn and(children: Vec<CaveatExpression>) -> Self {
        debug_assert!(children.len() >= 2);
        CaveatExpression::Operation { op: CaveatOp::And, children }
    }

    pub fn or(children: Vec<CaveatExpression>) -> Self {
        debug_assert!(children.len() >= 2);
        CaveatExpression::Operation { op: CaveatOp::Or, children }
    }

    pub fn negated(child: CaveatExpression) -> Self {
        CaveatExpression::Operation { op: CaveatOp::Not, children: vec![child] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_conversion_respects_declared_type() {
        let n = serde_json::json!(21);
        assert_eq!(
            CaveatValue::from_json(&n, CaveatParamType::Int),
            Some(CaveatValue::Int(21))
        );
        assert_eq!(CaveatValue::from_json(&n, CaveatParamType::Bool), None);

        let s = serde_json::json!("us-east");
        assert_eq!(
            CaveatValue::from_json(&s, CaveatParamType::String),
            Some(CaveatValue::String("us-east".to_string()))
        );
    }

    #[test]
    fn definition_parameter_lookup() {
        let def = CaveatDefinition::new(
            "has_age",
            vec![("n".to_string(), CaveatParamType::Int)],
            CaveatExpr::compare(
                CmpOp::Ge,
                CaveatExpr::param("n"),
                CaveatExpr::Literal(CaveatValue::Int(18)),
            ),
        );
        assert_eq!(def.parameter_type("n"), Some(&CaveatParamType::Int));
        assert_eq!(def.parameter_type("m"), None);
    }
}
