// Condition Evaluator
//
// Conditions are an explicit tree of leaves and AND/OR groups. Trees are
// validated when a definition is saved; evaluation is pure so real and
// simulated runs produce identical results for identical context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConditionError, DefinitionError};

/// Comparison operator for a condition leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    In,
}

/// How a group combines its children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    And,
    Or,
}

/// A node in a condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionNode {
    /// Compare one context field against a literal value
    Leaf {
        #[serde(alias = "type")]
        field: String,
        operator: Operator,
        value: Value,
    },

    /// Combine children with AND/OR
    Group {
        logic: Logic,
        children: Vec<ConditionNode>,
    },
}

impl ConditionNode {
    /// Create a leaf node
    pub fn leaf(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        ConditionNode::Leaf {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Create an AND group
    pub fn and(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Group {
            logic: Logic::And,
            children,
        }
    }

    /// Create an OR group
    pub fn or(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Group {
            logic: Logic::Or,
            children,
        }
    }

    /// Validate the tree structure and operand types
    pub fn validate(&self) -> Result<(), DefinitionError> {
        match self {
            ConditionNode::Leaf {
                field,
                operator,
                value,
            } => {
                if field.trim().is_empty() {
                    return Err(DefinitionError::InvalidCondition(
                        "leaf field must not be empty".to_string(),
                    ));
                }
                match operator {
                    Operator::GreaterThan | Operator::LessThan if as_number(value).is_none() => {
                        Err(DefinitionError::InvalidCondition(format!(
                            "{field}: {operator:?} requires a numeric value"
                        )))
                    }
                    Operator::In if !(value.is_array() || value.is_string()) => {
                        Err(DefinitionError::InvalidCondition(format!(
                            "{field}: In requires a list value"
                        )))
                    }
                    _ => Ok(()),
                }
            }
            ConditionNode::Group { children, .. } => {
                if children.is_empty() {
                    return Err(DefinitionError::InvalidCondition(
                        "group must have at least one child".to_string(),
                    ));
                }
                children.iter().try_for_each(ConditionNode::validate)
            }
        }
    }
}

/// Flat key/value view of the triggering entity
///
/// Nested JSON objects are flattened with dotted keys (`trip.cost` etc).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationContext(BTreeMap<String, Value>);

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a JSON object, flattening nested objects
    pub fn from_json(value: &Value) -> Self {
        let mut ctx = Self::new();
        if let Value::Object(map) = value {
            for (key, value) in map {
                ctx.flatten_into(key, value);
            }
        }
        ctx
    }

    fn flatten_into(&mut self, prefix: &str, value: &Value) {
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    self.flatten_into(&format!("{prefix}.{key}"), value);
                }
            }
            other => {
                self.0.insert(prefix.to_string(), other.clone());
            }
        }
    }

    /// Set a field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Read a field as a string (numbers are rendered)
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn as_json(&self) -> Value {
        serde_json::to_value(&self.0).unwrap_or(Value::Null)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for EvaluationContext {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Evaluates condition trees against a context
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator {
    strict: bool,
}

impl ConditionEvaluator {
    /// Missing fields evaluate to `false`
    pub fn lenient() -> Self {
        Self { strict: false }
    }

    /// Missing fields raise [`ConditionError::MissingField`]
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Evaluate an optional tree; no condition always matches
    pub fn evaluate_opt(
        &self,
        node: Option<&ConditionNode>,
        ctx: &EvaluationContext,
    ) -> Result<bool, ConditionError> {
        match node {
            Some(node) => self.evaluate(node, ctx),
            None => Ok(true),
        }
    }

    pub fn evaluate(
        &self,
        node: &ConditionNode,
        ctx: &EvaluationContext,
    ) -> Result<bool, ConditionError> {
        match node {
            ConditionNode::Leaf {
                field,
                operator,
                value,
            } => match ctx.get(field) {
                Some(actual) => Ok(compare(*operator, actual, value)),
                None if self.strict => Err(ConditionError::MissingField(field.clone())),
                None => Ok(false),
            },
            ConditionNode::Group { logic, children } => {
                for child in children {
                    let result = self.evaluate(child, ctx)?;
                    match (logic, result) {
                        (Logic::And, false) => return Ok(false),
                        (Logic::Or, true) => return Ok(true),
                        _ => {}
                    }
                }
                Ok(matches!(logic, Logic::And))
            }
        }
    }
}

fn compare(operator: Operator, actual: &Value, expected: &Value) -> bool {
    match operator {
        Operator::Equals => loosely_equal(actual, expected),
        Operator::NotEquals => !loosely_equal(actual, expected),
        Operator::GreaterThan => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        Operator::LessThan => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        Operator::Contains => match actual {
            Value::String(haystack) => haystack.contains(&as_text(expected)),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
            _ => false,
        },
        Operator::In => match expected {
            Value::Array(items) => items.iter().any(|item| loosely_equal(actual, item)),
            Value::String(list) => {
                let needle = as_text(actual);
                list.split(',').any(|item| item.trim() == needle)
            }
            _ => false,
        },
    }
}

/// Numeric when both sides coerce to numbers, textual otherwise
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => as_text(a) == as_text(b),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> EvaluationContext {
        EvaluationContext::from_json(&json!({
            "a": 1,
            "b": "2",
            "region": "emea",
            "tags": ["urgent", "travel"],
            "trip": { "cost_center_budget": 6000 }
        }))
    }

    #[test]
    fn test_and_requires_both_leaves() {
        let eval = ConditionEvaluator::lenient();
        let both = ConditionNode::and(vec![
            ConditionNode::leaf("a", Operator::Equals, 1),
            ConditionNode::leaf("b", Operator::Equals, 2),
        ]);
        assert!(eval.evaluate(&both, &ctx()).unwrap());

        let one = ConditionNode::and(vec![
            ConditionNode::leaf("a", Operator::Equals, 1),
            ConditionNode::leaf("b", Operator::Equals, 3),
        ]);
        assert!(!eval.evaluate(&one, &ctx()).unwrap());
    }

    #[test]
    fn test_or_requires_either_leaf() {
        let eval = ConditionEvaluator::lenient();
        let either = ConditionNode::or(vec![
            ConditionNode::leaf("a", Operator::Equals, 5),
            ConditionNode::leaf("b", Operator::Equals, 2),
        ]);
        assert!(eval.evaluate(&either, &ctx()).unwrap());

        let neither = ConditionNode::or(vec![
            ConditionNode::leaf("a", Operator::Equals, 5),
            ConditionNode::leaf("b", Operator::Equals, 5),
        ]);
        assert!(!eval.evaluate(&neither, &ctx()).unwrap());
    }

    #[test]
    fn test_numeric_comparison_on_flattened_field() {
        let eval = ConditionEvaluator::lenient();
        let over = ConditionNode::leaf("trip.cost_center_budget", Operator::GreaterThan, 5000);
        assert!(eval.evaluate(&over, &ctx()).unwrap());

        let under = ConditionNode::leaf("trip.cost_center_budget", Operator::LessThan, 5000);
        assert!(!eval.evaluate(&under, &ctx()).unwrap());
    }

    #[test]
    fn test_greater_than_on_text_is_false() {
        let eval = ConditionEvaluator::lenient();
        let node = ConditionNode::leaf("region", Operator::GreaterThan, 1);
        assert!(!eval.evaluate(&node, &ctx()).unwrap());
    }

    #[test]
    fn test_contains_and_in() {
        let eval = ConditionEvaluator::lenient();
        assert!(eval
            .evaluate(&ConditionNode::leaf("tags", Operator::Contains, "urgent"), &ctx())
            .unwrap());
        assert!(eval
            .evaluate(&ConditionNode::leaf("region", Operator::Contains, "me"), &ctx())
            .unwrap());
        assert!(eval
            .evaluate(
                &ConditionNode::leaf("region", Operator::In, json!(["apac", "emea"])),
                &ctx()
            )
            .unwrap());
        assert!(eval
            .evaluate(&ConditionNode::leaf("region", Operator::In, "amer, emea"), &ctx())
            .unwrap());
        assert!(!eval
            .evaluate(&ConditionNode::leaf("region", Operator::NotEquals, "emea"), &ctx())
            .unwrap());
    }

    #[test]
    fn test_missing_field_lenient_vs_strict() {
        let node = ConditionNode::leaf("missing", Operator::Equals, 1);
        assert!(!ConditionEvaluator::lenient().evaluate(&node, &ctx()).unwrap());
        assert_eq!(
            ConditionEvaluator::strict().evaluate(&node, &ctx()),
            Err(ConditionError::MissingField("missing".to_string()))
        );
    }

    #[test]
    fn test_short_circuit_skips_missing_field() {
        // The OR is decided by the first child, so strict mode never sees the missing field
        let node = ConditionNode::or(vec![
            ConditionNode::leaf("a", Operator::Equals, 1),
            ConditionNode::leaf("missing", Operator::Equals, 1),
        ]);
        assert!(ConditionEvaluator::strict().evaluate(&node, &ctx()).unwrap());
    }

    #[test]
    fn test_validation_rejects_bad_trees() {
        assert!(ConditionNode::and(vec![]).validate().is_err());
        assert!(ConditionNode::leaf("a", Operator::GreaterThan, "abc")
            .validate()
            .is_err());
        assert!(ConditionNode::leaf("", Operator::Equals, 1).validate().is_err());
        assert!(ConditionNode::leaf("a", Operator::In, 3).validate().is_err());
        assert!(ConditionNode::leaf("a", Operator::GreaterThan, "5000")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_tree_deserializes_from_tagged_json() {
        let node: ConditionNode = serde_json::from_value(json!({
            "kind": "group",
            "logic": "AND",
            "children": [
                { "kind": "leaf", "type": "a", "operator": "equals", "value": 1 }
            ]
        }))
        .unwrap();
        assert!(ConditionEvaluator::lenient().evaluate(&node, &ctx()).unwrap());
    }
}
