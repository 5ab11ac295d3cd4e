use admix_tree::AdmixtureTree;
use serde::{Deserialize, Serialize};

/// Payload held by a variable of the model graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Value {
    /// Real scalar.
    Real(f64),
    /// Integer scalar.
    Integer(i64),
    /// Vector of reals.
    RealVector(Vec<f64>),
    /// Admixture tree.
    Tree(Box<AdmixtureTree>),
}

impl Value {
    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Real(_) => "real",
            Value::Integer(_) => "integer",
            Value::RealVector(_) => "real-vector",
            Value::Tree(_) => "tree",
        }
    }

    /// Scalar view; integers are widened.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(x) => Some(*x),
            Value::Integer(k) => Some(*k as f64),
            _ => None,
        }
    }

    /// Integer view.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(k) => Some(*k),
            _ => None,
        }
    }

    /// Vector view.
    pub fn as_real_vector(&self) -> Option<&[f64]> {
        match self {
            Value::RealVector(values) => Some(values),
            _ => None,
        }
    }

    /// Tree view.
    pub fn as_tree(&self) -> Option<&AdmixtureTree> {
        match self {
            Value::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    /// Mutable tree view.
    pub fn as_tree_mut(&mut self) -> Option<&mut AdmixtureTree> {
        match self {
            Value::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    /// Real elements of a scalar or vector value.
    pub fn elements(&self) -> Option<Vec<f64>> {
        match self {
            Value::RealVector(values) => Some(values.clone()),
            other => other.as_real().map(|x| vec![x]),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Value::RealVector(values)
    }
}

impl From<AdmixtureTree> for Value {
    fn from(tree: AdmixtureTree) -> Self {
        Value::Tree(Box::new(tree))
    }
}
