//! Deterministic functions of parent values.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// Pure function computing a deterministic variable from its parents.
///
/// Returning `None` marks the variable invalid; every stochastic descendant then
/// reports a NaN log-probability until the parents change again.
pub trait Function: fmt::Debug + Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Computes the value from the parents in registration order.
    fn evaluate(&self, parents: &[&Value]) -> Option<Value>;
}

/// Sum of every real element across all parents.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Function for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn evaluate(&self, parents: &[&Value]) -> Option<Value> {
        let mut total = 0.0;
        for parent in parents {
            total += parent.elements()?.into_iter().sum::<f64>();
        }
        Some(Value::Real(total))
    }
}

/// Product of every real element across all parents.
#[derive(Debug, Clone, Copy, Default)]
pub struct Product;

impl Function for Product {
    fn name(&self) -> &str {
        "product"
    }

    fn evaluate(&self, parents: &[&Value]) -> Option<Value> {
        let mut total = 1.0;
        for parent in parents {
            total *= parent.elements()?.into_iter().product::<f64>();
        }
        Some(Value::Real(total))
    }
}

/// Total branch length of a tree parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeLength;

impl Function for TreeLength {
    fn name(&self) -> &str {
        "tree-length"
    }

    fn evaluate(&self, parents: &[&Value]) -> Option<Value> {
        let tree = parents.first()?.as_tree()?;
        Some(Value::Real(tree.tree_length()))
    }
}

/// Number of admixture edges in a tree parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmixtureEventCount;

impl Function for AdmixtureEventCount {
    fn name(&self) -> &str {
        "admixture-event-count"
    }

    fn evaluate(&self, parents: &[&Value]) -> Option<Value> {
        let tree = parents.first()?.as_tree()?;
        Some(Value::Integer(tree.num_admixture_events() as i64))
    }
}

type Closure = dyn Fn(&[&Value]) -> Option<Value> + Send + Sync;

/// Adapts a closure into a [`Function`].
#[derive(Clone)]
pub struct FnFunction {
    name: String,
    closure: Arc<Closure>,
}

impl FnFunction {
    /// Wraps `closure` under `name`.
    pub fn new(
        name: impl Into<String>,
        closure: impl Fn(&[&Value]) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            closure: Arc::new(closure),
        }
    }
}

impl fmt::Debug for FnFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFunction").field("name", &self.name).finish()
    }
}

impl Function for FnFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, parents: &[&Value]) -> Option<Value> {
        (self.closure)(parents)
    }
}
