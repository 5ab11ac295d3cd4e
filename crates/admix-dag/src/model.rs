//! Model graph with lazy, touch-driven re-evaluation.

use std::collections::BTreeSet;
use std::sync::Arc;

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::{RngHandle, VariableId};
use admix_tree::AdmixtureTree;
use indexmap::IndexMap;
use log::debug;

use crate::density::Density;
use crate::function::Function;
use crate::value::Value;

/// Role a variable plays in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// Fixed value, never touched by moves.
    Constant,
    /// Value drawn from a density given its parents.
    Stochastic,
    /// Pure function of its parents.
    Deterministic,
}

#[derive(Debug, Clone)]
struct StochasticState {
    density: Arc<dyn Density>,
    clamped: bool,
    ln_probability: f64,
    stale: bool,
}

#[derive(Debug, Clone)]
enum Role {
    Constant,
    Stochastic(StochasticState),
    Deterministic(Arc<dyn Function>),
}

#[derive(Debug, Clone)]
struct Stash {
    value: Value,
    ln_probability: f64,
    invalid: bool,
    // parent list before the first rewire of this proposal
    parents: Option<Vec<VariableId>>,
}

#[derive(Debug, Clone)]
struct VariableRecord {
    name: String,
    value: Value,
    role: Role,
    parents: Vec<VariableId>,
    children: BTreeSet<VariableId>,
    // present exactly while the variable is touched
    stash: Option<Stash>,
    dirty: bool,
    invalid: bool,
}

/// Directed acyclic graph of constant, stochastic and deterministic variables.
///
/// Moves `touch` the variables they edit. Touching stashes the committed value
/// and log-probability and marks every descendant for recomputation; nothing is
/// recomputed until a value or probability is read. `keep` commits the pending
/// state and `restore` reverts to the stash.
#[derive(Debug, Clone, Default)]
pub struct Model {
    records: Vec<VariableRecord>,
    names: IndexMap<String, VariableId>,
    touched: Vec<VariableId>,
    prior_only: bool,
}

fn unknown_variable(id: VariableId) -> AdmixError {
    AdmixError::Graph(
        ErrorInfo::new("unknown-variable", "variable does not exist").with_context("variable", id),
    )
}

impl Model {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, id: VariableId) -> Result<(), AdmixError> {
        if id.index() < self.records.len() {
            Ok(())
        } else {
            Err(unknown_variable(id))
        }
    }

    fn ensure_idle(&self, operation: &str) -> Result<(), AdmixError> {
        if self.touched.is_empty() {
            Ok(())
        } else {
            Err(AdmixError::Graph(
                ErrorInfo::new("pending-proposal", "operation requires a committed model")
                    .with_context("operation", operation)
                    .with_context("touched", self.touched.len()),
            ))
        }
    }

    fn register(
        &mut self,
        name: String,
        value: Value,
        role: Role,
        parents: &[VariableId],
    ) -> Result<VariableId, AdmixError> {
        self.ensure_idle("add-variable")?;
        if self.names.contains_key(&name) {
            return Err(AdmixError::Graph(
                ErrorInfo::new("duplicate-name", "variable names must be unique")
                    .with_context("name", &name),
            ));
        }
        for &parent in parents {
            self.check(parent)?;
        }
        let id = VariableId::from_raw(self.records.len() as u64);
        for &parent in parents {
            self.records[parent.index()].children.insert(id);
        }
        self.names.insert(name.clone(), id);
        self.records.push(VariableRecord {
            name,
            value,
            role,
            parents: parents.to_vec(),
            children: BTreeSet::new(),
            stash: None,
            dirty: false,
            invalid: false,
        });
        Ok(id)
    }

    /// Adds a constant variable.
    pub fn add_constant(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<VariableId, AdmixError> {
        self.register(name.into(), value.into(), Role::Constant, &[])
    }

    /// Adds an unclamped stochastic variable with an initial value.
    pub fn add_stochastic(
        &mut self,
        name: impl Into<String>,
        density: impl Density + 'static,
        parents: &[VariableId],
        initial: impl Into<Value>,
    ) -> Result<VariableId, AdmixError> {
        let role = Role::Stochastic(StochasticState {
            density: Arc::new(density),
            clamped: false,
            ln_probability: f64::NAN,
            stale: true,
        });
        let id = self.register(name.into(), initial.into(), role, parents)?;
        self.refresh_ln_probability(id);
        Ok(id)
    }

    /// Adds a deterministic variable and evaluates it immediately.
    pub fn add_deterministic(
        &mut self,
        name: impl Into<String>,
        function: impl Function + 'static,
        parents: &[VariableId],
    ) -> Result<VariableId, AdmixError> {
        let id = self.register(
            name.into(),
            Value::Real(f64::NAN),
            Role::Deterministic(Arc::new(function)),
            parents,
        )?;
        self.records[id.index()].dirty = true;
        self.refresh(id);
        Ok(id)
    }

    /// Observes `value` on a stochastic variable; it then contributes to the likelihood.
    pub fn clamp(&mut self, id: VariableId, value: impl Into<Value>) -> Result<(), AdmixError> {
        self.ensure_idle("clamp")?;
        self.set_value(id, value)?;
        if let Role::Stochastic(state) = &mut self.records[id.index()].role {
            state.clamped = true;
        }
        self.keep_touched()
    }

    /// Draws a new value for a stochastic variable from its density. The variable
    /// is left touched.
    pub fn redraw(&mut self, id: VariableId, rng: &mut RngHandle) -> Result<(), AdmixError> {
        self.stochastic_state(id)?;
        let parents = self.records[id.index()].parents.clone();
        for &parent in &parents {
            self.refresh(parent);
        }
        let record = &self.records[id.index()];
        let Role::Stochastic(state) = &record.role else {
            return Err(not_stochastic(id));
        };
        let density = Arc::clone(&state.density);
        let args: Vec<&Value> = parents
            .iter()
            .map(|parent| &self.records[parent.index()].value)
            .collect();
        let value = density.simulate(&args, rng)?;
        self.set_value(id, value)
    }

    fn stochastic_state(&self, id: VariableId) -> Result<&StochasticState, AdmixError> {
        self.check(id)?;
        match &self.records[id.index()].role {
            Role::Stochastic(state) => Ok(state),
            _ => Err(not_stochastic(id)),
        }
    }

    /// Marks `id` and all of its descendants as touched.
    ///
    /// The first touch within a proposal stashes the committed value; repeated
    /// touches only re-mark the subgraph for recomputation.
    pub fn touch(&mut self, id: VariableId) -> Result<(), AdmixError> {
        self.check(id)?;
        let mut visited = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let record = &mut self.records[current.index()];
            if record.stash.is_none() {
                let ln_probability = match &record.role {
                    Role::Stochastic(state) => state.ln_probability,
                    _ => 0.0,
                };
                record.stash = Some(Stash {
                    value: record.value.clone(),
                    ln_probability,
                    invalid: record.invalid,
                    parents: None,
                });
                self.touched.push(current);
            }
            match &mut record.role {
                Role::Stochastic(state) => state.stale = true,
                Role::Deterministic(_) => record.dirty = true,
                Role::Constant => {}
            }
            stack.extend(record.children.iter().copied());
        }
        Ok(())
    }

    /// Touches a stochastic variable and replaces its value.
    pub fn set_value(&mut self, id: VariableId, value: impl Into<Value>) -> Result<(), AdmixError> {
        self.stochastic_state(id)?;
        self.touch(id)?;
        self.records[id.index()].value = value.into();
        Ok(())
    }

    /// Touches a stochastic variable and hands out its value for in-place edits.
    pub fn value_mut(&mut self, id: VariableId) -> Result<&mut Value, AdmixError> {
        self.stochastic_state(id)?;
        self.touch(id)?;
        Ok(&mut self.records[id.index()].value)
    }

    /// Touches a tree-valued stochastic variable and hands out the tree.
    pub fn tree_mut(&mut self, id: VariableId) -> Result<&mut AdmixtureTree, AdmixError> {
        let kind = self.committed(id)?.kind();
        self.value_mut(id)?
            .as_tree_mut()
            .ok_or_else(|| wrong_kind(id, "tree", kind))
    }

    /// Current value, recomputing a touched deterministic variable first.
    pub fn value(&mut self, id: VariableId) -> Result<&Value, AdmixError> {
        self.check(id)?;
        self.refresh(id);
        Ok(&self.records[id.index()].value)
    }

    /// Current real value.
    pub fn real(&mut self, id: VariableId) -> Result<f64, AdmixError> {
        let value = self.value(id)?;
        let kind = value.kind();
        value.as_real().ok_or_else(|| wrong_kind(id, "real", kind))
    }

    /// Stored value without recomputation. Every variable is up to date outside
    /// of a proposal.
    pub fn committed(&self, id: VariableId) -> Result<&Value, AdmixError> {
        self.check(id)?;
        Ok(&self.records[id.index()].value)
    }

    /// Stored tree value without recomputation.
    pub fn tree(&self, id: VariableId) -> Result<&AdmixtureTree, AdmixError> {
        let value = self.committed(id)?;
        value
            .as_tree()
            .ok_or_else(|| wrong_kind(id, "tree", value.kind()))
    }

    fn refresh(&mut self, id: VariableId) {
        if !self.records[id.index()].dirty {
            return;
        }
        let parents = self.records[id.index()].parents.clone();
        for &parent in &parents {
            self.refresh(parent);
        }
        // only deterministic variables are ever marked dirty
        let Role::Deterministic(function) = &self.records[id.index()].role else {
            return;
        };
        let function = Arc::clone(function);
        let invalid_parent = parents
            .iter()
            .any(|parent| self.records[parent.index()].invalid);
        let result = if invalid_parent {
            None
        } else {
            let args: Vec<&Value> = parents
                .iter()
                .map(|parent| &self.records[parent.index()].value)
                .collect();
            function.evaluate(&args)
        };
        let record = &mut self.records[id.index()];
        record.dirty = false;
        match result {
            Some(value) => {
                record.value = value;
                record.invalid = false;
            }
            None => {
                if !record.invalid {
                    debug!("{} ({}) is undefined at its parents", record.name, function.name());
                }
                record.invalid = true;
            }
        }
    }

    fn refresh_ln_probability(&mut self, id: VariableId) -> f64 {
        let parents = self.records[id.index()].parents.clone();
        for &parent in &parents {
            self.refresh(parent);
        }
        let record = &self.records[id.index()];
        let Role::Stochastic(state) = &record.role else {
            return 0.0;
        };
        if !state.stale {
            return state.ln_probability;
        }
        let ln_probability = if state.clamped && self.prior_only {
            0.0
        } else if parents
            .iter()
            .any(|parent| self.records[parent.index()].invalid)
        {
            f64::NAN
        } else {
            let args: Vec<&Value> = parents
                .iter()
                .map(|parent| &self.records[parent.index()].value)
                .collect();
            state.density.ln_density(&record.value, &args)
        };
        if let Role::Stochastic(state) = &mut self.records[id.index()].role {
            state.ln_probability = ln_probability;
            state.stale = false;
        }
        ln_probability
    }

    /// Log-probability of a variable; zero for non-stochastic variables.
    pub fn ln_probability(&mut self, id: VariableId) -> Result<f64, AdmixError> {
        self.check(id)?;
        Ok(self.refresh_ln_probability(id))
    }

    /// Cached log-probability without recomputation; exact outside of a proposal.
    pub fn committed_ln_probability(&self, id: VariableId) -> Result<f64, AdmixError> {
        self.check(id)?;
        Ok(match &self.records[id.index()].role {
            Role::Stochastic(state) => state.ln_probability,
            _ => 0.0,
        })
    }

    /// Current minus stashed log-probability; zero when untouched.
    pub fn ln_probability_ratio(&mut self, id: VariableId) -> Result<f64, AdmixError> {
        self.check(id)?;
        let current = self.refresh_ln_probability(id);
        Ok(match &self.records[id.index()].stash {
            Some(stash) if matches!(self.records[id.index()].role, Role::Stochastic(_)) => {
                current - stash.ln_probability
            }
            _ => 0.0,
        })
    }

    /// Sum of the log-probability ratios of every touched stochastic variable.
    pub fn touched_ln_ratio(&mut self) -> Result<f64, AdmixError> {
        let mut total = 0.0;
        for id in self.touched.clone() {
            total += self.ln_probability_ratio(id)?;
        }
        Ok(total)
    }

    /// Commits `id` and its touched descendants, finishing pending recomputation.
    pub fn keep(&mut self, id: VariableId) -> Result<(), AdmixError> {
        self.check(id)?;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if self.records[current.index()].stash.is_none() {
                continue;
            }
            self.refresh(current);
            self.refresh_ln_probability(current);
            let record = &mut self.records[current.index()];
            record.stash = None;
            stack.extend(record.children.iter().copied());
        }
        self.touched
            .retain(|touched| self.records[touched.index()].stash.is_some());
        Ok(())
    }

    /// Reverts `id` and its touched descendants to their stashed state.
    pub fn restore(&mut self, id: VariableId) -> Result<(), AdmixError> {
        self.check(id)?;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let record = &mut self.records[current.index()];
            let Some(stash) = record.stash.take() else {
                continue;
            };
            record.value = stash.value;
            record.invalid = stash.invalid;
            record.dirty = false;
            if let Role::Stochastic(state) = &mut record.role {
                state.ln_probability = stash.ln_probability;
                state.stale = false;
            }
            stack.extend(record.children.iter().copied());
            if let Some(parents) = stash.parents {
                self.rewire(current, parents);
            }
        }
        self.touched
            .retain(|touched| self.records[touched.index()].stash.is_some());
        Ok(())
    }

    /// Commits every touched variable.
    pub fn keep_touched(&mut self) -> Result<(), AdmixError> {
        for id in self.touched.clone() {
            self.keep(id)?;
        }
        Ok(())
    }

    /// Reverts every touched variable.
    pub fn restore_touched(&mut self) -> Result<(), AdmixError> {
        for id in self.touched.clone() {
            self.restore(id)?;
        }
        Ok(())
    }

    /// Replaces the input edge `old_parent -> id` with `new_parent -> id`.
    ///
    /// The new parent takes the old one's position in the parent list. The
    /// variable is touched; `keep` commits the new edge and `restore` rewires the
    /// parents the variable had when it was first touched.
    pub fn swap_parent(
        &mut self,
        id: VariableId,
        old_parent: VariableId,
        new_parent: VariableId,
    ) -> Result<(), AdmixError> {
        self.check(id)?;
        self.check(old_parent)?;
        self.check(new_parent)?;
        let position = self.records[id.index()]
            .parents
            .iter()
            .position(|&parent| parent == old_parent)
            .ok_or_else(|| {
                AdmixError::Graph(
                    ErrorInfo::new("unknown-edge", "variable does not depend on the old parent")
                        .with_context("variable", id)
                        .with_context("parent", old_parent),
                )
            })?;
        if self.reaches(id, new_parent) {
            return Err(AdmixError::Graph(
                ErrorInfo::new("would-create-cycle", "new parent depends on the variable")
                    .with_context("variable", id)
                    .with_context("parent", new_parent),
            ));
        }
        self.touch(id)?;
        let record = &mut self.records[id.index()];
        let mut parents = record.parents.clone();
        if let Some(stash) = record.stash.as_mut() {
            if stash.parents.is_none() {
                stash.parents = Some(parents.clone());
            }
        }
        parents[position] = new_parent;
        self.rewire(id, parents);
        debug!(
            "rewired {}: {} -> {}",
            self.records[id.index()].name,
            self.records[old_parent.index()].name,
            self.records[new_parent.index()].name
        );
        Ok(())
    }

    // replaces the parent list of `id`, keeping child sets in step
    fn rewire(&mut self, id: VariableId, parents: Vec<VariableId>) {
        let previous = std::mem::replace(&mut self.records[id.index()].parents, parents);
        for parent in previous {
            if !self.records[id.index()].parents.contains(&parent) {
                self.records[parent.index()].children.remove(&id);
            }
        }
        for parent in self.records[id.index()].parents.clone() {
            self.records[parent.index()].children.insert(id);
        }
    }

    fn reaches(&self, from: VariableId, to: VariableId) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if visited.insert(current) {
                stack.extend(self.records[current.index()].children.iter().copied());
            }
        }
        false
    }

    /// Stochastic variables whose probability depends on `id` directly or through
    /// deterministic variables.
    pub fn affected_nodes(&self, id: VariableId) -> Result<Vec<VariableId>, AdmixError> {
        self.check(id)?;
        let mut affected = BTreeSet::new();
        let mut stack: Vec<VariableId> = self.records[id.index()].children.iter().copied().collect();
        while let Some(current) = stack.pop() {
            match self.records[current.index()].role {
                Role::Stochastic(_) => {
                    affected.insert(current);
                }
                Role::Deterministic(_) => {
                    stack.extend(self.records[current.index()].children.iter().copied())
                }
                Role::Constant => {}
            }
        }
        Ok(affected.into_iter().collect())
    }

    /// Touches every variable, evaluates everything and commits.
    pub fn initialize(&mut self) -> Result<(), AdmixError> {
        for idx in 0..self.records.len() {
            self.touch(VariableId::from_raw(idx as u64))?;
        }
        self.keep_touched()
    }

    /// Sum of the cached log-probabilities of every stochastic variable.
    pub fn ln_posterior(&mut self) -> Result<f64, AdmixError> {
        let mut total = 0.0;
        for idx in 0..self.records.len() {
            total += self.refresh_ln_probability(VariableId::from_raw(idx as u64));
        }
        Ok(total)
    }

    /// Log-posterior evaluated from scratch, ignoring every cache.
    pub fn full_ln_posterior(&self) -> f64 {
        let mut fresh: Vec<Option<Option<Value>>> = vec![None; self.records.len()];
        for idx in 0..self.records.len() {
            self.evaluate_fresh(VariableId::from_raw(idx as u64), &mut fresh);
        }
        let mut total = 0.0;
        for record in &self.records {
            let Role::Stochastic(state) = &record.role else {
                continue;
            };
            if state.clamped && self.prior_only {
                continue;
            }
            let args: Option<Vec<&Value>> = record
                .parents
                .iter()
                .map(|&parent| self.fresh_value(parent, &fresh))
                .collect();
            total += match args {
                Some(args) => state.density.ln_density(&record.value, &args),
                None => f64::NAN,
            };
        }
        total
    }

    fn fresh_value<'a>(
        &'a self,
        id: VariableId,
        fresh: &'a [Option<Option<Value>>],
    ) -> Option<&'a Value> {
        match &self.records[id.index()].role {
            Role::Deterministic(_) => fresh[id.index()].as_ref().and_then(Option::as_ref),
            _ => Some(&self.records[id.index()].value),
        }
    }

    fn evaluate_fresh(&self, id: VariableId, fresh: &mut Vec<Option<Option<Value>>>) {
        let record = &self.records[id.index()];
        let Role::Deterministic(function) = &record.role else {
            return;
        };
        if fresh[id.index()].is_some() {
            return;
        }
        for &parent in &record.parents {
            self.evaluate_fresh(parent, fresh);
        }
        let result = {
            let args: Option<Vec<&Value>> = record
                .parents
                .iter()
                .map(|&parent| self.fresh_value(parent, fresh.as_slice()))
                .collect();
            args.and_then(|args| function.evaluate(&args))
        };
        fresh[id.index()] = Some(result);
    }

    /// Makes clamped variables contribute zero (or their density again).
    pub fn set_prior_only(&mut self, prior_only: bool) -> Result<(), AdmixError> {
        self.ensure_idle("set-prior-only")?;
        self.prior_only = prior_only;
        for idx in 0..self.records.len() {
            if let Role::Stochastic(state) = &mut self.records[idx].role {
                if state.clamped {
                    state.stale = true;
                }
            }
            self.refresh_ln_probability(VariableId::from_raw(idx as u64));
        }
        Ok(())
    }

    /// Whether clamped variables are ignored.
    pub fn is_prior_only(&self) -> bool {
        self.prior_only
    }

    /// Looks a variable up by name.
    pub fn lookup(&self, name: &str) -> Result<VariableId, AdmixError> {
        self.names.get(name).copied().ok_or_else(|| {
            AdmixError::Graph(
                ErrorInfo::new("unknown-name", "no variable with this name").with_context("name", name),
            )
        })
    }

    /// Name of a variable.
    pub fn name(&self, id: VariableId) -> Result<&str, AdmixError> {
        self.check(id)?;
        Ok(&self.records[id.index()].name)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the model has no variables.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All variables in registration order.
    pub fn ids(&self) -> impl Iterator<Item = VariableId> + '_ {
        self.names.values().copied()
    }

    /// Stochastic variables in registration order.
    pub fn stochastic_ids(&self) -> Vec<VariableId> {
        self.ids()
            .filter(|id| matches!(self.records[id.index()].role, Role::Stochastic(_)))
            .collect()
    }

    /// Role of a variable.
    pub fn kind(&self, id: VariableId) -> Result<VariableKind, AdmixError> {
        self.check(id)?;
        Ok(match self.records[id.index()].role {
            Role::Constant => VariableKind::Constant,
            Role::Stochastic(_) => VariableKind::Stochastic,
            Role::Deterministic(_) => VariableKind::Deterministic,
        })
    }

    /// Whether a stochastic variable is observed.
    pub fn is_clamped(&self, id: VariableId) -> Result<bool, AdmixError> {
        Ok(self.stochastic_state(id)?.clamped)
    }

    /// Whether a variable is touched.
    pub fn is_touched(&self, id: VariableId) -> Result<bool, AdmixError> {
        self.check(id)?;
        Ok(self.records[id.index()].stash.is_some())
    }

    /// Whether reading the variable would trigger a recomputation.
    pub fn needs_recompute(&self, id: VariableId) -> Result<bool, AdmixError> {
        self.check(id)?;
        let record = &self.records[id.index()];
        Ok(record.dirty || matches!(&record.role, Role::Stochastic(state) if state.stale))
    }

    /// Whether a deterministic variable is undefined at its current parents.
    pub fn is_invalid(&self, id: VariableId) -> Result<bool, AdmixError> {
        self.check(id)?;
        Ok(self.records[id.index()].invalid)
    }

    /// Touched variables in the order they were first touched.
    pub fn touched_variables(&self) -> &[VariableId] {
        &self.touched
    }

    /// Parents of a variable in registration order.
    pub fn parents(&self, id: VariableId) -> Result<&[VariableId], AdmixError> {
        self.check(id)?;
        Ok(&self.records[id.index()].parents)
    }

    /// Children of a variable in id order.
    pub fn children(&self, id: VariableId) -> Result<Vec<VariableId>, AdmixError> {
        self.check(id)?;
        Ok(self.records[id.index()].children.iter().copied().collect())
    }
}

fn not_stochastic(id: VariableId) -> AdmixError {
    AdmixError::Graph(
        ErrorInfo::new("not-stochastic", "operation requires a stochastic variable")
            .with_context("variable", id),
    )
}

fn wrong_kind(id: VariableId, expected: &str, found: &str) -> AdmixError {
    AdmixError::Graph(
        ErrorInfo::new("value-kind", "variable holds a different kind of value")
            .with_context("variable", id)
            .with_context("expected", expected)
            .with_context("found", found),
    )
}
