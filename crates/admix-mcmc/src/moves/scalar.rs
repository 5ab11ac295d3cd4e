use admix_core::errors::AdmixError;
use admix_core::{RngHandle, VariableId};
use admix_dag::Model;

use super::{missing_record, single_target, Move, MoveCore, Proposal};

/// Multiplies a positive real by `exp(lambda * (u - 0.5))`.
#[derive(Debug, Clone)]
pub struct ScaleMove {
    core: MoveCore,
    lambda: f64,
    stored: Option<f64>,
}

impl ScaleMove {
    /// Scale move on `target` with initial tuning parameter `lambda`.
    pub fn new(target: VariableId, lambda: f64, weight: f64) -> Self {
        Self::with_core(MoveCore::new("scale", vec![target], weight), lambda)
    }

    /// Scale move with a custom core.
    pub fn with_core(core: MoveCore, lambda: f64) -> Self {
        Self {
            core,
            lambda,
            stored: None,
        }
    }
}

impl Move for ScaleMove {
    fn core(&self) -> &MoveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MoveCore {
        &mut self.core
    }

    fn propose_edit(
        &mut self,
        model: &mut Model,
        rng: &mut RngHandle,
    ) -> Result<Proposal, AdmixError> {
        let target = single_target(&self.core)?;
        let value = model.real(target)?;
        let factor = (self.lambda * (rng.uniform01() - 0.5)).exp();
        self.stored = Some(value);
        model.set_value(target, value * factor)?;
        Ok(Proposal::new(factor.ln()))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let value = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        model.set_value(target, value)
    }

    fn tune(&mut self, rate: f64) {
        self.lambda = self.core.tuned_step(self.lambda, rate);
    }

    fn tuning_parameter(&self) -> Option<f64> {
        Some(self.lambda)
    }

    fn set_tuning_parameter(&mut self, value: f64) {
        self.lambda = value;
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}

/// Adds a uniform offset from `(-delta / 2, delta / 2)` to a real.
#[derive(Debug, Clone)]
pub struct SlideMove {
    core: MoveCore,
    delta: f64,
    stored: Option<f64>,
}

impl SlideMove {
    /// Slide move on `target` with window `delta`.
    pub fn new(target: VariableId, delta: f64, weight: f64) -> Self {
        Self::with_core(MoveCore::new("slide", vec![target], weight), delta)
    }

    /// Slide move with a custom core.
    pub fn with_core(core: MoveCore, delta: f64) -> Self {
        Self {
            core,
            delta,
            stored: None,
        }
    }
}

impl Move for SlideMove {
    fn core(&self) -> &MoveCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MoveCore {
        &mut self.core
    }

    fn propose_edit(
        &mut self,
        model: &mut Model,
        rng: &mut RngHandle,
    ) -> Result<Proposal, AdmixError> {
        let target = single_target(&self.core)?;
        let value = model.real(target)?;
        let offset = self.delta * (rng.uniform01() - 0.5);
        self.stored = Some(value);
        model.set_value(target, value + offset)?;
        Ok(Proposal::new(0.0))
    }

    fn revert_edit(&mut self, model: &mut Model) -> Result<(), AdmixError> {
        let target = single_target(&self.core)?;
        let value = self.stored.take().ok_or_else(|| missing_record(&self.core))?;
        model.set_value(target, value)
    }

    fn tune(&mut self, rate: f64) {
        self.delta = self.core.tuned_step(self.delta, rate);
    }

    fn tuning_parameter(&self) -> Option<f64> {
        Some(self.delta)
    }

    fn set_tuning_parameter(&mut self, value: f64) {
        self.delta = value;
    }

    fn box_clone(&self) -> Box<dyn Move> {
        Box::new(self.clone())
    }
}
