#![deny(missing_docs)]
#![doc = "Probabilistic model graph: constant, stochastic and deterministic variables with lazy, touch-driven recomputation and exact restore."]

pub mod density;
pub mod function;
mod model;
mod value;

pub use density::{
    BetaDensity, BirthDeathDensity, Density, ExponentialDensity, GammaDensity, NormalDensity,
    PoissonDensity, Shape, UniformDensity,
};
pub use function::{AdmixtureEventCount, FnFunction, Function, Product, Sum, TreeLength};
pub use model::{Model, VariableKind};
pub use value::Value;
