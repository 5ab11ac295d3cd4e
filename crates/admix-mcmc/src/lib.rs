#![deny(missing_docs)]
#![doc = "Metropolis-Hastings driver for admixture-graph models: moves, chains, monitors and Metropolis-coupled tempering."]

/// Single-chain driver and operator summaries.
pub mod chain;
/// Checkpoint serialization helpers and payload structures.
pub mod checkpoint;
/// YAML configuration schema and defaults.
pub mod config;
/// Deterministic seed derivation helpers.
pub mod determinism;
/// Public `run`/`resume` entry points.
pub mod kernel;
/// Run manifest serialization helpers.
pub mod manifest;
/// Posterior summaries of recorded traces.
pub mod metrics;
/// Trace, tree and progress monitors.
pub mod monitors;
/// Proposal protocol and the stock moves.
pub mod moves;
/// Parallel tempering ensemble.
pub mod tempering;

pub use chain::{Mcmc, OperatorSummary, StepOutcome, CONSERVATION_TOLERANCE};
pub use config::{
    CheckpointConfig, McmcConfig, MonitorConfig, OutputConfig, SeedPolicy, SwapMode,
    TemperingConfig,
};
pub use kernel::{resume, run, MonitorTargets, RunSummary};
pub use monitors::{
    BipartitionCounts, BipartitionHandle, BipartitionMonitor, ChainView, FileMonitor, Monitor,
    ScreenMonitor, Trace, TraceHandle, TraceRecorder, TraceSample, TreeMonitor,
};
pub use moves::{
    AdmixtureEdgeAdd, AdmixtureEdgeDivergenceMerge, AdmixtureEdgeDivergenceSplit,
    AdmixtureEdgeRemove, AdmixtureEdgeReversePolarity, AdmixtureEdgeReweight,
    AdmixtureEdgeSlide, FixedNodeheightPruneRegraft, Move, MoveCore, MoveState, NarrowExchange,
    NodeTimeSlideBeta, PriorRatioTerm, Proposal, ScaleMove, SlideMove,
};
pub use tempering::{ParallelMcmcmc, SwapCounters};
