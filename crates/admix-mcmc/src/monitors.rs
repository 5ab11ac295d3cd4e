//! Monitors receive committed chain state at keep boundaries.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use admix_core::errors::{AdmixError, ErrorInfo};
use admix_core::{NodeId, VariableId};
use admix_dag::{Model, Value};
use admix_tree::AdmixtureTree;
use log::info;
use serde::{Deserialize, Serialize};

/// Read-only view of a chain handed to monitors.
#[derive(Debug, Clone, Copy)]
pub struct ChainView<'a> {
    /// Committed model.
    pub model: &'a Model,
    /// Unheated log-posterior.
    pub ln_posterior: f64,
    /// Heat of the chain.
    pub heat: f64,
    /// Index of the chain within its ensemble.
    pub chain_index: usize,
}

impl ChainView<'_> {
    /// Summed log-probability of clamped variables.
    pub fn ln_likelihood(&self) -> f64 {
        self.partial_sum(true)
    }

    /// Summed log-probability of unclamped stochastic variables.
    pub fn ln_prior(&self) -> f64 {
        self.partial_sum(false)
    }

    fn partial_sum(&self, clamped: bool) -> f64 {
        self.model
            .stochastic_ids()
            .into_iter()
            .filter(|&id| self.model.is_clamped(id).unwrap_or(false) == clamped)
            .map(|id| self.model.committed_ln_probability(id).unwrap_or(f64::NAN))
            .sum()
    }
}

/// Receives chain state every `interval` generations.
pub trait Monitor: Send {
    /// Reporting cadence in generations; zero disables the monitor.
    fn interval(&self) -> u64;

    /// Acquires resources before a run.
    fn open(&mut self) -> Result<(), AdmixError> {
        Ok(())
    }

    /// Writes column headers. Called once, before the first report.
    fn print_header(&mut self, view: &ChainView<'_>) -> Result<(), AdmixError>;

    /// Records the state at `generation`.
    fn report(&mut self, generation: u64, view: &ChainView<'_>) -> Result<(), AdmixError>;

    /// Flushes and releases resources after a run.
    fn close(&mut self) -> Result<(), AdmixError> {
        Ok(())
    }

    /// Whether `generation` falls on the reporting cadence.
    fn is_due(&self, generation: u64) -> bool {
        let interval = self.interval();
        interval > 0 && generation % interval == 0
    }
}

fn io_error(code: &str, path: &Path, err: std::io::Error) -> AdmixError {
    AdmixError::Serde(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

fn column_names(model: &Model, variables: &[VariableId]) -> Result<Vec<String>, AdmixError> {
    let mut columns = Vec::new();
    for &id in variables {
        let name = model.name(id)?;
        match model.committed(id)? {
            Value::RealVector(values) => {
                columns.extend((1..=values.len()).map(|idx| format!("{name}[{idx}]")));
            }
            _ => columns.push(name.to_string()),
        }
    }
    Ok(columns)
}

fn render_value(value: &Value) -> Result<String, AdmixError> {
    Ok(match value {
        Value::Real(x) => x.to_string(),
        Value::Integer(k) => k.to_string(),
        Value::RealVector(values) => values
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join("\t"),
        Value::Tree(tree) => tree.to_extended_newick()?,
    })
}

struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    created: bool,
}

impl FileSink {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: None,
            created: false,
        }
    }

    /// Truncates on the first open and appends afterwards.
    fn open(&mut self) -> Result<(), AdmixError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| io_error("monitor-open", &self.path, err))?;
            }
        }
        let file = if self.created {
            OpenOptions::new().append(true).open(&self.path)
        } else {
            File::create(&self.path)
        }
        .map_err(|err| io_error("monitor-open", &self.path, err))?;
        self.created = true;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), AdmixError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            AdmixError::Chain(
                ErrorInfo::new("monitor-closed", "monitor written before open")
                    .with_context("path", self.path.display().to_string()),
            )
        })?;
        writeln!(writer, "{line}").map_err(|err| io_error("monitor-write", &self.path, err))
    }

    fn close(&mut self) -> Result<(), AdmixError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|err| io_error("monitor-write", &self.path, err))?;
        }
        Ok(())
    }
}

/// Tab-separated trace of the posterior, its split and selected variables.
pub struct FileMonitor {
    sink: FileSink,
    interval: u64,
    variables: Vec<VariableId>,
}

impl FileMonitor {
    /// Trace of `variables` written to `path` every `interval` generations.
    pub fn new(path: impl Into<PathBuf>, interval: u64, variables: Vec<VariableId>) -> Self {
        Self {
            sink: FileSink::new(path.into()),
            interval,
            variables,
        }
    }
}

impl Monitor for FileMonitor {
    fn interval(&self) -> u64 {
        self.interval
    }

    fn open(&mut self) -> Result<(), AdmixError> {
        self.sink.open()
    }

    fn print_header(&mut self, view: &ChainView<'_>) -> Result<(), AdmixError> {
        let mut columns = vec![
            "Iteration".to_string(),
            "Posterior".to_string(),
            "Likelihood".to_string(),
            "Prior".to_string(),
        ];
        columns.extend(column_names(view.model, &self.variables)?);
        self.sink.write_line(&columns.join("\t"))
    }

    fn report(&mut self, generation: u64, view: &ChainView<'_>) -> Result<(), AdmixError> {
        let mut fields = vec![
            generation.to_string(),
            view.ln_posterior.to_string(),
            view.ln_likelihood().to_string(),
            view.ln_prior().to_string(),
        ];
        for &id in &self.variables {
            fields.push(render_value(view.model.committed(id)?)?);
        }
        self.sink.write_line(&fields.join("\t"))
    }

    fn close(&mut self) -> Result<(), AdmixError> {
        self.sink.close()
    }
}

/// Trace of a tree variable as extended Newick with admixture descriptors.
pub struct TreeMonitor {
    sink: FileSink,
    interval: u64,
    tree: VariableId,
}

impl TreeMonitor {
    /// Tree trace of `tree` written to `path` every `interval` generations.
    pub fn new(path: impl Into<PathBuf>, interval: u64, tree: VariableId) -> Self {
        Self {
            sink: FileSink::new(path.into()),
            interval,
            tree,
        }
    }
}

impl Monitor for TreeMonitor {
    fn interval(&self) -> u64 {
        self.interval
    }

    fn open(&mut self) -> Result<(), AdmixError> {
        self.sink.open()
    }

    fn print_header(&mut self, _view: &ChainView<'_>) -> Result<(), AdmixError> {
        self.sink.write_line("Iteration\tPosterior\tTree")
    }

    fn report(&mut self, generation: u64, view: &ChainView<'_>) -> Result<(), AdmixError> {
        let newick = view.model.tree(self.tree)?.to_extended_newick()?;
        self.sink
            .write_line(&format!("{generation}\t{}\t{newick}", view.ln_posterior))
    }

    fn close(&mut self) -> Result<(), AdmixError> {
        self.sink.close()
    }
}

/// Clade and admixture-pair counts accumulated by a [`BipartitionMonitor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BipartitionCounts {
    /// Trees counted.
    pub samples: u64,
    /// Occurrences keyed by clade bitstring, or `source,destination` for admixture pairs.
    pub counts: BTreeMap<String, u64>,
}

impl BipartitionCounts {
    /// Share of counted trees containing `key`.
    pub fn frequency(&self, key: &str) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.counts.get(key).copied().unwrap_or(0) as f64 / self.samples as f64
    }

    /// Every key with its frequency, most frequent first.
    pub fn frequencies(&self) -> Vec<(String, f64)> {
        let mut rows: Vec<(String, f64)> = self
            .counts
            .keys()
            .map(|key| (key.clone(), self.frequency(key)))
            .collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }
}

/// Shared handle to the counts of a [`BipartitionMonitor`].
#[derive(Debug, Clone, Default)]
pub struct BipartitionHandle(Arc<Mutex<BipartitionCounts>>);

impl BipartitionHandle {
    fn lock(&self) -> MutexGuard<'_, BipartitionCounts> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the counts so far.
    pub fn snapshot(&self) -> BipartitionCounts {
        self.lock().clone()
    }
}

fn tip_bits(tree: &AdmixtureTree, id: NodeId) -> Result<String, AdmixError> {
    let below: BTreeSet<NodeId> = tree.descendant_tips(id)?.into_iter().collect();
    Ok(tree
        .tips()
        .iter()
        .map(|tip| if below.contains(tip) { '1' } else { '0' })
        .collect())
}

/// Output fields of one tree and the keys it contributes to the counts.
fn bipartition_fields(
    tree: &AdmixtureTree,
) -> Result<(Vec<String>, BTreeSet<String>), AdmixError> {
    let mut fields = Vec::new();
    let mut keys = BTreeSet::new();
    for id in tree.divergence_nodes() {
        let clade = tip_bits(tree, id)?;
        fields.push(format!("{clade},,{}", tree.age(id)?));
        if id != tree.root() {
            keys.insert(clade);
        }
    }
    for parent in tree.admixture_parents() {
        let Some(child) = tree.node(parent)?.admixture_child() else {
            continue;
        };
        let source = tip_bits(tree, parent)?;
        let destination = tip_bits(tree, child)?;
        fields.push(format!(
            "{source},{destination},{},{}",
            tree.age(parent)?,
            tree.node(child)?.weight()
        ));
        keys.insert(format!("{source},{destination}"));
    }
    Ok((fields, keys))
}

/// Tip bipartitions of a tree variable, one line per sample.
///
/// Divergences are written as `clade,,age` and admixture edges as
/// `source,destination,age,weight`, where each clade is a bitstring over the
/// tips in tree order. Non-root clades and admixture pairs are counted; the
/// counts stay readable through [`BipartitionMonitor::handle`].
pub struct BipartitionMonitor {
    sink: FileSink,
    interval: u64,
    tree: VariableId,
    counts: BipartitionHandle,
}

impl BipartitionMonitor {
    /// Bipartitions of `tree` written to `path` every `interval` generations.
    pub fn new(path: impl Into<PathBuf>, interval: u64, tree: VariableId) -> Self {
        Self {
            sink: FileSink::new(path.into()),
            interval,
            tree,
            counts: BipartitionHandle::default(),
        }
    }

    /// Handle for reading the counts after the monitor moved into a chain.
    pub fn handle(&self) -> BipartitionHandle {
        self.counts.clone()
    }
}

impl Monitor for BipartitionMonitor {
    fn interval(&self) -> u64 {
        self.interval
    }

    fn open(&mut self) -> Result<(), AdmixError> {
        self.sink.open()
    }

    fn print_header(&mut self, _view: &ChainView<'_>) -> Result<(), AdmixError> {
        self.sink.write_line("Iteration\tPosterior\tBipartitions")
    }

    fn report(&mut self, generation: u64, view: &ChainView<'_>) -> Result<(), AdmixError> {
        let (fields, keys) = bipartition_fields(view.model.tree(self.tree)?)?;
        {
            let mut counts = self.counts.lock();
            counts.samples += 1;
            for key in keys {
                *counts.counts.entry(key).or_insert(0) += 1;
            }
        }
        self.sink.write_line(&format!(
            "{generation}\t{}\t{}",
            view.ln_posterior,
            fields.join("\t")
        ))
    }

    fn close(&mut self) -> Result<(), AdmixError> {
        self.sink.close()
    }
}

/// Logs a compact progress line through the `log` facade.
pub struct ScreenMonitor {
    interval: u64,
    variables: Vec<VariableId>,
}

impl ScreenMonitor {
    /// Progress line every `interval` generations including `variables`.
    pub fn new(interval: u64, variables: Vec<VariableId>) -> Self {
        Self {
            interval,
            variables,
        }
    }
}

impl Monitor for ScreenMonitor {
    fn interval(&self) -> u64 {
        self.interval
    }

    fn print_header(&mut self, view: &ChainView<'_>) -> Result<(), AdmixError> {
        let mut columns = vec!["Iteration".to_string(), "Posterior".to_string()];
        columns.extend(column_names(view.model, &self.variables)?);
        info!("{}", columns.join("  "));
        Ok(())
    }

    fn report(&mut self, generation: u64, view: &ChainView<'_>) -> Result<(), AdmixError> {
        let mut fields = vec![generation.to_string(), format!("{:.4}", view.ln_posterior)];
        for &id in &self.variables {
            let value = view.model.committed(id)?;
            fields.push(match value.elements() {
                Some(elements) => elements
                    .iter()
                    .map(|x| format!("{x:.4}"))
                    .collect::<Vec<_>>()
                    .join("  "),
                None => render_value(value)?,
            });
        }
        info!("{}", fields.join("  "));
        Ok(())
    }
}

/// One recorded generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSample {
    /// Generation of the sample.
    pub generation: u64,
    /// Unheated log-posterior.
    pub ln_posterior: f64,
    /// Real elements of the recorded variables, flattened.
    pub values: Vec<f64>,
}

/// Samples collected by a [`TraceRecorder`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Column names matching [`TraceSample::values`].
    pub names: Vec<String>,
    /// Samples in generation order.
    pub samples: Vec<TraceSample>,
}

impl Trace {
    /// Values of one column.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.names.iter().position(|column| column == name)?;
        Some(
            self.samples
                .iter()
                .filter_map(|sample| sample.values.get(idx).copied())
                .collect(),
        )
    }
}

/// Shared handle to the samples of a [`TraceRecorder`] that outlives the chain.
#[derive(Debug, Clone, Default)]
pub struct TraceHandle(Arc<Mutex<Trace>>);

impl TraceHandle {
    fn lock(&self) -> MutexGuard<'_, Trace> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Trace {
        self.lock().clone()
    }
}

/// In-memory monitor of real-valued variables; trees contribute their length.
pub struct TraceRecorder {
    interval: u64,
    variables: Vec<VariableId>,
    trace: TraceHandle,
}

impl TraceRecorder {
    /// Records `variables` every `interval` generations.
    pub fn new(interval: u64, variables: Vec<VariableId>) -> Self {
        Self {
            interval,
            variables,
            trace: TraceHandle::default(),
        }
    }

    /// Handle for reading the samples after the recorder moved into a chain.
    pub fn handle(&self) -> TraceHandle {
        self.trace.clone()
    }
}

fn recorded_elements(value: &Value) -> Vec<f64> {
    match value {
        Value::Tree(tree) => vec![tree.tree_length()],
        other => other.elements().unwrap_or_default(),
    }
}

impl Monitor for TraceRecorder {
    fn interval(&self) -> u64 {
        self.interval
    }

    fn print_header(&mut self, view: &ChainView<'_>) -> Result<(), AdmixError> {
        self.trace.lock().names = column_names(view.model, &self.variables)?;
        Ok(())
    }

    fn report(&mut self, generation: u64, view: &ChainView<'_>) -> Result<(), AdmixError> {
        let mut values = Vec::new();
        for &id in &self.variables {
            values.extend(recorded_elements(view.model.committed(id)?));
        }
        self.trace.lock().samples.push(TraceSample {
            generation,
            ln_posterior: view.ln_posterior,
            values,
        });
        Ok(())
    }
}
