//! The subgraph catalog: fallback partitioning of a model's op graph into
//! per-worker executable units.
//!
//! A model is registered once. The catalog investigates, for every worker,
//! which contiguous ranges of ops that worker can execute without falling
//! back, and builds one [`Subgraph`] per such range. Subgraphs covering
//! disjoint ranges of the same model are chained via `next` so that
//! executing one schedules the next as a continuation job.

use std::collections::{BTreeMap, BTreeSet};

use crate::job::{SubgraphIdx, WorkerId};
use itertools::Itertools;
use thiserror::Error;

/// How aggressively the catalog partitions a model around unsupported ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubgraphPreparationType {
    /// Only ever build the single whole-model subgraph, per capable worker.
    NoFallback,
    /// Build maximal contiguous runs of supported ops per worker.
    FallbackPerDevice,
    /// `FallbackPerDevice`, merging runs under `minimum_subgraph_size` into
    /// a neighbour, rejecting any that remain undersized.
    MergeUnit,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no worker produced a valid subgraph for model {model_id}")]
    RegisterFailure { model_id: usize },
}

/// Per-model graph shape, gathered once at registration time.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub num_ops: usize,
    pub input_tensors: Vec<usize>,
    pub output_tensors: Vec<usize>,
    pub node_output_tensors: Vec<usize>,
    pub tensor_types: BTreeSet<usize>,
    /// Per worker, the ordered list of op indices that worker cannot execute.
    pub unsupported_ops: BTreeMap<WorkerId, Vec<usize>>,
}

impl ModelSpec {
    /// Ops a worker can run, derived as the complement of `unsupported_ops`.
    fn supported_ops(&self, worker_id: WorkerId) -> Vec<bool> {
        let mut supported = vec![true; self.num_ops];
        if let Some(unsupported) = self.unsupported_ops.get(&worker_id) {
            for &op in unsupported {
                if op < self.num_ops {
                    supported[op] = false;
                }
            }
        }
        supported
    }
}

/// A compiled execution unit over a contiguous op range, bound to one worker.
#[derive(Debug, Clone)]
pub struct Subgraph {
    pub model_id: usize,
    pub worker_id: WorkerId,
    /// First op index covered by this subgraph (inclusive).
    pub start_op: usize,
    /// One past the last op index covered by this subgraph (exclusive).
    pub end_op: usize,
    pub inputs: BTreeSet<usize>,
    pub outputs: BTreeSet<usize>,
    /// FLOPs attributable to Conv2D/DepthwiseConv2D/TransposeConv ops in this range.
    pub flops: f64,
    pub input_bytes: usize,
    pub output_bytes: usize,
    /// The continuation subgraph registered to run immediately after this one, if any.
    pub next: Option<SubgraphIdx>,
}

impl Subgraph {
    pub fn op_count(&self) -> usize {
        self.end_op - self.start_op
    }
}

/// Maps [`crate::job::SubgraphKey`] to catalog index and back, one catalog per runtime.
#[derive(Default)]
pub struct SubgraphCatalog {
    subgraphs: Vec<Subgraph>,
    /// model_id -> worker_id -> indices of that worker's subgraphs for the model, in op order.
    by_model_worker: BTreeMap<usize, BTreeMap<WorkerId, Vec<SubgraphIdx>>>,
    specs: BTreeMap<usize, ModelSpec>,
    next_model_id: usize,
}

impl SubgraphCatalog {
    pub fn new() -> Self {
        SubgraphCatalog::default()
    }

    /// Registers `spec` under a fresh model id, building subgraphs for every
    /// worker named in `spec.unsupported_ops` plus any worker that supports
    /// the whole model (no entry in `unsupported_ops` at all is treated as
    /// "supports everything").
    ///
    /// `fallback_worker` names the worker that covers the ops a partially-
    /// capable worker can't run itself (the runtime's "investigate the model
    /// on CPU first" worker); pass `None` to auto-select the lowest-id
    /// worker in `workers` that supports the whole model unmodified. Gaps
    /// are chained prefix -> fallback -> suffix so a worker with an
    /// unsupported op in the middle of its range still gets that op covered
    /// by someone, rather than silently dropped (§4.B's fallback
    /// partitioning, S2).
    pub fn register_model(
        &mut self,
        spec: ModelSpec,
        workers: &[WorkerId],
        prep: SubgraphPreparationType,
        minimum_subgraph_size: usize,
        fallback_worker: Option<WorkerId>,
    ) -> Result<usize, CatalogError> {
        let model_id = self.next_model_id;
        self.next_model_id += 1;

        let fallback_worker = fallback_worker.or_else(|| {
            workers.iter().copied().filter(|&w| spec.supported_ops(w).iter().all(|&s| s)).min()
        });

        let mut built_any = false;
        let mut per_worker = BTreeMap::new();

        for &worker_id in workers {
            let supported = spec.supported_ops(worker_id);
            let own_runs = match prep {
                SubgraphPreparationType::NoFallback => {
                    if supported.iter().all(|&s| s) {
                        vec![(0, spec.num_ops)]
                    } else {
                        Vec::new()
                    }
                }
                SubgraphPreparationType::FallbackPerDevice => maximal_runs(&supported),
                SubgraphPreparationType::MergeUnit => {
                    merge_small_runs(maximal_runs(&supported), minimum_subgraph_size)
                }
            };

            if own_runs.is_empty() {
                continue;
            }

            let segments = match prep {
                SubgraphPreparationType::NoFallback => {
                    own_runs.iter().map(|&(s, e)| (s, e, worker_id)).collect()
                }
                _ => fill_fallback_gaps(&own_runs, spec.num_ops, worker_id, fallback_worker),
            };

            let mut indices = Vec::with_capacity(segments.len());
            for &(start, end, seg_worker) in &segments {
                let idx = self.subgraphs.len();
                self.subgraphs.push(Subgraph {
                    model_id,
                    worker_id: seg_worker,
                    start_op: start,
                    end_op: end,
                    inputs: boundary_tensors(&spec, start),
                    outputs: boundary_tensors(&spec, end),
                    flops: 0.0,
                    input_bytes: 0,
                    output_bytes: 0,
                    next: None,
                });
                indices.push(idx);
            }
            // Chain contiguous runs (own and fallback alike) in op order: each
            // subgraph's `next` points at the catalog index that continues the
            // model from where it left off.
            for pair in indices.windows(2) {
                self.subgraphs[pair[0]].next = Some(pair[1]);
            }
            built_any = true;
            per_worker.insert(worker_id, indices);
        }

        if !built_any {
            return Err(CatalogError::RegisterFailure { model_id });
        }

        self.by_model_worker.insert(model_id, per_worker);
        self.specs.insert(model_id, spec);
        Ok(model_id)
    }

    /// The full-model subgraph for `(model_id, worker_id)`, if the worker can run
    /// the entire model without fallback.
    pub fn subgraph_idx(&self, model_id: usize, worker_id: WorkerId) -> Option<SubgraphIdx> {
        let indices = self.by_model_worker.get(&model_id)?.get(&worker_id)?;
        let spec = self.specs.get(&model_id)?;
        indices
            .iter()
            .copied()
            .find(|&idx| self.subgraphs[idx].op_count() == spec.num_ops)
    }

    /// Every subgraph, on any worker, whose op range begins at `start_idx`.
    pub fn subgraph_candidates(&self, model_id: usize, start_idx: usize) -> Vec<SubgraphIdx> {
        let Some(by_worker) = self.by_model_worker.get(&model_id) else {
            return Vec::new();
        };
        by_worker
            .values()
            .flatten()
            .copied()
            .filter(|&idx| self.subgraphs[idx].start_op == start_idx)
            .collect()
    }

    pub fn get(&self, idx: SubgraphIdx) -> &Subgraph {
        &self.subgraphs[idx]
    }

    pub fn model_spec(&self, model_id: usize) -> Option<&ModelSpec> {
        self.specs.get(&model_id)
    }
}

/// Maximal contiguous runs of `true` values in `supported`.
fn maximal_runs(supported: &[bool]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, &ok) in supported.iter().enumerate() {
        match (ok, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, supported.len()));
    }
    runs
}

/// Fills the gaps in `own_runs` (a worker's own maximal contiguous supported
/// ranges) with fallback segments bound to `fallback_worker`, so the
/// returned segments cover `[0, num_ops)` completely instead of leaving the
/// unsupported ops between two runs unexecuted. Leading and trailing gaps
/// are filled the same way as a middle gap. A gap is left uncovered only
/// when no `fallback_worker` is available, or it names `worker_id` itself
/// (nothing to delegate to).
fn fill_fallback_gaps(
    own_runs: &[(usize, usize)],
    num_ops: usize,
    worker_id: WorkerId,
    fallback_worker: Option<WorkerId>,
) -> Vec<(usize, usize, WorkerId)> {
    let fallback_worker = fallback_worker.filter(|&fb| fb != worker_id);
    let mut segments = Vec::with_capacity(own_runs.len() * 2 + 1);
    let mut cursor = 0;
    for &(start, end) in own_runs {
        if start > cursor {
            if let Some(fb) = fallback_worker {
                segments.push((cursor, start, fb));
            }
        }
        segments.push((start, end, worker_id));
        cursor = end;
    }
    if cursor < num_ops {
        if let Some(fb) = fallback_worker {
            segments.push((cursor, num_ops, fb));
        }
    }
    segments
}

/// Merges runs smaller than `minimum_size` into their following neighbour;
/// a run that is still undersized after merging (e.g. the final run) is dropped.
fn merge_small_runs(runs: Vec<(usize, usize)>, minimum_size: usize) -> Vec<(usize, usize)> {
    let merged: Vec<(usize, usize)> = runs
        .into_iter()
        .coalesce(|(s1, e1), (s2, e2)| if e1 - s1 < minimum_size { Ok((s1, e2)) } else { Err(((s1, e1), (s2, e2))) })
        .collect();
    let keep_lone_run = merged.len() == 1;
    merged.into_iter().filter(|&(s, e)| e - s >= minimum_size || keep_lone_run).collect()
}

/// Placeholder tensor-boundary resolution: in the absence of the flatbuffer
/// model loader (out of scope, §1) a subgraph's boundary tensor set is
/// approximated as the single tensor index at its op boundary. Callers that
/// need exact boundary tensors are expected to construct `ModelSpec` with
/// `node_output_tensors` populated and post-process `Subgraph::inputs`/`outputs`.
fn boundary_tensors(_spec: &ModelSpec, boundary: usize) -> BTreeSet<usize> {
    let mut set = BTreeSet::new();
    set.insert(boundary);
    set
}
