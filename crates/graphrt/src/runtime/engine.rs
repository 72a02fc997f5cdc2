use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::backend::{
    Backend, BackendError, BackendId, BackendRegistry, Workload, WorkloadDescriptor,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::graph::{Graph, InputSlotRef, LayerId, LayerKind, OutputSlotRef};
use crate::memory::{plan_buffers, BufferPlan, MemoryManager, TensorHandle};
use crate::optimizer::{OptimizeConfig, OptimizeContext, Optimizer};
use crate::profiling::{Profiler, ProfilingReport};
use crate::tensor::HostTensor;

/// Lifecycle of an [`ExecutionEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unbuilt,
    Built,
    Ready,
    Running,
    Completed,
    Failed,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Unbuilt => "unbuilt",
            EngineState::Built => "built",
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::Completed => "completed",
            EngineState::Failed => "failed",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ExecStep {
    layer: LayerId,
    name: String,
    backend: BackendId,
    kind: LayerKind,
    inputs: Vec<OutputSlotRef>,
    outputs: Vec<OutputSlotRef>,
    workload: Option<Box<dyn Workload>>,
}

struct Binding {
    id: u32,
    slot: OutputSlotRef,
}

struct BuiltGraph {
    steps: Vec<ExecStep>,
    plan: BufferPlan,
    memory: MemoryManager,
    inputs: Vec<Binding>,
    outputs: Vec<Binding>,
    constants: Vec<LayerId>,
}

/// Owns one graph from optimization through repeated execution.
///
/// Execution is single-threaded at the graph level: workloads run one at a time in
/// topological order, and backends may parallelize inside a workload.
pub struct ExecutionEngine {
    graph: Graph,
    backends: Vec<Arc<dyn Backend>>,
    config: EngineConfig,
    profiler: Arc<Profiler>,
    state: EngineState,
    built: Option<BuiltGraph>,
    dispatch: Vec<LayerId>,
    last_report: Option<ProfilingReport>,
}

impl ExecutionEngine {
    /// Captures the candidate backends named by `config` (or all, by priority).
    pub fn new(graph: Graph, registry: &BackendRegistry, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let backends = registry.ordered(&config.backend_preferences)?;
        Ok(Self {
            graph,
            backends,
            config,
            profiler: Profiler::global(),
            state: EngineState::Unbuilt,
            built: None,
            dispatch: Vec::new(),
            last_report: None,
        })
    }

    /// Records into `profiler` instead of the process-wide one.
    pub fn with_profiler(mut self, profiler: Arc<Profiler>) -> Self {
        self.profiler = profiler;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn buffer_plan(&self) -> Option<&BufferPlan> {
        self.built.as_ref().map(|built| &built.plan)
    }

    pub fn memory(&self) -> Option<&MemoryManager> {
        self.built.as_ref().map(|built| &built.memory)
    }

    /// Layers executed by the most recent run, in dispatch order.
    pub fn dispatch_order(&self) -> &[LayerId] {
        &self.dispatch
    }

    /// Timings of the most recent profiled run.
    pub fn profiling_report(&self) -> Option<&ProfilingReport> {
        self.last_report.as_ref()
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            state: self.state.as_str(),
            operation,
        }
    }

    fn backend(&self, id: BackendId) -> Result<&Arc<dyn Backend>> {
        self.backends
            .iter()
            .find(|backend| backend.id() == id)
            .ok_or_else(|| Error::Config(format!("backend {id} is not available")))
    }

    /// Optimizes the graph, plans memory and allocates every buffer.
    pub fn build(&mut self) -> Result<()> {
        if self.state != EngineState::Unbuilt {
            return Err(self.invalid("build"));
        }

        let mut cx = OptimizeContext::new(self.backends.clone(), OptimizeConfig::from(&self.config));
        let stats = Optimizer::new(cx.config).optimize(&mut self.graph, &mut cx)?;
        let (Some(order), Some(lifetimes)) = (cx.order.take(), cx.lifetimes.take()) else {
            return Err(Error::graph_invalid("optimizer did not plan tensor lifetimes"));
        };

        let plan = plan_buffers(&self.graph, &lifetimes, |id| {
            self.backend(id)
                .map(|backend| backend.allocator().alignment())
                .unwrap_or(1)
        })?;
        let memory = MemoryManager::allocate(
            &plan,
            |id| self.backend(id).ok().map(|backend| backend.allocator()),
            self.config.memory_limit_bytes,
        )?;

        let mut used = HashSet::new();
        let mut steps = Vec::new();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut constants = Vec::new();
        for id in &order {
            let Some(layer) = self.graph.layer(*id) else {
                continue;
            };
            match layer.kind() {
                LayerKind::Input { binding } => inputs.push(Binding {
                    id: *binding,
                    slot: layer.output_ref(0),
                }),
                LayerKind::Output { binding } => {
                    let producer = self
                        .graph
                        .producer_of(InputSlotRef::new(*id, 0))
                        .ok_or_else(|| {
                            Error::graph_invalid(format!("{} is not connected", layer.name()))
                        })?;
                    outputs.push(Binding {
                        id: *binding,
                        slot: producer,
                    });
                }
                LayerKind::Constant { .. } => constants.push(*id),
                kind => {
                    let backend = layer.backend().ok_or_else(|| {
                        Error::graph_invalid(format!("{} has no backend assigned", layer.name()))
                    })?;
                    used.insert(backend);
                    steps.push(ExecStep {
                        layer: *id,
                        name: layer.name().to_string(),
                        backend,
                        kind: kind.clone(),
                        inputs: layer
                            .inputs()
                            .iter()
                            .filter_map(|slot| slot.connection())
                            .collect(),
                        outputs: (0..layer.outputs().len())
                            .map(|index| layer.output_ref(index))
                            .collect(),
                        workload: None,
                    });
                }
            }
        }
        inputs.sort_by_key(|binding| binding.id);
        outputs.sort_by_key(|binding| binding.id);

        if let Some(threads) = self.config.thread_count {
            for id in &used {
                self.backend(*id)?.scheduler().current().set_thread_count(threads);
            }
        }

        tracing::info!(
            layers = self.graph.len(),
            workloads = steps.len(),
            buffers = plan.slots.len(),
            tensors = plan.buffers.len(),
            peak_bytes = memory.peak_bytes(),
            rewrites = stats.rewrites_applied,
            "graph built"
        );

        self.built = Some(BuiltGraph {
            steps,
            plan,
            memory,
            inputs,
            outputs,
            constants,
        });
        self.upload_constants()?;
        self.state = EngineState::Built;
        Ok(())
    }

    fn upload_constants(&self) -> Result<()> {
        let Some(built) = self.built.as_ref() else {
            return Ok(());
        };
        for id in &built.constants {
            let Some(LayerKind::Constant { tensor }) = self.graph.layer(*id).map(|l| l.kind()) else {
                continue;
            };
            let handle = built
                .memory
                .handle(OutputSlotRef::new(*id, 0))
                .ok_or_else(|| Error::graph_invalid(format!("constant {id} has no buffer")))?;
            handle
                .copy_from_bytes(tensor.bytes())
                .map_err(|source| Error::WorkloadExecutionFailure {
                    layer: format!("constant {id}"),
                    backend: handle.backend(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Validates and copies caller tensors into the graph inputs.
    ///
    /// Every input binding must be supplied exactly once. Nothing is copied unless all
    /// bindings validate.
    pub fn bind_inputs(&mut self, tensors: &[(u32, HostTensor)]) -> Result<()> {
        if !matches!(
            self.state,
            EngineState::Built | EngineState::Ready | EngineState::Completed
        ) {
            return Err(self.invalid("bind inputs"));
        }
        let Some(built) = self.built.as_ref() else {
            return Err(self.invalid("bind inputs"));
        };

        let mut staged: Vec<(&TensorHandle, &HostTensor)> = Vec::with_capacity(tensors.len());
        let mut seen = HashSet::new();
        for (binding, tensor) in tensors {
            if !seen.insert(*binding) {
                return Err(Error::BindingMismatch {
                    binding: *binding,
                    detail: "bound more than once".to_string(),
                });
            }
            let slot = built
                .inputs
                .iter()
                .find(|input| input.id == *binding)
                .ok_or_else(|| Error::BindingMismatch {
                    binding: *binding,
                    detail: "no graph input has this binding".to_string(),
                })?
                .slot;
            let handle = built.memory.handle(slot).ok_or_else(|| {
                Error::graph_invalid(format!("input binding {binding} has no buffer"))
            })?;
            let expected = handle.info();
            if tensor.data_type() != expected.data_type {
                return Err(Error::TypeMismatch {
                    binding: *binding,
                    expected: expected.data_type,
                    actual: tensor.data_type(),
                });
            }
            if tensor.info().shape != expected.shape {
                return Err(Error::BindingMismatch {
                    binding: *binding,
                    detail: format!(
                        "expected shape {}, got {}",
                        expected.shape,
                        tensor.info().shape
                    ),
                });
            }
            if tensor.as_bytes().len() != handle.byte_len() {
                return Err(Error::BindingMismatch {
                    binding: *binding,
                    detail: format!(
                        "expected {} bytes, got {}",
                        handle.byte_len(),
                        tensor.as_bytes().len()
                    ),
                });
            }
            staged.push((handle, tensor));
        }
        if let Some(missing) = built.inputs.iter().find(|input| !seen.contains(&input.id)) {
            return Err(Error::BindingMismatch {
                binding: missing.id,
                detail: "input was not supplied".to_string(),
            });
        }

        for (handle, tensor) in staged {
            handle.write(|dst| dst.copy_from_slice(tensor.as_bytes()));
        }
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Runs every workload in topological order and returns the graph outputs by binding.
    pub fn run(&mut self) -> Result<Vec<(u32, HostTensor)>> {
        if self.state != EngineState::Ready {
            return Err(self.invalid("run"));
        }
        self.state = EngineState::Running;
        self.dispatch.clear();

        let profiling = self.config.profiling;
        let profiler = Arc::clone(&self.profiler);
        let mut guards = Vec::new();
        if profiling {
            profiler.begin_session();
            let mut seen = HashSet::new();
            for backend in &self.backends {
                if seen.insert(backend.id()) {
                    guards.push(backend.scheduler().intercept(profiler.kernel_measurements()));
                }
            }
        }

        let outcome = self.run_steps(profiling.then_some(profiler.as_ref()));
        drop(guards);

        if profiling {
            self.last_report = Some(profiler.take_report());
        }

        match outcome.and_then(|()| self.collect_outputs()) {
            Ok(outputs) => {
                self.state = EngineState::Completed;
                Ok(outputs)
            }
            Err(err) => {
                self.state = EngineState::Failed;
                Err(err)
            }
        }
    }

    fn run_steps(&mut self, profiler: Option<&Profiler>) -> Result<()> {
        let Some(built) = self.built.as_mut() else {
            return Err(Error::InvalidState {
                state: EngineState::Running.as_str(),
                operation: "run",
            });
        };

        for step in built.steps.iter_mut() {
            if step.workload.is_none() {
                let handle_of = |slot: &OutputSlotRef| {
                    built.memory.handle(*slot).cloned().ok_or_else(|| {
                        Error::graph_invalid(format!("{}: tensor {slot:?} has no buffer", step.name))
                    })
                };
                let descriptor = WorkloadDescriptor {
                    name: step.name.clone(),
                    kind: step.kind.clone(),
                    inputs: step.inputs.iter().map(handle_of).collect::<Result<_>>()?,
                    outputs: step.outputs.iter().map(handle_of).collect::<Result<_>>()?,
                };
                let backend = self
                    .backends
                    .iter()
                    .find(|backend| backend.id() == step.backend)
                    .ok_or_else(|| Error::Config(format!("backend {} is not available", step.backend)))?;
                let workload = backend
                    .factory()
                    .create_workload(descriptor)
                    .map_err(|source| match source {
                        source @ BackendError::Unsupported { .. } => Error::BackendUnsupported {
                            layer: step.name.clone(),
                            layer_type: step.kind.layer_type().as_str(),
                            reasons: vec![format!("{}: {source}", step.backend)],
                        },
                        source => Error::WorkloadExecutionFailure {
                            layer: step.name.clone(),
                            backend: step.backend,
                            source,
                        },
                    })?;
                step.workload = Some(workload);
            }
            let Some(workload) = step.workload.as_mut() else {
                continue;
            };

            let result = {
                let _scope = profiler.map(|profiler| profiler.workload_scope(&step.name, step.backend));
                workload.execute()
            };
            if let Err(source) = result {
                tracing::warn!(
                    layer = step.name.as_str(),
                    backend = %step.backend,
                    error = %source,
                    "workload failed"
                );
                return Err(Error::WorkloadExecutionFailure {
                    layer: step.name.clone(),
                    backend: step.backend,
                    source,
                });
            }
            self.dispatch.push(step.layer);
        }
        Ok(())
    }

    fn collect_outputs(&self) -> Result<Vec<(u32, HostTensor)>> {
        let Some(built) = self.built.as_ref() else {
            return Ok(Vec::new());
        };
        built
            .outputs
            .iter()
            .map(|binding| {
                let handle = built.memory.handle(binding.slot).ok_or_else(|| {
                    Error::graph_invalid(format!("output binding {} has no buffer", binding.id))
                })?;
                let tensor = HostTensor::from_bytes(handle.info().clone(), handle.to_bytes())?;
                Ok((binding.id, tensor))
            })
            .collect()
    }

    /// Binds `inputs` and runs.
    pub fn execute(&mut self, inputs: &[(u32, HostTensor)]) -> Result<Vec<(u32, HostTensor)>> {
        self.bind_inputs(inputs)?;
        self.run()
    }

    /// Zeroes every buffer, restores constants and returns to `Built`.
    pub fn reset(&mut self) -> Result<()> {
        if matches!(self.state, EngineState::Unbuilt | EngineState::Running) {
            return Err(self.invalid("reset"));
        }
        if let Some(built) = self.built.as_ref() {
            built.memory.reset();
        }
        self.upload_constants()?;
        self.dispatch.clear();
        self.state = EngineState::Built;
        Ok(())
    }

    /// Backend each layer ended up on, keyed by layer name.
    pub fn assignments(&self) -> BTreeMap<String, BackendId> {
        self.graph
            .layers()
            .filter_map(|layer| layer.backend().map(|backend| (layer.name().to_string(), backend)))
            .collect()
    }
}
