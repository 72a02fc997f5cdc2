use std::collections::{BTreeSet, HashMap};

use crate::backend::BackendId;
use crate::error::{Error, Result};
use crate::graph::{Graph, LayerId, LayerKind, OutputSlotRef};
use crate::tensor::TensorInfo;

/// Inclusive step interval during which a tensor must stay intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiveRange {
    pub start: usize,
    pub end: usize,
}

impl LiveRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferUsage(u8);

impl BufferUsage {
    const INPUT: u8 = 1;
    const OUTPUT: u8 = 2;
    const TEMPORARY: u8 = 4;
    const CONSTANT: u8 = 8;

    pub fn empty() -> Self {
        BufferUsage(0)
    }

    pub fn input() -> Self {
        BufferUsage(Self::INPUT)
    }

    pub fn output() -> Self {
        BufferUsage(Self::OUTPUT)
    }

    pub fn temporary() -> Self {
        BufferUsage(Self::TEMPORARY)
    }

    pub fn constant() -> Self {
        BufferUsage(Self::CONSTANT)
    }

    pub fn contains_input(self) -> bool {
        (self.0 & Self::INPUT) != 0
    }

    pub fn contains_output(self) -> bool {
        (self.0 & Self::OUTPUT) != 0
    }

    pub fn contains_temporary(self) -> bool {
        (self.0 & Self::TEMPORARY) != 0
    }

    /// Persistent for the whole run and never shared.
    pub fn contains_constant(self) -> bool {
        (self.0 & Self::CONSTANT) != 0
    }

    pub fn merge(mut self, other: BufferUsage) -> Self {
        self.0 |= other.0;
        self
    }
}

/// Lifetime of one output slot over the dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotLifetime {
    pub slot: OutputSlotRef,
    pub range: LiveRange,
    pub usage: BufferUsage,
}

/// Lifetimes of every produced tensor, listed in topological slot order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifetimePlan {
    /// Number of dispatch steps; graph outputs live until this step.
    pub steps: usize,
    pub slots: Vec<SlotLifetime>,
}

impl LifetimePlan {
    pub fn get(&self, slot: OutputSlotRef) -> Option<&SlotLifetime> {
        self.slots.iter().find(|lifetime| lifetime.slot == slot)
    }
}

/// Interval `[producing step, last consuming step]` per output slot.
///
/// Graph inputs and constants are written before the first step, so they start at 0.
/// Tensors read by an `Output` layer stay live past the final step, constants are
/// persistent.
pub fn compute_live_ranges(graph: &Graph, order: &[LayerId]) -> Result<LifetimePlan> {
    let steps = order.len();
    let position: HashMap<LayerId, usize> = order
        .iter()
        .enumerate()
        .map(|(step, id)| (*id, step))
        .collect();

    let mut slots = Vec::new();
    for (step, id) in order.iter().enumerate() {
        let layer = graph
            .layer(*id)
            .ok_or_else(|| Error::graph_invalid(format!("unknown layer {id} in order")))?;
        for index in 0..layer.outputs().len() {
            let slot = OutputSlotRef::new(*id, index);
            let (mut range, mut usage) = match layer.kind() {
                LayerKind::Constant { .. } => {
                    (LiveRange::new(0, steps), BufferUsage::constant())
                }
                LayerKind::Input { .. } => (LiveRange::new(0, step), BufferUsage::input()),
                _ => (LiveRange::new(step, step), BufferUsage::temporary()),
            };
            for consumer in graph.consumers_of(slot) {
                let consumer_step = *position.get(&consumer.layer).ok_or_else(|| {
                    Error::graph_invalid(format!(
                        "consumer {} of {} is not in the order",
                        consumer.layer, layer.name()
                    ))
                })?;
                range.end = range.end.max(consumer_step);
                let is_graph_output = graph
                    .layer(consumer.layer)
                    .is_some_and(|c| matches!(c.kind(), LayerKind::Output { .. }));
                if is_graph_output {
                    range.end = steps;
                    usage = usage.merge(BufferUsage::output());
                }
            }
            slots.push(SlotLifetime { slot, range, usage });
        }
    }
    Ok(LifetimePlan { steps, slots })
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferSpec {
    pub slot: OutputSlotRef,
    pub backend: BackendId,
    pub info: TensorInfo,
    pub byte_len: usize,
    pub size_class: usize,
    pub live_range: LiveRange,
    pub usage: BufferUsage,
    /// Index into [`BufferPlan::slots`].
    pub buffer: usize,
}

/// One physical pooled allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSlot {
    pub id: usize,
    pub backend: BackendId,
    pub size_class: usize,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferPlan {
    pub buffers: Vec<BufferSpec>,
    pub slots: Vec<BufferSlot>,
    index: HashMap<OutputSlotRef, usize>,
}

impl BufferPlan {
    pub fn buffer_for(&self, slot: OutputSlotRef) -> Option<&BufferSpec> {
        self.index.get(&slot).and_then(|idx| self.buffers.get(*idx))
    }

    /// Total bytes of all pooled allocations.
    pub fn total_bytes(&self) -> usize {
        self.slots.iter().map(|slot| slot.size_class).sum()
    }

    /// Bytes a naive one-buffer-per-tensor scheme would need.
    pub fn unshared_bytes(&self) -> usize {
        self.buffers.iter().map(|spec| spec.size_class).sum()
    }
}

fn size_class(byte_len: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    byte_len.max(1).div_ceil(alignment) * alignment
}

/// Greedy best-fit assignment of tensors to pooled buffers.
///
/// Slots are visited by lifetime start (ties keep topological slot order). Before each
/// slot, active buffers whose owner's range ended strictly before its start return to the
/// free list. The slot then takes the smallest free buffer of its backend whose size class
/// is large enough, oldest buffer first on ties, or a new buffer.
pub fn plan_buffers(
    graph: &Graph,
    lifetimes: &LifetimePlan,
    alignment_of: impl Fn(BackendId) -> usize,
) -> Result<BufferPlan> {
    let mut plan = BufferPlan::default();

    for lifetime in &lifetimes.slots {
        let layer = graph.layer(lifetime.slot.layer).ok_or_else(|| {
            Error::graph_invalid(format!("unknown layer {}", lifetime.slot.layer))
        })?;
        let backend = layer.backend().ok_or_else(|| {
            Error::graph_invalid(format!("{} has no backend assigned", layer.name()))
        })?;
        let info = graph.tensor_info(lifetime.slot).cloned().ok_or_else(|| {
            Error::graph_invalid(format!(
                "{} output {} has no tensor info",
                layer.name(),
                lifetime.slot.index
            ))
        })?;
        let byte_len = info.num_bytes().ok_or_else(|| {
            Error::graph_invalid(format!("{} output is too large", layer.name()))
        })?;
        plan.index.insert(lifetime.slot, plan.buffers.len());
        plan.buffers.push(BufferSpec {
            slot: lifetime.slot,
            backend,
            info,
            byte_len,
            size_class: size_class(byte_len, alignment_of(backend)),
            live_range: lifetime.range,
            usage: lifetime.usage,
            buffer: usize::MAX,
        });
    }

    let mut visit: Vec<usize> = (0..plan.buffers.len()).collect();
    visit.sort_by_key(|idx| plan.buffers[*idx].live_range.start);

    let mut free: BTreeSet<(BackendId, usize, usize)> = BTreeSet::new();
    let mut active: Vec<(usize, usize)> = Vec::new();
    let mut slots: Vec<BufferSlot> = Vec::new();

    for idx in visit {
        let spec = &plan.buffers[idx];
        let (backend, need, range, usage) =
            (spec.backend, spec.size_class, spec.live_range, spec.usage);

        active.retain(|&(end, buffer)| {
            if end < range.start {
                let slot = &slots[buffer];
                free.insert((slot.backend, slot.size_class, slot.id));
                false
            } else {
                true
            }
        });

        let reuse = if usage.contains_constant() {
            None
        } else {
            free.range((backend, need, 0)..)
                .next()
                .copied()
                .filter(|(candidate, _, _)| *candidate == backend)
        };

        let buffer = match reuse {
            Some(entry) => {
                free.remove(&entry);
                tracing::debug!(
                    slot = ?plan.buffers[idx].slot,
                    buffer = entry.2,
                    size_class = entry.1,
                    "reusing pooled buffer"
                );
                entry.2
            }
            None => {
                let id = slots.len();
                slots.push(BufferSlot {
                    id,
                    backend,
                    size_class: need,
                    usage: BufferUsage::empty(),
                });
                tracing::debug!(
                    slot = ?plan.buffers[idx].slot,
                    buffer = id,
                    size_class = need,
                    backend = %backend,
                    "allocating pooled buffer"
                );
                id
            }
        };

        slots[buffer].usage = slots[buffer].usage.merge(usage);
        plan.buffers[idx].buffer = buffer;
        if !usage.contains_constant() {
            active.push((range.end, buffer));
        }
    }

    plan.slots = slots;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_rounds_up_to_alignment() {
        assert_eq!(size_class(1, 64), 64);
        assert_eq!(size_class(64, 64), 64);
        assert_eq!(size_class(65, 64), 128);
        assert_eq!(size_class(0, 16), 16);
    }

    #[test]
    fn ranges_touching_at_a_step_overlap() {
        assert!(LiveRange::new(0, 2).overlaps(&LiveRange::new(2, 3)));
        assert!(!LiveRange::new(0, 1).overlaps(&LiveRange::new(2, 3)));
    }
}
