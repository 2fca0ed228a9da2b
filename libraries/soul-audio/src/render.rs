//! Render-side graph scheduler
//!
//! The renderer owns every processor and every parameter timeline. The
//! control side never touches them directly: it sends [`Command`]s that are
//! drained at the start of each render quantum.
//!
//! Processing order is recomputed whenever the topology changes. Cycles are
//! legal only when they pass through a delay node; such delays become cycle
//! breakers that read during the quantum and consume their input after every
//! other node has run, which clamps their delay to at least one quantum.

use crate::block::{AudioBlock, ChannelCountMode, RENDER_QUANTUM};
use crate::node::NodeMessage;
use crate::param::{AutomationEvent, ParamId, ParamSpec, Timeline};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub(crate) type NodeId = usize;

/// Id of the destination node
pub(crate) const DESTINATION: NodeId = 0;

/// Timeline change shipped to the renderer
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParamOp {
    Insert(AutomationEvent),
    CancelFrom(f64),
}

/// Everything the renderer needs to host a new node
pub(crate) struct NodeSpec {
    pub processor: Box<dyn Processor>,
    pub inputs: Vec<ChannelCountMode>,
    pub output_channels: Vec<usize>,
    pub params: Vec<(ParamId, ParamSpec)>,
}

/// Control to render messages
pub(crate) enum Command {
    AddNode {
        id: NodeId,
        spec: NodeSpec,
    },
    Connect {
        from: NodeId,
        output: usize,
        to: NodeId,
        input: usize,
    },
    ConnectParam {
        from: NodeId,
        output: usize,
        param: ParamId,
    },
    Disconnect {
        from: NodeId,
    },
    Param {
        id: ParamId,
        op: ParamOp,
    },
    Message {
        id: NodeId,
        message: NodeMessage,
    },
}

/// Timing of the quantum being rendered
#[derive(Debug, Clone, Copy)]
pub(crate) struct RenderScope {
    pub sample_rate: f32,
    pub frame: u64,
    pub time: f64,
}

/// Per-frame values of the params owned by the node being processed
pub(crate) struct ParamBlock<'a> {
    ids: &'a [ParamId],
    slots: &'a [Option<ParamSlot>],
}

impl ParamBlock<'_> {
    /// Values of the node's `index`-th param for this quantum
    pub(crate) fn values(&self, index: usize) -> &[f32; RENDER_QUANTUM] {
        const ZERO: [f32; RENDER_QUANTUM] = [0.0; RENDER_QUANTUM];
        self.ids
            .get(index)
            .and_then(|&id| self.slots.get(id))
            .and_then(Option::as_ref)
            .map_or(&ZERO, |slot| &slot.values)
    }

    /// Value at the start of the quantum, for k-rate use
    pub(crate) fn first(&self, index: usize) -> f32 {
        self.values(index)[0]
    }
}

/// A node's DSP, living on the render thread
pub(crate) trait Processor: Send {
    fn process(
        &mut self,
        scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        params: &ParamBlock<'_>,
    );

    fn handle_message(&mut self, _message: NodeMessage) {}

    /// Called when the node sits on a cycle; returns true if it can break it
    fn set_cycle_breaker(&mut self, _in_cycle: bool) -> bool {
        false
    }

    /// Input of a cycle breaker, delivered after the quantum was rendered
    fn deferred_input(&mut self, _inputs: &[AudioBlock]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Source {
    node: NodeId,
    output: usize,
}

struct InputPort {
    mode: ChannelCountMode,
    sources: Vec<Source>,
}

struct NodeSlot {
    processor: Box<dyn Processor>,
    inputs: Vec<InputPort>,
    input_blocks: Vec<AudioBlock>,
    outputs: Vec<AudioBlock>,
    params: Vec<ParamId>,
    cycle_breaker: bool,
    muted: bool,
}

pub(crate) struct ParamSlot {
    timeline: Timeline,
    min: f32,
    max: f32,
    sources: Vec<Source>,
    values: [f32; RENDER_QUANTUM],
}

#[cfg(test)]
impl ParamSlot {
    /// Slot holding `value` for the whole quantum
    pub(crate) fn constant(value: f32) -> Self {
        Self {
            timeline: Timeline::new(value),
            min: f32::MIN,
            max: f32::MAX,
            sources: Vec::new(),
            values: [value; RENDER_QUANTUM],
        }
    }
}

#[cfg(test)]
impl<'a> ParamBlock<'a> {
    pub(crate) fn for_test(ids: &'a [ParamId], slots: &'a [Option<ParamSlot>]) -> Self {
        Self { ids, slots }
    }
}

/// Context state as stored in the shared atomic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RunState {
    Suspended = 0,
    Running = 1,
    Closed = 2,
}

impl RunState {
    pub(crate) fn load(cell: &AtomicU8) -> Self {
        match cell.load(Ordering::Acquire) {
            1 => Self::Running,
            2 => Self::Closed,
            _ => Self::Suspended,
        }
    }
}

/// The render-side half of a context
pub(crate) struct Renderer {
    sample_rate: u32,
    commands: Receiver<Command>,
    frames: Arc<AtomicU64>,
    state: Arc<AtomicU8>,
    nodes: Vec<Option<NodeSlot>>,
    params: Vec<Option<ParamSlot>>,
    order: Vec<NodeId>,
    order_dirty: bool,
    /// Rendered frames not yet handed to the caller
    pending: AudioBlock,
    pending_offset: usize,
}

impl Renderer {
    pub(crate) fn new(
        sample_rate: u32,
        commands: Receiver<Command>,
        frames: Arc<AtomicU64>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            sample_rate,
            commands,
            frames,
            state,
            nodes: Vec::new(),
            params: Vec::new(),
            order: Vec::new(),
            order_dirty: true,
            pending: AudioBlock::new(2),
            pending_offset: RENDER_QUANTUM,
        }
    }

    /// Fill an interleaved buffer with `channels` channels
    ///
    /// Produces silence without advancing the clock unless the context is running.
    pub(crate) fn render_interleaved(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let run_state = RunState::load(&self.state);
        if run_state != RunState::Closed {
            self.drain_commands();
        }
        if run_state != RunState::Running {
            out.fill(0.0);
            return;
        }

        for frame in out.chunks_mut(channels) {
            if self.pending_offset >= RENDER_QUANTUM {
                self.render_quantum();
                self.pending_offset = 0;
            }
            let n = self.pending_offset;
            let stereo = self.pending.channel_count() >= 2;
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = match ch {
                    0 => self.pending.channel(0)[n],
                    1 if stereo => self.pending.channel(1)[n],
                    1 => self.pending.channel(0)[n],
                    _ => 0.0,
                };
            }
            self.pending_offset += 1;
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::AddNode { id, spec } => self.add_node(id, spec),
            Command::Connect {
                from,
                output,
                to,
                input,
            } => {
                if let Some(port) = self
                    .nodes
                    .get_mut(to)
                    .and_then(Option::as_mut)
                    .and_then(|slot| slot.inputs.get_mut(input))
                {
                    let source = Source { node: from, output };
                    if !port.sources.contains(&source) {
                        port.sources.push(source);
                        self.order_dirty = true;
                    }
                }
            }
            Command::ConnectParam {
                from,
                output,
                param,
            } => {
                if let Some(slot) = self.params.get_mut(param).and_then(Option::as_mut) {
                    let source = Source { node: from, output };
                    if !slot.sources.contains(&source) {
                        slot.sources.push(source);
                        self.order_dirty = true;
                    }
                }
            }
            Command::Disconnect { from } => {
                for slot in self.nodes.iter_mut().flatten() {
                    for port in &mut slot.inputs {
                        port.sources.retain(|s| s.node != from);
                    }
                }
                for slot in self.params.iter_mut().flatten() {
                    slot.sources.retain(|s| s.node != from);
                }
                self.order_dirty = true;
            }
            Command::Param { id, op } => {
                if let Some(slot) = self.params.get_mut(id).and_then(Option::as_mut) {
                    slot.timeline.apply(op);
                }
            }
            Command::Message { id, message } => {
                if let Some(slot) = self.nodes.get_mut(id).and_then(Option::as_mut) {
                    slot.processor.handle_message(message);
                }
            }
        }
    }

    fn add_node(&mut self, id: NodeId, spec: NodeSpec) {
        if self.nodes.len() <= id {
            self.nodes.resize_with(id + 1, || None);
        }
        let mut param_ids = Vec::with_capacity(spec.params.len());
        for (param_id, param) in spec.params {
            if self.params.len() <= param_id {
                self.params.resize_with(param_id + 1, || None);
            }
            self.params[param_id] = Some(ParamSlot {
                timeline: Timeline::new(param.default),
                min: param.min,
                max: param.max,
                sources: Vec::new(),
                values: [param.default; RENDER_QUANTUM],
            });
            param_ids.push(param_id);
        }

        self.nodes[id] = Some(NodeSlot {
            processor: spec.processor,
            input_blocks: spec.inputs.iter().map(|_| AudioBlock::new(1)).collect(),
            inputs: spec
                .inputs
                .into_iter()
                .map(|mode| InputPort {
                    mode,
                    sources: Vec::new(),
                })
                .collect(),
            outputs: spec
                .output_channels
                .into_iter()
                .map(AudioBlock::new)
                .collect(),
            params: param_ids,
            cycle_breaker: false,
            muted: false,
        });
        self.order_dirty = true;
    }

    /// Render one quantum into `self.pending` and advance the clock
    pub(crate) fn render_quantum(&mut self) {
        if self.order_dirty {
            self.rebuild_order();
        }

        let frame = self.frames.load(Ordering::Acquire);
        let sample_rate = self.sample_rate as f32;
        let time = frame as f64 / f64::from(self.sample_rate);
        let scope = RenderScope {
            sample_rate,
            frame,
            time,
        };
        let dt = 1.0 / f64::from(self.sample_rate);

        for slot in self.params.iter_mut().flatten() {
            slot.timeline.prune(time);
        }

        for index in 0..self.order.len() {
            let id = self.order[index];
            let Some(mut inputs) = self.nodes[id]
                .as_mut()
                .map(|slot| std::mem::take(&mut slot.input_blocks))
            else {
                continue;
            };

            let breaker = self.nodes[id].as_ref().map_or(false, |s| s.cycle_breaker);
            if breaker {
                for block in &mut inputs {
                    block.silence();
                }
            } else {
                self.gather_inputs(id, &mut inputs);
            }
            self.evaluate_params(id, time, dt);

            let Some(slot) = self.nodes[id].as_mut() else {
                continue;
            };
            if slot.muted {
                for out in &mut slot.outputs {
                    out.silence();
                }
            } else {
                let params = ParamBlock {
                    ids: &slot.params,
                    slots: &self.params,
                };
                slot.processor
                    .process(&scope, &inputs, &mut slot.outputs, &params);
            }
            slot.input_blocks = inputs;
        }

        // Cycle breakers consume their input once every upstream node has run
        for index in 0..self.order.len() {
            let id = self.order[index];
            if !self.nodes[id].as_ref().map_or(false, |s| s.cycle_breaker) {
                continue;
            }
            let Some(mut inputs) = self.nodes[id]
                .as_mut()
                .map(|slot| std::mem::take(&mut slot.input_blocks))
            else {
                continue;
            };
            self.gather_inputs(id, &mut inputs);
            if let Some(slot) = self.nodes[id].as_mut() {
                slot.processor.deferred_input(&inputs);
                slot.input_blocks = inputs;
            }
        }

        match self
            .nodes
            .get(DESTINATION)
            .and_then(Option::as_ref)
            .and_then(|slot| slot.outputs.first())
        {
            Some(out) => self.pending.copy_from(out),
            None => {
                self.pending.set_channel_count(2);
                self.pending.silence();
            }
        }

        self.frames
            .fetch_add(RENDER_QUANTUM as u64, Ordering::AcqRel);
    }

    fn gather_inputs(&self, id: NodeId, inputs: &mut [AudioBlock]) {
        let Some(slot) = self.nodes[id].as_ref() else {
            return;
        };
        for (port, block) in slot.inputs.iter().zip(inputs.iter_mut()) {
            let widest = port
                .sources
                .iter()
                .filter_map(|s| self.output_of(*s))
                .map(AudioBlock::channel_count)
                .max()
                .unwrap_or(1);
            block.set_channel_count(port.mode.resolve(widest));
            block.silence();
            for source in &port.sources {
                if let Some(out) = self.output_of(*source) {
                    block.mix_from(out);
                }
            }
        }
    }

    fn evaluate_params(&mut self, id: NodeId, time: f64, dt: f64) {
        let Some(slot) = self.nodes[id].as_ref() else {
            return;
        };
        for &param_id in &slot.params {
            let Some(param) = self.params.get_mut(param_id).and_then(Option::as_mut) else {
                continue;
            };
            param.timeline.fill(time, dt, &mut param.values);
            for source in &param.sources {
                let Some(out) = self
                    .nodes
                    .get(source.node)
                    .and_then(Option::as_ref)
                    .and_then(|s| s.outputs.get(source.output))
                else {
                    continue;
                };
                for (n, v) in param.values.iter_mut().enumerate() {
                    *v += out.mono_sample(n);
                }
            }
            let (min, max) = (param.min, param.max);
            for v in &mut param.values {
                *v = v.clamp(min, max);
            }
        }
    }

    fn output_of(&self, source: Source) -> Option<&AudioBlock> {
        self.nodes
            .get(source.node)
            .and_then(Option::as_ref)
            .and_then(|slot| slot.outputs.get(source.output))
    }

    /// Upstream nodes of `id`, through audio inputs and param inputs
    fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        let Some(slot) = self.nodes[id].as_ref() else {
            return Vec::new();
        };
        let mut deps: Vec<NodeId> = slot
            .inputs
            .iter()
            .flat_map(|port| port.sources.iter().map(|s| s.node))
            .collect();
        for &param_id in &slot.params {
            if let Some(param) = self.params.get(param_id).and_then(Option::as_ref) {
                deps.extend(param.sources.iter().map(|s| s.node));
            }
        }
        deps.retain(|&d| self.nodes.get(d).map_or(false, Option::is_some));
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    fn rebuild_order(&mut self) {
        let count = self.nodes.len();
        let deps: Vec<Vec<NodeId>> = (0..count).map(|id| self.dependencies(id)).collect();

        // Mark cycle members and pick breakers
        let components = strongly_connected(&deps);
        for slot in self.nodes.iter_mut().flatten() {
            slot.cycle_breaker = false;
            slot.muted = false;
        }
        for component in &components {
            let cyclic = component.len() > 1
                || component.first().map_or(false, |&id| deps[id].contains(&id));
            if !cyclic {
                continue;
            }
            let mut broken = false;
            for &id in component {
                if let Some(slot) = self.nodes[id].as_mut() {
                    let breaker = slot.processor.set_cycle_breaker(true);
                    slot.cycle_breaker = breaker;
                    broken |= breaker;
                }
            }
            if !broken {
                error!(
                    nodes = component.len(),
                    "Cycle without a delay node; muting its members"
                );
                for &id in component {
                    if let Some(slot) = self.nodes[id].as_mut() {
                        slot.muted = true;
                    }
                }
            }
        }
        for slot in self.nodes.iter_mut().flatten() {
            if !slot.cycle_breaker {
                slot.processor.set_cycle_breaker(false);
            }
        }

        // Kahn's algorithm, ignoring edges into cycle breakers
        let mut indegree = vec![0usize; count];
        let mut dependents: Vec<Vec<NodeId>> = vec![Vec::new(); count];
        for id in 0..count {
            if self.nodes[id].is_none() {
                continue;
            }
            let breaker = self.nodes[id].as_ref().map_or(false, |s| s.cycle_breaker);
            if breaker {
                continue;
            }
            for &dep in &deps[id] {
                indegree[id] += 1;
                dependents[dep].push(id);
            }
        }

        let mut ready: Vec<NodeId> = (0..count)
            .filter(|&id| self.nodes[id].is_some() && indegree[id] == 0)
            .collect();
        ready.reverse();
        let mut order = Vec::with_capacity(count);
        while let Some(id) = ready.pop() {
            order.push(id);
            for &next in &dependents[id] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(next);
                }
            }
        }

        let placed = order.len();
        for id in 0..count {
            if self.nodes[id].is_some() && !order.contains(&id) {
                warn!(node = id, "Node left out of order by a cycle; muting");
                if let Some(slot) = self.nodes[id].as_mut() {
                    slot.muted = true;
                }
                order.push(id);
            }
        }

        debug!(
            nodes = order.len(),
            ordered = placed,
            breakers = self
                .nodes
                .iter()
                .flatten()
                .filter(|s| s.cycle_breaker)
                .count(),
            "Rebuilt render order"
        );

        self.order = order;
        self.order_dirty = false;
    }
}

/// Tarjan's strongly connected components over a dependency list
fn strongly_connected(deps: &[Vec<NodeId>]) -> Vec<Vec<NodeId>> {
    struct State<'a> {
        deps: &'a [Vec<NodeId>],
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<NodeId>,
        next: usize,
        out: Vec<Vec<NodeId>>,
    }

    fn visit(s: &mut State<'_>, v: NodeId) {
        s.index[v] = Some(s.next);
        s.low[v] = s.next;
        s.next += 1;
        s.stack.push(v);
        s.on_stack[v] = true;

        for i in 0..s.deps[v].len() {
            let w = s.deps[v][i];
            match s.index[w] {
                None => {
                    visit(s, w);
                    s.low[v] = s.low[v].min(s.low[w]);
                }
                Some(wi) if s.on_stack[w] => {
                    s.low[v] = s.low[v].min(wi);
                }
                Some(_) => {}
            }
        }

        if Some(s.low[v]) == s.index[v] {
            let mut component = Vec::new();
            while let Some(w) = s.stack.pop() {
                s.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            s.out.push(component);
        }
    }

    let n = deps.len();
    let mut state = State {
        deps,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        out: Vec::new(),
    };
    for v in 0..n {
        if state.index[v].is_none() {
            visit(&mut state, v);
        }
    }
    state.out
}
