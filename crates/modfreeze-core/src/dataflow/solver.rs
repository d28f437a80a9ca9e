//! Mutation detector: points-to fixpoint over method graphs
//!
//! Every kept entry method is walked with concrete module identities.
//! Facts that flow between methods (values assigned into slots, contents of
//! fresh containers, per-slot effects) are monotone and persist across
//! passes; passes repeat until none of them grows.

use super::lattice::{join, Loc, LocSet, SiteId, SlotEffects, SlotId, SlotTable};
use super::mutations::{EffectContext, EffectRegistry};
use crate::error::FreezeError;
use crate::interprocedural::{CallGraph, CallKind, CallSite};
use crate::ir::{Block, ForkTarget, Graph, Instr, Op, ValueId};
use crate::module::ModuleId;
use crate::store::Store;
use crate::value::Value;
use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// A method analyzed as a root of the reachable program.
pub type Entry = (ModuleId, String);

/// Facts about one entry method, from the final pass.
#[derive(Debug, Clone, Default)]
pub struct EntryFacts {
    /// Slots read by the entry or anything it calls or forks.
    pub reads: IndexSet<SlotId>,
    /// Locations the return value may denote.
    pub returned: LocSet,
    /// Modules reachable from the return value.
    pub returned_modules: IndexSet<ModuleId>,
}

#[derive(Debug, Clone)]
pub struct MutationFacts {
    pub effects: Vec<SlotEffects>,
    /// Method-time slot-to-slot assignments, as `(target, source)`.
    pub assignments: IndexSet<(SlotId, SlotId)>,
    /// Locations assigned into each slot by any analyzed method.
    pub contents: HashMap<SlotId, LocSet>,
    pub entries: IndexMap<Entry, EntryFacts>,
    pub call_graph: CallGraph,
    pub iterations: usize,
    pub converged: bool,
}

impl MutationFacts {
    pub fn effects(&self, slot: SlotId) -> SlotEffects {
        self.effects.get(slot.0 as usize).copied().unwrap_or_default()
    }

    pub fn is_mutated(&self, slots: &SlotTable, slot: SlotId) -> bool {
        self.effects(slot).is_mutated(slots.info(slot).mutable)
    }

    /// Modules any analyzed method may assign into `slot`.
    pub fn assigned_modules(&self, slot: SlotId) -> Vec<ModuleId> {
        self.contents
            .get(&slot)
            .into_iter()
            .flatten()
            .filter_map(|loc| match loc {
                Loc::Module(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    pub fn mutated_slots<'t>(&'t self, slots: &'t SlotTable) -> impl Iterator<Item = SlotId> + 't {
        slots.ids().filter(move |id| self.is_mutated(slots, *id))
    }
}

/// Persistent state shared by all passes.
struct State {
    effects: Vec<SlotEffects>,
    contents: HashMap<SlotId, LocSet>,
    fresh: HashMap<SiteId, LocSet>,
    assignments: IndexSet<(SlotId, SlotId)>,
    sites: IndexMap<Vec<u32>, SiteId>,
    call_graph: CallGraph,
    changed: bool,
}

impl State {
    fn new(slots: usize) -> Self {
        Self {
            effects: vec![SlotEffects::default(); slots],
            contents: HashMap::new(),
            fresh: HashMap::new(),
            assignments: IndexSet::new(),
            sites: IndexMap::new(),
            call_graph: CallGraph::new(),
            changed: false,
        }
    }

    fn flag(&mut self, slot: SlotId, set: impl FnOnce(&mut SlotEffects) -> &mut bool) {
        if let Some(effects) = self.effects.get_mut(slot.0 as usize) {
            let flag = set(effects);
            if !*flag {
                *flag = true;
                self.changed = true;
            }
        }
    }

    /// `locs` plus everything stored inside fresh containers among them.
    fn deep(&self, locs: &LocSet) -> LocSet {
        let mut out = locs.clone();
        let mut queue: VecDeque<Loc> = locs.iter().copied().collect();
        while let Some(loc) = queue.pop_front() {
            if let Loc::Fresh(site) = loc {
                if let Some(contents) = self.fresh.get(&site) {
                    for inner in contents {
                        if out.insert(*inner) {
                            queue.push_back(*inner);
                        }
                    }
                }
            }
        }
        out
    }

    fn deep_slots(&self, locs: &LocSet) -> Vec<SlotId> {
        self.deep(locs)
            .into_iter()
            .filter_map(|loc| match loc {
                Loc::Root(s) | Loc::Element(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

pub struct MutationDetector<'a> {
    store: &'a Store,
    slots: &'a SlotTable,
    registry: EffectRegistry,
    max_iterations: usize,
}

impl<'a> MutationDetector<'a> {
    pub fn new(store: &'a Store, slots: &'a SlotTable, max_iterations: usize) -> Self {
        Self {
            store,
            slots,
            registry: EffectRegistry::new(),
            max_iterations: max_iterations.max(1),
        }
    }

    /// Analyzes `entries` to a fixed point.
    pub fn run(&self, entries: &[Entry]) -> Result<MutationFacts, FreezeError> {
        let mut state = State::new(self.slots.len());
        let mut entry_facts = IndexMap::new();
        let mut iterations = 0;

        loop {
            iterations += 1;
            state.changed = false;
            entry_facts.clear();

            for (index, (module, method)) in entries.iter().enumerate() {
                let mut walker = Walker {
                    detector: self,
                    state: &mut state,
                    reads: IndexSet::new(),
                    position: vec![index as u32],
                    stack: Vec::new(),
                };
                let returned = walker.call_method(*module, method, Vec::new(), None)?;
                let reads = walker.reads;
                let deep = state.deep(&returned);
                let returned_modules = deep
                    .iter()
                    .filter_map(|loc| match loc {
                        Loc::Module(m) => Some(*m),
                        _ => None,
                    })
                    .collect();
                entry_facts.insert(
                    (*module, method.clone()),
                    EntryFacts {
                        reads,
                        returned,
                        returned_modules,
                    },
                );
            }

            trace!(iterations, changed = state.changed, "mutation pass");
            if !state.changed || iterations >= self.max_iterations {
                break;
            }
        }

        let converged = !state.changed;
        debug!(
            iterations,
            converged,
            mutated = state
                .effects
                .iter()
                .enumerate()
                .filter(|(i, e)| e.is_mutated(self.slots.info(SlotId(*i as u32)).mutable))
                .count(),
            "mutation analysis finished"
        );

        Ok(MutationFacts {
            effects: state.effects,
            assignments: state.assignments,
            contents: state.contents,
            entries: entry_facts,
            call_graph: state.call_graph,
            iterations,
            converged,
        })
    }
}

type Frame = HashMap<ValueId, LocSet>;

/// One walk of one entry method within a pass.
struct Walker<'d, 'a, 's> {
    detector: &'d MutationDetector<'a>,
    state: &'s mut State,
    reads: IndexSet<SlotId>,
    /// Structural position of the instruction being analyzed; names
    /// allocation sites stably across passes.
    position: Vec<u32>,
    stack: Vec<CallSite>,
}

impl Walker<'_, '_, '_> {
    fn malformed(&self, detail: String) -> FreezeError {
        FreezeError::Malformed(detail)
    }

    fn modules_in(locs: &LocSet) -> Vec<ModuleId> {
        locs.iter()
            .filter_map(|loc| match loc {
                Loc::Module(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    fn enter(&mut self, callee: CallSite, kind: CallKind) -> bool {
        self.state.call_graph.add_site(callee);
        if let Some(caller) = self.stack.last() {
            self.state.call_graph.add_call(*caller, callee, kind);
        }
        !self.stack.contains(&callee)
    }

    /// Analyzes `module.method`. `args` excludes the receiver.
    fn call_method(
        &mut self,
        module: ModuleId,
        method: &str,
        args: Vec<LocSet>,
        kind: Option<CallKind>,
    ) -> Result<LocSet, FreezeError> {
        let store = self.detector.store;
        let class = store.class_of(module)?;
        let Some(index) = class.methods.get_index_of(method) else {
            return Err(self.malformed(format!(
                "{} has no method '{method}' (called on '{}')",
                class.name,
                store.path_of(module)
            )));
        };
        let site = CallSite::Method(module, index as u32);
        if !self.enter(site, kind.unwrap_or(CallKind::Call)) {
            // recursion is reported from the call graph
            return Ok(LocSet::new());
        }
        let graph = &class.methods[index];
        let inputs = std::iter::once(LocSet::from([Loc::Module(module)])).chain(args).collect();
        self.stack.push(site);
        self.position.push(module.0);
        let result = self.analyze_graph(graph, inputs);
        self.position.pop();
        self.stack.pop();
        result
    }

    fn call_function(&mut self, name: &str, args: Vec<LocSet>, kind: CallKind) -> Result<LocSet, FreezeError> {
        let store = self.detector.store;
        let Some(graph) = store.function(name) else {
            return Err(self.malformed(format!("unknown function '{name}'")));
        };
        let index = store.function_index(name).unwrap_or(u32::MAX);
        let site = CallSite::Function(index);
        if !self.enter(site, kind) {
            return Ok(LocSet::new());
        }
        self.stack.push(site);
        self.position.push(u32::MAX - index);
        let result = self.analyze_graph(graph, args);
        self.position.pop();
        self.stack.pop();
        result
    }

    fn analyze_graph(&mut self, graph: &Graph, inputs: Vec<LocSet>) -> Result<LocSet, FreezeError> {
        let mut frame: Frame = graph.inputs.iter().copied().zip(inputs).collect();
        let outputs = self.analyze_block(&graph.body, &mut frame)?;
        Ok(outputs.into_iter().next().unwrap_or_default())
    }

    fn analyze_block(&mut self, block: &Block, frame: &mut Frame) -> Result<Vec<LocSet>, FreezeError> {
        for (i, instr) in block.instrs.iter().enumerate() {
            self.position.push(i as u32);
            let outputs = self.analyze_instr(instr, frame);
            self.position.pop();
            for (id, locs) in instr.outputs.iter().zip(outputs?) {
                frame.insert(*id, locs);
            }
        }
        Ok(block.outputs.iter().map(|id| get(frame, *id)).collect())
    }

    fn analyze_instr(&mut self, instr: &Instr, frame: &mut Frame) -> Result<SmallVec<[LocSet; 1]>, FreezeError> {
        let store = self.detector.store;
        let slots = self.detector.slots;
        let single = |locs: LocSet| -> Result<SmallVec<[LocSet; 1]>, FreezeError> { Ok(SmallVec::from_elem(locs, 1)) };

        match &instr.op {
            Op::Const(value) => match value {
                Value::Module(m) => single(LocSet::from([Loc::Module(*m)])),
                v if v.is_mutable() => {
                    let fresh = self.allocate(LocSet::new());
                    single(fresh)
                }
                _ => single(LocSet::new()),
            },

            Op::GetAttr { object, name } => {
                let mut out = LocSet::new();
                for module in Self::modules_in(&get(frame, *object)) {
                    match slots.get(module, name) {
                        Some(slot) => {
                            self.reads.insert(slot);
                            self.state.flag(slot, |e| &mut e.read);
                            match store.attr(module, name).and_then(Value::as_module) {
                                Some(child) => out.insert(Loc::Module(child)),
                                None => out.insert(Loc::Root(slot)),
                            };
                            if let Some(assigned) = self.state.contents.get(&slot) {
                                out.extend(assigned.iter().copied());
                            }
                        }
                        None if name == "training" => {}
                        None => {
                            return Err(self.malformed(format!(
                                "'{}' has no attribute '{name}'",
                                store.path_of(module)
                            )))
                        }
                    }
                }
                single(out)
            }

            Op::SetAttr { object, name, value } => {
                let value = get(frame, *value);
                for module in Self::modules_in(&get(frame, *object)) {
                    let Some(slot) = slots.get(module, name) else {
                        return Err(self.malformed(format!(
                            "assignment to unknown attribute '{name}' of '{}'",
                            store.path_of(module)
                        )));
                    };
                    self.state.flag(slot, |e| &mut e.assigned);
                    let contents = self.state.contents.entry(slot).or_default();
                    if join(contents, &value) {
                        self.state.changed = true;
                    }
                    for loc in &value {
                        if let Loc::Root(source) = loc {
                            if self.state.assignments.insert((slot, *source)) {
                                self.state.changed = true;
                            }
                        }
                    }
                    for escaped in self.state.deep_slots(&value) {
                        self.state.flag(escaped, |e| &mut e.stored_elsewhere);
                    }
                }
                Ok(SmallVec::new())
            }

            Op::CallMethod { object, method, args } => {
                let args: Vec<LocSet> = args.iter().map(|a| get(frame, *a)).collect();
                let mut out = LocSet::new();
                for module in Self::modules_in(&get(frame, *object)) {
                    let result = self.call_method(module, method, args.clone(), None)?;
                    out.extend(result);
                }
                single(out)
            }

            Op::CallFunction { function, args } => {
                let args = args.iter().map(|a| get(frame, *a)).collect();
                let out = self.call_function(function, args, CallKind::Call)?;
                single(out)
            }

            Op::Fork { target, args } => {
                let args: Vec<LocSet> = args.iter().map(|a| get(frame, *a)).collect();
                let returned = match target {
                    ForkTarget::Method(method) => {
                        let (receiver, rest) = args
                            .split_first()
                            .ok_or_else(|| self.malformed(format!("fork of '{method}' without a receiver")))?;
                        self.mark_forked(rest);
                        let mut out = LocSet::new();
                        for module in Self::modules_in(receiver) {
                            out.extend(self.call_method(module, method, rest.to_vec(), Some(CallKind::Fork))?);
                        }
                        out
                    }
                    ForkTarget::Function(name) => {
                        self.mark_forked(&args);
                        self.call_function(name, args.clone(), CallKind::Fork)?
                    }
                    ForkTarget::Graph(graph) => {
                        self.mark_forked(&args);
                        self.position.push(u32::MAX);
                        let out = self.analyze_graph(graph, args.clone());
                        self.position.pop();
                        out?
                    }
                };
                // values leaving the forked body escape too
                self.mark_forked(std::slice::from_ref(&returned));
                // module identities survive the join; everything else comes back fresh
                let modules: LocSet = Self::modules_in(&self.state.deep(&returned)).into_iter().map(Loc::Module).collect();
                let future = self.allocate(modules);
                single(future)
            }

            Op::Wait { future } => {
                let modules: LocSet = Self::modules_in(&self.state.deep(&get(frame, *future)))
                    .into_iter()
                    .map(Loc::Module)
                    .collect();
                let mut joined = self.allocate(LocSet::new());
                joined.extend(modules);
                single(joined)
            }

            Op::Builtin { op, args } => {
                let args: Vec<LocSet> = args.iter().map(|a| get(frame, *a)).collect();
                let detector = self.detector;
                let out = detector.registry.apply(*op, self, &args);
                single(out)
            }

            Op::If {
                then_block,
                else_block,
                ..
            } => {
                self.position.push(0);
                let then_out = self.analyze_block(then_block, frame);
                self.position.pop();
                self.position.push(1);
                let else_out = self.analyze_block(else_block, frame);
                self.position.pop();
                let mut outputs: SmallVec<[LocSet; 1]> = then_out?.into_iter().collect();
                for (merged, other) in outputs.iter_mut().zip(else_out?) {
                    merged.extend(other);
                }
                Ok(outputs)
            }

            Op::Loop { inits, body, .. } => {
                let mut carried: Vec<LocSet> = inits.iter().map(|a| get(frame, *a)).collect();
                let limit = self.detector.max_iterations;
                for _ in 0..limit {
                    if let Some((index, params)) = body.params.split_first() {
                        frame.insert(*index, LocSet::new());
                        for (param, locs) in params.iter().zip(&carried) {
                            frame.insert(*param, locs.clone());
                        }
                    }
                    self.position.push(0);
                    let next = self.analyze_block(body, frame);
                    self.position.pop();
                    let mut grew = false;
                    for (acc, new) in carried.iter_mut().zip(next?) {
                        grew |= join(acc, &new);
                    }
                    if !grew {
                        break;
                    }
                }
                Ok(carried.into_iter().collect())
            }
        }
    }

    fn mark_forked(&mut self, args: &[LocSet]) {
        for locs in args {
            for slot in self.state.deep_slots(locs) {
                self.state.flag(slot, |e| &mut e.forked);
            }
        }
    }
}

impl EffectContext for Walker<'_, '_, '_> {
    fn write(&mut self, target: &LocSet) {
        for loc in target {
            match loc {
                Loc::Root(slot) => self.state.flag(*slot, |e| &mut e.root_written),
                Loc::Element(slot) => self.state.flag(*slot, |e| &mut e.element_written),
                Loc::Fresh(_) | Loc::Module(_) => {}
            }
        }
    }

    fn store_into(&mut self, target: &LocSet, value: &LocSet) {
        self.write(target);
        for loc in target {
            match loc {
                Loc::Fresh(site) => {
                    let contents = self.state.fresh.entry(*site).or_default();
                    if join(contents, value) {
                        self.state.changed = true;
                    }
                }
                Loc::Root(_) | Loc::Element(_) => {
                    for escaped in self.state.deep_slots(value) {
                        self.state.flag(escaped, |e| &mut e.stored_elsewhere);
                    }
                }
                Loc::Module(_) => {}
            }
        }
    }

    fn project(&self, source: &LocSet) -> LocSet {
        let mut out = LocSet::new();
        for loc in source {
            match loc {
                Loc::Root(slot) | Loc::Element(slot) => {
                    out.insert(Loc::Element(*slot));
                }
                Loc::Fresh(site) => {
                    if let Some(contents) = self.state.fresh.get(site) {
                        out.extend(contents.iter().copied());
                    }
                }
                Loc::Module(_) => {}
            }
        }
        out
    }

    fn allocate(&mut self, contents: LocSet) -> LocSet {
        let next = SiteId(self.state.sites.len() as u32);
        let site = *self.state.sites.entry(self.position.clone()).or_insert(next);
        let slot = self.state.fresh.entry(site).or_default();
        if join(slot, &contents) {
            self.state.changed = true;
        }
        LocSet::from([Loc::Fresh(site)])
    }
}

fn get(frame: &Frame, id: ValueId) -> LocSet {
    frame.get(&id).cloned().unwrap_or_default()
}
