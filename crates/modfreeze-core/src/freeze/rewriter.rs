//! Graph rewriting: inlining and attribute folding
//!
//! Each kept method is cloned with every method and function call inlined,
//! forked calls inlined into the fork's own sub-graph, and every read of a
//! non-preserved slot replaced by a constant deep copy of its current value.
//! Module identity is tracked per value so attribute reads and calls can be
//! resolved statically.

use super::resolver::PreservedSet;
use super::simplify::simplify;
use crate::dataflow::{Entry, MutationFacts, SlotId, SlotTable};
use crate::error::FreezeError;
use crate::ir::{Block, ForkTarget, Graph, Instr, Op, ValueId};
use crate::module::ModuleId;
use crate::store::Store;
use crate::value::{StorageId, Value};
use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::{debug, trace};

const MAX_INLINE_DEPTH: usize = 128;

/// Output of rewriting every kept method.
#[derive(Debug, Clone, Default)]
pub struct Rewrite {
    /// Rewritten graphs per module, in entry order.
    pub methods: IndexMap<ModuleId, IndexMap<String, Graph>>,
    /// Slots the rewritten graphs still read or write.
    pub referenced: IndexSet<SlotId>,
    /// Slots whose reads were replaced by constants.
    pub folded: IndexSet<SlotId>,
}

/// Per-method rewriting state.
#[derive(Default)]
struct Context {
    next: u32,
    modules: HashMap<ValueId, ModuleId>,
    /// Module-valued slots assigned earlier on the straight-line path.
    assigned: HashMap<(ModuleId, String), ModuleId>,
    /// Values read from a slot that may hold more than one module, with the
    /// slot path and candidate paths.
    ambiguous: HashMap<ValueId, (String, String)>,
}

impl Context {
    fn fresh(&mut self) -> ValueId {
        let id = ValueId(self.next);
        self.next += 1;
        id
    }

    /// Forgets assignments made inside a nested block, which may not run.
    fn settle(&mut self, before: &HashMap<(ModuleId, String), ModuleId>) {
        self.assigned.retain(|key, module| before.get(key) == Some(module));
    }
}

type Renames = HashMap<ValueId, ValueId>;

pub struct GraphRewriter<'a> {
    store: &'a mut Store,
    slots: &'a SlotTable,
    preserved: &'a PreservedSet,
    facts: &'a MutationFacts,
    simplify: bool,
    memo: HashMap<StorageId, StorageId>,
    folded: IndexSet<SlotId>,
}

impl<'a> GraphRewriter<'a> {
    pub fn new(
        store: &'a mut Store,
        slots: &'a SlotTable,
        preserved: &'a PreservedSet,
        facts: &'a MutationFacts,
        simplify: bool,
    ) -> Self {
        Self {
            store,
            slots,
            preserved,
            facts,
            simplify,
            memo: HashMap::new(),
            folded: IndexSet::new(),
        }
    }

    pub fn rewrite(mut self, entries: &[Entry]) -> Result<Rewrite, FreezeError> {
        let mut out = Rewrite::default();
        for (module, method) in entries {
            let (graph, modules) = self.rewrite_method(*module, method)?;
            collect_references(&graph.body, &modules, self.slots, &mut out.referenced);
            debug!(
                module = %self.store.path_of(*module),
                method = method.as_str(),
                instrs = graph.instr_count(),
                "method rewritten"
            );
            out.methods.entry(*module).or_default().insert(method.clone(), graph);
        }
        out.folded = self.folded;
        Ok(out)
    }

    fn rewrite_method(&mut self, module: ModuleId, method: &str) -> Result<(Graph, HashMap<ValueId, ModuleId>), FreezeError> {
        let source = self.method_graph(module, method)?;
        let mut cx = Context::default();
        let inputs: Vec<ValueId> = source.inputs.iter().map(|_| cx.fresh()).collect();
        if let Some(receiver) = inputs.first() {
            cx.modules.insert(*receiver, module);
        }
        let mut instrs = Vec::new();
        let ret = self.inline(&source, &inputs, &mut instrs, &mut cx, 0)?;
        let body = Block {
            params: Vec::new(),
            instrs,
            outputs: vec![ret],
        };
        let mut graph = Graph::new(inputs, body, cx.next);
        let rounds = simplify(&mut graph, self.simplify);
        trace!(method, rounds, "simplified");
        Ok((graph, cx.modules))
    }

    fn method_graph(&self, module: ModuleId, method: &str) -> Result<Graph, FreezeError> {
        let class = self.store.class_of(module)?;
        class.method(method).cloned().ok_or_else(|| {
            FreezeError::Malformed(format!(
                "{} has no method '{method}' (called on '{}')",
                class.name,
                self.store.path_of(module)
            ))
        })
    }

    fn function_graph(&self, name: &str) -> Result<Graph, FreezeError> {
        self.store
            .function(name)
            .cloned()
            .ok_or_else(|| FreezeError::Malformed(format!("unknown function '{name}'")))
    }

    /// Inlines `graph` with its inputs bound to `args`, appending to `out`.
    /// Returns the value holding the graph's result.
    fn inline(
        &mut self,
        graph: &Graph,
        args: &[ValueId],
        out: &mut Vec<Instr>,
        cx: &mut Context,
        depth: usize,
    ) -> Result<ValueId, FreezeError> {
        if depth > MAX_INLINE_DEPTH {
            return Err(FreezeError::Malformed("inlining depth exceeded".to_string()));
        }
        if graph.inputs.len() != args.len() {
            return Err(FreezeError::Malformed(format!(
                "call expects {} inputs, got {}",
                graph.inputs.len(),
                args.len()
            )));
        }
        let mut renames: Renames = graph.inputs.iter().copied().zip(args.iter().copied()).collect();
        let outputs = self.inline_block(&graph.body, &mut renames, out, cx, depth)?;
        outputs
            .first()
            .copied()
            .ok_or_else(|| FreezeError::Malformed("graph has no output".to_string()))
    }

    fn inline_block(
        &mut self,
        block: &Block,
        renames: &mut Renames,
        out: &mut Vec<Instr>,
        cx: &mut Context,
        depth: usize,
    ) -> Result<Vec<ValueId>, FreezeError> {
        for instr in &block.instrs {
            self.inline_instr(instr, renames, out, cx, depth)?;
        }
        block.outputs.iter().map(|id| lookup(renames, *id)).collect()
    }

    fn fresh_outputs(instr: &Instr, renames: &mut Renames, cx: &mut Context) -> SmallVec<[ValueId; 1]> {
        instr
            .outputs
            .iter()
            .map(|old| {
                let new = cx.fresh();
                renames.insert(*old, new);
                new
            })
            .collect()
    }

    fn receiver(cx: &Context, value: ValueId, member: &str) -> Result<ModuleId, FreezeError> {
        if let Some(module) = cx.modules.get(&value) {
            return Ok(*module);
        }
        match cx.ambiguous.get(&value) {
            Some((attribute, candidates)) => Err(FreezeError::DynamicModule {
                attribute: attribute.clone(),
                member: member.to_string(),
                candidates: candidates.clone(),
            }),
            None => Err(FreezeError::Malformed(format!("cannot resolve the module receiving '{member}'"))),
        }
    }

    fn inline_instr(
        &mut self,
        instr: &Instr,
        renames: &mut Renames,
        out: &mut Vec<Instr>,
        cx: &mut Context,
        depth: usize,
    ) -> Result<(), FreezeError> {
        match &instr.op {
            Op::CallMethod { object, method, args } => {
                let object = lookup(renames, *object)?;
                let module = Self::receiver(cx, object, method)?;
                let callee = self.method_graph(module, method)?;
                let mut call_args = vec![object];
                call_args.extend(lookup_all(renames, args)?);
                let ret = self.inline(&callee, &call_args, out, cx, depth + 1)?;
                bind_result(instr, renames, ret);
            }

            Op::CallFunction { function, args } => {
                let callee = self.function_graph(function)?;
                let call_args = lookup_all(renames, args)?;
                let ret = self.inline(&callee, &call_args, out, cx, depth + 1)?;
                bind_result(instr, renames, ret);
            }

            Op::Fork { target, args } => {
                let args = lookup_all(renames, args)?;
                let callee = match target {
                    ForkTarget::Method(method) => {
                        let receiver = args
                            .first()
                            .copied()
                            .ok_or_else(|| FreezeError::Malformed(format!("fork of '{method}' without a receiver")))?;
                        let module = Self::receiver(cx, receiver, method)?;
                        self.method_graph(module, method)?
                    }
                    ForkTarget::Function(name) => self.function_graph(name)?,
                    ForkTarget::Graph(graph) => (**graph).clone(),
                };
                let inputs: Vec<ValueId> = args.iter().map(|_| cx.fresh()).collect();
                for (input, arg) in inputs.iter().zip(&args) {
                    if let Some(module) = cx.modules.get(arg).copied() {
                        cx.modules.insert(*input, module);
                    }
                }
                let mut body = Vec::new();
                let before = cx.assigned.clone();
                let ret = self.inline(&callee, &inputs, &mut body, cx, depth + 1)?;
                cx.settle(&before);
                let sub = Graph::new(
                    inputs,
                    Block {
                        params: Vec::new(),
                        instrs: body,
                        outputs: vec![ret],
                    },
                    cx.next,
                );
                let outputs = Self::fresh_outputs(instr, renames, cx);
                out.push(Instr {
                    outputs,
                    op: Op::Fork {
                        target: ForkTarget::Graph(Box::new(sub)),
                        args,
                    },
                });
            }

            Op::GetAttr { object, name } => {
                let object = lookup(renames, *object)?;
                let module = Self::receiver(cx, object, name)?;
                let outputs = Self::fresh_outputs(instr, renames, cx);
                let result = outputs.first().copied();
                let op = self.read_attr(module, name, object, result, cx)?;
                out.push(Instr { outputs, op });
            }

            Op::SetAttr { object, name, value } => {
                let object = lookup(renames, *object)?;
                let value = lookup(renames, *value)?;
                if let Some(module) = cx.modules.get(&object).copied() {
                    match cx.modules.get(&value).copied() {
                        Some(child) => cx.assigned.insert((module, name.clone()), child),
                        None => cx.assigned.remove(&(module, name.clone())),
                    };
                }
                out.push(Instr {
                    outputs: SmallVec::new(),
                    op: Op::SetAttr {
                        object,
                        name: name.clone(),
                        value,
                    },
                });
            }

            Op::If {
                cond,
                then_block,
                else_block,
            } => {
                let cond = lookup(renames, *cond)?;
                let before = cx.assigned.clone();
                let mut then_instrs = Vec::new();
                let then_out = self.inline_block(then_block, renames, &mut then_instrs, cx, depth)?;
                cx.settle(&before);
                let mut else_instrs = Vec::new();
                let else_out = self.inline_block(else_block, renames, &mut else_instrs, cx, depth)?;
                cx.settle(&before);
                let outputs = Self::fresh_outputs(instr, renames, cx);
                out.push(Instr {
                    outputs,
                    op: Op::If {
                        cond,
                        then_block: Block {
                            params: Vec::new(),
                            instrs: then_instrs,
                            outputs: then_out,
                        },
                        else_block: Block {
                            params: Vec::new(),
                            instrs: else_instrs,
                            outputs: else_out,
                        },
                    },
                });
            }

            Op::Loop {
                trip_count,
                inits,
                body,
            } => {
                let trip_count = lookup(renames, *trip_count)?;
                let inits = lookup_all(renames, inits)?;
                let params: Vec<ValueId> = body
                    .params
                    .iter()
                    .map(|old| {
                        let new = cx.fresh();
                        renames.insert(*old, new);
                        new
                    })
                    .collect();
                // assignments from a later iteration reach reads earlier in the body
                cx.assigned.clear();
                let mut body_instrs = Vec::new();
                let body_out = self.inline_block(body, renames, &mut body_instrs, cx, depth)?;
                cx.assigned.clear();
                let outputs = Self::fresh_outputs(instr, renames, cx);
                out.push(Instr {
                    outputs,
                    op: Op::Loop {
                        trip_count,
                        inits,
                        body: Block {
                            params,
                            instrs: body_instrs,
                            outputs: body_out,
                        },
                    },
                });
            }

            op => {
                let mut op = op.clone();
                for operand in op.operands_mut() {
                    *operand = lookup(renames, *operand)?;
                }
                let outputs = Self::fresh_outputs(instr, renames, cx);
                out.push(Instr { outputs, op });
            }
        }
        Ok(())
    }

    /// The instruction replacing `module.name`.
    fn read_attr(
        &mut self,
        module: ModuleId,
        name: &str,
        object: ValueId,
        result: Option<ValueId>,
        cx: &mut Context,
    ) -> Result<Op, FreezeError> {
        let keep = Op::GetAttr {
            object,
            name: name.to_string(),
        };
        let Some(slot) = self.slots.get(module, name) else {
            if name == "training" {
                return Ok(Op::Const(Value::Bool(false)));
            }
            return Err(FreezeError::Malformed(format!(
                "'{}' has no attribute '{name}'",
                self.store.path_of(module)
            )));
        };
        let value = self.store.attr(module, name).cloned().unwrap_or(Value::None);

        if let Value::Module(current) = value {
            let Some(result) = result else { return Ok(keep) };
            if let Some(assigned) = cx.assigned.get(&(module, name.to_string())) {
                cx.modules.insert(result, *assigned);
                return Ok(keep);
            }
            let mut candidates = vec![current];
            if self.facts.effects(slot).assigned {
                for other in self.facts.assigned_modules(slot) {
                    if !candidates.contains(&other) {
                        candidates.push(other);
                    }
                }
            }
            if let [only] = candidates[..] {
                cx.modules.insert(result, only);
            } else {
                let paths: Vec<String> = candidates.iter().map(|m| format!("'{}'", self.store.path_of(*m))).collect();
                cx.ambiguous
                    .insert(result, (self.slots.path(slot).to_string(), paths.join(", ")));
            }
            return Ok(keep);
        }
        if self.preserved.contains(slot) {
            return Ok(keep);
        }
        let copy = self.store.heap.deep_copy(&value, &mut self.memo);
        self.folded.insert(slot);
        trace!(slot = self.slots.path(slot), "folded");
        Ok(Op::Const(copy))
    }
}

fn lookup(renames: &Renames, id: ValueId) -> Result<ValueId, FreezeError> {
    renames
        .get(&id)
        .copied()
        .ok_or_else(|| FreezeError::Malformed(format!("use of undefined value {id}")))
}

fn lookup_all(renames: &Renames, ids: &[ValueId]) -> Result<Vec<ValueId>, FreezeError> {
    ids.iter().map(|id| lookup(renames, *id)).collect()
}

fn bind_result(instr: &Instr, renames: &mut Renames, ret: ValueId) {
    if let Some(old) = instr.outputs.first() {
        renames.insert(*old, ret);
    }
}

/// Slots still touched by attribute reads or writes in `block`.
fn collect_references(
    block: &Block,
    modules: &HashMap<ValueId, ModuleId>,
    slots: &SlotTable,
    out: &mut IndexSet<SlotId>,
) {
    for instr in &block.instrs {
        match &instr.op {
            Op::GetAttr { object, name } | Op::SetAttr { object, name, .. } => {
                if let Some(slot) = modules.get(object).and_then(|m| slots.get(*m, name)) {
                    out.insert(slot);
                }
            }
            Op::Fork {
                target: ForkTarget::Graph(graph),
                ..
            } => collect_references(&graph.body, modules, slots, out),
            _ => {}
        }
        for nested in instr.op.blocks() {
            collect_references(nested, modules, slots, out);
        }
    }
}
