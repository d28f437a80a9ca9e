//! Graph clean-up after inlining
//!
//! Constant folding of scalar builtins, splicing of `if` on a constant
//! condition, dead-code elimination and pruning of unused fork captures.
//! Passes repeat until none of them changes the graph.

use crate::ir::{eval_builtin, Block, ForkTarget, Graph, Op, ValueId};
use crate::value::{Heap, Value};
use std::collections::{HashMap, HashSet};

/// Runs the clean-up passes. Dead-code elimination always runs; folding
/// and branch splicing only when `fold` is set.
pub fn simplify(graph: &mut Graph, fold: bool) -> usize {
    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut changed = false;
        if fold {
            changed |= fold_constants(graph);
            changed |= splice_constant_ifs(graph);
        }
        changed |= eliminate_dead_code(graph);
        changed |= prune_fork_captures(&mut graph.body);
        if !changed {
            return rounds;
        }
    }
}

/// Replaces foldable builtins whose operands are all plain constants.
pub fn fold_constants(graph: &mut Graph) -> bool {
    let mut consts = HashMap::new();
    fold_block(&mut graph.body, &mut consts)
}

fn fold_block(block: &mut Block, consts: &mut HashMap<ValueId, Value>) -> bool {
    let mut changed = false;
    for instr in &mut block.instrs {
        let folded = match &instr.op {
            Op::Const(value) if value.is_plain() => Some(value.clone()),
            Op::Builtin { op, args } if op.is_foldable() => {
                let values: Option<Vec<Value>> = args.iter().map(|a| consts.get(a).cloned()).collect();
                values
                    .and_then(|values| eval_builtin(&mut Heap::new(), *op, &values).ok())
                    .filter(Value::is_plain)
                    .inspect(|_| changed = true)
            }
            _ => None,
        };
        if let (Some(value), [out]) = (folded, instr.outputs.as_slice()) {
            consts.insert(*out, value.clone());
            instr.op = Op::Const(value);
        }
        for nested in instr.op.blocks_mut() {
            changed |= fold_block(nested, consts);
        }
        if let Op::Fork {
            target: ForkTarget::Graph(graph),
            ..
        } = &mut instr.op
        {
            changed |= fold_block(&mut graph.body, consts);
        }
    }
    changed
}

fn constant_bools(block: &Block, out: &mut HashMap<ValueId, bool>) {
    for instr in &block.instrs {
        if let (Op::Const(Value::Bool(b)), [id]) = (&instr.op, instr.outputs.as_slice()) {
            out.insert(*id, *b);
        }
        for nested in instr.op.blocks() {
            constant_bools(nested, out);
        }
        if let Op::Fork {
            target: ForkTarget::Graph(graph),
            ..
        } = &instr.op
        {
            constant_bools(&graph.body, out);
        }
    }
}

/// Replaces `if` on a constant condition with the taken block's body.
pub fn splice_constant_ifs(graph: &mut Graph) -> bool {
    let mut bools = HashMap::new();
    constant_bools(&graph.body, &mut bools);
    let mut renames = HashMap::new();
    let changed = splice_block(&mut graph.body, &bools, &mut renames);
    if changed {
        rename_uses(&mut graph.body, &renames);
    }
    changed
}

fn splice_block(block: &mut Block, bools: &HashMap<ValueId, bool>, renames: &mut HashMap<ValueId, ValueId>) -> bool {
    let mut changed = false;
    let mut out = Vec::with_capacity(block.instrs.len());
    for mut instr in std::mem::take(&mut block.instrs) {
        for nested in instr.op.blocks_mut() {
            changed |= splice_block(nested, bools, renames);
        }
        if let Op::Fork {
            target: ForkTarget::Graph(graph),
            ..
        } = &mut instr.op
        {
            changed |= splice_block(&mut graph.body, bools, renames);
        }
        match instr.op {
            Op::If {
                cond,
                then_block,
                else_block,
            } if bools.contains_key(&cond) => {
                let taken = if bools.get(&cond).copied().unwrap_or(false) {
                    then_block
                } else {
                    else_block
                };
                for (result, value) in instr.outputs.iter().zip(&taken.outputs) {
                    renames.insert(*result, *value);
                }
                out.extend(taken.instrs);
                changed = true;
            }
            op => {
                instr.op = op;
                out.push(instr);
            }
        }
    }
    block.instrs = out;
    changed
}

fn resolve(renames: &HashMap<ValueId, ValueId>, mut id: ValueId) -> ValueId {
    let mut hops = 0;
    while let Some(next) = renames.get(&id) {
        id = *next;
        hops += 1;
        if hops > renames.len() {
            break;
        }
    }
    id
}

fn rename_uses(block: &mut Block, renames: &HashMap<ValueId, ValueId>) {
    for instr in &mut block.instrs {
        for operand in instr.op.operands_mut() {
            *operand = resolve(renames, *operand);
        }
        for nested in instr.op.blocks_mut() {
            rename_uses(nested, renames);
        }
        if let Op::Fork {
            target: ForkTarget::Graph(graph),
            ..
        } = &mut instr.op
        {
            rename_uses(&mut graph.body, renames);
        }
    }
    for output in &mut block.outputs {
        *output = resolve(renames, *output);
    }
}

fn collect_uses(block: &Block, used: &mut HashSet<ValueId>) {
    for instr in &block.instrs {
        used.extend(instr.op.operands());
        for nested in instr.op.blocks() {
            collect_uses(nested, used);
        }
        if let Op::Fork {
            target: ForkTarget::Graph(graph),
            ..
        } = &instr.op
        {
            collect_uses(&graph.body, used);
        }
    }
    used.extend(block.outputs.iter().copied());
}

fn removable(op: &Op) -> bool {
    match op {
        Op::Const(_) | Op::GetAttr { .. } | Op::Wait { .. } => true,
        Op::Builtin { op, args } => op.cannot_fail(args.len()),
        Op::If {
            then_block,
            else_block,
            ..
        } => then_block.instrs.is_empty() && else_block.instrs.is_empty(),
        _ => false,
    }
}

/// Removes side-effect-free instructions whose results are never used.
pub fn eliminate_dead_code(graph: &mut Graph) -> bool {
    let mut changed = false;
    loop {
        let mut used = HashSet::new();
        collect_uses(&graph.body, &mut used);
        if !remove_dead(&mut graph.body, &used) {
            return changed;
        }
        changed = true;
    }
}

fn remove_dead(block: &mut Block, used: &HashSet<ValueId>) -> bool {
    let before = block.instrs.len();
    block
        .instrs
        .retain(|instr| !(removable(&instr.op) && instr.outputs.iter().all(|id| !used.contains(id))));
    let mut changed = block.instrs.len() != before;
    for instr in &mut block.instrs {
        for nested in instr.op.blocks_mut() {
            changed |= remove_dead(nested, used);
        }
        if let Op::Fork {
            target: ForkTarget::Graph(graph),
            ..
        } = &mut instr.op
        {
            changed |= remove_dead(&mut graph.body, used);
        }
    }
    changed
}

/// Drops fork captures the inlined body no longer uses.
fn prune_fork_captures(block: &mut Block) -> bool {
    let mut changed = false;
    for instr in &mut block.instrs {
        for nested in instr.op.blocks_mut() {
            changed |= prune_fork_captures(nested);
        }
        if let Op::Fork {
            target: ForkTarget::Graph(graph),
            args,
        } = &mut instr.op
        {
            changed |= prune_fork_captures(&mut graph.body);
            let mut used = HashSet::new();
            collect_uses(&graph.body, &mut used);
            for i in (0..graph.inputs.len().min(args.len())).rev() {
                if !used.contains(&graph.inputs[i]) {
                    graph.inputs.remove(i);
                    args.remove(i);
                    changed = true;
                }
            }
        }
    }
    changed
}
