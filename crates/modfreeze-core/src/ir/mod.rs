//! Method graph IR
//!
//! A [`Graph`] is a list of SSA instructions over [`ValueId`]s with
//! structured control flow (`If`, `Loop`). Method graphs take the receiver
//! as input 0 and return exactly one value.

mod builder;
mod builtin;

pub use builder::GraphBuilder;
pub use builtin::{eval_builtin, Builtin};

use crate::value::Value;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// SSA value identifier, unique within one graph (including nested blocks
/// and embedded fork graphs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub inputs: Vec<ValueId>,
    pub body: Block,
    next_value: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub params: Vec<ValueId>,
    pub instrs: Vec<Instr>,
    pub outputs: Vec<ValueId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    pub outputs: SmallVec<[ValueId; 1]>,
    pub op: Op,
}

/// What a `fork` spawns. `Method` and `Function` are resolved by name; the
/// rewriter replaces both with an inlined `Graph` whose inputs bind to the
/// fork arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ForkTarget {
    /// Method on the module passed as the first fork argument.
    Method(String),
    Function(String),
    Graph(Box<Graph>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Const(Value),
    GetAttr {
        object: ValueId,
        name: String,
    },
    SetAttr {
        object: ValueId,
        name: String,
        value: ValueId,
    },
    CallMethod {
        object: ValueId,
        method: String,
        args: Vec<ValueId>,
    },
    CallFunction {
        function: String,
        args: Vec<ValueId>,
    },
    Fork {
        target: ForkTarget,
        args: Vec<ValueId>,
    },
    Wait {
        future: ValueId,
    },
    Builtin {
        op: Builtin,
        args: Vec<ValueId>,
    },
    /// Outputs are the outputs of whichever block runs.
    If {
        cond: ValueId,
        then_block: Block,
        else_block: Block,
    },
    /// `body.params` is `[index, carried...]`; `body.outputs` are the next
    /// carried values; the instruction outputs are the final carried values.
    Loop {
        trip_count: ValueId,
        inits: Vec<ValueId>,
        body: Block,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Const(_) => "Const",
            Op::GetAttr { .. } => "GetAttr",
            Op::SetAttr { .. } => "SetAttr",
            Op::CallMethod { .. } => "CallMethod",
            Op::CallFunction { .. } => "CallFunction",
            Op::Fork { .. } => "Fork",
            Op::Wait { .. } => "Wait",
            Op::Builtin { .. } => "Builtin",
            Op::If { .. } => "If",
            Op::Loop { .. } => "Loop",
        }
    }

    /// Operands read directly by this instruction, excluding uses inside
    /// nested blocks and fork graphs.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Op::Const(_) => Vec::new(),
            Op::GetAttr { object, .. } => vec![*object],
            Op::SetAttr { object, value, .. } => vec![*object, *value],
            Op::CallMethod { object, args, .. } => std::iter::once(*object).chain(args.iter().copied()).collect(),
            Op::CallFunction { args, .. } | Op::Fork { args, .. } | Op::Builtin { args, .. } => args.clone(),
            Op::Wait { future } => vec![*future],
            Op::If { cond, .. } => vec![*cond],
            Op::Loop { trip_count, inits, .. } => std::iter::once(*trip_count).chain(inits.iter().copied()).collect(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut ValueId> {
        match self {
            Op::Const(_) => Vec::new(),
            Op::GetAttr { object, .. } => vec![object],
            Op::SetAttr { object, value, .. } => vec![object, value],
            Op::CallMethod { object, args, .. } => std::iter::once(object).chain(args.iter_mut()).collect(),
            Op::CallFunction { args, .. } | Op::Fork { args, .. } | Op::Builtin { args, .. } => args.iter_mut().collect(),
            Op::Wait { future } => vec![future],
            Op::If { cond, .. } => vec![cond],
            Op::Loop { trip_count, inits, .. } => std::iter::once(trip_count).chain(inits.iter_mut()).collect(),
        }
    }

    /// Nested blocks of structured control flow.
    pub fn blocks(&self) -> Vec<&Block> {
        match self {
            Op::If {
                then_block,
                else_block,
                ..
            } => vec![then_block, else_block],
            Op::Loop { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    pub fn blocks_mut(&mut self) -> Vec<&mut Block> {
        match self {
            Op::If {
                then_block,
                else_block,
                ..
            } => vec![then_block, else_block],
            Op::Loop { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }
}

impl Graph {
    pub fn new(inputs: Vec<ValueId>, body: Block, next_value: u32) -> Self {
        Self {
            inputs,
            body,
            next_value,
        }
    }

    /// The single returned value.
    pub fn output(&self) -> Option<ValueId> {
        self.body.outputs.first().copied()
    }

    pub fn next_value(&self) -> u32 {
        self.next_value
    }

    pub fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    /// Visits every instruction, including those in nested blocks and
    /// embedded fork graphs, in program order.
    pub fn visit(&self, f: &mut impl FnMut(&Instr)) {
        self.body.visit(f);
    }

    pub fn count_ops(&self, mut pred: impl FnMut(&Op) -> bool) -> usize {
        let mut n = 0;
        self.visit(&mut |instr| {
            if pred(&instr.op) {
                n += 1;
            }
        });
        n
    }

    pub fn instr_count(&self) -> usize {
        self.count_ops(|_| true)
    }

    /// Attribute names read through `GetAttr` anywhere in the graph.
    pub fn attribute_reads(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.visit(&mut |instr| {
            if let Op::GetAttr { name, .. } = &instr.op {
                names.push(name.clone());
            }
        });
        names
    }
}

impl Block {
    pub fn visit(&self, f: &mut impl FnMut(&Instr)) {
        for instr in &self.instrs {
            f(instr);
            for block in instr.op.blocks() {
                block.visit(f);
            }
            if let Op::Fork {
                target: ForkTarget::Graph(graph),
                ..
            } = &instr.op
            {
                graph.visit(f);
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, ids: &[ValueId]) -> fmt::Result {
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{id}")?;
    }
    Ok(())
}

fn write_block(f: &mut fmt::Formatter<'_>, block: &Block, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    for instr in &block.instrs {
        write!(f, "{pad}")?;
        if !instr.outputs.is_empty() {
            write_list(f, &instr.outputs)?;
            write!(f, " = ")?;
        }
        match &instr.op {
            Op::Const(value) => writeln!(f, "Const[value={value:?}]()")?,
            Op::GetAttr { object, name } => writeln!(f, "GetAttr[name=\"{name}\"]({object})")?,
            Op::SetAttr { object, name, value } => writeln!(f, "SetAttr[name=\"{name}\"]({object}, {value})")?,
            Op::CallMethod { object, method, args } => {
                write!(f, "CallMethod[name=\"{method}\"]({object}")?;
                for arg in args {
                    write!(f, ", {arg}")?;
                }
                writeln!(f, ")")?;
            }
            Op::CallFunction { function, args } => {
                write!(f, "CallFunction[name=\"{function}\"](")?;
                write_list(f, args)?;
                writeln!(f, ")")?;
            }
            Op::Fork { target, args } => {
                match target {
                    ForkTarget::Method(name) => write!(f, "Fork[method=\"{name}\"](")?,
                    ForkTarget::Function(name) => write!(f, "Fork[function=\"{name}\"](")?,
                    ForkTarget::Graph(_) => write!(f, "Fork[subgraph](")?,
                }
                write_list(f, args)?;
                writeln!(f, ")")?;
                if let ForkTarget::Graph(graph) = target {
                    write!(f, "{pad}  block(")?;
                    write_list(f, &graph.inputs)?;
                    writeln!(f, "):")?;
                    write_block(f, &graph.body, indent + 2)?;
                    write!(f, "{pad}    -> (")?;
                    write_list(f, &graph.body.outputs)?;
                    writeln!(f, ")")?;
                }
            }
            Op::Wait { future } => writeln!(f, "Wait({future})")?,
            Op::Builtin { op, args } => {
                write!(f, "{op:?}(")?;
                write_list(f, args)?;
                writeln!(f, ")")?;
            }
            Op::If { cond, .. } | Op::Loop { trip_count: cond, .. } => {
                writeln!(f, "{}({cond})", instr.op.name())?;
                for block in instr.op.blocks() {
                    write!(f, "{pad}  block(")?;
                    write_list(f, &block.params)?;
                    writeln!(f, "):")?;
                    write_block(f, block, indent + 2)?;
                    write!(f, "{pad}    -> (")?;
                    write_list(f, &block.outputs)?;
                    writeln!(f, ")")?;
                }
            }
        }
    }
    Ok(())
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph(")?;
        write_list(f, &self.inputs)?;
        writeln!(f, "):")?;
        write_block(f, &self.body, 1)?;
        write!(f, "  return (")?;
        write_list(f, &self.body.outputs)?;
        writeln!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_names_attribute_reads() {
        let mut b = GraphBuilder::method(1);
        let this = b.self_value();
        let a = b.get_attr(this, "a");
        let x = b.input(1);
        let sum = b.builtin(Builtin::Add, &[a, x]);
        let graph = b.finish(sum);

        let text = graph.to_string();
        assert!(text.contains("GetAttr[name=\"a\"](%0)"), "dump was:\n{text}");
        assert!(text.contains("return (%3)"), "dump was:\n{text}");
        assert_eq!(graph.attribute_reads(), vec!["a".to_string()]);
    }

    #[test]
    fn test_visit_reaches_nested_blocks() {
        let mut b = GraphBuilder::method(0);
        let this = b.self_value();
        let flag = b.get_attr(this, "training");
        let out = b.if_else(
            flag,
            |b| {
                let this = b.self_value();
                vec![b.get_attr(this, "a")]
            },
            |b| vec![b.constant(Value::Int(0))],
        );
        let graph = b.finish(out[0]);
        assert_eq!(graph.count_ops(|op| matches!(op, Op::GetAttr { .. })), 2);
    }
}
