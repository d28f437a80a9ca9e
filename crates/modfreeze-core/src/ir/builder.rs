//! Incremental construction of method graphs

use super::{Block, Builtin, ForkTarget, Graph, Instr, Op, ValueId};
use crate::value::Value;
use smallvec::{smallvec, SmallVec};

/// Builds a [`Graph`] instruction by instruction. Nested blocks are built
/// through closures passed to [`if_else`](Self::if_else) and
/// [`repeat`](Self::repeat).
pub struct GraphBuilder {
    inputs: Vec<ValueId>,
    blocks: Vec<Block>,
    next: u32,
}

impl GraphBuilder {
    pub fn new(arity: usize) -> Self {
        let inputs = (0..arity as u32).map(ValueId).collect();
        Self {
            inputs,
            blocks: vec![Block::default()],
            next: arity as u32,
        }
    }

    /// Method graph with the receiver as input 0 followed by `args` inputs.
    pub fn method(args: usize) -> Self {
        Self::new(args + 1)
    }

    pub fn input(&self, i: usize) -> ValueId {
        self.inputs[i]
    }

    pub fn self_value(&self) -> ValueId {
        self.input(0)
    }

    fn fresh(&mut self) -> ValueId {
        let id = ValueId(self.next);
        self.next += 1;
        id
    }

    fn push(&mut self, op: Op, outputs: SmallVec<[ValueId; 1]>) {
        if let Some(block) = self.blocks.last_mut() {
            block.instrs.push(Instr { outputs, op });
        }
    }

    fn emit(&mut self, op: Op) -> ValueId {
        let out = self.fresh();
        self.push(op, smallvec![out]);
        out
    }

    pub fn constant(&mut self, value: Value) -> ValueId {
        self.emit(Op::Const(value))
    }

    pub fn int(&mut self, i: i64) -> ValueId {
        self.constant(Value::Int(i))
    }

    pub fn float(&mut self, f: f64) -> ValueId {
        self.constant(Value::Float(f))
    }

    pub fn str(&mut self, s: &str) -> ValueId {
        self.constant(Value::from(s))
    }

    pub fn none(&mut self) -> ValueId {
        self.constant(Value::None)
    }

    pub fn get_attr(&mut self, object: ValueId, name: &str) -> ValueId {
        self.emit(Op::GetAttr {
            object,
            name: name.to_string(),
        })
    }

    /// `object.a.b.c`
    pub fn get_path(&mut self, object: ValueId, path: &str) -> ValueId {
        path.split('.').fold(object, |v, name| self.get_attr(v, name))
    }

    pub fn set_attr(&mut self, object: ValueId, name: &str, value: ValueId) {
        self.push(
            Op::SetAttr {
                object,
                name: name.to_string(),
                value,
            },
            SmallVec::new(),
        );
    }

    pub fn call_method(&mut self, object: ValueId, method: &str, args: &[ValueId]) -> ValueId {
        self.emit(Op::CallMethod {
            object,
            method: method.to_string(),
            args: args.to_vec(),
        })
    }

    pub fn call_function(&mut self, function: &str, args: &[ValueId]) -> ValueId {
        self.emit(Op::CallFunction {
            function: function.to_string(),
            args: args.to_vec(),
        })
    }

    pub fn fork_method(&mut self, object: ValueId, method: &str, args: &[ValueId]) -> ValueId {
        let args = std::iter::once(object).chain(args.iter().copied()).collect();
        self.emit(Op::Fork {
            target: ForkTarget::Method(method.to_string()),
            args,
        })
    }

    pub fn fork_function(&mut self, function: &str, args: &[ValueId]) -> ValueId {
        self.emit(Op::Fork {
            target: ForkTarget::Function(function.to_string()),
            args: args.to_vec(),
        })
    }

    pub fn wait(&mut self, future: ValueId) -> ValueId {
        self.emit(Op::Wait { future })
    }

    pub fn builtin(&mut self, op: Builtin, args: &[ValueId]) -> ValueId {
        self.emit(Op::Builtin {
            op,
            args: args.to_vec(),
        })
    }

    fn nested(&mut self, params: Vec<ValueId>, build: impl FnOnce(&mut Self) -> Vec<ValueId>) -> Block {
        self.blocks.push(Block {
            params,
            ..Block::default()
        });
        let outputs = build(self);
        let mut block = self.blocks.pop().unwrap_or_default();
        block.outputs = outputs;
        block
    }

    pub fn if_else(
        &mut self,
        cond: ValueId,
        then_branch: impl FnOnce(&mut Self) -> Vec<ValueId>,
        else_branch: impl FnOnce(&mut Self) -> Vec<ValueId>,
    ) -> Vec<ValueId> {
        let then_block = self.nested(Vec::new(), then_branch);
        let else_block = self.nested(Vec::new(), else_branch);
        let outputs: SmallVec<[ValueId; 1]> = then_block.outputs.iter().map(|_| self.fresh()).collect();
        let result = outputs.to_vec();
        self.push(
            Op::If {
                cond,
                then_block,
                else_block,
            },
            outputs,
        );
        result
    }

    /// Counted loop. `body` receives the iteration index and the carried
    /// values and returns the next carried values.
    pub fn repeat(
        &mut self,
        trip_count: ValueId,
        inits: &[ValueId],
        body: impl FnOnce(&mut Self, ValueId, &[ValueId]) -> Vec<ValueId>,
    ) -> Vec<ValueId> {
        let index = self.fresh();
        let carried: Vec<ValueId> = inits.iter().map(|_| self.fresh()).collect();
        let params = std::iter::once(index).chain(carried.iter().copied()).collect();
        let block = self.nested(params, |b| body(b, index, &carried));
        let outputs: SmallVec<[ValueId; 1]> = inits.iter().map(|_| self.fresh()).collect();
        let result = outputs.to_vec();
        self.push(
            Op::Loop {
                trip_count,
                inits: inits.to_vec(),
                body: block,
            },
            outputs,
        );
        result
    }

    pub fn finish(mut self, ret: ValueId) -> Graph {
        let mut body = self.blocks.pop().unwrap_or_default();
        body.outputs = vec![ret];
        Graph::new(self.inputs, body, self.next)
    }

    /// Finishes a graph that returns `None`.
    pub fn finish_none(mut self) -> Graph {
        let ret = self.none();
        self.finish(ret)
    }
}
