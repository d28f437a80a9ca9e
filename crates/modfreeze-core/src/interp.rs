//! Reference interpreter for method graphs
//!
//! Executes graphs directly against a [`Store`]. `fork` runs its target
//! eagerly and wraps the result in a future; `wait` unwraps it.

use crate::error::EvalError;
use crate::ir::{eval_builtin, Block, ForkTarget, Graph, Op, ValueId};
use crate::module::ModuleId;
use crate::store::Store;
use crate::value::Value;
use std::collections::HashMap;
use tracing::trace;

const MAX_CALL_DEPTH: usize = 256;

type Env = HashMap<ValueId, Value>;

pub struct Interpreter<'s> {
    store: &'s mut Store,
    depth: usize,
}

impl<'s> Interpreter<'s> {
    pub fn new(store: &'s mut Store) -> Self {
        Self { store, depth: 0 }
    }

    pub fn call_method(&mut self, module: ModuleId, method: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let graph = self.store.method(module, method)?.clone();
        if graph.inputs.len() != args.len() + 1 {
            return Err(EvalError::Arity {
                method: method.to_string(),
                expected: graph.inputs.len().saturating_sub(1),
                found: args.len(),
            });
        }
        trace!(module = %self.store.path_of(module), method, "call");
        let inputs = std::iter::once(Value::Module(module)).chain(args).collect();
        self.run(&graph, inputs)
    }

    pub fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let graph = self
            .store
            .function(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;
        if graph.inputs.len() != args.len() {
            return Err(EvalError::Arity {
                method: name.to_string(),
                expected: graph.inputs.len(),
                found: args.len(),
            });
        }
        self.run(&graph, args)
    }

    /// Runs a graph with positional inputs.
    pub fn run(&mut self, graph: &Graph, inputs: Vec<Value>) -> Result<Value, EvalError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(EvalError::CallDepth(MAX_CALL_DEPTH));
        }
        self.depth += 1;
        let mut env: Env = graph.inputs.iter().copied().zip(inputs).collect();
        let result = self.run_block(&graph.body, &mut env).and_then(|outputs| {
            outputs
                .into_iter()
                .next()
                .ok_or_else(|| EvalError::ty("return", "graph has no output"))
        });
        self.depth -= 1;
        result
    }

    fn run_block(&mut self, block: &Block, env: &mut Env) -> Result<Vec<Value>, EvalError> {
        for instr in &block.instrs {
            let results = self.exec(&instr.op, env)?;
            for (id, value) in instr.outputs.iter().zip(results) {
                env.insert(*id, value);
            }
        }
        block.outputs.iter().map(|id| lookup(env, *id)).collect()
    }

    fn exec(&mut self, op: &Op, env: &mut Env) -> Result<Vec<Value>, EvalError> {
        let value = match op {
            Op::Const(value) => value.clone(),
            Op::GetAttr { object, name } => {
                let module = receiver(env, *object, name)?;
                match self.store.attr(module, name) {
                    Some(value) => value.clone(),
                    None if name == "training" => Value::Bool(self.store.module(module)?.training),
                    None => {
                        return Err(EvalError::MissingAttribute {
                            class: self.store.class_of(module)?.name.clone(),
                            name: name.clone(),
                        })
                    }
                }
            }
            Op::SetAttr { object, name, value } => {
                let module = receiver(env, *object, name)?;
                let value = lookup(env, *value)?;
                self.store.set_attr(module, name, value)?;
                return Ok(Vec::new());
            }
            Op::CallMethod { object, method, args } => {
                let module = receiver(env, *object, method)?;
                let args = lookup_all(env, args)?;
                self.call_method(module, method, args)?
            }
            Op::CallFunction { function, args } => {
                let args = lookup_all(env, args)?;
                self.call_function(function, args)?
            }
            Op::Fork { target, args } => {
                let args = lookup_all(env, args)?;
                let result = match target {
                    ForkTarget::Method(method) => {
                        let mut args = args.into_iter();
                        let object = args.next().unwrap_or(Value::None);
                        let module = object
                            .as_module()
                            .ok_or_else(|| EvalError::ty("fork", format!("receiver is {}", object.kind())))?;
                        self.call_method(module, method, args.collect())?
                    }
                    ForkTarget::Function(name) => self.call_function(name, args)?,
                    ForkTarget::Graph(graph) => self.run(graph, args)?,
                };
                Value::Future(Box::new(result))
            }
            Op::Wait { future } => match lookup(env, *future)? {
                Value::Future(inner) => *inner,
                other => return Err(EvalError::ty("wait", format!("expected Future, got {}", other.kind()))),
            },
            Op::Builtin { op, args } => {
                let args = lookup_all(env, args)?;
                eval_builtin(&mut self.store.heap, *op, &args)?
            }
            Op::If {
                cond,
                then_block,
                else_block,
            } => {
                let taken = if truthy(&lookup(env, *cond)?)? { then_block } else { else_block };
                return self.run_block(taken, env);
            }
            Op::Loop {
                trip_count,
                inits,
                body,
            } => {
                let trips = lookup(env, *trip_count)?
                    .as_int()
                    .ok_or_else(|| EvalError::ty("loop", "trip count is not an int"))?;
                let mut carried = lookup_all(env, inits)?;
                for i in 0..trips.max(0) {
                    let (index, params) = body
                        .params
                        .split_first()
                        .ok_or_else(|| EvalError::ty("loop", "body has no index parameter"))?;
                    env.insert(*index, Value::Int(i));
                    for (param, value) in params.iter().zip(carried) {
                        env.insert(*param, value);
                    }
                    carried = self.run_block(body, env)?;
                }
                return Ok(carried);
            }
        };
        Ok(vec![value])
    }
}

fn lookup(env: &Env, id: ValueId) -> Result<Value, EvalError> {
    env.get(&id).cloned().ok_or(EvalError::UndefinedValue(id.0))
}

fn lookup_all(env: &Env, ids: &[ValueId]) -> Result<Vec<Value>, EvalError> {
    ids.iter().map(|id| lookup(env, *id)).collect()
}

fn receiver(env: &Env, id: ValueId, member: &str) -> Result<ModuleId, EvalError> {
    let value = lookup(env, id)?;
    value
        .as_module()
        .ok_or_else(|| EvalError::ty(member, format!("receiver is {}, not a module", value.kind())))
}

fn truthy(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int(i) => Ok(*i != 0),
        Value::None => Ok(false),
        other => Err(EvalError::ty("if", format!("condition is {}", other.kind()))),
    }
}
