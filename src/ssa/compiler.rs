//! Closure compiler for scalar IR arrays.
//!
//! The compiler works by:
//! 1. Validating operand ordering and the leading node
//! 2. Counting readers of every node (liveness)
//! 3. Lowering each node into a closure, inlining single-use nodes into
//!    their consumer and materializing everything else into a temporary
//! 4. Returning a `CompiledProgram` that runs the materialized steps in
//!    position order and then reads the output slots

use std::fmt;

use log::{debug, trace};

use crate::error::{EvoError, Signal};
use crate::jit::profiler::{BranchId, BranchObserver};
use crate::EvoResult;

use super::node::{validate, BinaryOp, Node};

type Thunk = Box<dyn Fn(&mut Frame<'_, '_>) -> Result<f64, Signal> + Send + Sync>;

/// Per-call state seen by compiled closures.
pub struct Frame<'a, 'o> {
    inputs: &'a [f64],
    temps: Vec<f64>,
    observer: Option<&'o mut dyn BranchObserver>,
}

impl Frame<'_, '_> {
    #[inline(always)]
    fn observe(&mut self, branch: BranchId, taken: bool) {
        if let Some(observer) = self.observer.as_mut() {
            if taken {
                observer.taken(branch);
            } else {
                observer.not_taken(branch);
            }
        }
    }
}

/// A value that needs no computation.
#[derive(Debug, Clone, Copy)]
enum Value {
    Constant(f64),
    Input(usize),
    Temp(usize),
}

impl Value {
    #[inline(always)]
    fn read(self, frame: &Frame<'_, '_>) -> f64 {
        match self {
            Value::Constant(value) => value,
            Value::Input(index) => frame.inputs[index],
            Value::Temp(index) => frame.temps[index],
        }
    }
}

/// The compiled form of a node as seen by its readers.
enum Operand {
    Value(Value),
    /// Single-use expression, moved into its only reader.
    Inline(Thunk),
}

impl Operand {
    fn into_thunk(self) -> Thunk {
        match self {
            Operand::Value(value) => Box::new(move |frame| Ok(value.read(frame))),
            Operand::Inline(thunk) => thunk,
        }
    }
}

struct Step {
    slot: usize,
    thunk: Thunk,
}

/// An executable scalar program.
pub struct CompiledProgram {
    steps: Vec<Step>,
    outputs: Vec<Value>,
    temps: usize,
    arity: usize,
}

impl CompiledProgram {
    /// Run the program. Outputs are only written once every step succeeded,
    /// so a signal leaves `outputs` untouched.
    ///
    /// Panics if `inputs` is shorter than `arity()`.
    pub fn invoke(
        &self,
        inputs: &[f64],
        outputs: &mut [f64],
        observer: Option<&mut dyn BranchObserver>,
    ) -> Result<(), Signal> {
        let mut frame = Frame {
            inputs,
            temps: vec![0.0; self.temps],
            observer,
        };

        for step in &self.steps {
            let value = (step.thunk)(&mut frame)?;
            frame.temps[step.slot] = value;
        }

        for (output, value) in outputs.iter_mut().zip(&self.outputs) {
            *output = value.read(&frame);
        }

        Ok(())
    }

    /// Number of inputs the program reads.
    pub fn arity(&self) -> usize {
        self.arity
    }
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("steps", &self.steps.len())
            .field("temps", &self.temps)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Compile a node array whose last `outputs_count` slots are the outputs.
///
/// With `checked`, division, modulo, log and pow raise
/// `Signal::InvalidOperation` instead of producing NaN or an infinity. With
/// `profile`, every conditional reports its selection under that block id to
/// the observer passed at call time.
pub fn compile(
    nodes: &[Option<Node>],
    outputs_count: usize,
    checked: bool,
    profile: Option<u32>,
) -> EvoResult<CompiledProgram> {
    let length = nodes.len();
    if outputs_count == 0 || outputs_count > length {
        return Err(EvoError::InvalidConfig {
            message: format!(
                "cannot take {} output(s) from a program of {} node(s)",
                outputs_count, length
            ),
        });
    }

    match nodes.first() {
        Some(Some(node)) if node.is_direct() => {}
        _ => return Err(EvoError::NonCompilableLeadingNode),
    }

    validate(nodes)?;

    let outputs_start = length - outputs_count;
    if let Some(index) = (outputs_start..length).find(|&i| nodes[i].is_none()) {
        return Err(EvoError::AbsentOutput { index });
    }

    let materialize = liveness(nodes, outputs_start);

    let mut operands: Vec<Option<Operand>> = Vec::with_capacity(length);
    let mut steps = Vec::new();
    let mut temps = 0;
    let mut arity = 0;

    for (index, node) in nodes.iter().enumerate() {
        let Some(node) = *node else {
            operands.push(None);
            continue;
        };

        let operand = match node {
            Node::Constant { value } => Operand::Value(Value::Constant(value)),
            Node::Argument { parameter } => {
                arity = arity.max(parameter as usize + 1);
                Operand::Value(Value::Input(parameter as usize))
            }
            Node::Move { target } => match &operands[target as usize] {
                Some(Operand::Value(value)) => Operand::Value(*value),
                _ => {
                    return Err(EvoError::UnknownError {
                        message: format!("alias {} of a non-materialized node", index),
                    })
                }
            },
            _ => {
                let thunk = lower(node, index as u16, &mut operands, checked, profile)?;
                if materialize[index] {
                    steps.push(Step { slot: temps, thunk });
                    temps += 1;
                    Operand::Value(Value::Temp(temps - 1))
                } else {
                    Operand::Inline(thunk)
                }
            }
        };

        operands.push(Some(operand));
    }

    let mut outputs = Vec::with_capacity(outputs_count);
    for (index, operand) in operands.iter().enumerate().skip(outputs_start) {
        match operand {
            Some(Operand::Value(value)) => outputs.push(*value),
            _ => return Err(EvoError::AbsentOutput { index }),
        }
    }

    trace!(
        "Compiled {} node(s) into {} step(s) with {} output(s) (checked = {}, profile = {:?})",
        length,
        steps.len(),
        outputs_count,
        checked,
        profile
    );

    Ok(CompiledProgram {
        steps,
        outputs,
        temps,
        arity,
    })
}

/// Decide which nodes get a temporary: anything read more than once, read
/// through an alias, or sitting in the output region.
fn liveness(nodes: &[Option<Node>], outputs_start: usize) -> Vec<bool> {
    let mut readers = vec![0u32; nodes.len()];
    let mut aliased = vec![false; nodes.len()];

    for node in nodes.iter().flatten() {
        for read in node.reads() {
            readers[read as usize] += 1;
        }
        if let Node::Move { target } = node {
            aliased[*target as usize] = true;
        }
    }

    nodes
        .iter()
        .enumerate()
        .map(|(index, node)| match node {
            Some(node) if !node.is_direct() => {
                index >= outputs_start || readers[index] > 1 || aliased[index]
            }
            _ => false,
        })
        .collect()
}

fn take_operand(operands: &mut [Option<Operand>], slot: u16) -> EvoResult<Thunk> {
    let slot = slot as usize;
    match operands[slot].take() {
        Some(Operand::Value(value)) => {
            operands[slot] = Some(Operand::Value(value));
            Ok(Operand::Value(value).into_thunk())
        }
        Some(inline) => Ok(inline.into_thunk()),
        None => Err(EvoError::UnknownError {
            message: format!("operand {} consumed twice", slot),
        }),
    }
}

fn lower(
    node: Node,
    index: u16,
    operands: &mut [Option<Operand>],
    checked: bool,
    profile: Option<u32>,
) -> EvoResult<Thunk> {
    let thunk: Thunk = match node {
        Node::Binary { op, lhs, rhs } => {
            let x = take_operand(operands, lhs)?;
            let y = take_operand(operands, rhs)?;
            if checked && op.is_checked() {
                lower_checked(op, index, x, y)
            } else {
                Box::new(move |frame| {
                    let x = x(frame)?;
                    let y = y(frame)?;
                    Ok(op.apply(x, y))
                })
            }
        }
        Node::Conditional { x, y, cond } => {
            let x = take_operand(operands, x)?;
            let y = take_operand(operands, y)?;
            let z = take_operand(operands, cond)?;
            match profile {
                Some(block) => {
                    let branch = BranchId::new(block, index);
                    Box::new(move |frame| {
                        if z(frame)? > 0.0 {
                            frame.observe(branch, true);
                            x(frame)
                        } else {
                            frame.observe(branch, false);
                            y(frame)
                        }
                    })
                }
                None => Box::new(move |frame| if z(frame)? > 0.0 { x(frame) } else { y(frame) }),
            }
        }
        Node::Bailout {
            branch,
            cond,
            taken,
        } => {
            let z = take_operand(operands, cond)?;
            let branch = take_operand(operands, branch)?;
            Box::new(move |frame| {
                if (z(frame)? > 0.0) != taken {
                    return Err(Signal::Bailout);
                }
                branch(frame)
            })
        }
        Node::Constant { .. } | Node::Argument { .. } | Node::Move { .. } => {
            return Err(EvoError::UnknownError {
                message: format!("direct node {} lowered as an expression", index),
            })
        }
    };

    Ok(thunk)
}

fn lower_checked(op: BinaryOp, index: u16, x: Thunk, y: Thunk) -> Thunk {
    Box::new(move |frame| {
        let x = x(frame)?;
        let y = y(frame)?;
        if op.is_invalid(x, y) {
            return Err(Signal::InvalidOperation(index));
        }
        Ok(op.apply(x, y))
    })
}

/// A speculative program paired with its unspecialized fallback. Calls try
/// the speculative form first and re-run the baseline on a bailout.
#[derive(Debug)]
pub struct Tiered {
    speculative: Option<CompiledProgram>,
    baseline: CompiledProgram,
}

impl Tiered {
    pub fn new(speculative: Option<CompiledProgram>, baseline: CompiledProgram) -> Self {
        Self {
            speculative,
            baseline,
        }
    }

    pub fn is_speculative(&self) -> bool {
        self.speculative.is_some()
    }

    pub fn invoke(&self, inputs: &[f64], outputs: &mut [f64]) -> Result<(), Signal> {
        if let Some(speculative) = &self.speculative {
            match speculative.invoke(inputs, outputs, None) {
                Err(Signal::Bailout) => {
                    trace!("Speculative guard failed, deoptimizing call");
                }
                result => return result,
            }
        }

        self.baseline.invoke(inputs, outputs, None)
    }
}

/// Compile a speculative array and its baseline together.
pub fn compile_tiered(
    speculative: Option<&[Option<Node>]>,
    baseline: &[Option<Node>],
    outputs_count: usize,
) -> EvoResult<Tiered> {
    let baseline = compile(baseline, outputs_count, false, None)?;
    let speculative = match speculative {
        Some(nodes) => Some(compile(nodes, outputs_count, false, None)?),
        None => None,
    };

    debug!(
        "Compiled tiered program (speculative = {})",
        speculative.is_some()
    );

    Ok(Tiered::new(speculative, baseline))
}
