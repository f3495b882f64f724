//! Closure compiler for Turing trees.
//!
//! Every execution gets a fresh `Machine`: the variables (arguments copied
//! in, the rest zeroed), a virtual memory manager, and the safepoint counter
//! that bounds loops. Basic blocks are compiled through the scalar compiler
//! and, when they carry a specialized array, try it first and fall back to
//! the unspecialized array on a bailout.

use log::trace;

use crate::error::{EvoError, Signal};
use crate::jit::profiler::BranchObserver;
use crate::ssa::compiler::{compile as compile_scalar, CompiledProgram};
use crate::ssa::node::Node;
use crate::EvoResult;

use super::memory::VirtualMemoryManager;
use super::node::{ScalarBasicBlock, TuringNode};
use super::profile::TuringProfile;

type Stmt = Box<dyn Fn(&mut Machine<'_>) -> Result<(), Signal> + Send + Sync>;

/// Shape and limits of a Turing machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub variables: usize,
    pub arguments: usize,
    /// Loop iterations allowed per execution, across all loops.
    pub loop_budget: u64,
    /// Virtual memory pages allowed per execution.
    pub max_pages: usize,
}

impl MachineConfig {
    pub fn validate(&self) -> EvoResult<()> {
        if self.arguments == 0 {
            return Err(EvoError::NoArguments);
        }
        if self.arguments > self.variables {
            return Err(EvoError::InvalidConfig {
                message: format!(
                    "{} argument(s) do not fit in {} variable(s)",
                    self.arguments, self.variables
                ),
            });
        }
        if self.variables > u16::MAX as usize + 1 {
            return Err(EvoError::InvalidConfig {
                message: format!("{} variables exceed the addressable count", self.variables),
            });
        }
        Ok(())
    }
}

/// Per-execution state.
pub struct Machine<'p> {
    vars: Vec<f64>,
    scratch: Vec<f64>,
    memory: VirtualMemoryManager<'static>,
    counter: u64,
    loop_budget: u64,
    profile: Option<&'p mut TuringProfile>,
}

impl Machine<'_> {
    #[inline(always)]
    fn safepoint(&mut self) -> Result<(), Signal> {
        self.counter += 1;
        if self.counter > self.loop_budget {
            return Err(Signal::LoopBudgetExceeded);
        }
        Ok(())
    }
}

/// An executable Turing program.
pub struct TuringProgram {
    root: Stmt,
    config: MachineConfig,
    instrumented: bool,
}

impl TuringProgram {
    /// Execute once and copy every variable into `outputs`. A signal aborts
    /// the execution and leaves `outputs` untouched.
    pub fn invoke(
        &self,
        inputs: &[f64],
        outputs: &mut [f64],
        profile: Option<&mut TuringProfile>,
    ) -> Result<(), Signal> {
        let mut machine = Machine {
            vars: vec![0.0; self.config.variables],
            scratch: vec![0.0; self.config.variables],
            memory: VirtualMemoryManager::new(self.config.max_pages),
            counter: 0,
            loop_budget: self.config.loop_budget,
            profile,
        };

        for (var, input) in machine.vars.iter_mut().zip(inputs).take(self.config.arguments) {
            *var = *input;
        }

        (self.root)(&mut machine)?;

        for (output, var) in outputs.iter_mut().zip(&machine.vars) {
            *output = *var;
        }
        Ok(())
    }

    /// Execute once, turning a terminated execution into NaN outputs.
    pub fn run(&self, inputs: &[f64], outputs: &mut [f64], profile: Option<&mut TuringProfile>) {
        if let Err(signal) = self.invoke(inputs, outputs, profile) {
            trace!("Execution terminated: {}", signal);
            outputs.fill(f64::NAN);
        }
    }

    pub fn config(&self) -> MachineConfig {
        self.config
    }

    pub fn is_instrumented(&self) -> bool {
        self.instrumented
    }
}

/// Compile `tree`. With `instrumented`, blocks record that they were
/// reached and basic-block conditionals report to the profile passed at call
/// time.
pub fn compile(tree: &TuringNode, config: MachineConfig, instrumented: bool) -> EvoResult<TuringProgram> {
    config.validate()?;

    let mut compiler = TreeCompiler {
        config,
        instrumented,
        blocks: 0,
        basic_blocks: 0,
    };
    let root = compiler.compile(tree)?;

    trace!(
        "Compiled Turing tree with {} block(s) and {} basic block(s)",
        compiler.blocks,
        compiler.basic_blocks
    );

    Ok(TuringProgram {
        root,
        config,
        instrumented,
    })
}

/// Block and basic-block ordinals are assigned in post-order, matching
/// `TuringNode::rewrite` and `TuringNode::basic_blocks`.
struct TreeCompiler {
    config: MachineConfig,
    instrumented: bool,
    blocks: u32,
    basic_blocks: u32,
}

impl TreeCompiler {
    fn compile(&mut self, node: &TuringNode) -> EvoResult<Stmt> {
        let stmt: Stmt = match node {
            TuringNode::NoOp => Box::new(|_| Ok(())),
            TuringNode::Block(children) => {
                let stmts = children
                    .iter()
                    .filter(|child| !matches!(child, TuringNode::NoOp))
                    .map(|child| self.compile(child))
                    .collect::<EvoResult<Vec<_>>>()?;

                let ordinal = self.blocks;
                self.blocks += 1;

                if self.instrumented {
                    Box::new(move |machine| {
                        if let Some(profile) = machine.profile.as_deref_mut() {
                            profile.mark_reached(ordinal);
                        }
                        stmts.iter().try_for_each(|stmt| stmt(machine))
                    })
                } else {
                    Box::new(move |machine| stmts.iter().try_for_each(|stmt| stmt(machine)))
                }
            }
            TuringNode::WhileLoop { condition, body } => {
                let condition = self.variable(*condition)?;
                let body = self.compile(body)?;
                Box::new(move |machine| {
                    while machine.vars[condition] > 0.0 {
                        machine.safepoint()?;
                        body(machine)?;
                    }
                    Ok(())
                })
            }
            TuringNode::MemoryRead { target } => {
                let target = self.variable(*target)?;
                Box::new(move |machine| {
                    machine.vars[target] = machine.memory.read(machine.vars[target])?;
                    Ok(())
                })
            }
            TuringNode::MemoryWrite { address, value } => {
                let address = self.variable(*address)?;
                let value = self.variable(*value)?;
                Box::new(move |machine| {
                    machine
                        .memory
                        .write(machine.vars[address], machine.vars[value])
                })
            }
            TuringNode::BasicBlock(block) => {
                let ordinal = self.basic_blocks;
                self.basic_blocks += 1;
                self.compile_basic_block(block, ordinal)?
            }
        };

        Ok(stmt)
    }

    fn variable(&self, index: u16) -> EvoResult<usize> {
        let variable = index as usize;
        if variable >= self.config.variables {
            return Err(EvoError::VariableOutOfRange {
                variable,
                count: self.config.variables,
            });
        }
        Ok(variable)
    }

    fn scalar(&self, nodes: &[Option<Node>], profile: Option<u32>) -> EvoResult<CompiledProgram> {
        let program = compile_scalar(nodes, self.config.variables, false, profile)?;
        if program.arity() > self.config.variables {
            return Err(EvoError::VariableOutOfRange {
                variable: program.arity() - 1,
                count: self.config.variables,
            });
        }
        Ok(program)
    }

    fn compile_basic_block(&self, block: &ScalarBasicBlock, ordinal: u32) -> EvoResult<Stmt> {
        let profile = self.instrumented.then_some(ordinal);
        let baseline = self.scalar(&block.nodes, profile)?;
        let speculative = match &block.specialized {
            Some(nodes) => Some(self.scalar(nodes, None)?),
            None => None,
        };

        Ok(Box::new(move |machine| {
            let Machine {
                vars,
                scratch,
                profile,
                ..
            } = machine;

            if let Some(speculative) = &speculative {
                match speculative.invoke(vars, scratch, None) {
                    Ok(()) => {
                        vars.copy_from_slice(scratch);
                        return Ok(());
                    }
                    Err(Signal::Bailout) => {}
                    Err(signal) => return Err(signal),
                }
            }

            let observer = profile
                .as_deref_mut()
                .map(|profile| &mut profile.branches as &mut dyn BranchObserver);
            baseline.invoke(vars, scratch, observer)?;
            vars.copy_from_slice(scratch);
            Ok(())
        }))
    }
}
