//! The dispatch loop of one activation.
//!
//! Evaluation stack slots live in the frame above the locals. `top` is the index of the
//! first free slot. Instructions with a fixed stack effect only read their operands and
//! write their results in place; the loop then moves `top` and nulls the slots that were
//! popped. Calls, returns and exception handling transitions move `top` themselves.
use crate::{
    utils::il_label,
    value::{ManagedPointer, ObjectRef, StackValue},
    vm::{
        analysis::OpCodeType,
        engine::{Engine, PreparedMethod},
        error::{EngineError, ExecutionError, FaultKind, GuestException, Trap},
        exceptions::{ExceptionState, Unwind},
        opcodes::{Opcode, OperandKind, StackEffect},
        stack::Frame,
        tracer::Tracer,
    },
    vm_msg, vm_trace, vm_trace_call, vm_trace_exception, vm_trace_instruction, vm_trace_return,
};
use std::sync::Arc;

/// What the loop does after an instruction.
#[must_use]
#[derive(Debug)]
pub(crate) enum StepResult {
    /// Fall through to the next instruction.
    Continue,
    Jump(usize),
    Return(Option<StackValue>),
    /// An exception left every handler of this activation.
    Propagate(GuestException),
}

pub(crate) struct Activation<'e> {
    pub(super) engine: &'e Engine,
    pub(super) method: Arc<PreparedMethod>,
    pub(super) frame: Frame,
    pub(super) top: usize,
    pub(super) eh: ExceptionState,
    pub(super) pc: usize,
    depth: usize,
    back_edges: u64,
}

impl<'e> Activation<'e> {
    pub(crate) fn new(
        engine: &'e Engine,
        method: Arc<PreparedMethod>,
        frame: Frame,
        top: usize,
        depth: usize,
    ) -> Self {
        Self {
            engine,
            method,
            frame,
            top,
            eh: ExceptionState::new(),
            pc: 0,
            depth,
            back_edges: 0,
        }
    }

    pub(super) fn engine(&self) -> &'e Engine {
        self.engine
    }

    pub(super) fn tracer_enabled(&self) -> bool {
        self.engine.tracer_enabled()
    }

    pub(super) fn tracer(&self) -> crate::utils::sync::MutexGuard<'e, Tracer> {
        self.engine.tracer()
    }

    pub(super) fn indent(&self) -> usize {
        self.depth.saturating_sub(1)
    }

    pub(crate) fn run(mut self, start: usize) -> Result<Option<StackValue>, ExecutionError> {
        let method = self.method.clone();
        let name = &method.symbol.name;
        vm_trace_call!(self, name, "");
        let trace_instructions = self.engine.config().trace_instructions;

        let mut pc = start;
        loop {
            self.pc = pc;
            let op = method.code.opcode_at(pc)?;
            if trace_instructions {
                vm_trace_instruction!(self, pc, op.mnemonic());
            }
            let before = self.top;

            pc = match self.step(pc, op) {
                Ok(StepResult::Continue) => {
                    self.apply_effect(op, before)?;
                    method.code.next_pc(pc)?
                }
                Ok(StepResult::Jump(target)) => {
                    self.apply_effect(op, before)?;
                    if target <= pc
                        && matches!(
                            op.operand(),
                            OperandKind::ShortBrTarget | OperandKind::BrTarget | OperandKind::Switch
                        )
                    {
                        self.poll_osr(pc, target);
                    }
                    target
                }
                Ok(StepResult::Return(value)) => {
                    vm_trace_return!(self, name);
                    return Ok(value);
                }
                Ok(StepResult::Propagate(exception)) => {
                    vm_trace!(self, "exception leaves {}: {}", name, exception);
                    return Err(ExecutionError::Guest(exception));
                }
                Err(Trap::Engine(e)) => {
                    vm_error!(self, "engine error in {} at {:?}: {}", name, il_label(pc), e);
                    return Err(e.into());
                }
                Err(Trap::Fault(kind, message)) => {
                    let exception = self.engine.fault_exception(kind, message);
                    self.dispatch(pc, exception)?
                }
                Err(Trap::Thrown(exception)) => self.dispatch(pc, exception)?,
            };
        }
    }

    /// Moves `top` by the fixed stack effect of `op` and nulls the popped slots.
    fn apply_effect(&mut self, op: Opcode, before: usize) -> Result<(), EngineError> {
        let StackEffect::Fixed { pop, push } = op.stack_effect() else {
            return Ok(());
        };
        if self.top != before {
            return Err(EngineError::invalid_state(self.pc, format!("{} moved the stack top", op)));
        }
        let base = self.method.layout.stack_base();
        let after = before
            .checked_sub(pop as usize)
            .filter(|t| *t >= base)
            .ok_or_else(|| EngineError::invalid_state(self.pc, "evaluation stack underflow"))?
            + push as usize;
        if after > self.frame.len() {
            return Err(EngineError::invalid_state(self.pc, "evaluation stack overflow"));
        }
        self.frame.clear_range(after, before);
        self.top = after;
        Ok(())
    }

    fn poll_osr(&mut self, pc: usize, target: usize) {
        self.back_edges += 1;
        let threshold = self.engine.config().osr_threshold;
        let triggered = threshold > 0 && self.back_edges >= threshold;
        self.engine.metrics().record_osr_poll(triggered);
        if triggered {
            self.back_edges = 0;
            tracing::trace!(
                method = %self.method.symbol.name,
                from = pc,
                to = target,
                "back-edge counter reached the OSR threshold"
            );
            vm_msg!(self, "OSR threshold reached at {:?} -> {:?}", il_label(pc), il_label(target));
        }
    }

    /// Hands `exception` raised at `pc` to this activation's handlers.
    fn dispatch(&mut self, pc: usize, exception: GuestException) -> Result<usize, ExecutionError> {
        self.engine.metrics().record_fault();
        vm_trace_exception!(self, &exception.to_string(), pc);
        let method = self.method.clone();
        match self
            .eh
            .dispatch(&method.regions, exception, pc, 0, self.engine.resolver())?
        {
            Unwind::Resume { pc, exception } => {
                self.enter_handler(pc, exception)
                    .map_err(|trap| self.engine.raise(trap))?;
                Ok(pc)
            }
            Unwind::Propagate(exception) => {
                vm_trace!(self, "no handler for {}", exception);
                Err(ExecutionError::Guest(exception))
            }
        }
    }

    /// Starts a handler at `pc` with a fresh evaluation stack.
    pub(super) fn enter_handler(&mut self, pc: usize, exception: Option<ObjectRef>) -> Result<(), Trap> {
        self.reset_stack();
        match exception {
            Some(object) => {
                self.push(StackValue::ObjectRef(object))?;
                self.engine.metrics().record_catch();
            }
            None if self.method.regions.is_finally_entry(pc) => self.engine.metrics().record_finally(),
            None => {}
        }
        Ok(())
    }

    fn underflow(&self) -> Trap {
        EngineError::invalid_state(self.pc, "evaluation stack underflow").into()
    }

    /// Frame slot of the `n`th value from the top of the stack; `0` is the top.
    fn stack_slot(&self, n: usize) -> Result<usize, Trap> {
        self.top
            .checked_sub(n + 1)
            .filter(|slot| *slot >= self.method.layout.stack_base())
            .ok_or_else(|| self.underflow())
    }

    pub(super) fn peek(&self, n: usize) -> Result<&StackValue, Trap> {
        Ok(self.frame.get(self.stack_slot(n)?)?)
    }

    /// Writes the result of an instruction that pops `pops` values.
    pub(super) fn result(&mut self, pops: usize, value: StackValue) -> Result<(), Trap> {
        self.result_at(pops, 0, value)
    }

    /// Writes the `index`th result of an instruction that pops `pops` values.
    pub(super) fn result_at(&mut self, pops: usize, index: usize, value: StackValue) -> Result<(), Trap> {
        let slot = self.result_slot(pops)?;
        Ok(self.frame.put(slot + index, value)?)
    }

    /// The slot the first result of an instruction that pops `pops` values lands in.
    pub(super) fn result_slot(&self, pops: usize) -> Result<usize, Trap> {
        self.top
            .checked_sub(pops)
            .filter(|slot| *slot >= self.method.layout.stack_base())
            .ok_or_else(|| self.underflow())
    }

    pub(super) fn push(&mut self, value: StackValue) -> Result<(), Trap> {
        if self.top >= self.frame.len() {
            return Err(EngineError::invalid_state(self.pc, "evaluation stack overflow").into());
        }
        self.frame.put(self.top, value)?;
        self.top += 1;
        Ok(())
    }

    pub(super) fn pop(&mut self) -> Result<StackValue, Trap> {
        let slot = self.stack_slot(0)?;
        let value = self.frame.take(slot)?;
        self.top = slot;
        Ok(value)
    }

    /// Pops `count` call arguments, returning them in declaration order.
    pub(super) fn pop_arguments(&mut self, count: usize) -> Result<Vec<StackValue>, Trap> {
        if count == 0 {
            return Ok(vec![]);
        }
        let first = self.stack_slot(count - 1)?;
        let args = (first..self.top)
            .map(|slot| self.frame.take(slot))
            .collect::<Result<Vec<_>, _>>()?;
        self.top = first;
        Ok(args)
    }

    /// A copy of the current argument slots.
    pub(super) fn arguments(&self) -> Result<Vec<StackValue>, Trap> {
        (0..self.method.layout.arguments)
            .map(|slot| self.frame.get(slot).cloned().map_err(Trap::from))
            .collect()
    }

    pub(super) fn reset_stack(&mut self) {
        let base = self.method.layout.stack_base();
        self.frame.clear_range(base, self.top);
        self.top = base;
    }

    pub(super) fn op_type(&self, pc: usize) -> Result<OpCodeType, Trap> {
        self.method
            .analysis
            .op_type(pc)
            .ok_or_else(|| EngineError::invalid_state(pc, "instruction has no type annotation").into())
    }

    pub(super) fn int32_at(&self, n: usize) -> Result<i32, Trap> {
        Ok(self.frame.get_int32(self.stack_slot(n)?)?)
    }

    pub(super) fn int64_at(&self, n: usize) -> Result<i64, Trap> {
        Ok(self.frame.get_int64(self.stack_slot(n)?)?)
    }

    /// Reads an `int32` or `native int` operand, sign-extended to `isize`.
    pub(super) fn native_at(&self, n: usize) -> Result<isize, Trap> {
        let slot = self.stack_slot(n)?;
        match self.frame.get(slot)? {
            StackValue::Int32(i) => Ok(*i as isize),
            StackValue::NativeInt(i) => Ok(*i),
            other => Err(EngineError::SlotType {
                slot,
                expected: "int32 or native int",
                actual: format!("{:?}", other),
            }
            .into()),
        }
    }

    pub(super) fn float_at(&self, n: usize) -> Result<f64, Trap> {
        Ok(self.frame.get_float(self.stack_slot(n)?)?)
    }

    pub(super) fn object_at(&self, n: usize) -> Result<ObjectRef, Trap> {
        Ok(self.frame.get_object(self.stack_slot(n)?)?)
    }

    pub(super) fn pointer_at(&self, n: usize) -> Result<ManagedPointer, Trap> {
        Ok(self.frame.get_pointer(self.stack_slot(n)?)?)
    }

    /// Reads an address operand of an indirection. Unmanaged addresses are not supported,
    /// and an uninitialized `&` slot faults like a null pointer.
    pub(super) fn address_at(&self, n: usize) -> Result<ManagedPointer, Trap> {
        let slot = self.stack_slot(n)?;
        match self.frame.get(slot)? {
            StackValue::ManagedPtr(p) => Ok(p.clone()),
            StackValue::ObjectRef(o) if o.is_null() => Err(FaultKind::NullReference.into()),
            StackValue::NativeInt(_) => Err(EngineError::NotImplemented(
                "indirection through unmanaged pointers".to_string(),
            )
            .into()),
            other => Err(EngineError::SlotType {
                slot,
                expected: "&",
                actual: format!("{:?}", other),
            }
            .into()),
        }
    }

    /// An array index operand. Negative indices fault.
    pub(super) fn index_at(&self, n: usize) -> Result<usize, Trap> {
        usize::try_from(self.native_at(n)?).map_err(|_| FaultKind::IndexOutOfRange.into())
    }
}
