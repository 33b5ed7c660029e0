//! Structured exception handling for a single activation.
//!
//! A method's exception regions are kept in declaration order, which is also their lookup
//! priority: nested regions are declared before the regions enclosing them. Handling is a
//! small state machine driven by the interpreter:
//!
//! - a **fault** (implicit or `throw`) scans the regions for the first one protecting the
//!   faulting offset and transfers control to its handler;
//! - **`leave`** exits protected code, running every `finally` between the leave and its
//!   target, innermost first;
//! - **`endfinally`** either re-raises the exception that entered the finally, or continues
//!   with the next queued finally of a pending `leave`.
use crate::{
    resolve::SymbolResolver,
    types::{ResolutionScope, Token, TypeSymbol},
    value::ObjectRef,
    vm::error::{EngineError, GuestException},
};
use std::{collections::VecDeque, ops::Range, sync::Arc};

#[derive(Clone, Debug, PartialEq)]
pub enum RegionKind {
    /// A typed `catch`; the token names the catch type.
    Exception(Token),
    Finally,
    Fault,
    Filter { filter_offset: usize },
}

/// One entry of a method body's exception handling table.
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionHandlerRegion {
    pub try_offset: usize,
    pub try_length: usize,
    pub handler_offset: usize,
    pub handler_length: usize,
    pub kind: RegionKind,
}

impl ExceptionHandlerRegion {
    pub fn catch(try_range: Range<usize>, handler_range: Range<usize>, catch_type: Token) -> Self {
        Self::new(try_range, handler_range, RegionKind::Exception(catch_type))
    }

    pub fn finally(try_range: Range<usize>, handler_range: Range<usize>) -> Self {
        Self::new(try_range, handler_range, RegionKind::Finally)
    }

    pub fn fault(try_range: Range<usize>, handler_range: Range<usize>) -> Self {
        Self::new(try_range, handler_range, RegionKind::Fault)
    }

    pub fn filter(try_range: Range<usize>, handler_range: Range<usize>, filter_offset: usize) -> Self {
        Self::new(try_range, handler_range, RegionKind::Filter { filter_offset })
    }

    pub fn new(try_range: Range<usize>, handler_range: Range<usize>, kind: RegionKind) -> Self {
        Self {
            try_offset: try_range.start,
            try_length: try_range.len(),
            handler_offset: handler_range.start,
            handler_length: handler_range.len(),
            kind,
        }
    }

    pub fn try_range(&self) -> Range<usize> {
        self.try_offset..self.try_offset + self.try_length
    }

    pub fn handler_range(&self) -> Range<usize> {
        self.handler_offset..self.handler_offset + self.handler_length
    }

    pub fn try_contains(&self, pc: usize) -> bool {
        self.try_range().contains(&pc)
    }

    pub fn handler_contains(&self, pc: usize) -> bool {
        self.handler_range().contains(&pc)
    }

    pub fn is_finally(&self) -> bool {
        self.kind == RegionKind::Finally
    }
}

/// A region with its catch type resolved, ready for dispatch.
#[derive(Clone, Debug)]
pub struct ResolvedRegion {
    pub region: ExceptionHandlerRegion,
    pub catch_type: Option<Arc<TypeSymbol>>,
}

/// The exception regions of a prepared method, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct RegionTable {
    regions: Vec<ResolvedRegion>,
}

impl RegionTable {
    /// Resolves every catch type up front so dispatch never touches the resolver's token tables.
    pub fn new(
        regions: &[ExceptionHandlerRegion],
        resolver: &dyn SymbolResolver,
        scope: &ResolutionScope,
    ) -> Result<Self, EngineError> {
        let regions = regions
            .iter()
            .map(|region| {
                let catch_type = match &region.kind {
                    RegionKind::Exception(token) => Some(resolver.resolve_type(*token, scope)?),
                    _ => None,
                };
                Ok(ResolvedRegion {
                    region: region.clone(),
                    catch_type,
                })
            })
            .collect::<Result<_, EngineError>>()?;
        Ok(Self { regions })
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ResolvedRegion> {
        self.regions.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedRegion> {
        self.regions.iter()
    }

    /// `true` if `pc` is the first instruction of some finally handler.
    pub fn is_finally_entry(&self, pc: usize) -> bool {
        self.regions
            .iter()
            .any(|r| r.region.is_finally() && r.region.handler_offset == pc)
    }

    /// The first region, starting at `start`, that acts on an exception raised at `pc`.
    ///
    /// Typed catches only match when the exception's runtime type is assignable to the
    /// catch type. `fault` and `filter` regions are not supported and fail the activation.
    pub fn find_handler(
        &self,
        pc: usize,
        start: usize,
        exception: &ObjectRef,
        resolver: &dyn SymbolResolver,
    ) -> Result<Option<usize>, EngineError> {
        for (index, entry) in self.regions.iter().enumerate().skip(start) {
            if !entry.region.try_contains(pc) {
                continue;
            }
            match &entry.region.kind {
                RegionKind::Finally => return Ok(Some(index)),
                RegionKind::Exception(_) => {
                    let assignable = match (&entry.catch_type, exception.type_handle()) {
                        (Some(catch), Some(thrown)) => resolver.is_assignable(thrown, catch.handle),
                        _ => false,
                    };
                    if assignable {
                        return Ok(Some(index));
                    }
                }
                RegionKind::Fault => {
                    return Err(EngineError::NotImplemented("fault handlers".to_string()))
                }
                RegionKind::Filter { .. } => {
                    return Err(EngineError::NotImplemented("filter handlers".to_string()))
                }
            }
        }
        Ok(None)
    }

    /// Finally regions exited by a `leave` from `pc` to `target`, innermost first.
    pub fn finallies_between(&self, pc: usize, target: usize) -> VecDeque<usize> {
        self.regions
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.region.is_finally() && r.region.try_contains(pc) && !r.region.try_contains(target)
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Where analysis continues after a `throw` at `pc`: past the furthest handler of the
/// innermost protected block, or `None` when `pc` is unprotected.
pub fn resume_after_throw(regions: &[ExceptionHandlerRegion], pc: usize) -> Option<usize> {
    let innermost = regions.iter().find(|r| r.try_contains(pc))?;
    regions
        .iter()
        .filter(|r| r.try_offset == innermost.try_offset && r.try_length == innermost.try_length)
        .map(|r| r.handler_offset + r.handler_length)
        .max()
}

/// An exception that entered a handler and has not been left yet.
#[derive(Clone, Debug)]
struct Pending {
    exception: GuestException,
    fault_pc: usize,
    region: usize,
}

/// A `leave` waiting for its finally blocks to complete.
#[derive(Clone, Debug)]
struct LeaveFrame {
    target: usize,
    queued: VecDeque<usize>,
    running: usize,
}

/// Where execution goes after an exception handling transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Unwind {
    /// Continue at `pc` with an empty evaluation stack, pushing `exception` first if set.
    Resume {
        pc: usize,
        exception: Option<ObjectRef>,
    },
    /// No region of this activation handles the exception.
    Propagate(GuestException),
}

/// Exception handling state of one activation.
#[derive(Debug, Default)]
pub struct ExceptionState {
    pending: Vec<Pending>,
    leaves: Vec<LeaveFrame>,
}

impl ExceptionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while some handler entered by an exception is still executing.
    pub fn is_unwinding(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The exception being handled at `pc`, if `pc` lies inside its handler.
    pub fn current_exception(&self, table: &RegionTable, pc: usize) -> Option<&GuestException> {
        self.pending
            .iter()
            .rev()
            .find(|p| table.get(p.region).is_some_and(|r| r.region.handler_contains(pc)))
            .map(|p| &p.exception)
    }

    /// Dispatches `exception` raised at `fault_pc`, scanning regions from `start`.
    pub fn dispatch(
        &mut self,
        table: &RegionTable,
        exception: GuestException,
        fault_pc: usize,
        start: usize,
        resolver: &dyn SymbolResolver,
    ) -> Result<Unwind, EngineError> {
        let Some(index) = table.find_handler(fault_pc, start, &exception.object, resolver)? else {
            self.pending.clear();
            self.leaves.clear();
            return Ok(Unwind::Propagate(exception));
        };
        let Some(entry) = table.get(index) else {
            return Err(EngineError::invalid_state(fault_pc, "handler index out of range"));
        };
        let handler = entry.region.handler_offset;

        // Handlers and leaves the exception escapes from are abandoned.
        self.pending.retain(|p| {
            table
                .get(p.region)
                .is_some_and(|r| r.region.handler_contains(handler))
        });
        self.leaves.retain(|l| {
            table
                .get(l.running)
                .is_some_and(|r| r.region.handler_contains(handler))
        });

        let push = match entry.region.kind {
            RegionKind::Exception(_) => Some(exception.object.clone()),
            _ => None,
        };
        self.pending.push(Pending {
            exception,
            fault_pc,
            region: index,
        });
        Ok(Unwind::Resume {
            pc: handler,
            exception: push,
        })
    }

    /// Executes `leave` from `pc` to `target` and returns the next offset to run.
    pub fn leave(&mut self, table: &RegionTable, pc: usize, target: usize) -> usize {
        while let Some(top) = self.pending.last() {
            let exits = table.get(top.region).map_or(true, |r| {
                !r.region.handler_contains(pc) || !r.region.handler_contains(target)
            });
            if !exits {
                break;
            }
            self.pending.pop();
        }

        let mut queued = table.finallies_between(pc, target);
        match queued.pop_front() {
            None => target,
            Some(first) => {
                self.leaves.push(LeaveFrame {
                    target,
                    queued,
                    running: first,
                });
                table
                    .get(first)
                    .map_or(target, |r| r.region.handler_offset)
            }
        }
    }

    /// Executes `endfinally` at `pc`.
    pub fn end_finally(
        &mut self,
        table: &RegionTable,
        pc: usize,
        resolver: &dyn SymbolResolver,
    ) -> Result<Unwind, EngineError> {
        let entered_by_exception = self.pending.last().is_some_and(|p| {
            table
                .get(p.region)
                .is_some_and(|r| r.region.is_finally() && r.region.handler_contains(pc))
        });
        if entered_by_exception {
            if let Some(p) = self.pending.pop() {
                return self.dispatch(table, p.exception, p.fault_pc, p.region + 1, resolver);
            }
        }

        let Some(frame) = self.leaves.last_mut() else {
            return Err(EngineError::invalid_program(pc, "endfinally outside of a finally block"));
        };
        let pc = match frame.queued.pop_front() {
            Some(next) => {
                frame.running = next;
                table
                    .get(next)
                    .map(|r| r.region.handler_offset)
                    .ok_or_else(|| EngineError::invalid_state(pc, "finally index out of range"))?
            }
            None => {
                let target = frame.target;
                self.leaves.pop();
                target
            }
        };
        Ok(Unwind::Resume {
            pc,
            exception: None,
        })
    }

    /// The exception a `rethrow` at `pc` re-raises.
    pub fn rethrow(&self, table: &RegionTable, pc: usize) -> Result<GuestException, EngineError> {
        self.pending
            .iter()
            .rev()
            .find(|p| {
                table.get(p.region).is_some_and(|r| {
                    matches!(r.region.kind, RegionKind::Exception(_)) && r.region.handler_contains(pc)
                })
            })
            .map(|p| p.exception.clone())
            .ok_or(EngineError::RethrowWithoutException(pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resolve::Assemblies, value::heap::Heap, value::ObjectModel, vm::error::FaultKind};

    fn guest(heap: &Heap, kind: FaultKind) -> GuestException {
        GuestException {
            object: heap.create_exception(kind, kind.default_message()),
            kind: Some(kind),
            message: kind.default_message().to_string(),
        }
    }

    #[test]
    fn test_first_declared_region_wins() {
        let shared = Arc::new(Assemblies::new());
        let heap = Heap::new(shared.clone());
        let assemblies = &*shared;
        let exception = assemblies.exception_token();
        let regions = [
            ExceptionHandlerRegion::catch(0..10, 10..20, exception),
            ExceptionHandlerRegion::catch(0..10, 20..30, exception),
        ];
        let table = RegionTable::new(&regions, assemblies, &ResolutionScope::default()).unwrap();
        let mut state = ExceptionState::new();
        let unwind = state
            .dispatch(&table, guest(&heap, FaultKind::Overflow), 4, 0, assemblies)
            .unwrap();
        assert!(matches!(unwind, Unwind::Resume { pc: 10, exception: Some(_) }));
    }

    #[test]
    fn test_unrelated_catch_type_is_skipped() {
        let shared = Arc::new(Assemblies::new());
        let heap = Heap::new(shared.clone());
        let assemblies = &*shared;
        let regions = [
            ExceptionHandlerRegion::catch(0..10, 10..20, assemblies.fault_token(FaultKind::DivideByZero)),
            ExceptionHandlerRegion::finally(0..10, 20..30),
        ];
        let table = RegionTable::new(&regions, assemblies, &ResolutionScope::default()).unwrap();
        let mut state = ExceptionState::new();
        let unwind = state
            .dispatch(&table, guest(&heap, FaultKind::Overflow), 4, 0, assemblies)
            .unwrap();
        assert_eq!(unwind, Unwind::Resume { pc: 20, exception: None });
        assert!(state.is_unwinding());

        // endfinally re-raises past the finally; nothing else protects the offset.
        let unwind = state.end_finally(&table, 25, assemblies).unwrap();
        assert!(matches!(unwind, Unwind::Propagate(e) if e.kind == Some(FaultKind::Overflow)));
    }

    #[test]
    fn test_leave_runs_nested_finallies_innermost_first() {
        let assemblies = &Assemblies::new();
        let regions = [
            ExceptionHandlerRegion::finally(2..6, 6..8),
            ExceptionHandlerRegion::finally(0..10, 10..12),
        ];
        let table = RegionTable::new(&regions, assemblies, &ResolutionScope::default()).unwrap();
        let mut state = ExceptionState::new();
        assert_eq!(state.leave(&table, 4, 20), 6);
        assert_eq!(
            state.end_finally(&table, 7, assemblies).unwrap(),
            Unwind::Resume { pc: 10, exception: None }
        );
        assert_eq!(
            state.end_finally(&table, 11, assemblies).unwrap(),
            Unwind::Resume { pc: 20, exception: None }
        );
    }

    #[test]
    fn test_leave_within_try_runs_nothing() {
        let assemblies = &Assemblies::new();
        let regions = [ExceptionHandlerRegion::finally(0..10, 10..12)];
        let table = RegionTable::new(&regions, assemblies, &ResolutionScope::default()).unwrap();
        let mut state = ExceptionState::new();
        assert_eq!(state.leave(&table, 2, 8), 8);
    }

    #[test]
    fn test_rethrow_without_exception() {
        let table = RegionTable::default();
        let state = ExceptionState::new();
        assert_eq!(
            state.rethrow(&table, 3).unwrap_err(),
            EngineError::RethrowWithoutException(3)
        );
    }

    #[test]
    fn test_fault_regions_are_not_implemented() {
        let shared = Arc::new(Assemblies::new());
        let heap = Heap::new(shared.clone());
        let assemblies = &*shared;
        let regions = [ExceptionHandlerRegion::fault(0..10, 10..12)];
        let table = RegionTable::new(&regions, assemblies, &ResolutionScope::default()).unwrap();
        let mut state = ExceptionState::new();
        assert!(matches!(
            state.dispatch(&table, guest(&heap, FaultKind::Overflow), 1, 0, assemblies),
            Err(EngineError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_resume_after_throw_uses_furthest_handler() {
        let regions = [
            ExceptionHandlerRegion::catch(0..10, 10..20, Token(0x0200_0001)),
            ExceptionHandlerRegion::catch(0..10, 20..34, Token(0x0200_0002)),
        ];
        assert_eq!(resume_after_throw(&regions, 5), Some(34));
        assert_eq!(resume_after_throw(&regions, 40), None);
    }
}
