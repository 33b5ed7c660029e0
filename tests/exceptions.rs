use cil_vm::{
    resolve::{Assemblies, SymbolResolver},
    types::MethodSignature,
    value::{heap::Heap, ObjectModel, StackValue, ValueKind},
    vm::{self, Engine, EngineConfig, EngineError, ExecutionError, FaultKind},
};
use std::sync::Arc;

struct TestHarness {
    assemblies: Arc<Assemblies>,
    heap: Arc<Heap>,
    engine: Engine,
}

impl TestHarness {
    fn new() -> Self {
        let assemblies = Arc::new(Assemblies::new());
        let heap = Arc::new(Heap::new(assemblies.clone()));
        let engine = Engine::new(
            assemblies.clone(),
            assemblies.clone(),
            heap.clone(),
            EngineConfig::default(),
        );
        Self {
            assemblies,
            heap,
            engine,
        }
    }

    fn run(&self, source: &str) -> Result<Option<StackValue>, ExecutionError> {
        let body = vm::assemble(source, &self.assemblies).unwrap().into_body();
        let token = self
            .assemblies
            .define_method(
                "main",
                MethodSignature::new_static(vec![], Some(ValueKind::I4)),
                body,
            )
            .unwrap();
        let method = self.assemblies.method(token).unwrap();
        self.engine.execute(&method, vec![])
    }
}

#[test]
fn test_unhandled_fault_carries_the_default_message() {
    let harness = TestHarness::new();
    match harness.run("ldc.i4.1\nldc.i4.0\ndiv\nret") {
        Err(ExecutionError::Guest(e)) => {
            assert_eq!(e.kind, Some(FaultKind::DivideByZero));
            assert_eq!(e.message, FaultKind::DivideByZero.default_message());
            assert_eq!(
                e.to_string(),
                "System.DivideByZeroException: Attempted to divide by zero."
            );
        }
        other => panic!("expected an unhandled exception, got {:?}", other),
    }
}

#[test]
fn test_unhandled_throw_keeps_the_object() {
    let harness = TestHarness::new();
    match harness.run("newobj System.Exception::.ctor\nthrow") {
        Err(ExecutionError::Guest(e)) => {
            assert_eq!(e.kind, None);
            assert_eq!(e.message, "System.Exception");
            let ty = e.object.type_handle().unwrap();
            assert_eq!(harness.assemblies.type_of(ty).unwrap().name, "System.Exception");
        }
        other => panic!("expected an unhandled exception, got {:?}", other),
    }
}

#[test]
fn test_throw_null_raises_null_reference() {
    let harness = TestHarness::new();
    let result = harness.run("ldnull\nthrow");
    assert_eq!(result.unwrap_err().fault_kind(), Some(FaultKind::NullReference));
}

#[test]
fn test_handler_receives_the_exception_object() {
    let harness = TestHarness::new();
    let result = harness.run(
        r#"
        .locals i4
        .try start end catch System.Exception handler done
        start:   ldnull
                 ldlen
                 pop
                 leave.s done
        end:
        handler: isinst System.NullReferenceException
                 ldnull
                 cgt.un
                 stloc.0
                 leave.s done
        done:    ldloc.0
                 ret
        "#,
    );
    assert_eq!(result, Ok(Some(StackValue::Int32(1))));
}

#[test]
fn test_first_matching_catch_wins() {
    let harness = TestHarness::new();
    let result = harness.run(
        r#"
        .locals i4
        .try start end catch System.NullReferenceException null_handler second
        .try start end catch System.ArithmeticException arith_handler third
        .try start end catch System.Exception any_handler done
        start:         ldc.i4.1
                       ldc.i4.0
                       rem
                       pop
                       leave.s done
        end:
        null_handler:  pop
                       ldc.i4.1
                       stloc.0
                       leave.s done
        second:
        arith_handler: pop
                       ldc.i4.2
                       stloc.0
                       leave.s done
        third:
        any_handler:   pop
                       ldc.i4.3
                       stloc.0
                       leave.s done
        done:          ldloc.0
                       ret
        "#,
    );
    assert_eq!(result, Ok(Some(StackValue::Int32(2))));
}

#[test]
fn test_leave_runs_nested_finallies_innermost_first() {
    let harness = TestHarness::new();
    let result = harness.run(
        r#"
        .locals i4
        .try inner_start inner_end finally inner_fin inner_fin_end
        .try outer_start outer_end finally outer_fin done
        outer_start:
        inner_start:   ldc.i4.1
                       stloc.0
                       leave.s done
        inner_end:
        inner_fin:     ldloc.0
                       ldc.i4.s 10
                       mul
                       ldc.i4.2
                       add
                       stloc.0
                       endfinally
        inner_fin_end:
        outer_end:
        outer_fin:     ldloc.0
                       ldc.i4.s 10
                       mul
                       ldc.i4.3
                       add
                       stloc.0
                       endfinally
        done:          ldloc.0
                       ret
        "#,
    );
    assert_eq!(result, Ok(Some(StackValue::Int32(123))));
    assert_eq!(harness.engine.metrics().snapshot().finally_blocks_run, 2);
}

#[test]
fn test_finally_runs_when_the_exception_escapes() {
    let harness = TestHarness::new();
    let a = &harness.assemblies;
    let int32 = a.type_token("System.Int32").unwrap();
    let log = a.define_type("Log", ValueKind::Object, None);
    let entries = a.define_field(log, "Entries", int32, true).unwrap();

    let result = harness.run(
        r#"
        .try start end finally fin done
        start: newobj System.Exception::.ctor
               throw
        end:
        fin:   ldsfld Log::Entries
               ldc.i4.1
               add
               stsfld Log::Entries
               endfinally
        done:  ldc.i4.0
               ret
        "#,
    );
    assert!(matches!(result, Err(ExecutionError::Guest(_))));
    let entries = a.resolve_field(entries, &Default::default()).unwrap();
    assert_eq!(harness.heap.load_static(&entries), Ok(StackValue::Int32(1)));
}

#[test]
fn test_exception_from_handler_goes_to_the_outer_region() {
    let harness = TestHarness::new();
    let result = harness.run(
        r#"
        .locals i4
        .try inner_start inner_end catch System.Exception inner_handler inner_done
        .try outer_start outer_end catch System.OverflowException outer_handler done
        outer_start:
        inner_start:   newobj System.Exception::.ctor
                       throw
        inner_end:
        inner_handler: pop
                       ldc.i4 0x7FFFFFFF
                       ldc.i4.1
                       add.ovf
                       stloc.0
                       leave.s done
        inner_done:
        outer_end:
        outer_handler: pop
                       ldc.i4.s 99
                       stloc.0
                       leave.s done
        done:          ldloc.0
                       ret
        "#,
    );
    assert_eq!(result, Ok(Some(StackValue::Int32(99))));
}

#[test]
fn test_unmatched_catch_propagates() {
    let harness = TestHarness::new();
    let result = harness.run(
        r#"
        .try start end catch System.InvalidCastException handler done
        start:   ldc.i4.1
                 ldc.i4.0
                 div
                 pop
                 leave.s done
        end:
        handler: pop
                 leave.s done
        done:    ldc.i4.0
                 ret
        "#,
    );
    assert_eq!(result.unwrap_err().fault_kind(), Some(FaultKind::DivideByZero));
    let metrics = harness.engine.metrics().snapshot();
    assert_eq!(metrics.faults_raised, 1);
    assert_eq!(metrics.faults_caught, 0);
}

#[test]
fn test_fault_regions_are_not_implemented() {
    let harness = TestHarness::new();
    let result = harness.run(
        r#"
        .try start end fault handler done
        start:   newobj System.Exception::.ctor
                 throw
        end:
        handler: endfinally
        done:    ldc.i4.0
                 ret
        "#,
    );
    assert!(matches!(
        result,
        Err(ExecutionError::Engine(EngineError::NotImplemented(_)))
    ));
}

#[test]
fn test_allocation_failure_is_catchable() {
    let assemblies = Arc::new(Assemblies::new());
    let heap = Arc::new(Heap::new(assemblies.clone()).with_limit(0));
    let engine = Engine::new(assemblies.clone(), assemblies.clone(), heap, EngineConfig::default());
    let body = vm::assemble(
        r#"
        .locals i4
        .try start end catch System.OutOfMemoryException handler done
        start:   ldc.i4.1
                 newarr int32
                 pop
                 leave.s done
        end:
        handler: pop
                 ldc.i4.7
                 stloc.0
                 leave.s done
        done:    ldloc.0
                 ret
        "#,
        &assemblies,
    )
    .unwrap()
    .into_body();
    let token = assemblies
        .define_method("main", MethodSignature::new_static(vec![], Some(ValueKind::I4)), body)
        .unwrap();
    let method = assemblies.method(token).unwrap();
    assert_eq!(engine.execute(&method, vec![]), Ok(Some(StackValue::Int32(7))));
}
