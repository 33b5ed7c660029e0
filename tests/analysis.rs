use cil_vm::{
    resolve::Assemblies,
    types::{MethodSignature, MethodSymbol},
    value::{heap::Heap, StackValue, ValueKind},
    vm::{self, Engine, EngineConfig, EngineError, ExecutionError, MethodAnalysis, OpCodeType},
};
use std::sync::Arc;

fn method(
    assemblies: &Assemblies,
    params: Vec<ValueKind>,
    returns: Option<ValueKind>,
    source: &str,
) -> Arc<MethodSymbol> {
    let body = vm::assemble(source, assemblies).unwrap().into_body();
    let token = assemblies
        .define_method("test", MethodSignature::new_static(params, returns), body)
        .unwrap();
    assemblies.method(token).unwrap()
}

fn analyze(params: Vec<ValueKind>, returns: Option<ValueKind>, source: &str) -> Result<MethodAnalysis, EngineError> {
    let assemblies = Assemblies::new();
    let method = method(&assemblies, params, returns, source);
    vm::analyze(&method, &assemblies)
}

fn is_invalid_program(result: Result<MethodAnalysis, EngineError>) -> bool {
    matches!(result, Err(EngineError::InvalidProgram { .. }))
}

#[test]
fn test_binary_operand_types() {
    let analysis = analyze(
        vec![ValueKind::I4, ValueKind::I, ValueKind::I8, ValueKind::R8],
        Some(ValueKind::I8),
        r#"
            ldarg.0
            ldarg.1
            add         // IL_0002
            pop
            ldarg.1
            ldarg.0
            sub         // IL_0006
            pop
            ldarg.3
            ldarg.3
            mul         // IL_000a
            pop
            ldarg.2
            ret
        "#,
    )
    .unwrap();
    assert_eq!(analysis.op_type(0x02), Some(OpCodeType::Int32NativeInt));
    assert_eq!(analysis.op_type(0x06), Some(OpCodeType::NativeIntInt32));
    assert_eq!(analysis.op_type(0x0a), Some(OpCodeType::NativeFloat));
    assert_eq!(analysis.op_type(0x00), None);
}

#[test]
fn test_stack_depths() {
    let analysis = analyze(vec![], Some(ValueKind::I4), "ldc.i4.1\nldc.i4.2\nadd\nret").unwrap();
    assert_eq!(analysis.stack_depth(0), Some(0));
    assert_eq!(analysis.stack_depth(1), Some(1));
    assert_eq!(analysis.stack_depth(2), Some(2));
    assert_eq!(analysis.stack_depth(3), Some(1));
    assert!(analysis.is_instruction_start(3));
    assert!(!analysis.is_instruction_start(4));
}

#[test]
fn test_shift_amount_may_be_native() {
    let analysis = analyze(
        vec![ValueKind::I8, ValueKind::I],
        Some(ValueKind::I8),
        "ldarg.0\nldarg.1\nshl\nret",
    )
    .unwrap();
    assert_eq!(analysis.op_type(2), Some(OpCodeType::Int64NativeInt));
}

#[test]
fn test_object_equality_is_allowed_but_ordering_is_not() {
    assert!(analyze(vec![], Some(ValueKind::I4), "ldnull\nldnull\nceq\nret").is_ok());
    assert!(is_invalid_program(analyze(
        vec![],
        Some(ValueKind::I4),
        "ldnull\nldnull\nclt\nret"
    )));
}

#[test]
fn test_int64_with_int32_is_rejected() {
    assert!(is_invalid_program(analyze(
        vec![ValueKind::I8, ValueKind::I4],
        Some(ValueKind::I8),
        "ldarg.0\nldarg.1\nadd\nret"
    )));
}

#[test]
fn test_unreachable_code_is_skipped() {
    let analysis = analyze(vec![], Some(ValueKind::I4), "ldc.i4.0\nret\nadd\nret").unwrap();
    assert!(analysis.is_reachable(1));
    assert!(!analysis.is_reachable(2));
    assert_eq!(analysis.op_type(2), None);
}

#[test]
fn test_branch_condition_must_be_integral_or_reference() {
    assert!(analyze(vec![], None, "ldnull\nbrfalse.s done\ndone: ret").is_ok());
    assert!(is_invalid_program(analyze(
        vec![],
        None,
        "ldc.r8 1.0\nbrtrue.s done\ndone: ret"
    )));
}

#[test]
fn test_handler_starts_with_the_exception() {
    let analysis = analyze(
        vec![],
        None,
        r#"
        .try start end catch System.Exception handler done
        start:   leave.s done
        end:
        handler: pop
                 leave.s done
        done:    ret
        "#,
    )
    .unwrap();
    assert_eq!(analysis.stack_depth(2), Some(1));
    assert!(analysis.is_reachable(2));
}

#[test]
fn test_invalid_method_fails_to_prepare() {
    let assemblies = Arc::new(Assemblies::new());
    let heap = Arc::new(Heap::new(assemblies.clone()));
    let engine = Engine::new(assemblies.clone(), assemblies.clone(), heap, EngineConfig::default());
    let broken = method(&assemblies, vec![], Some(ValueKind::I4), "add\nret");
    assert!(matches!(
        engine.execute(&broken, vec![]),
        Err(ExecutionError::Engine(EngineError::InvalidProgram { .. }))
    ));
    assert!(engine.prepared(broken.handle).is_none());
}

#[test]
fn test_annotations_cover_typed_instructions() {
    let analysis = analyze(
        vec![ValueKind::I4],
        Some(ValueKind::I4),
        "ldarg.0\nldarg.0\nmul\nldc.i4.3\nadd\nret",
    )
    .unwrap();
    let annotated: Vec<_> = analysis.annotations().collect();
    assert_eq!(annotated, vec![(2, OpCodeType::Int32), (4, OpCodeType::Int32)]);
}

const DISPATCH: &str = r#"
        .locals i4
        .try start end catch System.Exception handler done
        start:   ldarg.0
                 switch (one, two)
                 ldc.i4.0
                 stloc.0
                 leave.s done
        one:     ldarg.0
                 call twice
                 stloc.0
                 leave.s done
        two:     ldc.i4.1
                 ldc.i4.0
                 div
                 stloc.0
                 leave.s done
        end:
        handler: pop
                 ldc.i4.7
                 stloc.0
                 leave.s done
        done:    ldloc.0
                 ldc.i4.5
                 bgt.s big
                 ldloc.0
                 ret
        big:     ldc.i4.5
                 ret
"#;

#[test]
fn test_analysis_is_repeatable() {
    let assemblies = Arc::new(Assemblies::new());
    let twice = vm::assemble("ldarg.0\nldc.i4.2\nmul\nret", &assemblies)
        .unwrap()
        .into_body();
    assemblies
        .define_method(
            "twice",
            MethodSignature::new_static(vec![ValueKind::I4], Some(ValueKind::I4)),
            twice,
        )
        .unwrap();
    let dispatch = method(&assemblies, vec![ValueKind::I4], Some(ValueKind::I4), DISPATCH);

    let first = vm::analyze(&dispatch, &*assemblies).unwrap();
    let second = vm::analyze(&dispatch, &*assemblies).unwrap();
    assert_eq!(first, second);
    assert!(first.annotations().count() > 0);

    // Running the method patches its call site; the analysis still describes the declared body.
    let heap = Arc::new(Heap::new(assemblies.clone()));
    let engine = Engine::new(assemblies.clone(), assemblies.clone(), heap, EngineConfig::default());
    assert_eq!(
        engine.execute(&dispatch, vec![StackValue::Int32(0)]),
        Ok(Some(StackValue::Int32(0)))
    );
    assert_eq!(
        engine.execute(&dispatch, vec![StackValue::Int32(1)]),
        Ok(Some(StackValue::Int32(5)))
    );
    let prepared = engine.prepare(&dispatch).unwrap();
    assert_eq!(prepared.patched_call_sites(), 1);
    assert_eq!(prepared.analysis, first);
    assert_eq!(vm::analyze(&dispatch, &*assemblies).unwrap(), first);
}
