use cil_vm::{
    resolve::{Assemblies, SymbolResolver},
    types::{MethodSignature, Token},
    value::{heap::Heap, ManagedPointer, ObjectModel, StackValue, ValueKind},
    vm::{self, Engine, EngineConfig, ExecutionError, FaultKind},
};
use std::sync::Arc;

struct Setup {
    assemblies: Arc<Assemblies>,
    heap: Arc<Heap>,
}

fn prepare() -> Setup {
    let assemblies = Arc::new(Assemblies::new());
    let heap = Arc::new(Heap::new(assemblies.clone()));
    Setup { assemblies, heap }
}

impl Setup {
    fn run(
        &self,
        source: &str,
        params: Vec<(ValueKind, StackValue)>,
        returns: Option<ValueKind>,
    ) -> Result<Option<StackValue>, ExecutionError> {
        let (kinds, args): (Vec<_>, Vec<_>) = params.into_iter().unzip();
        let assembly = vm::assemble(source, &self.assemblies).unwrap();
        let token = self
            .assemblies
            .define_method("test", MethodSignature::new_static(kinds, returns), assembly.into_body())
            .unwrap();
        let method = self.assemblies.method(token).unwrap();
        let engine = Engine::new(
            self.assemblies.clone(),
            self.assemblies.clone(),
            self.heap.clone(),
            EngineConfig::default(),
        );
        engine.execute(&method, args)
    }

    fn fault(&self, source: &str) -> Option<FaultKind> {
        match self.run(source, vec![], Some(ValueKind::I4)) {
            Err(e) => e.fault_kind(),
            Ok(v) => panic!("returned {:?}, expected a fault", v),
        }
    }

    fn type_symbol(&self, token: Token) -> Arc<cil_vm::types::TypeSymbol> {
        self.assemblies.resolve_type(token, &Default::default()).unwrap()
    }
}

/// Runs the given lines as a method returning `$kind` and yields the returned value.
macro_rules! simple_test {
    ($kind:expr; $($line:expr),+ $(,)?) => {
        {
            let setup = prepare();
            let lines: Vec<String> = vec![$(String::from($line)),+];
            let source = lines.join("\n");
            setup.run(&source, vec![], Some($kind)).unwrap().unwrap()
        }
    };
}

macro_rules! test_math {
    ($op:literal, $left:literal, $right:literal, $expected:literal) => {
        match simple_test!(ValueKind::I4; &format!("ldc.i4 {}", $left), &format!("ldc.i4 {}", $right), $op, "ret") {
            StackValue::Int32(x) => assert_eq!(x, $expected),
            rest => panic!("returned {:?}, expected Int32({})", rest, $expected),
        }
    };
}

#[test]
fn test_add() {
    test_math!("add", 1, 2, 3);
}

#[test]
fn test_add_wraps() {
    test_math!("add", 0x7FFFFFFF, 1, -2147483648);
}

#[test]
fn test_multiply() {
    test_math!("mul", 2, 2, 4);
}

#[test]
fn test_div() {
    test_math!("div", 4, -2, -2);
}

#[test]
fn test_unsigned_div() {
    test_math!("div.un", -2, 2, 0x7FFFFFFF);
}

#[test]
fn test_remainder() {
    test_math!("rem", 5, -2, 1);
}

#[test]
fn test_unsigned_remainder() {
    test_math!("rem.un", 5, 2, 1);
}

#[test]
fn test_and() {
    test_math!("and", 3, 1, 1);
}

#[test]
fn test_or() {
    test_math!("or", 4, 1, 5);
}

#[test]
fn test_xor() {
    test_math!("xor", 3, 1, 2);
}

#[test]
fn test_shl() {
    test_math!("shl", 1, 33, 2);
}

#[test]
fn test_shr() {
    test_math!("shr", -8, 1, -4);
}

#[test]
fn test_sub_ovf_un() {
    let setup = prepare();
    assert_eq!(
        setup.fault("ldc.i4.1\nldc.i4.2\nsub.ovf.un\nret"),
        Some(FaultKind::Overflow)
    );
}

#[test]
fn test_divide_by_zero() {
    let setup = prepare();
    assert_eq!(setup.fault("ldc.i4.1\nldc.i4.0\nrem\nret"), Some(FaultKind::DivideByZero));
}

#[test]
fn test_min_value_div_minus_one_overflows() {
    let setup = prepare();
    assert_eq!(
        setup.fault("ldc.i4 0x80000000\nldc.i4.m1\ndiv\nret"),
        Some(FaultKind::Overflow)
    );
}

#[test]
fn test_int64_arithmetic() {
    let value = simple_test!(ValueKind::I8; "ldc.i8 0x100000000", "ldc.i4.2", "conv.i8", "mul", "neg", "ret");
    assert_eq!(value, StackValue::Int64(-0x2_0000_0000));
}

#[test]
fn test_native_int_mixed_with_int32() {
    let value = simple_test!(ValueKind::I; "ldc.i4.5", "conv.i", "ldc.i4.3", "add", "ret");
    assert_eq!(value, StackValue::NativeInt(8));
}

#[test]
fn test_float_division_by_zero_is_infinite() {
    let value = simple_test!(ValueKind::R8; "ldc.r8 1.0", "ldc.r8 0.0", "div", "ret");
    assert_eq!(value, StackValue::NativeFloat(f64::INFINITY));
}

#[test]
fn test_comparison_result_feeds_int32_arithmetic() {
    let value = simple_test!(ValueKind::I4; "ldc.i8 5", "dup", "ceq", "dup", "add", "ret");
    assert_eq!(value, StackValue::Int32(2));
}

#[test]
fn test_nan_compares_unordered() {
    let ordered = simple_test!(ValueKind::I4; "ldc.r8 0.0", "dup", "div", "ldc.r8 1.0", "clt", "ret");
    assert_eq!(ordered, StackValue::Int32(0));
    let unordered = simple_test!(ValueKind::I4; "ldc.r8 0.0", "dup", "div", "ldc.r8 1.0", "clt.un", "ret");
    assert_eq!(unordered, StackValue::Int32(1));
}

#[test]
fn test_ckfinite_rejects_nan() {
    let setup = prepare();
    let result = setup.run("ldc.r8 0.0\ndup\ndiv\nckfinite\nret", vec![], Some(ValueKind::R8));
    assert_eq!(result.unwrap_err().fault_kind(), Some(FaultKind::Overflow));
}

#[test]
fn test_conversions_truncate() {
    let value = simple_test!(ValueKind::I4; "ldc.i4 200", "conv.i1", "ret");
    assert_eq!(value, StackValue::Int32(-56));
    let value = simple_test!(ValueKind::I4; "ldc.i4 300", "conv.u1", "ret");
    assert_eq!(value, StackValue::Int32(44));
    let value = simple_test!(ValueKind::I8; "ldc.i4.m1", "conv.u8", "ret");
    assert_eq!(value, StackValue::Int64(0xFFFF_FFFF));
    let value = simple_test!(ValueKind::I4; "ldc.r8 -2.75", "conv.i4", "ret");
    assert_eq!(value, StackValue::Int32(-2));
}

#[test]
fn test_checked_conversion_overflows() {
    let setup = prepare();
    assert_eq!(setup.fault("ldc.i4 300\nconv.ovf.u1\nret"), Some(FaultKind::Overflow));
    assert_eq!(setup.fault("ldc.i4.m1\nconv.ovf.u4\nret"), Some(FaultKind::Overflow));
}

#[test]
fn test_arguments_are_narrowed_to_their_kind() {
    let setup = prepare();
    let result = setup.run(
        "ldarg.0\nret",
        vec![(ValueKind::U1, StackValue::Int32(0x1_02))],
        Some(ValueKind::I4),
    );
    assert_eq!(result, Ok(Some(StackValue::Int32(2))));
}

#[test]
fn test_starg_and_ldarga() {
    let setup = prepare();
    let result = setup.run(
        "ldc.i4.s 9\nstarg.s 0\nldarga.s 0\nldind.i4\nret",
        vec![(ValueKind::I4, StackValue::Int32(1))],
        Some(ValueKind::I4),
    );
    assert_eq!(result, Ok(Some(StackValue::Int32(9))));
}

#[test]
fn test_void_method_returns_nothing() {
    let setup = prepare();
    assert_eq!(setup.run("nop\nldc.i4.1\npop\nret", vec![], None), Ok(None));
}

#[test]
fn test_string_literal() {
    let setup = prepare();
    let value = setup
        .run("ldstr \"hello\\tworld\"\nret", vec![], Some(ValueKind::Object))
        .unwrap()
        .unwrap();
    let object = value.as_object().unwrap();
    assert_eq!(setup.heap.string_value(object).as_deref(), Some("hello\tworld"));
}

#[test]
fn test_ldtoken_and_sizeof() {
    let handle = simple_test!(ValueKind::Object; "ldtoken int64", "ret");
    assert!(!handle.as_object().unwrap().is_null());
    let size = simple_test!(ValueKind::I4; "sizeof int64", "ret");
    assert_eq!(size, StackValue::Int32(8));
}

#[test]
fn test_array_index_out_of_range() {
    let setup = prepare();
    assert_eq!(
        setup.fault("ldc.i4.2\nnewarr int32\nldc.i4.2\nldelem.i4\nret"),
        Some(FaultKind::IndexOutOfRange)
    );
    assert_eq!(
        setup.fault("ldc.i4.2\nnewarr int32\nldc.i4.m1\nldelem.i4\nret"),
        Some(FaultKind::IndexOutOfRange)
    );
}

#[test]
fn test_negative_array_size_overflows() {
    let setup = prepare();
    assert_eq!(setup.fault("ldc.i4.m1\nnewarr int32\nldlen\nconv.i4\nret"), Some(FaultKind::Overflow));
}

#[test]
fn test_null_array_is_checked_before_the_index() {
    let setup = prepare();
    assert_eq!(setup.fault("ldnull\nldc.i4.m1\nldelem.i4\nret"), Some(FaultKind::NullReference));
}

#[test]
fn test_element_address() {
    let value = simple_test!(ValueKind::I4;
        "ldc.i4.4",
        "newarr int32",
        "dup",
        "ldc.i4.3",
        "ldelema int32",
        "ldc.i4.s 77",
        "stind.i4",
        "ldc.i4.3",
        "ldelem int32",
        "ret",
    );
    assert_eq!(value, StackValue::Int32(77));
}

#[test]
fn test_stelem_ref_checks_the_element_type() {
    let setup = prepare();
    assert_eq!(
        setup.fault("ldc.i4.1\nnewarr System.String\nldc.i4.0\nnewobj System.Object::.ctor\nstelem.ref\nldc.i4.0\nret"),
        Some(FaultKind::ArrayTypeMismatch)
    );
}

#[test]
fn test_isinst_and_castclass() {
    let miss = simple_test!(ValueKind::Object; "ldstr \"s\"", "isinst System.Exception", "ret");
    assert!(miss.as_object().unwrap().is_null());
    let null = simple_test!(ValueKind::Object; "ldnull", "castclass System.Exception", "ret");
    assert!(null.as_object().unwrap().is_null());

    let setup = prepare();
    let error = setup
        .run("ldstr \"s\"\ncastclass System.Exception\nret", vec![], Some(ValueKind::Object))
        .unwrap_err();
    match error {
        ExecutionError::Guest(e) => {
            assert_eq!(e.kind, Some(FaultKind::InvalidCast));
            assert_eq!(
                e.message,
                "Unable to cast object of type 'System.String' to type 'System.Exception'."
            );
        }
        other => panic!("expected a guest exception, got {:?}", other),
    }
}

#[test]
fn test_unbox_checks_the_boxed_type() {
    let setup = prepare();
    assert_eq!(
        setup.fault("ldc.i4.1\nbox int32\nunbox.any int64\nconv.i4\nret"),
        Some(FaultKind::InvalidCast)
    );
}

#[test]
fn test_unbox_pointer_writes_into_the_box() {
    let value = simple_test!(ValueKind::I4;
        "ldc.i4.1",
        "box int32",
        "dup",
        "unbox int32",
        "ldc.i4.s 12",
        "stind.i4",
        "unbox.any int32",
        "ret",
    );
    assert_eq!(value, StackValue::Int32(12));
}

#[test]
fn test_instance_and_static_fields() {
    let setup = prepare();
    let a = &setup.assemblies;
    let int32 = a.type_token("System.Int32").unwrap();
    let counter = a.define_type("Counter", ValueKind::Object, None);
    a.define_field(counter, "Value", int32, false).unwrap();
    a.define_field(counter, "Total", int32, true).unwrap();
    let ctor = a.declare_method(counter, ".ctor", MethodSignature::new_instance(vec![], None), false);
    a.define_body(ctor, vm::assemble("ret", a).unwrap().into_body()).unwrap();

    let result = setup.run(
        r#"
        .locals object
            newobj Counter::.ctor
            stloc.0
            ldloc.0
            ldc.i4.5
            stfld Counter::Value
            ldc.i4.s 40
            stsfld Counter::Total
            ldsflda Counter::Total
            dup
            ldind.i4
            ldloc.0
            ldfld Counter::Value
            add
            stind.i4
            ldsfld Counter::Total
            ret
        "#,
        vec![],
        Some(ValueKind::I4),
    );
    assert_eq!(result, Ok(Some(StackValue::Int32(45))));
}

#[test]
fn test_ldfld_on_null_faults() {
    let setup = prepare();
    let a = &setup.assemblies;
    let int32 = a.type_token("System.Int32").unwrap();
    let node = a.define_type("Node", ValueKind::Object, None);
    a.define_field(node, "Value", int32, false).unwrap();
    assert_eq!(setup.fault("ldnull\nldfld Node::Value\nret"), Some(FaultKind::NullReference));
}

#[test]
fn test_struct_locals_copy_on_store() {
    let setup = prepare();
    let a = &setup.assemblies;
    let int32 = a.type_token("System.Int32").unwrap();
    let point = a.define_type("Point", ValueKind::Struct, None);
    a.define_field(point, "X", int32, false).unwrap();

    let result = setup.run(
        r#"
        .locals struct, struct
            ldloca.s 0
            initobj Point
            ldloc.0
            stloc.1
            ldloca.s 0
            ldc.i4.7
            stfld Point::X
            ldloca.s 0
            ldfld Point::X
            ldc.i4.s 10
            mul
            ldloca.s 1
            ldfld Point::X
            add
            ret
        "#,
        vec![],
        Some(ValueKind::I4),
    );
    assert_eq!(result, Ok(Some(StackValue::Int32(70))));
    assert_eq!(setup.heap.size_of(&setup.type_symbol(point)), 4);
}

#[test]
fn test_ldftn_yields_a_method_pointer() {
    let setup = prepare();
    let target = setup
        .assemblies
        .define_method(
            "target",
            MethodSignature::new_static(vec![], None),
            vm::assemble("ret", &setup.assemblies).unwrap().into_body(),
        )
        .unwrap();
    let method = setup.assemblies.method(target).unwrap();
    let result = setup.run("ldftn target\nret", vec![], Some(ValueKind::ByRef));
    assert_eq!(
        result,
        Ok(Some(StackValue::ManagedPtr(ManagedPointer::Method(method.handle))))
    );
}

#[test]
fn test_unimplemented_opcode_is_an_engine_error() {
    let setup = prepare();
    let result = setup.run("ldc.i4.4\nlocalloc\npop\nldc.i4.0\nret", vec![], Some(ValueKind::I4));
    assert!(matches!(result, Err(ExecutionError::Engine(_))));
}
