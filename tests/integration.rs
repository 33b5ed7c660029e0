use cil_vm::{
    resolve::Assemblies,
    types::{MethodSignature, MethodSymbol},
    value::{heap::Heap, StackValue, ValueKind},
    vm::{self, Engine, EngineConfig, ExecutionError},
};
use std::{path::Path, sync::Arc};

pub struct TestHarness {
    pub assemblies: Arc<Assemblies>,
    pub engine: Engine,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let assemblies = Arc::new(Assemblies::new());
        let heap = Arc::new(Heap::new(assemblies.clone()));
        let engine = Engine::new(assemblies.clone(), assemblies.clone(), heap, config);
        Self { assemblies, engine }
    }

    /// Assembles a fixture as a parameterless `main` returning `int32`.
    pub fn load(&self, fixture_path: &Path) -> Arc<MethodSymbol> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(fixture_path);
        let source = std::fs::read_to_string(&path).unwrap();
        let token = self.assemblies.declare_method(
            self.assemblies.core().object,
            "main",
            MethodSignature::new_static(vec![], Some(ValueKind::I4)),
            false,
        );
        let assembly = vm::assemble(&source, &self.assemblies)
            .unwrap_or_else(|e| panic!("could not assemble {:?}: {}", fixture_path, e));
        self.assemblies.define_body(token, assembly.into_body()).unwrap();
        self.assemblies.method(token).unwrap()
    }

    pub fn run(&self, method: &Arc<MethodSymbol>) -> Result<i32, ExecutionError> {
        match self.engine.execute(method, vec![])? {
            Some(StackValue::Int32(i)) => Ok(i),
            rest => panic!("{:?} returned {:?}, expected an Int32", method, rest),
        }
    }
}

// used in generated tests from build.rs
macro_rules! fixture_test {
    ($name:ident, $path:expr, $expected:expr) => {
        #[test]
        fn $name() {
            let harness = TestHarness::new();
            let method = harness.load(Path::new($path));
            let result = harness.run(&method);
            assert_eq!(
                result,
                Ok($expected),
                "Test {} failed: expected {}, got {:?}",
                stringify!($name),
                $expected,
                result
            );
        }
    };
}

include!(concat!(env!("OUT_DIR"), "/tests.rs"));

#[test]
fn test_second_run_uses_the_prepared_method() {
    let harness = TestHarness::new();
    let method = harness.load(Path::new("tests/fixtures/sum_loop_55.il"));
    assert_eq!(harness.run(&method), Ok(55));
    assert_eq!(harness.run(&method), Ok(55));
    assert_eq!(harness.engine.metrics().snapshot().methods_prepared, 1);
}

#[test]
fn test_fixture_counts_handlers() {
    let harness = TestHarness::new();
    let method = harness.load(Path::new("tests/fixtures/finally_before_catch_123.il"));
    assert_eq!(harness.run(&method), Ok(123));
    let metrics = harness.engine.metrics().snapshot();
    assert_eq!(metrics.faults_raised, 1);
    assert_eq!(metrics.faults_caught, 1);
    assert_eq!(metrics.finally_blocks_run, 1);
}

#[test]
fn test_osr_polls_on_back_edges() {
    let harness = TestHarness::with_config(EngineConfig::default().with_osr_threshold(4));
    let method = harness.load(Path::new("tests/fixtures/sum_loop_55.il"));
    assert_eq!(harness.run(&method), Ok(55));
    let metrics = harness.engine.metrics().snapshot();
    // blt.s jumps back nine times; the tenth comparison falls through.
    assert_eq!(metrics.osr_polls, 9);
    assert_eq!(metrics.osr_triggers, 2);
}

#[test]
fn test_forward_branches_do_not_poll() {
    let harness = TestHarness::new();
    let method = harness.load(Path::new("tests/fixtures/switch_30.il"));
    assert_eq!(harness.run(&method), Ok(30));
    assert_eq!(harness.engine.metrics().snapshot().osr_polls, 0);
}

#[test]
fn test_engine_shared_between_threads() {
    let harness = TestHarness::new();
    let method = harness.load(Path::new("tests/fixtures/array_sum_60.il"));

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    for _ in 0..3 {
                        assert_eq!(harness.run(&method), Ok(60));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });

    assert_eq!(harness.engine.metrics().snapshot().methods_prepared, 1);
}
