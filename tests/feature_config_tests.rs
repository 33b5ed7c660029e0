/// Configuration-specific tests for feature flags and engine tunables.
use cil_vm::{
    resolve::Assemblies,
    types::MethodSignature,
    utils::{env_flag, env_number},
    value::{heap::Heap, StackValue, ValueKind},
    vm::{self, config, Engine, EngineConfig},
};
use std::sync::Arc;

const COUNTDOWN: &str = r#"
            ldc.i4.s 20
            stloc.0
    top:    ldloc.0
            ldc.i4.1
            sub
            dup
            stloc.0
            brtrue.s top
            ldloc.0
            ret
"#;

fn engine_with(config: EngineConfig) -> (Arc<Assemblies>, Engine) {
    let assemblies = Arc::new(Assemblies::new());
    let heap = Arc::new(Heap::new(assemblies.clone()));
    let engine = Engine::new(assemblies.clone(), assemblies.clone(), heap, config);
    (assemblies, engine)
}

fn countdown(assemblies: &Assemblies) -> Arc<cil_vm::types::MethodSymbol> {
    let body = vm::assemble(&format!(".locals i4\n{}", COUNTDOWN), assemblies)
        .unwrap()
        .into_body();
    let token = assemblies
        .define_method(
            "countdown",
            MethodSignature::new_static(vec![], Some(ValueKind::I4)),
            body,
        )
        .unwrap();
    assemblies.method(token).unwrap()
}

// ============================================================================
// Engine configuration
// ============================================================================

#[test]
fn test_default_config() {
    let config = EngineConfig::default();
    assert_eq!(config.osr_threshold, config::DEFAULT_OSR_THRESHOLD);
    assert_eq!(config.max_call_depth, config::DEFAULT_MAX_CALL_DEPTH);
    assert!(!config.trace_instructions);
}

#[test]
fn test_config_builders() {
    let config = EngineConfig::default()
        .with_osr_threshold(3)
        .with_max_call_depth(8)
        .with_instruction_trace(true);
    assert_eq!(
        config,
        EngineConfig {
            osr_threshold: 3,
            max_call_depth: 8,
            trace_instructions: true,
        }
    );
}

#[test]
fn test_config_from_env() {
    // The only test that touches these variables.
    std::env::set_var("CIL_VM_OSR_THRESHOLD", "250");
    std::env::set_var("CIL_VM_MAX_CALL_DEPTH", "not a number");
    std::env::set_var("CIL_VM_TRACE_INSTRUCTIONS", "TRUE");
    let config = EngineConfig::from_env();
    std::env::remove_var("CIL_VM_OSR_THRESHOLD");
    std::env::remove_var("CIL_VM_MAX_CALL_DEPTH");
    std::env::remove_var("CIL_VM_TRACE_INSTRUCTIONS");

    assert_eq!(config.osr_threshold, 250);
    assert_eq!(config.max_call_depth, config::DEFAULT_MAX_CALL_DEPTH);
    assert!(config.trace_instructions);
}

#[test]
fn test_env_helpers_fall_back() {
    assert!(!env_flag("CIL_VM_TEST_FLAG_THAT_IS_NEVER_SET"));
    assert_eq!(env_number("CIL_VM_TEST_NUMBER_THAT_IS_NEVER_SET", 17u32), 17);
}

#[test]
fn test_engine_keeps_its_config() {
    let config = EngineConfig::default().with_osr_threshold(5);
    let (assemblies, engine) = engine_with(config.clone());
    assert_eq!(engine.config(), &config);

    let method = countdown(&assemblies);
    assert_eq!(engine.execute(&method, vec![]), Ok(Some(StackValue::Int32(0))));
    // 19 back edges against a threshold of 5
    assert_eq!(engine.metrics().snapshot().osr_triggers, 3);
}

// ============================================================================
// Single-threaded configuration (no features)
// ============================================================================

#[test]
#[cfg(not(feature = "multithreading"))]
fn test_compat_locks_survive_poisoning() {
    use cil_vm::utils::sync;

    let lock = Arc::new(sync::Mutex::new(1));
    let poisoner = lock.clone();
    let _ = std::thread::spawn(move || {
        let _guard = poisoner.lock();
        panic!("poison the lock");
    })
    .join();
    *lock.lock() += 1;
    assert_eq!(*lock.lock(), 2);

    let rw = sync::RwLock::new(vec![1]);
    rw.write().push(2);
    assert_eq!(rw.read().len(), 2);
}

#[test]
#[cfg(not(feature = "multithreading"))]
fn test_single_threaded_execution() {
    let (assemblies, engine) = engine_with(EngineConfig::default());
    let method = countdown(&assemblies);
    for _ in 0..3 {
        assert_eq!(engine.execute(&method, vec![]), Ok(Some(StackValue::Int32(0))));
    }
    assert_eq!(engine.metrics().snapshot().methods_prepared, 1);
}

// ============================================================================
// Multithreading configuration
// ============================================================================

#[test]
#[cfg(feature = "multithreading")]
fn test_threads_racing_on_fresh_call_sites() {
    const THREADS: usize = 8;
    let (assemblies, engine) = engine_with(EngineConfig::default());
    let seven = vm::assemble("ldc.i4.7\nret", &assemblies).unwrap().into_body();
    assemblies
        .define_method("seven", MethodSignature::new_static(vec![], Some(ValueKind::I4)), seven)
        .unwrap();
    let body = vm::assemble("call seven\ncall seven\nadd\nret", &assemblies)
        .unwrap()
        .into_body();
    let main = assemblies
        .define_method("main", MethodSignature::new_static(vec![], Some(ValueKind::I4)), body)
        .unwrap();
    let main = assemblies.method(main).unwrap();

    let barrier = std::sync::Barrier::new(THREADS);
    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                assert_eq!(engine.execute(&main, vec![]), Ok(Some(StackValue::Int32(14))));
            });
        }
    });

    let metrics = engine.metrics().snapshot();
    assert_eq!(metrics.call_site_resolutions, 2);
    assert_eq!(metrics.node_invocations, 2 * THREADS as u64);
    assert_eq!(engine.prepared(main.handle).unwrap().patched_call_sites(), 2);
}

#[test]
#[cfg(feature = "multithreading")]
fn test_call_depth_is_per_thread() {
    let (assemblies, engine) = engine_with(EngineConfig::default());
    let method = countdown(&assemblies);
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                assert_eq!(engine.execute(&method, vec![]), Ok(Some(StackValue::Int32(0))));
                assert_eq!(engine.call_depth(), 0);
            });
        }
    });
    let metrics = engine.metrics().snapshot();
    assert_eq!(metrics.methods_prepared, 1);
    assert_eq!(metrics.osr_polls, 4 * 19);
}
