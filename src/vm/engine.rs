//! The engine: prepared-method cache, collaborators and the public entry points.
use crate::{
    resolve::{Metadata, SymbolResolver},
    types::{MethodHandle, MethodSymbol},
    utils::{
        il_label,
        sync::{AtomicBool, Mutex, MutexGuard, Ordering},
    },
    value::{ObjectModel, StackValue, ValueKind},
    vm::{
        analysis::{analyze, MethodAnalysis},
        bytecode::BytecodeBuffer,
        config::EngineConfig,
        error::{EngineError, ExecutionError, FaultKind, GuestException, Trap},
        exceptions::RegionTable,
        interpreter::Activation,
        metrics::RuntimeMetrics,
        nodes::CallSiteCache,
        stack::{Frame, FrameLayout},
        tracer::Tracer,
    },
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{cell::Cell, fmt, sync::Arc};
use tracing::{debug, trace};

/// Everything the interpreter needs to run one method, computed once and shared by every
/// activation of it.
pub struct PreparedMethod {
    pub symbol: Arc<MethodSymbol>,
    /// The executable instruction stream. Call sites are patched in place.
    pub code: BytecodeBuffer,
    pub analysis: MethodAnalysis,
    pub regions: RegionTable,
    pub(crate) call_sites: CallSiteCache,
    pub layout: FrameLayout,
    pub arg_kinds: Vec<ValueKind>,
    pub local_kinds: Vec<ValueKind>,
}

impl fmt::Debug for PreparedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedMethod")
            .field("symbol", &self.symbol)
            .field("layout", &self.layout)
            .field("regions", &self.regions.len())
            .field("call_sites", &self.call_sites.len())
            .finish()
    }
}

impl PreparedMethod {
    fn new(symbol: Arc<MethodSymbol>, resolver: &dyn SymbolResolver) -> Result<Self, EngineError> {
        let Some(body) = symbol.body.as_ref() else {
            return Err(EngineError::invalid_state(0, format!("{:?} has no body", symbol)));
        };
        let analysis = analyze(&symbol, resolver)?;
        let regions = RegionTable::new(&body.exception_regions, resolver, &symbol.scope)?;
        let arg_kinds: Vec<_> = symbol.signature.argument_kinds().collect();
        let layout = FrameLayout {
            arguments: arg_kinds.len(),
            locals: body.locals.len(),
            max_stack: body.max_stack as usize,
        };
        Ok(Self {
            code: BytecodeBuffer::new(&body.il),
            local_kinds: body.locals.clone(),
            analysis,
            regions,
            call_sites: CallSiteCache::default(),
            layout,
            arg_kinds,
            symbol,
        })
    }

    /// Number of call sites rewritten into cached calls so far.
    pub fn patched_call_sites(&self) -> usize {
        self.call_sites.len()
    }
}

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Tracks nesting of activations on the current thread.
struct DepthGuard(usize);

impl DepthGuard {
    fn enter(limit: usize) -> Result<Self, EngineError> {
        let depth = CALL_DEPTH.with(|d| d.get()) + 1;
        if depth > limit {
            return Err(EngineError::StackOverflow(limit));
        }
        CALL_DEPTH.with(|d| d.set(depth));
        Ok(DepthGuard(depth))
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(self.0 - 1));
    }
}

pub struct Engine {
    resolver: Arc<dyn SymbolResolver>,
    metadata: Arc<dyn Metadata>,
    objects: Arc<dyn ObjectModel>,
    config: EngineConfig,
    prepared: DashMap<MethodHandle, Arc<PreparedMethod>>,
    metrics: RuntimeMetrics,
    tracer: Mutex<Tracer>,
    tracer_enabled: AtomicBool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("prepared", &self.prepared.len())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine whose execution tracer is configured from the environment.
    pub fn new(
        resolver: Arc<dyn SymbolResolver>,
        metadata: Arc<dyn Metadata>,
        objects: Arc<dyn ObjectModel>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resolver,
            metadata,
            objects,
            config,
            prepared: DashMap::new(),
            metrics: RuntimeMetrics::new(),
            tracer: Mutex::new(Tracer::disabled()),
            tracer_enabled: AtomicBool::new(false),
        }
        .with_tracer(Tracer::from_env())
    }

    pub fn with_tracer(self, tracer: Tracer) -> Self {
        self.tracer_enabled
            .store(tracer.is_enabled(), Ordering::Relaxed);
        *self.tracer.lock() = tracer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn resolver(&self) -> &dyn SymbolResolver {
        &*self.resolver
    }

    pub fn metadata(&self) -> &dyn Metadata {
        &*self.metadata
    }

    pub fn object_model(&self) -> &dyn ObjectModel {
        &*self.objects
    }

    #[inline(always)]
    pub fn tracer_enabled(&self) -> bool {
        self.tracer_enabled.load(Ordering::Relaxed)
    }

    pub fn tracer(&self) -> MutexGuard<'_, Tracer> {
        self.tracer.lock()
    }

    /// The nesting depth of activations on the calling thread.
    pub fn call_depth(&self) -> usize {
        CALL_DEPTH.with(|d| d.get())
    }

    /// Analyzes `method` on first use and caches the result.
    pub fn prepare(&self, method: &Arc<MethodSymbol>) -> Result<Arc<PreparedMethod>, EngineError> {
        if let Some(prepared) = self.prepared.get(&method.handle) {
            return Ok(prepared.value().clone());
        }
        // Analysis runs unlocked; a racing thread's result is discarded.
        let prepared = Arc::new(PreparedMethod::new(method.clone(), &*self.resolver)?);
        Ok(match self.prepared.entry(method.handle) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                self.metrics.record_method_prepared();
                debug!(
                    method = %method.name,
                    code_size = prepared.code.len(),
                    regions = prepared.regions.len(),
                    "prepared method"
                );
                slot.insert(prepared).value().clone()
            }
        })
    }

    pub fn prepared(&self, handle: MethodHandle) -> Option<Arc<PreparedMethod>> {
        self.prepared.get(&handle).map(|p| p.value().clone())
    }

    /// Builds the initial frame of an activation of `method`.
    pub fn new_frame(&self, method: &PreparedMethod, args: Vec<StackValue>) -> Result<Frame, ExecutionError> {
        if args.len() != method.layout.arguments {
            return Err(EngineError::ArgumentCount {
                method: method.symbol.name.clone(),
                expected: method.layout.arguments,
                actual: args.len(),
            }
            .into());
        }
        let args = args
            .into_iter()
            .zip(&method.arg_kinds)
            .enumerate()
            .map(|(slot, (value, kind))| self.normalize(slot, *kind, value))
            .collect::<Result<Vec<_>, Trap>>()
            .map_err(|trap| self.raise(trap))?;
        Ok(Frame::new(method.layout, args, &method.local_kinds))
    }

    /// Builds the guest exception for an implicit fault.
    pub(crate) fn fault_exception(&self, kind: FaultKind, message: String) -> GuestException {
        GuestException {
            object: self.objects.create_exception(kind, &message),
            kind: Some(kind),
            message,
        }
    }

    /// Turns a trap that escaped every handler into the caller-visible error.
    pub(crate) fn raise(&self, trap: Trap) -> ExecutionError {
        match trap {
            Trap::Engine(e) => e.into(),
            Trap::Thrown(g) => ExecutionError::Guest(g),
            Trap::Fault(kind, message) => ExecutionError::Guest(self.fault_exception(kind, message)),
        }
    }

    /// Narrows `value` to the storage `kind` and copies value types.
    pub(crate) fn normalize(&self, slot: usize, kind: ValueKind, value: StackValue) -> Result<StackValue, Trap> {
        let value = match kind {
            ValueKind::Struct => self.objects.copy_value(&value)?,
            _ => value,
        };
        let actual = value.stack_type();
        kind.coerce(value).ok_or_else(|| {
            Trap::Engine(EngineError::SlotType {
                slot,
                expected: "a value storable in the slot's kind",
                actual: format!("{} for {:?}", actual, kind),
            })
        })
    }

    /// Runs `method` to completion on the calling thread.
    pub fn execute(
        &self,
        method: &Arc<MethodSymbol>,
        args: Vec<StackValue>,
    ) -> Result<Option<StackValue>, ExecutionError> {
        let guard = DepthGuard::enter(self.config.max_call_depth)?;
        if method.body.is_none() {
            trace!(method = %method.name, "dispatching bodyless method to the object model");
            let expected = method.signature.parameter_count_including_instance();
            if args.len() != expected {
                return Err(EngineError::ArgumentCount {
                    method: method.name.clone(),
                    expected,
                    actual: args.len(),
                }
                .into());
            }
            return self.objects.invoke_native(method, &args);
        }
        let prepared = self.prepare(method)?;
        let frame = self.new_frame(&prepared, args)?;
        let top = prepared.layout.stack_base();
        Activation::new(self, prepared, frame, top, guard.0).run(0)
    }

    /// Continues an activation at `offset` with the evaluation stack ending at `saved_top`.
    ///
    /// This is the re-entry point for code that leaves the interpreter mid-method. The frame
    /// must have the method's layout and `saved_top` must match the analyzed stack depth at
    /// `offset`.
    pub fn resume_at_offset(
        &self,
        method: &Arc<MethodSymbol>,
        frame: Frame,
        offset: usize,
        saved_top: usize,
    ) -> Result<Option<StackValue>, ExecutionError> {
        let guard = DepthGuard::enter(self.config.max_call_depth)?;
        let prepared = self.prepare(method)?;
        if *frame.layout() != prepared.layout {
            return Err(EngineError::invalid_state(offset, "frame layout does not match the method").into());
        }
        if !prepared.analysis.is_instruction_start(offset) {
            return Err(EngineError::invalid_program(offset, "resume offset is not an instruction start").into());
        }
        let depth = saved_top.checked_sub(prepared.layout.stack_base());
        if depth.is_none() || depth != prepared.analysis.stack_depth(offset) {
            return Err(EngineError::invalid_state(
                offset,
                format!(
                    "saved top {} does not match the stack depth at {:?}",
                    saved_top,
                    il_label(offset)
                ),
            )
            .into());
        }
        debug!(method = %method.name, offset, saved_top, "resuming activation");
        Activation::new(self, prepared, frame, saved_top, guard.0).run(offset)
    }
}
