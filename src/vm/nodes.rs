//! Call-site nodes.
//!
//! The first execution of a `call`, `callvirt`, `newobj` or `jmp` resolves its token into
//! a node and rewrites the instruction into [`Opcode::CachedCall`] carrying the node's
//! index. Later executions go straight to the node without touching the resolver.
use crate::{
    types::{MethodSymbol, ResolutionScope, Token, TypeSymbol},
    utils::{il_label, sync::RwLock},
    value::StackValue,
    vm::{
        bytecode::{prepare_patch, BytecodeBuffer},
        engine::Engine,
        error::{EngineError, FaultKind, Trap},
        interpreter::{Activation, StepResult},
        opcodes::Opcode,
    },
};
use enum_dispatch::enum_dispatch;
use std::sync::Arc;
use tracing::debug;

#[enum_dispatch]
pub(crate) trait Invoke {
    /// Performs the call with the activation's evaluation stack as the argument source.
    fn invoke(&self, activation: &mut Activation<'_>) -> Result<StepResult, Trap>;
}

#[enum_dispatch(Invoke)]
#[derive(Debug)]
pub(crate) enum CallSiteNode {
    CallNode,
    CallVirtNode,
    NewObjNode,
    JmpNode,
}

impl CallSiteNode {
    fn build(op: Opcode, token: Token, pc: usize, scope: &ResolutionScope, engine: &Engine) -> Result<Self, Trap> {
        let resolver = engine.resolver();
        let method = resolver.resolve_method(token, scope)?;
        Ok(match op {
            Opcode::Call => CallNode { method }.into(),
            Opcode::Callvirt => CallVirtNode { method }.into(),
            Opcode::Newobj => {
                let ty = resolver.type_of(method.declaring_type)?;
                NewObjNode { ctor: method, ty }.into()
            }
            Opcode::Jmp => JmpNode { method }.into(),
            op => {
                return Err(EngineError::invalid_state(pc, format!("{} is not a call site", op)).into())
            }
        })
    }

    pub fn target(&self) -> &Arc<MethodSymbol> {
        match self {
            CallSiteNode::CallNode(n) => &n.method,
            CallSiteNode::CallVirtNode(n) => &n.method,
            CallSiteNode::NewObjNode(n) => &n.ctor,
            CallSiteNode::JmpNode(n) => &n.method,
        }
    }
}

/// Pushes the value `method` returned, if its signature has one.
fn push_return(
    activation: &mut Activation<'_>,
    method: &MethodSymbol,
    value: Option<StackValue>,
) -> Result<(), Trap> {
    match (method.has_return_value(), value) {
        (true, Some(value)) => activation.push(value),
        (false, _) => Ok(()),
        (true, None) => Err(EngineError::invalid_state(
            activation.pc,
            format!("{} returned no value", method.name),
        )
        .into()),
    }
}

#[derive(Debug)]
pub(crate) struct CallNode {
    method: Arc<MethodSymbol>,
}

impl Invoke for CallNode {
    fn invoke(&self, activation: &mut Activation<'_>) -> Result<StepResult, Trap> {
        let count = self.method.signature.parameter_count_including_instance();
        let args = activation.pop_arguments(count)?;
        let value = activation.engine().execute(&self.method, args)?;
        push_return(activation, &self.method, value)?;
        Ok(StepResult::Continue)
    }
}

#[derive(Debug)]
pub(crate) struct CallVirtNode {
    method: Arc<MethodSymbol>,
}

impl Invoke for CallVirtNode {
    fn invoke(&self, activation: &mut Activation<'_>) -> Result<StepResult, Trap> {
        let count = self.method.signature.parameter_count_including_instance();
        let args = activation.pop_arguments(count)?;
        let target = match args.first() {
            Some(StackValue::ObjectRef(this)) if this.is_null() => {
                return Err(FaultKind::NullReference.into())
            }
            // Resolved on every invocation: receivers at one site may differ in type.
            Some(StackValue::ObjectRef(this)) if self.method.is_virtual => match this.type_handle() {
                Some(ty) => activation.engine().resolver().resolve_virtual(&self.method, ty)?,
                None => self.method.clone(),
            },
            _ => self.method.clone(),
        };
        let value = activation.engine().execute(&target, args)?;
        push_return(activation, &target, value)?;
        Ok(StepResult::Continue)
    }
}

#[derive(Debug)]
pub(crate) struct NewObjNode {
    ctor: Arc<MethodSymbol>,
    ty: Arc<TypeSymbol>,
}

impl Invoke for NewObjNode {
    fn invoke(&self, activation: &mut Activation<'_>) -> Result<StepResult, Trap> {
        let mut args = activation.pop_arguments(self.ctor.signature.parameters.len())?;
        let object = activation.engine().object_model().create_new(&self.ty)?;
        args.insert(0, StackValue::ObjectRef(object.clone()));
        activation.engine().execute(&self.ctor, args)?;
        activation.push(StackValue::ObjectRef(object))?;
        Ok(StepResult::Continue)
    }
}

#[derive(Debug)]
pub(crate) struct JmpNode {
    method: Arc<MethodSymbol>,
}

impl Invoke for JmpNode {
    fn invoke(&self, activation: &mut Activation<'_>) -> Result<StepResult, Trap> {
        let args = activation.arguments()?;
        let value = activation.engine().execute(&self.method, args)?;
        Ok(StepResult::Return(value))
    }
}

enum CallSite {
    Cached(Arc<CallSiteNode>),
    Unresolved(Opcode, Token),
}

/// The nodes of one method's call sites, indexed by the operand of their cached call.
#[derive(Debug, Default)]
pub(crate) struct CallSiteCache {
    nodes: RwLock<Vec<Arc<CallSiteNode>>>,
}

impl CallSiteCache {
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn get(&self, index: u32) -> Option<Arc<CallSiteNode>> {
        self.nodes.read().get(index as usize).cloned()
    }

    fn cached(nodes: &[Arc<CallSiteNode>], code: &BytecodeBuffer, pc: usize) -> Result<Arc<CallSiteNode>, Trap> {
        let index = code.imm_u32(pc)?;
        nodes
            .get(index as usize)
            .cloned()
            .ok_or_else(|| EngineError::invalid_state(pc, format!("no call-site node {}", index)).into())
    }

    /// Reads the call site at `pc`. Patches only happen under the write lock, so the opcode
    /// and token read here always belong to the same encoding.
    fn inspect(&self, code: &BytecodeBuffer, pc: usize) -> Result<CallSite, Trap> {
        let nodes = self.nodes.read();
        let op = code.opcode_at(pc)?;
        if op == Opcode::CachedCall {
            return Self::cached(&nodes, code, pc).map(CallSite::Cached);
        }
        Ok(CallSite::Unresolved(op, code.imm_token(pc)?))
    }

    /// Installs `node` for the site at `pc` and patches the instruction, unless another
    /// thread got there first, in which case its node is returned instead.
    fn install(
        &self,
        code: &BytecodeBuffer,
        pc: usize,
        node: Arc<CallSiteNode>,
        engine: &Engine,
    ) -> Result<Arc<CallSiteNode>, Trap> {
        let mut nodes = self.nodes.write();
        if code.opcode_at(pc)? == Opcode::CachedCall {
            return Self::cached(&nodes, code, pc);
        }
        let index = nodes.len() as u32;
        let patch = prepare_patch(index, code.next_pc(pc)? - pc)?;
        nodes.push(node.clone());
        code.patch(pc, &patch)?;
        engine.metrics().record_call_site_resolution();
        debug!(
            offset = ?il_label(pc),
            index,
            target = %node.target().name,
            "patched call site"
        );
        Ok(node)
    }

    /// Returns the node for the call site at `pc`, resolving and patching it on first use.
    ///
    /// Resolution runs without holding the lock. When two threads race on one site, the
    /// first to take the write lock installs its node and the other's is dropped.
    pub fn resolve(
        &self,
        code: &BytecodeBuffer,
        pc: usize,
        scope: &ResolutionScope,
        engine: &Engine,
    ) -> Result<Arc<CallSiteNode>, Trap> {
        match self.inspect(code, pc)? {
            CallSite::Cached(node) => Ok(node),
            CallSite::Unresolved(op, token) => {
                let node = Arc::new(CallSiteNode::build(op, token, pc, scope, engine)?);
                self.install(code, pc, node, engine)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resolve::Assemblies,
        types::MethodSignature,
        value::{heap::Heap, ValueKind},
        vm::{assemble, config::EngineConfig, engine::PreparedMethod},
    };
    use std::sync::Barrier;

    fn setup() -> (Engine, Arc<PreparedMethod>) {
        let assemblies = Arc::new(Assemblies::new());
        let heap = Arc::new(Heap::new(assemblies.clone()));
        let seven = assemble("ldc.i4.7\nret", &assemblies).unwrap().into_body();
        assemblies
            .define_method("seven", MethodSignature::new_static(vec![], Some(ValueKind::I4)), seven)
            .unwrap();
        let body = assemble("call seven\nret", &assemblies).unwrap().into_body();
        let main = assemblies
            .define_method("main", MethodSignature::new_static(vec![], Some(ValueKind::I4)), body)
            .unwrap();
        let main = assemblies.method(main).unwrap();
        let engine = Engine::new(assemblies.clone(), assemblies, heap, EngineConfig::default());
        let prepared = engine.prepare(&main).unwrap();
        (engine, prepared)
    }

    #[test]
    fn test_site_patched_between_read_and_install_reuses_the_installed_node() {
        let (engine, method) = setup();
        let scope = &method.symbol.scope;

        // One visitor reads the unpatched site...
        let CallSite::Unresolved(op, token) = method.call_sites.inspect(&method.code, 0).unwrap() else {
            panic!("site should start unresolved");
        };
        // ...another resolves and patches it before the first one builds its node.
        let installed = method.call_sites.resolve(&method.code, 0, scope, &engine).unwrap();
        assert_eq!(method.code.opcode_at(0), Ok(Opcode::CachedCall));

        let late = Arc::new(CallSiteNode::build(op, token, 0, scope, &engine).unwrap());
        assert_eq!(late.target().name, "seven");
        let node = method.call_sites.install(&method.code, 0, late, &engine).unwrap();

        assert!(Arc::ptr_eq(&node, &installed));
        assert_eq!(method.call_sites.len(), 1);
        assert_eq!(engine.metrics().snapshot().call_site_resolutions, 1);
        assert!(matches!(
            method.call_sites.inspect(&method.code, 0),
            Ok(CallSite::Cached(n)) if Arc::ptr_eq(&n, &installed)
        ));
    }

    #[test]
    fn test_concurrent_first_visits_share_one_node() {
        const THREADS: usize = 8;
        let (engine, method) = setup();
        let barrier = Barrier::new(THREADS);
        let nodes: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        method
                            .call_sites
                            .resolve(&method.code, 0, &method.symbol.scope, &engine)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(nodes.iter().all(|n| Arc::ptr_eq(n, &nodes[0])));
        assert_eq!(method.call_sites.len(), 1);
        assert_eq!(engine.metrics().snapshot().call_site_resolutions, 1);
    }
}
