use crate::vm::{
    error::{EngineError, Trap},
    interpreter::{Activation, StepResult},
    nodes::{CallSiteNode, Invoke},
};
use std::sync::Arc;

impl Activation<'_> {
    /// First execution of a `call`, `callvirt`, `newobj` or `jmp`: resolves the site into a
    /// node, patches the instruction and performs the call.
    pub(super) fn call_site(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let method = self.method.clone();
        let node = method
            .call_sites
            .resolve(&method.code, pc, &method.symbol.scope, self.engine)?;
        self.invoke_node(&node)
    }

    pub(super) fn cached_call(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let index = self.method.code.imm_u32(pc)?;
        let node = self
            .method
            .call_sites
            .get(index)
            .ok_or_else(|| EngineError::invalid_state(pc, format!("no call-site node {}", index)))?;
        self.invoke_node(&node)
    }

    fn invoke_node(&mut self, node: &Arc<CallSiteNode>) -> Result<StepResult, Trap> {
        self.engine.metrics().record_node_invocation();
        node.invoke(self)
    }
}
