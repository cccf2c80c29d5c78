// Execution context
//
// Passed into every engine call. Carries the calling principal (checked by
// the permission guard) and the sandbox flag that turns a real run into a
// dry run: actions are recorded in the audit trail instead of dispatched.

use flowgate_core::Principal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub principal: Principal,
    pub sandbox: bool,
}

impl ExecutionContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            sandbox: false,
        }
    }

    /// Context for the scheduler and other internal callers
    pub fn system() -> Self {
        Self::new(Principal::system())
    }

    /// Same principal, no external side effects
    pub fn sandboxed(mut self) -> Self {
        self.sandbox = true;
        self
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn principal_id(&self) -> &str {
        &self.principal.id
    }
}

impl From<Principal> for ExecutionContext {
    fn from(principal: Principal) -> Self {
        Self::new(principal)
    }
}
