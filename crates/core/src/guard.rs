// Permission Guard
//
// A static capability matrix keyed by role. Every instance-mutating call is
// checked here first; a denial leaves all state untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Capabilities a role may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Trigger,
    ViewOwn,
    ViewTeam,
    ViewAll,
    Approve,
    Reject,
    Delegate,
    Escalate,
    Cancel,
    Configure,
    CreateTemplates,
    Override,
    Simulate,
    Audit,
}

impl Capability {
    pub const ALL: [Capability; 14] = [
        Capability::Trigger,
        Capability::ViewOwn,
        Capability::ViewTeam,
        Capability::ViewAll,
        Capability::Approve,
        Capability::Reject,
        Capability::Delegate,
        Capability::Escalate,
        Capability::Cancel,
        Capability::Configure,
        Capability::CreateTemplates,
        Capability::Override,
        Capability::Simulate,
        Capability::Audit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Trigger => "trigger",
            Capability::ViewOwn => "view_own",
            Capability::ViewTeam => "view_team",
            Capability::ViewAll => "view_all",
            Capability::Approve => "approve",
            Capability::Reject => "reject",
            Capability::Delegate => "delegate",
            Capability::Escalate => "escalate",
            Capability::Cancel => "cancel",
            Capability::Configure => "configure",
            Capability::CreateTemplates => "create_templates",
            Capability::Override => "override",
            Capability::Simulate => "simulate",
            Capability::Audit => "audit",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller of an engine operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Internal principal used by the scheduler and action workers
    pub fn system() -> Self {
        Self::new("system").with_role("system")
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Role → capability set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionMatrix {
    roles: BTreeMap<String, BTreeSet<Capability>>,
}

impl PermissionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in matrix
    ///
    /// | role     | capabilities                                        |
    /// |----------|-----------------------------------------------------|
    /// | employee | trigger, view_own                                   |
    /// | manager  | employee + approve, reject, delegate, view_team     |
    /// | finance  | same as manager                                     |
    /// | auditor  | view_all, audit, simulate                           |
    /// | admin    | everything                                          |
    /// | system   | everything (scheduler and action workers)           |
    pub fn standard() -> Self {
        use Capability::*;
        let employee = [Trigger, ViewOwn];
        let approver = [Trigger, ViewOwn, ViewTeam, Approve, Reject, Delegate];

        Self::new()
            .grant("employee", employee)
            .grant("manager", approver)
            .grant("finance", approver)
            .grant("auditor", [ViewAll, Audit, Simulate])
            .grant("admin", Capability::ALL)
            .grant("system", Capability::ALL)
    }

    /// Add capabilities to a role
    pub fn grant(
        mut self,
        role: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        self.roles
            .entry(role.into())
            .or_default()
            .extend(capabilities);
        self
    }

    pub fn role_has(&self, role: &str, capability: Capability) -> bool {
        self.roles
            .get(role)
            .is_some_and(|caps| caps.contains(&capability))
    }

    /// Roles holding a capability, in name order
    pub fn roles_with(&self, capability: Capability) -> Vec<String> {
        self.roles
            .iter()
            .filter(|(_, caps)| caps.contains(&capability))
            .map(|(role, _)| role.clone())
            .collect()
    }
}

/// Checks a principal's roles against the matrix
#[derive(Debug, Clone)]
pub struct PermissionGuard {
    matrix: PermissionMatrix,
}

impl Default for PermissionGuard {
    fn default() -> Self {
        Self::new(PermissionMatrix::standard())
    }
}

impl PermissionGuard {
    pub fn new(matrix: PermissionMatrix) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &PermissionMatrix {
        &self.matrix
    }

    pub fn allows(&self, principal: &Principal, capability: Capability) -> bool {
        principal
            .roles
            .iter()
            .any(|role| self.matrix.role_has(role, capability))
    }

    /// Fail with `PermissionDenied` unless the principal holds the capability
    pub fn check(&self, principal: &Principal, capability: Capability) -> Result<(), EngineError> {
        if self.allows(principal, capability) {
            Ok(())
        } else {
            tracing::warn!(
                principal = %principal.id,
                capability = %capability,
                "permission denied"
            );
            Err(EngineError::PermissionDenied {
                principal: principal.id.clone(),
                capability,
            })
        }
    }

    /// Succeeds if any of the capabilities is held; reports the first on denial
    pub fn check_any(
        &self,
        principal: &Principal,
        capabilities: &[Capability],
    ) -> Result<Capability, EngineError> {
        for cap in capabilities {
            if self.allows(principal, *cap) {
                return Ok(*cap);
            }
        }
        let capability = capabilities.first().copied().unwrap_or(Capability::ViewAll);
        Err(EngineError::PermissionDenied {
            principal: principal.id.clone(),
            capability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_matrix() {
        let guard = PermissionGuard::default();
        let employee = Principal::new("e1").with_role("employee");
        let manager = Principal::new("m1").with_role("manager");
        let admin = Principal::new("a1").with_role("admin");

        assert!(guard.allows(&employee, Capability::Trigger));
        assert!(!guard.allows(&employee, Capability::Approve));
        assert!(guard.allows(&manager, Capability::Approve));
        assert!(!guard.allows(&manager, Capability::Override));
        assert!(guard.allows(&admin, Capability::Override));
    }

    #[test]
    fn test_check_denies_with_typed_error() {
        let guard = PermissionGuard::default();
        let manager = Principal::new("m1").with_role("manager");
        let err = guard.check(&manager, Capability::Cancel).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PermissionDenied { ref principal, capability: Capability::Cancel }
                if principal == "m1"
        ));
        assert_eq!(err.to_string(), "permission denied: m1 lacks cancel");
    }

    #[test]
    fn test_roles_are_unioned() {
        let guard = PermissionGuard::default();
        let both = Principal::new("x").with_role("employee").with_role("auditor");
        assert!(guard.allows(&both, Capability::Trigger));
        assert!(guard.allows(&both, Capability::Audit));
        assert!(guard.check_any(&both, &[Capability::Approve, Capability::ViewAll]).is_ok());
    }

    #[test]
    fn test_roles_with() {
        let matrix = PermissionMatrix::standard();
        assert_eq!(
            matrix.roles_with(Capability::Audit),
            vec!["admin", "auditor", "system"]
        );
    }

    #[test]
    fn test_capability_serde() {
        let json = serde_json::to_string(&Capability::CreateTemplates).unwrap();
        assert_eq!(json, "\"create_templates\"");
    }
}
