// Static identity directory
//
// An in-process org chart loaded from JSON. Used by tests, simulations and
// the worker binary when no external identity service is wired in. It can be
// edited at runtime so org changes between steps are observable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::definition::ApproverType;
use crate::error::ResolutionError;
use crate::resolver::{DirectoryQuery, IdentityDirectory, PrincipalId};

/// Serialized form of the org chart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgChart {
    /// principal → manager
    pub managers: BTreeMap<PrincipalId, PrincipalId>,
    /// role → members
    pub roles: BTreeMap<String, Vec<PrincipalId>>,
    /// dynamic key → principals
    pub dynamic: BTreeMap<String, Vec<PrincipalId>>,
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    chart: RwLock<OrgChart>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chart(chart: OrgChart) -> Self {
        Self {
            chart: RwLock::new(chart),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::from_chart(serde_json::from_str(json)?))
    }

    pub fn with_manager(self, principal: impl Into<String>, manager: impl Into<String>) -> Self {
        self.set_manager(principal, manager);
        self
    }

    pub fn with_role<I, S>(self, role: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_role(role, members);
        self
    }

    pub fn with_dynamic<I, S>(self, key: impl Into<String>, principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chart
            .write()
            .dynamic
            .insert(key.into(), principals.into_iter().map(Into::into).collect());
        self
    }

    pub fn set_manager(&self, principal: impl Into<String>, manager: impl Into<String>) {
        self.chart
            .write()
            .managers
            .insert(principal.into(), manager.into());
    }

    pub fn set_role<I, S>(&self, role: impl Into<String>, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chart
            .write()
            .roles
            .insert(role.into(), members.into_iter().map(Into::into).collect());
    }

    pub fn snapshot(&self) -> OrgChart {
        self.chart.read().clone()
    }
}

impl OrgChart {
    /// Walk `tiers` steps up the management chain
    fn manager_of(&self, principal: &str, tiers: u32) -> Option<PrincipalId> {
        let mut current = principal.to_string();
        for _ in 0..tiers {
            current = self.managers.get(&current)?.clone();
        }
        Some(current)
    }

    fn lift(&self, principals: Vec<PrincipalId>, tiers: u32) -> Vec<PrincipalId> {
        let mut lifted = Vec::new();
        for p in principals {
            if let Some(m) = self.manager_of(&p, tiers) {
                if !lifted.contains(&m) {
                    lifted.push(m);
                }
            }
        }
        lifted
    }

    fn split(selector: Option<&str>) -> Vec<PrincipalId> {
        selector
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn resolve(&self, query: &DirectoryQuery) -> Result<Vec<PrincipalId>, ResolutionError> {
        let chart = self.chart.read();
        let selector = query.selector.as_deref();

        let base = match query.approver_type {
            ApproverType::DirectManager => {
                let subject = query.subject.as_deref().unwrap_or_default();
                return Ok(chart
                    .manager_of(subject, query.tiers_up + 1)
                    .into_iter()
                    .collect());
            }
            ApproverType::RoleBased => selector
                .and_then(|role| chart.roles.get(role))
                .cloned()
                .unwrap_or_default(),
            ApproverType::SpecificUser => OrgChart::split(selector),
            ApproverType::Dynamic => match selector {
                Some(key) => match chart.dynamic.get(key) {
                    Some(principals) => principals.clone(),
                    // Fall back to a context field naming the principal
                    None => query.context.get_str(key).into_iter().collect(),
                },
                None => Vec::new(),
            },
        };

        Ok(chart.lift(base, query.tiers_up))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::EvaluationContext;

    fn directory() -> StaticDirectory {
        StaticDirectory::new()
            .with_manager("alice", "bob")
            .with_manager("bob", "carol")
            .with_manager("fin1", "cfo")
            .with_manager("fin2", "cfo")
            .with_role("finance", ["fin2", "fin1"])
    }

    fn query(approver_type: ApproverType, selector: Option<&str>, tiers_up: u32) -> DirectoryQuery {
        DirectoryQuery {
            approver_type,
            selector: selector.map(str::to_string),
            subject: Some("alice".to_string()),
            context: EvaluationContext::new().with("owner", "dave"),
            tiers_up,
        }
    }

    #[tokio::test]
    async fn test_direct_manager_chain() {
        let dir = directory();
        assert_eq!(
            dir.resolve(&query(ApproverType::DirectManager, None, 0)).await.unwrap(),
            vec!["bob"]
        );
        assert_eq!(
            dir.resolve(&query(ApproverType::DirectManager, None, 1)).await.unwrap(),
            vec!["carol"]
        );
        assert!(dir
            .resolve(&query(ApproverType::DirectManager, None, 2))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_role_escalates_to_shared_manager() {
        let dir = directory();
        let q = query(ApproverType::RoleBased, Some("finance"), 1);
        assert_eq!(dir.resolve(&q).await.unwrap(), vec!["cfo"]);
    }

    #[tokio::test]
    async fn test_dynamic_falls_back_to_context_field() {
        let dir = directory().with_dynamic("security", ["sec1"]);
        assert_eq!(
            dir.resolve(&query(ApproverType::Dynamic, Some("security"), 0))
                .await
                .unwrap(),
            vec!["sec1"]
        );
        assert_eq!(
            dir.resolve(&query(ApproverType::Dynamic, Some("owner"), 0))
                .await
                .unwrap(),
            vec!["dave"]
        );
    }

    #[tokio::test]
    async fn test_org_changes_are_visible() {
        let dir = directory();
        dir.set_role("finance", ["fin3"]);
        let q = query(ApproverType::RoleBased, Some("finance"), 0);
        assert_eq!(dir.resolve(&q).await.unwrap(), vec!["fin3"]);
    }

    #[test]
    fn test_from_json() {
        let dir = StaticDirectory::from_json(
            r#"{ "managers": { "alice": "bob" }, "roles": { "finance": ["fin1"] } }"#,
        )
        .unwrap();
        let chart = dir.snapshot();
        assert_eq!(chart.managers.get("alice").map(String::as_str), Some("bob"));
        assert!(chart.dynamic.is_empty());
    }
}
