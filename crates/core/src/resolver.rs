// Approver Resolver
//
// Turns an approver rule into a concrete, ordered, non-empty principal set.
// Each approver type is one `ApproverStrategy`; org-chart lookups go through
// the `IdentityDirectory` collaborator. Resolution runs when a step becomes
// active (or escalates), never at instance creation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::condition::EvaluationContext;
use crate::definition::{ApproverRule, ApproverType};
use crate::error::ResolutionError;

/// Identifier of a person or service account
pub type PrincipalId = String;

/// Context field holding the requester when none is configured
pub const DEFAULT_SUBJECT_FIELD: &str = "requester_id";

// ============================================================================
// Identity directory
// ============================================================================

/// A lookup against the organization's identity service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryQuery {
    pub approver_type: ApproverType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Principal the request is about (usually the requester)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<PrincipalId>,
    pub context: EvaluationContext,
    /// Organizational tiers above the base result (0 at the first level)
    pub tiers_up: u32,
}

/// External identity/org-chart service
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Return the principals for a query, possibly empty
    async fn resolve(&self, query: &DirectoryQuery) -> Result<Vec<PrincipalId>, ResolutionError>;
}

// ============================================================================
// Strategies
// ============================================================================

/// What a strategy needs to resolve one step
#[derive(Debug, Clone, Copy)]
pub struct ResolutionRequest<'a> {
    pub rule: &'a ApproverRule,
    pub context: &'a EvaluationContext,
    /// Escalation level, 1-based
    pub level: u32,
    pub subject_field: &'a str,
}

impl ResolutionRequest<'_> {
    fn tiers_up(&self) -> u32 {
        self.level.saturating_sub(1)
    }

    fn subject(&self) -> Option<PrincipalId> {
        self.context.get_str(self.subject_field)
    }

    fn require_selector(&self) -> Result<String, ResolutionError> {
        self.rule
            .selector
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ResolutionError::MissingSelector {
                step: self.rule.step_number,
                approver_type: self.rule.approver_type.to_string(),
            })
    }

    fn query(&self, selector: Option<String>, subject: Option<PrincipalId>) -> DirectoryQuery {
        DirectoryQuery {
            approver_type: self.rule.approver_type,
            selector,
            subject,
            context: self.context.clone(),
            tiers_up: self.tiers_up(),
        }
    }
}

/// One implementation per approver type
#[async_trait]
pub trait ApproverStrategy: Send + Sync {
    fn approver_type(&self) -> ApproverType;

    async fn resolve(
        &self,
        request: ResolutionRequest<'_>,
        directory: &dyn IdentityDirectory,
    ) -> Result<Vec<PrincipalId>, ResolutionError>;
}

/// The requester's manager, one tier further up per escalation level
pub struct DirectManagerStrategy;

#[async_trait]
impl ApproverStrategy for DirectManagerStrategy {
    fn approver_type(&self) -> ApproverType {
        ApproverType::DirectManager
    }

    async fn resolve(
        &self,
        request: ResolutionRequest<'_>,
        directory: &dyn IdentityDirectory,
    ) -> Result<Vec<PrincipalId>, ResolutionError> {
        let subject = request
            .subject()
            .ok_or_else(|| ResolutionError::MissingSubject {
                step: request.rule.step_number,
                field: request.subject_field.to_string(),
            })?;
        directory.resolve(&request.query(None, Some(subject))).await
    }
}

/// Members of a role, sorted by principal id
///
/// Several people commonly hold the same role; the set is sorted so every
/// resolution of the same org state yields the same order.
pub struct RoleBasedStrategy;

#[async_trait]
impl ApproverStrategy for RoleBasedStrategy {
    fn approver_type(&self) -> ApproverType {
        ApproverType::RoleBased
    }

    async fn resolve(
        &self,
        request: ResolutionRequest<'_>,
        directory: &dyn IdentityDirectory,
    ) -> Result<Vec<PrincipalId>, ResolutionError> {
        let role = request.require_selector()?;
        let mut members = directory
            .resolve(&request.query(Some(role), request.subject()))
            .await?;
        members.sort();
        members.dedup();
        Ok(members)
    }
}

/// A static list of user ids; escalations go to their managers
pub struct SpecificUserStrategy;

#[async_trait]
impl ApproverStrategy for SpecificUserStrategy {
    fn approver_type(&self) -> ApproverType {
        ApproverType::SpecificUser
    }

    async fn resolve(
        &self,
        request: ResolutionRequest<'_>,
        directory: &dyn IdentityDirectory,
    ) -> Result<Vec<PrincipalId>, ResolutionError> {
        let selector = request.require_selector()?;
        if request.level <= 1 {
            return Ok(selector
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect());
        }
        directory
            .resolve(&request.query(Some(selector), request.subject()))
            .await
    }
}

/// Anything the directory can compute from a key and the context
pub struct DynamicStrategy;

#[async_trait]
impl ApproverStrategy for DynamicStrategy {
    fn approver_type(&self) -> ApproverType {
        ApproverType::Dynamic
    }

    async fn resolve(
        &self,
        request: ResolutionRequest<'_>,
        directory: &dyn IdentityDirectory,
    ) -> Result<Vec<PrincipalId>, ResolutionError> {
        directory
            .resolve(&request.query(request.rule.selector.clone(), request.subject()))
            .await
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Dispatches rules to their strategy and enforces a non-empty result
#[derive(Clone)]
pub struct ApproverResolver {
    directory: Arc<dyn IdentityDirectory>,
    strategies: HashMap<ApproverType, Arc<dyn ApproverStrategy>>,
    subject_field: String,
}

impl ApproverResolver {
    /// Resolver with the four built-in strategies
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self {
            directory,
            strategies: HashMap::new(),
            subject_field: DEFAULT_SUBJECT_FIELD.to_string(),
        }
        .with_strategy(Arc::new(DirectManagerStrategy))
        .with_strategy(Arc::new(RoleBasedStrategy))
        .with_strategy(Arc::new(SpecificUserStrategy))
        .with_strategy(Arc::new(DynamicStrategy))
    }

    /// Replace the strategy for its approver type
    pub fn with_strategy(mut self, strategy: Arc<dyn ApproverStrategy>) -> Self {
        self.strategies.insert(strategy.approver_type(), strategy);
        self
    }

    /// Context field naming the requester
    pub fn with_subject_field(mut self, field: impl Into<String>) -> Self {
        self.subject_field = field.into();
        self
    }

    pub async fn resolve(
        &self,
        rule: &ApproverRule,
        context: &EvaluationContext,
        level: u32,
    ) -> Result<Vec<PrincipalId>, ResolutionError> {
        let strategy = self
            .strategies
            .get(&rule.approver_type)
            .ok_or_else(|| ResolutionError::NoStrategy(rule.approver_type.to_string()))?;

        let request = ResolutionRequest {
            rule,
            context,
            level,
            subject_field: &self.subject_field,
        };
        let resolved = strategy.resolve(request, self.directory.as_ref()).await?;

        let mut principals: Vec<PrincipalId> = Vec::with_capacity(resolved.len());
        for p in resolved {
            if !p.is_empty() && !principals.contains(&p) {
                principals.push(p);
            }
        }

        if principals.is_empty() {
            tracing::warn!(
                step_number = rule.step_number,
                approver_type = %rule.approver_type,
                level,
                "approver set resolved empty"
            );
            return Err(ResolutionError::EmptyApproverSet {
                step: rule.step_number,
                approver_type: rule.approver_type.to_string(),
            });
        }

        tracing::debug!(
            step_number = rule.step_number,
            level,
            principals = ?principals,
            "approvers resolved"
        );
        Ok(principals)
    }

    /// The requester named in a context
    pub fn requester(&self, context: &EvaluationContext) -> Option<PrincipalId> {
        context.get_str(&self.subject_field)
    }

    /// Whether `principal` is somewhere above `subject` in the management chain,
    /// looking at most `max_tiers` levels up
    pub async fn manages(
        &self,
        principal: &str,
        subject: &str,
        max_tiers: u32,
    ) -> Result<bool, ResolutionError> {
        for tiers_up in 0..max_tiers {
            let query = DirectoryQuery {
                approver_type: ApproverType::DirectManager,
                selector: None,
                subject: Some(subject.to_string()),
                context: EvaluationContext::default(),
                tiers_up,
            };
            let managers = self.directory.resolve(&query).await?;
            if managers.is_empty() {
                return Ok(false);
            }
            if managers.iter().any(|m| m == principal) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
