// Veritas Trust Engine: Policy Engine
// Evaluates a prioritized set of conditional security policies against the
// current risk context and produces an authorization decision plus required
// actions. Evaluation is a pure computation over already-gathered data; any
// internal failure yields the fail-safe result (challenge, low confidence),
// never fail-open allow and never an escaping error.

use std::time::Instant;

use chrono::{DateTime, Datelike, Timelike, Utc};
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::models::{ChallengeType, PolicyDecision, RiskLevel};
use crate::storage::TtlCache;
use crate::utils::metrics::record_policy_evaluation;

const DEFAULT_ALLOW_CONFIDENCE: f64 = 0.5;
const MATCHED_CONFIDENCE: f64 = 0.85;
const FAIL_SAFE_CONFIDENCE: f64 = 0.3;

///////////////////////////////////////////////////////////////////////////////
// Policy model
///////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    RiskScore,
    RiskLevel,
    Location,
    Device,
    Behavior,
    Time,
    Resource,
    UserAttribute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Ne,
    In,
    NotIn,
    Matches,
    Contains,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyCondition {
    pub condition_type: ConditionType,
    // Field within the selected context section; ignored for scalar sections
    // like risk score
    #[serde(default)]
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

// Time window in hours-of-day, with optional weekday restriction
// (0 = Monday .. 6 = Sunday)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    #[serde(default)]
    pub days: Vec<u32>,
}

impl TimeWindow {
    fn contains(&self, at: &DateTime<Utc>) -> bool {
        let hour = at.hour();
        let in_hours = if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // Window wraps midnight
            hour >= self.start_hour || hour < self.end_hour
        };
        let in_days = self.days.is_empty()
            || self.days.contains(&at.weekday().num_days_from_monday());
        in_hours && in_days
    }
}

// Empty scope vectors match everything
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyScope {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub time_windows: Vec<TimeWindow>,
}

// Static/administrative rule; read-only during evaluation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub description: String,
    // Higher wins when policies disagree on ordering-sensitive outputs
    pub priority: i32,
    pub enabled: bool,
    pub conditions: Vec<PolicyCondition>,
    pub decision: PolicyDecision,
    pub actions: Vec<String>,
    pub restrictions: Vec<String>,
    pub risk_adjustment: f64,
    pub challenge_type: Option<ChallengeType>,
    pub scope: PolicyScope,
}

///////////////////////////////////////////////////////////////////////////////
// Evaluation context and result
///////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Default)]
pub struct PolicyContext {
    pub user_id: String,
    pub session_id: String,
    pub roles: Vec<String>,
    pub resource: String,
    pub risk_score: f64,
    pub risk_level: Option<RiskLevel>,
    // Attribute sections consulted by condition types
    pub location: Value,
    pub device: Value,
    pub behavior: Value,
    pub user_attributes: Value,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyEvaluationResult {
    pub decision: PolicyDecision,
    pub applied_policies: Vec<String>,
    pub actions: Vec<String>,
    pub risk_adjustment: f64,
    pub restrictions: Vec<String>,
    pub challenge_type: Option<ChallengeType>,
    pub confidence: f64,
    pub evaluation_ms: f64,
    pub user_id: String,
    pub session_id: String,
    pub resource: String,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
enum EvaluationError {
    #[error("Condition on {0:?} compares incompatible types")]
    IncompatibleTypes(ConditionType),

    #[error("Condition value for {0:?} operator is not an array")]
    ExpectedArray(Operator),
}

///////////////////////////////////////////////////////////////////////////////
// Engine
///////////////////////////////////////////////////////////////////////////////

pub struct PolicyEngine {
    policies: RwLock<Vec<Policy>>,
    cache: TtlCache<PolicyEvaluationResult>,
    clock: SharedClock,
}

impl PolicyEngine {
    pub fn new(config: &EngineConfig, clock: SharedClock) -> Self {
        PolicyEngine {
            policies: RwLock::new(Vec::new()),
            cache: TtlCache::new(chrono::Duration::seconds(config.policy_cache_ttl_secs)),
            clock,
        }
    }

    /// Engine preloaded with the product's built-in policy set
    pub fn with_default_policies(config: &EngineConfig, clock: SharedClock) -> Self {
        let engine = Self::new(config, clock);
        for policy in default_policies() {
            engine.upsert_policy(policy);
        }
        engine
    }

    pub fn upsert_policy(&self, policy: Policy) {
        let mut policies = self.policies.write();
        policies.retain(|p| p.id != policy.id);
        policies.push(policy);
        policies.sort_by(|a, b| b.priority.cmp(&a.priority));
        drop(policies);
        self.cache.clear();
    }

    pub fn remove_policy(&self, policy_id: &str) -> bool {
        let mut policies = self.policies.write();
        let before = policies.len();
        policies.retain(|p| p.id != policy_id);
        let removed = policies.len() != before;
        drop(policies);
        if removed {
            self.cache.clear();
        }
        removed
    }

    pub fn set_enabled(&self, policy_id: &str, enabled: bool) -> bool {
        let mut policies = self.policies.write();
        let found = policies.iter_mut().find(|p| p.id == policy_id);
        let changed = match found {
            Some(policy) => {
                policy.enabled = enabled;
                true
            }
            None => false,
        };
        drop(policies);
        if changed {
            self.cache.clear();
        }
        changed
    }

    pub fn policies(&self) -> Vec<Policy> {
        self.policies.read().clone()
    }

    /// Evaluate the policy set against a context. Results are cached per
    /// (user, resource, coarse risk bucket) for the configured TTL.
    pub fn evaluate(&self, context: &PolicyContext) -> PolicyEvaluationResult {
        let now = self.clock.now();
        let key = cache_key(context);

        if let Some(cached) = self.cache.get(&key, now) {
            record_policy_evaluation(decision_name(cached.decision), true);
            return cached;
        }

        let started = Instant::now();
        let result = match self.evaluate_inner(context, now) {
            Ok(mut result) => {
                result.evaluation_ms = started.elapsed().as_secs_f64() * 1000.0;
                result
            }
            Err(e) => {
                warn!(
                    "policy evaluation failed, returning fail-safe: user={} resource={} reason={}",
                    context.user_id, context.resource, e
                );
                fail_safe_result(context, now, started.elapsed().as_secs_f64() * 1000.0)
            }
        };

        record_policy_evaluation(decision_name(result.decision), false);
        self.cache.put(&key, result.clone(), now);
        result
    }

    /// Background eviction pass over the evaluation cache
    pub fn sweep_cache(&self) -> usize {
        self.cache.sweep(self.clock.now())
    }

    fn evaluate_inner(
        &self,
        context: &PolicyContext,
        now: DateTime<Utc>,
    ) -> Result<PolicyEvaluationResult, EvaluationError> {
        let policies = self.policies.read();
        let at = context.timestamp.unwrap_or(now);

        // Policies are kept sorted by priority descending
        let mut matched: Vec<&Policy> = Vec::new();
        for policy in policies.iter() {
            if !policy.enabled || !scope_matches(&policy.scope, context, &at) {
                continue;
            }
            let mut all_conditions_hold = true;
            for condition in &policy.conditions {
                if !condition_holds(condition, context, &at)? {
                    all_conditions_hold = false;
                    break;
                }
            }
            if all_conditions_hold {
                matched.push(policy);
            }
        }

        if matched.is_empty() {
            return Ok(PolicyEvaluationResult {
                decision: PolicyDecision::Allow,
                applied_policies: Vec::new(),
                actions: Vec::new(),
                risk_adjustment: 0.0,
                restrictions: Vec::new(),
                challenge_type: None,
                confidence: DEFAULT_ALLOW_CONFIDENCE,
                evaluation_ms: 0.0,
                user_id: context.user_id.clone(),
                session_id: context.session_id.clone(),
                resource: context.resource.clone(),
                evaluated_at: now,
            });
        }

        // Most restrictive decision wins regardless of priority order
        let decision = matched
            .iter()
            .map(|p| p.decision)
            .max()
            .unwrap_or(PolicyDecision::Allow);

        let mut actions = Vec::new();
        let mut restrictions = Vec::new();
        let mut applied = Vec::new();
        let mut risk_adjustment = 0.0;
        let mut challenge_type = None;

        for policy in &matched {
            applied.push(policy.id.clone());
            for action in &policy.actions {
                if !actions.contains(action) {
                    actions.push(action.clone());
                }
            }
            for restriction in &policy.restrictions {
                if !restrictions.contains(restriction) {
                    restrictions.push(restriction.clone());
                }
            }
            risk_adjustment += policy.risk_adjustment;
            if challenge_type.is_none() {
                challenge_type = policy.challenge_type;
            }
        }

        debug!(
            "policy evaluation: user={} resource={} matched={:?} decision={:?}",
            context.user_id, context.resource, applied, decision
        );

        Ok(PolicyEvaluationResult {
            decision,
            applied_policies: applied,
            actions,
            risk_adjustment: risk_adjustment.clamp(-1.0, 1.0),
            restrictions,
            challenge_type,
            confidence: MATCHED_CONFIDENCE,
            evaluation_ms: 0.0,
            user_id: context.user_id.clone(),
            session_id: context.session_id.clone(),
            resource: context.resource.clone(),
            evaluated_at: now,
        })
    }
}

fn cache_key(context: &PolicyContext) -> String {
    // Coarse risk bucket so adjacent scores share an entry
    let bucket = RiskLevel::from_score(context.risk_score);
    format!("{}|{}|{}", context.user_id, context.resource, bucket.as_str())
}

fn decision_name(decision: PolicyDecision) -> &'static str {
    match decision {
        PolicyDecision::Allow => "allow",
        PolicyDecision::Challenge => "challenge",
        PolicyDecision::Restrict => "restrict",
        PolicyDecision::Deny => "deny",
    }
}

fn fail_safe_result(
    context: &PolicyContext,
    now: DateTime<Utc>,
    evaluation_ms: f64,
) -> PolicyEvaluationResult {
    PolicyEvaluationResult {
        decision: PolicyDecision::Challenge,
        applied_policies: Vec::new(),
        actions: vec!["require_step_up".to_string()],
        risk_adjustment: 0.0,
        restrictions: Vec::new(),
        challenge_type: Some(ChallengeType::Totp),
        confidence: FAIL_SAFE_CONFIDENCE,
        evaluation_ms,
        user_id: context.user_id.clone(),
        session_id: context.session_id.clone(),
        resource: context.resource.clone(),
        evaluated_at: now,
    }
}

///////////////////////////////////////////////////////////////////////////////
// Scope and condition matching
///////////////////////////////////////////////////////////////////////////////

fn scope_matches(scope: &PolicyScope, context: &PolicyContext, at: &DateTime<Utc>) -> bool {
    if !scope.users.is_empty() && !scope.users.contains(&context.user_id) {
        return false;
    }
    if !scope.roles.is_empty() && !scope.roles.iter().any(|r| context.roles.contains(r)) {
        return false;
    }
    if !scope.resources.is_empty()
        && !scope
            .resources
            .iter()
            .any(|pattern| wildcard_match(pattern, &context.resource))
    {
        return false;
    }
    if !scope.time_windows.is_empty() && !scope.time_windows.iter().any(|w| w.contains(at)) {
        return false;
    }
    true
}

fn condition_holds(
    condition: &PolicyCondition,
    context: &PolicyContext,
    at: &DateTime<Utc>,
) -> Result<bool, EvaluationError> {
    let observed: Value = match condition.condition_type {
        ConditionType::RiskScore => Value::from(context.risk_score),
        ConditionType::RiskLevel => match context.risk_level {
            Some(level) => Value::from(level.as_str()),
            None => Value::Null,
        },
        ConditionType::Location => lookup_field(&context.location, &condition.field),
        ConditionType::Device => lookup_field(&context.device, &condition.field),
        ConditionType::Behavior => lookup_field(&context.behavior, &condition.field),
        ConditionType::Time => match condition.field.as_str() {
            "weekday" => Value::from(at.weekday().num_days_from_monday()),
            _ => Value::from(at.hour()),
        },
        ConditionType::Resource => Value::from(context.resource.clone()),
        ConditionType::UserAttribute => lookup_field(&context.user_attributes, &condition.field),
    };

    // A missing attribute simply fails the condition; the policy does not apply
    if observed.is_null() {
        return Ok(false);
    }

    apply_operator(condition.condition_type, condition.operator, &observed, &condition.value)
}

fn lookup_field(section: &Value, field: &str) -> Value {
    section.get(field).cloned().unwrap_or(Value::Null)
}

fn apply_operator(
    condition_type: ConditionType,
    operator: Operator,
    observed: &Value,
    expected: &Value,
) -> Result<bool, EvaluationError> {
    match operator {
        Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
            let (a, b) = match (observed.as_f64(), expected.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(EvaluationError::IncompatibleTypes(condition_type)),
            };
            Ok(match operator {
                Operator::Gt => a > b,
                Operator::Lt => a < b,
                Operator::Gte => a >= b,
                Operator::Lte => a <= b,
                _ => unreachable!(),
            })
        }
        Operator::Eq => Ok(values_equal(observed, expected)),
        Operator::Ne => Ok(!values_equal(observed, expected)),
        Operator::In | Operator::NotIn => {
            let Some(candidates) = expected.as_array() else {
                return Err(EvaluationError::ExpectedArray(operator));
            };
            let found = candidates.iter().any(|c| values_equal(observed, c));
            Ok(if operator == Operator::In { found } else { !found })
        }
        Operator::Matches => {
            let (Some(observed), Some(pattern)) = (observed.as_str(), expected.as_str()) else {
                return Err(EvaluationError::IncompatibleTypes(condition_type));
            };
            Ok(wildcard_match(pattern, observed))
        }
        Operator::Contains => match (observed, expected) {
            (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle)),
            (Value::Array(items), needle) => Ok(items.iter().any(|i| values_equal(i, needle))),
            _ => Err(EvaluationError::IncompatibleTypes(condition_type)),
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        // Numeric comparison tolerates integer vs float representations
        (Some(a), Some(b)) => (a - b).abs() < 1e-9,
        _ => a == b,
    }
}

// Glob-style match supporting '*' wildcards
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == input;
    }

    let mut remainder = input;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match remainder.strip_prefix(part) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(pos) => remainder = &remainder[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

///////////////////////////////////////////////////////////////////////////////
// Built-in policies
///////////////////////////////////////////////////////////////////////////////

pub fn default_policies() -> Vec<Policy> {
    vec![
        Policy {
            id: "critical-risk-block".to_string(),
            name: "Block critical risk sessions".to_string(),
            description: "Terminate any session whose risk score is critical".to_string(),
            priority: 100,
            enabled: true,
            conditions: vec![PolicyCondition {
                condition_type: ConditionType::RiskScore,
                field: String::new(),
                operator: Operator::Gte,
                value: Value::from(0.85),
            }],
            decision: PolicyDecision::Deny,
            actions: vec!["terminate_session".to_string(), "alert_admin".to_string()],
            restrictions: Vec::new(),
            risk_adjustment: 0.0,
            challenge_type: None,
            scope: PolicyScope::default(),
        },
        Policy {
            id: "high-risk-restrict".to_string(),
            name: "Restrict high risk sessions".to_string(),
            description: "Degrade high-risk sessions to read-only access".to_string(),
            priority: 90,
            enabled: true,
            conditions: vec![PolicyCondition {
                condition_type: ConditionType::RiskScore,
                field: String::new(),
                operator: Operator::Gte,
                value: Value::from(0.7),
            }],
            decision: PolicyDecision::Restrict,
            actions: vec!["notify_user".to_string()],
            restrictions: vec!["read_only".to_string(), "no_export".to_string()],
            risk_adjustment: 0.1,
            challenge_type: None,
            scope: PolicyScope::default(),
        },
        Policy {
            id: "impossible-travel-challenge".to_string(),
            name: "Challenge impossible travel".to_string(),
            description: "Step up when the access point is far from known locations".to_string(),
            priority: 60,
            enabled: true,
            conditions: vec![PolicyCondition {
                condition_type: ConditionType::Location,
                field: "impossible_travel".to_string(),
                operator: Operator::Eq,
                value: Value::from(true),
            }],
            decision: PolicyDecision::Challenge,
            actions: vec!["require_totp".to_string()],
            restrictions: Vec::new(),
            risk_adjustment: 0.15,
            challenge_type: Some(ChallengeType::Totp),
            scope: PolicyScope::default(),
        },
        Policy {
            id: "vpn-challenge".to_string(),
            name: "Challenge VPN access".to_string(),
            description: "Require TOTP when access arrives through a VPN or proxy".to_string(),
            priority: 50,
            enabled: true,
            conditions: vec![PolicyCondition {
                condition_type: ConditionType::Location,
                field: "vpn_detected".to_string(),
                operator: Operator::Eq,
                value: Value::from(true),
            }],
            decision: PolicyDecision::Challenge,
            actions: vec!["require_totp".to_string()],
            restrictions: Vec::new(),
            risk_adjustment: 0.1,
            challenge_type: Some(ChallengeType::Totp),
            scope: PolicyScope::default(),
        },
        Policy {
            id: "off-hours-monitor".to_string(),
            name: "Monitor off-hours access".to_string(),
            description: "Increase logging for access outside business hours".to_string(),
            priority: 20,
            enabled: true,
            conditions: vec![PolicyCondition {
                condition_type: ConditionType::Time,
                field: "hour".to_string(),
                operator: Operator::NotIn,
                value: serde_json::json!([8, 9, 10, 11, 12, 13, 14, 15, 16, 17]),
            }],
            decision: PolicyDecision::Allow,
            actions: vec!["increase_monitoring".to_string()],
            restrictions: Vec::new(),
            risk_adjustment: 0.05,
            challenge_type: None,
            scope: PolicyScope::default(),
        },
    ]
}
