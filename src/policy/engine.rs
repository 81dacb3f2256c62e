use anyhow::{anyhow, Result};
use glob::Pattern;
use std::sync::Arc;

use super::matcher::{host_addr, normalize_path, path_matches, BindContext};
use super::{Decision, DecisionKind, NetworkRule, PolicySet, RuleDomain};
use crate::error::GateError;
use crate::intent::{FileOperation, InterceptedIntent, IntentTarget};

/// A policy set with its path placeholders resolved for one session.
#[derive(Clone, Debug)]
pub struct BoundPolicy {
    policy: Arc<PolicySet>,
    /// Compiled patterns, one entry per file rule in declaration order.
    file_patterns: Vec<Vec<Pattern>>,
}

impl BoundPolicy {
    pub fn bind(policy: Arc<PolicySet>, ctx: &BindContext) -> Result<Self> {
        let mut file_patterns = Vec::with_capacity(policy.file_rules.len());
        for rule in &policy.file_rules {
            let mut compiled = Vec::new();
            for template in &rule.paths {
                let patterns = template.bind(ctx).map_err(|e| {
                    GateError::validation(&policy.name, Some(&rule.name), format!("{:#}", e))
                })?;
                compiled.extend(patterns);
            }
            file_patterns.push(compiled);
        }
        Ok(Self {
            policy,
            file_patterns,
        })
    }

    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }
}

/// Stateless first-match evaluator.
pub struct PolicyEngine;

impl PolicyEngine {
    /// Scans the intent's domain in declaration order; the first matching
    /// rule decides, otherwise the domain default applies.
    pub fn evaluate(intent: &InterceptedIntent, bound: &BoundPolicy) -> Result<Decision> {
        let policy = bound.policy();
        match &intent.target {
            IntentTarget::Exec { program, args } => {
                let program = program.trim();
                if program.is_empty() {
                    return Err(evaluation("exec intent without a program"));
                }
                let joined = args.join(" ");
                for rule in &policy.command_rules {
                    if !rule.commands.iter().any(|c| command_matches(c, program)) {
                        continue;
                    }
                    if !rule.args.is_empty() && !rule.args.iter().any(|p| p.matches(&joined)) {
                        continue;
                    }
                    return Ok(rule_decision(rule.decision, &rule.name, &rule.message));
                }
                Ok(default_decision(policy, RuleDomain::Command))
            }
            IntentTarget::FileOp { path, operation } => {
                let path = normalize_path(path)
                    .map_err(|e| evaluation(&format!("file intent rejected: {:#}", e)))?;
                for (rule, patterns) in policy.file_rules.iter().zip(&bound.file_patterns) {
                    if let Some(ops) = &rule.operations {
                        if !ops.contains(operation) {
                            continue;
                        }
                    }
                    if !path_matches(patterns, &path) {
                        continue;
                    }
                    let decision = rule.decision;
                    if decision == DecisionKind::SoftDelete && !operation.is_destructive() {
                        return Err(evaluation(&format!(
                            "soft_delete rule {} matched non-destructive {}",
                            rule.name,
                            operation.as_str()
                        )));
                    }
                    return Ok(rule_decision(decision, &rule.name, &rule.message));
                }
                Ok(default_decision(policy, RuleDomain::File))
            }
            IntentTarget::NetConnect { host, port } => {
                let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
                if host.is_empty() {
                    return Err(evaluation("connect intent without a destination"));
                }
                if *port == 0 {
                    return Err(evaluation("connect intent to port 0"));
                }
                for rule in &policy.network_rules {
                    if network_matches(rule, &host, *port) {
                        return Ok(rule_decision(rule.decision, &rule.name, &rule.message));
                    }
                }
                Ok(default_decision(policy, RuleDomain::Network))
            }
        }
    }

    /// Convenience for callers holding a bare file operation.
    pub fn evaluate_file(
        session_id: &str,
        path: &str,
        operation: FileOperation,
        bound: &BoundPolicy,
    ) -> Result<Decision> {
        let intent = InterceptedIntent::new(session_id, IntentTarget::file(path, operation));
        Self::evaluate(&intent, bound)
    }
}

fn evaluation(message: &str) -> anyhow::Error {
    anyhow!(GateError::Evaluation(message.to_string()))
}

/// Entries containing `/` match the full program path; bare names match
/// the basename.
fn command_matches(entry: &str, program: &str) -> bool {
    if entry == "*" {
        return true;
    }
    if entry.contains('/') {
        return entry == program;
    }
    let base = program.rsplit('/').next().unwrap_or(program);
    entry == base
}

fn network_matches(rule: &NetworkRule, host: &str, port: u16) -> bool {
    if !rule.ports.is_empty() && !rule.ports.contains(&port) {
        return false;
    }
    match host_addr(host) {
        Some(addr) => rule.cidrs.iter().any(|cidr| cidr.contains(addr)),
        None => rule.domains.iter().any(|domain| domain.matches(host)),
    }
}

fn rule_decision(kind: DecisionKind, rule: &str, message: &Option<String>) -> Decision {
    let reason = match (kind, message) {
        (_, Some(message)) => message.clone(),
        (DecisionKind::Allow, None) => format!("allowed by rule {}", rule),
        (DecisionKind::Deny, None) => format!("blocked by rule {}", rule),
        (DecisionKind::Approve, None) => format!("rule {} requires approval", rule),
        (DecisionKind::SoftDelete, None) => format!("rule {} archives instead of deleting", rule),
    };
    Decision {
        kind,
        rule: Some(rule.to_string()),
        reason,
    }
}

fn default_decision(policy: &PolicySet, domain: RuleDomain) -> Decision {
    let kind = policy.defaults.for_domain(domain);
    Decision {
        kind,
        rule: None,
        reason: format!(
            "no {} rule matched; policy {} default is {}",
            domain.as_str(),
            policy.name,
            kind.as_str()
        ),
    }
}
