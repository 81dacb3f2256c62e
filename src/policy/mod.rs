//! Declarative policy sets.
//!
//! A policy document is TOML with three ordered rule lists (command, file,
//! network) and optional per-domain defaults. Rules are evaluated in
//! declaration order and the first match decides. Loading is all-or-nothing:
//! one invalid rule rejects the whole document, naming the rule.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::error::GateError;
use crate::intent::FileOperation;

pub mod engine;
pub mod matcher;
pub mod store;

pub use engine::{BoundPolicy, PolicyEngine};
pub use matcher::{BindContext, Cidr, DomainPattern, PathTemplate};
pub use store::PolicyStore;

/// Name of the policy compiled into the binary.
pub const BUILTIN_POLICY_NAME: &str = "default";
const BUILTIN_POLICY: &str = include_str!("../../policies/default.toml");

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Allow,
    Deny,
    Approve,
    SoftDelete,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Allow => "allow",
            DecisionKind::Deny => "deny",
            DecisionKind::Approve => "approve",
            DecisionKind::SoftDelete => "soft_delete",
        }
    }
}

/// Outcome of evaluating one intent against a bound policy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decision {
    pub kind: DecisionKind,
    /// Name of the matching rule; `None` when the domain default applied.
    pub rule: Option<String>,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleDomain {
    Command,
    File,
    Network,
}

impl RuleDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleDomain::Command => "command",
            RuleDomain::File => "file",
            RuleDomain::Network => "network",
        }
    }
}

// -------------------- Document format --------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    description: Option<String>,
    #[serde(default)]
    defaults: DefaultsDocument,
    #[serde(default)]
    command_rules: Vec<CommandRuleDocument>,
    #[serde(default)]
    file_rules: Vec<FileRuleDocument>,
    #[serde(default)]
    network_rules: Vec<NetworkRuleDocument>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsDocument {
    command: Option<DecisionKind>,
    file: Option<DecisionKind>,
    network: Option<DecisionKind>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandRuleDocument {
    name: String,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    operations: Option<Vec<String>>,
    decision: DecisionKind,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRuleDocument {
    name: String,
    #[serde(default)]
    paths: Vec<String>,
    operations: Option<Vec<String>>,
    decision: DecisionKind,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NetworkRuleDocument {
    name: String,
    #[serde(default)]
    cidrs: Vec<String>,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    ports: Vec<u16>,
    operations: Option<Vec<String>>,
    decision: DecisionKind,
    message: Option<String>,
}

// -------------------- Validated rules --------------------

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct Defaults {
    pub command: DecisionKind,
    pub file: DecisionKind,
    pub network: DecisionKind,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            command: DecisionKind::Deny,
            file: DecisionKind::Deny,
            network: DecisionKind::Deny,
        }
    }
}

impl Defaults {
    pub fn for_domain(&self, domain: RuleDomain) -> DecisionKind {
        match domain {
            RuleDomain::Command => self.command,
            RuleDomain::File => self.file,
            RuleDomain::Network => self.network,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CommandRule {
    pub name: String,
    /// Executable names or absolute paths; `*` matches any program.
    pub commands: Vec<String>,
    /// Globs over the space-joined arguments; empty means any arguments.
    pub args: Vec<glob::Pattern>,
    pub decision: DecisionKind,
    pub message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct FileRule {
    pub name: String,
    pub paths: Vec<PathTemplate>,
    pub operations: Option<Vec<FileOperation>>,
    pub decision: DecisionKind,
    pub message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NetworkRule {
    pub name: String,
    pub cidrs: Vec<Cidr>,
    pub domains: Vec<DomainPattern>,
    pub ports: Vec<u16>,
    pub decision: DecisionKind,
    pub message: Option<String>,
}

/// A validated, immutable policy set.
#[derive(Clone, Debug)]
pub struct PolicySet {
    pub name: String,
    pub description: Option<String>,
    /// SHA-256 of the source document, hex encoded.
    pub digest: String,
    pub defaults: Defaults,
    pub command_rules: Vec<CommandRule>,
    pub file_rules: Vec<FileRule>,
    pub network_rules: Vec<NetworkRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicySummary {
    pub name: String,
    pub description: Option<String>,
    pub digest: String,
    pub command_rules: usize,
    pub file_rules: usize,
    pub network_rules: usize,
}

impl PolicySet {
    pub fn parse(name: &str, source: &str) -> Result<Self> {
        let doc: PolicyDocument = toml::from_str(source)
            .map_err(|e| GateError::validation(name, None, format!("invalid document: {}", e)))?;
        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        build_policy(name, doc, digest).map_err(anyhow::Error::new)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| anyhow!("policy file has no usable name: {}", path.display()))?;
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy {}", path.display()))?;
        Self::parse(name, &source)
    }

    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_POLICY_NAME, BUILTIN_POLICY)
    }

    pub fn summary(&self) -> PolicySummary {
        PolicySummary {
            name: self.name.clone(),
            description: self.description.clone(),
            digest: self.digest.clone(),
            command_rules: self.command_rules.len(),
            file_rules: self.file_rules.len(),
            network_rules: self.network_rules.len(),
        }
    }

    /// Resolves path placeholders for one session.
    pub fn bind(self: &Arc<Self>, ctx: &BindContext) -> Result<BoundPolicy> {
        BoundPolicy::bind(Arc::clone(self), ctx)
    }
}

fn build_policy(
    name: &str,
    doc: PolicyDocument,
    digest: String,
) -> std::result::Result<PolicySet, GateError> {
    let defaults = Defaults {
        command: doc.defaults.command.unwrap_or(DecisionKind::Deny),
        file: doc.defaults.file.unwrap_or(DecisionKind::Deny),
        network: doc.defaults.network.unwrap_or(DecisionKind::Deny),
    };
    if defaults.command == DecisionKind::SoftDelete || defaults.network == DecisionKind::SoftDelete
    {
        return Err(GateError::validation(
            name,
            None,
            "soft_delete cannot be a command or network default",
        ));
    }
    if defaults.file == DecisionKind::SoftDelete {
        return Err(GateError::validation(
            name,
            None,
            "soft_delete default would apply to non-destructive operations",
        ));
    }

    let mut seen = HashSet::new();
    let mut command_rules = Vec::with_capacity(doc.command_rules.len());
    for rule in doc.command_rules {
        check_name(name, RuleDomain::Command, &rule.name, &mut seen)?;
        let invalid = |message: String| GateError::validation(name, Some(&rule.name), message);
        if rule.operations.is_some() {
            return Err(invalid(
                "operations filter only applies to file rules".to_string(),
            ));
        }
        if rule.decision == DecisionKind::SoftDelete {
            return Err(invalid("soft_delete only applies to file rules".to_string()));
        }
        let commands: Vec<String> = rule
            .commands
            .iter()
            .map(|command| command.trim().to_string())
            .collect();
        if commands.is_empty() || commands.iter().any(String::is_empty) {
            return Err(invalid("commands must list at least one name".to_string()));
        }
        let mut args = Vec::with_capacity(rule.args.len());
        for pattern in &rule.args {
            args.push(
                glob::Pattern::new(pattern)
                    .map_err(|e| invalid(format!("invalid args pattern {}: {}", pattern, e)))?,
            );
        }
        command_rules.push(CommandRule {
            name: rule.name.clone(),
            commands,
            args,
            decision: rule.decision,
            message: rule.message.clone(),
        });
    }

    seen.clear();
    let mut file_rules = Vec::with_capacity(doc.file_rules.len());
    for rule in doc.file_rules {
        check_name(name, RuleDomain::File, &rule.name, &mut seen)?;
        let invalid = |message: String| GateError::validation(name, Some(&rule.name), message);
        if rule.paths.is_empty() {
            return Err(invalid("paths must list at least one pattern".to_string()));
        }
        let mut paths = Vec::with_capacity(rule.paths.len());
        for raw in &rule.paths {
            paths.push(PathTemplate::parse(raw).map_err(|e| invalid(format!("{:#}", e)))?);
        }
        let mut operations = match &rule.operations {
            Some(raw_ops) => {
                if raw_ops.is_empty() {
                    return Err(invalid("operations filter is empty".to_string()));
                }
                let mut ops = Vec::with_capacity(raw_ops.len());
                for raw in raw_ops {
                    let op = FileOperation::parse(raw.trim())
                        .ok_or_else(|| invalid(format!("unknown operation {}", raw)))?;
                    ops.push(op);
                }
                Some(ops)
            }
            None => None,
        };
        if rule.decision == DecisionKind::SoftDelete {
            let non_destructive = operations
                .as_ref()
                .map(|ops| ops.iter().any(|op| !op.is_destructive()));
            match non_destructive {
                Some(true) => {
                    return Err(invalid(
                        "soft_delete only applies to delete and rmdir operations".to_string(),
                    ));
                }
                Some(false) => {}
                None => operations = Some(vec![FileOperation::Delete, FileOperation::Rmdir]),
            }
        }
        file_rules.push(FileRule {
            name: rule.name.clone(),
            paths,
            operations,
            decision: rule.decision,
            message: rule.message.clone(),
        });
    }

    seen.clear();
    let mut network_rules = Vec::with_capacity(doc.network_rules.len());
    for rule in doc.network_rules {
        check_name(name, RuleDomain::Network, &rule.name, &mut seen)?;
        let invalid = |message: String| GateError::validation(name, Some(&rule.name), message);
        if rule.operations.is_some() {
            return Err(invalid(
                "operations filter only applies to file rules".to_string(),
            ));
        }
        if rule.decision == DecisionKind::SoftDelete {
            return Err(invalid("soft_delete only applies to file rules".to_string()));
        }
        if rule.cidrs.is_empty() && rule.domains.is_empty() {
            return Err(invalid("rule needs at least one cidr or domain".to_string()));
        }
        if rule.ports.contains(&0) {
            return Err(invalid("port 0 is not a valid destination".to_string()));
        }
        let mut cidrs = Vec::with_capacity(rule.cidrs.len());
        for raw in &rule.cidrs {
            cidrs.push(Cidr::parse(raw).map_err(|e| invalid(format!("{:#}", e)))?);
        }
        let mut domains = Vec::with_capacity(rule.domains.len());
        for raw in &rule.domains {
            domains.push(DomainPattern::parse(raw).map_err(|e| invalid(format!("{:#}", e)))?);
        }
        network_rules.push(NetworkRule {
            name: rule.name.clone(),
            cidrs,
            domains,
            ports: rule.ports.clone(),
            decision: rule.decision,
            message: rule.message.clone(),
        });
    }

    Ok(PolicySet {
        name: name.to_string(),
        description: doc.description,
        digest,
        defaults,
        command_rules,
        file_rules,
        network_rules,
    })
}

fn check_name(
    policy: &str,
    domain: RuleDomain,
    rule: &str,
    seen: &mut HashSet<String>,
) -> std::result::Result<(), GateError> {
    if rule.trim().is_empty() {
        return Err(GateError::validation(
            policy,
            None,
            format!("{} rule without a name", domain.as_str()),
        ));
    }
    if !seen.insert(rule.to_string()) {
        return Err(GateError::validation(
            policy,
            Some(rule),
            format!("duplicate {} rule name", domain.as_str()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::gate_error;

    fn rule_of(err: &anyhow::Error) -> Option<String> {
        match gate_error(err) {
            Some(GateError::PolicyValidation { rule, .. }) => rule.clone(),
            _ => None,
        }
    }

    #[test]
    fn builtin_policy_is_valid() {
        let policy = PolicySet::builtin().expect("builtin policy");
        assert_eq!(policy.name, "default");
        assert!(policy
            .command_rules
            .iter()
            .any(|rule| rule.name == "block-container-escape"));
        assert_eq!(policy.digest.len(), 64);
    }

    #[test]
    fn missing_defaults_are_deny() {
        let policy = PolicySet::parse("empty", "").expect("empty policy");
        assert_eq!(policy.defaults, Defaults::default());
    }

    #[test]
    fn duplicate_rule_names_reject_the_document() {
        let source = r#"
            [[command_rules]]
            name = "git"
            commands = ["git"]
            decision = "allow"

            [[command_rules]]
            name = "git"
            commands = ["git"]
            decision = "deny"
        "#;
        let err = PolicySet::parse("dup", source).unwrap_err();
        assert_eq!(rule_of(&err).as_deref(), Some("git"));
    }

    #[test]
    fn same_name_in_different_domains_is_allowed() {
        let source = r#"
            [[command_rules]]
            name = "workspace"
            commands = ["ls"]
            decision = "allow"

            [[file_rules]]
            name = "workspace"
            paths = ["${PROJECT_ROOT}/**"]
            decision = "allow"
        "#;
        assert!(PolicySet::parse("mixed", source).is_ok());
    }

    #[test]
    fn invalid_rule_is_named_in_the_error() {
        let source = r#"
            [[network_rules]]
            name = "ok"
            domains = ["github.com"]
            decision = "allow"

            [[network_rules]]
            name = "broken-cidr"
            cidrs = ["10.0.0.0/40"]
            decision = "deny"
        "#;
        let err = PolicySet::parse("net", source).unwrap_err();
        assert_eq!(rule_of(&err).as_deref(), Some("broken-cidr"));
        assert!(err.to_string().contains("broken-cidr"));
    }

    #[test]
    fn soft_delete_is_limited_to_destructive_file_operations() {
        let on_write = r#"
            [[file_rules]]
            name = "archive-writes"
            paths = ["/data/**"]
            operations = ["write"]
            decision = "soft_delete"
        "#;
        assert_eq!(
            rule_of(&PolicySet::parse("p", on_write).unwrap_err()).as_deref(),
            Some("archive-writes")
        );

        let on_command = r#"
            [[command_rules]]
            name = "rm"
            commands = ["rm"]
            decision = "soft_delete"
        "#;
        assert!(PolicySet::parse("p", on_command).is_err());

        let implicit = r#"
            [[file_rules]]
            name = "trash"
            paths = ["/data/**"]
            decision = "soft_delete"
        "#;
        let policy = PolicySet::parse("p", implicit).unwrap();
        assert_eq!(
            policy.file_rules[0].operations,
            Some(vec![FileOperation::Delete, FileOperation::Rmdir])
        );
    }

    #[test]
    fn operations_filter_is_file_only() {
        let source = r#"
            [[command_rules]]
            name = "git"
            commands = ["git"]
            operations = ["exec"]
            decision = "allow"
        "#;
        assert_eq!(
            rule_of(&PolicySet::parse("p", source).unwrap_err()).as_deref(),
            Some("git")
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let source = r#"
            [[file_rules]]
            name = "typo"
            path = ["/data/**"]
            decision = "allow"
        "#;
        assert!(PolicySet::parse("p", source).is_err());
    }
}
