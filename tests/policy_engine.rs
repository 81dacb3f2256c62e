use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

use agentgate::policy::{BindContext, BoundPolicy};
use agentgate::{
    gate_error, DecisionKind, FileOperation, GateError, IntentTarget, InterceptedIntent,
    PolicyEngine, PolicySet, PolicyStore,
};

fn bind(policy: PolicySet, workspace: &str) -> Result<BoundPolicy> {
    let ctx = BindContext {
        home: "/home/agent".to_string(),
        project_root: workspace.to_string(),
        tmpdir: "/tmp".to_string(),
    };
    Arc::new(policy).bind(&ctx)
}

fn decide(bound: &BoundPolicy, target: IntentTarget) -> Result<(DecisionKind, Option<String>)> {
    let intent = InterceptedIntent::new("session-test", target);
    let decision = PolicyEngine::evaluate(&intent, bound)?;
    Ok((decision.kind, decision.rule))
}

#[test]
fn builtin_policy_covers_the_common_cases() -> Result<()> {
    let bound = bind(PolicySet::builtin()?, "/workspace")?;

    let cases = [
        (
            IntentTarget::exec("sudo", &["apt-get", "install", "x"]),
            DecisionKind::Deny,
            Some("block-container-escape"),
        ),
        (
            IntentTarget::exec("/usr/bin/git", &["status"]),
            DecisionKind::Allow,
            Some("dev-tools"),
        ),
        (
            IntentTarget::exec("rm", &["-rf", "target"]),
            DecisionKind::Approve,
            Some("approve-recursive-delete"),
        ),
        (
            IntentTarget::file("/workspace/data.txt", FileOperation::Delete),
            DecisionKind::SoftDelete,
            Some("workspace-soft-delete"),
        ),
        (
            IntentTarget::file("/workspace/src/main.rs", FileOperation::Write),
            DecisionKind::Allow,
            Some("workspace"),
        ),
        (
            IntentTarget::file("/home/agent/.ssh/id_rsa", FileOperation::Read),
            DecisionKind::Deny,
            Some("credentials"),
        ),
        (
            IntentTarget::file("/etc/shadow", FileOperation::Read),
            DecisionKind::Deny,
            None,
        ),
        (
            IntentTarget::connect("169.254.169.254", 80),
            DecisionKind::Deny,
            Some("block-cloud-metadata"),
        ),
        (
            IntentTarget::connect("metadata.google.internal.", 80),
            DecisionKind::Deny,
            Some("block-cloud-metadata"),
        ),
        (
            IntentTarget::connect("10.1.2.3", 5432),
            DecisionKind::Deny,
            Some("block-private-ranges"),
        ),
        (
            IntentTarget::connect("Static.Crates.IO", 443),
            DecisionKind::Allow,
            Some("package-registries"),
        ),
        (
            IntentTarget::connect("crates.io", 22),
            DecisionKind::Deny,
            None,
        ),
    ];
    for (target, kind, rule) in cases {
        let summary = target.summary();
        let (got_kind, got_rule) = decide(&bound, target)?;
        assert_eq!(got_kind, kind, "{}", summary);
        assert_eq!(got_rule.as_deref(), rule, "{}", summary);
    }
    Ok(())
}

#[test]
fn reordering_disjoint_rules_does_not_change_outcomes() -> Result<()> {
    let a = r#"
        [[command_rules]]
        name = "git"
        commands = ["git"]
        decision = "allow"

        [[command_rules]]
        name = "curl"
        commands = ["curl"]
        decision = "deny"

        [[network_rules]]
        name = "internal"
        cidrs = ["10.0.0.0/8"]
        decision = "deny"

        [[network_rules]]
        name = "github"
        domains = ["github.com"]
        decision = "allow"
    "#;
    let b = r#"
        [[command_rules]]
        name = "curl"
        commands = ["curl"]
        decision = "deny"

        [[command_rules]]
        name = "git"
        commands = ["git"]
        decision = "allow"

        [[network_rules]]
        name = "github"
        domains = ["github.com"]
        decision = "allow"

        [[network_rules]]
        name = "internal"
        cidrs = ["10.0.0.0/8"]
        decision = "deny"
    "#;
    let first = bind(PolicySet::parse("a", a)?, "/workspace")?;
    let second = bind(PolicySet::parse("b", b)?, "/workspace")?;
    let targets = [
        IntentTarget::exec("git", &["push"]),
        IntentTarget::exec("curl", &["https://example.com"]),
        IntentTarget::exec("wget", &[]),
        IntentTarget::connect("github.com", 443),
        IntentTarget::connect("10.0.0.8", 22),
        IntentTarget::connect("example.com", 443),
    ];
    for target in targets {
        assert_eq!(
            decide(&first, target.clone())?,
            decide(&second, target)?
        );
    }
    Ok(())
}

#[test]
fn invalid_documents_are_rejected_whole() {
    let cases = [
        // duplicate names within a domain
        "[[command_rules]]\nname = \"x\"\ncommands = [\"a\"]\ndecision = \"allow\"\n\
         [[command_rules]]\nname = \"x\"\ncommands = [\"b\"]\ndecision = \"deny\"\n",
        // soft_delete outside file rules
        "[[command_rules]]\nname = \"x\"\ncommands = [\"rm\"]\ndecision = \"soft_delete\"\n",
        // soft_delete on a non-destructive operation
        "[[file_rules]]\nname = \"x\"\npaths = [\"/w/**\"]\noperations = [\"read\"]\ndecision = \"soft_delete\"\n",
        // malformed CIDR
        "[[network_rules]]\nname = \"x\"\ncidrs = [\"10.0.0.0/33\"]\ndecision = \"deny\"\n",
        // unknown placeholder
        "[[file_rules]]\nname = \"x\"\npaths = [\"${NOPE}/**\"]\ndecision = \"allow\"\n",
        // unknown field
        "[[command_rules]]\nname = \"x\"\ncommands = [\"a\"]\ndecision = \"allow\"\ncolor = \"red\"\n",
    ];
    for source in cases {
        let err = PolicySet::parse("broken", source)
            .and_then(|policy| bind(policy, "/workspace"))
            .unwrap_err();
        assert!(
            matches!(gate_error(&err), Some(GateError::PolicyValidation { .. })),
            "{}: {:#}",
            source,
            err
        );
    }
}

fn write_policy(dir: &Path, name: &str, body: &str) -> Result<()> {
    std::fs::write(dir.join(format!("{name}.toml")), body)?;
    Ok(())
}

#[test]
fn policy_directory_reload_adds_and_keeps_sets() -> Result<()> {
    let dir = tempdir()?;
    write_policy(
        dir.path(),
        "readonly",
        "[[file_rules]]\nname = \"read\"\npaths = [\"${PROJECT_ROOT}/**\"]\noperations = [\"read\", \"stat\", \"list\"]\ndecision = \"allow\"\n",
    )?;
    write_policy(dir.path(), "broken", "[[command_rules]]\nname = \"\"\n")?;
    std::fs::write(dir.path().join("notes.txt"), "ignored")?;

    let (store, report) = PolicyStore::open(Some(dir.path()))?;
    assert_eq!(report.loaded, vec!["readonly".to_string()]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].name, "broken");
    assert_eq!(store.len(), 2);

    write_policy(
        dir.path(),
        "offline",
        "[defaults]\nnetwork = \"deny\"\n",
    )?;
    let report = store.reload()?;
    assert!(report.loaded.contains(&"offline".to_string()));
    let names: Vec<String> = store.list().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["default", "offline", "readonly"]);

    let readonly = store
        .require("readonly")?
        .bind(&BindContext::for_workspace(Path::new("/workspace")))?;
    let (kind, _) = decide(
        &readonly,
        IntentTarget::file("/workspace/a.txt", FileOperation::Write),
    )?;
    assert_eq!(kind, DecisionKind::Deny);
    Ok(())
}

#[test]
fn workspace_names_with_glob_characters_match_literally() -> Result<()> {
    let bracketed = bind(PolicySet::builtin()?, "/tmp/proj[1]")?;
    assert_eq!(
        decide(
            &bracketed,
            IntentTarget::file("/tmp/proj[1]/a.txt", FileOperation::Write)
        )?,
        (DecisionKind::Allow, Some("workspace".to_string()))
    );
    // Only the scratch rule covers the sibling directory.
    assert_eq!(
        decide(
            &bracketed,
            IntentTarget::file("/tmp/proj1/a.txt", FileOperation::Write)
        )?,
        (DecisionKind::Allow, Some("scratch".to_string()))
    );

    let starred = bind(PolicySet::builtin()?, "/tmp/w*")?;
    assert_eq!(
        decide(&starred, IntentTarget::file("/tmp/w*/x", FileOperation::Write))?.1,
        Some("workspace".to_string())
    );
    assert_eq!(
        decide(&starred, IntentTarget::file("/tmp/wother/x", FileOperation::Delete))?,
        (DecisionKind::Allow, Some("scratch".to_string()))
    );

    let unbalanced = bind(PolicySet::builtin()?, "/tmp/p[")?;
    assert_eq!(
        decide(&unbalanced, IntentTarget::file("/tmp/p[/f", FileOperation::Write))?.1,
        Some("workspace".to_string())
    );
    Ok(())
}
