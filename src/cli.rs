//! agentgate - operator CLI
//!
//! Offline tooling that works without a running daemon: probe the host,
//! check and dry-run policies, verify and read the audit log.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audit::{AuditLogger, EventQuery};
use crate::capability::{Capability, CapabilityDetector, CapabilityMatrix, CapabilityState};
use crate::intent::{FileOperation, IntentTarget, InterceptedIntent};
use crate::policy::{BindContext, PolicyEngine, PolicySet, PolicyStore};

#[derive(Parser, Debug)]
#[command(name = "agentgate", version, about = "Inspect hosts, policies and audit logs")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe interception capabilities on this host
    Detect {
        /// Print the capability matrix as JSON
        #[arg(long)]
        json: bool,
        #[command(subcommand)]
        action: Option<DetectAction>,
    },

    /// Validate or dry-run policy documents
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Verify or read the audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand, Debug)]
enum DetectAction {
    /// Print a daemon config suited to the detected capabilities
    Config,
}

#[derive(Subcommand, Debug)]
enum PolicyAction {
    /// Parse and validate a policy file
    Check { file: PathBuf },

    /// Evaluate one intent against a policy without enforcing it
    Eval {
        /// Policy name, looked up in --policy-dir or the built-ins
        #[arg(long, conflicts_with = "file")]
        policy: Option<String>,
        /// Policy file to evaluate instead of a named policy
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, env = "AGENTGATE_POLICY_DIR")]
        policy_dir: Option<PathBuf>,
        /// Workspace used for ${PROJECT_ROOT}
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        #[command(subcommand)]
        intent: IntentArg,
    },
}

#[derive(Subcommand, Debug)]
enum IntentArg {
    /// Command execution
    Exec {
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Filesystem operation
    File { path: String, operation: String },
    /// Outbound connection
    Connect { host: String, port: u16 },
}

#[derive(Subcommand, Debug)]
enum AuditAction {
    /// Recompute the hash chain over every event
    Verify {
        #[arg(long, default_value = "agentgate.db", env = "AGENTGATE_DB_PATH")]
        db: String,
    },
    /// Print events, optionally for one session
    List {
        #[arg(long, default_value = "agentgate.db", env = "AGENTGATE_DB_PATH")]
        db: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    match args.command {
        Command::Detect { json, action } => cmd_detect(json, action),
        Command::Policy { action } => match action {
            PolicyAction::Check { file } => cmd_policy_check(&file),
            PolicyAction::Eval {
                policy,
                file,
                policy_dir,
                workspace,
                intent,
            } => cmd_policy_eval(
                policy.as_deref(),
                file.as_deref(),
                policy_dir.as_deref(),
                &workspace,
                intent,
            ),
        },
        Command::Audit { action } => match action {
            AuditAction::Verify { db } => cmd_audit_verify(&db),
            AuditAction::List {
                db,
                session,
                limit,
                json,
            } => cmd_audit_list(&db, session, limit, json),
        },
    }
}

fn cmd_detect(json: bool, action: Option<DetectAction>) -> Result<()> {
    let matrix = CapabilityDetector::new(crate::capability::DEFAULT_PROBE_TIMEOUT).detect();
    if let Some(DetectAction::Config) = action {
        print!("{}", suggest_config(&matrix));
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&matrix)?);
        return Ok(());
    }
    println!("=== Interception Capabilities ===");
    for (capability, status) in &matrix.entries {
        println!(
            "{:<16} {:<28} {}",
            capability,
            status.state.as_str(),
            status.detail
        );
    }
    let degraded = matrix.degraded_flags();
    if degraded.any() {
        println!();
        println!("Shims without a working primitive will evaluate but not enforce.");
    }
    Ok(())
}

/// Renders a daemon config for a host with the given capabilities.
pub fn suggest_config(matrix: &CapabilityMatrix) -> String {
    let mut out = String::new();
    out.push_str("# agentgate daemon config\n");
    for capability in Capability::ALL {
        let state = matrix.state(capability);
        if state != CapabilityState::Supported {
            let _ = writeln!(
                out,
                "# {} is {}: its shim runs advisory only",
                capability,
                state.as_str()
            );
        }
    }
    out.push_str("db_path = \"/var/lib/agentgate/audit.db\"\n\n");
    out.push_str("[api]\n");
    out.push_str("addr = \"127.0.0.1:18080\"\n");
    out.push_str("token_path = \"/run/agentgate/api.token\"\n\n");
    out.push_str("[policies]\n");
    out.push_str("dir = \"/etc/agentgate/policies\"\n");
    out.push_str("default = \"default\"\n\n");
    out.push_str("[approvals]\n");
    out.push_str("timeout_secs = 60\n");
    out.push_str("on_timeout = \"deny\"\n\n");
    out.push_str("[sessions]\n");
    out.push_str("quarantine_dir = \"/var/lib/agentgate/quarantine\"\n");
    if !matrix.is_supported(Capability::CommandNotify) {
        // Without exec interception the quota is the remaining brake.
        out.push_str("max_intents_per_session = 1000\n");
    }
    out
}

fn cmd_policy_check(file: &Path) -> Result<()> {
    let policy = PolicySet::load_file(file)?;
    let summary = policy.summary();
    println!("policy {} ok", summary.name);
    println!("  digest:        {}", summary.digest);
    println!("  command rules: {}", summary.command_rules);
    println!("  file rules:    {}", summary.file_rules);
    println!("  network rules: {}", summary.network_rules);
    Ok(())
}

fn cmd_policy_eval(
    policy: Option<&str>,
    file: Option<&Path>,
    policy_dir: Option<&Path>,
    workspace: &Path,
    intent: IntentArg,
) -> Result<()> {
    let set = match file {
        Some(file) => Arc::new(PolicySet::load_file(file)?),
        None => {
            let (store, report) = PolicyStore::open(policy_dir)?;
            for rejected in &report.rejected {
                log::warn!("skipping policy {}: {}", rejected.name, rejected.error);
            }
            store.require(policy.unwrap_or(crate::policy::BUILTIN_POLICY_NAME))?
        }
    };
    let workspace = std::fs::canonicalize(workspace)
        .map_err(|e| anyhow!("workspace {}: {}", workspace.display(), e))?;
    let bound = set.bind(&BindContext::for_workspace(&workspace))?;

    let target = match intent {
        IntentArg::Exec { program, args } => IntentTarget::Exec { program, args },
        IntentArg::File { path, operation } => {
            let op = FileOperation::parse(&operation)
                .ok_or_else(|| anyhow!("unknown file operation {}", operation))?;
            let path = if Path::new(&path).is_relative() {
                workspace.join(&path).to_string_lossy().into_owned()
            } else {
                path
            };
            IntentTarget::FileOp {
                path,
                operation: op,
            }
        }
        IntentArg::Connect { host, port } => IntentTarget::NetConnect { host, port },
    };
    let intent = InterceptedIntent::new("cli", target);
    let decision = PolicyEngine::evaluate(&intent, &bound)?;
    println!("intent:   {}", intent.target.summary());
    println!("policy:   {}", set.name);
    println!("decision: {}", decision.kind.as_str());
    println!("rule:     {}", decision.rule.as_deref().unwrap_or("-"));
    println!("reason:   {}", decision.reason);
    Ok(())
}

fn cmd_audit_verify(db: &str) -> Result<()> {
    let logger = AuditLogger::open_sqlite(db)?;
    let report = logger.verify_chain()?;
    println!("audit chain ok: {} events, head {}", report.events, report.head);
    Ok(())
}

fn cmd_audit_list(
    db: &str,
    session: Option<String>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let logger = AuditLogger::open_sqlite(db)?;
    let events = logger.events(&EventQuery {
        session_id: session,
        after_seq: None,
        limit,
    })?;
    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }
    for event in events {
        println!(
            "{:>6} {} {:<24} {:<18} {}",
            event.seq,
            event.record.timestamp_ms,
            event.record.session_id,
            event.record.outcome.as_str(),
            event.summary
        );
    }
    Ok(())
}
