use anyhow::{anyhow, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Applied, Quarantine, Registrations, Shim, ShimContext};
use crate::capability::{Capability, CapabilityRegistry};
use crate::intent::{InterceptedIntent, IntentKind, IntentTarget};
use crate::policy::matcher::normalize_path;
use crate::policy::{Decision, DecisionKind};
use crate::session::Session;

/// File-operation interception through an interposed FUSE layer.
///
/// Relative paths are resolved against the session workspace. Policy sees
/// the path with every directory symlink followed; the final component is
/// left as written so a link itself can be deleted. A path addressed inside
/// the workspace that resolves outside it is denied. `soft_delete`
/// decisions move the target into the session's quarantine; every other
/// decision leaves the filesystem untouched.
pub struct FilesystemShim {
    ctx: ShimContext,
    capabilities: Arc<CapabilityRegistry>,
    registrations: Registrations,
    quarantine: Arc<Quarantine>,
}

impl FilesystemShim {
    pub fn new(
        ctx: ShimContext,
        capabilities: Arc<CapabilityRegistry>,
        quarantine: Arc<Quarantine>,
    ) -> Self {
        Self {
            ctx,
            capabilities,
            registrations: Registrations::default(),
            quarantine,
        }
    }
}

/// Where a file intent lands once directory symlinks are followed.
struct ResolvedPath {
    path: PathBuf,
    /// Addressed inside the workspace but resolves outside it.
    escapes: bool,
}

fn resolve_in(workspace: &Path, path: &str) -> Result<ResolvedPath> {
    let lexical = PathBuf::from(normalize_path(path)?);
    let resolved = resolve_parent(&lexical);
    Ok(ResolvedPath {
        escapes: lexical.starts_with(workspace) && !resolved.starts_with(workspace),
        path: resolved,
    })
}

/// Canonicalizes the deepest existing ancestor of the parent directory and
/// appends the remaining components unchanged.
fn resolve_parent(lexical: &Path) -> PathBuf {
    let Some(name) = lexical.file_name() else {
        return lexical.to_path_buf();
    };
    let mut existing = lexical.parent().unwrap_or(Path::new("/")).to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        if let Ok(mut real) = fs::canonicalize(&existing) {
            for part in missing.iter().rev() {
                real.push(part);
            }
            real.push(name);
            return real;
        }
        match existing.file_name() {
            Some(part) => {
                missing.push(part.to_os_string());
                existing.pop();
            }
            None => return lexical.to_path_buf(),
        }
    }
}

impl Shim for FilesystemShim {
    fn kind(&self) -> IntentKind {
        IntentKind::FileOp
    }

    fn capability(&self) -> Capability {
        Capability::FsIntercept
    }

    fn context(&self) -> &ShimContext {
        &self.ctx
    }

    fn registrations(&self) -> &Registrations {
        &self.registrations
    }

    fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    fn intercept(&self, session: &Session, target: IntentTarget) -> Result<InterceptedIntent> {
        let target = match target {
            IntentTarget::FileOp { path, operation } if !Path::new(&path).is_absolute() => {
                IntentTarget::FileOp {
                    path: session.workspace.join(&path).to_string_lossy().to_string(),
                    operation,
                }
            }
            IntentTarget::FileOp { .. } => target,
            other => {
                return Err(anyhow!(
                    "file shim cannot intercept {} intents",
                    other.kind().as_str()
                ))
            }
        };
        Ok(InterceptedIntent::new(&session.id, target))
    }

    fn query_policy(&self, session: &Session, intent: &InterceptedIntent) -> Result<Decision> {
        let IntentTarget::FileOp { path, operation } = &intent.target else {
            return session.evaluate(intent);
        };
        let Ok(resolved) = resolve_in(&session.workspace, path) else {
            return session.evaluate(intent);
        };
        if resolved.escapes {
            return Ok(Decision {
                kind: DecisionKind::Deny,
                rule: None,
                reason: format!(
                    "{} resolves to {} outside the workspace",
                    path,
                    resolved.path.display()
                ),
            });
        }
        let real = InterceptedIntent {
            target: IntentTarget::FileOp {
                path: resolved.path.to_string_lossy().to_string(),
                operation: *operation,
            },
            ..intent.clone()
        };
        session.evaluate(&real)
    }

    fn enforce(
        &self,
        session: &Session,
        intent: &InterceptedIntent,
        kind: DecisionKind,
        _run: bool,
    ) -> Result<Applied> {
        match (kind, &intent.target) {
            (DecisionKind::Allow | DecisionKind::Deny, _) => Ok(Applied::default()),
            (DecisionKind::SoftDelete, IntentTarget::FileOp { path, operation })
                if operation.is_destructive() =>
            {
                let resolved = resolve_in(&session.workspace, path)?;
                if resolved.escapes {
                    return Err(anyhow!(
                        "{} resolves to {} outside the workspace",
                        path,
                        resolved.path.display()
                    ));
                }
                let entry = self.quarantine.archive(&session.id, &resolved.path)?;
                Ok(Applied {
                    detail: Some(entry.archived_path.to_string_lossy().to_string()),
                    output: None,
                })
            }
            (other, _) => Err(anyhow!(
                "file shim cannot apply {} to {}",
                other.as_str(),
                intent.target.summary()
            )),
        }
    }
}
