use serde::{Deserialize, Serialize};

/// The class of operation an agent attempted.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Exec,
    FileOp,
    NetConnect,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Exec => "exec",
            IntentKind::FileOp => "file_op",
            IntentKind::NetConnect => "net_connect",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Delete,
    Rename,
    List,
    Stat,
    Mkdir,
    Rmdir,
}

impl FileOperation {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(FileOperation::Read),
            "write" => Some(FileOperation::Write),
            "create" => Some(FileOperation::Create),
            "delete" => Some(FileOperation::Delete),
            "rename" => Some(FileOperation::Rename),
            "list" => Some(FileOperation::List),
            "stat" => Some(FileOperation::Stat),
            "mkdir" => Some(FileOperation::Mkdir),
            "rmdir" => Some(FileOperation::Rmdir),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Read => "read",
            FileOperation::Write => "write",
            FileOperation::Create => "create",
            FileOperation::Delete => "delete",
            FileOperation::Rename => "rename",
            FileOperation::List => "list",
            FileOperation::Stat => "stat",
            FileOperation::Mkdir => "mkdir",
            FileOperation::Rmdir => "rmdir",
        }
    }

    /// Operations that destroy data and can be rewritten into an archival move.
    pub fn is_destructive(&self) -> bool {
        matches!(self, FileOperation::Delete | FileOperation::Rmdir)
    }
}

/// What the agent tried to touch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntentTarget {
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    FileOp {
        path: String,
        operation: FileOperation,
    },
    NetConnect {
        host: String,
        port: u16,
    },
}

impl IntentTarget {
    pub fn exec(program: &str, args: &[&str]) -> Self {
        IntentTarget::Exec {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Splits a shell-style command line on whitespace. Quoting is not
    /// interpreted; callers with exact argv should use [`IntentTarget::exec`].
    pub fn exec_line(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let program = parts.next().unwrap_or_default().to_string();
        IntentTarget::Exec {
            program,
            args: parts.map(str::to_string).collect(),
        }
    }

    pub fn file(path: &str, operation: FileOperation) -> Self {
        IntentTarget::FileOp {
            path: path.to_string(),
            operation,
        }
    }

    pub fn connect(host: &str, port: u16) -> Self {
        IntentTarget::NetConnect {
            host: host.to_string(),
            port,
        }
    }

    pub fn kind(&self) -> IntentKind {
        match self {
            IntentTarget::Exec { .. } => IntentKind::Exec,
            IntentTarget::FileOp { .. } => IntentKind::FileOp,
            IntentTarget::NetConnect { .. } => IntentKind::NetConnect,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            IntentTarget::Exec { program, args } if args.is_empty() => program.clone(),
            IntentTarget::Exec { program, args } => format!("{} {}", program, args.join(" ")),
            IntentTarget::FileOp { path, operation } => format!("{} {}", operation.as_str(), path),
            IntentTarget::NetConnect { host, port } if host.contains(':') => {
                format!("connect [{}]:{}", host, port)
            }
            IntentTarget::NetConnect { host, port } => format!("connect {}:{}", host, port),
        }
    }
}

/// One attempted operation, captured by a shim. Never persisted on its own;
/// it is folded into an audit event once a decision is enforced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterceptedIntent {
    pub session_id: String,
    pub target: IntentTarget,
    pub timestamp_ms: u64,
}

impl InterceptedIntent {
    pub fn new(session_id: &str, target: IntentTarget) -> Self {
        Self {
            session_id: session_id.to_string(),
            target,
            timestamp_ms: crate::now_ms(),
        }
    }

    pub fn kind(&self) -> IntentKind {
        self.target.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_line_splits_program_and_args() {
        let target = IntentTarget::exec_line("sudo apt-get install x");
        assert_eq!(
            target,
            IntentTarget::exec("sudo", &["apt-get", "install", "x"])
        );
        assert_eq!(target.summary(), "sudo apt-get install x");
    }

    #[test]
    fn targets_deserialize_from_tagged_json() {
        let target: IntentTarget =
            serde_json::from_str(r#"{"kind":"file_op","path":"/w/a","operation":"delete"}"#)
                .expect("parse target");
        assert_eq!(target, IntentTarget::file("/w/a", FileOperation::Delete));
        assert_eq!(target.kind(), IntentKind::FileOp);
    }
}
