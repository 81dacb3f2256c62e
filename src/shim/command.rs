use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{Applied, Registrations, Shim, ShimContext};
use crate::capability::{Capability, CapabilityRegistry};
use crate::intent::{InterceptedIntent, IntentKind, IntentTarget};
use crate::policy::DecisionKind;
use crate::session::Session;

const MAX_CAPTURE: usize = 64 * 1024;
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Wall-clock limit for commands run on behalf of a session.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    /// The command outlived the exec timeout and was killed.
    #[serde(default)]
    pub timed_out: bool,
}

/// Process-launch interception, backed by seccomp user notification.
pub struct CommandShim {
    ctx: ShimContext,
    capabilities: Arc<CapabilityRegistry>,
    registrations: Registrations,
    exec_timeout: Duration,
}

impl CommandShim {
    pub fn new(
        ctx: ShimContext,
        capabilities: Arc<CapabilityRegistry>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            capabilities,
            registrations: Registrations::default(),
            exec_timeout,
        }
    }

    /// Runs the command in its own process group and kills the whole group
    /// once the exec timeout passes.
    fn run_in_workspace(
        &self,
        session: &Session,
        program: &str,
        args: &[String],
    ) -> Result<ExecOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&session.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch {}", program))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.exec_timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("failed to wait for {}", program))?
            {
                break status;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                log::warn!(
                    "session {}: {} exceeded {}s; killing",
                    session.id,
                    program,
                    self.exec_timeout.as_secs_f32()
                );
                kill_group(&mut child);
                break child
                    .wait()
                    .with_context(|| format!("failed to reap {}", program))?;
            }
            thread::sleep(WAIT_POLL);
        };

        let (stdout, out_cut) = collect(stdout);
        let (stderr, err_cut) = collect(stderr);
        Ok(ExecOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            truncated: out_cut || err_cut,
            timed_out,
        })
    }
}

fn kill_group(child: &mut Child) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: signals only the process group created for this child.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
}

/// Reads a pipe to EOF on its own thread, keeping at most `MAX_CAPTURE`
/// bytes. The rest is discarded so the child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<(Vec<u8>, bool)>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut kept = Vec::new();
            let mut cut = false;
            let mut buf = [0u8; 8192];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let room = MAX_CAPTURE.saturating_sub(kept.len());
                        if n > room {
                            cut = true;
                        }
                        kept.extend_from_slice(&buf[..n.min(room)]);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            (kept, cut)
        })
    })
}

fn collect(handle: Option<JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    match handle.and_then(|handle| handle.join().ok()) {
        Some((bytes, cut)) => (String::from_utf8_lossy(&bytes).to_string(), cut),
        None => (String::new(), false),
    }
}

impl Shim for CommandShim {
    fn kind(&self) -> IntentKind {
        IntentKind::Exec
    }

    fn capability(&self) -> Capability {
        Capability::CommandNotify
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

    fn enforce(
        &self,
        session: &Session,
        intent: &InterceptedIntent,
        kind: DecisionKind,
        run: bool,
    ) -> Result<Applied> {
        match (kind, &intent.target) {
            (DecisionKind::Deny, _) => Ok(Applied::default()),
            (DecisionKind::Allow, _) if !run => Ok(Applied::default()),
            (DecisionKind::Allow, IntentTarget::Exec { program, args }) => {
                let output = self.run_in_workspace(session, program, args)?;
                let detail = match output.exit_code {
                    _ if output.timed_out => format!(
                        "timed out after {}s; killed",
                        self.exec_timeout.as_secs_f32()
                    ),
                    Some(code) => format!("exit status {}", code),
                    None => "terminated by signal".to_string(),
                };
                Ok(Applied {
                    detail: Some(detail),
                    output: Some(output),
                })
            }
            (other, _) => Err(anyhow!(
                "command shim cannot apply {} to {}",
                other.as_str(),
                intent.target.summary()
            )),
        }
    }
}
