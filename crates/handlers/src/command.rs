//! Command handler: run an allowlisted verb without a shell.
//!
//! The validated verb is spawned directly with its argument vector, a
//! cleared environment refilled from the [`EnvFilter`], and a working
//! directory that passed the [`PathGuard`]. Output is capped and the child
//! is killed on timeout.
//!
//! Arguments that name a path go through the same guard as file reads, so
//! `cat` or `grep -r` cannot reach what a file read would be refused.
//! Recursive invocations are refused on any directory that contains a
//! forbidden prefix.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use toolgate_config::SecurityConfig;
use toolgate_core::{Admission, GateError, OperationHandler, OperationKind, OperationOutput, OperationRequest, Result};
use toolgate_security::secrets::mask_leaks;
use toolgate_security::{CommandValidator, EnvFilter, PathAccess, PathGuard};

pub struct CommandHandler {
    validator: CommandValidator,
    paths: PathGuard,
    env: EnvFilter,
    max_output_bytes: u64,
}

impl CommandHandler {
    pub fn new(config: &SecurityConfig, paths: PathGuard) -> Self {
        Self {
            validator: CommandValidator::new(&config.commands.allowed),
            paths,
            env: EnvFilter::new(&config.env),
            max_output_bytes: config.commands.max_output_bytes,
        }
    }

    fn working_dir(&self, request: &OperationRequest) -> Result<PathBuf> {
        match request.arg_str("cwd") {
            Some(cwd) => {
                let dir = self.paths.validate(cwd, PathAccess::Read)?;
                if !dir.is_dir() {
                    return Err(GateError::InvalidInput(format!("cwd '{cwd}' is not a directory")));
                }
                Ok(dir)
            }
            None => self
                .paths
                .base_dir()
                .map(PathBuf::from)
                .ok_or_else(|| GateError::AccessDenied("No allowed roots configured".into())),
        }
    }

    /// Run every path-like argument through the guard, resolved against
    /// `cwd`. Returns the directories among them.
    fn check_path_args(&self, args: &[String], cwd: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for arg in args {
            let candidate = if is_flag(arg) {
                match arg.split_once('=') {
                    Some((_, value)) => value,
                    None => continue,
                }
            } else {
                arg.as_str()
            };
            if !names_path(candidate, cwd) {
                continue;
            }

            let absolute = if candidate.starts_with('~') {
                PathBuf::from(candidate)
            } else {
                cwd.join(candidate)
            };
            let access = if absolute.symlink_metadata().is_ok() {
                PathAccess::Read
            } else {
                PathAccess::Write
            };
            let resolved = self
                .paths
                .validate(&absolute.to_string_lossy(), access)
                .inspect_err(|e| debug!(arg = %candidate, error = %e, "Command argument refused"))?;
            if resolved.is_dir() {
                dirs.push(resolved);
            }
        }
        Ok(dirs)
    }
}

fn is_flag(arg: &str) -> bool {
    arg.starts_with('-') && arg != "-"
}

/// Something the child would open: an existing entry under `cwd`, or a
/// string shaped like a path.
fn names_path(arg: &str, cwd: &Path) -> bool {
    !arg.is_empty()
        && (arg.contains('/')
            || arg.starts_with('~')
            || arg.starts_with('.')
            || cwd.join(arg).symlink_metadata().is_ok())
}

/// Invocations that walk a directory tree.
fn is_recursive(verb: &str, args: &[String]) -> bool {
    match verb {
        "find" => true,
        "grep" | "ls" => args.iter().any(|arg| {
            arg == "--recursive"
                || (is_flag(arg) && !arg.starts_with("--") && arg.contains(['r', 'R']))
        }),
        _ => false,
    }
}

/// Why collecting child output stopped early.
enum RunError {
    Io(std::io::Error),
    OutputCap(u64),
}

impl From<std::io::Error> for RunError {
    fn from(e: std::io::Error) -> Self {
        RunError::Io(e)
    }
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: u64) -> std::result::Result<Vec<u8>, RunError> {
    let mut buf = Vec::new();
    if let Some(reader) = reader {
        reader.take(cap.saturating_add(1)).read_to_end(&mut buf).await?;
    }
    if buf.len() as u64 > cap {
        return Err(RunError::OutputCap(buf.len() as u64));
    }
    Ok(buf)
}

#[async_trait]
impl OperationHandler for CommandHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Command
    }

    async fn admit(&self, request: &OperationRequest) -> Result<Admission> {
        let validated = self.validator.validate(&request.target)?;
        let cwd = self.working_dir(request)?;
        let dirs = self.check_path_args(&validated.args, &cwd)?;

        if is_recursive(&validated.verb, &validated.args) {
            let walked = if dirs.is_empty() { vec![cwd.clone()] } else { dirs };
            if let Some(dir) = walked.iter().find(|dir| self.paths.covers_forbidden(dir)) {
                return Err(GateError::AccessDenied(format!(
                    "Recursive '{}' over '{}' would reach a forbidden path",
                    validated.verb,
                    dir.display()
                )));
            }
        }

        let mut argv = Vec::with_capacity(validated.args.len() + 1);
        argv.push(validated.verb.clone());
        argv.extend(validated.args);

        Ok(Admission::new(OperationKind::Command, request.target.trim())
            .with_argv(argv)
            .with_detail("verb", validated.verb)
            .with_detail("cwd", cwd.to_string_lossy().into_owned()))
    }

    async fn execute(
        &self,
        _request: &OperationRequest,
        admission: &Admission,
        timeout: Duration,
    ) -> Result<OperationOutput> {
        let (program, args) = admission
            .argv
            .split_first()
            .ok_or_else(|| GateError::InvalidInput("Admission carries no command".into()))?;
        let cwd = admission
            .details
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| GateError::InvalidInput("Admission carries no working directory".into()))?;

        debug!(program = %program, args = ?args, cwd = %cwd.display(), "Spawning command");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .env_clear()
            .envs(self.env.filtered())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GateError::execution(format!("Failed to spawn '{program}': {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.max_output_bytes;

        let run = async {
            let (out, err) = tokio::try_join!(read_capped(stdout, cap), read_capped(stderr, cap))?;
            let status = child.wait().await?;
            Ok::<_, RunError>((status, out, err))
        };
        let result = tokio::time::timeout(timeout, run).await;

        let (status, out, err) = match result {
            Ok(Ok(done)) => done,
            Ok(Err(RunError::OutputCap(actual))) => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Kill after output cap failed");
                }
                warn!(program = %program, limit = cap, "Command output exceeded cap");
                return Err(GateError::SizeExceeded { limit: cap, actual });
            }
            Ok(Err(RunError::Io(e))) => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Kill after I/O failure failed");
                }
                return Err(GateError::execution(format!("I/O error while running '{program}': {e}")));
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Kill after timeout failed");
                }
                warn!(program = %program, timeout_ms = timeout.as_millis() as u64, "Command timed out");
                return Err(GateError::Timeout { after: timeout });
            }
        };

        let secrets = self.env.secret_values();
        let stdout = mask_leaks(&String::from_utf8_lossy(&out), &secrets);
        let stderr = mask_leaks(&String::from_utf8_lossy(&err), &secrets);
        let code = status.code().unwrap_or(-1);

        if !status.success() {
            warn!(program = %program, exit_code = code, "Command failed");
            let output = format!("{stdout}\n{stderr}").trim().to_string();
            return Err(GateError::Execution {
                reason: format!("'{program}' exited with code {code}"),
                output: Some(output),
            });
        }

        let content = if stderr.trim().is_empty() {
            stdout
        } else {
            format!("{stdout}\n[stderr]: {stderr}")
        };
        let mut output = OperationOutput::text(content.trim()).with_status(code);
        output.bytes = (out.len() + err.len()) as u64;
        Ok(output)
    }
}
