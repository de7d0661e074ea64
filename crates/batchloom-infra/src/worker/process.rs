//! Executables that run as child processes.
//!
//! A `command` description names a program with its arguments, extra
//! environment, and working directory. The child's stdout is the task's
//! result value; lines of the form `::flow:: <directive>` are taken out of
//! it and become the runtime flow decision:
//!
//! ```text
//! ::flow:: continue
//! ::flow:: loop <target> [cron expression]
//! ::flow:: replicate <runs>
//! ```
//!
//! The child is killed when the attempt is interrupted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use batchloom_core::execution::{Executable, ExecutableResolver, ExecutionContext, ExecutionFailure};
use batchloom_types::executable::{ExecutableDescription, TaskOutput};
use batchloom_types::flow::FlowAction;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

/// Kind string handled by [`ProcessResolver`].
pub const COMMAND_KIND: &str = "command";

const FLOW_MARKER: &str = "::flow::";

/// Exposes the allocated node names to the child, comma separated.
pub const NODES_ENV: &str = "BATCHLOOM_NODES";

#[derive(Debug, Clone, Deserialize)]
struct CommandSpec {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

/// Resolves `command` descriptions into [`CommandExecutable`]s.
#[derive(Debug, Clone, Default)]
pub struct ProcessResolver;

impl ProcessResolver {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutableResolver for ProcessResolver {
    fn kind(&self) -> &str {
        COMMAND_KIND
    }

    fn resolve(&self, description: &ExecutableDescription) -> Result<Box<dyn Executable>, ExecutionFailure> {
        let spec: CommandSpec = serde_json::from_value(description.spec.clone())
            .map_err(|e| ExecutionFailure::new(format!("invalid command description: {e}")))?;
        if spec.program.trim().is_empty() {
            return Err(ExecutionFailure::new("command description has an empty program"));
        }
        Ok(Box::new(CommandExecutable { spec }))
    }
}

/// One resolved command, ready to spawn.
#[derive(Debug)]
pub struct CommandExecutable {
    spec: CommandSpec,
}

impl Executable for CommandExecutable {
    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, Result<TaskOutput, ExecutionFailure>> {
        Box::pin(self.run(ctx))
    }
}

impl CommandExecutable {
    async fn run(&self, ctx: ExecutionContext) -> Result<TaskOutput, ExecutionFailure> {
        if ctx.run_as_user {
            return Err(ExecutionFailure::new(
                "process worker cannot run tasks as the submitting user",
            ));
        }

        let nodes: Vec<&str> = ctx.nodes.iter().map(|n| n.name.as_str()).collect();
        let mut command = tokio::process::Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .env(NODES_ENV, nodes.join(","))
            .stdin(if ctx.credentials.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecutionFailure::new(format!("failed to spawn '{}': {e}", self.spec.program)))?;
        tracing::debug!(program = %self.spec.program, pid = ?child.id(), "process started");

        // The credential blob is handed over on stdin, untouched, while the
        // child runs. Closing stdin afterwards signals the end of the blob.
        let stdin = child.stdin.take();
        let feed = async {
            if let (Some(credentials), Some(mut stdin)) = (&ctx.credentials, stdin) {
                if let Err(err) = stdin.write_all(credentials.as_bytes()).await {
                    tracing::warn!(program = %self.spec.program, error = %err, "could not write credentials to stdin");
                }
            }
        };
        let run = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        // Dropping the run future kills the child (kill_on_drop).
        let output = tokio::select! {
            output = run => output
                .map_err(|e| ExecutionFailure::new(format!("failed to wait for '{}': {e}", self.spec.program)))?,
            _ = ctx.interrupt.cancelled() => {
                tracing::info!(program = %self.spec.program, "process killed on interrupt");
                return Err(ExecutionFailure::new(format!("'{}' was interrupted", self.spec.program)));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutionFailure::new(format!(
                "'{}' exited with {}: {}",
                self.spec.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| ExecutionFailure::new("process output is not valid UTF-8"))?;
        parse_output(&stdout)
    }
}

/// Split stdout into the result value and an optional flow decision.
///
/// The last directive wins. What remains is parsed as JSON when possible,
/// else kept as a trimmed string; empty output yields `null`.
fn parse_output(stdout: &str) -> Result<TaskOutput, ExecutionFailure> {
    let mut flow = None;
    let mut body = Vec::new();
    for line in stdout.lines() {
        match line.trim_start().strip_prefix(FLOW_MARKER) {
            Some(directive) => flow = Some(parse_directive(directive)?),
            None => body.push(line),
        }
    }

    let text = body.join("\n");
    let text = text.trim();
    let value = if text.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
    };
    Ok(TaskOutput { value, flow })
}

fn parse_directive(directive: &str) -> Result<FlowAction, ExecutionFailure> {
    let mut words = directive.split_whitespace();
    let invalid = || ExecutionFailure::new(format!("invalid flow directive '{}'", directive.trim()));
    match words.next() {
        Some("continue") => Ok(FlowAction::Continue),
        Some("loop") => {
            let target = words.next().ok_or_else(invalid)?.to_string();
            let cron: Vec<&str> = words.collect();
            Ok(FlowAction::Loop {
                target,
                cron: (!cron.is_empty()).then(|| cron.join(" ")),
            })
        }
        Some("replicate") => {
            let runs = words
                .next()
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(invalid)?;
            Ok(FlowAction::Replicate { runs })
        }
        _ => Err(invalid()),
    }
}
