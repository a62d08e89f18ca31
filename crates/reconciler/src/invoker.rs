//! Workflow invocation.
//!
//! A [`WorkflowRunner`] launches one external workflow and streams its output
//! onto the shared [`LogChannel`]. [`WorkflowInvoker`] wraps a runner with the
//! timeout ceiling and turns the raw exit status into the error taxonomy.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use playop_core::{ParamSet, ResourceId};
use playop_events::LogChannel;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::{ACTION_PARAM, WorkflowDefinition};
use crate::error::{Error, Result};

/// Marker printed by ansible once a playbook has finished all plays.
pub const PLAY_RECAP: &str = "PLAY RECAP";

/// Prefix of the environment variables carrying parameters.
pub const PARAM_ENV_PREFIX: &str = "PLAYOP_PARAM_";

/// Why a workflow is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Converge the resource to its spec.
    Reconcile,
    /// Tear down before the record is removed.
    Finalize,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconcile => write!(f, "reconcile"),
            Self::Finalize => write!(f, "finalize"),
        }
    }
}

/// One workflow run. Built fresh for every attempt and never persisted.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub run_id: Ulid,
    pub resource: ResourceId,
    pub generation: u64,
    pub purpose: Purpose,
    pub workflow: WorkflowDefinition,
    pub params: ParamSet,
}

impl InvocationRequest {
    /// Create a request with a new run id.
    #[must_use]
    pub fn new(
        resource: ResourceId,
        generation: u64,
        purpose: Purpose,
        workflow: WorkflowDefinition,
        params: ParamSet,
    ) -> Self {
        Self {
            run_id: Ulid::new(),
            resource,
            generation,
            purpose,
            workflow,
            params,
        }
    }

    /// The resolved `action` parameter.
    #[must_use]
    pub fn action(&self) -> String {
        self.params
            .get(ACTION_PARAM)
            .map(playop_core::ParamValue::render)
            .unwrap_or_default()
    }
}

/// What a finished workflow left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowOutput {
    /// Exit code; `None` if killed by a signal.
    pub exit_code: Option<i32>,
    /// The last lines of combined output.
    pub excerpt: Vec<String>,
    /// Total lines seen.
    pub line_count: usize,
    /// Whether the playbook reached its recap.
    pub recap_seen: bool,
}

impl WorkflowOutput {
    /// Output of a run that exited with `code`.
    #[must_use]
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Check if the workflow succeeded (exit code 0).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Launches workflows.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Run to completion, publishing every output line to `log`.
    ///
    /// Dropping the returned future must stop the workflow.
    async fn run(&self, request: &InvocationRequest, log: &LogChannel) -> Result<WorkflowOutput>;
}

/// Bounded tail of workflow output.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
    line_count: usize,
    recap_seen: bool,
}

impl OutputTail {
    /// Keep at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            line_count: 0,
            recap_seen: false,
        }
    }

    /// Record a line. Returns `true` if it is the recap marker.
    pub fn push(&mut self, line: &str) -> bool {
        self.line_count = self.line_count.saturating_add(1);
        let recap = line.contains(PLAY_RECAP);
        self.recap_seen |= recap;
        if self.capacity > 0 {
            if self.lines.len() >= self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }
        recap
    }

    /// Finish with the process exit code.
    #[must_use]
    pub fn finish(self, exit_code: Option<i32>) -> WorkflowOutput {
        WorkflowOutput {
            exit_code,
            excerpt: self.lines.into_iter().collect(),
            line_count: self.line_count,
            recap_seen: self.recap_seen,
        }
    }
}

/// Command-line arguments for a workflow:
/// `[args..] [playbook] -e key=value ...`.
#[must_use]
pub fn workflow_args(workflow: &WorkflowDefinition, params: &ParamSet) -> Vec<String> {
    let mut args = workflow.args.clone();
    if !workflow.playbook.is_empty() {
        args.push(workflow.playbook.clone());
    }
    for (key, value) in params {
        args.push("-e".to_string());
        args.push(format!("{key}={}", value.render()));
    }
    args
}

/// Environment exported to a workflow: `PLAYOP_PARAM_<KEY>=value`.
#[must_use]
pub fn workflow_env(params: &ParamSet) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(key, value)| {
            let name: String = key
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            (format!("{PARAM_ENV_PREFIX}{name}"), value.render())
        })
        .collect_vec()
}

/// Runs workflows as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    excerpt_lines: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(20)
    }
}

impl ProcessRunner {
    /// Keep the last `excerpt_lines` lines for failure messages.
    #[must_use]
    pub const fn new(excerpt_lines: usize) -> Self {
        Self { excerpt_lines }
    }
}

#[async_trait]
impl WorkflowRunner for ProcessRunner {
    async fn run(&self, request: &InvocationRequest, log: &LogChannel) -> Result<WorkflowOutput> {
        let workflow = &request.workflow;
        let mut command = Command::new(&workflow.program);
        command
            .args(workflow_args(workflow, &request.params))
            .envs(workflow_env(&request.params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &workflow.working_dir {
            command.current_dir(Path::new(dir));
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::configuration(format!("workflow program '{}' not found", workflow.program))
            } else {
                Error::transient_io("spawn workflow", format!("'{}': {e}", workflow.program))
            }
        })?;
        debug!(run_id = %request.run_id, pid = ?child.id(), "Workflow process started");

        let mut tail = OutputTail::new(self.excerpt_lines);
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        while stdout.is_some() || stderr.is_some() {
            let line = tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => line,
                line = next_line(&mut stderr), if stderr.is_some() => line,
            };
            if let Some(line) = line {
                if tail.push(&line) {
                    info!(resource = %request.resource, "Playbook completed all plays");
                }
                log.workflow(&request.resource, line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::transient_io("wait for workflow", e.to_string()))?;
        Ok(tail.finish(status.code()))
    }
}

/// Read one line, closing the stream on EOF or read error.
async fn next_line<R>(stream: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let lines = stream.as_mut()?;
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *stream = None;
            None
        }
        Err(e) => {
            warn!(error = %e, "Failed to read workflow output");
            *stream = None;
            None
        }
    }
}

/// Runs workflows under a timeout ceiling.
pub struct WorkflowInvoker {
    runner: Arc<dyn WorkflowRunner>,
    log: Arc<LogChannel>,
    timeout: Duration,
}

impl WorkflowInvoker {
    /// Create an invoker.
    pub fn new(runner: Arc<dyn WorkflowRunner>, log: Arc<LogChannel>, timeout: Duration) -> Self {
        Self {
            runner,
            log,
            timeout,
        }
    }

    /// The timeout ceiling.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one workflow.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the ceiling was hit; the child is killed
    /// - [`Error::WorkflowFailure`] for a non-zero exit, with an output excerpt
    /// - whatever the runner reports when it cannot start the workflow
    pub async fn invoke(&self, request: &InvocationRequest) -> Result<WorkflowOutput> {
        info!(
            resource = %request.resource,
            run_id = %request.run_id,
            generation = request.generation,
            purpose = %request.purpose,
            program = %request.workflow.program,
            "Invoking workflow"
        );
        self.log.operator(
            Some(&request.resource),
            format!(
                "Running playbook {} (action={}, generation={})",
                request.workflow.playbook,
                request.action(),
                request.generation
            ),
        );

        match tokio::time::timeout(self.timeout, self.runner.run(request, &self.log)).await {
            Err(_) => {
                warn!(resource = %request.resource, timeout_secs = self.timeout.as_secs(), "Workflow timed out");
                self.log.operator(
                    Some(&request.resource),
                    format!("Playbook timed out after {}s", self.timeout.as_secs()),
                );
                Err(Error::timeout(&request.resource, self.timeout))
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(output)) if output.is_success() => {
                info!(resource = %request.resource, lines = output.line_count, "Workflow succeeded");
                self.log
                    .operator(Some(&request.resource), "Playbook completed successfully");
                Ok(output)
            }
            Ok(Ok(output)) => {
                warn!(resource = %request.resource, exit_code = ?output.exit_code, "Workflow failed");
                self.log.operator(
                    Some(&request.resource),
                    format!("Playbook failed with exit code {:?}", output.exit_code),
                );
                Err(Error::workflow_failure(output.exit_code, output.excerpt.join("\n")))
            }
        }
    }
}
