//! Background executor: run long-lived jobs off the control path and track them.
//!
//! A job is either an external command, whose stdout and stderr are captured
//! line by line, or a native closure run on the blocking pool. Submitting a
//! job returns a [`JobHandle`]; dropping the handle before the job finishes
//! aborts the driving task, which kills a child process. Native closures
//! cannot be interrupted once started and run to completion regardless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status of a background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { output: String },
    Failed { error: String },
}

impl JobStatus {
    /// Whether the job is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded { .. } => "succeeded",
            JobStatus::Failed { .. } => "failed",
        }
    }
}

/// Shared, append-only output captured from a job.
#[derive(Debug, Clone, Default)]
pub struct JobLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl JobLog {
    pub fn push(&self, line: impl Into<String>) {
        lock(&self.lines).push(line.into());
    }

    pub fn contents(&self) -> String {
        lock(&self.lines).join("\n")
    }

    /// The tail of the log, at most `max_bytes` long.
    pub fn excerpt(&self, max_bytes: usize) -> String {
        tail_excerpt(&self.contents(), max_bytes)
    }
}

/// Keep the last `max_bytes` of `text`, cut on a character boundary.
pub fn tail_excerpt(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... truncated]\n{}", &text[start..])
}

/// An external program to run.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

/// Work executed on the blocking pool. Returns a summary or an error message.
pub type NativeJob = Box<dyn FnOnce(&JobLog) -> Result<String, String> + Send + 'static>;

pub enum JobSpec {
    Command(CommandSpec),
    Native(NativeJob),
}

/// A named unit of background work.
pub struct Job {
    pub name: String,
    pub spec: JobSpec,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.spec {
            JobSpec::Command(_) => "Command",
            JobSpec::Native(_) => "Native",
        };
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("spec", &kind)
            .finish()
    }
}

impl Job {
    pub fn command(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec: JobSpec::Command(spec),
        }
    }

    pub fn native<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&JobLog) -> Result<String, String> + Send + 'static,
    {
        Self {
            name: name.into(),
            spec: JobSpec::Native(Box::new(f)),
        }
    }
}

/// A job record kept for polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

type Records = Arc<Mutex<HashMap<Uuid, JobRecord>>>;

/// Spawns jobs onto the runtime and records their status.
#[derive(Clone, Default)]
pub struct BackgroundExecutor {
    records: Records,
}

impl BackgroundExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a job and return its handle. Must be called within a Tokio runtime.
    pub fn submit(&self, job: Job) -> JobHandle {
        let id = Uuid::new_v4();
        let log = JobLog::default();
        let (tx, rx) = watch::channel(JobStatus::Pending);

        lock(&self.records).insert(
            id,
            JobRecord {
                id,
                name: job.name.clone(),
                status: JobStatus::Pending,
                submitted_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        );

        let mut completion = Completion {
            id,
            records: self.records.clone(),
            tx,
            finished: false,
        };
        let task_log = log.clone();
        let name = job.name.clone();
        let task = tokio::spawn(async move {
            completion.update(JobStatus::Running);
            let status = match job.spec {
                JobSpec::Command(spec) => run_command(&job.name, spec, &task_log).await,
                JobSpec::Native(f) => run_native(f, task_log.clone()).await,
            };
            match &status {
                JobStatus::Failed { error } => warn!(job = %job.name, %error, "Job failed"),
                _ => info!(job = %job.name, "Job succeeded"),
            }
            completion.update(status);
        });

        debug!(job = %name, %id, "Job submitted");
        JobHandle {
            id,
            name,
            status: rx,
            abort: task.abort_handle(),
            log,
        }
    }

    pub fn status(&self, id: &Uuid) -> Option<JobStatus> {
        self.get(id).map(|record| record.status)
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        lock(&self.records).get(id).cloned()
    }

    /// All job records, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = lock(&self.records).values().cloned().collect();
        records.sort_by_key(|record| record.submitted_at);
        records
    }
}

async fn run_command(name: &str, spec: CommandSpec, log: &JobLog) -> JobStatus {
    use tokio::process::Command;

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    debug!(job = name, program = %spec.program, args = ?spec.args, "Spawning job command");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return JobStatus::Failed {
                error: format!("failed to start '{}': {e}", spec.program),
            };
        }
    };

    let readers = [
        child.stdout.take().map(|pipe| capture(pipe, log.clone(), false)),
        child.stderr.take().map(|pipe| capture(pipe, log.clone(), true)),
    ];

    let exit = child.wait().await;
    for reader in readers.into_iter().flatten() {
        let _ = reader.await;
    }

    match exit {
        Ok(status) if status.success() => JobStatus::Succeeded {
            output: log.excerpt(1_024),
        },
        Ok(status) => JobStatus::Failed {
            error: match status.code() {
                Some(code) => format!("'{}' exited with status {code}", spec.program),
                None => format!("'{}' was terminated by a signal", spec.program),
            },
        },
        Err(e) => JobStatus::Failed {
            error: format!("failed to wait for '{}': {e}", spec.program),
        },
    }
}

fn capture<R>(pipe: R, log: JobLog, is_stderr: bool) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                log.push(format!("[stderr] {line}"));
            } else {
                log.push(line);
            }
        }
    })
}

async fn run_native(f: NativeJob, log: JobLog) -> JobStatus {
    match tokio::task::spawn_blocking(move || f(&log)).await {
        Ok(Ok(output)) => JobStatus::Succeeded { output },
        Ok(Err(error)) => JobStatus::Failed { error },
        Err(e) => JobStatus::Failed {
            error: format!("job panicked: {e}"),
        },
    }
}

/// Publishes status changes; marks the job abandoned if dropped unfinished.
struct Completion {
    id: Uuid,
    records: Records,
    tx: watch::Sender<JobStatus>,
    finished: bool,
}

impl Completion {
    fn update(&mut self, status: JobStatus) {
        let now = Utc::now();
        if let Some(record) = lock(&self.records).get_mut(&self.id) {
            match &status {
                JobStatus::Running => record.started_at = Some(now),
                s if s.is_finished() => record.completed_at = Some(now),
                _ => {}
            }
            record.status = status.clone();
        }
        self.finished = status.is_finished();
        self.tx.send_replace(status);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.finished {
            self.update(JobStatus::Failed {
                error: "job abandoned before completion".into(),
            });
        }
    }
}

/// RAII handle on a submitted job.
///
/// Dropping an unfinished handle aborts the job's driving task.
pub struct JobHandle {
    id: Uuid,
    name: String,
    status: watch::Receiver<JobStatus>,
    abort: AbortHandle,
    log: JobLog,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self) -> &JobLog {
        &self.log
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(&mut self) -> JobStatus {
        match self.status.wait_for(JobStatus::is_finished).await {
            Ok(status) => status.clone(),
            Err(_) => JobStatus::Failed {
                error: format!("job '{}' was abandoned before completion", self.name),
            },
        }
    }

    /// Wait at most `timeout`; `None` when the job is still running.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<JobStatus> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if !self.status.borrow().is_finished() {
            debug!(job = %self.name, id = %self.id, "Job handle dropped, aborting");
            self.abort.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..CommandSpec::default()
        }
    }

    #[tokio::test]
    async fn test_native_job_succeeds() {
        let executor = BackgroundExecutor::new();
        let mut handle = executor.submit(Job::native("count", |log| {
            log.push("counted 3 rows");
            Ok("3 rows".to_string())
        }));

        let status = handle.wait().await;
        assert_eq!(
            status,
            JobStatus::Succeeded {
                output: "3 rows".into()
            }
        );
        assert_eq!(handle.log().contents(), "counted 3 rows");

        let record = executor.get(&handle.id()).unwrap();
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
        assert_eq!(executor.status(&handle.id()), Some(status));
    }

    #[tokio::test]
    async fn test_native_job_failure_and_panic() {
        let executor = BackgroundExecutor::new();
        let mut failing = executor.submit(Job::native("fail", |_| Err("bad input".into())));
        assert_eq!(
            failing.wait().await,
            JobStatus::Failed {
                error: "bad input".into()
            }
        );

        let mut panicking = executor.submit(Job::native("panic", |_| panic!("boom")));
        match panicking.wait().await {
            JobStatus::Failed { error } => assert!(error.contains("panicked")),
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(executor.list().len(), 2);
    }

    #[tokio::test]
    async fn test_command_output_captured() {
        let executor = BackgroundExecutor::new();
        let mut handle = executor.submit(Job::command(
            "echo",
            shell("echo loaded; echo warning >&2; exit 3"),
        ));

        match handle.wait().await {
            JobStatus::Failed { error } => assert!(error.contains("status 3"), "{error}"),
            other => panic!("unexpected status: {other:?}"),
        }
        let log = handle.log().contents();
        assert!(log.contains("loaded"));
        assert!(log.contains("[stderr] warning"));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let executor = BackgroundExecutor::new();
        let mut handle = executor.submit(Job::command(
            "missing",
            CommandSpec {
                program: "definitely-not-a-real-program-omopsync".into(),
                ..CommandSpec::default()
            },
        ));
        assert!(matches!(handle.wait().await, JobStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_wait_timeout_and_drop_aborts() {
        let executor = BackgroundExecutor::new();
        let mut handle = executor.submit(Job::command("sleep", shell("sleep 30")));
        assert!(handle.wait_timeout(Duration::from_millis(100)).await.is_none());
        let id = handle.id();
        drop(handle);

        let mut status = executor.status(&id);
        for _ in 0..50 {
            if status.as_ref().is_some_and(JobStatus::is_finished) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = executor.status(&id);
        }
        assert!(matches!(status, Some(JobStatus::Failed { .. })));
    }

    #[test]
    fn test_tail_excerpt() {
        assert_eq!(tail_excerpt("short", 10), "short");
        let excerpt = tail_excerpt("0123456789", 4);
        assert_eq!(excerpt, "[... truncated]\n6789");
        let excerpt = tail_excerpt("aé", 1);
        assert!(excerpt.ends_with("[... truncated]\n"));
    }
}
