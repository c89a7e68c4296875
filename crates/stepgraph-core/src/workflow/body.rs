//! Step bodies: the user work a script template names.
//!
//! `StepBody` is the async trait a body implements. `StepBodyDyn` is its
//! object-safe mirror with boxed futures, blanket-implemented for every
//! `StepBody`, and `BoxStepBody` wraps it behind an `Arc` so the registry can
//! hand cheap clones to worker tasks.
//!
//! Two bodies ship with the engine: [`FnBody`] runs a blocking closure on the
//! tokio blocking pool, and [`CommandBody`] runs an OS process that receives
//! the invocation as JSON on stdin and answers with outputs on stdout.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepgraph_types::artifact::ArtifactHandle;
use stepgraph_types::error::GraphError;
use stepgraph_types::run::StepOutputs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Exit code a `CommandBody` process uses to ask for a retry (`EX_TEMPFAIL`).
pub const TRANSIENT_EXIT_CODE: i32 = 75;

/// Why one run of a step failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// Worth retrying (I/O hiccup, busy resource).
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("run cancelled")]
    Cancelled,

    /// A container hit a configuration error only detectable while running.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl StepError {
    pub fn fatal(message: impl Into<String>) -> Self {
        StepError::Fatal(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StepError::Transient(message.into())
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything a body sees for one run: resolved inputs and a private
/// working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub run_id: Uuid,
    /// Path of the step inside the run, e.g. `main/hello1`.
    pub path: String,
    pub template: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactHandle>,
    pub workdir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_index: Option<usize>,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl Invocation {
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Integer parameter, or a fatal error naming the input.
    pub fn int(&self, name: &str) -> Result<i64, StepError> {
        self.parameter(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| StepError::fatal(format!("input '{name}' is not an integer")))
    }

    /// String parameter, or a fatal error naming the input.
    pub fn str(&self, name: &str) -> Result<&str, StepError> {
        self.parameter(name)
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::fatal(format!("input '{name}' is not a string")))
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactHandle> {
        self.artifacts.get(name)
    }
}

// ---------------------------------------------------------------------------
// StepBody
// ---------------------------------------------------------------------------

/// User work behind a script template.
///
/// Returned outputs are matched against the template's declared outputs;
/// declared outputs not returned are read from their declared path inside
/// `invocation.workdir`.
pub trait StepBody: Send + Sync {
    fn run(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<StepOutputs, StepError>> + Send;
}

/// Object-safe version of [`StepBody`] with a boxed future.
pub trait StepBodyDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutputs, StepError>> + Send + 'a>>;
}

impl<T: StepBody> StepBodyDyn for T {
    fn run_boxed<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutputs, StepError>> + Send + 'a>> {
        Box::pin(self.run(invocation))
    }
}

/// Type-erased, cheaply cloneable step body.
#[derive(Clone)]
pub struct BoxStepBody {
    inner: Arc<dyn StepBodyDyn>,
}

impl BoxStepBody {
    pub fn new<B: StepBody + 'static>(body: B) -> Self {
        Self {
            inner: Arc::new(body),
        }
    }

    pub async fn run(&self, invocation: &Invocation) -> Result<StepOutputs, StepError> {
        self.inner.run_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepBody").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// FnBody
// ---------------------------------------------------------------------------

/// Blocking closure run on the tokio blocking pool.
pub struct FnBody<F> {
    f: Arc<F>,
}

impl<F> FnBody<F>
where
    F: Fn(&Invocation) -> Result<StepOutputs, StepError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F> StepBody for FnBody<F>
where
    F: Fn(&Invocation) -> Result<StepOutputs, StepError> + Send + Sync + 'static,
{
    async fn run(&self, invocation: &Invocation) -> Result<StepOutputs, StepError> {
        let f = Arc::clone(&self.f);
        let invocation = invocation.clone();
        tokio::task::spawn_blocking(move || f(&invocation))
            .await
            .map_err(|e| StepError::fatal(format!("body panicked: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// CommandBody
// ---------------------------------------------------------------------------

/// External process body.
///
/// The process runs in the invocation's working directory with the
/// invocation JSON on stdin. Exit code 0 means success and stdout, when
/// non-empty, holds a JSON `StepOutputs` object. Exit code
/// [`TRANSIENT_EXIT_CODE`] is a transient failure; any other code is fatal.
/// The process is killed if the run is dropped (timeout or cancel).
#[derive(Debug, Clone)]
pub struct CommandBody {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandBody {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl StepBody for CommandBody {
    async fn run(&self, invocation: &Invocation) -> Result<StepOutputs, StepError> {
        let payload = serde_json::to_vec(invocation)
            .map_err(|e| StepError::fatal(format!("cannot encode invocation: {e}")))?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepError::fatal(format!("cannot start '{}': {e}", self.program)))?;

        // stdin is fed while stdout and stderr drain
        let stdin = child.stdin.take();
        let path = invocation.path.as_str();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // a body that ignores stdin may close it early
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(path, error = %e, "stdin closed early");
                }
            }
        };

        let (_, output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| StepError::transient(format!("waiting on '{}': {e}", self.program)))?;

        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if stdout.trim().is_empty() {
                    return Ok(StepOutputs::default());
                }
                serde_json::from_str(stdout.trim())
                    .map_err(|e| StepError::fatal(format!("invalid outputs on stdout: {e}")))
            }
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let lines: Vec<&str> = stderr.lines().collect();
                let tail = lines[lines.len().saturating_sub(5)..].join("\n");
                let message = match code {
                    Some(c) => format!("'{}' exited with {c}: {tail}", self.program),
                    None => format!("'{}' was killed by a signal: {tail}", self.program),
                };
                if code == Some(TRANSIENT_EXIT_CODE) {
                    Err(StepError::Transient(message))
                } else {
                    Err(StepError::Fatal(message))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BodyRegistry
// ---------------------------------------------------------------------------

/// Bodies by the name script templates refer to.
#[derive(Debug, Clone, Default)]
pub struct BodyRegistry {
    bodies: HashMap<String, BoxStepBody>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: StepBody + 'static>(&mut self, name: impl Into<String>, body: B) -> &mut Self {
        self.bodies.insert(name.into(), BoxStepBody::new(body));
        self
    }

    /// Register a blocking closure.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Invocation) -> Result<StepOutputs, StepError> + Send + Sync + 'static,
    {
        self.register(name, FnBody::new(f))
    }

    pub fn get(&self, name: &str) -> Option<&BoxStepBody> {
        self.bodies.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bodies.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(workdir: PathBuf) -> Invocation {
        Invocation {
            run_id: Uuid::now_v7(),
            path: "main/hello".to_string(),
            template: "duplicate".to_string(),
            parameters: BTreeMap::from([("msg".to_string(), json!(1))]),
            artifacts: BTreeMap::new(),
            workdir,
            slice_index: None,
            attempt: 1,
        }
    }

    struct Echo;

    impl StepBody for Echo {
        async fn run(&self, invocation: &Invocation) -> Result<StepOutputs, StepError> {
            Ok(StepOutputs::new().with_parameter("msg", invocation.int("msg")?))
        }
    }

    #[tokio::test]
    async fn test_boxed_body_delegates() {
        let body = BoxStepBody::new(Echo);
        let out = body.run(&invocation(std::env::temp_dir())).await.unwrap();
        assert_eq!(out.parameter("msg"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_fn_body_runs_closure() {
        let mut registry = BodyRegistry::new();
        registry.register_fn("duplicate", |inv| {
            Ok(StepOutputs::new().with_parameter("msg", inv.int("msg")? * 2))
        });
        assert!(registry.contains("duplicate"));
        let body = registry.get("duplicate").unwrap();
        let out = body.run(&invocation(std::env::temp_dir())).await.unwrap();
        assert_eq!(out.parameter("msg"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_fn_body_panic_is_fatal() {
        let body = FnBody::new(|_inv: &Invocation| -> Result<StepOutputs, StepError> { panic!("boom") });
        let err = body.run(&invocation(std::env::temp_dir())).await.unwrap_err();
        assert!(matches!(err, StepError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_invocation_accessors_report_bad_types() {
        let inv = invocation(std::env::temp_dir());
        assert!(inv.str("msg").is_err());
        assert!(inv.int("missing").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_body_reads_stdout_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let body = CommandBody::new("sh")
            .arg("-c")
            .arg(r#"cat > /dev/null; echo '{"parameters": {"msg": 2}}'"#);
        let out = body.run(&invocation(dir.path().to_path_buf())).await.unwrap();
        assert_eq!(out.parameter("msg"), Some(&json!(2)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_body_large_input_with_chatty_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation(dir.path().to_path_buf());
        inv.parameters
            .insert("blob".to_string(), json!("x".repeat(300_000)));
        // fills both pipes before reading any of stdin
        let body = CommandBody::new("sh").arg("-c").arg(
            r#"head -c 200000 /dev/zero >&2; head -c 200000 /dev/zero | tr '\0' ' '; cat > /dev/null; echo '{"parameters": {"msg": 2}}'"#,
        );
        let out = tokio::time::timeout(std::time::Duration::from_secs(10), body.run(&inv))
            .await
            .expect("command body stalled")
            .unwrap();
        assert_eq!(out.parameter("msg"), Some(&json!(2)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_body_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path().to_path_buf());

        let transient = CommandBody::new("sh").arg("-c").arg("exit 75");
        assert!(matches!(transient.run(&inv).await, Err(StepError::Transient(_))));

        let fatal = CommandBody::new("sh").arg("-c").arg("echo nope >&2; exit 3");
        match fatal.run(&inv).await {
            Err(StepError::Fatal(msg)) => assert!(msg.contains("nope")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_body_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let body = CommandBody::new("sh").arg("-c").arg("echo 7 > out.txt");
        let out = body.run(&invocation(dir.path().to_path_buf())).await.unwrap();
        assert!(out.is_empty());
        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written.trim(), "7");
    }
}
