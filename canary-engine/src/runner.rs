//! Worker execution: stage, run, and judge one test case
//!
//! Workers own their case for the duration of the run and publish a
//! `CaseResult` back to the dispatcher on completion.  All failures
//! are captured into the result; a worker never propagates an error
//! into the dispatcher.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::case::{AssetKind, CaseId, CompositeMode, StatusName, TestCase};
use crate::error::{EngineError, EngineResult};
use crate::resource::Assignment;

/// Combined stdout of the child process, within the case directory
pub const STDOUT_FILE: &str = "canary-out.txt";
/// Stderr of the child process, within the case directory
pub const STDERR_FILE: &str = "canary-err.txt";
/// Optional measurements blob a test may leave behind
pub const MEASUREMENTS_FILE: &str = "measurements.json";

/// Immutable context shared by all workers
#[derive(Debug, Clone)]
pub struct RunContext {
    pub grace_period: Duration,
    pub diff_exit_code: i32,
    /// Session-level environment exports
    pub env: Vec<(String, String)>,
    pub cancel: Arc<AtomicBool>,
    pub cancel_notify: Arc<Notify>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            diff_exit_code: 64,
            env: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
        }
    }
}

/// What a worker publishes back to the dispatcher
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub id: CaseId,
    pub status: StatusName,
    pub message: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub returncode: Option<i32>,
    pub measurements: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitKind {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    Cancelled,
}

/// Run one case to completion in its working directory
pub async fn run_case(
    case: &TestCase,
    workdir: &Path,
    assignment: &Assignment,
    ctx: &RunContext,
) -> CaseResult {
    let start = Utc::now();
    debug!(case = %case.display_name(), dir = %workdir.display(), "starting");
    let (status, message, returncode) = match execute(case, workdir, assignment, ctx).await {
        Ok((exit, output)) => {
            let (status, message) = judge(case, exit, &output, ctx.diff_exit_code);
            let rc = match exit {
                ExitKind::Exited(code) => Some(code),
                ExitKind::Signaled(sig) => Some(-sig),
                _ => None,
            };
            (status, message, rc)
        }
        Err(err) => {
            warn!(case = %case.display_name(), error = %err, "worker error");
            (StatusName::Fail, Some(err.to_string()), None)
        }
    };
    let stop = Utc::now();
    CaseResult {
        id: case.id.clone(),
        status,
        message,
        start,
        stop,
        returncode,
        measurements: read_measurements(workdir),
    }
}

async fn execute(
    case: &TestCase,
    workdir: &Path,
    assignment: &Assignment,
    ctx: &RunContext,
) -> EngineResult<(ExitKind, String)> {
    std::fs::create_dir_all(workdir)?;
    let source_dir = case
        .file_root
        .join(&case.file_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| case.file_root.clone());
    let sources = stage_assets(case, &source_dir, workdir)?;

    let argv = build_argv(case, &source_dir)?;
    let stdout = std::fs::File::create(workdir.join(STDOUT_FILE))?;
    let stderr = std::fs::File::create(workdir.join(STDERR_FILE))?;

    let mut command = if sources.is_empty() {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    } else {
        // rc files are sourced in a wrapping shell before exec
        let mut line = String::new();
        for rc in &sources {
            line.push_str(&format!(". {} && ", shell_quote(rc)));
        }
        line.push_str("exec");
        for arg in &argv {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(line);
        cmd
    };

    command
        .current_dir(workdir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(stdout))
        .stderr(std::process::Stdio::from(stderr))
        .env("CANARY_TESTCASE_ID", case.id.as_str())
        .env("CANARY_TESTCASE_NAME", case.display_name());
    for (key, value) in assignment.env("CANARY") {
        command.env(key, value);
    }
    for (key, value) in &ctx.env {
        command.env(key, value);
    }
    command.kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| EngineError::Process(format!("failed to spawn {:?}: {}", argv[0], e)))?;

    let exit = wait_for_exit(&mut child, case.timeout, ctx).await?;
    let mut output = std::fs::read_to_string(workdir.join(STDOUT_FILE)).unwrap_or_default();
    if let Ok(err) = std::fs::read_to_string(workdir.join(STDERR_FILE)) {
        output.push_str(&err);
    }
    Ok((exit, output))
}

async fn wait_for_exit(
    child: &mut Child,
    timeout: Option<f64>,
    ctx: &RunContext,
) -> EngineResult<ExitKind> {
    enum Wakeup {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let deadline = timeout.filter(|t| *t > 0.0).map(Duration::from_secs_f64);
    let wakeup = {
        let cancelled = cancelled(&ctx.cancel, &ctx.cancel_notify);
        tokio::select! {
            status = child.wait() => Wakeup::Exited(status),
            _ = sleep_or_forever(deadline) => Wakeup::TimedOut,
            _ = cancelled => Wakeup::Cancelled,
        }
    };
    match wakeup {
        Wakeup::Exited(status) => {
            let status = status.map_err(|e| EngineError::Process(e.to_string()))?;
            Ok(exit_kind(status))
        }
        Wakeup::TimedOut => {
            terminate(child, ctx.grace_period).await;
            Ok(ExitKind::TimedOut)
        }
        Wakeup::Cancelled => {
            terminate(child, ctx.grace_period).await;
            Ok(ExitKind::Cancelled)
        }
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

async fn cancelled(flag: &AtomicBool, notify: &Notify) {
    loop {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        notify.notified().await;
    }
}

/// Graceful stop: SIGTERM, wait out the grace period, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn exit_kind(status: std::process::ExitStatus) -> ExitKind {
    if let Some(code) = status.code() {
        return ExitKind::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExitKind::Signaled(sig);
        }
    }
    ExitKind::Signaled(0)
}

fn build_argv(case: &TestCase, source_dir: &Path) -> EngineResult<Vec<String>> {
    let mut argv = case.command.clone();
    match &case.composite {
        Some(CompositeMode::Flag(flag)) => argv.push(flag.clone()),
        Some(CompositeMode::Script(script)) => {
            if argv.is_empty() {
                argv.push(script.clone());
            } else {
                argv[0] = script.clone();
            }
        }
        None => {}
    }
    if argv.is_empty() {
        return Err(EngineError::Process(format!(
            "{}: no command to execute",
            case.display_name()
        )));
    }
    // a relative program resolves against the test file's directory
    let program = Path::new(&argv[0]);
    if program.is_relative() {
        let resolved = source_dir.join(program);
        if resolved.exists() {
            argv[0] = resolved.to_string_lossy().to_string();
        }
    }
    Ok(argv)
}

/// Stage copy/link assets into the working directory; returns the rc
/// files to source before execution
fn stage_assets(
    case: &TestCase,
    source_dir: &Path,
    workdir: &Path,
) -> EngineResult<Vec<String>> {
    let mut sources = Vec::new();
    for asset in &case.assets {
        let src = resolve_asset(source_dir, &asset.src);
        let name = asset.dst.clone().unwrap_or_else(|| {
            Path::new(&asset.src)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| asset.src.clone())
        });
        let dst = workdir.join(&name);
        match asset.kind {
            AssetKind::Copy => {
                std::fs::copy(&src, &dst).map_err(|e| {
                    EngineError::Process(format!("copy {} -> {}: {}", src.display(), dst.display(), e))
                })?;
            }
            AssetKind::Link => {
                if dst.exists() {
                    std::fs::remove_file(&dst)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&src, &dst).map_err(|e| {
                    EngineError::Process(format!("link {} -> {}: {}", src.display(), dst.display(), e))
                })?;
                #[cfg(not(unix))]
                std::fs::copy(&src, &dst).map(|_| ()).map_err(|e| {
                    EngineError::Process(format!("copy {} -> {}: {}", src.display(), dst.display(), e))
                })?;
            }
            AssetKind::Source => {
                sources.push(src.to_string_lossy().to_string());
            }
        }
    }
    Ok(sources)
}

fn resolve_asset(source_dir: &Path, src: &str) -> PathBuf {
    let path = Path::new(src);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        source_dir.join(path)
    }
}

fn shell_quote(arg: &str) -> String {
    if arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn read_measurements(workdir: &Path) -> BTreeMap<String, serde_json::Value> {
    let path = workdir.join(MEASUREMENTS_FILE);
    if let Ok(text) = std::fs::read_to_string(path) {
        if let Ok(map) = serde_json::from_str(&text) {
            return map;
        }
    }
    BTreeMap::new()
}

/// Terminal status rule.
///
/// In order: timeout and cancellation are sticky; signal exits fail;
/// a matching skip return code skips; the diff exit code diffs; the
/// exit code must match `xstatus` (0, exact, or -1 for any non-zero);
/// `fail_regex` can fail an otherwise passing run and a declared
/// `pass_regex` must appear; `will_fail` inverts the pass/fail axis.
fn judge(
    case: &TestCase,
    exit: ExitKind,
    output: &str,
    diff_exit_code: i32,
) -> (StatusName, Option<String>) {
    match exit {
        ExitKind::TimedOut => {
            return (
                StatusName::Timeout,
                Some(format!("killed after {:.0}s", case.timeout.unwrap_or(0.0))),
            )
        }
        ExitKind::Cancelled => return (StatusName::Cancelled, None),
        ExitKind::Signaled(sig) => {
            return (
                StatusName::Fail,
                Some(format!("terminated by signal {}", sig)),
            )
        }
        ExitKind::Exited(code) => {
            if let Some(skip) = case.skip_return_code {
                if code == skip {
                    return (StatusName::Skip, Some("skip return code".to_string()));
                }
            }
            if code == diff_exit_code {
                return (StatusName::Diff, None);
            }
            let expected = match case.xstatus {
                0 => code == 0,
                -1 => code != 0,
                x => code == x,
            };
            let mut status = StatusName::Success;
            let mut message = None;
            if !expected {
                status = StatusName::Fail;
                message = Some(format!("exit code {} (expected {})", code, case.xstatus));
            } else if let Some(pattern) = matches_any(&case.fail_regex, output) {
                status = StatusName::Fail;
                message = Some(format!("matched fail pattern {:?}", pattern));
            } else if !case.pass_regex.is_empty() && matches_any(&case.pass_regex, output).is_none()
            {
                status = StatusName::Fail;
                message = Some("no pass pattern matched".to_string());
            }
            if case.will_fail {
                status = match status {
                    StatusName::Success => StatusName::Fail,
                    StatusName::Fail => StatusName::Success,
                    other => other,
                };
                if status == StatusName::Fail {
                    message = Some("expected failure but passed".to_string());
                } else {
                    message = None;
                }
            }
            (status, message)
        }
    }
}

fn matches_any<'a>(patterns: &'a [String], output: &str) -> Option<&'a str> {
    for pattern in patterns {
        match regex::Regex::new(pattern) {
            Ok(re) => {
                if re.is_match(output) {
                    return Some(pattern);
                }
            }
            Err(_) => {
                warn!(%pattern, "ignoring unparsable status pattern");
            }
        }
    }
    None
}
