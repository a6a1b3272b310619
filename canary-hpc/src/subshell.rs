//! Subshell backend: run the batch in a local `/bin/sh`
//!
//! The no-scheduler fallback.  The submission script is rendered the
//! same way as for a real scheduler, then run as a child process;
//! polling maps to `try_wait` on the child.

use async_trait::async_trait;
use chrono::Local;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::backend::{Job, SchedulerBackend, SubmitSpec};
use crate::error::{HpcError, HpcResult};

pub struct SubShell {
    shell: &'static str,
}

impl SubShell {
    pub fn new() -> Self {
        Self { shell: "/bin/sh" }
    }
}

impl Default for SubShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulerBackend for SubShell {
    fn name(&self) -> &'static str {
        "subshell"
    }

    fn node_count(&self) -> u32 {
        1
    }

    fn count_per_node(&self, rtype: &str) -> Option<u32> {
        match rtype {
            "cpus" => Some(num_cpus::get() as u32),
            "gpus" => Some(0),
            _ => None,
        }
    }

    fn polling_frequency(&self) -> Duration {
        Duration::from_millis(500)
    }

    async fn submit(&self, spec: SubmitSpec) -> HpcResult<Box<dyn Job>> {
        let script = render_script(self.shell, &spec);
        if let Some(parent) = spec.scriptname.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&spec.scriptname, script)?;
        set_executable(&spec.scriptname)?;

        let output = std::fs::File::create(&spec.output)?;
        let error = std::fs::File::create(&spec.error)?;
        debug!(job = %spec.name, script = %spec.scriptname.display(), "starting subshell job");
        let child = Command::new(self.shell)
            .arg(&spec.scriptname)
            .stdout(std::process::Stdio::from(output))
            .stderr(std::process::Stdio::from(error))
            .spawn()
            .map_err(|e| HpcError::Backend(format!("failed to start {}: {}", spec.name, e)))?;
        let id = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "none".to_string());
        Ok(Box::new(SubShellJob { id, child }))
    }
}

struct SubShellJob {
    id: String,
    child: Child,
}

#[async_trait]
impl Job for SubShellJob {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn poll(&mut self) -> HpcResult<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.code().unwrap_or(-1))),
            Ok(None) => Ok(None),
            Err(e) => Err(HpcError::Backend(e.to_string())),
        }
    }

    async fn cancel(&mut self) -> HpcResult<()> {
        self.child
            .start_kill()
            .map_err(|e| HpcError::Backend(e.to_string()))?;
        let _ = self.child.wait().await;
        Ok(())
    }
}

fn render_script(shell: &str, spec: &SubmitSpec) -> String {
    let mut script = String::new();
    script.push_str(&format!("#!{}\n", shell));
    script.push_str(&format!("# job: {}\n", spec.name));
    script.push_str(&format!("# date: {}\n", Local::now().format("%c")));
    script.push_str(&format!("# approximate runtime: {:.0}s\n", spec.qtime));
    for (var, value) in &spec.variables {
        script.push_str(&format!("export {}={}\n", var, value));
    }
    for command in &spec.commands {
        script.push_str(&format!("(\n  {}\n)\n", command));
    }
    script
}

fn set_executable(path: &std::path::Path) -> HpcResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_mode(permissions.mode() | 0o755);
        std::fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(dir: &std::path::Path, command: &str) -> SubmitSpec {
        SubmitSpec {
            name: "canary.test".to_string(),
            commands: vec![command.to_string()],
            nodes: 1,
            scriptname: dir.join("canary-inp.sh"),
            output: dir.join("canary-out.txt"),
            error: dir.join("canary-out.txt"),
            submit_flags: Vec::new(),
            variables: BTreeMap::from([("CANARY_LEVEL".to_string(), "1".to_string())]),
            qtime: 60.0,
        }
    }

    #[tokio::test]
    async fn test_submit_runs_script_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SubShell::new();
        let mut job = backend
            .submit(spec(dir.path(), "echo ran > marker.txt; exit 0"))
            .await
            .unwrap();
        let code = loop {
            if let Some(code) = job.poll().await.unwrap() {
                break code;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(code, 0);
        let script = std::fs::read_to_string(dir.path().join("canary-inp.sh")).unwrap();
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("export CANARY_LEVEL=1"));
    }

    #[tokio::test]
    async fn test_cancel_kills_job() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SubShell::new();
        let mut job = backend.submit(spec(dir.path(), "sleep 60")).await.unwrap();
        assert!(job.poll().await.unwrap().is_none());
        job.cancel().await.unwrap();
        // after cancellation the job no longer runs
        let polled = job.poll().await.unwrap();
        assert!(polled.is_some());
    }
}
