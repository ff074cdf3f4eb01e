//! Process-backed task runner.
//!
//! Runs `<program> <base_args…> <task> --key value…` as a child process in
//! its own process group and streams both pipes line by line. When the
//! invocation future is dropped (timeout, sibling cancellation) the whole
//! group is killed, so grandchildren do not outlive the step.

use super::{OutputSink, TaskOutput, TaskRequest, TaskRunner};
use crate::config::CommandRunnerConfig;
use crate::core::LogType;
use crate::errors::TaskError;
use crate::pipeline::ArgValue;
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Runs tasks as child processes.
#[derive(Debug, Clone, Default)]
pub struct CommandTaskRunner {
    config: CommandRunnerConfig,
}

impl CommandTaskRunner {
    /// Creates a runner from configuration.
    #[must_use]
    pub fn new(config: CommandRunnerConfig) -> Self {
        Self { config }
    }

    /// A runner that treats the task reference as a `sh -c` script.
    #[must_use]
    pub fn shell() -> Self {
        Self::default()
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &CommandRunnerConfig {
        &self.config
    }

    /// Arguments passed to the program for `request`.
    ///
    /// `true` flags become a bare `--key`, `false` flags are omitted.
    #[must_use]
    pub fn command_line(&self, request: &TaskRequest) -> Vec<String> {
        let mut args = self.config.base_args.clone();
        args.push(request.task.clone());
        for (key, value) in &request.args {
            match value {
                ArgValue::Bool(true) => args.push(format!("--{key}")),
                ArgValue::Bool(false) => {}
                other => {
                    args.push(format!("--{key}"));
                    args.push(other.to_string());
                }
            }
        }
        args
    }
}

#[async_trait]
impl TaskRunner for CommandTaskRunner {
    async fn run(
        &self,
        request: &TaskRequest,
        output: &dyn OutputSink,
    ) -> Result<TaskOutput, TaskError> {
        let args = self.command_line(request);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .envs(&self.config.env)
            .env("STEPLINE_PIPELINE", &request.pipeline)
            .env("STEPLINE_RUN_ID", &request.run_id)
            .env("STEPLINE_STEP", &request.step)
            .env("STEPLINE_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| TaskError::Spawn {
            task: request.task.clone(),
            reason: e.to_string(),
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        info!(
            step = %request.step,
            run_id = %request.run_id,
            attempt = request.attempt,
            program = %self.config.program,
            pid = ?child.id(),
            "starting task process"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (captured_out, captured_err) = tokio::join!(
            pump(stdout, LogType::Stdout, output),
            pump(stderr, LogType::Stderr, output),
        );
        let status = child.wait().await?;
        group.disarm();

        let stdout = captured_out?;
        let stderr = captured_err?;
        let code = exit_code(status);
        debug!(step = %request.step, run_id = %request.run_id, exit_code = code, "task process exited");

        if status.success() {
            Ok(TaskOutput { stdout, stderr })
        } else {
            Err(TaskError::NonZeroExit {
                code,
                stdout,
                stderr,
            })
        }
    }
}

async fn pump<R>(reader: Option<R>, log_type: LogType, output: &dyn OutputSink) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
        output.line(log_type, line).await;
        captured.push_str(line);
        captured.push('\n');
    }
    Ok(captured)
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Kills the child's process group when dropped while armed.
struct ProcessGroupGuard {
    pgid: Option<u32>,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pgid) = self.pgid {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; it touches no memory we own.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pgid, "killed task process group");
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, error = %err, "failed to kill task process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::executor::NullOutputSink;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[derive(Default)]
    struct Lines(Mutex<Vec<(LogType, String)>>);

    #[async_trait]
    impl OutputSink for Lines {
        async fn line(&self, log_type: LogType, line: &str) {
            self.0.lock().push((log_type, line.to_string()));
        }
    }

    fn request(task: &str) -> TaskRequest {
        TaskRequest {
            pipeline: "p".to_string(),
            run_id: "r1".to_string(),
            step: "s".to_string(),
            task: task.to_string(),
            args: BTreeMap::new(),
            attempt: 1,
        }
    }

    #[test]
    fn test_command_line_flags() {
        let runner = CommandTaskRunner::new(CommandRunnerConfig {
            program: "tool".to_string(),
            base_args: vec!["--file".to_string(), "tasks.yaml".to_string()],
            ..CommandRunnerConfig::default()
        });
        let mut req = request("build.release");
        req.args.insert("dry".to_string(), ArgValue::Bool(true));
        req.args.insert("quiet".to_string(), ArgValue::Bool(false));
        req.args.insert("jobs".to_string(), ArgValue::Int(4));

        assert_eq!(
            runner.command_line(&req),
            vec!["--file", "tasks.yaml", "build.release", "--dry", "--jobs", "4"]
        );
    }

    #[tokio::test]
    async fn test_streams_both_pipes() {
        let lines = Lines::default();
        let out = CommandTaskRunner::shell()
            .run(&request("echo hello; echo oops >&2; echo $STEPLINE_STEP"), &lines)
            .await
            .unwrap();

        assert_eq!(out.stdout, "hello\ns\n");
        assert_eq!(out.stderr, "oops\n");
        let seen = lines.0.lock().clone();
        assert!(seen.contains(&(LogType::Stdout, "hello".to_string())));
        assert!(seen.contains(&(LogType::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = CommandTaskRunner::shell()
            .run(&request("echo broken >&2; exit 3"), &NullOutputSink)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.stderr(), "broken\n");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = CommandTaskRunner::new(CommandRunnerConfig {
            program: "/definitely/not/a/program".to_string(),
            base_args: Vec::new(),
            ..CommandRunnerConfig::default()
        });
        let err = runner
            .run(&request("x"), &NullOutputSink)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Spawn { .. }));
    }

    #[cfg(target_os = "linux")]
    fn is_alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // The state field follows the parenthesised command name.
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropping_the_future_kills_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pidfile.display());

        let runner = CommandTaskRunner::shell();
        let req = request(&script);
        let result =
            tokio::time::timeout(Duration::from_millis(500), runner.run(&req, &NullOutputSink))
                .await;
        assert!(result.is_err(), "the script should still be running");

        let pid = std::fs::read_to_string(&pidfile).unwrap().trim().to_string();
        let mut alive = true;
        for _ in 0..40 {
            alive = is_alive(&pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "grandchild {pid} survived the timeout");
    }
}
