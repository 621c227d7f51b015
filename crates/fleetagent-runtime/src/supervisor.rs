use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use fleetagent_schema::ScriptResult;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::{kill, SupervisorError};

/// Exit code reported for a process that was killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 98;

/// How long to keep draining pipes once the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub pid: Option<u32>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecOutput {
    /// stdout followed by stderr, the way `script-run` replies.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

impl From<ExecOutput> for ScriptResult {
    fn from(out: ExecOutput) -> Self {
        ScriptResult {
            stdout: out.stdout,
            stderr: out.stderr,
            retcode: out.exit_code,
            execution_time: out.duration.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Run `program` with `args`, killing its whole process group if it outlives `timeout`.
pub async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
    opts: &RunOptions,
) -> Result<ExecOutput, SupervisorError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);
    if let Some(dir) = &opts.workdir {
        cmd.current_dir(dir);
    }
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let pid = child.id();
    tracing::debug!(program, pid, timeout_secs = timeout.as_secs(), "spawned process");

    let stdout_task = tokio::spawn(read_to_string(child.stdout.take()));
    let stderr_task = tokio::spawn(read_to_string(child.stderr.take()));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            // Leftover group members would hold the pipes open past the deadline.
            if let Some(pid) = pid {
                kill::kill_group(pid as i32);
            }
            (exit_code_of(status), false)
        }
        Ok(Err(source)) => {
            return Err(SupervisorError::Wait {
                program: program.to_string(),
                source,
            })
        }
        Err(_) => {
            tracing::warn!(program, pid, "process timed out, killing process group");
            if let Some(pid) = pid {
                kill::kill_group(pid as i32);
            }
            let _ = child.kill().await;
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    let (stdout, mut stderr) = (
        drain(stdout_task, DRAIN_GRACE).await,
        drain(stderr_task, DRAIN_GRACE).await,
    );

    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("timed out after {} seconds", timeout.as_secs()));
    }

    Ok(ExecOutput {
        pid,
        stdout,
        stderr,
        exit_code,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Script interpreters the agent knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Bash,
    Python,
    PowerShell,
}

impl FromStr for Interpreter {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shell" | "bash" | "sh" => Ok(Self::Bash),
            "python" | "python3" => Ok(Self::Python),
            "powershell" | "pwsh" => Ok(Self::PowerShell),
            other => Err(SupervisorError::Script(format!(
                "unsupported interpreter: {other}"
            ))),
        }
    }
}

impl Interpreter {
    fn extension(self) -> &'static str {
        match self {
            Self::Bash => ".sh",
            Self::Python => ".py",
            Self::PowerShell => ".ps1",
        }
    }

    fn invocation(self, script: &Path, args: &[String]) -> (String, Vec<String>) {
        let script = script.display().to_string();
        let (program, mut argv) = match self {
            Self::Bash => ("/bin/bash", vec![script]),
            Self::Python => ("python3", vec![script]),
            Self::PowerShell => (
                "pwsh",
                vec![
                    "-NonInteractive".to_string(),
                    "-NoProfile".to_string(),
                    "-File".to_string(),
                    script,
                ],
            ),
        };
        argv.extend(args.iter().cloned());
        (program.to_string(), argv)
    }
}

/// Write `code` to a temporary script file and run it through `interpreter`.
pub async fn run_script(
    interpreter: &str,
    code: &str,
    args: &[String],
    timeout: Duration,
) -> Result<ExecOutput, SupervisorError> {
    let interpreter: Interpreter = interpreter.parse()?;
    let mut file = tempfile::Builder::new()
        .prefix("fleetagent-")
        .suffix(interpreter.extension())
        .tempfile()
        .map_err(|e| SupervisorError::Script(format!("cannot create script file: {e}")))?;
    file.write_all(code.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| SupervisorError::Script(format!("cannot write script file: {e}")))?;

    let (program, argv) = interpreter.invocation(file.path(), args);
    let result = run_command(&program, &argv, timeout, &RunOptions::default()).await;
    drop(file);
    result
}

/// Run a one-line command through a shell.
pub async fn run_raw(
    shell: &str,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutput, SupervisorError> {
    let (program, flag) = match shell.to_ascii_lowercase().as_str() {
        "" | "sh" | "cmd" | "shell" => ("/bin/sh", "-c"),
        "bash" => ("/bin/bash", "-c"),
        "powershell" | "pwsh" => ("pwsh", "-Command"),
        other => {
            return Err(SupervisorError::Script(format!(
                "unsupported shell: {other}"
            )))
        }
    };
    let args = [flag.to_string(), command.to_string()];
    run_command(program, &args, timeout, &RunOptions::default()).await
}

async fn read_to_string<R>(reader: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(task: tokio::task::JoinHandle<String>, grace: Duration) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_names() {
        assert_eq!("shell".parse::<Interpreter>().unwrap(), Interpreter::Bash);
        assert_eq!("Python".parse::<Interpreter>().unwrap(), Interpreter::Python);
        assert_eq!(
            "powershell".parse::<Interpreter>().unwrap(),
            Interpreter::PowerShell
        );
        assert!(matches!(
            "cobol".parse::<Interpreter>(),
            Err(SupervisorError::Script(_))
        ));
    }

    #[test]
    fn powershell_invocation_is_non_interactive() {
        let (program, argv) =
            Interpreter::PowerShell.invocation(Path::new("/tmp/x.ps1"), &["-a".into()]);
        assert_eq!(program, "pwsh");
        assert_eq!(argv.first().map(String::as_str), Some("-NonInteractive"));
        assert_eq!(argv.last().map(String::as_str), Some("-a"));
    }

    #[test]
    fn combined_output_is_stdout_then_stderr() {
        let out = ExecOutput {
            pid: None,
            stdout: "out\n".into(),
            stderr: "err\n".into(),
            exit_code: 1,
            timed_out: false,
            duration: Duration::from_millis(5),
        };
        assert_eq!(out.combined(), "out\nerr\n");
        assert!(!out.success());
        let result: ScriptResult = out.into();
        assert_eq!(result.retcode, 1);
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = run_raw("sh", "echo hello; echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = run_command(
            "/nonexistent/fleetagent-binary",
            &[],
            Duration::from_secs(1),
            &RunOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn runs_in_requested_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let opts = RunOptions {
            workdir: Some(dir.path().to_path_buf()),
            env: vec![("FLEETAGENT_TEST".into(), "yes".into())],
        };
        let out = run_command(
            "/bin/sh",
            &["-c".into(), "pwd; echo $FLEETAGENT_TEST".into()],
            Duration::from_secs(5),
            &opts,
        )
        .await
        .unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert!(out.stdout.contains(&canonical.display().to_string()));
        assert!(out.stdout.contains("yes"));
    }

    #[tokio::test]
    async fn script_receives_arguments() {
        let out = run_script(
            "shell",
            "#!/bin/bash\necho \"args: $1 $2\"\n",
            &["one".into(), "two".into()],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.trim(), "args: one two");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn unknown_interpreter_is_rejected_before_spawn() {
        let err = run_script("cobol", "DISPLAY 'HI'.", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported interpreter"));
    }
}
