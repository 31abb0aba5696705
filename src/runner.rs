//! Invocation of external command-line tools
//!
//! Every collaborator (converter, registration, stripping steps) is run
//! through a [`ToolRunner`]. Runners never fail: whatever happens to the
//! child process is reported as a [`ToolOutcome`] that the caller has to
//! inspect before moving on to the next stage.

use std::{
    ffi::OsString,
    fmt,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, warn};

/// A fully described command line
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Base name of the program, for logs and problem reports
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(|arg| arg.to_str())
    }

    /// Value following `flag`, if present
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let position = self.args.iter().position(|arg| arg == flag)?;
        self.arg_str(position + 1)
    }

    pub fn program_is(&self, name: &str) -> bool {
        self.program.file_name().is_some_and(|file| file == name)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Succeeded,
    Failed { code: Option<i32>, stderr: String },
    TimedOut(Duration),
    SpawnFailed(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Succeeded)
    }
}

impl fmt::Display for ToolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutcome::Succeeded => write!(f, "succeeded"),
            ToolOutcome::Failed { code: Some(code), stderr } if !stderr.is_empty() => {
                write!(f, "exited with code {code}: {stderr}")
            }
            ToolOutcome::Failed { code: Some(code), .. } => write!(f, "exited with code {code}"),
            ToolOutcome::Failed { code: None, .. } => write!(f, "terminated by a signal"),
            ToolOutcome::TimedOut(timeout) => write!(f, "timed out after {}s", timeout.as_secs()),
            ToolOutcome::SpawnFailed(reason) => write!(f, "could not be started: {reason}"),
        }
    }
}

pub trait ToolRunner {
    /// Run one invocation to completion
    fn run(&self, invocation: &Invocation) -> impl Future<Output = ToolOutcome>;
}

/// Runs tools as child processes, bounded by a timeout
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> ToolOutcome {
        debug!("Executing: {}", invocation);

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return ToolOutcome::SpawnFailed(e.to_string()),
        };

        // Dropping the pending future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolOutcome::SpawnFailed(e.to_string()),
            Err(_) => {
                warn!("{} timed out after {}s", invocation.name(), self.timeout.as_secs());
                return ToolOutcome::TimedOut(self.timeout);
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("[{}] {}", invocation.name(), line);
        }

        if output.status.success() {
            ToolOutcome::Succeeded
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            for line in stderr.lines() {
                warn!("[{}] {}", invocation.name(), line);
            }
            ToolOutcome::Failed {
                code: output.status.code(),
                stderr,
            }
        }
    }
}

/// Path of a volume written under `stem`, whichever NIfTI extension the tool
/// picked
pub fn find_volume(stem: &Path) -> Option<PathBuf> {
    ["nii", "nii.gz"]
        .iter()
        .map(|ext| with_suffix(stem, ext))
        .find(|path| path.is_file())
}

/// `stem` with `.{ext}` appended to its file name
pub fn with_suffix(stem: &Path, ext: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
