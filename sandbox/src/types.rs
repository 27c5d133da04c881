use std::fmt;

/// How a sandboxed script ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short human-readable description of the exit status.
    pub fn describe(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exited with status {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig} ({})", signal_name(sig)),
            (None, None) => "exited with unknown status".into(),
        }
    }
}

fn signal_name(sig: i32) -> &'static str {
    match sig {
        6 => "SIGABRT",
        9 => "SIGKILL, likely a resource ceiling",
        11 => "SIGSEGV",
        15 => "SIGTERM",
        24 => "SIGXCPU, CPU time ceiling exceeded",
        25 => "SIGXFSZ, output size ceiling exceeded",
        _ => "signal",
    }
}

/// Result of a time-bounded wait on a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ProcessExit),
    DeadlineExceeded,
}

/// A file read back from the sandbox workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub bytes: Vec<u8>,
    /// The file was larger than the read limit; `bytes` holds the prefix.
    pub truncated: bool,
}

impl fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(exit) => f.write_str(&exit.describe()),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}
