/// Hard ceilings enforced by the backend, never by the script itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_count: u32,
    pub memory_mb: u32,
    /// CPU seconds the script may consume before the kernel kills it.
    pub cpu_time_secs: u64,
    /// Ceiling for captured stdout and for any file the script writes.
    pub max_output_bytes: u64,
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        u64::from(self.memory_mb) * 1024 * 1024
    }
}

/// Script handed to the sandbox, written into its workspace before launch.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub file_name: String,
    pub contents: String,
}

pub struct SandboxConfig {
    pub id: uuid::Uuid,
    pub resources: ResourceLimits,
    pub script: ScriptSource,
    /// Extra environment for the script. The host environment is never inherited.
    pub env: Vec<(String, String)>,
    /// File name (relative to the workspace) the script may write structured output to.
    pub output_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_bytes_converts_mib() {
        let limits = ResourceLimits {
            cpu_count: 1,
            memory_mb: 256,
            cpu_time_secs: 10,
            max_output_bytes: 1024,
        };
        assert_eq!(limits.memory_bytes(), 268_435_456);
    }
}
