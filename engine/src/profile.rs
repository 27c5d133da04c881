use std::collections::HashMap;
use std::time::Duration;

use sandbox::ResourceLimits;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::job::TenantId;
use crate::serde_util::secs;

pub const DEFAULT_CPU_COUNT: u32 = 1;
pub const DEFAULT_MEMORY_MB: u32 = 256;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_ACTIVE_JOBS: usize = 4;
/// No tenant may run longer than this, whatever its policy says.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Ceilings applied to one job's sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceProfile {
    pub cpu_count: u32,
    pub memory_mb: u32,
    /// Wall-clock ceiling, enforced by the supervisor.
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
    pub max_output_bytes: u64,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            cpu_count: DEFAULT_CPU_COUNT,
            memory_mb: DEFAULT_MEMORY_MB,
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ResourceProfile {
    /// Hard limits for the sandbox backend. CPU time is bounded by what the
    /// allotted CPUs could burn within the wall-clock ceiling.
    pub fn limits(&self) -> ResourceLimits {
        let wall_secs = self.timeout.as_secs().max(1);
        ResourceLimits {
            cpu_count: self.cpu_count,
            memory_mb: self.memory_mb,
            cpu_time_secs: wall_secs.saturating_mul(u64::from(self.cpu_count.max(1))),
            max_output_bytes: self.max_output_bytes,
        }
    }

    /// Apply per-job overrides. Overrides may only lower limits, never raise
    /// them above this profile.
    pub fn apply(&self, overrides: &ProfileOverrides) -> Result<Self, String> {
        fn pick<T: PartialOrd + Copy + Default + std::fmt::Display>(
            name: &str,
            ceiling: T,
            requested: Option<T>,
        ) -> Result<T, String> {
            match requested {
                None => Ok(ceiling),
                Some(v) if v <= T::default() => Err(format!("{name} must be positive")),
                Some(v) if v > ceiling => {
                    Err(format!("{name} {v} exceeds the tenant ceiling of {ceiling}"))
                }
                Some(v) => Ok(v),
            }
        }

        Ok(Self {
            cpu_count: pick("cpu_count", self.cpu_count, overrides.cpu_count)?,
            memory_mb: pick("memory_mb", self.memory_mb, overrides.memory_mb)?,
            timeout: Duration::from_secs(pick(
                "timeout_secs",
                self.timeout.as_secs(),
                overrides.timeout_secs,
            )?),
            max_output_bytes: pick(
                "max_output_bytes",
                self.max_output_bytes,
                overrides.max_output_bytes,
            )?,
        })
    }
}

/// Optional per-job reductions of the tenant profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantPolicy {
    pub profile: ResourceProfile,
    /// Queued plus running jobs the tenant may have at once.
    pub max_active_jobs: usize,
}

impl Default for TenantPolicy {
    fn default() -> Self {
        Self {
            profile: ResourceProfile::default(),
            max_active_jobs: DEFAULT_MAX_ACTIVE_JOBS,
        }
    }
}

/// Resolves the ceilings that apply to a tenant. Called on the submit path,
/// so implementations must not block.
pub trait ProfileResolver: Send + Sync {
    fn resolve(&self, tenant: &TenantId) -> TenantPolicy;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    pub default: TenantPolicy,
    pub tenants: HashMap<String, TenantPolicy>,
    #[serde(rename = "max_timeout_secs", with = "secs")]
    pub max_timeout: Duration,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            default: TenantPolicy::default(),
            tenants: HashMap::new(),
            max_timeout: DEFAULT_MAX_TIMEOUT,
        }
    }
}

/// Fixed policy table: one default plus per-tenant entries.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    default: TenantPolicy,
    tenants: HashMap<TenantId, TenantPolicy>,
}

impl StaticProfiles {
    pub fn new(default: TenantPolicy) -> Self {
        Self {
            default,
            tenants: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>, policy: TenantPolicy) -> Self {
        self.tenants.insert(TenantId::new(tenant), policy);
        self
    }

    /// Build from configuration, clamping every wall-clock ceiling to
    /// `config.max_timeout`.
    pub fn from_config(config: &ProfilesConfig) -> Self {
        let clamp = |name: &str, mut policy: TenantPolicy| {
            if policy.profile.timeout > config.max_timeout {
                warn!(
                    tenant = name,
                    timeout_secs = policy.profile.timeout.as_secs(),
                    max_timeout_secs = config.max_timeout.as_secs(),
                    "tenant timeout above system ceiling, clamping"
                );
                policy.profile.timeout = config.max_timeout;
            }
            policy
        };

        Self {
            default: clamp("default", config.default),
            tenants: config
                .tenants
                .iter()
                .map(|(name, policy)| (TenantId::new(name.clone()), clamp(name, *policy)))
                .collect(),
        }
    }
}

impl ProfileResolver for StaticProfiles {
    fn resolve(&self, tenant: &TenantId) -> TenantPolicy {
        self.tenants.get(tenant).copied().unwrap_or(self.default)
    }
}
