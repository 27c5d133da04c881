//! Containment applied in the forked child between `fork` and `exec`.
//!
//! Everything that allocates or opens files (Landlock rules, the CPU set) is
//! prepared in the parent; the child only issues syscalls.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use landlock::{
    ABI, Access, AccessFs, CompatLevel, Compatible, PathBeneath, PathFd, Ruleset, RulesetAttr,
    RulesetCreated, RulesetCreatedAttr, RulesetStatus,
};
use nix::errno::Errno;
use nix::sched::{CloneFlags, CpuSet};
use nix::sys::signal::{self, SigHandler};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid};
use sandbox::{ResourceLimits, SandboxError};

use crate::config::{FilesystemPolicy, NetworkPolicy, ProcessContainment, ProcessFactoryConfig};

const LANDLOCK_ABI: ABI = ABI::V2;
const MAX_OPEN_FILES: u64 = 256;
/// Device nodes a confined script may read and write.
const WRITABLE_DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/urandom", "/dev/random"];

pub(crate) struct ChildSetup {
    memory_bytes: u64,
    cpu_time_secs: u64,
    file_size_bytes: u64,
    cpu_set: Option<CpuSet>,
    namespaces: CloneFlags,
    /// Taken exactly once, in the child.
    ruleset: Mutex<Option<RulesetCreated>>,
}

impl ChildSetup {
    pub(crate) fn new(
        limits: &ResourceLimits,
        config: &ProcessFactoryConfig,
        workspace: &Path,
    ) -> Result<Self, SandboxError> {
        let ruleset = match config.filesystem {
            FilesystemPolicy::Confined => Some(
                confine(&config.read_only_paths, workspace)
                    .map_err(|e| SandboxError::StartFailed(format!("landlock: {e}")))?,
            ),
            FilesystemPolicy::Unrestricted => None,
        };

        Ok(Self {
            memory_bytes: limits.memory_bytes(),
            cpu_time_secs: limits.cpu_time_secs.max(1),
            file_size_bytes: limits.max_output_bytes,
            cpu_set: pick_cpus(limits.cpu_count),
            namespaces: namespaces(config),
            ruleset: Mutex::new(ruleset),
        })
    }

    /// Runs in the child after `fork`, before `exec`.
    ///
    /// With a PID namespace this forks once more: the process `fork` returned
    /// to the engine stays behind as a waiter mirroring the script's exit, and
    /// the script runs as init of the new namespace.
    pub(crate) fn apply(&self) -> io::Result<()> {
        set_parent_death_signal()?;

        if !self.namespaces.is_empty() {
            nix::sched::unshare(self.namespaces)?;
        }

        if let Some(cpu_set) = &self.cpu_set {
            nix::sched::sched_setaffinity(Pid::from_raw(0), cpu_set)?;
        }

        let limits = [
            (libc::RLIMIT_AS, self.memory_bytes),
            (libc::RLIMIT_CPU, self.cpu_time_secs),
            (libc::RLIMIT_FSIZE, self.file_size_bytes),
            (libc::RLIMIT_CORE, 0),
            (libc::RLIMIT_NOFILE, MAX_OPEN_FILES),
        ];
        for (resource, value) in limits {
            let limit = libc::rlimit {
                rlim_cur: value,
                rlim_max: value,
            };
            // SAFETY: `limit` is a valid, initialised rlimit living for the call.
            if unsafe { libc::setrlimit(resource, &limit) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let ruleset = match self.ruleset.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match ruleset {
            // restrict_self also sets no_new_privs.
            Some(ruleset) => {
                let status = ruleset.restrict_self().map_err(|_| io::Error::last_os_error())?;
                if status.ruleset != RulesetStatus::FullyEnforced {
                    return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
                }
            }
            None => {
                // SAFETY: prctl with integer arguments has no memory-safety requirements.
                if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }

        if self.namespaces.contains(CloneFlags::CLONE_NEWPID) {
            // SAFETY: the child goes on to exec; the parent only waits,
            // resets a signal disposition and exits.
            match unsafe { nix::unistd::fork() }? {
                // Dies with the waiter, and the namespace dies with its init.
                ForkResult::Child => set_parent_death_signal()?,
                ForkResult::Parent { child } => mirror_exit(child),
            }
        }

        Ok(())
    }
}

fn namespaces(config: &ProcessFactoryConfig) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    if config.containment == ProcessContainment::PidNamespace {
        flags |= CloneFlags::CLONE_NEWPID;
    }
    if config.network == NetworkPolicy::Deny {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if !flags.is_empty() {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    flags
}

fn set_parent_death_signal() -> io::Result<()> {
    // SAFETY: prctl with integer arguments has no memory-safety requirements.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait for the namespace init and leave the same way it did.
fn mirror_exit(init: Pid) -> ! {
    let code = loop {
        match waitpid(init, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                // SAFETY: restoring the default disposition installs no handler.
                let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
                let _ = signal::raise(sig);
                break 128 + sig as i32;
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break 127,
        }
    };
    // SAFETY: `_exit` skips atexit handlers and stdio flushing that belong to
    // the engine's address space.
    unsafe { libc::_exit(code) }
}

/// Build a Landlock ruleset: read/execute below `read_only`, everything below
/// `workspace`, read/write on a few device nodes. Paths that do not exist on
/// this host are skipped.
fn confine(read_only: &[PathBuf], workspace: &Path) -> Result<RulesetCreated, String> {
    let mut ruleset = Ruleset::default()
        .set_compatibility(CompatLevel::HardRequirement)
        .handle_access(AccessFs::from_all(LANDLOCK_ABI))
        .map_err(|e| e.to_string())?
        .create()
        .map_err(|e| e.to_string())?;

    for path in read_only.iter().filter(|p| p.exists()) {
        let fd = PathFd::new(path).map_err(|e| format!("{}: {e}", path.display()))?;
        ruleset = ruleset
            .add_rule(PathBeneath::new(fd, AccessFs::from_read(LANDLOCK_ABI)))
            .map_err(|e| e.to_string())?;
    }

    for device in WRITABLE_DEVICES.iter().map(Path::new).filter(|p| p.exists()) {
        let fd = PathFd::new(device).map_err(|e| format!("{}: {e}", device.display()))?;
        ruleset = ruleset
            .add_rule(PathBeneath::new(
                fd,
                AccessFs::ReadFile | AccessFs::WriteFile,
            ))
            .map_err(|e| e.to_string())?;
    }

    let fd = PathFd::new(workspace).map_err(|e| format!("{}: {e}", workspace.display()))?;
    ruleset
        .add_rule(PathBeneath::new(fd, AccessFs::from_all(LANDLOCK_ABI)))
        .map_err(|e| e.to_string())
}

/// Pick the first `count` CPUs this process may run on, or `None` when the
/// request covers every available CPU.
fn pick_cpus(count: u32) -> Option<CpuSet> {
    let available = nix::sched::sched_getaffinity(Pid::from_raw(0)).ok()?;
    let usable: Vec<usize> = (0..CpuSet::count())
        .filter(|&cpu| available.is_set(cpu).unwrap_or(false))
        .collect();
    let wanted = usize::try_from(count.max(1)).unwrap_or(usize::MAX);
    if wanted >= usable.len() {
        return None;
    }

    let mut set = CpuSet::new();
    for &cpu in usable.iter().take(wanted) {
        set.set(cpu).ok()?;
    }
    Some(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_count: 1,
            memory_mb: 128,
            cpu_time_secs: 0,
            max_output_bytes: 4096,
        }
    }

    #[test]
    fn cpu_time_is_at_least_one_second() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProcessFactoryConfig::new(dir.path().to_path_buf());
        config.filesystem = FilesystemPolicy::Unrestricted;
        let setup = ChildSetup::new(&limits(), &config, dir.path()).unwrap();
        assert_eq!(setup.cpu_time_secs, 1);
        assert_eq!(setup.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(setup.file_size_bytes, 4096);
        assert_eq!(setup.namespaces, CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID);
    }

    #[test]
    fn namespaces_follow_policies() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProcessFactoryConfig::new(dir.path().to_path_buf());

        config.containment = ProcessContainment::ProcessGroup;
        assert!(namespaces(&config).is_empty());

        config.network = NetworkPolicy::Deny;
        assert_eq!(
            namespaces(&config),
            CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET
        );

        config.containment = ProcessContainment::PidNamespace;
        assert_eq!(
            namespaces(&config),
            CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWPID
        );
    }

    #[test]
    fn confined_ruleset_requires_full_landlock_support() {
        let dir = tempfile::tempdir().unwrap();
        let read_only = [PathBuf::from("/usr")];
        match confine(&read_only, dir.path()) {
            Ok(_) => assert!(landlock_supported()),
            Err(e) => assert!(!landlock_supported(), "{e}"),
        }
    }

    /// Whether the running kernel implements the Landlock ABI this crate asks for.
    fn landlock_supported() -> bool {
        // SAFETY: a null attribute with LANDLOCK_CREATE_RULESET_VERSION only queries the ABI.
        let abi = unsafe {
            libc::syscall(
                libc::SYS_landlock_create_ruleset,
                std::ptr::null::<libc::c_void>(),
                0usize,
                1u32,
            )
        };
        abi >= 2
    }

    #[test]
    fn pick_cpus_never_exceeds_request() {
        if let Some(set) = pick_cpus(1) {
            let chosen = (0..CpuSet::count())
                .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
                .count();
            assert_eq!(chosen, 1);
        }
    }

    #[test]
    fn pick_cpus_returns_none_for_huge_request() {
        assert!(pick_cpus(u32::MAX).is_none());
    }
}
