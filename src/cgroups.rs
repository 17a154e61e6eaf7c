//! Thin cgroup v2 file writer. The supervisor only ever deals with the
//! unified hierarchy; limits are whatever strings the kernel interface
//! accepts for cpu.max, memory.max, pids.max and io.max.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::sys::statfs;
use nix::unistd::Pid;

use crate::container::CgroupLimits;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[inline]
fn write_cgroup_file<P: AsRef<Path>>(path: P, data: &str) -> Result<()> {
    OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path.as_ref())
        .with_context(|| format!("failed to open {:?}", path.as_ref()))?
        .write_all(data.as_bytes())
        .with_context(|| format!("failed to write to {:?}", path.as_ref()))?;
    Ok(())
}

/// Startup check: the unified hierarchy must be what is mounted at
/// /sys/fs/cgroup.
pub fn ensure_v2() -> Result<()> {
    let stat = statfs::statfs(DEFAULT_CGROUP_ROOT)
        .with_context(|| format!("failed to statfs {}", DEFAULT_CGROUP_ROOT))?;
    if stat.filesystem_type().0 as i64 != libc::CGROUP2_SUPER_MAGIC as i64 {
        bail!("cgroup v2 is not mounted at {}", DEFAULT_CGROUP_ROOT);
    }
    Ok(())
}

/// Delegates the controllers we use to the subtree.
pub fn enable_controllers(root: &Path) -> Result<()> {
    let data = "+cpu +memory +pids +io";
    write_cgroup_file(root.join("cgroup.subtree_control"), data)
}

/// Creates the cgroup, writes the limit files and moves `pid` into it.
/// The pid is written in the outer hierarchy view, before any cgroup
/// namespace the container may have unshared affects path resolution.
pub fn apply(limits: &CgroupLimits, pid: Pid) -> Result<()> {
    fs::create_dir_all(&limits.path)
        .with_context(|| format!("failed to create cgroup {:?}", limits.path))?;

    if !limits.cpu_max.is_empty() {
        write_cgroup_file(limits.path.join("cpu.max"), &limits.cpu_max)?;
    }
    if !limits.memory_max.is_empty() {
        write_cgroup_file(limits.path.join("memory.max"), &limits.memory_max)?;
    }
    if !limits.pids_max.is_empty() {
        write_cgroup_file(limits.path.join("pids.max"), &limits.pids_max)?;
    }
    if !limits.io_max.is_empty() {
        write_cgroup_file(limits.path.join("io.max"), &limits.io_max)?;
    }

    write_cgroup_file(limits.path.join(CGROUP_PROCS), &pid.as_raw().to_string())
}

pub fn remove(limits: &CgroupLimits) -> Result<()> {
    fs::remove_dir(&limits.path)
        .with_context(|| format!("failed to remove cgroup {:?}", limits.path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::create_temp_dir;
    use std::fs::File;
    use std::path::PathBuf;

    fn seed_cgroup_files(dir: &Path) {
        for name in ["cpu.max", "memory.max", "pids.max", "io.max", CGROUP_PROCS].iter() {
            File::create(dir.join(*name)).unwrap();
        }
    }

    #[test]
    fn test_apply_writes_limit_files() -> Result<()> {
        let tmp = create_temp_dir("test_apply_writes_limit_files")?;
        let path: PathBuf = tmp.join("pod");
        fs::create_dir_all(&path)?;
        seed_cgroup_files(&path);

        let limits = CgroupLimits {
            path: path.clone(),
            cpu_max: "50000 100000".to_string(),
            memory_max: "12M".to_string(),
            pids_max: "5".to_string(),
            io_max: String::new(),
        };
        apply(&limits, Pid::from_raw(42))?;

        assert_eq!(fs::read_to_string(path.join("cpu.max"))?, "50000 100000");
        assert_eq!(fs::read_to_string(path.join("memory.max"))?, "12M");
        assert_eq!(fs::read_to_string(path.join("pids.max"))?, "5");
        // empty io limit leaves the file untouched
        assert_eq!(fs::read_to_string(path.join("io.max"))?, "");
        assert_eq!(fs::read_to_string(path.join(CGROUP_PROCS))?, "42");
        Ok(())
    }

    #[test]
    fn test_apply_fails_outside_cgroupfs_shape() -> Result<()> {
        let tmp = create_temp_dir("test_apply_fails_outside_cgroupfs_shape")?;
        let path: PathBuf = tmp.join("pod");
        // limit files are not seeded: the writer refuses to create files,
        // matching real cgroupfs where the kernel owns the directory shape
        let limits = CgroupLimits {
            path,
            ..Default::default()
        };
        assert!(apply(&limits, Pid::from_raw(1)).is_err());
        Ok(())
    }
}
