//! Rootfs staging and the container-side filesystem view. The rootfs is a
//! flat directory on the host; we stage a busybox userland into it, bind a
//! few host device nodes and later pivot into it inside the new mount
//! namespace.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::{Context, Result};
use nix::mount::MsFlags;

use crate::container::FsConfig;
use crate::syscall::Syscall;

const BUSYBOX_HOST_PATH: &str = "/bin/busybox";
const BUSYBOX_APPLETS: [&str; 5] = ["sh", "ls", "nc", "ip", "ping"];
const BIND_DEVICES: [&str; 3] = ["null", "zero", "urandom"];

/// Stages the rootfs contents before the pivot: busybox plus applet
/// symlinks under bin/, and the host device nodes bound under dev/.
/// Runs in the workload child, inside the new mount namespace.
pub fn prepare_rootfs(cfg: &FsConfig, syscall: &dyn Syscall) -> Result<()> {
    let bin_dir = cfg.rootfs.join("bin");
    fs::create_dir_all(&bin_dir)
        .with_context(|| format!("failed to create {:?}", bin_dir))?;

    let busybox = bin_dir.join("busybox");
    if !busybox.exists() {
        fs::copy(BUSYBOX_HOST_PATH, &busybox)
            .with_context(|| format!("failed to stage busybox into {:?}", busybox))?;
    }
    for applet in BUSYBOX_APPLETS.iter() {
        let target = bin_dir.join(*applet);
        let _ = fs::remove_file(&target);
        symlink("busybox", &target)
            .with_context(|| format!("failed to link applet {:?}", target))?;
    }

    if cfg.dev {
        let dev_dir = cfg.rootfs.join("dev");
        fs::create_dir_all(&dev_dir)
            .with_context(|| format!("failed to create {:?}", dev_dir))?;
        for dev in BIND_DEVICES.iter() {
            let target = dev_dir.join(*dev);
            OpenOptions::new()
                .create(true)
                .write(true)
                .open(&target)
                .with_context(|| format!("failed to create bind target {:?}", target))?;
            let source = format!("/dev/{}", dev);
            syscall
                .mount(
                    Some(Path::new(&source)),
                    &target,
                    None,
                    MsFlags::MS_BIND,
                    None,
                )
                .with_context(|| format!("failed to bind /dev/{}", dev))?;
        }
    }

    Ok(())
}

/// Mounts the virtual filesystems after the pivot. `/` here is already the
/// container rootfs.
pub fn mount_virtual_fs(cfg: &FsConfig, syscall: &dyn Syscall) -> Result<()> {
    for dir in ["/proc", "/sys"].iter() {
        fs::create_dir_all(*dir).with_context(|| format!("failed to create {}", dir))?;
    }

    if cfg.proc {
        syscall
            .mount(
                None,
                Path::new("/proc"),
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                None,
            )
            .context("failed to mount /proc")?;
    }

    if cfg.sys {
        syscall
            .mount(
                None,
                Path::new("/sys"),
                Some("sysfs"),
                MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                None,
            )
            .context("failed to mount /sys")?;
    }

    if cfg.use_tmpfs {
        for dir in ["/tmp", "/run", "/var"].iter() {
            fs::create_dir_all(*dir).with_context(|| format!("failed to create {}", dir))?;
            syscall
                .mount(
                    None,
                    Path::new(*dir),
                    Some("tmpfs"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    Some("size=64M"),
                )
                .with_context(|| format!("failed to mount tmpfs on {}", dir))?;
        }
    }

    if cfg.read_only {
        syscall
            .mount(
                None,
                Path::new("/"),
                None,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None,
            )
            .context("failed to remount rootfs read-only")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn test_mount_virtual_fs_default() -> Result<()> {
        let syscall = TestHelperSyscall::default();
        let cfg = FsConfig::default();
        mount_virtual_fs(&cfg, &syscall)?;

        let mounts = syscall.get_mount_args();
        let targets: Vec<_> = mounts
            .iter()
            .map(|m| m.target.to_string_lossy().to_string())
            .collect();
        assert_eq!(targets, vec!["/proc", "/sys", "/tmp", "/run", "/var"]);
        assert_eq!(mounts[0].fstype.as_deref(), Some("proc"));
        assert_eq!(mounts[1].fstype.as_deref(), Some("sysfs"));
        assert!(mounts[1].flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(mounts[2].data.as_deref(), Some("size=64M"));
        Ok(())
    }

    #[test]
    fn test_mount_virtual_fs_read_only_remounts_root() -> Result<()> {
        let syscall = TestHelperSyscall::default();
        let cfg = FsConfig {
            read_only: true,
            proc: false,
            sys: false,
            use_tmpfs: false,
            ..Default::default()
        };
        mount_virtual_fs(&cfg, &syscall)?;

        let mounts = syscall.get_mount_args();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target, Path::new("/"));
        assert!(mounts[0]
            .flags
            .contains(MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY));
        Ok(())
    }
}
