use std::any::Any;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use anyhow::Result;
use caps::{errors::CapsError, CapSet, Capability, CapsHashSet};
use nix::mount::MsFlags;
use nix::sched::CloneFlags;

use super::{ForkResult, Syscall};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

#[derive(Default)]
pub struct TestHelperSyscall {
    set_ns_args: RefCell<Vec<(i32, CloneFlags)>>,
    unshare_args: RefCell<Vec<CloneFlags>>,
    set_capability_args: RefCell<Vec<(CapSet, CapsHashSet)>>,
    bounding_keep_args: RefCell<Vec<CapsHashSet>>,
    ambient_args: RefCell<Vec<Capability>>,
    mount_args: RefCell<Vec<MountArgs>>,
}

impl Syscall for TestHelperSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fork(&self) -> Result<ForkResult> {
        unimplemented!()
    }

    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        self.unshare_args.borrow_mut().push(flags);
        Ok(())
    }

    fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()> {
        self.set_ns_args.borrow_mut().push((rawfd, nstype));
        Ok(())
    }

    fn pivot_rootfs(&self, _path: &Path) -> Result<()> {
        unimplemented!()
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<(), CapsError> {
        self.set_capability_args
            .borrow_mut()
            .push((cset, value.clone()));
        Ok(())
    }

    fn drop_bounding_except(&self, keep: &CapsHashSet) -> Result<()> {
        self.bounding_keep_args.borrow_mut().push(keep.clone());
        Ok(())
    }

    fn enable_ambient(&self, cap: Capability) -> Result<()> {
        self.ambient_args.borrow_mut().push(cap);
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), nix::Error> {
        self.mount_args.borrow_mut().push(MountArgs {
            source: source.map(|p| p.to_owned()),
            target: target.to_owned(),
            fstype: fstype.map(|s| s.to_owned()),
            flags,
            data: data.map(|s| s.to_owned()),
        });
        Ok(())
    }
}

impl TestHelperSyscall {
    pub fn get_setns_args(&self) -> Vec<(i32, CloneFlags)> {
        self.set_ns_args.borrow_mut().clone()
    }

    pub fn get_unshare_args(&self) -> Vec<CloneFlags> {
        self.unshare_args.borrow_mut().clone()
    }

    pub fn get_set_capability_args(&self) -> Vec<(CapSet, CapsHashSet)> {
        self.set_capability_args.borrow_mut().clone()
    }

    pub fn get_bounding_keep_args(&self) -> Vec<CapsHashSet> {
        self.bounding_keep_args.borrow_mut().clone()
    }

    pub fn get_ambient_args(&self) -> Vec<Capability> {
        self.ambient_args.borrow_mut().clone()
    }

    pub fn get_mount_args(&self) -> Vec<MountArgs> {
        self.mount_args.borrow_mut().clone()
    }
}
