//! In-process [`Host`] used by tests.
//!
//! Loop devices are plain files in a `dev` directory. Filesystems are
//! directories in a `store` directory, copied into the mount point on mount and
//! back on unmount. Partition geometry is read from the real GPT of the image.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::directory::Directory;
use super::error::{DiskError, Result};
use super::filesystem::{percent_used, FsKind};
use super::gpt;
use super::host::Host;
use super::loopdev::LoopDev;
use super::mount::UnmountStrategy;

const INJECTED: &str = "injected failure";

struct FakeFs {
    kind: FsKind,
    size: u64,
    content: PathBuf,
}

#[derive(Default)]
struct State {
    next_loop: u32,
    /// Loop device -> image file.
    attached: BTreeMap<PathBuf, PathBuf>,
    /// Mount point -> (device, filesystem key).
    mounts: BTreeMap<PathBuf, (PathBuf, String)>,
    filesystems: HashMap<String, FakeFs>,
    ops: Vec<&'static str>,
    failures: HashMap<&'static str, u32>,
    strategies: Vec<UnmountStrategy>,
    usage: Option<u8>,
}

pub struct FakeHost {
    root: PathBuf,
    dev: PathBuf,
    store: PathBuf,
    state: RefCell<State>,
}

fn fs_key(image: &Path, n: u32) -> String {
    format!("{}#{}", image.display(), n)
}

fn partition_size(image: &Path, n: u32) -> Option<u64> {
    let layout = gpt::read_layout(image).ok()?;
    match n {
        1 => Some(layout.esp.size()),
        2 => Some(layout.root.size()),
        _ => None,
    }
}

impl FakeHost {
    pub fn new(root: &Path) -> Self {
        let dev = root.join("dev");
        let store = root.join("store");
        fs::create_dir_all(&dev).unwrap();
        fs::create_dir_all(&store).unwrap();
        Self {
            root: root.to_path_buf(),
            dev,
            store,
            state: RefCell::new(State::default()),
        }
    }

    /// Create 1 MiB zero-filled file.
    pub fn blank_image(&self, name: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::File::create(&path).unwrap().set_len(1 << 20).unwrap();
        path
    }

    /// Currently attached loop devices.
    pub fn attached(&self) -> Vec<PathBuf> {
        self.state.borrow().attached.keys().cloned().collect()
    }

    /// Current mount points.
    pub fn mounts(&self) -> Vec<PathBuf> {
        self.state.borrow().mounts.keys().cloned().collect()
    }

    /// Number of calls of operation, failed ones included.
    pub fn count(&self, op: &str) -> usize {
        self.state
            .borrow()
            .ops
            .iter()
            .filter(|recorded| **recorded == op)
            .count()
    }

    pub fn fail_once(&self, op: &'static str) {
        self.fail_times(op, 1);
    }

    /// Make next `times` calls of operation fail.
    pub fn fail_times(&self, op: &'static str, times: u32) {
        self.state.borrow_mut().failures.insert(op, times);
    }

    /// Strategies of all unmount attempts so far.
    pub fn unmount_strategies(&self) -> Vec<UnmountStrategy> {
        self.state.borrow().strategies.clone()
    }

    /// Report fixed usage instead of measuring content.
    pub fn set_usage(&self, usage: Option<u8>) {
        self.state.borrow_mut().usage = usage;
    }

    /// Directory holding content of partition `n` of the image.
    pub fn content(&self, image: &Path, n: u32) -> Option<PathBuf> {
        self.state
            .borrow()
            .filesystems
            .get(&fs_key(image, n))
            .map(|fs| fs.content.clone())
    }

    /// Record call. Returns `true` if the call must fail.
    fn record(&self, op: &'static str) -> bool {
        let mut state = self.state.borrow_mut();
        state.ops.push(op);
        match state.failures.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    /// Find image and partition number of attached partition device.
    fn partition(&self, device: &Path) -> Option<(PathBuf, u32)> {
        let state = self.state.borrow();
        state.attached.iter().find_map(|(loopdev, image)| {
            let loopdev = LoopDev::new(loopdev);
            (1..=2)
                .find(|n| loopdev.part(*n) == device)
                .map(|n| (image.clone(), n))
        })
    }

    fn new_content_dir(&self) -> PathBuf {
        let state = self.state.borrow();
        let path = self.store.join(format!("fs{}", state.filesystems.len()));
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn create_nodes(&self, loopdev: &LoopDev, image: &Path) -> Result<()> {
        if gpt::read_layout(image).is_ok() {
            for n in 1..=2 {
                let part = loopdev.part(n);
                fs::write(&part, b"").map_err(DiskError::io("create", &part))?;
            }
        }
        Ok(())
    }
}

impl Host for FakeHost {
    fn attach(&self, image: &Path) -> Result<LoopDev> {
        let attach_err = |message: &str| DiskError::DeviceAllocationFailed {
            action: "attach",
            resource: image.to_path_buf(),
            message: message.to_string(),
        };
        if self.record("attach") {
            return Err(attach_err(INJECTED));
        }
        if !image.is_file() {
            return Err(attach_err("no such file"));
        }
        let loopdev = {
            let mut state = self.state.borrow_mut();
            let loopdev = LoopDev::new(self.dev.join(format!("loop{}", state.next_loop)));
            state.next_loop += 1;
            state
                .attached
                .insert(loopdev.path().to_path_buf(), image.to_path_buf());
            loopdev
        };
        fs::write(loopdev.path(), b"").map_err(DiskError::io("create", loopdev.path()))?;
        self.create_nodes(&loopdev, image)?;
        Ok(loopdev)
    }

    fn detach(&self, loopdev: &LoopDev) -> Result<()> {
        if self.record("detach") {
            return Err(DiskError::DeviceAllocationFailed {
                action: "detach",
                resource: loopdev.path().to_path_buf(),
                message: INJECTED.to_string(),
            });
        }
        self.state.borrow_mut().attached.remove(loopdev.path());
        for node in [loopdev.path().to_path_buf(), loopdev.part(1), loopdev.part(2)] {
            let _ = fs::remove_file(node);
        }
        Ok(())
    }

    fn reread_partitions(&self, loopdev: &LoopDev) -> Result<()> {
        let reread_err = |message: &str| DiskError::PartitionToolError {
            action: "re-read partitions of",
            resource: loopdev.path().to_path_buf(),
            message: message.to_string(),
        };
        if self.record("reread") {
            return Err(reread_err(INJECTED));
        }
        let image = self.state.borrow().attached.get(loopdev.path()).cloned();
        let image = image.ok_or_else(|| reread_err("not attached"))?;
        self.create_nodes(loopdev, &image)
    }

    fn mount(&self, device: &Path, mountpoint: &Path, kind: FsKind) -> Result<()> {
        let mount_err = |message: &str| DiskError::MountFailed {
            action: "mount",
            resource: device.to_path_buf(),
            message: message.to_string(),
        };
        if self.record("mount") {
            return Err(mount_err(INJECTED));
        }
        if !mountpoint.is_dir() {
            return Err(mount_err("mount point does not exist"));
        }
        let key = match self.partition(device) {
            Some((image, n)) => {
                let key = fs_key(&image, n);
                match self.state.borrow().filesystems.get(&key) {
                    Some(fs) if fs.kind == kind => {}
                    _ => return Err(mount_err("wrong fs type, bad superblock")),
                }
                key
            }
            None if device.starts_with(&self.dev) => {
                return Err(mount_err("special device does not exist"))
            }
            None => {
                let key = device.display().to_string();
                if !self.state.borrow().filesystems.contains_key(&key) {
                    let content = self.new_content_dir();
                    self.state.borrow_mut().filesystems.insert(
                        key.clone(),
                        FakeFs {
                            kind,
                            size: 0,
                            content,
                        },
                    );
                }
                key
            }
        };
        let content = self.state.borrow().filesystems[&key].content.clone();
        Directory::from_path(&content)?.copy_content(mountpoint)?;
        self.state
            .borrow_mut()
            .mounts
            .insert(mountpoint.to_path_buf(), (device.to_path_buf(), key));
        Ok(())
    }

    fn umount(&self, mountpoint: &Path, strategy: UnmountStrategy) -> Result<()> {
        let umount_err = |message: &str| DiskError::MountFailed {
            action: "unmount",
            resource: mountpoint.to_path_buf(),
            message: message.to_string(),
        };
        self.state.borrow_mut().strategies.push(strategy);
        if self.record("umount") {
            return Err(umount_err("target is busy"));
        }
        let mounted = self.state.borrow_mut().mounts.remove(mountpoint);
        let (_, key) = mounted.ok_or_else(|| umount_err("not mounted"))?;
        let content = self.state.borrow().filesystems[&key].content.clone();

        let store = Directory::from_path(&content)?;
        store.clear()?;
        let mounted = Directory::from_path(mountpoint)?;
        mounted.copy_content(&content)?;
        mounted.clear()
    }

    fn mounted_device(&self, mountpoint: &Path) -> Result<Option<PathBuf>> {
        Ok(self
            .state
            .borrow()
            .mounts
            .get(mountpoint)
            .map(|(device, _)| device.clone()))
    }

    fn sync(&self) {
        self.record("sync");
    }

    fn settle(&self, _delay: Duration) {
        self.record("settle");
    }

    fn format(&self, device: &Path, kind: FsKind) -> Result<()> {
        let format_err = |message: &str| DiskError::PartitionToolError {
            action: "format",
            resource: device.to_path_buf(),
            message: message.to_string(),
        };
        if self.record("format") {
            return Err(format_err(INJECTED));
        }
        let (image, n) = self
            .partition(device)
            .ok_or_else(|| format_err("no such device"))?;
        let size = partition_size(&image, n).ok_or_else(|| format_err("no such partition"))?;
        let key = fs_key(&image, n);

        let existing = self
            .state
            .borrow()
            .filesystems
            .get(&key)
            .map(|fs| fs.content.clone());
        let content = match existing {
            Some(content) => {
                Directory::from_path(&content)?.clear()?;
                content
            }
            None => self.new_content_dir(),
        };
        self.state
            .borrow_mut()
            .filesystems
            .insert(key, FakeFs { kind, size, content });
        Ok(())
    }

    fn check(&self, device: &Path, kind: FsKind) -> Result<()> {
        let check_err = |message: &str| DiskError::IntegrityCheckInconclusive {
            resource: device.to_path_buf(),
            message: message.to_string(),
        };
        if self.record("check") {
            return Err(check_err(INJECTED));
        }
        let (image, n) = self
            .partition(device)
            .ok_or_else(|| check_err("no such device"))?;
        match self.state.borrow().filesystems.get(&fs_key(&image, n)) {
            Some(fs) if fs.kind == kind => Ok(()),
            _ => Err(check_err("bad superblock")),
        }
    }

    fn grow(&self, device: &Path) -> Result<()> {
        let grow_err = |message: &str| DiskError::GrowthFailed {
            action: "grow filesystem on",
            resource: device.to_path_buf(),
            message: message.to_string(),
        };
        if self.record("grow") {
            return Err(grow_err(INJECTED));
        }
        if self
            .state
            .borrow()
            .mounts
            .values()
            .any(|(mounted, _)| mounted == device)
        {
            return Err(grow_err("filesystem is mounted"));
        }
        let (image, n) = self
            .partition(device)
            .ok_or_else(|| grow_err("no such device"))?;
        let size = partition_size(&image, n).ok_or_else(|| grow_err("no such partition"))?;

        let mut state = self.state.borrow_mut();
        let fs = state
            .filesystems
            .get_mut(&fs_key(&image, n))
            .filter(|fs| fs.kind == FsKind::Ext4)
            .ok_or_else(|| grow_err("bad superblock"))?;
        if size < fs.size {
            return Err(grow_err("new size is smaller than filesystem"));
        }
        fs.size = size;
        Ok(())
    }

    fn usage(&self, mountpoint: &Path) -> Result<u8> {
        self.record("usage");
        let state = self.state.borrow();
        if let Some(usage) = state.usage {
            return Ok(usage);
        }
        let (_, key) = state.mounts.get(mountpoint).ok_or_else(|| {
            DiskError::io("measure usage of", mountpoint)(std::io::Error::other("not mounted"))
        })?;
        let total = state.filesystems[key].size;
        let free = total.saturating_sub(Directory::from_path(mountpoint)?.size()?);
        Ok(percent_used(total, free, free))
    }
}
