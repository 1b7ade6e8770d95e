//! Target Registry (§3, §4.A). Holds the mapping from observed block device
//! identity to redirection policy.

use std::path::{Path, PathBuf};

use crate::error::{Result, SupervisorError};

/// Redirection policy for one Target, as a sum type rather than the
/// teacher's boolean-plus-overloaded-fields (§9: "Tagged redirection
/// policy").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPolicy {
    /// The partition is replaced by bind-mounting `source_dir` (a directory
    /// inside the slot). `stub_device` is a distinct loop-backed image used
    /// to satisfy path-arg `open`/`stat`/etc. so format detection remains
    /// possible on raw block-device access.
    BindMount {
        source_dir: PathBuf,
        stub_device: PathBuf,
    },
    /// The partition is replaced by a loopback-mounted raw image file;
    /// `loop_device` is used uniformly as both the mount-hook substitute and
    /// the path-arg substitute.
    LoopImage { loop_device: PathBuf },
}

impl TargetPolicy {
    /// The path substituted into path-arg syscalls (stat/open/chmod/...).
    pub fn path_arg_substitute(&self) -> &Path {
        match self {
            TargetPolicy::BindMount { stub_device, .. } => stub_device,
            TargetPolicy::LoopImage { loop_device } => loop_device,
        }
    }

    /// The path substituted as the `mount(2)` source device argument.
    pub fn mount_source_substitute(&self) -> &Path {
        match self {
            TargetPolicy::BindMount { source_dir, .. } => source_dir,
            TargetPolicy::LoopImage { loop_device } => loop_device,
        }
    }

    pub fn is_bind(&self) -> bool {
        matches!(self, TargetPolicy::BindMount { .. })
    }
}

/// Device identity: block-device path plus `st_rdev`, either of which may
/// match during lookup (§4.A: "Lookup matches by `stat().st_rdev` equality
/// first ... falling back to exact block-device string compare").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub blk_device: PathBuf,
    pub rdev: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    pub identity: DeviceIdentity,
    pub fs_type: String,
    pub policy: TargetPolicy,
    pub mount_point: PathBuf,
}

/// Ordered sequence of Target Entries. Frozen once the Supervisor reaches
/// `FstabLoaded`; lookups are simple linear scans afterwards (the table is
/// small — bounded by the number of multiboot-flagged fstab entries — so a
/// hash index would be premature).
#[derive(Debug, Default)]
pub struct TargetRegistry {
    entries: Vec<TargetEntry>,
    frozen: bool,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects duplicate registrations (same block device path); "first
    /// registered wins" for ambiguous rdev collisions is enforced by
    /// `lookup_by_devpath` scanning in registration order, not here.
    pub fn register(&mut self, entry: TargetEntry) -> Result<()> {
        if self.frozen {
            return Err(SupervisorError::StageTransition {
                reason: "registry is frozen".into(),
            });
        }
        if self
            .entries
            .iter()
            .any(|e| e.identity.blk_device == entry.identity.blk_device)
        {
            log::warn!(
                "duplicate target registration for {}, ignoring",
                entry.identity.blk_device.display()
            );
            return Err(SupervisorError::DuplicateTarget {
                path: entry.identity.blk_device,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Called once the registry is fully populated (Supervisor stage
    /// `FstabLoaded`). Mutations after this point are rejected.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `st_rdev` equality wins when `rdev` is `Some`; otherwise falls back to
    /// an exact path compare. Iterates in registration order so that, when
    /// two entries pathologically share an rdev, the first one registered is
    /// returned (§4.D open question, resolved).
    pub fn lookup_by_devpath(&self, path: &Path, rdev: Option<u64>) -> Option<&TargetEntry> {
        if let Some(rdev) = rdev {
            if let Some(found) = self
                .entries
                .iter()
                .find(|e| e.identity.rdev == Some(rdev))
            {
                return Some(found);
            }
        }
        self.entries
            .iter()
            .find(|e| e.identity.blk_device == path)
    }

    pub fn lookup_by_fstab_mount(&self, mount_point: &Path) -> Option<&TargetEntry> {
        self.entries.iter().find(|e| e.mount_point == mount_point)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, rdev: Option<u64>, mount: &str) -> TargetEntry {
        TargetEntry {
            identity: DeviceIdentity {
                blk_device: PathBuf::from(path),
                rdev,
            },
            fs_type: "ext4".into(),
            policy: TargetPolicy::LoopImage {
                loop_device: PathBuf::from("/dev/block/loop250"),
            },
            mount_point: PathBuf::from(mount),
        }
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let mut reg = TargetRegistry::new();
        let e = entry("/dev/block/mmcblk0p20", Some(42), "/data");
        reg.register(e.clone()).unwrap();
        let found = reg.lookup_by_devpath(&e.identity.blk_device, e.identity.rdev);
        assert_eq!(found, Some(&e));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = TargetRegistry::new();
        reg.register(entry("/dev/block/mmcblk0p20", None, "/data"))
            .unwrap();
        let err = reg
            .register(entry("/dev/block/mmcblk0p20", None, "/data2"))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateTarget { .. }));
    }

    #[test]
    fn first_registered_wins_on_rdev_collision() {
        let mut reg = TargetRegistry::new();
        reg.register(entry("/dev/block/mmcblk0p20", Some(7), "/data"))
            .unwrap();
        reg.register(entry("/dev/block/mmcblk0p21", Some(7), "/cache"))
            .unwrap();
        let found = reg
            .lookup_by_devpath(Path::new("/irrelevant"), Some(7))
            .unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/data"));
    }

    #[test]
    fn frozen_registry_rejects_further_registration() {
        let mut reg = TargetRegistry::new();
        reg.freeze();
        let err = reg
            .register(entry("/dev/block/mmcblk0p20", None, "/data"))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StageTransition { .. }));
    }

    #[test]
    fn bind_policy_path_arg_uses_stub_not_source_dir() {
        let policy = TargetPolicy::BindMount {
            source_dir: PathBuf::from("/mnt/slot/data"),
            stub_device: PathBuf::from("/dev/block/loop255"),
        };
        assert_eq!(policy.path_arg_substitute(), Path::new("/dev/block/loop255"));
        assert_eq!(policy.mount_source_substitute(), Path::new("/mnt/slot/data"));
    }
}
