//! fstab parsing (§6). Supports both the standard Android fs_mgr form and the
//! TWRP variant, as consumed by `src/modules/fstab_patcher.c` /
//! `lib/fs_mgr/fs_mgr.c` in the system this crate reimplements.

use std::path::{Path, PathBuf};

use bitflags::bitflags;

bitflags! {
    /// Only `WAIT`, `CHECK` and `MULTIBOOT` are consumed by the redirection
    /// core (§6); the remaining standard flags (`voldmanaged=`, `length=`,
    /// `encryptable=`, `swapprio=`, `zramsize=`, `verify`, `noemulatedsd`,
    /// `recoveryonly`, `nonremovable`) are parsed into `raw_fs_mgr_flags` for
    /// round-tripping and are otherwise inert here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsMgrFlags: u32 {
        const WAIT      = 1 << 0;
        const CHECK     = 1 << 1;
        const MULTIBOOT = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabRecord {
    pub blk_device: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub fs_options: String,
    pub fs_mgr_flags: FsMgrFlags,
    /// Verbatim fs_mgr_flags column, preserved so a patched fstab can be
    /// re-emitted without losing flags the core doesn't interpret.
    pub raw_fs_mgr_flags: String,
    pub twrp: bool,
}

impl FstabRecord {
    pub fn is_multiboot(&self) -> bool {
        self.fs_mgr_flags.contains(FsMgrFlags::MULTIBOOT)
    }
}

fn parse_flags(raw: &str) -> FsMgrFlags {
    let mut flags = FsMgrFlags::empty();
    for entry in raw.split(',') {
        match entry {
            "wait" => flags |= FsMgrFlags::WAIT,
            "check" => flags |= FsMgrFlags::CHECK,
            "multiboot" => flags |= FsMgrFlags::MULTIBOOT,
            _ => {}
        }
    }
    flags
}

fn looks_like_device(column: &str) -> bool {
    column.starts_with("/dev/") || column.starts_with("/emmc")
}

/// Parses one non-comment, non-blank line. Returns `None` (with a warning
/// logged) if the record doesn't fit either known column layout.
fn parse_line(line: &str) -> Option<FstabRecord> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 5 {
        log::warn!("fstab: skipping malformed line: {line:?}");
        return None;
    }

    let (blk_device, mount_point, fs_type, fs_options, fs_mgr_flags, twrp) =
        if looks_like_device(cols[0]) {
            (cols[0], cols[1], cols[2], cols[3], cols[4], false)
        } else if cols.len() >= 5 && looks_like_device(cols[2]) {
            (cols[2], cols[0], cols[1], cols[3], cols[4], true)
        } else {
            log::warn!("fstab: couldn't locate block device column in: {line:?}");
            return None;
        };

    Some(FstabRecord {
        blk_device: PathBuf::from(blk_device),
        mount_point: PathBuf::from(mount_point),
        fs_type: fs_type.to_string(),
        fs_options: fs_options.to_string(),
        fs_mgr_flags: parse_flags(fs_mgr_flags),
        raw_fs_mgr_flags: fs_mgr_flags.to_string(),
        twrp,
    })
}

pub fn parse_fstab(contents: &str) -> Vec<FstabRecord> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_line)
        .collect()
}

pub fn read_fstab(path: &Path) -> std::io::Result<Vec<FstabRecord>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_fstab(&contents))
}

pub fn find_entry_for_mount_point<'a>(
    records: &'a [FstabRecord],
    mount_point: &Path,
) -> Option<&'a FstabRecord> {
    records.iter().find(|r| r.mount_point == mount_point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_form() {
        let text = "\
            # comment\n\
            /dev/block/mmcblk0p12 /data ext4 noatime multiboot,wait\n\
            \n\
            /dev/block/mmcblk0p20 /cache ext4 noatime check\n";
        let recs = parse_fstab(text);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].blk_device, PathBuf::from("/dev/block/mmcblk0p12"));
        assert_eq!(recs[0].mount_point, PathBuf::from("/data"));
        assert!(recs[0].is_multiboot());
        assert!(recs[0].fs_mgr_flags.contains(FsMgrFlags::WAIT));
        assert!(!recs[0].twrp);

        assert!(!recs[1].is_multiboot());
        assert!(recs[1].fs_mgr_flags.contains(FsMgrFlags::CHECK));
    }

    #[test]
    fn parses_twrp_form() {
        let text = "/data ext4 /dev/block/mmcblk0p12 defaults multiboot\n";
        let recs = parse_fstab(text);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].twrp);
        assert_eq!(recs[0].blk_device, PathBuf::from("/dev/block/mmcblk0p12"));
        assert_eq!(recs[0].mount_point, PathBuf::from("/data"));
        assert!(recs[0].is_multiboot());
    }

    #[test]
    fn skips_unrecognizable_lines() {
        let text = "garbage line with no device column here\n\
            /dev/block/mmcblk0p12 /data ext4 noatime multiboot\n";
        let recs = parse_fstab(text);
        assert_eq!(recs.len(), 1);
    }

    #[test]
    fn preserves_unconsumed_flags_verbatim() {
        let text = "/dev/block/mmcblk0p21 /system ext4 noatime voldmanaged=sdcard:auto\n";
        let recs = parse_fstab(text);
        assert_eq!(recs[0].raw_fs_mgr_flags, "voldmanaged=sdcard:auto");
        assert!(!recs[0].is_multiboot());
    }

    #[test]
    fn find_by_mount_point() {
        let text = "/dev/block/mmcblk0p12 /data ext4 noatime multiboot\n";
        let recs = parse_fstab(text);
        let found = find_entry_for_mount_point(&recs, Path::new("/data"));
        assert!(found.is_some());
        assert!(find_entry_for_mount_point(&recs, Path::new("/missing")).is_none());
    }
}
