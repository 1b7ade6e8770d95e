//! Format Detector, ext-family (§4.F). Detects whether a target partition
//! was reformatted between open and close by snapshotting the ext2/3/4
//! superblock and comparing on close. Grounded on the original
//! implementation's direct superblock peek (`original_source`'s block-device
//! watcher reads the raw 1024-byte superblock rather than linking libext2fs),
//! reimplemented with `nix`'s `pread`.

use std::os::unix::io::RawFd;

use nix::sys::stat::fstat;
use nix::unistd::pread;

use crate::error::Result;

const SUPERBLOCK_OFFSET: i64 = 0x400;
const SUPERBLOCK_LEN: usize = 1024;
const EXT_MAGIC_OFFSET: usize = 0x38;
const EXT_MAGIC: u16 = 0xEF53;
const S_MKFS_TIME_OFFSET: usize = 0x108;
const S_LASTCHECK_OFFSET: usize = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockSnapshot {
    pub is_ext: bool,
    pub s_mkfs_time: u32,
    pub s_lastcheck: u32,
}

fn read_superblock(fd: RawFd) -> Result<[u8; SUPERBLOCK_LEN]> {
    let mut buf = [0u8; SUPERBLOCK_LEN];
    let mut read = 0;
    while read < SUPERBLOCK_LEN {
        let n = pread(fd, &mut buf[read..], SUPERBLOCK_OFFSET + read as i64)?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(buf)
}

fn parse_snapshot(buf: &[u8; SUPERBLOCK_LEN]) -> SuperblockSnapshot {
    let magic = u16::from_le_bytes([buf[EXT_MAGIC_OFFSET], buf[EXT_MAGIC_OFFSET + 1]]);
    let is_ext = magic == EXT_MAGIC;
    let read_u32 = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    SuperblockSnapshot {
        is_ext,
        s_mkfs_time: read_u32(S_MKFS_TIME_OFFSET),
        s_lastcheck: read_u32(S_LASTCHECK_OFFSET),
    }
}

/// Snapshots the superblock at `fd`'s current underlying device. Call on a
/// fresh `open`/`openat` that the Syscall Rewriter has just tracked.
pub fn pre(fd: RawFd) -> Result<SuperblockSnapshot> {
    let buf = read_superblock(fd)?;
    Ok(parse_snapshot(&buf))
}

/// Re-reads the superblock and decides whether the device was reformatted
/// since `snapshot` was taken (§4.F). Non-ext filesystems have "no opinion"
/// and are reported as not-formatted, with a warning — callers must not
/// treat that as a guarantee.
pub fn was_format(fd: RawFd, snapshot: &SuperblockSnapshot) -> Result<bool> {
    if !snapshot.is_ext {
        log::warn!("format detector has no opinion on non-ext filesystem; reporting not-formatted");
        return Ok(false);
    }
    let buf = read_superblock(fd)?;
    let now = parse_snapshot(&buf);
    if !now.is_ext {
        // fstype changed under us: that alone counts as "was formatted".
        return Ok(true);
    }
    Ok(now.s_mkfs_time > snapshot.s_mkfs_time || now.s_lastcheck < snapshot.s_lastcheck)
}

/// Releases any detector-held resources. The snapshot is plain data with no
/// external handle, so this is a no-op kept for symmetry with `pre`/the
/// teacher's acquire/release-shaped APIs, and as the one place a future
/// cached-fd optimization would need to hook in.
pub fn cleanup(_snapshot: SuperblockSnapshot) {}

pub fn stat_rdev(fd: RawFd) -> Result<u64> {
    let st = fstat(fd)?;
    Ok(st.st_rdev)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_buf(magic: u16, mkfs_time: u32, lastcheck: u32) -> [u8; SUPERBLOCK_LEN] {
        let mut buf = [0u8; SUPERBLOCK_LEN];
        buf[EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2].copy_from_slice(&magic.to_le_bytes());
        buf[S_MKFS_TIME_OFFSET..S_MKFS_TIME_OFFSET + 4].copy_from_slice(&mkfs_time.to_le_bytes());
        buf[S_LASTCHECK_OFFSET..S_LASTCHECK_OFFSET + 4].copy_from_slice(&lastcheck.to_le_bytes());
        buf
    }

    #[test]
    fn parses_ext_magic() {
        let buf = make_buf(EXT_MAGIC, 100, 200);
        let snap = parse_snapshot(&buf);
        assert!(snap.is_ext);
        assert_eq!(snap.s_mkfs_time, 100);
        assert_eq!(snap.s_lastcheck, 200);
    }

    #[test]
    fn non_ext_magic_is_not_ext() {
        let buf = make_buf(0x1234, 0, 0);
        assert!(!parse_snapshot(&buf).is_ext);
    }

    #[test]
    fn newer_mkfs_time_means_reformatted() {
        let before = parse_snapshot(&make_buf(EXT_MAGIC, 100, 500));
        let after = parse_snapshot(&make_buf(EXT_MAGIC, 101, 500));
        assert!(after.s_mkfs_time > before.s_mkfs_time);
    }

    #[test]
    fn earlier_lastcheck_means_reformatted() {
        let before = parse_snapshot(&make_buf(EXT_MAGIC, 100, 500));
        let after = parse_snapshot(&make_buf(EXT_MAGIC, 100, 499));
        assert!(after.s_lastcheck < before.s_lastcheck);
    }
}
