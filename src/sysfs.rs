//! Block-device inventory from `/sys/class/block/*/uevent` (§6), used to
//! resolve `/dev/block/by-name/*` aliases to canonical `mmcblkNpM` paths.
//! Grounded on `lib/uevent.c` in the system this crate reimplements.

use std::path::Path;

const UEVENT_PATH_BLOCK_DEVICES: &str = "/sys/class/block";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Disk,
    Partition,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockUevent {
    pub major: i32,
    pub minor: i32,
    /// `PARTN=` from the uevent file, not to be confused with the
    /// `mmcblkNpM` partition number parsed out of `DEVNAME`.
    pub partn: Option<i32>,
    pub devname: Option<String>,
    pub partname: Option<String>,
    pub dev_type: Option<DeviceType>,
    pub mmc_device: Option<u32>,
    pub mmc_partition: Option<u32>,
}

fn parse_dev_type(value: &str) -> DeviceType {
    match value {
        "disk" => DeviceType::Disk,
        "partition" => DeviceType::Partition,
        _ => DeviceType::Unknown,
    }
}

/// Parses one `uevent` file's `KEY=value` lines.
fn parse_uevent_contents(contents: &str) -> BlockUevent {
    let mut event = BlockUevent::default();

    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "MAJOR" => event.major = value.parse().unwrap_or(-1),
            "MINOR" => event.minor = value.parse().unwrap_or(-1),
            "PARTN" => event.partn = value.parse().ok(),
            "DEVNAME" => event.devname = Some(value.to_string()),
            "PARTNAME" => event.partname = Some(value.to_string()),
            "DEVTYPE" => event.dev_type = Some(parse_dev_type(value)),
            _ => {}
        }
    }

    if let Some(devname) = &event.devname {
        if let Some((mmc_device, mmc_partition)) = parse_mmcblk_name(devname) {
            event.mmc_device = Some(mmc_device);
            event.mmc_partition = Some(mmc_partition);
        }
    }

    event
}

fn parse_mmcblk_name(devname: &str) -> Option<(u32, u32)> {
    let rest = devname.strip_prefix("mmcblk")?;
    let (dev, part) = rest.split_once('p')?;
    Some((dev.parse().ok()?, part.parse().ok()?))
}

pub fn enumerate_block_devices() -> std::io::Result<Vec<BlockUevent>> {
    let mut events = Vec::new();
    for entry in std::fs::read_dir(UEVENT_PATH_BLOCK_DEVICES)? {
        let entry = entry?;
        let uevent_path = entry.path().join("uevent");
        let Ok(contents) = std::fs::read_to_string(&uevent_path) else {
            continue;
        };
        events.push(parse_uevent_contents(&contents));
    }
    Ok(events)
}

/// Resolves a path, possibly a `by-name` alias, to the matching uevent entry.
pub fn find_for_path<'a>(events: &'a [BlockUevent], path: &Path) -> Option<&'a BlockUevent> {
    if path.to_string_lossy().contains("by-name") {
        let name = path.file_name()?.to_string_lossy();
        return events
            .iter()
            .find(|e| e.partname.as_deref() == Some(name.as_ref()));
    }

    let (mmc_device, mmc_partition) = parse_mmcblk_name(path.file_name()?.to_str()?)?;
    events
        .iter()
        .find(|e| e.mmc_device == Some(mmc_device) && e.mmc_partition == Some(mmc_partition))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uevent_fields() {
        let text = "MAJOR=179\nMINOR=12\nPARTN=12\nDEVNAME=mmcblk0p12\nPARTNAME=userdata\nDEVTYPE=partition\n";
        let event = parse_uevent_contents(text);
        assert_eq!(event.major, 179);
        assert_eq!(event.minor, 12);
        assert_eq!(event.partn, Some(12));
        assert_eq!(event.devname.as_deref(), Some("mmcblk0p12"));
        assert_eq!(event.partname.as_deref(), Some("userdata"));
        assert_eq!(event.dev_type, Some(DeviceType::Partition));
        assert_eq!(event.mmc_device, Some(0));
        assert_eq!(event.mmc_partition, Some(12));
    }

    #[test]
    fn finds_by_name_alias() {
        let events = vec![parse_uevent_contents(
            "MAJOR=179\nMINOR=12\nDEVNAME=mmcblk0p12\nPARTNAME=userdata\n",
        )];
        let found = find_for_path(&events, Path::new("/dev/block/by-name/userdata"));
        assert!(found.is_some());
        assert!(find_for_path(&events, Path::new("/dev/block/by-name/missing")).is_none());
    }

    #[test]
    fn finds_by_mmcblk_path() {
        let events = vec![parse_uevent_contents(
            "MAJOR=179\nMINOR=12\nDEVNAME=mmcblk0p12\n",
        )];
        let found = find_for_path(&events, Path::new("/dev/block/mmcblk0p12"));
        assert!(found.is_some());
    }
}
