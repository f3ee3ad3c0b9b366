//! Block devices: the model of disks and partitions an installation
//! targets, discovery of the devices present on the host, and the
//! operations that turn the model into partitions, filesystems and mounts.

use std::fmt::Display;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use installer_utils::CommandRunner;
use serde::{Deserialize, Serialize};

mod filesystem;
pub use filesystem::*;
mod provision;
pub use provision::*;
mod size;
pub use size::*;

/// Errors raised by block device operations.
#[derive(Debug, thiserror::Error)]
pub enum BlockdevError {
    /// No vfat partition is mounted at `/boot`.
    #[error("Could not find a suitable EFI partition")]
    NoEfiPartition,
    /// No partition is mounted at `/`.
    #[error("Could not find a root partition")]
    NoRootPartition,
    /// There is no handler for the filesystem.
    #[error("Unsupported filesystem: {0:?}")]
    UnsupportedFilesystem(String),
    /// No GPT partition type applies to the partition.
    #[error("Could not determine the partition type GUID for {0}")]
    UnknownGuid(String),
    /// The operation does not apply to this kind of device.
    #[error("{name} is of type {found}, expected {expected}")]
    WrongDeviceType {
        /// The device
        name: String,
        /// What it is
        found: BlockDeviceType,
        /// What the operation needs
        expected: &'static str,
    },
    /// The operation is only defined for disks.
    #[error("{0} is not a disk")]
    NotADisk(String),
    /// A partition device node did not show up after re-reading the
    /// partition table.
    #[error("Device node {0} did not appear within {1:?}")]
    DeviceNotReady(Utf8PathBuf, Duration),
}

/// The kind of a block device, as reported by `lsblk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockDeviceType {
    /// A whole disk.
    Disk,
    /// A partition of a disk.
    Partition,
    /// A read-only optical device.
    Rom,
    /// An LVM2 physical volume.
    Lvm2Group,
    /// An LVM2 logical volume.
    Lvm2Volume,
    /// A loopback device.
    Loop,
    /// Anything else.
    #[default]
    Unknown,
}

impl BlockDeviceType {
    /// The `lsblk` spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            BlockDeviceType::Disk => "disk",
            BlockDeviceType::Partition => "part",
            BlockDeviceType::Rom => "rom",
            BlockDeviceType::Lvm2Group => "LVM2_member",
            BlockDeviceType::Lvm2Volume => "lvm",
            BlockDeviceType::Loop => "loop",
            BlockDeviceType::Unknown => "",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "disk" => BlockDeviceType::Disk,
            "part" => BlockDeviceType::Partition,
            "rom" => BlockDeviceType::Rom,
            "LVM2_member" => BlockDeviceType::Lvm2Group,
            "lvm" => BlockDeviceType::Lvm2Volume,
            "loop" => BlockDeviceType::Loop,
            o => {
                if !o.is_empty() {
                    tracing::debug!("Unhandled block device type {o}");
                }
                BlockDeviceType::Unknown
            }
        }
    }
}

impl Display for BlockDeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDeviceType::Unknown => f.write_str("unknown"),
            o => f.write_str(o.as_str()),
        }
    }
}

/// The state of a block device, as reported by `lsblk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockDeviceState {
    /// Not reported, or not recognized.
    #[default]
    Unknown,
    /// Running
    Running,
    /// Live
    Live,
}

impl BlockDeviceState {
    /// The `lsblk` spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            BlockDeviceState::Unknown => "",
            BlockDeviceState::Running => "running",
            BlockDeviceState::Live => "live",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => BlockDeviceState::Running,
            "live" => BlockDeviceState::Live,
            _ => BlockDeviceState::Unknown,
        }
    }
}

/// A disk or one of its partitions.
///
/// A disk owns its partitions in `children`; operations which need a
/// partition's parent (such as how far it may grow) are methods on the
/// disk taking the partition's index.
///
/// This deserializes from both `lsblk --json` output and the install
/// descriptor, and serializes to the descriptor format.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawBlockDevice", into = "RawBlockDevice")]
pub struct BlockDevice {
    /// Device node name, e.g. `sda1`.
    pub name: String,
    /// Hardware model.
    pub model: String,
    /// `major:minor` device number.
    pub major_minor: String,
    /// Filesystem type.
    pub fstype: String,
    /// Filesystem UUID.
    pub uuid: String,
    /// Where it is, or will be, mounted.
    pub mountpoint: String,
    /// Size in bytes.
    pub size: u64,
    /// What kind of device this is.
    pub device_type: BlockDeviceType,
    /// Device state.
    pub state: BlockDeviceState,
    /// Read-only device.
    pub read_only: bool,
    /// Removable device.
    pub removable: bool,
    /// Whether this came from the user rather than from probing the host.
    pub user_defined: bool,
    /// Whether the host is not using this device.
    pub available: bool,
    /// Partitions, in partition table order.
    pub children: Vec<BlockDevice>,
}

/// Why a requested partition size was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSize {
    /// The text is not a size.
    #[error("Invalid size, may only be suffixed by: B, K, M, G, T or P")]
    Syntax,
    /// The text looks like a size but its number does not parse.
    #[error("Invalid size")]
    Unparseable,
    /// Below [`MINIMUM_PARTITION_SIZE`].
    #[error("Size too small")]
    TooSmall,
    /// The disk's free space is not known.
    #[error("Unknown free space")]
    UnknownFreeSpace,
    /// Larger than the partition could grow.
    #[error("Size too large")]
    TooLarge,
}

const BOOT_SIZE: u64 = 150 << 20;
const SWAP_SIZE: u64 = 2 << 30;

impl BlockDevice {
    /// Append a partition. An unnamed partition is named after the disk
    /// and its position, with a `p` separator when the disk name ends in
    /// a digit (`nvme0n1p2`, `loop0p1`).
    pub fn add_child(&mut self, mut child: BlockDevice) -> &mut BlockDevice {
        if child.name.is_empty() {
            let sep = if self.device_type == BlockDeviceType::Loop
                || self.name.ends_with(|c: char| c.is_ascii_digit())
            {
                "p"
            } else {
                ""
            };
            child.name = format!("{}{sep}{}", self.name, self.children.len() + 1);
        }
        self.children.push(child);
        let idx = self.children.len() - 1;
        &mut self.children[idx]
    }

    /// Remove and return the partition at `index`.
    pub fn remove_child(&mut self, index: usize) -> Option<BlockDevice> {
        (index < self.children.len()).then(|| self.children.remove(index))
    }

    /// Check that the partitions make an installable system: a vfat
    /// `/boot` and a `/`.
    pub fn validate(&self) -> Result<(), BlockdevError> {
        if !self
            .children
            .iter()
            .any(|c| c.fstype == "vfat" && c.mountpoint == "/boot")
        {
            return Err(BlockdevError::NoEfiPartition);
        }
        if !self.children.iter().any(|c| c.mountpoint == "/") {
            return Err(BlockdevError::NoRootPartition);
        }
        Ok(())
    }

    /// Space on a disk not claimed by any partition.
    pub fn free_space(&self) -> Result<u64, BlockdevError> {
        if self.device_type != BlockDeviceType::Disk {
            return Err(BlockdevError::NotADisk(self.name.clone()));
        }
        let used: u64 = self.children.iter().map(|c| c.size).sum();
        Ok(self.size.saturating_sub(used))
    }

    /// The largest the partition at `index` could be: its size plus the
    /// disk's free space. Zero when that is unknown.
    pub fn max_partition_size(&self, index: usize) -> u64 {
        match (self.children.get(index), self.free_space()) {
            (Some(child), Ok(free)) => child.size + free,
            _ => 0,
        }
    }

    /// Check `text` as the new size of the partition at `index`, returning
    /// the size in bytes.
    pub fn is_valid_size(&self, index: usize, text: &str) -> Result<u64, InvalidSize> {
        if !is_size_syntax(text) {
            return Err(InvalidSize::Syntax);
        }
        let size = parse_size(text).map_err(|_| InvalidSize::Unparseable)?;
        if size < MINIMUM_PARTITION_SIZE {
            return Err(InvalidSize::TooSmall);
        }
        match self.max_partition_size(index) {
            0 => Err(InvalidSize::UnknownFreeSpace),
            max if size > max => Err(InvalidSize::TooLarge),
            _ => Ok(size),
        }
    }

    /// Whether `other` is the same physical device: same name, model and
    /// device number.
    pub fn is_same_device(&self, other: &BlockDevice) -> bool {
        self.name == other.name
            && self.model == other.model
            && self.major_minor == other.major_minor
    }

    /// Replace the partitions with the default layout: a 150MiB EFI
    /// `/boot`, 2GiB of swap and the rest as an ext4 `/`.
    pub fn new_standard_partitions(&mut self) {
        self.children.clear();
        let root_size = self.size.saturating_sub(BOOT_SIZE + SWAP_SIZE);
        for (size, fstype, mountpoint) in [
            (BOOT_SIZE, "vfat", "/boot"),
            (SWAP_SIZE, "swap", ""),
            (root_size, "ext4", "/"),
        ] {
            self.add_child(BlockDevice {
                size,
                fstype: fstype.into(),
                mountpoint: mountpoint.into(),
                device_type: BlockDeviceType::Partition,
                user_defined: true,
                ..Default::default()
            });
        }
    }

    /// The size formatted for humans.
    pub fn human_size(&self) -> String {
        format_size(self.size, None, None)
    }

    fn has_mounted_descendant(&self) -> bool {
        self.children
            .iter()
            .any(|c| !c.mountpoint.is_empty() || c.has_mounted_descendant())
    }

    fn mark_discovered(&mut self) {
        self.user_defined = false;
        for c in self.children.iter_mut() {
            c.mark_discovered();
        }
    }
}

/// A size which may be given as a byte count or as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

/// `lsblk` has reported flags as `"0"`/`"1"`, as `0`/`1` and as booleans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Bool(bool),
    Int(u8),
    Text(String),
}

impl RawFlag {
    fn value(&self) -> Result<bool> {
        match self {
            RawFlag::Bool(b) => Ok(*b),
            RawFlag::Int(i) => Ok(*i != 0),
            RawFlag::Text(s) => match s.as_str() {
                "" | "0" | "false" => Ok(false),
                "1" | "true" => Ok(true),
                o => anyhow::bail!("Invalid flag value {o:?}"),
            },
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawBlockDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(
        default,
        rename = "majMin",
        alias = "maj:min",
        skip_serializing_if = "Option::is_none"
    )]
    maj_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fstype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mountpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<RawSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ro: Option<RawFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rm: Option<RawFlag>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    children: Option<Vec<BlockDevice>>,
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

impl TryFrom<RawBlockDevice> for BlockDevice {
    type Error = anyhow::Error;

    fn try_from(raw: RawBlockDevice) -> Result<Self> {
        let name = raw.name.unwrap_or_default();
        let size = match raw.size {
            None => 0,
            Some(RawSize::Bytes(n)) => n,
            Some(RawSize::Text(s)) => {
                parse_size(&s).with_context(|| format!("Parsing size of device {name}"))?
            }
        };
        let flag = |f: Option<RawFlag>| {
            f.map(|f| f.value())
                .transpose()
                .map(|v| v.unwrap_or_default())
        };
        Ok(BlockDevice {
            model: raw.model.unwrap_or_default().trim().to_owned(),
            major_minor: raw.maj_min.unwrap_or_default(),
            fstype: raw.fstype.unwrap_or_default(),
            uuid: raw.uuid.unwrap_or_default(),
            mountpoint: raw.mountpoint.unwrap_or_default(),
            size,
            device_type: BlockDeviceType::parse(raw.device_type.as_deref().unwrap_or_default()),
            state: BlockDeviceState::parse(raw.state.as_deref().unwrap_or_default()),
            read_only: flag(raw.ro).with_context(|| format!("Parsing ro of device {name}"))?,
            removable: flag(raw.rm).with_context(|| format!("Parsing rm of device {name}"))?,
            user_defined: true,
            available: true,
            children: raw.children.unwrap_or_default(),
            name,
        })
    }
}

impl From<BlockDevice> for RawBlockDevice {
    fn from(dev: BlockDevice) -> Self {
        RawBlockDevice {
            name: non_empty(&dev.name),
            model: non_empty(&dev.model),
            maj_min: non_empty(&dev.major_minor),
            fstype: non_empty(&dev.fstype),
            uuid: non_empty(&dev.uuid),
            mountpoint: non_empty(&dev.mountpoint),
            size: Some(RawSize::Text(dev.size.to_string())),
            ro: Some(RawFlag::Text(dev.read_only.to_string())),
            rm: Some(RawFlag::Text(dev.removable.to_string())),
            device_type: non_empty(dev.device_type.as_str()),
            state: non_empty(dev.state.as_str()),
            children: (!dev.children.is_empty()).then_some(dev.children),
        }
    }
}

/// Arguments to `lsblk`: JSON, sizes in bytes, all columns, skipping RAM
/// disks (1), floppies (2) and SCSI CD-ROMs (11).
pub const LSBLK_ARGV: &[&str] = &["lsblk", "--exclude", "1,2,11", "-J", "-b", "-O"];

/// Parse `lsblk --json` output.
///
/// A device is unavailable when anything below it is mounted.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    #[derive(Deserialize)]
    struct DevicesOutput {
        blockdevices: Vec<BlockDevice>,
    }
    let mut devs = serde_json::from_str::<DevicesOutput>(json)
        .context("Parsing lsblk output")?
        .blockdevices;
    for dev in devs.iter_mut() {
        dev.mark_discovered();
        dev.available = !dev.has_mounted_descendant();
    }
    Ok(devs)
}

/// Replace discovered devices with the matching user-edited device, if
/// any, keeping the discovered availability.
pub fn merge_user_defined(
    discovered: Vec<BlockDevice>,
    user_defined: &[BlockDevice],
) -> Vec<BlockDevice> {
    discovered
        .into_iter()
        .map(|dev| match user_defined.iter().find(|u| u.is_same_device(&dev)) {
            Some(u) => BlockDevice {
                available: dev.available,
                ..u.clone()
            },
            None => dev,
        })
        .collect()
}

/// List the host's block devices, preferring the entries of
/// `user_defined` over the discovered ones they match.
#[context("Listing block devices")]
pub fn list_block_devices(
    runner: &dyn CommandRunner,
    user_defined: &[BlockDevice],
) -> Result<Vec<BlockDevice>> {
    let out = runner.run(LSBLK_ARGV)?;
    let discovered = parse_lsblk(&out)?;
    Ok(merge_user_defined(discovered, user_defined))
}

/// Caches the list of devices available for installation.
#[derive(Debug)]
pub struct DeviceInventory {
    runner: std::sync::Arc<dyn CommandRunner>,
    available: Option<Vec<BlockDevice>>,
}

impl DeviceInventory {
    /// Create an empty inventory.
    pub fn new(runner: std::sync::Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            available: None,
        }
    }

    /// The devices not in use by the host. Discovery only happens on the
    /// first call, or after [`DeviceInventory::invalidate`].
    pub fn available(&mut self, user_defined: &[BlockDevice]) -> Result<&[BlockDevice]> {
        let devs = match self.available.take() {
            Some(devs) => devs,
            None => list_block_devices(self.runner.as_ref(), user_defined)?
                .into_iter()
                .filter(|d| d.available)
                .collect(),
        };
        let devs = self.available.insert(devs);
        Ok(devs.as_slice())
    }

    /// Forget the cached list.
    pub fn invalidate(&mut self) {
        self.available = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indoc::indoc;
    use installer_utils::testing::RecordingRunner;

    use super::*;

    const LSBLK: &str = indoc! { r#"
        {
           "blockdevices": [
              {"name": "sda", "model": "QEMU HARDDISK   ", "maj:min": "8:0", "size": 34359738368,
               "fstype": null, "uuid": null, "type": "disk", "state": "running", "mountpoint": null,
               "ro": false, "rm": false,
               "children": [
                  {"name": "sda1", "maj:min": "8:1", "size": 157286400, "fstype": "vfat",
                   "uuid": "1234-ABCD", "type": "part", "mountpoint": "/boot", "ro": false, "rm": false},
                  {"name": "sda2", "maj:min": "8:2", "size": 34202451968, "fstype": "ext4",
                   "type": "part", "mountpoint": "/", "ro": false, "rm": false}
               ]
              },
              {"name": "nvme0n1", "model": "Samsung SSD", "maj:min": "259:0", "size": "512110190592",
               "type": "disk", "ro": "0", "rm": "1"},
              {"name": "sr0", "maj:min": "11:0", "size": 1073741312, "type": "rom", "ro": "1", "rm": "1"},
              {"name": "md0", "maj:min": "9:0", "size": 1073741312, "type": "raid1", "state": "weird"}
           ]
        }
    "# };

    fn disk(size: u64) -> BlockDevice {
        BlockDevice {
            name: "sda".into(),
            size,
            device_type: BlockDeviceType::Disk,
            ..Default::default()
        }
    }

    fn part(size: u64, fstype: &str, mountpoint: &str) -> BlockDevice {
        BlockDevice {
            size,
            fstype: fstype.into(),
            mountpoint: mountpoint.into(),
            device_type: BlockDeviceType::Partition,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_lsblk() -> Result<()> {
        let devs = parse_lsblk(LSBLK)?;
        assert_eq!(devs.len(), 4);
        let sda = &devs[0];
        assert_eq!(sda.model, "QEMU HARDDISK");
        assert_eq!(sda.major_minor, "8:0");
        assert_eq!(sda.device_type, BlockDeviceType::Disk);
        assert_eq!(sda.state, BlockDeviceState::Running);
        assert_eq!(sda.children.len(), 2);
        assert_eq!(sda.children[0].fstype, "vfat");
        assert_eq!(sda.children[0].uuid, "1234-ABCD");
        assert!(!sda.available);
        assert!(!sda.user_defined);
        assert!(!sda.children[0].user_defined);

        let nvme = &devs[1];
        assert_eq!(nvme.size, 512110190592);
        assert!(nvme.available);
        assert!(!nvme.read_only);
        assert!(nvme.removable);
        assert_eq!(devs[2].device_type, BlockDeviceType::Rom);
        assert!(devs[2].read_only);
        assert_eq!(devs[3].device_type, BlockDeviceType::Unknown);
        assert_eq!(devs[3].state, BlockDeviceState::Unknown);
        Ok(())
    }

    #[test]
    fn test_parse_lsblk_invalid() {
        assert!(parse_lsblk("not json").is_err());
        assert!(parse_lsblk(r#"{"blockdevices": [{"name": "sda", "ro": "maybe"}]}"#).is_err());
    }

    #[test]
    fn test_add_child_naming() {
        let mut d = disk(10 << 30);
        assert_eq!(d.add_child(part(1 << 20, "ext4", "/")).name, "sda1");
        assert_eq!(d.add_child(part(1 << 20, "ext4", "/home")).name, "sda2");
        let mut named = part(1 << 20, "xfs", "/srv");
        named.name = "custom".into();
        assert_eq!(d.add_child(named).name, "custom");

        let mut nvme = disk(10 << 30);
        nvme.name = "nvme0n1".into();
        assert_eq!(nvme.add_child(part(1, "ext4", "/")).name, "nvme0n1p1");

        let mut lo = disk(10 << 30);
        lo.name = "loop".into();
        lo.device_type = BlockDeviceType::Loop;
        assert_eq!(lo.add_child(part(1, "ext4", "/")).name, "loopp1");
    }

    #[test]
    fn test_remove_child() {
        let mut d = disk(10 << 30);
        d.add_child(part(1 << 20, "vfat", "/boot"));
        d.add_child(part(1 << 20, "ext4", "/"));
        let removed = d.remove_child(0).unwrap();
        assert_eq!(removed.name, "sda1");
        assert_eq!(d.children.len(), 1);
        assert_eq!(d.children[0].name, "sda2");
        assert!(d.remove_child(5).is_none());
    }

    #[test]
    fn test_validate() {
        let mut d = disk(10 << 30);
        assert!(matches!(d.validate(), Err(BlockdevError::NoEfiPartition)));
        d.add_child(part(1 << 20, "vfat", "/boot"));
        assert!(matches!(d.validate(), Err(BlockdevError::NoRootPartition)));
        d.add_child(part(1 << 20, "ext4", "/"));
        d.validate().unwrap();

        // Removing either required partition invalidates the tree
        let mut no_boot = d.clone();
        no_boot.remove_child(0);
        assert!(matches!(no_boot.validate(), Err(BlockdevError::NoEfiPartition)));
        let mut no_root = d.clone();
        no_root.remove_child(1);
        assert!(matches!(no_root.validate(), Err(BlockdevError::NoRootPartition)));

        // An ext4 /boot is not an EFI partition
        let mut wrong = disk(10 << 30);
        wrong.add_child(part(1 << 20, "ext4", "/boot"));
        wrong.add_child(part(1 << 20, "ext4", "/"));
        assert!(matches!(wrong.validate(), Err(BlockdevError::NoEfiPartition)));
    }

    #[test]
    fn test_free_space() {
        let sizes = [150 << 20, 2 << 30, 5 << 30];
        let mut d = disk(20 << 30);
        for s in sizes {
            d.add_child(part(s, "ext4", ""));
        }
        let before = d.free_space().unwrap();
        assert_eq!(before, (20 << 30) - sizes.iter().sum::<u64>());
        d.add_child(part(1 << 30, "ext4", ""));
        assert_eq!(d.free_space().unwrap(), before - (1 << 30));
        assert!(matches!(
            d.children[0].free_space(),
            Err(BlockdevError::NotADisk(_))
        ));
    }

    #[test]
    fn test_partition_sizes() {
        let mut d = disk(10 << 30);
        d.add_child(part(1 << 30, "ext4", "/"));
        d.add_child(part(1 << 30, "swap", ""));
        assert_eq!(d.max_partition_size(0), 9 << 30);
        assert_eq!(d.max_partition_size(7), 0);
        assert_eq!(d.is_valid_size(0, "2G"), Ok(2 << 30));
        assert_eq!(d.is_valid_size(0, "9g"), Ok(9 << 30));
        assert_eq!(d.is_valid_size(0, "9.5G"), Err(InvalidSize::TooLarge));
        assert_eq!(d.is_valid_size(0, "512K"), Err(InvalidSize::TooSmall));
        assert_eq!(d.is_valid_size(0, "2X"), Err(InvalidSize::Syntax));
        assert_eq!(d.is_valid_size(0, "G"), Err(InvalidSize::Unparseable));
        assert_eq!(d.is_valid_size(4, "2G"), Err(InvalidSize::UnknownFreeSpace));
        assert_eq!(
            InvalidSize::Syntax.to_string(),
            "Invalid size, may only be suffixed by: B, K, M, G, T or P"
        );
    }

    #[test]
    fn test_standard_partitions() {
        let mut d = disk(20 << 30);
        d.add_child(part(1 << 30, "xfs", "/"));
        d.new_standard_partitions();
        let layout: Vec<_> = d
            .children
            .iter()
            .map(|c| (c.name.as_str(), c.size, c.fstype.as_str(), c.mountpoint.as_str()))
            .collect();
        similar_asserts::assert_eq!(
            layout,
            [
                ("sda1", 150 << 20, "vfat", "/boot"),
                ("sda2", 2 << 30, "swap", ""),
                ("sda3", (20 << 30) - (150 << 20) - (2 << 30), "ext4", "/"),
            ]
        );
        d.validate().unwrap();
        assert_eq!(d.free_space().unwrap(), 0);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut d = disk(20 << 30);
        d.new_standard_partitions();
        let mut c = d.clone();
        c.children[2].mountpoint = "/srv".into();
        c.remove_child(0);
        assert_eq!(d.children.len(), 3);
        assert_eq!(d.children[2].mountpoint, "/");
    }

    #[test]
    fn test_merge_user_defined() -> Result<()> {
        let discovered = parse_lsblk(LSBLK)?;
        let mut edited = discovered[1].clone();
        edited.user_defined = true;
        edited.available = false;
        edited.new_standard_partitions();
        let mut stranger = disk(1);
        stranger.name = "sdz".into();
        let merged = merge_user_defined(discovered, &[edited, stranger]);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[1].children.len(), 3);
        assert!(merged[1].user_defined);
        assert!(merged[1].available);
        assert!(merged.iter().all(|d| d.name != "sdz"));
        Ok(())
    }

    #[test]
    fn test_inventory_caches() -> Result<()> {
        let runner = Arc::new(RecordingRunner::new().with_output("lsblk", LSBLK));
        let mut inventory = DeviceInventory::new(runner.clone());
        let names: Vec<_> = inventory
            .available(&[])?
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, ["nvme0n1", "sr0", "md0"]);
        inventory.available(&[])?;
        assert_eq!(runner.calls_to("lsblk").len(), 1);
        assert_eq!(
            runner.command_lines(),
            ["lsblk --exclude 1,2,11 -J -b -O"]
        );
        inventory.invalidate();
        inventory.available(&[])?;
        assert_eq!(runner.calls_to("lsblk").len(), 2);
        Ok(())
    }

    #[test]
    fn test_descriptor_yaml() -> Result<()> {
        let yaml = indoc! { r#"
            name: sda
            model: QEMU
            majMin: "8:0"
            size: 20G
            type: disk
            children:
              - name: sda1
                fstype: vfat
                mountpoint: /boot
                size: 150M
                type: part
              - name: sda2
                fstype: ext4
                mountpoint: /
                size: "19000000000"
                ro: "false"
                type: part
        "# };
        let dev: BlockDevice = serde_yaml::from_str(yaml)?;
        assert!(dev.user_defined);
        assert_eq!(dev.size, 20 << 30);
        assert_eq!(dev.children[0].size, 150 << 20);
        assert_eq!(dev.children[1].size, 19_000_000_000);
        dev.validate()?;

        let out = serde_yaml::to_string(&dev)?;
        assert!(out.contains("majMin:"));
        let back: BlockDevice = serde_yaml::from_str(&out)?;
        assert_eq!(back, dev);
        Ok(())
    }
}
