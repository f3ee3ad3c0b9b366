//! Per-filesystem knowledge: how to create each supported filesystem, how
//! to describe a partition holding it to `parted`, and which GPT partition
//! type it gets.

use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;

use crate::{BlockDevice, BlockdevError};

/// Builds the command line creating a filesystem on a device node.
pub type MakeFilesystemFn = fn(&Utf8Path) -> Vec<String>;

/// Builds the `parted` directive creating a partition spanning
/// `start..end` MiB.
pub type MakePartitionFn = fn(&BlockDevice, u64, u64) -> String;

/// The operations available for a filesystem type.
#[derive(Debug, Clone, Copy)]
pub struct FilesystemOps {
    /// Create the filesystem.
    pub make_filesystem: MakeFilesystemFn,
    /// Describe the partition to `parted`.
    pub make_partition_args: MakePartitionFn,
}

static FILESYSTEMS: &[(&str, FilesystemOps)] = &[
    ("btrfs", FilesystemOps::common(btrfs)),
    ("ext2", FilesystemOps::common(ext2)),
    ("ext3", FilesystemOps::common(ext3)),
    ("ext4", FilesystemOps::common(ext4)),
    (
        "swap",
        FilesystemOps {
            make_filesystem: swap,
            make_partition_args: swap_partition,
        },
    ),
    (
        "vfat",
        FilesystemOps {
            make_filesystem: vfat,
            make_partition_args: vfat_partition,
        },
    ),
    ("xfs", FilesystemOps::common(xfs)),
];

impl FilesystemOps {
    const fn common(make_filesystem: MakeFilesystemFn) -> Self {
        Self {
            make_filesystem,
            make_partition_args: common_partition,
        }
    }
}

fn argv(base: &[&str], dev: &Utf8Path) -> Vec<String> {
    base.iter()
        .map(|&s| s.to_owned())
        .chain(std::iter::once(dev.to_string()))
        .collect()
}

fn btrfs(dev: &Utf8Path) -> Vec<String> {
    argv(&["mkfs.btrfs", "-f"], dev)
}

fn ext2(dev: &Utf8Path) -> Vec<String> {
    argv(&["mkfs.ext2", "-v", "-F"], dev)
}

fn ext3(dev: &Utf8Path) -> Vec<String> {
    argv(&["mkfs.ext3", "-v", "-F"], dev)
}

fn ext4(dev: &Utf8Path) -> Vec<String> {
    argv(&["mkfs.ext4", "-v", "-F", "-b", "4096"], dev)
}

fn xfs(dev: &Utf8Path) -> Vec<String> {
    argv(&["mkfs.xfs", "-f"], dev)
}

fn swap(dev: &Utf8Path) -> Vec<String> {
    argv(&["mkswap"], dev)
}

fn vfat(dev: &Utf8Path) -> Vec<String> {
    argv(&["mkfs.vfat", "-F32"], dev)
}

/// Partitions are named after their mount point, or their filesystem when
/// they have none.
fn common_partition(dev: &BlockDevice, start: u64, end: u64) -> String {
    let name = if dev.mountpoint.is_empty() {
        dev.fstype.as_str()
    } else {
        dev.mountpoint.as_str()
    };
    format!("mkpart {name} {start}M {end}M")
}

fn swap_partition(_: &BlockDevice, start: u64, end: u64) -> String {
    format!("mkpart linux-swap {start}M {end}M")
}

fn vfat_partition(_: &BlockDevice, start: u64, end: u64) -> String {
    format!("mkpart EFI fat32 {start}M {end}M")
}

/// Look up the operations for `fstype`.
pub fn filesystem_ops(fstype: &str) -> Result<&'static FilesystemOps, BlockdevError> {
    FILESYSTEMS
        .iter()
        .find(|(name, _)| *name == fstype)
        .map(|(_, ops)| ops)
        .ok_or_else(|| BlockdevError::UnsupportedFilesystem(fstype.to_owned()))
}

/// The names of every supported filesystem, sorted.
pub fn supported_filesystems() -> Vec<&'static str> {
    let mut r: Vec<_> = FILESYSTEMS.iter().map(|(name, _)| *name).collect();
    r.sort_unstable();
    r
}

/// The length of the longest supported filesystem name, for aligning
/// columns.
pub fn largest_filesystem_name() -> usize {
    FILESYSTEMS
        .iter()
        .map(|(name, _)| name.len())
        .max()
        .unwrap_or_default()
}

const ROOT_GUID: &str = "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709";
const HOME_GUID: &str = "933AC7E1-2EB4-4F13-B844-0E14E2AEF915";
const SRV_GUID: &str = "3B8F8425-20E0-4F3B-907F-1A25A76F98E8";
const SWAP_GUID: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";
const EFI_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

/// The GPT partition type for a partition: by mount point first, then by
/// filesystem, then the EFI system partition special case.
pub fn partition_type_guid(dev: &BlockDevice) -> Result<&'static str, BlockdevError> {
    let guid = match (dev.mountpoint.as_str(), dev.fstype.as_str()) {
        ("/", _) => ROOT_GUID,
        ("/home", _) => HOME_GUID,
        ("/srv", _) => SRV_GUID,
        (_, "swap") => SWAP_GUID,
        ("/boot", "vfat") => EFI_GUID,
        _ => return Err(BlockdevError::UnknownGuid(dev.name.clone())),
    };
    Ok(guid)
}

static MOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(/|(/[A-Za-z0-9_+-]+)+)$").unwrap());

/// Whether `path` is acceptable as a mount point: `/` or a chain of
/// `/component`s made of word characters, `+` and `-`.
pub fn is_valid_mount(path: &str) -> bool {
    MOUNT_RE.is_match(path)
}
