//! Writing a disk model out to real storage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use installer_mount::{MountError, Mounter};
use installer_utils::CommandRunner;
use installer_utils::progress::Progress;

use crate::{BlockDevice, BlockDeviceType, BlockdevError, filesystem_ops, partition_type_guid};

/// How long to wait for partition device nodes when not configured.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The `parted` and `sgdisk` arguments describing a disk's partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// One `mkpart` directive per partition, in order.
    pub directives: Vec<String>,
    /// The 1-based number of the `/boot` partition.
    pub boot_partition: Option<usize>,
    /// The GPT type of each partition, by 1-based number.
    pub type_guids: Vec<(usize, &'static str)>,
}

/// Lay the partitions of `disk` out back to back from the start of the
/// disk, in MiB.
pub fn partition_plan(disk: &BlockDevice) -> Result<PartitionPlan, BlockdevError> {
    let mut start = 0u64;
    let mut plan = PartitionPlan {
        directives: Vec::with_capacity(disk.children.len()),
        boot_partition: None,
        type_guids: Vec::with_capacity(disk.children.len()),
    };
    for (i, part) in disk.children.iter().enumerate() {
        let number = i + 1;
        let ops = filesystem_ops(&part.fstype)?;
        let end = start + (part.size >> 20);
        plan.directives
            .push((ops.make_partition_args)(part, start, end));
        if part.mountpoint == "/boot" {
            plan.boot_partition = Some(number);
        }
        plan.type_guids.push((number, partition_type_guid(part)?));
        start = end;
    }
    Ok(plan)
}

/// Carries out storage operations against the host.
#[derive(Debug, Clone)]
pub struct Provisioner {
    runner: Arc<dyn CommandRunner>,
    progress: Progress,
    mounter: Mounter,
    dev_dir: Utf8PathBuf,
    settle_timeout: Duration,
}

impl Provisioner {
    /// Create a provisioner for devices under `/dev`.
    pub fn new(runner: Arc<dyn CommandRunner>, progress: Progress) -> Self {
        Self {
            mounter: Mounter::new(Arc::clone(&runner)),
            runner,
            progress,
            dev_dir: Utf8PathBuf::from("/dev"),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }

    /// Look for device nodes under `dir` instead of `/dev`.
    pub fn with_dev_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.dev_dir = dir.into();
        self
    }

    /// Bound the wait for partition device nodes to appear.
    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    /// The command runner.
    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// The progress handle.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// The mounter holding this provisioner's ledger.
    pub fn mounter(&self) -> &Mounter {
        &self.mounter
    }

    /// The device node of `dev`.
    pub fn device_path(&self, dev: &BlockDevice) -> Utf8PathBuf {
        self.dev_dir.join(&dev.name)
    }

    /// Replace the partition table of `disk` with a GPT holding its
    /// children, then wait for the kernel to create their device nodes.
    ///
    /// Nothing is rolled back on failure.
    #[context("Writing partition table to {}", disk.name)]
    pub fn write_partition_table(&self, disk: &BlockDevice) -> Result<()> {
        if !matches!(
            disk.device_type,
            BlockDeviceType::Disk | BlockDeviceType::Loop
        ) {
            return Err(BlockdevError::WrongDeviceType {
                name: disk.name.clone(),
                found: disk.device_type,
                expected: "disk or loop",
            }
            .into());
        }
        let plan = partition_plan(disk)?;
        let devpath = self.device_path(disk);
        let devpath = devpath.as_str();

        let prg = self
            .progress
            .new_loop(&format!("Writing partition table to: {}", disk.name));
        self.runner
            .run_and_log(&["parted", "-s", devpath, "mklabel", "gpt"])?;
        let mut argv = vec!["parted", "-a", "optimal", devpath, "--script"];
        argv.extend(plan.directives.iter().map(String::as_str));
        self.runner.run_and_log(&argv)?;
        match plan.boot_partition {
            Some(n) => {
                let set_boot = format!("set {n} boot on");
                self.runner
                    .run_and_log(&["parted", devpath, set_boot.as_str()])?;
            }
            None => tracing::debug!("No /boot partition on {}", disk.name),
        }
        prg.complete();

        let prg = self
            .progress
            .multi_step(plan.type_guids.len(), "Adjusting filesystem configurations");
        for (done, (n, guid)) in plan.type_guids.iter().enumerate() {
            let typecode = format!("--typecode={n}:{guid}");
            self.runner
                .run_and_log(&["sgdisk", devpath, typecode.as_str()])?;
            prg.report_fraction(done + 1);
        }
        self.runner.run_and_log(&["partprobe", devpath])?;
        self.wait_for_device_nodes(disk)?;
        prg.complete();
        Ok(())
    }

    /// Poll until every partition of `disk` has a device node.
    fn wait_for_device_nodes(&self, disk: &BlockDevice) -> Result<()> {
        let deadline = Instant::now() + self.settle_timeout;
        for part in disk.children.iter() {
            let path = self.device_path(part);
            while !path.try_exists().with_context(|| format!("Checking {path}"))? {
                if Instant::now() >= deadline {
                    return Err(BlockdevError::DeviceNotReady(path, self.settle_timeout).into());
                }
                std::thread::sleep(SETTLE_POLL_INTERVAL);
            }
        }
        tracing::debug!("Device nodes for {} are present", disk.name);
        Ok(())
    }

    fn require_partition(dev: &BlockDevice) -> Result<(), BlockdevError> {
        if dev.device_type == BlockDeviceType::Disk {
            return Err(BlockdevError::WrongDeviceType {
                name: dev.name.clone(),
                found: dev.device_type,
                expected: "partition",
            });
        }
        Ok(())
    }

    /// Create the filesystem `partition.fstype` on `partition`.
    #[context("Creating {} filesystem on {}", partition.fstype, partition.name)]
    pub fn make_filesystem(&self, partition: &BlockDevice) -> Result<()> {
        Self::require_partition(partition)?;
        let ops = filesystem_ops(&partition.fstype)?;
        let argv = (ops.make_filesystem)(&self.device_path(partition));
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.runner.run_and_log(&argv)
    }

    /// Mount `partition` at its mount point below `root`.
    #[context("Mounting {}", partition.name)]
    pub fn mount(&self, partition: &BlockDevice, root: &Utf8Path) -> Result<()> {
        Self::require_partition(partition)?;
        let target = match partition.mountpoint.trim_start_matches('/') {
            "" => root.to_owned(),
            rel => root.join(rel),
        };
        self.mounter
            .mount(&self.device_path(partition), &target, &partition.fstype)
    }

    /// Bind `/proc`, `/sys` and `/dev` into `root`.
    pub fn mount_meta_fs(&self, root: &Utf8Path) -> Result<()> {
        self.mounter.mount_meta_fs(root)
    }

    /// Unmount everything this provisioner mounted.
    pub fn unmount_all(&self) -> Result<(), MountError> {
        self.mounter.unmount_all()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use installer_utils::progress::ProgressClient;
    use installer_utils::testing::RecordingRunner;

    use super::*;

    #[derive(Debug, Default)]
    struct Fractions(Mutex<Vec<(usize, usize)>>);

    impl ProgressClient for Fractions {
        fn set_description(&self, _: &str) {}
        fn report_fraction(&self, total: usize, step: usize) {
            self.0.lock().unwrap().push((total, step));
        }
        fn tick(&self) {}
        fn complete(&self) {}
        fn fail(&self) {}
        fn tick_interval(&self) -> Duration {
            Duration::from_millis(5)
        }
    }

    struct Fixture {
        _td: tempfile::TempDir,
        dev_dir: Utf8PathBuf,
        runner: Arc<RecordingRunner>,
        fractions: Arc<Fractions>,
        provisioner: Provisioner,
    }

    fn fixture() -> Result<Fixture> {
        let td = tempfile::tempdir()?;
        let dev_dir = Utf8PathBuf::try_from(td.path().join("dev"))?;
        std::fs::create_dir(&dev_dir)?;
        let runner = Arc::new(RecordingRunner::new());
        let fractions = Arc::new(Fractions::default());
        let provisioner = Provisioner::new(runner.clone(), Progress::with_client(fractions.clone()))
            .with_dev_dir(dev_dir.clone())
            .with_settle_timeout(Duration::ZERO);
        Ok(Fixture {
            _td: td,
            dev_dir,
            runner,
            fractions,
            provisioner,
        })
    }

    fn standard_disk() -> BlockDevice {
        let mut disk = BlockDevice {
            name: "sda".into(),
            size: 20 << 30,
            device_type: BlockDeviceType::Disk,
            ..Default::default()
        };
        disk.new_standard_partitions();
        disk
    }

    fn create_nodes(dir: &Utf8Path, disk: &BlockDevice) -> Result<()> {
        for c in disk.children.iter() {
            std::fs::write(dir.join(&c.name), "")?;
        }
        Ok(())
    }

    #[test]
    fn test_partition_plan() -> Result<()> {
        let plan = partition_plan(&standard_disk())?;
        let root_mib = ((20u64 << 30) - (150 << 20) - (2 << 30)) >> 20;
        similar_asserts::assert_eq!(
            plan,
            PartitionPlan {
                directives: vec![
                    "mkpart EFI fat32 0M 150M".to_owned(),
                    "mkpart linux-swap 150M 2198M".to_owned(),
                    format!("mkpart / 2198M {}M", 2198 + root_mib),
                ],
                boot_partition: Some(1),
                type_guids: vec![
                    (1, "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"),
                    (2, "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F"),
                    (3, "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709"),
                ],
            }
        );
        Ok(())
    }

    #[test]
    fn test_write_partition_table() -> Result<()> {
        let f = fixture()?;
        let disk = standard_disk();
        create_nodes(&f.dev_dir, &disk)?;
        f.provisioner.write_partition_table(&disk)?;
        let dev = f.dev_dir.join("sda");
        let lines = f.runner.command_lines();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], format!("parted -s {dev} mklabel gpt"));
        assert!(lines[1].starts_with(&format!(
            "parted -a optimal {dev} --script mkpart EFI fat32 0M 150M mkpart linux-swap"
        )));
        // Each directive is a single argument
        assert_eq!(f.runner.calls()[1].len(), 8);
        assert_eq!(lines[2], format!("parted {dev} set 1 boot on"));
        assert_eq!(
            lines[3],
            format!("sgdisk {dev} --typecode=1:C12A7328-F81F-11D2-BA4B-00A0C93EC93B")
        );
        assert!(lines[5].starts_with(&format!("sgdisk {dev} --typecode=3:")));
        assert_eq!(lines[6], format!("partprobe {dev}"));
        assert_eq!(
            *f.fractions.0.lock().unwrap(),
            [(3, 1), (3, 2), (3, 3)]
        );
        Ok(())
    }

    #[test]
    fn test_write_partition_table_rejects_partition() -> Result<()> {
        let f = fixture()?;
        let disk = standard_disk();
        let err = f
            .provisioner
            .write_partition_table(&disk.children[0])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BlockdevError>(),
            Some(BlockdevError::WrongDeviceType { .. })
        ));
        assert!(f.runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_guid_before_any_command() -> Result<()> {
        let f = fixture()?;
        let mut disk = standard_disk();
        disk.children[2].mountpoint = "/var".into();
        let err = f.provisioner.write_partition_table(&disk).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BlockdevError>(),
            Some(BlockdevError::UnknownGuid(n)) if n == "sda3"
        ));
        assert!(f.runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_write_partition_table_stops_on_failure() -> Result<()> {
        let f = fixture()?;
        let disk = standard_disk();
        f.runner
            .fail_when(|argv| argv.iter().any(|a| a.starts_with("--typecode=2")));
        assert!(f.provisioner.write_partition_table(&disk).is_err());
        let lines = f.runner.command_lines();
        assert_eq!(lines.len(), 5);
        assert!(lines.iter().all(|l| !l.starts_with("partprobe")));
        Ok(())
    }

    #[test]
    fn test_device_not_ready() -> Result<()> {
        let f = fixture()?;
        let disk = standard_disk();
        let err = f.provisioner.write_partition_table(&disk).unwrap_err();
        match err.downcast_ref::<BlockdevError>() {
            Some(BlockdevError::DeviceNotReady(p, _)) => assert_eq!(p, &f.dev_dir.join("sda1")),
            o => panic!("unexpected {o:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_make_filesystem() -> Result<()> {
        let f = fixture()?;
        let disk = standard_disk();
        for part in disk.children.iter() {
            f.provisioner.make_filesystem(part)?;
        }
        let dev = &f.dev_dir;
        assert_eq!(
            f.runner.command_lines(),
            [
                format!("mkfs.vfat -F32 {dev}/sda1"),
                format!("mkswap {dev}/sda2"),
                format!("mkfs.ext4 -v -F -b 4096 {dev}/sda3"),
            ]
        );
        let err = f.provisioner.make_filesystem(&disk).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BlockdevError>(),
            Some(BlockdevError::WrongDeviceType { .. })
        ));
        let mut ntfs = disk.children[0].clone();
        ntfs.fstype = "ntfs".into();
        let err = f.provisioner.make_filesystem(&ntfs).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BlockdevError>(),
            Some(BlockdevError::UnsupportedFilesystem(_))
        ));
        Ok(())
    }

    #[test]
    fn test_mount_partition() -> Result<()> {
        let f = fixture()?;
        let disk = standard_disk();
        let root = f.dev_dir.parent().unwrap().join("target");
        f.provisioner.mount(&disk.children[2], &root)?;
        f.provisioner.mount(&disk.children[0], &root)?;
        assert_eq!(
            f.provisioner.mounter().filesystem_mounts(),
            [root.clone(), root.join("boot")]
        );
        assert!(f.provisioner.mount(&disk, &root).is_err());
        f.provisioner.unmount_all()?;
        assert_eq!(f.runner.calls_to("umount").len(), 2);
        Ok(())
    }
}
