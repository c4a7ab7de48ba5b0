use hostpath_lib::{HostPathError, HostPathResult};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Mount table and mountpoint-attribute access for disks under the quota root.
pub trait DiskProbe: Send {
    fn is_mount_point(&self, path: &Path) -> HostPathResult<bool>;

    /// Source device of the filesystem mounted exactly at `mount_point`.
    fn device_of(&self, mount_point: &Path) -> HostPathResult<String>;

    /// Raw disable attribute, `None` when the attribute is absent.
    fn read_disable_attr(&self, mount_point: &Path) -> HostPathResult<Option<String>>;

    fn write_disable_attr(&self, mount_point: &Path, value: &str) -> HostPathResult<()>;
}

/// Reads the disable flag of a disk, persisting `false` the first time it is absent.
///
/// Two readers racing on a fresh disk may both see the attribute missing and
/// both write the default. The writes are identical so the race is benign.
pub fn read_disk_disabled(probe: &dyn DiskProbe, mount_point: &Path) -> HostPathResult<bool> {
    match probe.read_disable_attr(mount_point)? {
        Some(value) => Ok(value.trim().parse::<bool>().unwrap_or_else(|_| {
            warn!(
                "bad disable flag on {}: {:?}, treat as enabled",
                mount_point.display(),
                value
            );
            false
        })),
        None => {
            info!(
                "disable flag of {} absent, persist default false",
                mount_point.display()
            );
            probe.write_disable_attr(mount_point, "false")?;
            Ok(false)
        }
    }
}

pub fn write_disk_disabled(
    probe: &dyn DiskProbe,
    mount_point: &Path,
    disabled: bool,
) -> HostPathResult<()> {
    probe.write_disable_attr(mount_point, if disabled { "true" } else { "false" })
}

/// Immediate child directories of `dir`, sorted by name.
pub fn sub_dirs(dir: &Path) -> HostPathResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| HostPathError::IoError(format!("read dir {}: {}", dir.display(), e)))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(target_os = "linux")]
pub use self::host::HostDiskProbe;

#[cfg(target_os = "linux")]
mod host {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::MetadataExt;

    const MOUNT_INFO_PATH: &str = "/proc/self/mountinfo";
    const XATTR_VALUE_MAX: usize = 256;

    /// Linux probe: `/proc/self/mountinfo` for devices, user xattrs for the disable flag.
    pub struct HostDiskProbe {
        xattr_key: CString,
    }

    impl HostDiskProbe {
        pub fn new(xattr_key: &str) -> HostPathResult<Self> {
            let xattr_key = CString::new(xattr_key).map_err(|e| {
                HostPathError::InvalidArgument(format!("bad xattr key {}: {}", xattr_key, e))
            })?;
            Ok(Self { xattr_key })
        }

        fn c_path(path: &Path) -> HostPathResult<CString> {
            CString::new(path.as_os_str().as_bytes()).map_err(|e| {
                HostPathError::InvalidArgument(format!("bad path {}: {}", path.display(), e))
            })
        }
    }

    fn dev_major(dev: u64) -> u64 {
        ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)
    }

    fn dev_minor(dev: u64) -> u64 {
        (dev & 0xff) | ((dev >> 12) & !0xff)
    }

    /// Finds the mount source for `major:minor` mounted at `mount_point`.
    pub(crate) fn find_mount_source(
        mount_info: &str,
        major_minor: &str,
        mount_point: &str,
    ) -> Option<String> {
        mount_info.lines().find_map(|line| {
            let fields = line.split_whitespace().collect::<Vec<_>>();
            if fields.len() < 10 || fields[2] != major_minor || fields[4] != mount_point {
                return None;
            }
            fields.get(fields.len() - 2).map(|s| s.to_string())
        })
    }

    impl DiskProbe for HostDiskProbe {
        fn is_mount_point(&self, path: &Path) -> HostPathResult<bool> {
            let meta = std::fs::metadata(path)?;
            let parent = match path.parent() {
                Some(p) => p,
                None => return Ok(true),
            };
            let parent_meta = std::fs::metadata(parent)?;
            Ok(meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino())
        }

        fn device_of(&self, mount_point: &Path) -> HostPathResult<String> {
            let dev = std::fs::metadata(mount_point)?.dev();
            let major_minor = format!("{}:{}", dev_major(dev), dev_minor(dev));
            let mount_info = std::fs::read_to_string(MOUNT_INFO_PATH)?;
            let target = mount_point.to_string_lossy();
            find_mount_source(&mount_info, &major_minor, &target).ok_or_else(|| {
                HostPathError::NotFound(format!(
                    "no mount entry for {} ({})",
                    mount_point.display(),
                    major_minor
                ))
            })
        }

        fn read_disable_attr(&self, mount_point: &Path) -> HostPathResult<Option<String>> {
            let path = Self::c_path(mount_point)?;
            let mut buf = vec![0u8; XATTR_VALUE_MAX];
            let ret = unsafe {
                libc::getxattr(
                    path.as_ptr(),
                    self.xattr_key.as_ptr(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENODATA) {
                    return Ok(None);
                }
                return Err(HostPathError::IoError(format!(
                    "getxattr {} failed: {}",
                    mount_point.display(),
                    err
                )));
            }
            buf.truncate(ret as usize);
            Ok(Some(String::from_utf8_lossy(&buf).to_string()))
        }

        fn write_disable_attr(&self, mount_point: &Path, value: &str) -> HostPathResult<()> {
            let path = Self::c_path(mount_point)?;
            let ret = unsafe {
                libc::setxattr(
                    path.as_ptr(),
                    self.xattr_key.as_ptr(),
                    value.as_ptr() as *const libc::c_void,
                    value.len(),
                    0,
                )
            };
            if ret != 0 {
                return Err(HostPathError::IoError(format!(
                    "setxattr {} failed: {}",
                    mount_point.display(),
                    std::io::Error::last_os_error()
                )));
            }
            Ok(())
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_backend::MemDiskProbe;
    use tempfile::TempDir;

    #[test]
    fn test_disable_flag_defaults_and_persists() {
        let probe = MemDiskProbe::new();
        let mount = Path::new("/xfs/disk1");

        assert!(!read_disk_disabled(&probe, mount).unwrap());
        assert_eq!(probe.disable_attr(mount).as_deref(), Some("false"));

        write_disk_disabled(&probe, mount, true).unwrap();
        assert!(read_disk_disabled(&probe, mount).unwrap());

        probe.set_disable_attr(mount, "garbage");
        assert!(!read_disk_disabled(&probe, mount).unwrap());
    }

    #[test]
    fn test_sub_dirs_sorted_dirs_only() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();

        let dirs = sub_dirs(dir.path()).unwrap();
        assert_eq!(dirs, vec![dir.path().join("a"), dir.path().join("b")]);
    }
}
