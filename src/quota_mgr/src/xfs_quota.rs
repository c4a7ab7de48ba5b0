//! XFS project quota primitives on top of raw `ioctl`/`quotactl`/`statfs`.

use crate::quota_provider::{DiskUsage, ProjectQuotaOps, ProjectQuotaProvider, Quota};
use hostpath_lib::{HostPathError, HostPathResult};
use log::warn;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const XFS_SUPER_MAGIC: i64 = 0x58465342;
const BASIC_BLOCK_SIZE: u64 = 512;

const FS_IOC_FSGETXATTR: libc::c_ulong = 0x801c581f;
const FS_IOC_FSSETXATTR: libc::c_ulong = 0x401c5820;
const FS_XFLAG_PROJINHERIT: u32 = 0x00000200;

const XQM_PRJQUOTA: libc::c_int = 2;
const Q_XGETQUOTA: libc::c_int = (('X' as libc::c_int) << 8) + 3;
const Q_XSETQLIM: libc::c_int = (('X' as libc::c_int) << 8) + 4;
const Q_XGETQSTAT: libc::c_int = (('X' as libc::c_int) << 8) + 5;

const FS_DQUOT_VERSION: i8 = 1;
const FS_PROJ_QUOTA: i8 = 2;
const FS_DQ_BSOFT: u16 = 1 << 2;
const FS_DQ_BHARD: u16 = 1 << 3;
const FS_QUOTA_PDQ_ACCT: u16 = 1 << 4;
const FS_QUOTA_PDQ_ENFD: u16 = 1 << 5;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct FsXattr {
    fsx_xflags: u32,
    fsx_extsize: u32,
    fsx_nextents: u32,
    fsx_projid: u32,
    fsx_cowextsize: u32,
    fsx_pad: [u8; 8],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct FsDiskQuota {
    d_version: i8,
    d_flags: i8,
    d_fieldmask: u16,
    d_id: u32,
    d_blk_hardlimit: u64,
    d_blk_softlimit: u64,
    d_ino_hardlimit: u64,
    d_ino_softlimit: u64,
    d_bcount: u64,
    d_icount: u64,
    d_itimer: i32,
    d_btimer: i32,
    d_iwarns: u16,
    d_bwarns: u16,
    d_padding2: i32,
    d_rtb_hardlimit: u64,
    d_rtb_softlimit: u64,
    d_rtbcount: u64,
    d_rtbtimer: i32,
    d_rtbwarns: u16,
    d_padding3: i16,
    d_padding4: [u8; 8],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct FsQFileStat {
    qfs_ino: u64,
    qfs_nblks: u64,
    qfs_nextents: u32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct FsQuotaStat {
    qs_version: i8,
    qs_flags: u16,
    qs_pad: i8,
    qs_uquota: FsQFileStat,
    qs_gquota: FsQFileStat,
    qs_incoredqs: u32,
    qs_btimelimit: i32,
    qs_itimelimit: i32,
    qs_rtbtimelimit: i32,
    qs_bwarnlimit: u16,
    qs_iwarnlimit: u16,
}

fn c_path(path: &Path) -> HostPathResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| HostPathError::InvalidArgument(format!("bad path {}: {}", path.display(), e)))
}

fn c_str(value: &str) -> HostPathResult<CString> {
    CString::new(value)
        .map_err(|e| HostPathError::InvalidArgument(format!("bad device {}: {}", value, e)))
}

fn last_os_error(op: &str, target: &str) -> HostPathError {
    HostPathError::IoError(format!(
        "{} {} failed: {}",
        op,
        target,
        std::io::Error::last_os_error()
    ))
}

fn qcmd(cmd: libc::c_int) -> libc::c_int {
    (cmd << 8) | (XQM_PRJQUOTA & 0x00ff)
}

/// Linux XFS implementation of the project quota primitives.
#[derive(Debug, Default, Clone, Copy)]
pub struct XfsQuotaOps;

impl XfsQuotaOps {
    fn statfs(&self, mount_point: &Path) -> HostPathResult<libc::statfs> {
        let path = c_path(mount_point)?;
        let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statfs(path.as_ptr(), &mut buf) };
        if ret != 0 {
            return Err(last_os_error("statfs", &mount_point.display().to_string()));
        }
        Ok(buf)
    }

    fn fs_xattr(&self, path: &Path) -> HostPathResult<(std::fs::File, FsXattr)> {
        let dir = std::fs::File::open(path)
            .map_err(|e| HostPathError::IoError(format!("open {}: {}", path.display(), e)))?;
        let mut attr = FsXattr::default();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&dir);
        let ret = unsafe { libc::ioctl(fd, FS_IOC_FSGETXATTR as _, &mut attr as *mut FsXattr) };
        if ret != 0 {
            return Err(last_os_error("FS_IOC_FSGETXATTR", &path.display().to_string()));
        }
        Ok((dir, attr))
    }
}

impl ProjectQuotaOps for XfsQuotaOps {
    fn is_quota_enabled(&self, mount_point: &Path, device: &str) -> bool {
        match self.statfs(mount_point) {
            Ok(buf) if buf.f_type as i64 == XFS_SUPER_MAGIC => {}
            Ok(_) => {
                warn!("{} is not an xfs filesystem", mount_point.display());
                return false;
            }
            Err(e) => {
                warn!("check quota support of {} failed: {}", mount_point.display(), e);
                return false;
            }
        }

        let dev = match c_str(device) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let mut stat = FsQuotaStat::default();
        let ret = unsafe {
            libc::quotactl(
                qcmd(Q_XGETQSTAT),
                dev.as_ptr(),
                0,
                &mut stat as *mut FsQuotaStat as *mut libc::c_char,
            )
        };
        if ret != 0 {
            warn!(
                "Q_XGETQSTAT on {} failed: {}",
                device,
                std::io::Error::last_os_error()
            );
            return false;
        }
        let wanted = FS_QUOTA_PDQ_ACCT | FS_QUOTA_PDQ_ENFD;
        stat.qs_flags & wanted == wanted
    }

    fn get_project_id(&self, path: &Path) -> HostPathResult<u32> {
        let (_dir, attr) = self.fs_xattr(path)?;
        Ok(attr.fsx_projid)
    }

    fn set_project_id(&self, path: &Path, project_id: u32) -> HostPathResult<()> {
        let (dir, mut attr) = self.fs_xattr(path)?;
        attr.fsx_projid = project_id;
        attr.fsx_xflags |= FS_XFLAG_PROJINHERIT;
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&dir);
        let ret = unsafe { libc::ioctl(fd, FS_IOC_FSSETXATTR as _, &mut attr as *mut FsXattr) };
        if ret != 0 {
            return Err(last_os_error("FS_IOC_FSSETXATTR", &path.display().to_string()));
        }
        Ok(())
    }

    fn get_quota(&self, device: &str, project_id: u32) -> HostPathResult<Quota> {
        let dev = c_str(device)?;
        let mut dq = FsDiskQuota::default();
        let ret = unsafe {
            libc::quotactl(
                qcmd(Q_XGETQUOTA),
                dev.as_ptr(),
                project_id as libc::c_int,
                &mut dq as *mut FsDiskQuota as *mut libc::c_char,
            )
        };
        if ret != 0 {
            return Err(last_os_error(
                "Q_XGETQUOTA",
                &format!("{} project {}", device, project_id),
            ));
        }
        Ok(Quota {
            hard: dq.d_blk_hardlimit * BASIC_BLOCK_SIZE,
            soft: dq.d_blk_softlimit * BASIC_BLOCK_SIZE,
            used: dq.d_bcount * BASIC_BLOCK_SIZE,
        })
    }

    fn set_quota(
        &self,
        device: &str,
        project_id: u32,
        hard: u64,
        soft: u64,
    ) -> HostPathResult<()> {
        let dev = c_str(device)?;
        let mut dq = FsDiskQuota {
            d_version: FS_DQUOT_VERSION,
            d_flags: FS_PROJ_QUOTA,
            d_fieldmask: FS_DQ_BSOFT | FS_DQ_BHARD,
            d_id: project_id,
            d_blk_hardlimit: hard / BASIC_BLOCK_SIZE,
            d_blk_softlimit: soft / BASIC_BLOCK_SIZE,
            ..Default::default()
        };
        let ret = unsafe {
            libc::quotactl(
                qcmd(Q_XSETQLIM),
                dev.as_ptr(),
                project_id as libc::c_int,
                &mut dq as *mut FsDiskQuota as *mut libc::c_char,
            )
        };
        if ret != 0 {
            return Err(last_os_error(
                "Q_XSETQLIM",
                &format!("{} project {}", device, project_id),
            ));
        }
        Ok(())
    }

    fn fs_usage(&self, mount_point: &Path) -> HostPathResult<DiskUsage> {
        let buf = self.statfs(mount_point)?;
        let bsize = buf.f_bsize as u64;
        let blocks = buf.f_blocks as u64;
        let free = buf.f_bfree as u64;
        Ok(DiskUsage {
            capacity: blocks * bsize,
            used: blocks.saturating_sub(free) * bsize,
        })
    }
}

pub type XfsQuotaProvider = ProjectQuotaProvider<XfsQuotaOps>;

pub fn new_xfs_quota_provider(id_start: u32, id_count: u32) -> HostPathResult<XfsQuotaProvider> {
    ProjectQuotaProvider::new(XfsQuotaOps, id_start, id_count)
}
