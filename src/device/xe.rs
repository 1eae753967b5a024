//! Linux DRM Xe backend.
//!
//! Streams are opened through the observation ioctl on a `/dev/dri/card*`
//! node. Reads use the raw transport: bare reports, with loss reported
//! through the status ioctl after an `EIO`.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::{ioctl_none, ioctl_read_bad, ioctl_readwrite, ioctl_write_ptr, request_code_none};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    EngineRef, MapProt, MetricConfigRegs, OaDevice, OaStatus, OaStream, OaUnitInfo, ReadBuf,
    RingMapping,
};
use crate::oa::devinfo::DeviceInfo;
use crate::oa::format::EngineClass;
use crate::oa::record::{Transport, MAX_OA_BUF_SIZE};
use crate::session::metrics_config::UUID_LEN;

const DRM_IOCTL_BASE: u8 = b'd';
const DRM_COMMAND_BASE: u8 = 0x40;
const DRM_XE_DEVICE_QUERY: u8 = 0x00;
const DRM_XE_OBSERVATION: u8 = 0x0b;

const DRM_XE_DEVICE_QUERY_CONFIG: u32 = 2;
const DRM_XE_QUERY_CONFIG_REV_AND_DEVICE_ID: usize = 0;

const DRM_XE_OBSERVATION_TYPE_OA: u64 = 0;
const DRM_XE_OBSERVATION_OP_STREAM_OPEN: u64 = 0;
const DRM_XE_OBSERVATION_OP_ADD_CONFIG: u64 = 1;
const DRM_XE_OBSERVATION_OP_REMOVE_CONFIG: u64 = 2;

const DRM_XE_OA_EXTENSION_SET_PROPERTY: u32 = 0;

// ---------------------------------------------------------------------------
// uAPI structures
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Default)]
struct DrmXeDeviceQuery {
    extensions: u64,
    query: u32,
    size: u32,
    data: u64,
    reserved: [u64; 2],
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmXeObservationParam {
    extensions: u64,
    observation_type: u64,
    observation_op: u64,
    param: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmXeUserExtension {
    next_extension: u64,
    name: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DrmXeExtSetProperty {
    base: DrmXeUserExtension,
    property: u32,
    pad: u32,
    value: u64,
    reserved: [u64; 2],
}

#[repr(C)]
#[derive(Debug)]
struct DrmXeOaConfig {
    extensions: u64,
    uuid: [u8; UUID_LEN],
    n_regs: u32,
    regs_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmXeOaStreamStatus {
    oa_status: u64,
    reserved: [u64; 3],
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmXeOaStreamInfo {
    extensions: u64,
    oa_buf_size: u64,
    reserved: [u64; 3],
}

ioctl_readwrite!(
    xe_device_query,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_XE_DEVICE_QUERY,
    DrmXeDeviceQuery
);
ioctl_write_ptr!(
    xe_observation,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_XE_OBSERVATION,
    DrmXeObservationParam
);
ioctl_none!(xe_observation_enable, b'i', 0x0);
ioctl_none!(xe_observation_disable, b'i', 0x1);
ioctl_read_bad!(
    xe_observation_status,
    request_code_none!(b'i', 0x3),
    DrmXeOaStreamStatus
);
ioctl_read_bad!(
    xe_observation_info,
    request_code_none!(b'i', 0x4),
    DrmXeOaStreamInfo
);

/// Retry an ioctl interrupted by a signal.
fn retry<F>(mut f: F) -> Result<i32, Errno>
where
    F: FnMut() -> Result<i32, Errno>,
{
    loop {
        match f() {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            other => return other,
        }
    }
}

/// Chain `(key, value)` pairs into set-property extensions.
fn property_chain(properties: &[(u64, u64)]) -> Result<Vec<DrmXeExtSetProperty>, Errno> {
    let mut chain = properties
        .iter()
        .map(|(key, value)| {
            Ok(DrmXeExtSetProperty {
                base: DrmXeUserExtension {
                    next_extension: 0,
                    name: DRM_XE_OA_EXTENSION_SET_PROPERTY,
                    pad: 0,
                },
                property: u32::try_from(*key).map_err(|_| Errno::EINVAL)?,
                pad: 0,
                value: *value,
                reserved: [0; 2],
            })
        })
        .collect::<Result<Vec<_>, Errno>>()?;

    // Link after the vector stops growing so the addresses stay valid.
    for i in 1..chain.len() {
        let next = &chain[i] as *const DrmXeExtSetProperty as u64;
        chain[i - 1].base.next_extension = next;
    }
    Ok(chain)
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// An Xe DRM device node.
pub struct XeDevice {
    fd: OwnedFd,
    info: DeviceInfo,
    units: Vec<OaUnitInfo>,
}

impl XeDevice {
    /// Open `path`. `info` supplies what the driver cannot be queried for;
    /// the device and revision ids are read from the device.
    pub fn open(path: &Path, mut info: DeviceInfo) -> Result<Self, Errno> {
        let raw = open(path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())?;
        // SAFETY: `raw` was just opened and is owned by nothing else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        match query_rev_and_device_id(&fd) {
            Ok((device_id, revision)) => {
                info.device_id = device_id;
                info.revision = revision;
            }
            Err(e) => debug!(error = %e, "config query failed, keeping configured ids"),
        }

        info!(
            path = %path.display(),
            device_id = format_args!("{:#06x}", info.device_id),
            revision = info.revision,
            "opened xe device",
        );

        Ok(Self {
            fd,
            info,
            units: vec![OaUnitInfo {
                id: 0,
                engines: vec![
                    EngineRef {
                        class: EngineClass::Render,
                        instance: 0,
                    },
                    EngineRef {
                        class: EngineClass::Compute,
                        instance: 0,
                    },
                ],
            }],
        })
    }

    fn observation(&self, op: u64, param: u64) -> Result<i32, Errno> {
        let p = DrmXeObservationParam {
            extensions: 0,
            observation_type: DRM_XE_OBSERVATION_TYPE_OA,
            observation_op: op,
            param,
        };
        // SAFETY: `p` is repr(C), matches the ioctl argument and outlives the
        // call; `param` points at data the caller keeps alive.
        retry(|| unsafe { xe_observation(self.fd.as_raw_fd(), &p) })
    }
}

fn query_rev_and_device_id(fd: &OwnedFd) -> Result<(u32, u32), Errno> {
    let mut q = DrmXeDeviceQuery {
        query: DRM_XE_DEVICE_QUERY_CONFIG,
        ..Default::default()
    };
    // SAFETY: a zero-size query only writes back `size`.
    retry(|| unsafe { xe_device_query(fd.as_raw_fd(), &mut q) })?;

    let words = (q.size as usize).div_ceil(8);
    let mut data = vec![0u64; words];
    q.data = data.as_mut_ptr() as u64;
    // SAFETY: `data` holds `q.size` bytes and outlives the call.
    retry(|| unsafe { xe_device_query(fd.as_raw_fd(), &mut q) })?;

    // Layout: u32 num_params, u32 pad, u64 info[num_params].
    let num_params = (data.first().copied().unwrap_or(0) & 0xffff_ffff) as usize;
    if num_params <= DRM_XE_QUERY_CONFIG_REV_AND_DEVICE_ID {
        return Err(Errno::EINVAL);
    }
    let v = data
        .get(1 + DRM_XE_QUERY_CONFIG_REV_AND_DEVICE_ID)
        .copied()
        .ok_or(Errno::EINVAL)?;
    Ok(((v & 0xffff) as u32, ((v >> 16) & 0xff) as u32))
}

impl OaDevice for XeDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn oa_units(&self) -> &[OaUnitInfo] {
        &self.units
    }

    fn open_stream(
        &self,
        properties: &[(u64, u64)],
        blocking: bool,
    ) -> Result<Arc<dyn OaStream>, Errno> {
        let chain = property_chain(properties)?;
        let param = chain.first().map_or(0, |p| p as *const _ as u64);
        let raw = self.observation(DRM_XE_OBSERVATION_OP_STREAM_OPEN, param)?;
        // SAFETY: the ioctl returned a fresh stream fd owned by nothing else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut flags = OFlag::O_CLOEXEC;
        if !blocking {
            flags |= OFlag::O_NONBLOCK;
        }
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;

        debug!(fd = raw, blocking, "xe OA stream opened");
        Ok(Arc::new(XeStream {
            fd: Mutex::new(Some(fd)),
        }))
    }

    fn add_config(&self, config: &MetricConfigRegs) -> Result<u64, Errno> {
        let mut uuid = [0u8; UUID_LEN];
        if config.uuid.len() != UUID_LEN {
            return Err(Errno::EINVAL);
        }
        uuid.copy_from_slice(config.uuid.as_bytes());

        let regs: Vec<u32> = config
            .regs
            .iter()
            .flat_map(|(addr, value)| [*addr, *value])
            .collect();
        let c = DrmXeOaConfig {
            extensions: 0,
            uuid,
            n_regs: u32::try_from(config.regs.len()).map_err(|_| Errno::EINVAL)?,
            regs_ptr: regs.as_ptr() as u64,
        };
        let id = self.observation(DRM_XE_OBSERVATION_OP_ADD_CONFIG, &c as *const _ as u64)?;
        u64::try_from(id).map_err(|_| Errno::EINVAL)
    }

    fn remove_config(&self, id: u64) -> Result<(), Errno> {
        self.observation(DRM_XE_OBSERVATION_OP_REMOVE_CONFIG, &id as *const u64 as u64)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

struct XeStream {
    fd: Mutex<Option<OwnedFd>>,
}

impl XeStream {
    fn with_fd<T>(&self, f: impl FnOnce(&OwnedFd) -> Result<T, Errno>) -> Result<T, Errno> {
        let guard = self.fd.lock();
        let fd = guard.as_ref().ok_or(Errno::EBADF)?;
        f(fd)
    }

    fn raw_fd(&self) -> Result<i32, Errno> {
        self.with_fd(|fd| Ok(fd.as_raw_fd()))
    }
}

impl OaStream for XeStream {
    fn transport(&self) -> Transport {
        Transport::Raw
    }

    fn read(&self, buf: &mut ReadBuf<'_>) -> Result<usize, Errno> {
        // Blocking reads must not hold the lock, or close could not proceed.
        let fd = self.raw_fd()?;
        nix::unistd::read(fd, buf.mapped_mut())
    }

    fn enable(&self) -> Result<(), Errno> {
        // SAFETY: argument-less ioctl on an open stream fd.
        self.with_fd(|fd| retry(|| unsafe { xe_observation_enable(fd.as_raw_fd()) }))?;
        Ok(())
    }

    fn disable(&self) -> Result<(), Errno> {
        // SAFETY: argument-less ioctl on an open stream fd.
        self.with_fd(|fd| retry(|| unsafe { xe_observation_disable(fd.as_raw_fd()) }))?;
        Ok(())
    }

    fn status(&self) -> Result<OaStatus, Errno> {
        let mut status = DrmXeOaStreamStatus::default();
        // SAFETY: `status` is repr(C) and matches the ioctl argument.
        self.with_fd(|fd| retry(|| unsafe { xe_observation_status(fd.as_raw_fd(), &mut status) }))?;
        Ok(OaStatus::from_bits_truncate(status.oa_status))
    }

    fn poll(&self, timeout: Duration) -> Result<bool, Errno> {
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        self.with_fd(|fd| {
            let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
            loop {
                match poll(&mut fds, PollTimeout::from(ms)) {
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e),
                    Ok(n) => return Ok(n > 0),
                }
            }
        })
    }

    fn map(&self, prot: MapProt) -> Result<Arc<dyn RingMapping>, Errno> {
        if prot.intersects(MapProt::WRITE | MapProt::EXEC) {
            return Err(Errno::EINVAL);
        }
        self.with_fd(|fd| {
            let mut info = DrmXeOaStreamInfo::default();
            // SAFETY: `info` is repr(C) and matches the ioctl argument.
            let len = match retry(|| unsafe { xe_observation_info(fd.as_raw_fd(), &mut info) }) {
                Ok(_) => info.oa_buf_size as usize,
                Err(_) => MAX_OA_BUF_SIZE,
            };
            let len = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
            // SAFETY: a fresh private read-only mapping of the stream fd.
            let addr = unsafe {
                mmap(
                    None,
                    len,
                    ProtFlags::PROT_READ,
                    MapFlags::MAP_PRIVATE,
                    fd.as_fd(),
                    0,
                )?
            };
            Ok(Arc::new(XeRing { addr, len: len.get() }) as Arc<dyn RingMapping>)
        })
    }

    fn close(&self) {
        if self.fd.lock().take().is_some() {
            debug!("xe OA stream closed");
        }
    }
}

/// A read-only mapping of the OA buffer.
struct XeRing {
    addr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is read-only and only ever copied out of.
unsafe impl Send for XeRing {}
// SAFETY: see above.
unsafe impl Sync for XeRing {}

impl RingMapping for XeRing {
    fn len(&self) -> usize {
        self.len
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        for (i, b) in dst.iter_mut().enumerate() {
            let at = (offset + i) % self.len;
            // SAFETY: `at < len` and the mapping lives as long as `self`.
            *b = unsafe { self.addr.as_ptr().cast::<u8>().add(at).read_volatile() };
        }
    }
}

impl Drop for XeRing {
    fn drop(&mut self) {
        // SAFETY: `addr`/`len` came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.addr, self.len) } {
            debug!(error = %e, "munmap of OA buffer failed");
        }
    }
}
