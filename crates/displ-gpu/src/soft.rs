//! In-memory DRM host with a zero-copy device and a display card.
//!
//! Buffer objects created from foreign pages map those pages through the grant table, so their
//! contents are the guest's memory, and they hold the grant mapping until the last handle or
//! PRIME descriptor referring to them is closed. Every ioctl is recorded in an operation log
//! and any of them can be made to fail.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use displ_grant::{GrantMapping, GrantTable};
use tracing::warn;

use crate::{CpuMapping, DrmDevice, DrmError, DumbInfo, ForeignDumbRequest, GemHandle, PrimeFd};

const ENOENT: i32 = 2;
const EFAULT: i32 = 14;
const EINVAL: i32 = 22;
const ENOTTY: i32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    ZeroCopy,
    Card,
}

/// One recorded ioctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrmOp {
    CreateForeignDumb,
    PrimeHandleToFd,
    PrimeFdToHandle,
    CloseFd,
    MapDumb,
    UnmapDumb,
    Flink,
    GemClose(DeviceKind),
}

struct Object {
    pages: GrantMapping,
    size: usize,
    refs: usize,
}

#[derive(Default)]
struct State {
    next_object: u64,
    next_handle: u32,
    next_fd: i32,
    next_map: u64,
    next_name: u32,
    objects: HashMap<u64, Object>,
    handles: HashMap<(DeviceKind, GemHandle), u64>,
    fds: HashMap<PrimeFd, u64>,
    maps: HashMap<u64, u64>,
    names: HashMap<u64, u32>,
    failing: HashSet<DrmOp>,
    log: Vec<DrmOp>,
}

impl State {
    fn check(&mut self, op: DrmOp, ioctl: &'static str) -> Result<(), DrmError> {
        self.log.push(op);
        if self.failing.contains(&op) {
            return Err(DrmError::Rejected { ioctl, errno: EINVAL });
        }
        Ok(())
    }

    fn release_ref(&mut self, object: u64) {
        let gone = match self.objects.get_mut(&object) {
            Some(obj) => {
                obj.refs -= 1;
                obj.refs == 0
            }
            None => false,
        };
        if gone {
            self.objects.remove(&object);
            self.names.remove(&object);
        }
    }
}

/// Shared state behind a [`DeviceKind::ZeroCopy`] and a [`DeviceKind::Card`] device.
#[derive(Clone)]
pub struct SoftDrmHost {
    grants: Arc<dyn GrantTable>,
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SoftDrmHost {
    pub fn new(grants: Arc<dyn GrantTable>) -> Self {
        Self {
            grants,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn zcopy_device(&self) -> Arc<SoftDrmDevice> {
        Arc::new(SoftDrmDevice {
            kind: DeviceKind::ZeroCopy,
            host: self.clone(),
        })
    }

    pub fn card_device(&self) -> Arc<SoftDrmDevice> {
        Arc::new(SoftDrmDevice {
            kind: DeviceKind::Card,
            host: self.clone(),
        })
    }

    /// Make every later `op` fail until [`SoftDrmHost::clear_failures`].
    pub fn fail(&self, op: DrmOp) {
        lock(&self.state).failing.insert(op);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failing.clear();
    }

    pub fn log(&self) -> Vec<DrmOp> {
        lock(&self.state).log.clone()
    }

    pub fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    pub fn count(&self, op: DrmOp) -> usize {
        lock(&self.state).log.iter().filter(|o| **o == op).count()
    }

    pub fn open_handles(&self) -> usize {
        lock(&self.state).handles.len()
    }

    pub fn open_fds(&self) -> usize {
        lock(&self.state).fds.len()
    }

    pub fn cpu_mappings(&self) -> usize {
        lock(&self.state).maps.len()
    }

    pub fn live_objects(&self) -> usize {
        lock(&self.state).objects.len()
    }
}

pub struct SoftDrmDevice {
    kind: DeviceKind,
    host: SoftDrmHost,
}

impl SoftDrmDevice {
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn object_of(state: &State, kind: DeviceKind, handle: GemHandle, ioctl: &'static str) -> Result<u64, DrmError> {
        state
            .handles
            .get(&(kind, handle))
            .copied()
            .ok_or(DrmError::Rejected { ioctl, errno: ENOENT })
    }
}

impl DrmDevice for SoftDrmDevice {
    fn create_foreign_dumb(&self, req: &ForeignDumbRequest<'_>) -> Result<DumbInfo, DrmError> {
        const IOCTL: &str = "XEN_ZCOPY_CREATE_DUMB";
        if self.kind != DeviceKind::ZeroCopy {
            return Err(DrmError::Rejected { ioctl: IOCTL, errno: ENOTTY });
        }
        lock(&self.host.state).check(DrmOp::CreateForeignDumb, IOCTL)?;

        let stride = u64::from(req.width) * u64::from(req.bpp.div_ceil(8));
        let size = stride * u64::from(req.height);
        let available = (req.refs.len() * displ_grant::XEN_PAGE_SIZE) as u64;
        if size == 0 || size > available || stride > u64::from(u32::MAX) {
            return Err(DrmError::Rejected { ioctl: IOCTL, errno: EINVAL });
        }
        let pages = GrantMapping::map(self.host.grants.clone(), req.domid, req.refs.to_vec())
            .map_err(|err| {
                warn!(domid = req.domid, error = %err, "zero-copy device cannot map guest pages");
                DrmError::Rejected { ioctl: IOCTL, errno: EFAULT }
            })?;

        let mut state = lock(&self.host.state);
        state.next_object += 1;
        state.next_handle += 1;
        let object = state.next_object;
        let handle = GemHandle(state.next_handle);
        state.objects.insert(
            object,
            Object {
                pages,
                size: size as usize,
                refs: 1,
            },
        );
        state.handles.insert((self.kind, handle), object);
        Ok(DumbInfo {
            handle,
            stride: stride as u32,
            size,
        })
    }

    fn prime_handle_to_fd(&self, handle: GemHandle) -> Result<PrimeFd, DrmError> {
        const IOCTL: &str = "PRIME_HANDLE_TO_FD";
        let mut state = lock(&self.host.state);
        state.check(DrmOp::PrimeHandleToFd, IOCTL)?;
        let object = Self::object_of(&state, self.kind, handle, IOCTL)?;
        state.next_fd += 1;
        let fd = PrimeFd(state.next_fd + 2);
        state.fds.insert(fd, object);
        if let Some(obj) = state.objects.get_mut(&object) {
            obj.refs += 1;
        }
        Ok(fd)
    }

    fn prime_fd_to_handle(&self, fd: PrimeFd) -> Result<GemHandle, DrmError> {
        const IOCTL: &str = "PRIME_FD_TO_HANDLE";
        let mut state = lock(&self.host.state);
        state.check(DrmOp::PrimeFdToHandle, IOCTL)?;
        let object = state
            .fds
            .get(&fd)
            .copied()
            .ok_or(DrmError::Rejected { ioctl: IOCTL, errno: EINVAL })?;
        state.next_handle += 1;
        let handle = GemHandle(state.next_handle);
        state.handles.insert((self.kind, handle), object);
        if let Some(obj) = state.objects.get_mut(&object) {
            obj.refs += 1;
        }
        Ok(handle)
    }

    fn close_fd(&self, fd: PrimeFd) {
        let mut state = lock(&self.host.state);
        state.log.push(DrmOp::CloseFd);
        match state.fds.remove(&fd) {
            Some(object) => state.release_ref(object),
            None => warn!(fd = fd.0, "close of unknown prime fd"),
        }
    }

    fn map_dumb(&self, handle: GemHandle, size: usize) -> Result<CpuMapping, DrmError> {
        const IOCTL: &str = "MODE_MAP_DUMB";
        let mut state = lock(&self.host.state);
        state.check(DrmOp::MapDumb, IOCTL)?;
        let object = Self::object_of(&state, self.kind, handle, IOCTL)?;
        let fits = state.objects.get(&object).is_some_and(|o| size <= o.size);
        if !fits {
            return Err(DrmError::Rejected { ioctl: IOCTL, errno: EINVAL });
        }
        state.next_map += 1;
        let id = state.next_map;
        state.maps.insert(id, object);
        Ok(CpuMapping { id, size })
    }

    fn unmap_dumb(&self, mapping: CpuMapping) {
        let mut state = lock(&self.host.state);
        state.log.push(DrmOp::UnmapDumb);
        if state.maps.remove(&mapping.id).is_none() {
            warn!(id = mapping.id, "munmap of unknown mapping");
        }
    }

    fn read_mapping(&self, mapping: CpuMapping, offset: usize, dst: &mut [u8]) -> Result<(), DrmError> {
        const IOCTL: &str = "mmap read";
        let state = lock(&self.host.state);
        let fault = DrmError::Rejected { ioctl: IOCTL, errno: EFAULT };
        let object = state.maps.get(&mapping.id).ok_or(fault.clone())?;
        let obj = state.objects.get(object).ok_or(fault.clone())?;
        match offset.checked_add(dst.len()) {
            Some(end) if end <= mapping.size.min(obj.size) => {}
            _ => return Err(fault),
        }
        obj.pages.read_at(offset, dst).map_err(|_| fault)
    }

    fn gem_flink(&self, handle: GemHandle) -> Result<u32, DrmError> {
        const IOCTL: &str = "GEM_FLINK";
        let mut state = lock(&self.host.state);
        state.check(DrmOp::Flink, IOCTL)?;
        let object = Self::object_of(&state, self.kind, handle, IOCTL)?;
        if let Some(name) = state.names.get(&object) {
            return Ok(*name);
        }
        state.next_name += 1;
        let name = state.next_name;
        state.names.insert(object, name);
        Ok(name)
    }

    fn gem_close(&self, handle: GemHandle) {
        let mut state = lock(&self.host.state);
        state.log.push(DrmOp::GemClose(self.kind));
        match state.handles.remove(&(self.kind, handle)) {
            Some(object) => state.release_ref(object),
            None => warn!(handle = handle.0, kind = ?self.kind, "close of unknown gem handle"),
        }
    }
}
