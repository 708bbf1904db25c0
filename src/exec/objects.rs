use crate::error::{ExecError, ExecResult};
use crate::exec::fence::UserFenceTable;
use crate::exec::placement::BufferObject;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

// ===============================================================================================
// Cancellation
// ===============================================================================================

/// Interrupt flag for the blocking parts of a submission.
///
/// Clones share the flag, so another thread can interrupt a client that is
/// stuck in a fence wait, an eviction or a reservation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Interrupted)` once [`CancelToken::cancel`] has been called.
    pub fn check(&self) -> ExecResult<()> {
        if self.is_cancelled() {
            Err(ExecError::Interrupted)
        } else {
            Ok(())
        }
    }
}

// ===============================================================================================
// Resources
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Context,
    Surface,
}

/// A context or surface. `handle` is what the client writes in its commands,
/// `id` is what the device understands.
#[derive(Debug)]
pub struct Resource {
    pub kind: ResourceKind,
    pub handle: u32,
    pub id: u32,
    pub owner: u32,
    pub shareable: bool,
}

impl Resource {
    const fn visible_to(&self, client: &ClientFile) -> bool {
        self.owner == client.id || self.shareable
    }
}

/// An open device file.
#[derive(Debug)]
pub struct ClientFile {
    id: u32,
    privileged: bool,
    cancel: CancelToken,
    fences: UserFenceTable,
}

impl ClientFile {
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Privileged clients may embed object definition commands in a stream.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        self.privileged
    }

    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    #[must_use]
    pub const fn fences(&self) -> &UserFenceTable {
        &self.fences
    }
}

#[derive(Debug)]
struct DmaBuffer {
    bo: Arc<BufferObject>,
    owner: u32,
}

#[derive(Debug, Default)]
struct Namespace {
    contexts: HashMap<u32, Arc<Resource>>,
    surfaces: HashMap<u32, Arc<Resource>>,
    dmabufs: HashMap<u32, DmaBuffer>,
}

/// Device-wide object registry.
///
/// Contexts are addressed by their device id. Surfaces and DMA buffers get
/// client handles from a shared counter, distinct from the surface's device
/// id.
#[derive(Debug)]
pub struct ObjectTable {
    ns: RwLock<Namespace>,
    next_client: AtomicU32,
    next_handle: AtomicU32,
    next_cid: AtomicU32,
    next_sid: AtomicU32,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ns: RwLock::new(Namespace::default()),
            next_client: AtomicU32::new(1),
            next_handle: AtomicU32::new(1),
            next_cid: AtomicU32::new(1),
            next_sid: AtomicU32::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Namespace> {
        self.ns.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Namespace> {
        self.ns.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn open_client(&self, privileged: bool) -> ClientFile {
        ClientFile {
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            privileged,
            cancel: CancelToken::new(),
            fences: UserFenceTable::new(),
        }
    }

    // -------------------------------------------------------------------------------------------
    // Control operations
    // -------------------------------------------------------------------------------------------

    pub fn define_context(&self, client: &ClientFile) -> u32 {
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let res = Arc::new(Resource {
            kind: ResourceKind::Context,
            handle: cid,
            id: cid,
            owner: client.id,
            shareable: false,
        });
        self.write().contexts.insert(cid, res);
        debug!(client = client.id, cid, "context defined");
        cid
    }

    /// Drops the table's reference; submissions in flight keep theirs.
    pub fn destroy_context(&self, client: &ClientFile, cid: u32) -> ExecResult<()> {
        let mut ns = self.write();
        match ns.contexts.get(&cid) {
            Some(res) if res.owner == client.id => {
                ns.contexts.remove(&cid);
                Ok(())
            }
            _ => Err(ExecError::UnknownContext(cid)),
        }
    }

    /// Returns the client handle of the new surface.
    pub fn define_surface(&self, client: &ClientFile, shareable: bool) -> u32 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let res = Arc::new(Resource {
            kind: ResourceKind::Surface,
            handle,
            id: sid,
            owner: client.id,
            shareable,
        });
        self.write().surfaces.insert(handle, res);
        debug!(client = client.id, handle, sid, "surface defined");
        handle
    }

    pub fn destroy_surface(&self, client: &ClientFile, handle: u32) -> ExecResult<()> {
        let mut ns = self.write();
        match ns.surfaces.get(&handle) {
            Some(res) if res.owner == client.id => {
                ns.surfaces.remove(&handle);
                Ok(())
            }
            _ => Err(ExecError::UnknownSurface(handle)),
        }
    }

    /// Creates a DMA buffer of `size` bytes in system memory.
    pub fn alloc_dmabuf(&self, client: &ClientFile, size: usize) -> u32 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let bo = BufferObject::new(handle, size.max(1));
        self.write().dmabufs.insert(
            handle,
            DmaBuffer {
                bo,
                owner: client.id,
            },
        );
        debug!(client = client.id, handle, size, "dma buffer allocated");
        handle
    }

    pub fn unref_dmabuf(&self, client: &ClientFile, handle: u32) -> ExecResult<()> {
        let mut ns = self.write();
        match ns.dmabufs.get(&handle) {
            Some(buf) if buf.owner == client.id => {
                ns.dmabufs.remove(&handle);
                Ok(())
            }
            _ => Err(ExecError::UnknownBuffer(handle)),
        }
    }

    // -------------------------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------------------------

    pub fn context(&self, client: &ClientFile, cid: u32) -> ExecResult<Arc<Resource>> {
        self.read()
            .contexts
            .get(&cid)
            .filter(|res| res.visible_to(client))
            .cloned()
            .ok_or(ExecError::UnknownContext(cid))
    }

    pub fn surface(&self, client: &ClientFile, handle: u32) -> ExecResult<Arc<Resource>> {
        self.read()
            .surfaces
            .get(&handle)
            .filter(|res| res.visible_to(client))
            .cloned()
            .ok_or(ExecError::UnknownSurface(handle))
    }

    pub fn dmabuf(&self, client: &ClientFile, handle: u32) -> ExecResult<Arc<BufferObject>> {
        self.read()
            .dmabufs
            .get(&handle)
            .filter(|buf| buf.owner == client.id)
            .map(|buf| Arc::clone(&buf.bo))
            .ok_or(ExecError::UnknownBuffer(handle))
    }
}
