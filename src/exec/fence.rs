use crate::error::{ExecError, ExecResult};
use crate::exec::objects::CancelToken;
use crate::svga::abi::DRM_VMW_FENCE_FLAG_EXEC;
use crate::svga::fifo::CommandRing;
use bitflags::bitflags;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, trace, warn};

/// Seqnos further apart than this are treated as having wrapped.
pub const VMW_FENCE_WRAP: u32 = 1 << 24;

const SPIN_DURATION: Duration = Duration::from_micros(20);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

bitflags! {
    /// What a fence guards.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FenceFlags: u32 {
        const EXEC = DRM_VMW_FENCE_FLAG_EXEC;
    }
}

/// `true` if `seqno` is at or before `last_read` in wrap-around order.
#[must_use]
pub const fn seqno_passed(last_read: u32, seqno: u32) -> bool {
    last_read.wrapping_sub(seqno) < VMW_FENCE_WRAP
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    seqno: u32,
    submitted: Instant,
}

struct WaitGuard<'a>(&'a FenceManager);
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Outcome of the fence step of a submission.
#[derive(Debug, Clone)]
pub enum SubmitStatus {
    /// The batch is guarded by the contained fence.
    Fenced(Arc<Fence>),
    /// The marker could not be emitted; the ring was drained synchronously
    /// and the batch is already complete. `cause` is the emission error.
    Synced { seqno: u32, cause: ExecError },
    /// The marker could not be emitted and the ring did not drain either.
    /// `fence` stands for the consumed seqno and passes once the device
    /// reports any later marker.
    Unsynced { fence: Arc<Fence>, cause: ExecError },
}

impl SubmitStatus {
    #[must_use]
    pub fn fence(&self) -> Option<&Arc<Fence>> {
        match self {
            Self::Fenced(fence) | Self::Unsynced { fence, .. } => Some(fence),
            Self::Synced { .. } => None,
        }
    }

    #[must_use]
    pub fn seqno(&self) -> u32 {
        match self {
            Self::Fenced(fence) | Self::Unsynced { fence, .. } => fence.seqno(),
            Self::Synced { seqno, .. } => *seqno,
        }
    }
}

/// Issues fence markers into the ring and tracks how far the device got.
pub struct FenceManager {
    ring: Arc<dyn CommandRing>,
    /// Last seqno handed out.
    fence_seq: AtomicU32,
    /// Last seqno known passed by the device.
    last_read_seqno: AtomicU32,
    /// Threads currently blocked in [`FenceManager::wait`].
    waiters: AtomicU32,
    /// Emitted markers not yet passed, oldest first. Drives throttling.
    markers: Mutex<VecDeque<Marker>>,
    timeout: Duration,
}

impl fmt::Debug for FenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceManager")
            .field("fence_seq", &self.fence_seq)
            .field("last_read_seqno", &self.last_read_seqno)
            .field("waiters", &self.waiters)
            .finish_non_exhaustive()
    }
}

impl FenceManager {
    /// Starts numbering right after whatever the device reports as passed.
    #[must_use]
    pub fn new(ring: Arc<dyn CommandRing>, timeout: Duration) -> Self {
        let start = ring.hw_seqno();
        Self {
            ring,
            fence_seq: AtomicU32::new(start),
            last_read_seqno: AtomicU32::new(start),
            waiters: AtomicU32::new(0),
            markers: Mutex::new(VecDeque::new()),
            timeout,
        }
    }

    fn markers(&self) -> MutexGuard<'_, VecDeque<Marker>> {
        self.markers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn last_read_seqno(&self) -> u32 {
        self.last_read_seqno.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of emitted markers the device has not passed yet.
    #[must_use]
    pub fn outstanding_markers(&self) -> usize {
        self.update_seqno();
        self.markers().len()
    }

    /// Advances `last_read_seqno` to the device's value. Never moves backwards.
    pub fn update_seqno(&self) -> u32 {
        let hw = self.ring.hw_seqno();
        self.advance(hw)
    }

    fn advance(&self, seqno: u32) -> u32 {
        let mut last = self.last_read_seqno.load(Ordering::Acquire);
        while seqno != last && seqno_passed(seqno, last) {
            match self.last_read_seqno.compare_exchange_weak(
                last,
                seqno,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    last = seqno;
                    break;
                }
                Err(current) => last = current,
            }
        }

        let mut markers = self.markers();
        while markers.front().is_some_and(|m| seqno_passed(last, m.seqno)) {
            markers.pop_front();
        }
        last
    }

    #[must_use]
    pub fn passed(&self, seqno: u32) -> bool {
        seqno_passed(self.last_read_seqno(), seqno) || seqno_passed(self.update_seqno(), seqno)
    }

    /// Emits the next marker. On failure the seqno is still consumed and
    /// returned with the error so the caller can sync past it.
    fn emit(&self) -> Result<u32, (u32, ExecError)> {
        let seqno = self.fence_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.ring.emit_fence(seqno).map_err(|e| (seqno, e))?;
        self.markers().push_back(Marker {
            seqno,
            submitted: Instant::now(),
        });
        Ok(seqno)
    }

    /// Drains the ring and marks everything up to `seqno` as passed.
    fn sync(&self, seqno: u32) -> ExecResult<()> {
        self.ring.wait_idle(self.timeout)?;
        self.advance(seqno);
        Ok(())
    }

    fn fence_for(self: &Arc<Self>, seqno: u32) -> Arc<Fence> {
        Arc::new(Fence {
            seqno,
            flags: FenceFlags::EXEC,
            manager: Arc::clone(self),
        })
    }

    /// Creates and submits a command stream fence.
    ///
    /// If the marker cannot be emitted the ring is synced and no fence object
    /// is returned; buffers can then be fenced with `None`. If the sync fails
    /// as well, nothing is marked passed.
    pub fn fence_commands(self: &Arc<Self>) -> SubmitStatus {
        match self.emit() {
            Ok(seqno) => SubmitStatus::Fenced(self.fence_for(seqno)),
            Err((seqno, cause)) => {
                error!("Fence submission error. Syncing.");
                match self.sync(seqno) {
                    Ok(()) => SubmitStatus::Synced { seqno, cause },
                    Err(e) => {
                        warn!(seqno, "Fallback wait for idle failed: {e}");
                        SubmitStatus::Unsynced {
                            fence: self.fence_for(seqno),
                            cause,
                        }
                    }
                }
            }
        }
    }

    /// Blocks until `seqno` has passed, `timeout` elapses or `cancel` fires.
    pub fn wait(
        &self,
        seqno: u32,
        cancel: Option<&CancelToken>,
        timeout: Duration,
    ) -> ExecResult<()> {
        if self.passed(seqno) {
            return Ok(());
        }

        self.waiters.fetch_add(1, Ordering::Relaxed);
        let _guard = WaitGuard(self);
        let start = Instant::now();

        loop {
            if self.passed(seqno) {
                return Ok(());
            }
            if let Some(cancel) = cancel {
                cancel.check()?;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ExecError::FenceTimeout);
            }

            if elapsed < SPIN_DURATION {
                std::hint::spin_loop();
            } else {
                thread::sleep((timeout - elapsed).min(POLL_INTERVAL));
            }
        }
    }

    /// Blocks until the oldest unpassed marker is at most `budget` old.
    pub fn wait_lag(&self, budget: Duration, cancel: Option<&CancelToken>) -> ExecResult<()> {
        loop {
            self.update_seqno();
            let Some(oldest) = self.markers().front().copied() else {
                return Ok(());
            };
            if oldest.submitted.elapsed() <= budget {
                return Ok(());
            }
            trace!(seqno = oldest.seqno, "throttling on lagging marker");
            self.wait(oldest.seqno, cancel, self.timeout)?;
        }
    }
}

/// A device-order completion marker.
#[derive(Debug)]
pub struct Fence {
    seqno: u32,
    flags: FenceFlags,
    manager: Arc<FenceManager>,
}

impl Fence {
    #[must_use]
    pub const fn seqno(&self) -> u32 {
        self.seqno
    }

    #[must_use]
    pub const fn flags(&self) -> FenceFlags {
        self.flags
    }

    #[must_use]
    pub fn signaled(&self) -> bool {
        self.manager.passed(self.seqno)
    }

    pub fn wait(&self, cancel: Option<&CancelToken>, timeout: Duration) -> ExecResult<()> {
        self.manager.wait(self.seqno, cancel, timeout)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        trace!(seqno = self.seqno, "fence destroyed");
    }
}

#[derive(Debug)]
struct UserFences {
    next_handle: u32,
    fences: HashMap<u32, Arc<Fence>>,
}

/// Per-client fence handles.
#[derive(Debug)]
pub struct UserFenceTable {
    inner: Mutex<UserFences>,
}

impl Default for UserFenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UserFenceTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(UserFences {
                next_handle: 1,
                fences: HashMap::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, UserFences> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a new non-zero handle referencing `fence`.
    pub fn insert(&self, fence: Arc<Fence>) -> u32 {
        let mut inner = self.inner();
        let mut handle = inner.next_handle;
        while handle == 0 || inner.fences.contains_key(&handle) {
            handle = handle.wrapping_add(1);
        }
        inner.next_handle = handle.wrapping_add(1);
        inner.fences.insert(handle, fence);
        handle
    }

    pub fn get(&self, handle: u32) -> ExecResult<Arc<Fence>> {
        self.inner()
            .fences
            .get(&handle)
            .cloned()
            .ok_or(ExecError::UnknownFence(handle))
    }

    pub fn remove(&self, handle: u32) -> ExecResult<Arc<Fence>> {
        self.inner()
            .fences
            .remove(&handle)
            .ok_or(ExecError::UnknownFence(handle))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner().fences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
