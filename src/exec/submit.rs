use crate::error::{ExecError, ExecResult};
use crate::exec::config::DeviceConfig;
use crate::exec::fence::{FenceManager, SubmitStatus};
use crate::exec::objects::{CancelToken, ClientFile, ObjectTable};
use crate::exec::placement::{BufferObject, DevicePlacement, PlacementEngine};
use crate::exec::reloc::RelocationTable;
use crate::exec::tracker::ValidationList;
use crate::exec::validate::SwContext;
use crate::svga::abi::{DRM_VMW_FENCE_FLAG_EXEC, FenceRep};
use crate::svga::fifo::CommandRing;
use crate::utils::page_align;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

// ===============================================================================================
// Arguments and Results
// ===============================================================================================

/// Receives the fence result of a submission.
pub trait FenceRepSink {
    fn deliver(&mut self, rep: &FenceRep) -> ExecResult<()>;
}

impl FenceRepSink for Option<FenceRep> {
    fn deliver(&mut self, rep: &FenceRep) -> ExecResult<()> {
        *self = Some(*rep);
        Ok(())
    }
}

/// One submission request.
///
/// Only the first `command_size` bytes of `commands` are submitted.
pub struct ExecbufArg<'a> {
    pub commands: &'a [u8],
    pub command_size: u32,
    pub fence_rep: Option<&'a mut dyn FenceRepSink>,
    /// Maximum lag, in microseconds, of the oldest unsignaled fence before
    /// the submission is allowed onto the ring. Zero disables throttling.
    pub throttle_us: u32,
}

impl<'a> ExecbufArg<'a> {
    /// Submits all of `commands`.
    #[must_use]
    pub fn new(commands: &'a [u8]) -> Self {
        Self {
            commands,
            command_size: u32::try_from(commands.len()).unwrap_or(u32::MAX),
            fence_rep: None,
            throttle_us: 0,
        }
    }

    #[must_use]
    pub const fn with_command_size(mut self, size: u32) -> Self {
        self.command_size = size;
        self
    }

    #[must_use]
    pub fn with_fence_rep(mut self, sink: &'a mut dyn FenceRepSink) -> Self {
        self.fence_rep = Some(sink);
        self
    }

    #[must_use]
    pub const fn with_throttle_us(mut self, throttle_us: u32) -> Self {
        self.throttle_us = throttle_us;
        self
    }
}

impl fmt::Debug for ExecbufArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecbufArg")
            .field("len", &self.commands.len())
            .field("command_size", &self.command_size)
            .field("fence_rep", &self.fence_rep.is_some())
            .field("throttle_us", &self.throttle_us)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ExecbufReply {
    pub status: SubmitStatus,
    /// Client fence handle, if a result slot was supplied and a fence exists.
    pub handle: Option<u32>,
    pub seqno: u32,
    pub passed_seqno: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceSignaled {
    pub signaled: bool,
    pub passed_seqno: u32,
}

// ===============================================================================================
// Device
// ===============================================================================================

#[derive(Debug)]
struct SubmitState {
    bounce: Vec<u8>,
    list: ValidationList,
    relocs: RelocationTable,
}

/// The submission front end of one SVGA device.
pub struct SvgaDevice {
    config: DeviceConfig,
    objects: ObjectTable,
    ring: Arc<dyn CommandRing>,
    fman: Arc<FenceManager>,
    engine: Mutex<PlacementEngine>,
    cmdbuf: Mutex<SubmitState>,
}

impl fmt::Debug for SvgaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SvgaDevice")
            .field("config", &self.config)
            .field("fman", &self.fman)
            .finish_non_exhaustive()
    }
}

impl SvgaDevice {
    #[must_use]
    pub fn new(config: DeviceConfig, ring: Arc<dyn CommandRing>) -> Self {
        let fman = Arc::new(FenceManager::new(
            Arc::clone(&ring),
            config.fence_wait_timeout,
        ));
        Self {
            objects: ObjectTable::new(),
            engine: Mutex::new(PlacementEngine::new(&config)),
            cmdbuf: Mutex::new(SubmitState {
                bounce: Vec::new(),
                list: ValidationList::new(config.max_resources, config.max_buffers),
                relocs: RelocationTable::new(config.max_relocations),
            }),
            config,
            ring,
            fman,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    #[must_use]
    pub fn fence_manager(&self) -> &Arc<FenceManager> {
        &self.fman
    }

    #[must_use]
    pub fn open_client(&self, privileged: bool) -> ClientFile {
        self.objects.open_client(privileged)
    }

    fn engine(&self) -> MutexGuard<'_, PlacementEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cmdbuf(&self) -> MutexGuard<'_, SubmitState> {
        self.cmdbuf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current placement of one of `client`'s DMA buffers; `None` means
    /// system memory.
    pub fn placement_of(&self, client: &ClientFile, handle: u32) -> ExecResult<Option<DevicePlacement>> {
        let bo = self.objects.dmabuf(client, handle)?;
        Ok(self.engine().placement_of(&bo))
    }

    /// Size of the command bounce buffer. Grows on demand, never shrinks.
    #[must_use]
    pub fn bounce_size(&self) -> usize {
        self.cmdbuf().bounce.len()
    }

    // -------------------------------------------------------------------------------------------
    // Execbuf
    // -------------------------------------------------------------------------------------------

    /// Validates, relocates and submits a command buffer.
    ///
    /// Nothing reaches the ring unless validation, placement and relocation
    /// all succeed. Every resource and buffer reference taken for the
    /// submission is released before returning, on every path.
    pub fn execbuf(&self, client: &ClientFile, arg: ExecbufArg<'_>) -> ExecResult<ExecbufReply> {
        let cancel = client.cancel_token();
        cancel.check()?;

        let declared = arg.command_size as usize;
        if declared > arg.commands.len() {
            return Err(ExecError::BadCommandBuffer {
                declared,
                available: arg.commands.len(),
            });
        }

        let status = {
            let mut state = self.cmdbuf();
            let SubmitState {
                bounce,
                list,
                relocs,
            } = &mut *state;

            grow_bounce(bounce, declared, self.config.cmd_bounce_init_size);
            let cmds = &mut bounce[..declared];
            cmds.copy_from_slice(&arg.commands[..declared]);

            let result = self.submit_locked(client, cmds, list, relocs, arg.throttle_us);
            list.clear();
            relocs.clear();
            result?
        };

        debug!(client = client.id(), len = declared, seqno = status.seqno(), "execbuf");
        self.deliver(client, status, arg.fence_rep)
    }

    fn submit_locked(
        &self,
        client: &ClientFile,
        cmds: &mut [u8],
        list: &mut ValidationList,
        relocs: &mut RelocationTable,
        throttle_us: u32,
    ) -> ExecResult<SubmitStatus> {
        let cancel = client.cancel_token();

        SwContext::new(client, &self.objects, list, relocs).check_all(cmds)?;

        list.reserve_all(cancel)?;
        self.place_buffers(list, cancel)?;
        relocs.apply(cmds, list)?;

        if throttle_us > 0 {
            self.fman
                .wait_lag(Duration::from_micros(u64::from(throttle_us)), Some(cancel))?;
        }

        self.ring.write_commands(cmds).inspect_err(|e| {
            error!("Failed reserving fifo space for commands: {e}");
        })?;

        let status = self.fman.fence_commands();
        let fence = status.fence().cloned();
        let mut engine = self.engine();
        for tracked in list.buffers() {
            tracked.bo.fence(fence.clone());
            engine.fence(&tracked.bo, fence.clone());
        }
        Ok(status)
    }

    fn place_buffers(&self, list: &mut ValidationList, cancel: &CancelToken) -> ExecResult<()> {
        let mut engine = self.engine();
        for tracked in list.buffers_mut() {
            let placement = engine.validate(&tracked.bo, cancel)?;
            tracked.placement = Some(placement);
        }
        Ok(())
    }

    fn deliver(
        &self,
        client: &ClientFile,
        status: SubmitStatus,
        sink: Option<&mut dyn FenceRepSink>,
    ) -> ExecResult<ExecbufReply> {
        let seqno = status.seqno();
        let passed_seqno = self.fman.update_seqno();

        let Some(sink) = sink else {
            return Ok(ExecbufReply {
                status,
                handle: None,
                seqno,
                passed_seqno,
            });
        };

        let mut rep = FenceRep {
            mask: DRM_VMW_FENCE_FLAG_EXEC,
            seqno,
            passed_seqno,
            ..FenceRep::default()
        };
        let handle = match &status {
            SubmitStatus::Fenced(fence) => {
                let handle = client.fences().insert(Arc::clone(fence));
                rep.handle = handle;
                Some(handle)
            }
            SubmitStatus::Unsynced { fence, cause } => {
                let handle = client.fences().insert(Arc::clone(fence));
                rep.handle = handle;
                rep.error = cause.errno();
                Some(handle)
            }
            SubmitStatus::Synced { cause, .. } => {
                rep.error = cause.errno();
                None
            }
        };

        if let Err(e) = sink.deliver(&rep) {
            error!("Failed copying fence result to client: {e}");
            if let Some(handle) = handle {
                let _ = client.fences().remove(handle);
            }
            if let Some(fence) = status.fence() {
                if let Err(e) = fence.wait(None, self.config.fence_wait_timeout) {
                    warn!(seqno, "Waiting on undeliverable fence failed: {e}");
                }
            }
            return Err(ExecError::Delivery { seqno });
        }

        Ok(ExecbufReply {
            status,
            handle,
            seqno,
            passed_seqno,
        })
    }

    // -------------------------------------------------------------------------------------------
    // Client fence handles
    // -------------------------------------------------------------------------------------------

    /// Waits on a client fence handle, interruptibly.
    pub fn fence_wait(&self, client: &ClientFile, handle: u32, timeout: Duration) -> ExecResult<()> {
        let fence = client.fences().get(handle)?;
        fence.wait(Some(client.cancel_token()), timeout)
    }

    pub fn fence_signaled(&self, client: &ClientFile, handle: u32) -> ExecResult<FenceSignaled> {
        let fence = client.fences().get(handle)?;
        Ok(FenceSignaled {
            signaled: fence.signaled(),
            passed_seqno: self.fman.last_read_seqno(),
        })
    }

    pub fn fence_unref(&self, client: &ClientFile, handle: u32) -> ExecResult<()> {
        client.fences().remove(handle).map(drop)
    }

    /// Moves one of `client`'s buffers back to system memory, waiting for the
    /// device to finish with it.
    pub fn evict_dmabuf(&self, client: &ClientFile, handle: u32) -> ExecResult<()> {
        let bo: Arc<BufferObject> = self.objects.dmabuf(client, handle)?;
        self.engine().release(&bo, client.cancel_token())
    }
}

/// Grows the bounce buffer to hold `needed` bytes: start at `init`, then
/// by half again until it fits, rounded up to a page.
fn grow_bounce(bounce: &mut Vec<u8>, needed: usize, init: usize) {
    if needed <= bounce.len() {
        return;
    }
    let mut size = if bounce.is_empty() { init } else { bounce.len() };
    while size < needed {
        size += (size / 2).max(1);
    }
    bounce.resize(page_align(size), 0);
}
