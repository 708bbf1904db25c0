use crate::error::{ExecError, ExecResult};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

/// Size of the marker command the ring emits for a fence (`SVGA_CMD_FENCE` + seqno).
pub const FENCE_CMD_LEN: usize = 8;

/// Fence register value right after device init, chosen so wrap-around is
/// exercised early.
pub const FIFO_INITIAL_SEQNO: u32 = 0u32.wrapping_sub(100);

/// The hardware command ring as seen by the submission path.
///
/// Implementations own the byte-level FIFO protocol. The submission path only
/// needs an atomic reserve+copy+commit, a fence marker and progress queries.
pub trait CommandRing: Send + Sync {
    /// Reserves `bytes.len()` contiguous bytes, copies `bytes` in and commits
    /// them. Either every byte becomes visible to the device or none does.
    fn write_commands(&self, bytes: &[u8]) -> ExecResult<()>;

    /// Emits a fence marker for `seqno` behind everything committed so far.
    fn emit_fence(&self, seqno: u32) -> ExecResult<()>;

    /// Last fence seqno the device has passed.
    fn hw_seqno(&self) -> u32;

    /// Blocks until the device has consumed every committed byte.
    fn wait_idle(&self, timeout: Duration) -> ExecResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingEntry {
    Commands(usize),
    Fence(u32),
}

#[derive(Debug, Default)]
struct FifoState {
    pending: VecDeque<RingEntry>,
    used: usize,
    hw_seqno: u32,
    batches: Vec<Vec<u8>>,
    bytes_written: u64,
    fail_fences: bool,
    fail_writes: bool,
    fail_drains: bool,
}

/// A software command ring.
///
/// Committed batches are kept for inspection and "executed" only when
/// [`SoftFifo::process`] or [`SoftFifo::process_all`] is called, which lets
/// callers hold the device busy for as long as a scenario needs.
#[derive(Debug)]
pub struct SoftFifo {
    capacity: usize,
    state: Mutex<FifoState>,
}

impl SoftFifo {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(FifoState {
                hw_seqno: FIFO_INITIAL_SEQNO,
                ..FifoState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FifoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lets the device consume up to `entries` ring entries.
    pub fn process(&self, entries: usize) {
        let mut state = self.state();
        for _ in 0..entries {
            let Some(entry) = state.pending.pop_front() else {
                break;
            };
            match entry {
                RingEntry::Commands(len) => state.used -= len,
                RingEntry::Fence(seqno) => {
                    state.used -= FENCE_CMD_LEN;
                    state.hw_seqno = seqno;
                    trace!(seqno, "fence passed");
                }
            }
        }
    }

    pub fn process_all(&self) {
        self.process(usize::MAX);
    }

    /// Copies of every batch committed so far, in commit order.
    #[must_use]
    pub fn committed_batches(&self) -> Vec<Vec<u8>> {
        self.state().batches.clone()
    }

    /// Total command bytes committed (fence markers excluded).
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.state().bytes_written
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state().pending.is_empty()
    }

    /// Makes subsequent fence emissions fail.
    pub fn set_fence_failure(&self, fail: bool) {
        self.state().fail_fences = fail;
    }

    /// Makes subsequent command writes fail.
    pub fn set_write_failure(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Makes [`CommandRing::wait_idle`] fail without consuming anything.
    pub fn set_drain_failure(&self, fail: bool) {
        self.state().fail_drains = fail;
    }

    fn reserve(&self, state: &mut FifoState, len: usize) -> ExecResult<()> {
        if state.used + len > self.capacity {
            return Err(ExecError::RingFull { requested: len });
        }
        state.used += len;
        Ok(())
    }
}

impl CommandRing for SoftFifo {
    fn write_commands(&self, bytes: &[u8]) -> ExecResult<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(ExecError::RingFailed("command write rejected".into()));
        }
        self.reserve(&mut state, bytes.len())?;
        state.pending.push_back(RingEntry::Commands(bytes.len()));
        state.batches.push(bytes.to_vec());
        state.bytes_written += bytes.len() as u64;
        debug!(len = bytes.len(), used = state.used, "fifo commit");
        Ok(())
    }

    fn emit_fence(&self, seqno: u32) -> ExecResult<()> {
        let mut state = self.state();
        if state.fail_fences {
            return Err(ExecError::RingFailed("fence marker rejected".into()));
        }
        self.reserve(&mut state, FENCE_CMD_LEN)?;
        state.pending.push_back(RingEntry::Fence(seqno));
        Ok(())
    }

    fn hw_seqno(&self) -> u32 {
        self.state().hw_seqno
    }

    // A sync request makes the device drain the ring before returning.
    fn wait_idle(&self, _timeout: Duration) -> ExecResult<()> {
        if self.state().fail_drains {
            return Err(ExecError::RingFailed("device did not drain".into()));
        }
        self.process_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_passes_only_when_processed() {
        let fifo = SoftFifo::new(64);
        fifo.write_commands(&[0u8; 16]).unwrap();
        fifo.emit_fence(7).unwrap();
        assert_eq!(fifo.hw_seqno(), FIFO_INITIAL_SEQNO);
        fifo.process(1);
        assert_eq!(fifo.hw_seqno(), FIFO_INITIAL_SEQNO);
        fifo.process(1);
        assert_eq!(fifo.hw_seqno(), 7);
        assert!(fifo.is_idle());
    }

    #[test]
    fn full_ring_rejects_without_side_effects() {
        let fifo = SoftFifo::new(16);
        let err = fifo.write_commands(&[0u8; 17]).unwrap_err();
        assert_eq!(err, ExecError::RingFull { requested: 17 });
        assert_eq!(fifo.bytes_written(), 0);
        assert!(fifo.committed_batches().is_empty());
    }

    #[test]
    fn failed_drain_leaves_the_ring_untouched() {
        let fifo = SoftFifo::new(64);
        fifo.write_commands(&[1, 2, 3, 4]).unwrap();
        fifo.set_drain_failure(true);
        assert!(fifo.wait_idle(Duration::from_millis(1)).is_err());
        assert!(!fifo.is_idle());
    }

    #[test]
    fn wait_idle_drains() {
        let fifo = SoftFifo::new(64);
        fifo.write_commands(&[1, 2, 3, 4]).unwrap();
        fifo.emit_fence(3).unwrap();
        fifo.wait_idle(Duration::from_millis(1)).unwrap();
        assert!(fifo.is_idle());
        assert_eq!(fifo.hw_seqno(), 3);
    }
}
