//! # Reply Router
//!
//! Every posted request frame has exactly one owner until its reply is
//! consumed: a synchronous waiter, an upstream command, or a removal
//! handshake. A waiter that gives up leaves its frame abandoned; the frame
//! returns to the pool only when the late reply arrives or a host reset
//! reclaims every frame. The router maps slot ids to owners; the reply path takes the
//! owner out and dispatches without holding the router lock.
//!
//! Upstream commands double as the outstanding-command tracker the TM
//! engine polls to verify that an abort or reset really cleared the
//! affected commands.

use crate::host::TargetId;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use hba_hal::interrupts::Completion;
use hba_hal::{DeviceHandle, Lun, Smid};
use spin::Mutex;

/// Outstanding upstream command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedIo {
    /// Device handle the command was sent to
    pub handle: DeviceHandle,
    /// Upstream target
    pub target: TargetId,
    /// Logical unit
    pub lun: Lun,
}

/// Owner of a posted request
#[derive(Debug, Clone)]
pub enum ReplyOwner {
    /// A thread blocked on a completion
    Sync(Arc<Completion>),
    /// An upstream command
    UpstreamIo(TrackedIo),
    /// A removal handshake stage for this handle
    Handshake(DeviceHandle),
    /// A request whose waiter timed out; the firmware still owns the frame
    Abandoned,
}

/// What a reset did to the outstanding requests
#[derive(Debug, Default)]
pub struct ResetSweep {
    /// Waiters woken with a reset result
    pub waiters_aborted: usize,
    /// Upstream commands to complete as terminated
    pub upstream: Vec<Smid>,
    /// Handshake stages dropped
    pub handshakes: usize,
    /// Timed-out requests whose frames the reset reclaimed
    pub abandoned: usize,
}

/// Slot id to owner map
#[derive(Debug, Default)]
pub struct ReplyRouter {
    owners: Mutex<HashMap<Smid, ReplyOwner>>,
}

impl ReplyRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the owner of a posted request
    pub fn register(&self, smid: Smid, owner: ReplyOwner) {
        if let Some(previous) = self.owners.lock().insert(smid, owner) {
            log::error!("smid {} reused while still owned by {:?}", smid, previous);
        }
    }

    /// Take the owner out; `None` for stray or late replies
    pub fn take(&self, smid: Smid) -> Option<ReplyOwner> {
        self.owners.lock().remove(&smid)
    }

    /// Hand a timed-out synchronous request's frame to the router
    ///
    /// Returns `false` if the reply path already took the entry, including
    /// when the frame was since reused by another waiter.
    pub fn abandon(&self, smid: Smid, completion: &Arc<Completion>) -> bool {
        match self.owners.lock().get_mut(&smid) {
            Some(owner) if matches!(&*owner, ReplyOwner::Sync(c) if Arc::ptr_eq(c, completion)) => {
                *owner = ReplyOwner::Abandoned;
                true
            }
            _ => false,
        }
    }

    /// Device handle of an outstanding upstream command
    pub fn io_handle(&self, smid: Smid) -> Option<DeviceHandle> {
        match self.owners.lock().get(&smid) {
            Some(ReplyOwner::UpstreamIo(io)) => Some(io.handle),
            _ => None,
        }
    }

    /// Outstanding upstream command
    pub fn tracked_io(&self, smid: Smid) -> Option<TrackedIo> {
        match self.owners.lock().get(&smid) {
            Some(ReplyOwner::UpstreamIo(io)) => Some(*io),
            _ => None,
        }
    }

    /// Count outstanding upstream commands matching `pred`
    pub fn count_io(&self, pred: impl Fn(&TrackedIo) -> bool) -> usize {
        self.owners
            .lock()
            .values()
            .filter(|owner| matches!(owner, ReplyOwner::UpstreamIo(io) if pred(io)))
            .count()
    }

    /// Number of outstanding requests of any kind
    pub fn outstanding(&self) -> usize {
        self.owners.lock().len()
    }

    /// Empty the map for a host reset
    ///
    /// Waiters are forced into the reset state so they return promptly.
    pub fn abort_all_for_reset(&self) -> ResetSweep {
        let owners: Vec<(Smid, ReplyOwner)> = self.owners.lock().drain().collect();
        let mut sweep = ResetSweep::default();
        for (smid, owner) in owners {
            match owner {
                ReplyOwner::Sync(completion) => {
                    if completion.abort_for_reset() {
                        sweep.waiters_aborted += 1;
                    }
                }
                ReplyOwner::UpstreamIo(_) => sweep.upstream.push(smid),
                ReplyOwner::Handshake(_) => sweep.handshakes += 1,
                ReplyOwner::Abandoned => sweep.abandoned += 1,
            }
        }
        sweep.upstream.sort();
        sweep
    }
}
