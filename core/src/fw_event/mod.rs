//! # Firmware Event Queue
//!
//! Single-consumer queue of asynchronous controller notifications.
//! Producers run in interrupt context and only ever push; the worker pops
//! one event at a time and runs it to completion. An event that has to be
//! retried goes to the delayed side of the queue, keyed by due time.
//!
//! Every queued event carries a [`CancelToken`]. A later event that
//! supersedes an earlier one cancels it in place; the worker discards
//! cancelled events when it reaches them.

mod data;

pub use data::{
    DeviceStatusChange, DeviceStatusReason, DiscoveryEvent, EnclosureStatus,
    EnclosureStatusChange, ExpanderStatus, FwEventData, IrConfigChangeList, IrConfigElement,
    IrElementReason, IrVolumeEvent, PciePortChange, PciePortReason, PcieTopologyChangeList,
    PhyChange, PhyReason, SasTopologyChangeList, SwitchStatus,
};

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// What the worker does with an event after running it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Finished
    Done,
    /// Run again after the requeue delay
    Requeue,
}

/// Shared cancellation flag of a queued event
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a live token
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel; the event will be discarded unprocessed
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the token was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A queued unit of work
#[derive(Debug)]
pub struct FwEvent {
    id: u64,
    cancel: CancelToken,
    data: Mutex<FwEventData>,
    retries: Mutex<Vec<u8>>,
}

impl FwEvent {
    fn new(id: u64, data: FwEventData) -> Self {
        let retries = vec![0; data.entry_count()];
        Self {
            id,
            cancel: CancelToken::new(),
            data: Mutex::new(data),
            retries: Mutex::new(retries),
        }
    }

    /// Queue-assigned id, increasing in arrival order
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the payload
    pub fn data(&self) -> FwEventData {
        self.data.lock().clone()
    }

    /// Run `f` on the payload under its lock
    pub fn with_data<R>(&self, f: impl FnOnce(&mut FwEventData) -> R) -> R {
        f(&mut self.data.lock())
    }

    /// Whether a later event superseded this one
    pub fn is_ignored(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mark the event superseded
    pub fn ignore(&self) {
        self.cancel.cancel();
    }

    /// The event's cancellation token
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Per-entry retry counters
    pub fn retries(&self) -> Vec<u8> {
        self.retries.lock().clone()
    }

    /// Retry counter of one entry
    pub fn retry_count(&self, entry: usize) -> u8 {
        self.retries.lock().get(entry).copied().unwrap_or(0)
    }

    /// Bump the retry counter of one entry
    pub fn bump_retry(&self, entry: usize) -> u8 {
        let mut retries = self.retries.lock();
        match retries.get_mut(entry) {
            Some(count) => {
                *count = count.saturating_add(1);
                *count
            }
            None => 0,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    ready: VecDeque<Arc<FwEvent>>,
    delayed: BTreeMap<(u64, u64), Arc<FwEvent>>,
    suspended: bool,
    next_id: u64,
}

/// The firmware event queue
#[derive(Debug, Default)]
pub struct FwEventQueue {
    inner: Mutex<QueueInner>,
    current: Mutex<Option<Arc<FwEvent>>>,
    worker_active: AtomicBool,
}

impl FwEventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event (interrupt context)
    ///
    /// Returns `None` while producers are suspended for a reset.
    pub fn enqueue(&self, data: FwEventData) -> Option<Arc<FwEvent>> {
        let mut inner = self.inner.lock();
        if inner.suspended {
            return None;
        }
        inner.next_id += 1;
        let event = Arc::new(FwEvent::new(inner.next_id, data));
        inner.ready.push_back(event.clone());
        Some(event)
    }

    /// Queue follow-up work to run no earlier than `due_ms`
    ///
    /// Returns `None` while producers are suspended for a reset.
    pub fn enqueue_delayed(&self, data: FwEventData, due_ms: u64) -> Option<Arc<FwEvent>> {
        let mut inner = self.inner.lock();
        if inner.suspended {
            return None;
        }
        inner.next_id += 1;
        let event = Arc::new(FwEvent::new(inner.next_id, data));
        inner.delayed.insert((due_ms, event.id), event.clone());
        Some(event)
    }

    /// Put an event back to run no earlier than `due_ms`
    pub fn requeue_delayed(&self, event: Arc<FwEvent>, due_ms: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.suspended || event.is_ignored() {
            return false;
        }
        inner.delayed.insert((due_ms, event.id), event);
        true
    }

    /// Pop the next event whose time has come
    pub fn pop_ready(&self, now_ms: u64) -> Option<Arc<FwEvent>> {
        let mut inner = self.inner.lock();
        while let Some(entry) = inner.delayed.first_entry() {
            if entry.key().0 > now_ms {
                break;
            }
            let event = entry.remove();
            inner.ready.push_back(event);
        }
        inner.ready.pop_front()
    }

    /// Whether an event is runnable at `now_ms`
    pub fn has_ready(&self, now_ms: u64) -> bool {
        let inner = self.inner.lock();
        !inner.ready.is_empty()
            || inner
                .delayed
                .keys()
                .next()
                .is_some_and(|(due, _)| *due <= now_ms)
    }

    /// Due time of the earliest delayed event
    pub fn next_due_ms(&self) -> Option<u64> {
        self.inner.lock().delayed.keys().next().map(|(due, _)| *due)
    }

    /// Snapshot of every queued event, in arrival order
    pub fn pending(&self) -> Vec<Arc<FwEvent>> {
        let inner = self.inner.lock();
        let mut events: Vec<Arc<FwEvent>> = inner
            .ready
            .iter()
            .chain(inner.delayed.values())
            .cloned()
            .collect();
        events.sort_by_key(|e| e.id);
        events
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.delayed.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new events
    pub fn suspend(&self) {
        self.inner.lock().suspended = true;
    }

    /// Accept events again
    pub fn resume(&self) {
        self.inner.lock().suspended = false;
    }

    /// Whether producers are suspended
    pub fn is_suspended(&self) -> bool {
        self.inner.lock().suspended
    }

    /// Cancel and drop every queued event and cancel the one running
    pub fn cleanup(&self) -> usize {
        let drained: Vec<Arc<FwEvent>> = {
            let mut inner = self.inner.lock();
            let mut drained: Vec<Arc<FwEvent>> = inner.ready.drain(..).collect();
            drained.extend(core::mem::take(&mut inner.delayed).into_values());
            drained
        };
        for event in &drained {
            event.ignore();
        }
        if let Some(current) = self.current.lock().as_ref() {
            current.ignore();
        }
        drained.len()
    }

    /// Record the event the worker is running
    pub fn set_current(&self, event: Option<Arc<FwEvent>>) {
        *self.current.lock() = event;
    }

    /// Event the worker is running
    pub fn current(&self) -> Option<Arc<FwEvent>> {
        self.current.lock().clone()
    }

    /// Claim the worker role; `false` if another context holds it
    pub fn try_begin_work(&self) -> bool {
        self.worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the worker role
    pub fn end_work(&self) {
        self.worker_active.store(false, Ordering::Release);
    }
}
