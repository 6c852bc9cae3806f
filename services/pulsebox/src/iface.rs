//! Frontend half of the controller: the asynchronous, single-threaded API
//! the transport layer calls into.
//!
//! All methods are asynchronous with respect to the hardware: writes are
//! queued (or served by a concurrently-safe register), reads take a
//! callback that fires on this thread during [`CtrlIface::run_frontend`].
//! The backend worker signals progress through an event fd; this side
//! wakes the worker through a condvar.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::api::{Cmd, DdsType, ReqOp, SeqEvent, SeqState, CMD_OPERAND_ALL, OVR_OFF};
use crate::cache::{CacheKey, CmdCache, ReadCb};
use crate::evt::EventFd;
use crate::queue::FilterQueue;

/// Command arena depth. Bounds the number of requests in flight between
/// the threads; the frontend drops (and logs) pushes beyond it.
const CMD_QUEUE_DEPTH: usize = 1024;
const SEQ_QUEUE_DEPTH: usize = 128;

/// State shared between the frontend and the backend worker.
pub(crate) struct Shared {
    pub(crate) cmd_queue: FilterQueue<Cmd>,
    pub(crate) seq_queue: FilterQueue<Arc<Seq>>,
    work_lock: Mutex<()>,
    work_cond: Condvar,
    evt: EventFd,
    pub(crate) quit: AtomicBool,
    pub(crate) seq_running: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> std::io::Result<Shared> {
        Ok(Shared {
            cmd_queue: FilterQueue::new(CMD_QUEUE_DEPTH),
            seq_queue: FilterQueue::new(SEQ_QUEUE_DEPTH),
            work_lock: Mutex::new(()),
            work_cond: Condvar::new(),
            evt: EventFd::new()?,
            quit: AtomicBool::new(false),
            seq_running: AtomicBool::new(false),
        })
    }

    fn has_work(&self) -> bool {
        self.cmd_queue.has_unfiltered() || self.seq_queue.has_unfiltered()
    }

    /// Wake the backend worker. Taking the lock pairs with the predicate
    /// check in `wait_work` so a push cannot slip between check and sleep.
    pub(crate) fn notify_backend(&self) {
        let _guard = self.work_lock.lock().unwrap();
        self.work_cond.notify_all();
    }

    /// Backend: sleep until there is work, a quit, or `timeout` passes.
    /// Returns false once quitting.
    pub(crate) fn wait_work(&self, timeout: Duration) -> bool {
        let guard = self.work_lock.lock().unwrap();
        if !self.quit.load(Ordering::Relaxed) && !self.has_work() {
            let _ = self.work_cond.wait_timeout(guard, timeout).unwrap();
        }
        !self.quit.load(Ordering::Relaxed)
    }

    /// Backend: tell the frontend that something it can read changed.
    pub(crate) fn backend_event(&self) {
        self.evt.notify();
    }

    pub(crate) fn event_fd(&self) -> RawFd {
        self.evt.fd()
    }
}

/// A queued sequence. The backend only touches `code`, the masks and the
/// atomics; everything callback-related stays on the frontend.
pub struct Seq {
    pub id: u64,
    pub code: Arc<[u8]>,
    pub is_cmd: bool,
    pub ttl_mask: u32,
    pub len_ns: u64,
    state: AtomicU8,
    pub(crate) cancel: AtomicBool,
}

impl Seq {
    pub fn state(&self) -> SeqState {
        SeqState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SeqState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// What the frontend needs from the backend besides the queues: the
/// register accesses the hardware defines as concurrently safe, and the
/// DDS presence snapshot.
pub trait Backend: Send + Sync {
    /// Serve a write without queueing if the register allows it.
    fn concurrent_set(&self, op: ReqOp, operand: u32, is_override: bool, val: u32) -> bool;
    /// Serve a read without queueing if the register allows it.
    fn concurrent_get(&self, op: ReqOp, operand: u32, is_override: bool) -> Option<u32>;
    fn active_dds(&self) -> Vec<u8>;
}

/// TTL override modes: force low, force high, or back to normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlOvr {
    Low,
    High,
    Normal,
}

#[derive(Debug, thiserror::Error)]
pub enum RunCodeError {
    #[error("unsupported sequence version {0}")]
    BadVersion(u32),
    #[error("sequence queue is full")]
    QueueFull,
}

pub type NotifyFn = Box<dyn FnMut(SeqEvent)>;

struct SeqFront {
    seq: Arc<Seq>,
    notify: NotifyFn,
    processed: SeqState,
}

pub struct CtrlIface {
    shared: Arc<Shared>,
    backend: Arc<dyn Backend>,
    worker: Option<JoinHandle<()>>,
    cache: CmdCache,
    /// Sequences whose terminal callback has not fired yet, by id.
    pending: BTreeMap<u64, SeqFront>,
    next_seq_id: u64,
    // State-id bookkeeping.
    state_counter: u64,
    dirty: bool,
    last_running: bool,
}

impl CtrlIface {
    pub(crate) fn new(
        shared: Arc<Shared>,
        backend: Arc<dyn Backend>,
        worker: JoinHandle<()>,
    ) -> CtrlIface {
        CtrlIface {
            shared,
            backend,
            worker: Some(worker),
            cache: CmdCache::new(),
            pending: BTreeMap::new(),
            next_seq_id: 1,
            state_counter: 0,
            dirty: false,
            last_running: false,
        }
    }

    fn set_dirty(&mut self) {
        self.dirty = true;
    }

    fn send_cmd(&mut self, cmd: Cmd) {
        if self.shared.cmd_queue.push(cmd).is_err() {
            log::error!("command queue full, dropping {:?}", cmd);
            return;
        }
        self.shared.notify_backend();
    }

    //////////////////////////////// TTL

    /// Set one TTL bit.
    pub fn set_ttl(&mut self, chn: u8, val: bool) {
        debug_assert!(chn < 32);
        self.set_dirty();
        self.send_cmd(Cmd::new(ReqOp::Ttl, u32::from(chn), false, false, val as u32));
    }

    /// Assign the full TTL word.
    pub fn set_ttl_word(&mut self, word: u32) {
        self.set_dirty();
        self.send_cmd(Cmd::new(ReqOp::Ttl, CMD_OPERAND_ALL, false, false, word));
    }

    /// The effective TTL word, as the hardware drives it right now.
    pub fn ttl_word(&self) -> u32 {
        self.backend
            .concurrent_get(ReqOp::Ttl, 0, false)
            .unwrap_or(0)
    }

    pub fn get_ttl(&mut self, cb: ReadCb) {
        cb(self.ttl_word());
    }

    pub fn ttl_ovr_masks(&self) -> (u32, u32) {
        let lo = self
            .backend
            .concurrent_get(ReqOp::Ttl, 0, true)
            .unwrap_or(0);
        let hi = self
            .backend
            .concurrent_get(ReqOp::Ttl, 1, true)
            .unwrap_or(0);
        (lo, hi)
    }

    pub fn set_ttl_ovr_masks(&mut self, lo: u32, hi: u32) {
        self.set_dirty();
        self.backend.concurrent_set(ReqOp::Ttl, 0, true, lo);
        self.backend.concurrent_set(ReqOp::Ttl, 1, true, hi);
    }

    /// Override the bits in `mask` to a fixed level, or hand them back.
    pub fn set_ttl_ovr(&mut self, mask: u32, ovr: TtlOvr) {
        let (mut lo, mut hi) = self.ttl_ovr_masks();
        match ovr {
            TtlOvr::Low => {
                lo |= mask;
                hi &= !mask;
            }
            TtlOvr::High => {
                hi |= mask;
                lo &= !mask;
            }
            TtlOvr::Normal => {
                lo &= !mask;
                hi &= !mask;
            }
        }
        self.set_ttl_ovr_masks(lo, hi);
    }

    pub fn get_ttl_ovrlo(&mut self, cb: ReadCb) {
        cb(self.ttl_ovr_masks().0);
    }

    pub fn get_ttl_ovrhi(&mut self, cb: ReadCb) {
        cb(self.ttl_ovr_masks().1);
    }

    pub fn has_ttl_ovr(&self) -> bool {
        let (lo, hi) = self.ttl_ovr_masks();
        lo != 0 || hi != 0
    }

    //////////////////////////////// DDS

    pub fn set_dds(&mut self, typ: DdsType, chn: u8, val: u32) {
        debug_assert!((chn as usize) < pulser::NDDS);
        let val = match typ {
            DdsType::Freq => val,
            DdsType::Amp => u32::from(val as u16 & 0xfff),
            DdsType::Phase => u32::from(val as u16),
        };
        let op = ReqOp::from(typ);
        self.set_dirty();
        self.cache.set(CacheKey::new(op, u32::from(chn), false), val);
        self.send_cmd(Cmd::new(op, u32::from(chn), false, false, val));
    }

    /// Set or clear (`val = -1`) a DDS override.
    pub fn set_dds_ovr(&mut self, typ: DdsType, chn: u8, val: u32) {
        debug_assert!((chn as usize) < pulser::NDDS);
        let val = match typ {
            DdsType::Freq => val,
            DdsType::Amp => {
                if val as u16 == u16::MAX {
                    OVR_OFF
                } else {
                    u32::from(val as u16 & 0xfff)
                }
            }
            DdsType::Phase => {
                if val as u16 == u16::MAX {
                    OVR_OFF
                } else {
                    u32::from(val as u16)
                }
            }
        };
        let op = ReqOp::from(typ);
        self.set_dirty();
        self.cache.set(CacheKey::new(op, u32::from(chn), true), val);
        self.send_cmd(Cmd::new(op, u32::from(chn), true, false, val));
    }

    pub fn get_dds(&mut self, typ: DdsType, chn: u8, cb: ReadCb) {
        let op = ReqOp::from(typ);
        if self.cache.get(CacheKey::new(op, u32::from(chn), false), cb) {
            return;
        }
        self.send_cmd(Cmd::new(op, u32::from(chn), false, true, 0));
    }

    /// Read back an override; `-1` means the override is off. Always
    /// answered synchronously (override state never lives on the hardware).
    pub fn get_dds_ovr(&mut self, typ: DdsType, chn: u8, cb: ReadCb) {
        let op = ReqOp::from(typ);
        self.cache.get(CacheKey::new(op, u32::from(chn), true), cb);
    }

    /// Queue a DDS reinitialization; also drops all three overrides.
    pub fn reset_dds(&mut self, chn: u8) {
        debug_assert!((chn as usize) < pulser::NDDS);
        self.set_dirty();
        for op in [ReqOp::DdsFreq, ReqOp::DdsAmp, ReqOp::DdsPhase] {
            self.cache.set(CacheKey::new(op, u32::from(chn), true), OVR_OFF);
        }
        self.send_cmd(Cmd::new(ReqOp::DdsReset, u32::from(chn), false, false, 0));
    }

    pub fn has_dds_ovr(&self) -> bool {
        self.cache.has_dds_ovr()
    }

    pub fn get_active_dds(&self) -> Vec<u8> {
        self.backend.active_dds()
    }

    //////////////////////////////// CLOCK

    pub fn set_clock(&mut self, div: u8) {
        self.set_dirty();
        self.cache
            .set(CacheKey::new(ReqOp::Clock, 0, false), u32::from(div));
        self.send_cmd(Cmd::new(ReqOp::Clock, 0, false, false, u32::from(div)));
    }

    pub fn clock(&self) -> u8 {
        self.backend
            .concurrent_get(ReqOp::Clock, 0, false)
            .unwrap_or(255) as u8
    }

    pub fn get_clock(&mut self, cb: ReadCb) {
        cb(u32::from(self.clock()));
    }

    //////////////////////////////// SEQUENCES

    /// Queue a sequence for execution; returns its id. `notify` fires on
    /// this thread, from `run_frontend`, for every state transition.
    pub fn run_code(
        &mut self,
        is_cmd: bool,
        version: u32,
        len_ns: u64,
        ttl_mask: u32,
        code: Arc<[u8]>,
        notify: NotifyFn,
    ) -> Result<u64, RunCodeError> {
        if version != 1 {
            return Err(RunCodeError::BadVersion(version));
        }
        let id = self.next_seq_id;
        let seq = Arc::new(Seq {
            id,
            code,
            is_cmd,
            ttl_mask,
            len_ns,
            state: AtomicU8::new(SeqState::Init as u8),
            cancel: AtomicBool::new(false),
        });
        if self.shared.seq_queue.push(Arc::clone(&seq)).is_err() {
            return Err(RunCodeError::QueueFull);
        }
        self.next_seq_id += 1;
        self.pending.insert(
            id,
            SeqFront {
                seq,
                notify,
                processed: SeqState::Init,
            },
        );
        self.set_dirty();
        self.shared.notify_backend();
        Ok(id)
    }

    /// Flag matching queued sequences for cancellation (`id == 0` matches
    /// all). Sequences already running are not interrupted. Returns whether
    /// anything was flagged.
    pub fn cancel_seq(&mut self, id: u64) -> bool {
        let mut any = false;
        for (&seq_id, front) in self.pending.iter() {
            if id != 0 && seq_id != id {
                continue;
            }
            if front.seq.state() == SeqState::Init && !front.seq.cancel.swap(true, Ordering::Relaxed)
            {
                any = true;
            }
        }
        if any {
            self.set_dirty();
            self.shared.notify_backend();
        }
        any
    }

    /// 64-bit state id: the high bit says a sequence is running, the low
    /// bits form a counter that bumps when something changed since the
    /// last call. Two equal ids mean nothing happened in between.
    pub fn get_state_id(&mut self) -> u64 {
        let running = self.shared.seq_running.load(Ordering::Relaxed);
        if self.dirty || running != self.last_running {
            self.state_counter += 1;
            self.dirty = false;
            self.last_running = running;
        }
        self.state_counter | (running as u64) << 63
    }

    /// `(any, finished)`: whether any sequence still awaits callbacks, and
    /// whether one of them is already terminal (so `run_frontend` has work).
    pub fn has_pending(&self) -> (bool, bool) {
        let finished = self
            .pending
            .values()
            .any(|front| front.seq.state().is_terminal());
        (!self.pending.is_empty(), finished)
    }

    /// Fd the backend pokes when there is something to collect here.
    pub fn backend_fd(&self) -> RawFd {
        self.shared.event_fd()
    }

    /// Drain backend events: finish completed reads (replies go out through
    /// the cache callbacks) and fire sequence notifications in id order.
    pub fn run_frontend(&mut self) {
        self.shared.evt.drain();
        while let Some(cmd) = self.shared.cmd_queue.pop() {
            if cmd.has_res() {
                self.cache.set(
                    CacheKey::new(cmd.op(), cmd.operand(), cmd.is_override()),
                    cmd.val(),
                );
            }
        }
        while self.shared.seq_queue.pop().is_some() {}

        let mut done = Vec::new();
        for (&id, front) in self.pending.iter_mut() {
            let state = front.seq.state();
            if state == SeqState::Cancel {
                if front.processed != SeqState::Cancel {
                    (front.notify)(SeqEvent::Cancel(id));
                    front.processed = SeqState::Cancel;
                }
                done.push(id);
                continue;
            }
            if state >= SeqState::Start && front.processed < SeqState::Start {
                (front.notify)(SeqEvent::Start(id));
            }
            if state >= SeqState::Flushed && front.processed < SeqState::Flushed {
                (front.notify)(SeqEvent::Flushed(id));
            }
            if state >= SeqState::End && front.processed < SeqState::End {
                (front.notify)(SeqEvent::End(id));
                done.push(id);
            }
            if front.processed != state {
                front.processed = state;
            }
        }
        for id in done {
            self.pending.remove(&id);
        }
    }

    /// Ask the backend to exit; `run_frontend` can still drain afterwards.
    pub fn quit(&mut self) {
        self.shared.quit.store(true, Ordering::Relaxed);
        self.shared.notify_backend();
    }
}

impl Drop for CtrlIface {
    fn drop(&mut self) {
        self.quit();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("controller worker panicked");
            }
        }
    }
}
