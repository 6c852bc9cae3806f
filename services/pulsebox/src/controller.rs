//! The backend worker: owns the pulse controller, the shadow output state
//! and the in-flight result ring, and runs sequences while multiplexing
//! untimed requests into their idle cycles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pulser::{DummyPulser, HwPulser, PulseTime, Pulser, NDDS};

use crate::api::{Cmd, ReqOp, SeqState, CMD_OPERAND_ALL, OVR_OFF};
use crate::iface::{Backend, CtrlIface, Seq, Shared};
use crate::queue::FixedQueue;
use crate::runner::{RunState, SeqRunner};
use crate::seq;

/// Capacity of the hardware result FIFO; bounds how many result-bearing
/// commands may be in flight.
const RESULT_RING: usize = 16;

/// How often DDS presence is re-probed.
const DDS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Tuned timing constants, settable from the config file.
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    /// How far sequence time must stay ahead of wall clock.
    pub min_lead: Duration,
    /// Sleep inside a long sequence wait when there is nothing else to do.
    pub idle_sleep: Duration,
}

impl Default for TimingConfig {
    fn default() -> TimingConfig {
        TimingConfig {
            min_lead: Duration::from_millis(500),
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// Per-channel override state. An active override swallows writes from a
/// running sequence; the hardware keeps emitting the override value.
pub(crate) struct DdsOvr {
    pub(crate) freq: u32,
    pub(crate) amp: u16,
    pub(crate) amp_on: bool,
    pub(crate) phase: u16,
    pub(crate) phase_on: bool,
}

impl Default for DdsOvr {
    fn default() -> DdsOvr {
        DdsOvr {
            freq: OVR_OFF,
            amp: 0,
            amp_on: false,
            phase: 0,
            phase_on: false,
        }
    }
}

/// State only the worker thread touches.
pub(crate) struct BackendState {
    pub(crate) dds_ovr: [DdsOvr; NDDS],
    pub(crate) dds_phase: [u16; NDDS],
    // Reinitialization is an expensive, rarely needed step; it is deferred
    // to after the sequence finishes.
    pub(crate) dds_pending_reset: [bool; NDDS],
    dds_check_time: Option<Instant>,
    pub(crate) shadow_ttl: u32,
    /// Queue tokens of commands whose hardware result is still pending.
    cmd_waiting: FixedQueue<u64, RESULT_RING>,
    /// A taken command that could not dispatch because the ring was full.
    parked: Option<u64>,
}

impl BackendState {
    fn new(shadow_ttl: u32) -> BackendState {
        BackendState {
            dds_ovr: std::array::from_fn(|_| DdsOvr::default()),
            dds_phase: [0; NDDS],
            dds_pending_reset: [false; NDDS],
            dds_check_time: None,
            shadow_ttl,
            cmd_waiting: FixedQueue::new(),
            parked: None,
        }
    }
}

pub(crate) fn set_bit(word: u32, chn: u8, val: bool) -> u32 {
    if val {
        word | 1 << chn
    } else {
        word & !(1 << chn)
    }
}

pub struct Controller<P: Pulser> {
    pub(crate) p: P,
    pub(crate) shared: Arc<Shared>,
    pub(crate) timing: TimingConfig,
    dds_exist: [AtomicBool; NDDS],
}

impl<P: Pulser + 'static> Controller<P> {
    /// Spawn the worker thread and hand back the frontend interface.
    pub fn start(p: P, timing: TimingConfig) -> std::io::Result<CtrlIface> {
        let shared = Arc::new(Shared::new()?);
        let ctrl = Arc::new(Controller {
            p,
            shared: Arc::clone(&shared),
            timing,
            dds_exist: std::array::from_fn(|_| AtomicBool::new(false)),
        });
        let worker = {
            let ctrl = Arc::clone(&ctrl);
            thread::Builder::new()
                .name("pulse-backend".into())
                .spawn(move || ctrl.worker())?
        };
        Ok(CtrlIface::new(shared, ctrl, worker))
    }
}

impl<P: Pulser> Controller<P> {
    fn worker(&self) {
        let mut bk = BackendState::new(self.p.cur_ttl());
        self.detect_dds(&mut bk, true);
        self.p.clear_error();
        while self.shared.wait_work(Duration::from_millis(500)) {
            if let Some(token) = self.shared.seq_queue.get_filter() {
                let seq = unsafe { (*self.shared.seq_queue.slot_ptr(token)).clone() };
                if seq.cancel.load(Ordering::Relaxed) && seq.state() == SeqState::Init {
                    seq.set_state(SeqState::Cancel);
                } else {
                    self.shared.seq_running.store(true, Ordering::Relaxed);
                    self.run_seq(&mut bk, &seq);
                    self.shared.seq_running.store(false, Ordering::Relaxed);
                }
                self.shared.seq_queue.forward(token);
                self.shared.backend_event();
            }
            self.sync_shadow_ttl(&mut bk);
            self.detect_dds(&mut bk, false);
            while self.process_reqcmd(&mut bk, None, false).1 {}
            self.detect_dds(&mut bk, false);
        }
        // Quitting: everything still queued is cancelled so waiting
        // clients get unblocked.
        while let Some(token) = self.shared.seq_queue.get_filter() {
            let seq = unsafe { (*self.shared.seq_queue.slot_ptr(token)).clone() };
            seq.set_state(SeqState::Cancel);
            self.shared.seq_queue.forward(token);
        }
        self.shared.backend_event();
    }

    fn sync_shadow_ttl(&self, bk: &mut BackendState) {
        let hw = self.p.cur_ttl();
        if hw != bk.shadow_ttl {
            log::warn!(
                "TTL shadow out of sync (shadow {:#010x}, hardware {:#010x})",
                bk.shadow_ttl,
                hw
            );
            bk.shadow_ttl = hw;
        }
    }

    /// Run one untimed command against the hardware.
    ///
    /// Returns the sequence time consumed and whether the command waits
    /// for a result.
    pub(crate) fn run_cmd(
        &self,
        bk: &mut BackendState,
        cmd: Cmd,
        rs: Option<&mut RunState>,
        checked: bool,
    ) -> (u32, bool) {
        match cmd.op() {
            ReqOp::Ttl => {
                // Mask and full-word reads are served by concurrent_get.
                debug_assert!(!cmd.has_res() && !cmd.is_override());
                let word;
                if cmd.operand() == CMD_OPERAND_ALL {
                    word = cmd.val();
                    if let Some(rs) = rs {
                        rs.ttl = word;
                        rs.preserve_ttl = word & rs.ttlmask;
                    }
                } else {
                    debug_assert!(cmd.operand() < 32);
                    let chn = cmd.operand() as u8;
                    let val = cmd.val() != 0;
                    let base = match rs {
                        Some(rs) => {
                            if rs.ttlmask & 1 << chn != 0 {
                                rs.preserve_ttl = set_bit(rs.preserve_ttl, chn, val);
                            }
                            rs.ttl
                        }
                        None => bk.shadow_ttl,
                    };
                    word = set_bit(base, chn, val);
                }
                self.p.ttl(word, PulseTime::MIN, checked);
                bk.shadow_ttl = word;
                (PulseTime::MIN, false)
            }
            ReqOp::DdsFreq => {
                let chn = cmd.operand() as u8;
                debug_assert!((chn as usize) < NDDS);
                let val = cmd.val();
                let has_res = cmd.has_res();
                let ovr = &mut bk.dds_ovr[chn as usize];
                let is_ovr = cmd.is_override()
                    // An active override captures plain sets: the override
                    // always wins.
                    || (!has_res && ovr.freq != OVR_OFF);
                if is_ovr {
                    debug_assert!(!has_res);
                    if val == ovr.freq {
                        return (0, false);
                    }
                    ovr.freq = val;
                    if val == OVR_OFF {
                        return (0, false);
                    }
                    self.p.dds_set_freq(chn, val, checked);
                    return (PulseTime::DDS_FREQ, false);
                }
                if !has_res {
                    self.p.dds_set_freq(chn, val, checked);
                    return (PulseTime::DDS_FREQ, false);
                }
                self.p.dds_get_freq(chn, checked);
                (PulseTime::DDS_FREQ, true)
            }
            ReqOp::DdsAmp => {
                let chn = cmd.operand() as u8;
                debug_assert!((chn as usize) < NDDS);
                let val = cmd.val() as u16;
                let has_res = cmd.has_res();
                let ovr = &mut bk.dds_ovr[chn as usize];
                let is_ovr = cmd.is_override() || (!has_res && ovr.amp_on);
                if is_ovr {
                    debug_assert!(!has_res);
                    if val == u16::MAX {
                        ovr.amp_on = false;
                        return (0, false);
                    }
                    let val = val & 0xfff;
                    // Idempotent only when the enable flag already matches.
                    if ovr.amp_on && val == ovr.amp {
                        return (0, false);
                    }
                    ovr.amp = val;
                    ovr.amp_on = true;
                    self.p.dds_set_amp(chn, val, checked);
                    return (PulseTime::DDS_AMP, false);
                }
                if !has_res {
                    self.p.dds_set_amp(chn, val & 0xfff, checked);
                    return (PulseTime::DDS_AMP, false);
                }
                self.p.dds_get_amp(chn, checked);
                (PulseTime::DDS_AMP, true)
            }
            ReqOp::DdsPhase => {
                let chn = cmd.operand() as u8;
                debug_assert!((chn as usize) < NDDS);
                let val = cmd.val() as u16;
                let has_res = cmd.has_res();
                let ovr = &mut bk.dds_ovr[chn as usize];
                let is_ovr = cmd.is_override() || (!has_res && ovr.phase_on);
                if is_ovr {
                    debug_assert!(!has_res);
                    if val == u16::MAX {
                        ovr.phase_on = false;
                        return (0, false);
                    }
                    if ovr.phase_on && val == ovr.phase {
                        return (0, false);
                    }
                    ovr.phase = val;
                    ovr.phase_on = true;
                    bk.dds_phase[chn as usize] = val;
                    self.p.dds_set_phase(chn, val, checked);
                    return (PulseTime::DDS_PHASE, false);
                }
                if !has_res {
                    bk.dds_phase[chn as usize] = val;
                    self.p.dds_set_phase(chn, val, checked);
                    return (PulseTime::DDS_PHASE, false);
                }
                self.p.dds_get_phase(chn, checked);
                (PulseTime::DDS_PHASE, true)
            }
            ReqOp::DdsReset => {
                debug_assert!(!cmd.is_override() && !cmd.has_res());
                let chn = cmd.operand() as usize;
                debug_assert!(chn < NDDS);
                // The expensive reinitialization happens after the
                // sequence, in check_dds.
                bk.dds_pending_reset[chn] = true;
                (0, false)
            }
            ReqOp::Clock => {
                debug_assert!(!cmd.is_override() && !cmd.has_res() && cmd.operand() == 0);
                self.p.clock(cmd.val() as u8, checked);
                (PulseTime::CLOCK, false)
            }
        }
    }

    // Check the in-flight ring for a hardware result. Returns (ring
    // non-empty, result consumed).
    fn try_get_result(&self, bk: &mut BackendState, checked: bool) -> (bool, bool) {
        let token = match bk.cmd_waiting.front() {
            Some(&token) => token,
            None => return (false, false),
        };
        let res = match self.p.try_get_result() {
            Some(res) => res,
            None => return (true, false),
        };
        unsafe { (*self.shared.cmd_queue.slot_ptr(token)).set_val(res) };
        bk.cmd_waiting.pop();
        self.shared.cmd_queue.forward(token);
        if !checked {
            // The timing is not critical here, notify the frontend.
            self.shared.backend_event();
        }
        (true, true)
    }

    /// Serve one pending untimed request: either a result for an in-flight
    /// read, or the next queued command. Returns the sequence time
    /// consumed and whether anything non-trivial was done.
    pub(crate) fn process_reqcmd(
        &self,
        bk: &mut BackendState,
        rs: Option<&mut RunState>,
        checked: bool,
    ) -> (u32, bool) {
        let (busy, got) = self.try_get_result(bk, checked);
        if got {
            return (0, true);
        }
        let token = match bk.parked.take().or_else(|| self.shared.cmd_queue.get_filter()) {
            Some(token) => token,
            None => return (0, busy),
        };
        let cmd = unsafe { *self.shared.cmd_queue.slot_ptr(token) };
        if cmd.has_res() && bk.cmd_waiting.is_full() {
            // Backpressure: park the command and retry next tick once the
            // result FIFO has space.
            bk.parked = Some(token);
            return (0, busy);
        }
        let (cycles, needs_res) = self.run_cmd(bk, cmd, rs, checked);
        if needs_res {
            let pushed = bk.cmd_waiting.push(token);
            debug_assert!(pushed.is_ok());
        } else {
            self.shared.cmd_queue.forward(token);
            if !checked {
                self.shared.backend_event();
            }
        }
        (cycles, true)
    }

    fn run_seq(&self, bk: &mut BackendState, seq: &Arc<Seq>) {
        // Read out every pending result; toggle_init would clear them.
        loop {
            let (busy, got) = self.try_get_result(bk, false);
            if !busy {
                break;
            }
            if !got {
                thread::yield_now();
            }
        }
        while !self.p.is_finished() {
            thread::yield_now();
        }
        self.sync_shadow_ttl(bk);
        self.p.set_hold();
        // toggle_init clears the force-release latch so set_hold works.
        self.p.toggle_init();
        seq.set_state(SeqState::Start);
        self.shared.backend_event();

        let mut runner = SeqRunner::new(self, bk, seq.ttl_mask, seq.len_ns);
        let decoded = if seq.is_cmd {
            seq::cmdlist::exe(&mut runner, &seq.code)
        } else {
            seq::bytecode::exe(&mut runner, &seq.code)
        };
        if let Err(err) = decoded {
            log::error!("sequence {}: {}", seq.id, err);
        }
        // Stop the timing check with a short wait, then let the FIFO tail
        // drain out.
        runner.wait_with(u64::from(PulseTime::MIN), false);
        self.p.release_hold();
        seq.set_state(SeqState::Flushed);
        self.shared.backend_event();

        if !seq.is_cmd {
            // Keeps the downstream NI card happy.
            runner.clock_with(9, false);
        }
        while !self.p.is_finished() {
            if !runner.process_one(false) {
                thread::yield_now();
            }
        }
        seq.set_state(SeqState::End);
        self.shared.backend_event();
        if !seq.is_cmd {
            // 10ms
            runner.wait_with(1_000_000, false);
            runner.clock_with(255, false);
        }
        drop(runner);
        if !self.p.timing_ok() {
            log::warn!(
                "sequence {}: timing underflow, {} cycles lost",
                seq.id,
                self.p.underflow_cycle()
            );
        }
        self.p.clear_error();

        // Doing the reinit check before the sequence would make that
        // sequence more likely to work, but it costs latency on every run
        // and resets are rare; check after instead.
        for chn in 0..NDDS as u8 {
            if self.dds_exist[chn as usize].load(Ordering::Relaxed) && self.check_dds(bk, chn) {
                log::info!("DDS {} reinitialized", chn);
                self.dump_dds(chn);
            }
        }
    }

    fn check_dds(&self, bk: &mut BackendState, chn: u8) -> bool {
        let i = chn as usize;
        if bk.dds_pending_reset[i] {
            bk.dds_ovr[i] = DdsOvr::default();
            bk.dds_phase[i] = 0;
        }
        let reinit = self.p.check_dds(chn, bk.dds_pending_reset[i]);
        bk.dds_pending_reset[i] = false;
        reinit
    }

    fn dump_dds(&self, chn: u8) {
        for (addr, word) in self.p.dump_dds(chn) {
            log::info!("DDS {} [{:#04x}] = {:#010x}", chn, addr, word);
        }
    }

    /// Re-probe which DDS boards answer. Runs at most once per
    /// `DDS_CHECK_INTERVAL` unless forced or a reset is outstanding.
    fn detect_dds(&self, bk: &mut BackendState, force: bool) {
        let now = Instant::now();
        if !force {
            let fresh = bk
                .dds_check_time
                .is_some_and(|t| now.duration_since(t) < DDS_CHECK_INTERVAL);
            if fresh && !bk.dds_pending_reset.iter().any(|&pending| pending) {
                return;
            }
        }
        for chn in 0..NDDS as u8 {
            let i = chn as usize;
            if !self.p.dds_exists(chn) {
                self.dds_exist[i].store(false, Ordering::Relaxed);
                bk.dds_pending_reset[i] = false;
                continue;
            }
            self.dds_exist[i].store(true, Ordering::Relaxed);
            if force {
                bk.dds_pending_reset[i] = true;
            }
            if self.check_dds(bk, chn) && force {
                log::info!("DDS {} initialized", chn);
            }
            if force {
                self.dump_dds(chn);
            }
        }
        bk.dds_check_time = Some(now);
    }
}

impl<P: Pulser> Backend for Controller<P> {
    fn concurrent_set(&self, op: ReqOp, operand: u32, is_override: bool, val: u32) -> bool {
        if op != ReqOp::Ttl || !is_override {
            return false;
        }
        match operand {
            0 => self.p.set_ttl_lomask(val),
            1 => self.p.set_ttl_himask(val),
            _ => return false,
        }
        true
    }

    fn concurrent_get(&self, op: ReqOp, operand: u32, is_override: bool) -> Option<u32> {
        if op == ReqOp::Clock {
            return Some(u32::from(self.p.cur_clock()));
        }
        if op != ReqOp::Ttl {
            return None;
        }
        if !is_override {
            if operand != 0 {
                return None;
            }
            return Some((self.p.cur_ttl() | self.p.ttl_himask()) & !self.p.ttl_lomask());
        }
        match operand {
            0 => Some(self.p.ttl_lomask()),
            1 => Some(self.p.ttl_himask()),
            _ => None,
        }
    }

    fn active_dds(&self) -> Vec<u8> {
        (0..NDDS as u8)
            .filter(|&chn| self.dds_exist[chn as usize].load(Ordering::Relaxed))
            .collect()
    }
}

/// Build a controller on the real register file, or on the simulator when
/// asked to (or when the registers cannot be mapped).
pub fn create(dummy: bool, timing: TimingConfig) -> std::io::Result<CtrlIface> {
    if !dummy {
        match HwPulser::map() {
            Ok(p) => return Controller::start(p, timing),
            Err(err) => {
                log::warn!(
                    "cannot map pulse controller registers ({}), using the simulator",
                    err
                );
            }
        }
    }
    Controller::start(DummyPulser::new(), timing)
}
