//! Software replay of the pulse controller state machine.
//!
//! The simulator keeps the same externally observable semantics as the
//! fabric: an instruction FIFO consumed in real time with the real
//! per-opcode cycle cost, a bounded result FIFO, hold/release/init
//! semantics including the force-release that kicks in when the FIFO fills
//! while held, and the timing-underflow latch for checked pulses. Debug
//! counters expose what was executed so tests can assert on behavior
//! without hardware.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{Pulser, PulseTime, NDDS};

/// Instruction FIFO depth; filling it while held force-releases the hold.
pub const CMD_FIFO_DEPTH: usize = 4096;
/// Result FIFO depth; overflowing drops the new word (it reads back as 0).
pub const RESULT_FIFO_DEPTH: usize = 16;

#[derive(Clone, Copy, Debug)]
enum Op {
    Ttl { word: u32, t: u32 },
    Wait { t: u32 },
    Clock { div: u8 },
    ClearErr,
    LoopBack { data: u32 },
    Dac,
    DdsSet2 { chn: u8, addr: u8, data: u16 },
    DdsSet4 { chn: u8, addr: u8, data: u32 },
    DdsGet2 { chn: u8, addr: u8 },
    DdsGet4 { chn: u8, addr: u8 },
    DdsReset { chn: u8 },
}

#[derive(Clone, Copy)]
struct Cmd {
    op: Op,
    checked: bool,
    queued: Instant,
}

#[derive(Default)]
struct Counters {
    inst_word: u32,
    inst: u32,
    ttl: u32,
    dds: u32,
    wait: u32,
    clear_err: u32,
    loopback: u32,
    clock: u32,
    inst_cycle: u64,
    ttl_cycle: u64,
    wait_cycle: u64,
    result_generated: u32,
    result_consumed: u32,
}

struct DdsChan {
    present: bool,
    regs: [u8; 0x80],
}

struct Sim {
    himask: u32,
    lomask: u32,
    ttl: u32,
    clock: u8,
    hold: bool,
    force_release: bool,
    timing_ok: bool,
    underflow_cycle: u64,
    // Scheduled start of the front instruction; frozen at `now` while held.
    next_t: Instant,
    cmds: VecDeque<Cmd>,
    results: VecDeque<u32>,
    overflow: u32,
    dds: [DdsChan; NDDS],
    ctr: Counters,
}

/// Simulated [`Pulser`]. All DDS channels are present by default; tests can
/// unplug boards with [`DummyPulser::set_dds_present`].
pub struct DummyPulser {
    sim: Mutex<Sim>,
}

fn cycles_between(from: Instant, to: Instant) -> u64 {
    (to - from).as_nanos() as u64 / 10
}

impl Sim {
    fn new() -> Sim {
        Sim {
            himask: 0,
            lomask: 0,
            ttl: 0,
            clock: 255,
            hold: false,
            force_release: false,
            timing_ok: true,
            underflow_cycle: 0,
            next_t: Instant::now(),
            cmds: VecDeque::new(),
            results: VecDeque::new(),
            overflow: 0,
            dds: std::array::from_fn(|_| DdsChan {
                present: true,
                regs: [0; 0x80],
            }),
            ctr: Counters::default(),
        }
    }

    fn push_result(&mut self, val: u32) {
        self.ctr.result_generated += 1;
        if self.results.len() >= RESULT_FIFO_DEPTH {
            self.overflow += 1;
        } else {
            self.results.push_back(val);
        }
    }

    fn dds_read(&self, chn: u8, addr: u8, len: usize) -> u32 {
        let chan = &self.dds[chn as usize];
        if !chan.present {
            return 0;
        }
        let mut val = 0u32;
        for i in (0..len).rev() {
            let a = addr as usize + i;
            let byte = if a < chan.regs.len() { chan.regs[a] } else { 0 };
            val = val << 8 | u32::from(byte);
        }
        val
    }

    fn dds_write(&mut self, chn: u8, addr: u8, val: u32, len: usize) {
        let chan = &mut self.dds[chn as usize];
        if !chan.present {
            return;
        }
        for i in 0..len {
            let a = addr as usize + i;
            if a < chan.regs.len() {
                chan.regs[a] = (val >> (8 * i)) as u8;
            }
        }
    }

    // Apply one instruction's effect and return its cycle cost.
    fn exec(&mut self, op: Op) -> u32 {
        match op {
            Op::Ttl { word, t } => {
                self.ttl = word;
                self.ctr.ttl += 1;
                self.ctr.ttl_cycle += u64::from(t);
                t
            }
            Op::Wait { t } => {
                self.ctr.wait += 1;
                self.ctr.wait_cycle += u64::from(t);
                t
            }
            Op::Clock { div } => {
                self.clock = div;
                self.ctr.clock += 1;
                PulseTime::CLOCK
            }
            Op::ClearErr => {
                self.timing_ok = true;
                self.underflow_cycle = 0;
                self.ctr.clear_err += 1;
                PulseTime::CLEAR_ERR
            }
            Op::LoopBack { data } => {
                self.push_result(data);
                self.ctr.loopback += 1;
                PulseTime::LOOPBACK
            }
            Op::Dac => PulseTime::DAC,
            Op::DdsSet2 { chn, addr, data } => {
                self.dds_write(chn, addr, u32::from(data), 2);
                self.ctr.dds += 1;
                PulseTime::DDS_FREQ
            }
            Op::DdsSet4 { chn, addr, data } => {
                self.dds_write(chn, addr, data, 4);
                self.ctr.dds += 1;
                PulseTime::DDS_FREQ
            }
            Op::DdsGet2 { chn, addr } => {
                let val = self.dds_read(chn, addr, 2);
                self.push_result(val);
                self.ctr.dds += 1;
                PulseTime::DDS_FREQ
            }
            Op::DdsGet4 { chn, addr } => {
                let val = self.dds_read(chn, addr, 4);
                self.push_result(val);
                self.ctr.dds += 1;
                PulseTime::DDS_FREQ
            }
            Op::DdsReset { chn } => {
                if self.dds[chn as usize].present {
                    self.dds[chn as usize].regs = [0; 0x80];
                }
                self.ctr.dds += 1;
                PulseTime::DDS_RESET
            }
        }
    }

    // Consume every instruction whose scheduled start has passed.
    fn forward_time(&mut self) {
        let now = Instant::now();
        if self.hold && !self.force_release {
            // Held: nothing is scheduled, the timeline tracks the present.
            self.next_t = now;
            return;
        }
        while !self.cmds.is_empty() && self.next_t <= now {
            let cmd = self.cmds.pop_front().unwrap();
            if cmd.queued > self.next_t {
                // The FIFO ran dry before this instruction arrived.
                if cmd.checked {
                    self.timing_ok = false;
                    self.underflow_cycle += cycles_between(self.next_t, cmd.queued);
                }
                self.next_t = cmd.queued;
            }
            let cycles = self.exec(cmd.op);
            self.ctr.inst += 1;
            self.ctr.inst_cycle += u64::from(cycles);
            self.next_t += Duration::from_nanos(u64::from(cycles) * 10);
        }
    }
}

impl DummyPulser {
    pub fn new() -> DummyPulser {
        DummyPulser {
            sim: Mutex::new(Sim::new()),
        }
    }

    /// Debug accessor: read a 4-byte word of a channel's register plane
    /// directly, without consuming a result FIFO slot.
    pub fn dds_word(&self, chn: u8, addr: u8) -> u32 {
        self.with_sim(|s| s.dds_read(chn, addr, 4))
    }

    /// Plug or unplug a simulated DDS board.
    pub fn set_dds_present(&self, chn: u8, present: bool) {
        let mut s = self.sim.lock().unwrap();
        let chan = &mut s.dds[chn as usize];
        chan.present = present;
        chan.regs = [0; 0x80];
    }

    fn add_cmd(&self, op: Op, checked: bool) {
        let mut s = self.sim.lock().unwrap();
        s.forward_time();
        s.ctr.inst_word += 2;
        s.cmds.push_back(Cmd {
            op,
            checked,
            queued: Instant::now(),
        });
        if s.cmds.len() >= CMD_FIFO_DEPTH && s.hold && !s.force_release {
            // A full FIFO pushes through the hold.
            s.force_release = true;
            s.forward_time();
        }
    }

    fn with_sim<R>(&self, f: impl FnOnce(&mut Sim) -> R) -> R {
        let mut s = self.sim.lock().unwrap();
        s.forward_time();
        f(&mut s)
    }

    // Debug counters. All forward time first, so they reflect everything
    // that was due by the time of the call.
    pub fn inst_word_count(&self) -> u32 {
        self.with_sim(|s| s.ctr.inst_word)
    }
    pub fn inst_count(&self) -> u32 {
        self.with_sim(|s| s.ctr.inst)
    }
    pub fn ttl_count(&self) -> u32 {
        self.with_sim(|s| s.ctr.ttl)
    }
    pub fn dds_count(&self) -> u32 {
        self.with_sim(|s| s.ctr.dds)
    }
    pub fn wait_count(&self) -> u32 {
        self.with_sim(|s| s.ctr.wait)
    }
    pub fn clear_error_count(&self) -> u32 {
        self.with_sim(|s| s.ctr.clear_err)
    }
    pub fn loopback_count(&self) -> u32 {
        self.with_sim(|s| s.ctr.loopback)
    }
    pub fn clock_count(&self) -> u32 {
        self.with_sim(|s| s.ctr.clock)
    }
    pub fn inst_cycle(&self) -> u64 {
        self.with_sim(|s| s.ctr.inst_cycle)
    }
    pub fn ttl_cycle(&self) -> u64 {
        self.with_sim(|s| s.ctr.ttl_cycle)
    }
    pub fn wait_cycle(&self) -> u64 {
        self.with_sim(|s| s.ctr.wait_cycle)
    }
    pub fn result_count(&self) -> u32 {
        self.with_sim(|s| s.results.len() as u32 + s.overflow)
    }
    pub fn result_generated(&self) -> u32 {
        self.with_sim(|s| s.ctr.result_generated)
    }
    pub fn result_consumed(&self) -> u32 {
        self.with_sim(|s| s.ctr.result_consumed)
    }
    pub fn result_overflow_count(&self) -> u32 {
        self.with_sim(|s| s.overflow)
    }
}

impl Default for DummyPulser {
    fn default() -> Self {
        Self::new()
    }
}

impl Pulser for DummyPulser {
    fn ttl_himask(&self) -> u32 {
        self.sim.lock().unwrap().himask
    }

    fn ttl_lomask(&self) -> u32 {
        self.sim.lock().unwrap().lomask
    }

    fn set_ttl_himask(&self, mask: u32) {
        self.sim.lock().unwrap().himask = mask;
    }

    fn set_ttl_lomask(&self, mask: u32) {
        self.sim.lock().unwrap().lomask = mask;
    }

    fn cur_ttl(&self) -> u32 {
        self.with_sim(|s| s.ttl)
    }

    fn cur_clock(&self) -> u8 {
        self.with_sim(|s| s.clock)
    }

    fn is_finished(&self) -> bool {
        self.with_sim(|s| s.cmds.is_empty())
    }

    fn timing_ok(&self) -> bool {
        self.with_sim(|s| s.timing_ok)
    }

    fn underflow_cycle(&self) -> u64 {
        self.with_sim(|s| s.underflow_cycle)
    }

    fn set_hold(&self) {
        self.with_sim(|s| s.hold = true);
    }

    fn release_hold(&self) {
        // forward_time pins next_t to the present while held, so released
        // instructions are scheduled from the release point.
        self.with_sim(|s| s.hold = false);
    }

    fn toggle_init(&self) {
        let mut s = self.sim.lock().unwrap();
        s.forward_time();
        if !s.cmds.is_empty() {
            log::warn!(
                "toggle_init with {} instructions still queued",
                s.cmds.len()
            );
            s.cmds.clear();
        }
        s.results.clear();
        s.overflow = 0;
        s.force_release = false;
        s.ctr = Counters::default();
        s.next_t = Instant::now();
    }

    fn clear_error(&self) {
        self.add_cmd(Op::ClearErr, false);
    }

    fn ttl(&self, ttl: u32, t: u32, checked: bool) {
        debug_assert!(t <= crate::MAX_PULSE_T);
        self.add_cmd(Op::Ttl { word: ttl, t }, checked);
    }

    fn wait(&self, t: u32, checked: bool) {
        debug_assert!(t <= crate::MAX_PULSE_T);
        self.add_cmd(Op::Wait { t }, checked);
    }

    fn clock(&self, div: u8, checked: bool) {
        self.add_cmd(Op::Clock { div }, checked);
    }

    fn dac(&self, _chn: u8, _v: u16, checked: bool) {
        self.add_cmd(Op::Dac, checked);
    }

    fn dds_reset(&self, chn: u8, checked: bool) {
        self.add_cmd(Op::DdsReset { chn }, checked);
    }

    fn dds_set_freq(&self, chn: u8, ftw: u32, checked: bool) {
        self.add_cmd(
            Op::DdsSet4 {
                chn,
                addr: 0x2c,
                data: ftw,
            },
            checked,
        );
    }

    fn dds_set_amp(&self, chn: u8, amp: u16, checked: bool) {
        self.add_cmd(
            Op::DdsSet2 {
                chn,
                addr: 0x32,
                data: amp & 0xfff,
            },
            checked,
        );
    }

    fn dds_set_phase(&self, chn: u8, phase: u16, checked: bool) {
        self.add_cmd(
            Op::DdsSet2 {
                chn,
                addr: 0x30,
                data: phase,
            },
            checked,
        );
    }

    fn dds_set_2bytes(&self, chn: u8, addr: u8, data: u16, checked: bool) {
        self.add_cmd(Op::DdsSet2 { chn, addr, data }, checked);
    }

    fn dds_set_4bytes(&self, chn: u8, addr: u8, data: u32, checked: bool) {
        self.add_cmd(Op::DdsSet4 { chn, addr, data }, checked);
    }

    fn dds_get_freq(&self, chn: u8, checked: bool) {
        self.add_cmd(Op::DdsGet4 { chn, addr: 0x2c }, checked);
    }

    fn dds_get_amp(&self, chn: u8, checked: bool) {
        self.add_cmd(Op::DdsGet2 { chn, addr: 0x32 }, checked);
    }

    fn dds_get_phase(&self, chn: u8, checked: bool) {
        self.add_cmd(Op::DdsGet2 { chn, addr: 0x30 }, checked);
    }

    fn dds_get_2bytes(&self, chn: u8, addr: u8, checked: bool) {
        self.add_cmd(Op::DdsGet2 { chn, addr }, checked);
    }

    fn dds_get_4bytes(&self, chn: u8, addr: u8, checked: bool) {
        self.add_cmd(Op::DdsGet4 { chn, addr }, checked);
    }

    fn loopback(&self, data: u32, checked: bool) {
        self.add_cmd(Op::LoopBack { data }, checked);
    }

    fn num_results(&self) -> u32 {
        self.with_sim(|s| s.results.len() as u32 + s.overflow)
    }

    fn try_get_result(&self) -> Option<u32> {
        self.with_sim(|s| {
            if let Some(val) = s.results.pop_front() {
                s.ctr.result_consumed += 1;
                Some(val)
            } else if s.overflow > 0 {
                // Reads past the stored content: the overflowed words were
                // dropped and come back as zeros.
                s.overflow -= 1;
                s.ctr.result_consumed += 1;
                Some(0)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn drain(p: &DummyPulser) {
        while !p.is_finished() {
            thread::yield_now();
        }
    }

    #[test]
    fn ttl_and_loopback() {
        let p = DummyPulser::new();
        p.release_hold();
        for i in 0..32 {
            let v = 1u32 << i;
            let vl = v.wrapping_mul(15).wrapping_add(0x12345678);
            p.ttl(v, 10, false);
            p.loopback(vl, false);
            assert_eq!(p.get_result(), vl);
            assert_eq!(p.cur_ttl(), v);
        }
        p.ttl(0xffffffff, 10, false);
        p.loopback(0, false);
        assert_eq!(p.get_result(), 0);
        assert_eq!(p.cur_ttl(), 0xffffffff);
        p.ttl(0, 10, false);
        p.loopback(0xffffffff, false);
        assert_eq!(p.get_result(), 0xffffffff);
        assert_eq!(p.cur_ttl(), 0);
        drain(&p);
        assert_eq!(p.ttl_count(), 34);
        assert_eq!(p.loopback_count(), 34);
        assert_eq!(p.inst_count(), 68);
        assert_eq!(p.inst_word_count(), 136);
        assert_eq!(p.ttl_cycle(), 34 * 10);
        assert_eq!(
            p.inst_cycle(),
            34 * 10 + 34 * u64::from(PulseTime::LOOPBACK)
        );
        assert_eq!(p.result_generated(), 34);
        assert_eq!(p.result_consumed(), 34);
        assert_eq!(p.result_count(), 0);
    }

    #[test]
    fn ttl_masks() {
        let p = DummyPulser::new();
        for i in 0..32 {
            let v = 1u32 << i;
            p.set_ttl_himask(v);
            assert_eq!(p.ttl_himask(), v);
            p.set_ttl_lomask(v);
            assert_eq!(p.ttl_lomask(), v);
        }
        p.set_ttl_himask(0);
        p.set_ttl_lomask(0);
        assert_eq!(p.ttl_himask(), 0);
        assert_eq!(p.ttl_lomask(), 0);
    }

    #[test]
    fn hold_and_release() {
        let p = DummyPulser::new();
        p.set_hold();
        p.ttl(345, 10, false);
        p.loopback(888, false);
        thread::sleep(Duration::from_millis(10));
        assert!(p.try_get_result().is_none());
        assert_eq!(p.cur_ttl(), 0);
        assert!(!p.is_finished());
        p.release_hold();
        assert_eq!(p.get_result(), 888);
        assert_eq!(p.cur_ttl(), 345);
        drain(&p);
        assert!(p.timing_ok());
    }

    #[test]
    fn timing_underflow() {
        let p = DummyPulser::new();
        assert!(p.timing_ok());
        assert_eq!(p.underflow_cycle(), 0);
        p.wait(3, true);
        thread::sleep(Duration::from_millis(10));
        p.wait(3, true);
        thread::sleep(Duration::from_millis(1));
        assert!(!p.timing_ok());
        assert!(p.underflow_cycle() > 1_000_000);
        p.clear_error();
        p.loopback(1, false);
        assert_eq!(p.get_result(), 1);
        assert!(p.timing_ok());
        assert_eq!(p.underflow_cycle(), 0);
    }

    #[test]
    fn clock_roundtrip() {
        let p = DummyPulser::new();
        assert_eq!(p.cur_clock(), 255);
        for i in 0..=255u8 {
            let vl = u32::from(i) * 15 + 12389 + (u32::from(i) << 20);
            p.clock(i, false);
            p.loopback(vl, false);
            assert_eq!(p.get_result(), vl);
            assert_eq!(p.cur_clock(), i);
        }
        drain(&p);
        assert_eq!(p.clock_count(), 256);
    }

    #[test]
    fn auto_release_on_full_fifo() {
        let p = DummyPulser::new();
        p.set_hold();
        for _ in 0..4090 {
            p.wait(5, true);
        }
        for _ in 0..8 {
            p.wait(1000, true);
        }
        p.wait(3, false);
        drain(&p);
        assert!(p.timing_ok());
        assert_eq!(p.underflow_cycle(), 0);
        assert_eq!(p.wait_count(), 4099);
        assert_eq!(p.wait_cycle(), 4090 * 5 + 8 * 1000 + 3);
        // toggle_init clears the force-release latch again.
        p.toggle_init();
        assert_eq!(p.wait_count(), 0);
        p.set_hold();
        p.wait(3, false);
        thread::sleep(Duration::from_millis(2));
        assert!(!p.is_finished());
        p.release_hold();
        drain(&p);
    }

    #[test]
    fn result_overflow() {
        let p = DummyPulser::new();
        for i in 0..20u32 {
            p.loopback(i + 1, false);
        }
        drain(&p);
        assert_eq!(p.result_generated(), 20);
        assert_eq!(p.result_overflow_count(), 4);
        assert_eq!(p.result_count(), 20);
        for i in 0..16u32 {
            assert_eq!(p.get_result(), i + 1);
        }
        for _ in 0..4 {
            assert_eq!(p.get_result(), 0);
        }
        assert!(p.try_get_result().is_none());
        assert_eq!(p.result_count(), 0);
        assert_eq!(p.result_overflow_count(), 0);
        assert_eq!(p.result_consumed(), 20);
    }

    #[test]
    fn dds_register_plane() {
        let p = DummyPulser::new();
        p.dds_set_freq(3, 0x12345678, false);
        p.dds_get_freq(3, false);
        assert_eq!(p.get_result(), 0x12345678);
        p.dds_set_amp(3, 0xffff, false);
        p.dds_get_amp(3, false);
        // Amplitude is 12 bits wide in the register.
        assert_eq!(p.get_result(), 0xfff);
        p.dds_set_phase(3, 0xabcd, false);
        p.dds_get_phase(3, false);
        assert_eq!(p.get_result(), 0xabcd);
        p.dds_reset(3, false);
        p.dds_get_freq(3, false);
        assert_eq!(p.get_result(), 0);
        drain(&p);
        assert_eq!(p.dds_count(), 7);
    }

    #[test]
    fn dds_identity_and_init() {
        let p = DummyPulser::new();
        assert!(p.dds_exists(0));
        p.set_dds_present(7, false);
        assert!(!p.dds_exists(7));

        // First check initializes, second finds the magic word.
        assert!(p.check_dds(0, false));
        assert!(!p.check_dds(0, false));
        // A reset wipes the magic word, so the next check re-inits.
        p.dds_reset(0, false);
        assert!(p.check_dds(0, false));
        assert!(p.check_dds(0, true));

        let dump = p.dump_dds(0);
        assert!(dump.iter().any(|&(addr, _)| addr == 0x64));
    }
}
