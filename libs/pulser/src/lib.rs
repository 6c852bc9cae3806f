//! Access to the pulse controller fabric.
//!
//! The controller exposes a command FIFO that emits precisely timed TTL,
//! clock, DAC and DDS (AD9914) output, plus a small result FIFO for read
//! pulses. `HwPulser` drives the memory-mapped register file; `DummyPulser`
//! replays the same state machine in software with the real per-instruction
//! cycle cost so the rest of the stack can run and be tested without the
//! fabric present. Both are used in production (the daemon falls back to the
//! simulator when the register window cannot be mapped).

mod dummy;
mod hw;

pub use dummy::DummyPulser;
pub use hw::HwPulser;

use std::thread;
use std::time::Duration;

/// Number of DDS (AD9914) channels per box.
pub const NDDS: usize = 22;

/// Maximum per-instruction duration, in 10ns cycles.
pub const MAX_PULSE_T: u32 = (1 << 24) - 1;

/// Magic word written to the (otherwise unused) profile-7 FTW register once
/// a DDS board has been initialized. Surviving a reboot, it lets us skip the
/// glitchy reinitialization on restart.
const MAGIC_WORD: u32 = 0xad99_14f7;

/// Cycle cost of each instruction class, in 10ns steps. TTL and wait carry
/// an explicit duration; everything else is fixed by the fabric.
pub struct PulseTime;

impl PulseTime {
    /// Minimal spacing between pulses.
    pub const MIN: u32 = 3;
    pub const CLOCK: u32 = 5;
    pub const CLEAR_ERR: u32 = 5;
    pub const LOOPBACK: u32 = 5;
    pub const DAC: u32 = 45;
    pub const DDS_FREQ: u32 = 50;
    pub const DDS_AMP: u32 = 50;
    pub const DDS_PHASE: u32 = 50;
    pub const DDS_RESET: u32 = 50;
}

/// The one interface the controller stack depends on.
///
/// All methods take `&self`: the register file is safe to poke through a
/// shared reference, and the simulator uses interior locking. The command
/// and result FIFOs (every pulse push, `try_get_result`, hold/init/timing)
/// must only be used from a single thread at a time; the mask, current-TTL
/// and current-clock registers are safe to read concurrently.
///
/// Every pulse push takes a `checked` flag telling the fabric whether a
/// timing underflow on this instruction is a reportable error.
pub trait Pulser: Send + Sync {
    // Control registers.
    fn ttl_himask(&self) -> u32;
    fn ttl_lomask(&self) -> u32;
    fn set_ttl_himask(&self, mask: u32);
    fn set_ttl_lomask(&self, mask: u32);
    fn cur_ttl(&self) -> u32;
    fn cur_clock(&self) -> u8;
    /// Command FIFO fully drained.
    fn is_finished(&self) -> bool;
    /// No underflow on a checked pulse since the last `clear_error`.
    fn timing_ok(&self) -> bool;
    /// Cycles lost to underflows since the last `clear_error`. The real
    /// fabric has no such counter and always reports 0.
    fn underflow_cycle(&self) -> u64 {
        0
    }
    /// Stop consuming the command FIFO.
    fn set_hold(&self);
    /// Resume consuming the command FIFO.
    fn release_hold(&self);
    /// Reset prior to a new sequence; clears the force-release latch. The
    /// command FIFO must be drained first.
    fn toggle_init(&self);
    /// Push a clear-error pulse (unchecked).
    fn clear_error(&self);

    // Pulses. Each consumes one command FIFO slot.
    fn ttl(&self, ttl: u32, t: u32, checked: bool);
    fn wait(&self, t: u32, checked: bool);
    fn clock(&self, div: u8, checked: bool);
    fn dac(&self, chn: u8, v: u16, checked: bool);
    fn dds_reset(&self, chn: u8, checked: bool);
    fn dds_set_freq(&self, chn: u8, ftw: u32, checked: bool);
    fn dds_set_amp(&self, chn: u8, amp: u16, checked: bool);
    fn dds_set_phase(&self, chn: u8, phase: u16, checked: bool);
    // Raw DDS register plane: bytes `addr + 1, addr` resp. `addr + 3 ... addr`.
    fn dds_set_2bytes(&self, chn: u8, addr: u8, data: u16, checked: bool);
    fn dds_set_4bytes(&self, chn: u8, addr: u8, data: u32, checked: bool);

    // Pulses with results (one word in the result FIFO each).
    fn dds_get_freq(&self, chn: u8, checked: bool);
    fn dds_get_amp(&self, chn: u8, checked: bool);
    fn dds_get_phase(&self, chn: u8, checked: bool);
    fn dds_get_2bytes(&self, chn: u8, addr: u8, checked: bool);
    fn dds_get_4bytes(&self, chn: u8, addr: u8, checked: bool);
    /// Test pulse: puts `data` in the result FIFO after its fixed cost.
    fn loopback(&self, data: u32, checked: bool);

    // Results.
    fn num_results(&self) -> u32;
    fn try_get_result(&self) -> Option<u32>;
    /// Blocking result pop. Only for paths that do not care about the
    /// latency of the calling thread.
    fn get_result(&self) -> u32 {
        loop {
            if let Some(res) = self.try_get_result() {
                return res;
            }
            thread::yield_now();
        }
    }

    /// Probe whether a DDS board answers on `chn` by flipping a scratch
    /// register and checking the readback. Two commands, two results.
    fn dds_exists(&self, chn: u8) -> bool {
        self.dds_set_2bytes(chn, 0x68, 0, false);
        self.dds_get_2bytes(chn, 0x68, false);
        self.dds_set_2bytes(chn, 0x68, 1, false);
        self.dds_get_2bytes(chn, 0x68, false);
        let res0 = self.get_result();
        let res1 = self.get_result();
        res0 == 0 && res1 == 1
    }

    /// Check whether `chn` needs initialization and run it if so.
    ///
    /// Returns `true` if the board was (re)initialized. Unless `force` is
    /// set, a board carrying the magic word is left alone: it survived from
    /// a previous run and re-running the init would glitch its outputs.
    fn check_dds(&self, chn: u8, force: bool) -> bool {
        if !force {
            self.dds_get_4bytes(chn, 0x64, false);
            if self.get_result() == MAGIC_WORD {
                return false;
            }
        }
        self.init_dds(chn);
        true
    }

    /// Full AD9914 bring-up for `chn`.
    fn init_dds(&self, chn: u8) {
        self.dds_reset(chn, false);

        // Calibrate internal timing. Required at power-up.
        self.dds_set_2bytes(chn, 0x0e, 0x0105, false);
        thread::sleep(Duration::from_millis(1));
        // Finish cal. Disable sync_out.
        self.dds_set_2bytes(chn, 0x0e, 0x0405, false);

        // Disable SYNC_CLK output.
        self.dds_set_2bytes(chn, 0x04, 0x0100, false);

        // Disable ramp and programmable modulus, enable profile mode.
        self.dds_set_2bytes(chn, 0x06, 0x0080, false);

        // Enable amplitude control (OSK).
        self.dds_set_2bytes(chn, 0x00, 0x0308, false);

        // Zero-out all other memory.
        let mut addr = 0x10u8;
        while addr <= 0x6a {
            self.dds_set_2bytes(chn, addr, 0, false);
            addr += 2;
        }

        self.dds_set_4bytes(chn, 0x64, MAGIC_WORD, false);
    }

    /// List the non-zero 4-byte words of the register plane, for logging.
    fn dump_dds(&self, chn: u8) -> Vec<(u8, u32)> {
        let mut words = Vec::new();
        let mut addr = 0u8;
        while addr + 3 <= 0x7f {
            self.dds_get_4bytes(chn, addr, false);
            let word = self.get_result();
            if word != 0 {
                words.push((addr, word));
            }
            addr += 4;
        }
        words
    }
}

// Lets a caller keep a handle on the pulser it hands to the controller;
// tests use this to read the simulator's counters afterwards.
impl<P: Pulser> Pulser for std::sync::Arc<P> {
    fn ttl_himask(&self) -> u32 {
        (**self).ttl_himask()
    }
    fn ttl_lomask(&self) -> u32 {
        (**self).ttl_lomask()
    }
    fn set_ttl_himask(&self, mask: u32) {
        (**self).set_ttl_himask(mask)
    }
    fn set_ttl_lomask(&self, mask: u32) {
        (**self).set_ttl_lomask(mask)
    }
    fn cur_ttl(&self) -> u32 {
        (**self).cur_ttl()
    }
    fn cur_clock(&self) -> u8 {
        (**self).cur_clock()
    }
    fn is_finished(&self) -> bool {
        (**self).is_finished()
    }
    fn timing_ok(&self) -> bool {
        (**self).timing_ok()
    }
    fn underflow_cycle(&self) -> u64 {
        (**self).underflow_cycle()
    }
    fn set_hold(&self) {
        (**self).set_hold()
    }
    fn release_hold(&self) {
        (**self).release_hold()
    }
    fn toggle_init(&self) {
        (**self).toggle_init()
    }
    fn clear_error(&self) {
        (**self).clear_error()
    }
    fn ttl(&self, ttl: u32, t: u32, checked: bool) {
        (**self).ttl(ttl, t, checked)
    }
    fn wait(&self, t: u32, checked: bool) {
        (**self).wait(t, checked)
    }
    fn clock(&self, div: u8, checked: bool) {
        (**self).clock(div, checked)
    }
    fn dac(&self, chn: u8, v: u16, checked: bool) {
        (**self).dac(chn, v, checked)
    }
    fn dds_reset(&self, chn: u8, checked: bool) {
        (**self).dds_reset(chn, checked)
    }
    fn dds_set_freq(&self, chn: u8, ftw: u32, checked: bool) {
        (**self).dds_set_freq(chn, ftw, checked)
    }
    fn dds_set_amp(&self, chn: u8, amp: u16, checked: bool) {
        (**self).dds_set_amp(chn, amp, checked)
    }
    fn dds_set_phase(&self, chn: u8, phase: u16, checked: bool) {
        (**self).dds_set_phase(chn, phase, checked)
    }
    fn dds_set_2bytes(&self, chn: u8, addr: u8, data: u16, checked: bool) {
        (**self).dds_set_2bytes(chn, addr, data, checked)
    }
    fn dds_set_4bytes(&self, chn: u8, addr: u8, data: u32, checked: bool) {
        (**self).dds_set_4bytes(chn, addr, data, checked)
    }
    fn dds_get_freq(&self, chn: u8, checked: bool) {
        (**self).dds_get_freq(chn, checked)
    }
    fn dds_get_amp(&self, chn: u8, checked: bool) {
        (**self).dds_get_amp(chn, checked)
    }
    fn dds_get_phase(&self, chn: u8, checked: bool) {
        (**self).dds_get_phase(chn, checked)
    }
    fn dds_get_2bytes(&self, chn: u8, addr: u8, checked: bool) {
        (**self).dds_get_2bytes(chn, addr, checked)
    }
    fn dds_get_4bytes(&self, chn: u8, addr: u8, checked: bool) {
        (**self).dds_get_4bytes(chn, addr, checked)
    }
    fn loopback(&self, data: u32, checked: bool) {
        (**self).loopback(data, checked)
    }
    fn num_results(&self) -> u32 {
        (**self).num_results()
    }
    fn try_get_result(&self) -> Option<u32> {
        (**self).try_get_result()
    }
}
