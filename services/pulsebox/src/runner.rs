//! Per-sequence execution state: turns decoder callbacks into timed
//! pulses while keeping the FPGA ahead of wall clock.

use std::thread;
use std::time::{Duration, Instant};

use pulser::{PulseTime, Pulser};

use crate::api::OVR_OFF;
use crate::controller::{set_bit, BackendState, Controller};
use crate::seq;

/// Sequences at or below this nominal length run without preemption.
const NO_PREEMPT_NS: u64 = 1_000_000_000;

/// Waits shorter than this are pushed straight through.
const SHORT_WAIT: u64 = 2000;

/// The part of the runner that `run_cmd` needs to see when an untimed TTL
/// request lands in the middle of a sequence.
pub(crate) struct RunState {
    pub(crate) ttlmask: u32,
    pub(crate) ttl: u32,
    /// Bits the sequence must not change, frozen at their pre-sequence
    /// values (and updated by untimed requests landing mid-sequence).
    pub(crate) preserve_ttl: u32,
    /// Cumulative sequence time pushed so far, in cycles.
    pub(crate) t: u64,
    start: Instant,
    min_lead: Duration,
    idle_sleep: Duration,
    released: bool,
    no_preempt: bool,
}

pub(crate) struct SeqRunner<'a, P: Pulser> {
    ctrl: &'a Controller<P>,
    bk: &'a mut BackendState,
    pub(crate) st: RunState,
}

impl<'a, P: Pulser> SeqRunner<'a, P> {
    pub(crate) fn new(
        ctrl: &'a Controller<P>,
        bk: &'a mut BackendState,
        ttlmask: u32,
        len_ns: u64,
    ) -> SeqRunner<'a, P> {
        let ttl = ctrl.p.cur_ttl();
        SeqRunner {
            ctrl,
            bk,
            st: RunState {
                ttlmask,
                ttl,
                preserve_ttl: !ttlmask & ttl,
                t: 0,
                start: Instant::now(),
                min_lead: ctrl.timing.min_lead,
                idle_sleep: ctrl.timing.idle_sleep,
                released: false,
                no_preempt: len_ns <= NO_PREEMPT_NS,
            },
        }
    }

    fn push_wait(&mut self, t: u64, checked: bool) {
        let mut rem = t;
        while rem > 0 {
            let chunk = rem.min(u64::from(pulser::MAX_PULSE_T)) as u32;
            self.ctrl.p.wait(chunk, checked);
            rem -= u64::from(chunk);
        }
        self.st.t += t;
    }

    /// The scheduler half of the runner. Short sequences and short waits
    /// go straight to the FIFO; long waits keep the hardware just far
    /// enough ahead of wall clock and spend the surplus serving untimed
    /// requests.
    pub(crate) fn wait_with(&mut self, t: u64, checked: bool) {
        if self.st.no_preempt || t < SHORT_WAIT {
            self.push_wait(t, checked);
            return;
        }
        let mut t = t;
        if !self.st.released {
            // Give the FIFO a head start before the hardware begins
            // consuming.
            self.push_wait(1000, checked);
            self.ctrl.p.release_hold();
            self.st.released = true;
            t -= 1000;
        }
        let tend = self.st.t + t;
        loop {
            let rem = tend - self.st.t;
            if rem <= 1000 {
                // The rest fits without endangering the lead.
                if rem > 0 {
                    self.push_wait(rem, checked);
                }
                return;
            }
            let now = Instant::now();
            let seq_rt = self.st.start + Duration::from_nanos(self.st.t * 10);
            let thresh = now + self.st.min_lead;
            if seq_rt >= thresh {
                // Enough lead; do something useful.
                let (cycles, did) =
                    self.ctrl
                        .process_reqcmd(&mut *self.bk, Some(&mut self.st), checked);
                self.st.t += u64::from(cycles);
                if !did {
                    thread::sleep(self.st.idle_sleep);
                }
            } else {
                // Close to the real-time frontier: forward the sequence,
                // at least 1000 cycles at a time.
                let target =
                    (thresh.duration_since(self.st.start).as_nanos() as u64).div_ceil(10);
                let step = target.saturating_sub(self.st.t).max(1000).min(rem);
                self.push_wait(step, checked);
            }
        }
    }

    pub(crate) fn clock_with(&mut self, div: u8, checked: bool) {
        self.ctrl.p.clock(div, checked);
        self.st.t += u64::from(PulseTime::CLOCK);
    }

    /// Serve one untimed request inside the sequence; used while draining
    /// the FIFO after the program is flushed.
    pub(crate) fn process_one(&mut self, checked: bool) -> bool {
        let (cycles, did) = self
            .ctrl
            .process_reqcmd(&mut *self.bk, Some(&mut self.st), checked);
        self.st.t += u64::from(cycles);
        did
    }
}

impl<P: Pulser> seq::Runner for SeqRunner<'_, P> {
    fn ttl(&mut self, word: u32, t: u64) {
        let merged = word | self.st.preserve_ttl;
        self.st.ttl = merged;
        self.bk.shadow_ttl = merged;
        if t <= 1000 {
            self.ctrl.p.ttl(merged, t as u32, true);
            self.st.t += t;
        } else {
            self.ctrl.p.ttl(merged, 100, true);
            self.st.t += 100;
            self.wait_with(t - 100, true);
        }
    }

    fn ttl1(&mut self, chn: u8, val: bool, t: u64) {
        self.ttl(set_bit(self.st.ttl, chn, val), t);
    }

    fn dds_freq(&mut self, chn: u8, ftw: u32) {
        if self.bk.dds_ovr[chn as usize].freq != OVR_OFF {
            // Overridden: stay on the time grid without touching the
            // hardware value.
            self.wait_with(u64::from(PulseTime::DDS_FREQ), true);
            return;
        }
        self.ctrl.p.dds_set_freq(chn, ftw, true);
        self.st.t += u64::from(PulseTime::DDS_FREQ);
    }

    fn dds_amp(&mut self, chn: u8, amp: u16) {
        if self.bk.dds_ovr[chn as usize].amp_on {
            self.wait_with(u64::from(PulseTime::DDS_AMP), true);
            return;
        }
        self.ctrl.p.dds_set_amp(chn, amp & 0xfff, true);
        self.st.t += u64::from(PulseTime::DDS_AMP);
    }

    fn dds_phase(&mut self, chn: u8, phase: u16) {
        if self.bk.dds_ovr[chn as usize].phase_on {
            self.wait_with(u64::from(PulseTime::DDS_PHASE), true);
            return;
        }
        self.bk.dds_phase[chn as usize] = phase;
        self.ctrl.p.dds_set_phase(chn, phase, true);
        self.st.t += u64::from(PulseTime::DDS_PHASE);
    }

    fn dds_detphase(&mut self, chn: u8, detphase: u16) {
        if self.bk.dds_ovr[chn as usize].phase_on {
            self.wait_with(u64::from(PulseTime::DDS_PHASE), true);
            return;
        }
        let phase = self.bk.dds_phase[chn as usize].wrapping_add(detphase);
        self.dds_phase(chn, phase);
    }

    fn dds_reset(&mut self, chn: u8) {
        // The reset pulse is part of the sequence; the reinitialization
        // happens afterwards, once the sequence is done.
        self.ctrl.p.dds_reset(chn, true);
        self.st.t += u64::from(PulseTime::DDS_RESET);
        self.bk.dds_pending_reset[chn as usize] = true;
    }

    fn dac(&mut self, chn: u8, v: u16) {
        self.ctrl.p.dac(chn, v, true);
        self.st.t += u64::from(PulseTime::DAC);
    }

    fn clock(&mut self, div: u8) {
        self.clock_with(div, true);
    }

    fn wait(&mut self, t: u64) {
        self.wait_with(t, true);
    }
}
