//! End-to-end tests of the controller runtime against the simulator.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pulsebox::api::{DdsType, SeqEvent, OVR_OFF};
use pulsebox::controller::{Controller, TimingConfig};
use pulsebox::iface::{CtrlIface, NotifyFn, TtlOvr};
use pulsebox::pulser::{DummyPulser, Pulser};
use pulsebox::seq::cmdlist;

fn start(dds_present: bool, timing: TimingConfig) -> (Arc<DummyPulser>, CtrlIface) {
    let p = Arc::new(DummyPulser::new());
    if !dds_present {
        for chn in 0..pulsebox::api::NDDS as u8 {
            p.set_dds_present(chn, false);
        }
    }
    let iface = Controller::start(Arc::clone(&p), timing).unwrap();
    (p, iface)
}

fn recorder() -> (Rc<RefCell<Vec<SeqEvent>>>, NotifyFn) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let events2 = Rc::clone(&events);
    (events, Box::new(move |ev| events2.borrow_mut().push(ev)))
}

/// Pump the frontend until `done` holds; panics after `timeout`.
fn drive(iface: &mut CtrlIface, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        iface.run_frontend();
        if done() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out driving the frontend");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn sequence_lifecycle_and_cycle_accounting() {
    let (p, mut iface) = start(false, TimingConfig::default());

    let mut code = Vec::new();
    cmdlist::push_ttl(&mut code, 0x5a5a_5a5a, 20);
    cmdlist::push_wait(&mut code, 500);
    cmdlist::push_freq(&mut code, 3, 0x1234_5678);
    cmdlist::push_ttl(&mut code, 0, 3);
    let total = cmdlist::total_time(&code).unwrap();
    assert_eq!(total, 20 + 500 + 50 + 3);

    let (events, notify) = recorder();
    let id = iface
        .run_code(true, 1, total * 10, u32::MAX, code.into(), notify)
        .unwrap();
    assert_eq!(id, 1);
    assert!(iface.has_pending().0);

    drive(&mut iface, Duration::from_secs(5), || {
        events.borrow().iter().any(|ev| *ev == SeqEvent::End(id))
    });
    assert_eq!(iface.has_pending(), (false, false));
    assert_eq!(
        *events.borrow(),
        vec![SeqEvent::Start(id), SeqEvent::Flushed(id), SeqEvent::End(id)]
    );

    // Once the FIFO is fully drained, the simulator executed exactly the
    // program plus the flush wait and the clear-error pulse: the cycles
    // the runner charged are the cycles the hardware ran.
    wait_for(Duration::from_secs(1), || p.is_finished());
    assert_eq!(p.inst_cycle(), total + 3 + 5);
    assert_eq!(p.ttl_cycle(), 23);
    assert_eq!(p.cur_ttl(), 0);
    assert!(p.timing_ok());
}

#[test]
fn rejects_bad_version() {
    let (_p, mut iface) = start(false, TimingConfig::default());
    let (_events, notify) = recorder();
    assert!(iface
        .run_code(true, 2, 0, 0, Vec::new().into(), notify)
        .is_err());
}

#[test]
fn override_wins_over_sequence_writes() {
    let (p, mut iface) = start(true, TimingConfig::default());

    iface.set_dds_ovr(DdsType::Freq, 3, 0xbeef);
    wait_for(Duration::from_secs(5), || p.dds_word(3, 0x2c) == 0xbeef);

    // A sequence writing the overridden channel must not reach the
    // hardware, but still advances on its time grid.
    let mut code = Vec::new();
    cmdlist::push_freq(&mut code, 3, 0x1111);
    cmdlist::push_wait(&mut code, 100);
    let (events, notify) = recorder();
    let id = iface
        .run_code(true, 1, 1500, u32::MAX, code.into(), notify)
        .unwrap();
    drive(&mut iface, Duration::from_secs(5), || {
        events.borrow().iter().any(|ev| *ev == SeqEvent::End(id))
    });
    assert_eq!(p.dds_word(3, 0x2c), 0xbeef);
    assert!(p.timing_ok());

    // A hardware read agrees with the override.
    let got = Rc::new(Cell::new(None));
    let got2 = Rc::clone(&got);
    iface.get_dds(DdsType::Freq, 3, Box::new(move |val| got2.set(Some(val))));
    drive(&mut iface, Duration::from_secs(5), || got.get().is_some());
    assert_eq!(got.get(), Some(0xbeef));

    // Clearing the override lets plain sets through again.
    iface.set_dds_ovr(DdsType::Freq, 3, OVR_OFF);
    iface.set_dds(DdsType::Freq, 3, 0x2222);
    wait_for(Duration::from_secs(5), || p.dds_word(3, 0x2c) == 0x2222);
}

#[test]
fn ttl_mask_preserves_foreign_bits() {
    let (p, mut iface) = start(false, TimingConfig::default());

    iface.set_ttl_word(0xf0f0_1234);
    wait_for(Duration::from_secs(5), || p.cur_ttl() == 0xf0f0_1234);

    let mut code = Vec::new();
    cmdlist::push_ttl(&mut code, 0x0000_00ff, 10);
    cmdlist::push_wait(&mut code, 100);
    cmdlist::push_ttl(&mut code, 0x0000_0001, 10);
    let (events, notify) = recorder();
    let id = iface
        .run_code(true, 1, 1200, 0x0000_ffff, code.into(), notify)
        .unwrap();
    drive(&mut iface, Duration::from_secs(5), || {
        events.borrow().iter().any(|ev| *ev == SeqEvent::End(id))
    });
    wait_for(Duration::from_secs(1), || p.is_finished());
    // Bits outside the mask kept their pre-sequence values throughout.
    assert_eq!(p.cur_ttl(), 0xf0f0_0001);
}

#[test]
fn cancel_queued_sequence_only() {
    let (_p, mut iface) = start(false, TimingConfig::default());

    // 50ms worth of wait: long enough to still be running when we cancel
    // the one queued behind it, short enough to never be preempted.
    let mut long_code = Vec::new();
    cmdlist::push_wait(&mut long_code, 5_000_000);
    let (events1, notify1) = recorder();
    let id1 = iface
        .run_code(true, 1, 50_000_000, 0, long_code.into(), notify1)
        .unwrap();

    let mut tiny_code = Vec::new();
    cmdlist::push_wait(&mut tiny_code, 10);
    let (events2, notify2) = recorder();
    let id2 = iface
        .run_code(true, 1, 100, 0, tiny_code.into(), notify2)
        .unwrap();

    std::thread::sleep(Duration::from_millis(10));
    // The running sequence is not interruptible; the queued one is.
    assert!(!iface.cancel_seq(id1));
    assert!(iface.cancel_seq(id2));

    drive(&mut iface, Duration::from_secs(5), || {
        events1.borrow().iter().any(|ev| *ev == SeqEvent::End(id1))
            && !events2.borrow().is_empty()
    });
    assert_eq!(
        *events1.borrow(),
        vec![
            SeqEvent::Start(id1),
            SeqEvent::Flushed(id1),
            SeqEvent::End(id1)
        ]
    );
    assert_eq!(*events2.borrow(), vec![SeqEvent::Cancel(id2)]);
}

#[test]
fn state_id_monotonic_and_change_driven() {
    let (_p, mut iface) = start(false, TimingConfig::default());

    let a = iface.get_state_id();
    let b = iface.get_state_id();
    assert_eq!(a, b);

    iface.set_ttl(0, true);
    let c = iface.get_state_id();
    assert!(c & !(1 << 63) > b & !(1 << 63));
    assert_eq!(c, iface.get_state_id());

    iface.set_clock(17);
    assert!(iface.get_state_id() > c);
}

#[test]
fn set_then_get_same_key_is_ordered() {
    let (_p, mut iface) = start(false, TimingConfig::default());
    iface.set_dds(DdsType::Amp, 2, 0x123);
    let got = Rc::new(Cell::new(None));
    let got2 = Rc::clone(&got);
    iface.get_dds(DdsType::Amp, 2, Box::new(move |val| got2.set(Some(val))));
    // Served from the cache synchronously, no hardware round trip.
    assert_eq!(got.get(), Some(0x123));
}

#[test]
fn cached_read_answers_second_caller_synchronously() {
    let (_p, mut iface) = start(false, TimingConfig::default());

    let first = Rc::new(Cell::new(None));
    let first2 = Rc::clone(&first);
    iface.get_dds(DdsType::Phase, 4, Box::new(move |val| first2.set(Some(val))));
    assert_eq!(first.get(), None);
    drive(&mut iface, Duration::from_secs(5), || first.get().is_some());

    let second = Rc::new(Cell::new(None));
    let second2 = Rc::clone(&second);
    iface.get_dds(DdsType::Phase, 4, Box::new(move |val| second2.set(Some(val))));
    assert_eq!(second.get(), first.get());
}

#[test]
fn read_results_deliver_in_dispatch_order() {
    let (p, mut iface) = start(true, TimingConfig::default());
    for (chn, val) in [(0u8, 111u32), (1, 222), (2, 333)] {
        iface.set_dds(DdsType::Freq, chn, val);
    }
    wait_for(Duration::from_secs(5), || p.dds_word(2, 0x2c) == 333);

    // Let the cached values go stale so the reads hit the hardware.
    std::thread::sleep(Duration::from_millis(120));
    let order = Rc::new(RefCell::new(Vec::new()));
    for chn in [0u8, 1, 2] {
        let order = Rc::clone(&order);
        iface.get_dds(
            DdsType::Freq,
            chn,
            Box::new(move |val| order.borrow_mut().push(val)),
        );
    }
    drive(&mut iface, Duration::from_secs(5), || {
        order.borrow().len() == 3
    });
    assert_eq!(*order.borrow(), vec![111, 222, 333]);
}

#[test]
fn ttl_overrides_and_effective_word() {
    let (p, mut iface) = start(false, TimingConfig::default());
    assert!(!iface.has_ttl_ovr());

    iface.set_ttl_ovr(0x3, TtlOvr::High);
    iface.set_ttl_ovr(0x30, TtlOvr::Low);
    assert!(iface.has_ttl_ovr());
    assert_eq!(iface.ttl_ovr_masks(), (0x30, 0x3));

    iface.set_ttl_word(0x44);
    wait_for(Duration::from_secs(5), || p.cur_ttl() == 0x44);
    // Effective output: forced-high bits or in, forced-low bits cut out.
    assert_eq!(iface.ttl_word(), (0x44 | 0x3) & !0x30);
    let got = Rc::new(Cell::new(None));
    let got2 = Rc::clone(&got);
    iface.get_ttl(Box::new(move |val| got2.set(Some(val))));
    assert_eq!(got.get(), Some((0x44 | 0x3) & !0x30));
    let got = Rc::new(Cell::new(None));
    let got2 = Rc::clone(&got);
    iface.get_ttl_ovrlo(Box::new(move |val| got2.set(Some(val))));
    assert_eq!(got.get(), Some(0x30));

    iface.set_ttl_ovr(0x33, TtlOvr::Normal);
    assert!(!iface.has_ttl_ovr());
}

#[test]
fn reset_dds_clears_overrides() {
    let (_p, mut iface) = start(true, TimingConfig::default());
    iface.set_dds_ovr(DdsType::Phase, 1, 0x100);
    assert!(iface.has_dds_ovr());
    iface.reset_dds(1);
    assert!(!iface.has_dds_ovr());

    let got = Rc::new(Cell::new(None));
    let got2 = Rc::clone(&got);
    iface.get_dds_ovr(DdsType::Phase, 1, Box::new(move |val| got2.set(Some(val))));
    assert_eq!(got.get(), Some(OVR_OFF));
}

#[test]
fn active_dds_tracks_missing_boards() {
    let p = Arc::new(DummyPulser::new());
    p.set_dds_present(5, false);
    let iface = Controller::start(Arc::clone(&p), TimingConfig::default()).unwrap();
    wait_for(Duration::from_secs(5), || {
        iface.get_active_dds().len() == pulsebox::api::NDDS - 1
    });
    assert!(!iface.get_active_dds().contains(&5));
    assert!(iface.get_active_dds().contains(&4));
}

#[test]
fn long_sequence_serves_reads_while_running() {
    let timing = TimingConfig {
        min_lead: Duration::from_millis(50),
        idle_sleep: Duration::from_micros(200),
    };
    let (p, mut iface) = start(false, timing);

    // 1.5s nominal length: long enough that the runner yields its surplus
    // to untimed requests.
    let mut code = Vec::new();
    cmdlist::push_ttl(&mut code, 1, 3);
    cmdlist::push_wait(&mut code, 150_000_000);
    let (events, notify) = recorder();
    let id = iface
        .run_code(true, 1, 1_500_000_030, u32::MAX, code.into(), notify)
        .unwrap();

    // 20 distinct reads: more than the 16-deep result ring, so the
    // backpressure path runs too.
    let completed = Rc::new(Cell::new(0u32));
    for chn in 0..20 {
        let completed = Rc::clone(&completed);
        iface.get_dds(
            DdsType::Freq,
            chn,
            Box::new(move |_| completed.set(completed.get() + 1)),
        );
    }

    let mut done_at_end = 0;
    drive(&mut iface, Duration::from_secs(30), || {
        if events.borrow().iter().any(|ev| *ev == SeqEvent::End(id)) {
            done_at_end = completed.get();
            true
        } else {
            false
        }
    });
    // All reads were multiplexed into the sequence's idle cycles.
    assert_eq!(done_at_end, 20);
    assert!(p.timing_ok());
    assert_eq!(p.underflow_cycle(), 0);
}
