//! Read-request cache and coalescing.
//!
//! A web frontend tends to poll the same channel repeatedly; caching the
//! last known value of every `(op, operand, is_override)` read collapses a
//! burst into one hardware read and batches the replies. Lives on the
//! frontend thread only.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::api::{ReqOp, NDDS, OVR_OFF};

/// How long a cached value satisfies a read without a new hardware query.
const FRESHNESS: Duration = Duration::from_millis(100);

pub type ReadCb = Box<dyn FnOnce(u32)>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey {
    pub op: ReqOp,
    pub operand: u32,
    pub is_override: bool,
}

impl CacheKey {
    pub fn new(op: ReqOp, operand: u32, is_override: bool) -> CacheKey {
        debug_assert!(op != ReqOp::Ttl);
        CacheKey {
            op,
            operand,
            is_override,
        }
    }
}

#[derive(Default)]
struct Entry {
    t: Option<Instant>,
    val: u32,
    cbs: Vec<ReadCb>,
}

#[derive(Default)]
pub struct CmdCache {
    entries: HashMap<CacheKey, Entry>,
}

impl CmdCache {
    pub fn new() -> CmdCache {
        CmdCache::default()
    }

    /// Record a known value, reply to everyone waiting for it, and keep an
    /// active override entry in sync with a plain DDS set (the override is
    /// what the hardware actually carries).
    pub fn set(&mut self, key: CacheKey, val: u32) {
        let now = Instant::now();
        let entry = self.entries.entry(key).or_default();
        entry.t = Some(now);
        entry.val = val;
        for cb in entry.cbs.drain(..) {
            cb(val);
        }
        if !key.is_override && is_dds_op(key.op) {
            let ovr = self
                .entries
                .entry(CacheKey { is_override: true, ..key })
                .or_default();
            if ovr.t.is_some() && ovr.val != OVR_OFF {
                ovr.t = Some(now);
                ovr.val = val;
                for cb in ovr.cbs.drain(..) {
                    cb(val);
                }
            }
        }
    }

    /// Serve a read from the cache if possible; otherwise queue the
    /// callback. Returns `true` when the caller does not need to send a
    /// hardware read (fresh hit, override entry, or someone else is
    /// already waiting for the same key).
    pub fn get(&mut self, key: CacheKey, cb: ReadCb) -> bool {
        let entry = self.entries.entry(key).or_default();
        if key.is_override {
            // Override state never comes from the hardware: it is whatever
            // was last set, or "off" if it never was.
            cb(if entry.t.is_some() { entry.val } else { OVR_OFF });
            return true;
        }
        if let Some(t) = entry.t {
            if t.elapsed() <= FRESHNESS {
                cb(entry.val);
                return true;
            }
        }
        let was_empty = entry.cbs.is_empty();
        entry.cbs.push(cb);
        !was_empty
    }

    /// Whether any DDS override is currently set.
    pub fn has_dds_ovr(&self) -> bool {
        for op in [ReqOp::DdsFreq, ReqOp::DdsAmp, ReqOp::DdsPhase] {
            for chn in 0..NDDS as u32 {
                if let Some(entry) = self.entries.get(&CacheKey::new(op, chn, true)) {
                    if entry.t.is_some() && entry.val != OVR_OFF {
                        return true;
                    }
                }
            }
        }
        false
    }
}

fn is_dds_op(op: ReqOp) -> bool {
    matches!(op, ReqOp::DdsFreq | ReqOp::DdsAmp | ReqOp::DdsPhase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn recorder() -> (Rc<Cell<Option<u32>>>, ReadCb) {
        let got = Rc::new(Cell::new(None));
        let got2 = Rc::clone(&got);
        (got, Box::new(move |v| got2.set(Some(v))))
    }

    #[test]
    fn fresh_hit_and_coalescing() {
        let mut cache = CmdCache::new();
        let key = CacheKey::new(ReqOp::DdsFreq, 3, false);

        // Cold miss: first caller sends the read, second coalesces.
        let (got1, cb1) = recorder();
        assert!(!cache.get(key, cb1));
        let (got2, cb2) = recorder();
        assert!(cache.get(key, cb2));
        assert_eq!(got1.get(), None);

        // The reply fans out to both.
        cache.set(key, 42);
        assert_eq!(got1.get(), Some(42));
        assert_eq!(got2.get(), Some(42));

        // Within the freshness window the value is served directly.
        let (got3, cb3) = recorder();
        assert!(cache.get(key, cb3));
        assert_eq!(got3.get(), Some(42));
    }

    #[test]
    fn override_reads_never_query() {
        let mut cache = CmdCache::new();
        let key = CacheKey::new(ReqOp::DdsAmp, 0, true);
        let (got, cb) = recorder();
        assert!(cache.get(key, cb));
        assert_eq!(got.get(), Some(OVR_OFF));

        cache.set(key, 0x123);
        let (got, cb) = recorder();
        assert!(cache.get(key, cb));
        assert_eq!(got.get(), Some(0x123));
    }

    #[test]
    fn plain_set_updates_active_override() {
        let mut cache = CmdCache::new();
        let plain = CacheKey::new(ReqOp::DdsFreq, 5, false);
        let ovr = CacheKey::new(ReqOp::DdsFreq, 5, true);

        // Override off: a plain set leaves it off.
        cache.set(ovr, OVR_OFF);
        cache.set(plain, 100);
        assert!(!cache.has_dds_ovr());
        let (got, cb) = recorder();
        cache.get(ovr, cb);
        assert_eq!(got.get(), Some(OVR_OFF));

        // Override on: the plain set tracks into it.
        cache.set(ovr, 100);
        assert!(cache.has_dds_ovr());
        cache.set(plain, 200);
        let (got, cb) = recorder();
        cache.get(ovr, cb);
        assert_eq!(got.get(), Some(200));
    }
}
