//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! The protocol ring set (C4): up to 64 shared-memory rings, each tracked by
//! a locally-known head seqno, plus the single-waiter wait/notify mechanism
//! `wait_for_seqno` is built on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};

/// The protocol guarantees rings never outnumber this; it is part of the
/// wire contract, not an implementation choice (§3, §9).
pub const MAX_RINGS: usize = 64;

/// Returns `true` iff 64-bit seqno `a` is "at or past" `b`, using the
/// wraparound-safe delta rule `(uint32)(a - b) < 2^31`. The protocol
/// guarantees the live delta between any two seqnos being compared never
/// approaches `2^31`, so truncating to 32 bits before comparing is safe.
#[inline]
pub fn seqno_at_or_past(a: u64, b: u64) -> bool {
    let delta = (a as u32).wrapping_sub(b as u32);
    delta < 0x8000_0000
}

#[derive(Debug)]
pub struct Ring {
    ring_id: u64,
    head_seqno: AtomicU64,
    monitoring_enabled: AtomicBool,
    max_report_period_us: AtomicU64,
}

impl Ring {
    pub fn new(ring_id: u64, max_report_period_us: u64) -> Self {
        Self {
            ring_id,
            head_seqno: AtomicU64::new(0),
            monitoring_enabled: AtomicBool::new(false),
            max_report_period_us: AtomicU64::new(max_report_period_us),
        }
    }

    pub fn ring_id(&self) -> u64 {
        self.ring_id
    }

    pub fn head_seqno(&self) -> u64 {
        self.head_seqno.load(Ordering::Acquire)
    }

    pub fn set_monitoring_enabled(&self, enabled: bool) {
        self.monitoring_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring_enabled.load(Ordering::Relaxed)
    }

    pub fn max_report_period_us(&self) -> u64 {
        self.max_report_period_us.load(Ordering::Relaxed)
    }
}

/// The single outstanding `wait_for_seqno` call, if any.
struct WaitState {
    ring_id: u64,
    target_seqno: u64,
}

struct RingSetInner {
    rings: Vec<Ring>,
    wait: Option<WaitState>,
    /// Set at context teardown; wakes and aborts any outstanding wait.
    shutting_down: bool,
}

/// Guards the ring list and the single-waiter wait state. Per the
/// concurrency design, this mutex is held only around list mutation and
/// waiter bookkeeping, never across a host driver call.
pub struct RingSet {
    inner: Mutex<RingSetInner>,
    wait_cv: Condvar,
    max_rings: usize,
}

impl RingSet {
    pub fn new(max_rings: usize) -> Self {
        Self {
            inner: Mutex::new(RingSetInner {
                rings: Vec::new(),
                wait: None,
                shutting_down: false,
            }),
            wait_cv: Condvar::new(),
            max_rings: max_rings.min(MAX_RINGS),
        }
    }

    /// Attaches a ring to the context's ring set. Fails (a guest protocol
    /// violation: too many rings) if the set is already at capacity, or if
    /// `ring_id` is already attached.
    pub fn attach(&self, ring: Ring) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.rings.len() >= self.max_rings {
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "too many rings",
            ));
        }
        if inner.rings.iter().any(|r| r.ring_id() == ring.ring_id()) {
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "duplicate ring id",
            ));
        }
        inner.rings.push(ring);
        Ok(())
    }

    pub fn detach(&self, ring_id: u64) {
        let mut inner = self.inner.lock();
        inner.rings.retain(|r| r.ring_id() != ring_id);
    }

    /// Enables or disables liveness monitoring for an attached ring. A
    /// no-op if `ring_id` is not attached.
    pub fn set_monitoring_enabled(&self, ring_id: u64, enabled: bool) {
        let inner = self.inner.lock();
        if let Some(ring) = inner.rings.iter().find(|r| r.ring_id() == ring_id) {
            ring.set_monitoring_enabled(enabled);
        }
    }

    /// Records a guest head-seqno advance and wakes up a matching waiter,
    /// if any. Called by the transport when it observes the guest
    /// advancing a ring's head.
    pub fn on_head_update(&self, ring_id: u64, new_head_seqno: u64) {
        let mut inner = self.inner.lock();
        if let Some(ring) = inner.rings.iter().find(|r| r.ring_id() == ring_id) {
            ring.head_seqno.store(new_head_seqno, Ordering::Release);
        }
        let wake = match &inner.wait {
            Some(w) if w.ring_id == ring_id && seqno_at_or_past(new_head_seqno, w.target_seqno) => true,
            _ => false,
        };
        if wake {
            self.wait_cv.notify_all();
        }
    }

    /// Blocks the calling thread until `ring`'s head seqno reaches or
    /// passes `target_seqno`, or until the context is torn down.
    ///
    /// Only one wait may be outstanding per context at a time; calling this
    /// while another wait is active is a contract violation (an internal
    /// error, not a guest protocol violation — the dispatch thread is the
    /// only caller and is expected to serialize its own waits).
    ///
    /// Returns `Ok(true)` if the target was reached, `Ok(false)` if the
    /// context was torn down while waiting.
    pub fn wait_for_seqno(&self, ring_id: u64, target_seqno: u64) -> Result<bool> {
        let mut inner = self.inner.lock();

        if !inner.rings.iter().any(|r| r.ring_id() == ring_id) {
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "wait on unknown ring",
            ));
        }

        if inner.wait.is_some() {
            return Err(Error::with_detail(
                ErrorKind::Internal,
                "wait_for_seqno called while another wait is active",
            ));
        }

        inner.wait = Some(WaitState {
            ring_id,
            target_seqno,
        });

        loop {
            if inner.shutting_down {
                inner.wait = None;
                return Ok(false);
            }

            let ring = inner.rings.iter().find(|r| r.ring_id() == ring_id);
            let reached = match ring {
                Some(ring) => seqno_at_or_past(ring.head_seqno(), target_seqno),
                // The ring was detached mid-wait; nothing more to wait for.
                None => true,
            };

            if reached {
                inner.wait = None;
                return Ok(true);
            }

            // Spurious wakeups are tolerated: we loop back and recheck.
            self.wait_cv.wait(&mut inner);
        }
    }

    /// Aborts any outstanding `wait_for_seqno` call and prevents new ones
    /// from blocking. Called once at context teardown.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutting_down = true;
        self.wait_cv.notify_all();
    }

    pub fn for_each_attached<F: FnMut(&Ring)>(&self, mut f: F) {
        let inner = self.inner.lock();
        for ring in inner.rings.iter() {
            f(ring);
        }
    }

    /// The minimum configured report period across attached rings, used by
    /// the ring monitor to pick its wake-up period. `None` if there are no
    /// rings.
    pub fn min_report_period(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .rings
            .iter()
            .map(|r| r.max_report_period_us())
            .min()
            .map(Duration::from_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_boundary_values() {
        assert!(seqno_at_or_past(0, 0));
        assert!(seqno_at_or_past(1, 0));
        assert!(seqno_at_or_past(0x7fff_ffff, 0));
        assert!(!seqno_at_or_past(0x8000_0000, 0));
        assert!(seqno_at_or_past(0xffff_ffff, 0));
        assert!(seqno_at_or_past(0, 0xffff_ffff));
    }

    #[test]
    fn attach_detach() {
        let set = RingSet::new(64);
        set.attach(Ring::new(1, 16_000)).unwrap();
        assert!(set.attach(Ring::new(1, 16_000)).is_err());
        set.detach(1);
        set.attach(Ring::new(1, 16_000)).unwrap();
    }

    #[test]
    fn too_many_rings_is_protocol_violation() {
        let set = RingSet::new(2);
        set.attach(Ring::new(1, 1)).unwrap();
        set.attach(Ring::new(2, 1)).unwrap();
        let err = set.attach(Ring::new(3, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GuestProtocolViolation);
    }

    #[test]
    fn wait_wakes_on_matching_head_update() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(RingSet::new(64));
        set.attach(Ring::new(7, 1)).unwrap();

        let waiter = {
            let set = Arc::clone(&set);
            thread::spawn(move || set.wait_for_seqno(7, 1000).unwrap())
        };

        // Give the waiter a chance to register before updating.
        thread::sleep(Duration::from_millis(20));
        set.on_head_update(7, 1001);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn concurrent_wait_is_rejected() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(RingSet::new(64));
        set.attach(Ring::new(9, 1)).unwrap();

        let blocker = {
            let set = Arc::clone(&set);
            thread::spawn(move || set.wait_for_seqno(9, u64::MAX / 2))
        };
        thread::sleep(Duration::from_millis(20));

        let err = set.wait_for_seqno(9, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        set.shutdown();
        blocker.join().unwrap().unwrap();
    }

    #[test]
    fn shutdown_aborts_wait() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(RingSet::new(64));
        set.attach(Ring::new(3, 1)).unwrap();

        let waiter = {
            let set = Arc::clone(&set);
            thread::spawn(move || set.wait_for_seqno(3, u64::MAX / 2))
        };
        thread::sleep(Duration::from_millis(20));
        set.shutdown();

        assert_eq!(waiter.join().unwrap().unwrap(), false);
    }
}
