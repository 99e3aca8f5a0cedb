//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Fence / timeline layer (C8): 64 per-ring timelines of 32-bit seqnos,
//! in-order retirement, and the busy mask the context exposes.

use arrayvec::ArrayVec;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::driver::HostDriver;
use crate::error::{Error, ErrorKind, Result};
use crate::ring::seqno_at_or_past;

pub const NUM_TIMELINES: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct Fence {
    pub ring_idx: u8,
    pub seqno: u32,
    pub fence_id: u64,
    pub flags: u32,
}

struct Timeline {
    cur_seqno: u32,
    next_seqno: u32,
    in_flight: VecDeque<Fence>,
}

impl Timeline {
    fn new() -> Self {
        Self {
            cur_seqno: 0,
            next_seqno: 0,
            in_flight: VecDeque::new(),
        }
    }
}

struct Inner {
    /// Fixed at 64 entries — the busy mask is a `u64` and `ring_idx` is a
    /// protocol-bounded index, so an `ArrayVec` avoids a heap indirection
    /// a `Vec` would pay for a size that never changes (§9).
    timelines: ArrayVec<Timeline, NUM_TIMELINES>,
    busy_mask: u64,
    /// Reusable `Fence` slots; fences carry no drop-relevant state so the
    /// free list only needs to bound reallocation, not reclaim resources.
    free_list: Vec<Fence>,
}

impl Inner {
    /// Reuses a slot from the free list when one is available; `Fence` has
    /// no heap-owned state so reuse only bounds the free list's own growth,
    /// not any per-fence allocation.
    fn alloc_fence(&mut self, ring_idx: u8, seqno: u32, fence_id: u64, flags: u32) -> Fence {
        self.free_list.pop();
        Fence {
            ring_idx,
            seqno,
            fence_id,
            flags,
        }
    }
}

/// Called once per retired fence, with `(ring_idx, fence_id)`.
pub type RetireCallback = Box<dyn Fn(u8, u64) + Send + Sync>;

/// The per-context fence/timeline state (C8). Guarded by a single mutex;
/// the retire callback runs with the mutex released so it may safely call
/// back into the context.
pub struct FenceTable {
    inner: Mutex<Inner>,
    retire_cb: RetireCallback,
}

impl FenceTable {
    pub fn new(retire_cb: RetireCallback) -> Self {
        let timelines = (0..NUM_TIMELINES).map(|_| Timeline::new()).collect::<ArrayVec<_, NUM_TIMELINES>>();
        Self {
            inner: Mutex::new(Inner {
                timelines,
                busy_mask: 0,
                free_list: Vec::new(),
            }),
            retire_cb,
        }
    }

    /// Allocates a seqno on `ring_idx`'s timeline, forwards the submission
    /// to the driver, and records the fence as in-flight. On driver
    /// failure, rolls back the timeline insertion and busy-mask bit so no
    /// partial state escapes (§7 class 1).
    pub fn submit_fence(
        &self,
        driver: &dyn HostDriver,
        flags: u32,
        ring_idx: u8,
        fence_id: u64,
    ) -> Result<()> {
        if ring_idx as usize >= NUM_TIMELINES {
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                format!("submit_fence with out-of-range ring_idx {}", ring_idx),
            ));
        }

        let seqno = {
            let mut inner = self.inner.lock();
            let timeline = &mut inner.timelines[ring_idx as usize];
            let seqno = timeline.next_seqno;
            timeline.next_seqno = timeline.next_seqno.wrapping_add(1);
            let fence = inner.alloc_fence(ring_idx, seqno, fence_id, flags);
            inner.timelines[ring_idx as usize].in_flight.push_back(fence);
            inner.busy_mask |= 1u64 << ring_idx;
            seqno
        };

        if let Err(err) = driver.submit_fence(ring_idx, seqno) {
            let mut inner = self.inner.lock();
            let timeline = &mut inner.timelines[ring_idx as usize];
            if let Some(pos) = timeline.in_flight.iter().position(|f| f.seqno == seqno) {
                let fence = timeline.in_flight.remove(pos).unwrap();
                inner.free_list.push(fence);
            }
            if timeline.in_flight.is_empty() {
                inner.busy_mask &= !(1u64 << ring_idx);
            }
            return Err(err);
        }

        Ok(())
    }

    /// Advances `ring_idx`'s timeline to `observed_fence_id`'s low 32 bits
    /// and retires every fence the wraparound rule now covers, in order,
    /// invoking the retire callback (with the mutex released) for each.
    /// Stops at the first unsignaled fence, preserving in-order retirement.
    pub fn on_retire(&self, ring_idx: u8, observed_fence_id: u64) {
        if ring_idx as usize >= NUM_TIMELINES {
            log::warn!("on_retire with out-of-range ring_idx {}", ring_idx);
            return;
        }

        let observed = observed_fence_id as u32;
        let retired = {
            let mut inner = self.inner.lock();
            let timeline = &mut inner.timelines[ring_idx as usize];
            timeline.cur_seqno = observed;

            let mut retired = Vec::new();
            while let Some(front) = timeline.in_flight.front() {
                if seqno_at_or_past(observed as u64, front.seqno as u64) {
                    retired.push(timeline.in_flight.pop_front().unwrap());
                } else {
                    break;
                }
            }
            if timeline.in_flight.is_empty() {
                inner.busy_mask &= !(1u64 << ring_idx);
            }
            inner.free_list.extend(retired.iter().copied());
            retired
        };

        for fence in retired {
            (self.retire_cb)(ring_idx, fence.fence_id);
        }
    }

    /// Periodically driven by the host: walks every busy timeline and
    /// retires fences up to each ring's shared-memory seqno, as reported
    /// by `ring_seqno`.
    pub fn retire_all(&self, ring_seqno: impl Fn(u8) -> Option<u64>) {
        let busy = self.inner.lock().busy_mask;
        for ring_idx in 0..NUM_TIMELINES as u8 {
            if busy & (1u64 << ring_idx) == 0 {
                continue;
            }
            if let Some(seqno) = ring_seqno(ring_idx) {
                self.on_retire(ring_idx, seqno);
            }
        }
    }

    pub fn busy_mask(&self) -> u64 {
        self.inner.lock().busy_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::FakeDriver;
    use parking_lot::Mutex as StdMutex;
    use std::sync::Arc;

    fn table_with_recorder() -> (FenceTable, Arc<StdMutex<Vec<(u8, u64)>>>) {
        let retired = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&retired);
        let table = FenceTable::new(Box::new(move |ring_idx, fence_id| {
            recorder.lock().push((ring_idx, fence_id));
        }));
        (table, retired)
    }

    #[test]
    fn retires_in_submission_order_via_single_callback() {
        let driver = FakeDriver::new();
        let (table, retired) = table_with_recorder();

        table.submit_fence(&driver, 0, 0, 10).unwrap();
        table.submit_fence(&driver, 0, 0, 11).unwrap();
        table.submit_fence(&driver, 0, 0, 12).unwrap();

        // The driver signals up through seqno 2 (the third submission) in
        // one callback; all three fences must retire, in order.
        table.on_retire(0, 2);

        assert_eq!(*retired.lock(), vec![(0, 10), (0, 11), (0, 12)]);
        assert_eq!(table.busy_mask(), 0);
    }

    #[test]
    fn busy_mask_tracks_in_flight_fences() {
        let driver = FakeDriver::new();
        let (table, _retired) = table_with_recorder();

        assert_eq!(table.busy_mask(), 0);
        table.submit_fence(&driver, 0, 3, 1).unwrap();
        assert_eq!(table.busy_mask(), 1 << 3);

        table.on_retire(3, 0);
        assert_eq!(table.busy_mask(), 0);
    }

    #[test]
    fn stops_at_first_unsignaled_fence() {
        let driver = FakeDriver::new();
        let (table, retired) = table_with_recorder();

        table.submit_fence(&driver, 0, 1, 100).unwrap();
        table.submit_fence(&driver, 0, 1, 101).unwrap();

        // Only the first submission (seqno 0) is signaled.
        table.on_retire(1, 0);

        assert_eq!(*retired.lock(), vec![(1, 100)]);
        assert_ne!(table.busy_mask(), 0);
    }

    #[test]
    fn seqno_wraparound_continues_to_retire() {
        let driver = FakeDriver::new();
        let (table, retired) = table_with_recorder();

        {
            let mut inner = table.inner.lock();
            inner.timelines[0].next_seqno = u32::MAX;
        }
        table.submit_fence(&driver, 0, 0, 1).unwrap(); // seqno = u32::MAX
        table.submit_fence(&driver, 0, 0, 2).unwrap(); // seqno wraps to 0

        table.on_retire(0, 0);

        assert_eq!(*retired.lock(), vec![(0, 1), (0, 2)]);
    }

    #[test]
    fn submit_fence_rejects_out_of_range_ring_idx() {
        let driver = FakeDriver::new();
        let (table, _retired) = table_with_recorder();

        let err = table.submit_fence(&driver, 0, NUM_TIMELINES as u8, 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::GuestProtocolViolation);
    }

    #[test]
    fn on_retire_ignores_out_of_range_ring_idx_instead_of_panicking() {
        let (table, retired) = table_with_recorder();
        table.on_retire(NUM_TIMELINES as u8, 0);
        assert!(retired.lock().is_empty());
    }
}
