//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Object registry (C2): maps an opaque 64-bit object id the guest chose to
//! a typed driver object handle, validates ids, and reaps objects in
//! reverse-dependency order via per-parent child-list tracking (§9).

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::HostDriver;
use crate::error::{Error, ErrorKind, Result};

/// Teardown plans are usually shallow (a handful of children per parent);
/// this avoids a heap allocation for the common case.
type RemovalPlan = SmallVec<[(ObjectType, u64); 8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Device,
    DeviceMemory,
    Buffer,
    Image,
    Sampler,
    Sync,
    Other(u32),
}

struct Entry {
    obj_type: ObjectType,
    handle: u64,
    parent: Option<u64>,
    children: Vec<u64>,
}

type Destructor = Arc<dyn Fn(&dyn HostDriver, u64) + Send + Sync>;

struct Inner {
    entries: HashMap<u64, Entry>,
    destructors: HashMap<ObjectType, Destructor>,
}

/// Guards the object registry. Per the concurrency design, lookup/insert/
/// remove hold this mutex; destructors that might reenter the registry run
/// with it dropped, which is why bulk removal computes its plan under the
/// lock and executes destructors after releasing it.
pub struct ObjectRegistry {
    inner: Mutex<Inner>,
}

impl ObjectRegistry {
    /// Creates a registry with the default destructor table: every known
    /// `ObjectType` forwards to `driver.destroy_object`. Registered once,
    /// at context creation, per §4.2.
    pub fn new() -> Self {
        let mut destructors: HashMap<ObjectType, Destructor> = HashMap::new();
        for ty in [
            ObjectType::Device,
            ObjectType::DeviceMemory,
            ObjectType::Buffer,
            ObjectType::Image,
            ObjectType::Sampler,
            ObjectType::Sync,
        ] {
            destructors.insert(ty, Arc::new(move |driver: &dyn HostDriver, handle: u64| {
                driver.destroy_object(ty, handle);
            }));
        }
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                destructors,
            }),
        }
    }

    /// Registers (or replaces) the destructor for an `ObjectType::Other`
    /// variant, or overrides the default for a well-known type. Intended
    /// to be called only during context construction.
    pub fn register_destructor(
        &self,
        obj_type: ObjectType,
        destructor: impl Fn(&dyn HostDriver, u64) + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .destructors
            .insert(obj_type, Arc::new(destructor));
    }

    /// Returns `true` iff `id` is nonzero and not already in use. A `false`
    /// result (or `id == 0`) is a guest protocol violation: the guest is
    /// the sole source of object ids and a collision means it has violated
    /// the protocol.
    pub fn validate(&self, id: u64) -> bool {
        if id == 0 {
            return false;
        }
        !self.inner.lock().entries.contains_key(&id)
    }

    /// Inserts a newly-constructed object. Must be called only after a
    /// successful [`validate`](Self::validate) of `id`; a duplicate here
    /// indicates an internal bug (a TOCTOU between validate and insert),
    /// not guest misbehavior, and is reported as such.
    pub fn insert(
        &self,
        id: u64,
        obj_type: ObjectType,
        handle: u64,
        parent: Option<u64>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if id == 0 || inner.entries.contains_key(&id) {
            return Err(Error::with_detail(
                ErrorKind::Internal,
                "duplicate insert into object registry",
            ));
        }
        if let Some(parent_id) = parent {
            let parent_entry = inner.entries.get_mut(&parent_id).ok_or_else(|| {
                Error::with_detail(ErrorKind::Internal, "insert with unknown parent id")
            })?;
            parent_entry.children.push(id);
        }
        inner.entries.insert(
            id,
            Entry {
                obj_type,
                handle,
                parent,
                children: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn lookup(&self, id: u64) -> Option<(ObjectType, u64)> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|e| (e.obj_type, e.handle))
    }

    /// Removes `id` and, first, every object still tracked in its child
    /// list (recursively), so destruction happens in reverse-dependency
    /// order. A no-op (but reported as an internal error, per §7 class 3)
    /// if `id` is unknown — by the time a remove reaches here, the caller
    /// is expected to have already validated the id exists.
    pub fn remove(&self, driver: &dyn HostDriver, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&id) {
            return Err(Error::with_detail(
                ErrorKind::Internal,
                "remove of unknown object id",
            ));
        }
        let plan = collect_removal_plan(&mut inner, id);
        drop(inner);
        run_destructors(driver, &self.inner, &plan);
        Ok(())
    }

    /// Removes every id in `children` (and everything transitively beneath
    /// them), in one atomic bookkeeping pass, without removing the parent
    /// itself. Used by parent objects that reset or free their children in
    /// bulk (e.g. an argument pool freeing its tables).
    pub fn remove_all(&self, driver: &dyn HostDriver, children: &[u64]) {
        let mut inner = self.inner.lock();
        let mut plan = RemovalPlan::new();
        for &id in children {
            if inner.entries.contains_key(&id) {
                plan.extend(collect_removal_plan(&mut inner, id));
            }
        }
        drop(inner);
        run_destructors(driver, &self.inner, &plan);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All currently-registered ids with no parent, for context teardown
    /// (walk these, `remove` cascades to children).
    pub fn roots(&self) -> Vec<u64> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.parent.is_none())
            .map(|(&id, _)| id)
            .collect()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes `id` and its whole subtree from `inner.entries`, returning the
/// `(type, handle)` pairs to destroy, deepest-first (children before
/// parents). Does not run any destructor — that happens after the lock is
/// released.
fn collect_removal_plan(inner: &mut Inner, id: u64) -> RemovalPlan {
    let entry = match inner.entries.remove(&id) {
        Some(e) => e,
        None => return RemovalPlan::new(),
    };
    if let Some(parent_id) = entry.parent {
        if let Some(parent_entry) = inner.entries.get_mut(&parent_id) {
            parent_entry.children.retain(|&c| c != id);
        }
    }

    let mut plan = RemovalPlan::new();
    for child_id in entry.children.clone() {
        plan.extend(collect_removal_plan(inner, child_id));
    }
    plan.push((entry.obj_type, entry.handle));
    plan
}

fn run_destructors(driver: &dyn HostDriver, inner: &Mutex<Inner>, plan: &[(ObjectType, u64)]) {
    for &(obj_type, handle) in plan {
        let destructor = inner.lock().destructors.get(&obj_type).cloned();
        match destructor {
            Some(d) => d(driver, handle),
            None => driver.destroy_object(obj_type, handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::FakeDriver;

    #[test]
    fn validate_rejects_zero_and_duplicate() {
        let reg = ObjectRegistry::new();
        assert!(!reg.validate(0));
        assert!(reg.validate(1));
        reg.insert(1, ObjectType::Buffer, 100, None).unwrap();
        assert!(!reg.validate(1));
    }

    #[test]
    fn children_destroyed_before_parent() {
        let driver = FakeDriver::new();
        let reg = ObjectRegistry::new();

        reg.insert(1, ObjectType::Device, 10, None).unwrap();
        reg.insert(2, ObjectType::Buffer, 20, Some(1)).unwrap();
        reg.insert(3, ObjectType::Image, 30, Some(1)).unwrap();

        reg.remove(&driver, 1).unwrap();

        let calls = driver.destroy_calls.lock();
        // Children must precede the parent in the destruction order.
        let parent_pos = calls.iter().position(|&(_, h)| h == 10).unwrap();
        let buf_pos = calls.iter().position(|&(_, h)| h == 20).unwrap();
        let img_pos = calls.iter().position(|&(_, h)| h == 30).unwrap();
        assert!(buf_pos < parent_pos);
        assert!(img_pos < parent_pos);
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_unknown_id_is_internal_error() {
        let driver = FakeDriver::new();
        let reg = ObjectRegistry::new();
        let err = reg.remove(&driver, 42).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn remove_all_cascades_without_removing_parent() {
        let driver = FakeDriver::new();
        let reg = ObjectRegistry::new();
        reg.insert(1, ObjectType::Device, 10, None).unwrap();
        reg.insert(2, ObjectType::Buffer, 20, Some(1)).unwrap();
        reg.insert(3, ObjectType::Buffer, 30, Some(1)).unwrap();

        reg.remove_all(&driver, &[2, 3]);

        assert_eq!(reg.len(), 1);
        assert!(reg.lookup(1).is_some());
        assert!(reg.lookup(2).is_none());
    }
}
