//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Context lifecycle (C9): creates and tears down every registry above,
//! holds the sticky fatal flag, and exposes the process-wide context table
//! the async retire path resolves contexts through (§9: "model as an owned
//! registry mapping ctx_id → context guarded by one lock").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::dispatch::DispatchEngine;
use crate::driver::HostDriver;
use crate::error::{Error, ErrorKind};
use crate::fence::FenceTable;
use crate::memory::{self, BlobDescriptor, DeviceMemoryData, MemoryAllocateInfo, MemoryTable};
use crate::object::{ObjectRegistry, ObjectType};
use crate::resource::ResourceRegistry;
use crate::ring::RingSet;
use crate::monitor::RingMonitor;

/// Tunables that do not come from the wire protocol. Distinct from
/// per-call arguments (like `report_period_us` on `ring_monitor_init`,
/// which is a call argument, not configuration): this is what an embedder
/// sets up once, before any context of theirs exists.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// Upper bound on concurrently attached rings; never more than
    /// [`crate::ring::MAX_RINGS`] regardless of what is configured here.
    pub max_rings: usize,
    /// Whether `ring_monitor_init` (§6) may start the monitor at all for
    /// this context. Some embeddings run their own watchdog liveness
    /// reporting and never want this crate's thread.
    pub ring_monitor_enabled: bool,
    /// The period the monitor starts with at context construction, so a
    /// period is already in effect even if the guest never calls
    /// `ring_monitor_init` itself. That call remains the one the guest may
    /// still issue; per Open Question 3 (§9) the first call (here, this
    /// default) wins and later calls are no-ops.
    pub default_report_period_us: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_rings: crate::ring::MAX_RINGS,
            ring_monitor_enabled: true,
            default_report_period_us: 1_000_000,
        }
    }
}

/// Invoked once per retired fence, as `(ctx_id, ring_idx, fence_id)`. The
/// context is resolved by id for the duration of a single retirement only
/// (§9) — this callback does not hold a reference to the context.
pub type UserRetireCallback = Box<dyn Fn(u32, u8, u64) + Send + Sync>;

pub struct Context {
    ctx_id: u32,
    debug_name: String,
    fatal: AtomicBool,
    driver: Arc<dyn HostDriver>,
    resources: ResourceRegistry,
    objects: ObjectRegistry,
    ring_set: Arc<RingSet>,
    monitor: RingMonitor,
    ring_monitor_enabled: bool,
    fence_table: FenceTable,
    memory_table: Arc<MemoryTable>,
    dispatch: DispatchEngine,
}

lazy_static! {
    static ref CONTEXTS: Mutex<HashMap<u32, Arc<Context>>> = Mutex::new(HashMap::new());
}

impl Context {
    /// Allocates a context, initializes its registries, and registers it
    /// in the process-wide context table (`context_create`, §6). The
    /// returned handle is shared: the process table, the fence retirement
    /// path, and the caller all hold the same `Arc`.
    ///
    /// `dispatch` is the fully-populated opcode table: per §4.2/§4.7,
    /// handler (and destructor) registration happens once, at construction
    /// time, so the engine itself never needs interior mutability.
    pub fn create(
        ctx_id: u32,
        retire_cb: UserRetireCallback,
        debug_name: &str,
        config: ContextConfig,
        driver: Arc<dyn HostDriver>,
        dispatch: DispatchEngine,
    ) -> Arc<Context> {
        let fence_retire_cb: Box<dyn Fn(u8, u64) + Send + Sync> =
            Box::new(move |ring_idx, fence_id| retire_cb(ctx_id, ring_idx, fence_id));

        let objects = ObjectRegistry::new();
        let memory_table = Arc::new(MemoryTable::new());
        {
            // Overrides the default DeviceMemory destructor (§4.2) so
            // teardown also drops the memory-specific bookkeeping (the gbm
            // buffer object, if any, and a pending host mapping) that the
            // object registry itself knows nothing about.
            let table = Arc::clone(&memory_table);
            objects.register_destructor(ObjectType::DeviceMemory, move |driver, handle| {
                if let Some(data) = table.remove(handle) {
                    if data.mapped {
                        driver.unmap_memory(handle);
                    }
                }
                driver.destroy_object(ObjectType::DeviceMemory, handle);
            });
        }

        let ctx = Arc::new(Context {
            ctx_id,
            debug_name: debug_name.to_string(),
            fatal: AtomicBool::new(false),
            driver,
            resources: ResourceRegistry::new(),
            objects,
            ring_set: Arc::new(RingSet::new(config.max_rings)),
            monitor: RingMonitor::new(),
            ring_monitor_enabled: config.ring_monitor_enabled,
            fence_table: FenceTable::new(fence_retire_cb),
            memory_table,
            dispatch,
        });

        if config.ring_monitor_enabled {
            ctx.monitor.init(
                Duration::from_micros(config.default_report_period_us),
                Arc::clone(&ctx.ring_set),
                Arc::clone(&ctx.driver),
            );
        }

        CONTEXTS.lock().insert(ctx_id, Arc::clone(&ctx));
        log::info!("context {} ({}) created", ctx_id, debug_name);
        ctx
    }

    /// Tears a context down (`context_destroy`, §6, §4.9): stops the ring
    /// monitor, removes the context from the process table so no further
    /// dispatch or retirement can reach it, then destroys every object (in
    /// reverse-dependency order) and resource. A no-op if `ctx_id` is not
    /// registered.
    pub fn destroy(ctx_id: u32) {
        let ctx = CONTEXTS.lock().remove(&ctx_id);
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => return,
        };

        ctx.monitor.shutdown();
        ctx.ring_set.shutdown();

        for root in ctx.objects.roots() {
            if let Err(err) = ctx.objects.remove(ctx.driver.as_ref(), root) {
                log::error!("context {}: error tearing down object {}: {}", ctx_id, root, err);
            }
        }
        ctx.resources.destroy_all(ctx.driver.as_ref());

        log::info!("context {} ({}) destroyed", ctx_id, ctx.debug_name);
    }

    /// `context_submit_cmd` (§6): dispatches a batch of framed commands.
    /// A no-op if the context is already fatal.
    pub fn submit_cmd(&self, buf: &[u8]) {
        if self.is_fatal() {
            return;
        }
        self.dispatch.dispatch_batch(self, buf);
    }

    /// `context_submit_fence` (§6).
    pub fn submit_fence(&self, flags: u32, ring_idx: u8, fence_id: u64) -> crate::error::Result<()> {
        self.fence_table
            .submit_fence(self.driver.as_ref(), flags, ring_idx, fence_id)
    }

    /// The polling counterpart to [`on_retire`]: periodically driven by the
    /// host (§4.8 `retire_all`) rather than pushed by the driver's async
    /// completion path. Walks every busy timeline and retires fences up to
    /// whatever seqno `ring_seqno` reports for that timeline index, in case
    /// a retirement callback was missed or coalesced.
    pub fn retire_all(&self, ring_seqno: impl Fn(u8) -> Option<u64>) {
        self.fence_table.retire_all(ring_seqno);
    }

    /// `context_ring_monitor_init` (§6). Idempotent: only the first call's
    /// period takes effect (§9 open question) — in practice that is usually
    /// the config's `default_report_period_us`, applied at construction
    /// (§4.12), so this call is commonly a no-op unless monitoring was
    /// disabled in `ContextConfig`. A no-op, logged at `debug!`, if this
    /// context was configured with `ring_monitor_enabled = false`.
    pub fn ring_monitor_init(&self, report_period_us: u64) {
        if !self.ring_monitor_enabled {
            log::debug!(
                "context {}: ring_monitor_init ignored, monitoring disabled",
                self.ctx_id
            );
            return;
        }
        self.monitor.init(
            Duration::from_micros(report_period_us),
            Arc::clone(&self.ring_set),
            Arc::clone(&self.driver),
        );
    }

    /// Attaches a new ring to this context's ring set (C4, §4.4). A guest
    /// must do this before `context_wait_ring_seqno`/
    /// `context_on_ring_seqno_update` have anything to act on; fails (a
    /// guest protocol violation) if the set is already at capacity or
    /// `ring_id` is already attached.
    pub fn attach_ring(
        &self,
        ring_id: u64,
        max_report_period_us: u64,
        monitoring_enabled: bool,
    ) -> crate::error::Result<()> {
        let ring = crate::ring::Ring::new(ring_id, max_report_period_us);
        ring.set_monitoring_enabled(monitoring_enabled);
        self.ring_set.attach(ring)
    }

    /// Detaches a ring. A no-op if `ring_id` is not attached (matching
    /// `detach`'s own no-op semantics, §4.4).
    pub fn detach_ring(&self, ring_id: u64) {
        self.ring_set.detach(ring_id);
    }

    /// `context_on_ring_seqno_update` (§6).
    pub fn on_ring_seqno_update(&self, ring_id: u64, ring_seqno: u64) {
        self.ring_set.on_head_update(ring_id, ring_seqno);
    }

    /// `context_wait_ring_seqno` (§6).
    pub fn wait_ring_seqno(&self, ring_id: u64, target_seqno: u64) -> crate::error::Result<bool> {
        self.ring_set.wait_for_seqno(ring_id, target_seqno)
    }

    /// The `AllocateMemory` command handler (§4.6, §6): the one per-object
    /// command the design calls out as more than a thin driver shim. Runs
    /// `info` through the device-memory policy, allocates on the driver,
    /// and registers the result as a `DeviceMemory` object and in the
    /// per-context memory table, in that order, rolling the driver
    /// allocation back on the (internal-error) case where the id turns out
    /// to already be taken between validation and insert.
    pub fn allocate_memory(
        &self,
        id: u64,
        parent: Option<u64>,
        mut info: MemoryAllocateInfo,
    ) -> crate::error::Result<()> {
        if !self.objects.validate(id) {
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "AllocateMemory with a zero or already-assigned object id",
            ));
        }

        let (valid_fd_types, gbm_bo) =
            memory::transform_allocate_info(&mut info, self.driver.as_ref(), &self.resources)?;
        let driver_handle = self.driver.allocate_memory(&info)?;
        let property_flags = self.driver.memory_type_properties(info.memory_type_index);

        let data = DeviceMemoryData {
            driver_handle,
            memory_type_index: info.memory_type_index,
            allocation_size: info.allocation_size,
            property_flags,
            valid_fd_types,
            gbm_bo,
            exported: false,
            mapped: false,
            original_chain: info.chain,
        };
        self.memory_table.insert(driver_handle, data);

        if let Err(err) = self.objects.insert(id, ObjectType::DeviceMemory, driver_handle, parent) {
            self.memory_table.remove(driver_handle);
            self.driver.destroy_object(ObjectType::DeviceMemory, driver_handle);
            return Err(err);
        }
        Ok(())
    }

    /// The `ExportBlob` command handler (§4.6, §6) for a device-memory
    /// object previously created via [`allocate_memory`](Self::allocate_memory).
    pub fn export_memory_blob(&self, id: u64, cross_device: bool) -> crate::error::Result<BlobDescriptor> {
        let (obj_type, handle) = self.objects.lookup(id).ok_or_else(|| {
            Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "ExportBlob on an unknown object id",
            )
        })?;
        if obj_type != ObjectType::DeviceMemory {
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "ExportBlob on a non-DeviceMemory object",
            ));
        }

        let result = self
            .memory_table
            .with_mut(handle, |data| memory::export_blob(data, self.driver.as_ref(), cross_device));
        match result {
            Some(inner) => inner,
            None => Err(Error::with_detail(
                ErrorKind::Internal,
                "device-memory object missing from memory table",
            )),
        }
    }

    pub fn ctx_id(&self) -> u32 {
        self.ctx_id
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    /// Sets the sticky fatal flag (§5: a plain boolean, relaxed ordering
    /// suffices; written only from the dispatch thread and the codec).
    pub fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Relaxed);
    }

    pub fn driver(&self) -> &dyn HostDriver {
        self.driver.as_ref()
    }

    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }
}

/// The async retirement entry point (`on_retire`, §4.8, §9): resolves
/// `ctx_id` through the process-wide table and forwards to that context's
/// fence table. Unlike every other entry point in this module, this one is
/// infallible from the driver's perspective — an unknown context is logged
/// and swallowed so the driver's async thread keeps running (§7).
pub fn on_retire(ctx_id: u32, ring_idx: u8, fence_id: u64) {
    let ctx = CONTEXTS.lock().get(&ctx_id).cloned();
    match ctx {
        Some(ctx) => ctx.fence_table.on_retire(ring_idx, fence_id),
        None => log::warn!("on_retire for unknown context {}", ctx_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::FakeDriver;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn driver() -> Arc<dyn HostDriver> {
        Arc::new(FakeDriver::new())
    }

    #[test]
    fn create_registers_in_process_table_and_destroy_removes_it() {
        let _ctx = Context::create(
            1001,
            Box::new(|_, _, _| {}),
            "t1",
            ContextConfig::default(),
            driver(),
            DispatchEngine::new(),
        );
        assert!(CONTEXTS.lock().contains_key(&1001));
        Context::destroy(1001);
        assert!(!CONTEXTS.lock().contains_key(&1001));
    }

    #[test]
    fn destroy_is_a_no_op_for_unknown_ctx_id() {
        Context::destroy(999_999);
    }

    #[test]
    fn on_retire_reaches_registered_context() {
        let retired = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&retired);
        let ctx = Context::create(
            1002,
            Box::new(move |ctx_id, ring_idx, fence_id| {
                recorder.lock().unwrap().push((ctx_id, ring_idx, fence_id));
            }),
            "t2",
            ContextConfig::default(),
            driver(),
            DispatchEngine::new(),
        );

        ctx.submit_fence(0, 0, 42).unwrap();
        on_retire(1002, 0, 0);

        assert_eq!(*retired.lock().unwrap(), vec![(1002, 0, 42)]);
        Context::destroy(1002);
    }

    #[test]
    fn on_retire_for_unknown_context_is_swallowed() {
        on_retire(424_242, 0, 0);
    }

    #[test]
    fn attach_ring_makes_wait_ring_seqno_reachable() {
        let ctx = Context::create(
            1005,
            Box::new(|_, _, _| {}),
            "ring",
            ContextConfig::default(),
            driver(),
            DispatchEngine::new(),
        );

        // Before attach, the ring is unknown and waiting fails outright.
        assert!(ctx.wait_ring_seqno(7, 1000).is_err());

        ctx.attach_ring(7, 16_000, true).unwrap();
        ctx.on_ring_seqno_update(7, 1000);
        assert!(ctx.wait_ring_seqno(7, 1000).unwrap());

        ctx.detach_ring(7);
        assert!(ctx.wait_ring_seqno(7, 1000).is_err());

        Context::destroy(1005);
    }

    #[test]
    fn retire_all_drains_busy_timelines_from_polled_seqnos() {
        let ctx = Context::create(
            1004,
            Box::new(|_, _, _| {}),
            "poll",
            ContextConfig::default(),
            driver(),
            DispatchEngine::new(),
        );

        ctx.submit_fence(0, 2, 10).unwrap();
        ctx.submit_fence(0, 2, 11).unwrap();

        // Simulate the host's periodic sweep reading shared-memory seqnos
        // rather than the driver pushing a retire callback.
        ctx.retire_all(|ring_idx| if ring_idx == 2 { Some(1) } else { None });

        Context::destroy(1004);
    }

    #[test]
    fn fatal_flag_is_sticky_and_stops_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatch = DispatchEngine::new();
        {
            let calls = Arc::clone(&calls);
            dispatch.register(
                1,
                Box::new(move |_ctx, _frame| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let ctx = Context::create(
            1003,
            Box::new(|_, _, _| {}),
            "t3",
            ContextConfig::default(),
            driver(),
            dispatch,
        );

        ctx.mark_fatal();
        assert!(ctx.is_fatal());
        // A nonzero-length buffer would normally dispatch to opcode 1, but
        // the fatal flag makes `submit_cmd` a no-op.
        ctx.submit_cmd(b"\x00\x00\x00\x00\x01\x00\x00\x00");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Context::destroy(1003);
    }

    fn alloc_info() -> MemoryAllocateInfo {
        MemoryAllocateInfo {
            allocation_size: 4096,
            memory_type_index: 0,
            chain: Vec::new(),
        }
    }

    #[test]
    fn allocate_memory_registers_object_and_export_blob_reports_its_fd_type() {
        use crate::driver::DriverCaps;
        use ash::vk;

        let fake = Arc::new(FakeDriver::new());
        fake.set_caps(DriverCaps {
            opaque_fd_export_supported: true,
            ..Default::default()
        });
        fake.set_memory_type_properties(0, vk::MemoryPropertyFlags::HOST_VISIBLE);
        let driver: Arc<dyn HostDriver> = fake.clone();

        let ctx = Context::create(
            2001,
            Box::new(|_, _, _| {}),
            "mem",
            ContextConfig::default(),
            driver,
            DispatchEngine::new(),
        );

        ctx.allocate_memory(7, None, alloc_info()).unwrap();
        assert!(!ctx.objects().validate(7));

        let desc = ctx.export_memory_blob(7, false).unwrap();
        assert_eq!(desc.fd_type, crate::memory::FdType::OpaqueFd);

        Context::destroy(2001);
        assert!(fake
            .destroy_calls
            .lock()
            .iter()
            .any(|&(ty, _)| ty == ObjectType::DeviceMemory));
    }

    #[test]
    fn allocate_memory_rejects_a_zero_or_duplicate_object_id() {
        let ctx = Context::create(
            2002,
            Box::new(|_, _, _| {}),
            "dup",
            ContextConfig::default(),
            driver(),
            DispatchEngine::new(),
        );

        let err = ctx.allocate_memory(0, None, alloc_info()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GuestProtocolViolation);

        ctx.allocate_memory(1, None, alloc_info()).unwrap();
        let err = ctx.allocate_memory(1, None, alloc_info()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GuestProtocolViolation);

        Context::destroy(2002);
    }

    #[test]
    fn destroy_tears_down_a_gbm_backed_device_memory_object() {
        use crate::driver::DriverCaps;
        use ash::vk;

        let fake = Arc::new(FakeDriver::new());
        fake.set_caps(DriverCaps {
            external_memory_dma_buf: true,
            ..Default::default()
        });
        fake.set_memory_type_properties(0, vk::MemoryPropertyFlags::HOST_VISIBLE);
        let driver: Arc<dyn HostDriver> = fake.clone();

        let ctx = Context::create(
            2003,
            Box::new(|_, _, _| {}),
            "gbm",
            ContextConfig::default(),
            driver,
            DispatchEngine::new(),
        );
        ctx.allocate_memory(5, None, alloc_info()).unwrap();

        Context::destroy(2003);
        assert!(fake
            .destroy_calls
            .lock()
            .iter()
            .any(|&(ty, _)| ty == ObjectType::DeviceMemory));
    }

    #[test]
    fn destroy_unmaps_a_host_mapped_export_before_destroying_it() {
        use ash::vk;

        let fake = Arc::new(FakeDriver::new());
        fake.set_memory_type_properties(
            0,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        let driver: Arc<dyn HostDriver> = fake.clone();

        let ctx = Context::create(
            2004,
            Box::new(|_, _, _| {}),
            "map",
            ContextConfig::default(),
            driver,
            DispatchEngine::new(),
        );
        ctx.allocate_memory(9, None, alloc_info()).unwrap();
        ctx.export_memory_blob(9, false).unwrap();

        Context::destroy(2004);
        assert_eq!(fake.unmap_calls.lock().len(), 1);
    }

    #[test]
    fn export_memory_blob_on_non_device_memory_object_is_a_protocol_violation() {
        let fake = Arc::new(FakeDriver::new());
        let driver: Arc<dyn HostDriver> = fake.clone();
        let ctx = Context::create(
            2005,
            Box::new(|_, _, _| {}),
            "bad-export",
            ContextConfig::default(),
            driver,
            DispatchEngine::new(),
        );

        ctx.objects().insert(3, ObjectType::Buffer, 30, None).unwrap();
        let err = ctx.export_memory_blob(3, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GuestProtocolViolation);

        Context::destroy(2005);
    }
}
