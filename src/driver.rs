//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! The host driver interface (§6, §4.13): everything this crate treats as
//! an external collaborator. A production embedding implements
//! [`HostDriver`] against the real host graphics driver and the process-
//! global `gbm` device; tests implement it against an in-memory fake.

use ash::vk;
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::memory::MemoryAllocateInfo;
use crate::object::ObjectType;

/// Capability bits the device-memory policy (C6) consults. Named after the
/// Vulkan extensions/features they mirror.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverCaps {
    pub dma_buf_fd_export_supported: bool,
    pub opaque_fd_export_supported: bool,
    pub external_memory_dma_buf: bool,
    pub device_uuid: [u8; 16],
    pub driver_uuid: [u8; 16],
}

/// An owned `gbm_bo` handle from the fallback allocator. `Drop` destroys the
/// underlying buffer object.
pub trait GbmBo: std::fmt::Debug + Send + Sync {
    /// Duplicates and returns a DMA-buf fd backing this buffer object. The
    /// caller owns the returned fd.
    fn export_fd(&self) -> Result<RawFd>;
}

/// The host-side collaborator this crate dispatches driver work to. Mirrors
/// the C-style function table §1 says is assumed: fence submission and
/// retirement registration, memory export/map, per-object destruction, and
/// ring liveness reporting.
pub trait HostDriver: Send + Sync {
    fn caps(&self) -> DriverCaps;

    /// The property flags (host-visible/coherent/cached bits) of a memory
    /// type index, from the physical-device capability record.
    fn memory_type_properties(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags;

    /// Allocates device memory per the (already-transformed) allocate-info
    /// record, returning an opaque driver handle for the new memory object.
    fn allocate_memory(&self, info: &MemoryAllocateInfo) -> Result<u64>;

    /// Exports a DMA-buf or opaque fd from an already-allocated memory
    /// object. The caller owns the returned fd.
    fn export_memory_fd(&self, memory: u64, handle_type: vk::ExternalMemoryHandleTypeFlags) -> Result<RawFd>;

    /// `vkMapMemory`-equivalent: maps `memory` for host access, returning
    /// the mapped base address.
    fn map_memory(&self, memory: u64, size: u64) -> Result<*mut u8>;

    fn unmap_memory(&self, memory: u64);

    /// Creates a gbm buffer object of at least `size` bytes, used by the
    /// fallback allocation path (§4.6, row 4).
    fn gbm_create_bo(&self, size: u64) -> Result<Box<dyn GbmBo>>;

    /// Duplicates a file descriptor the caller does not own (or does not
    /// want to give up ownership of), returning a new, independently-owned
    /// fd. Used at every fd-ownership boundary named in §9.
    fn dup_fd(&self, fd: RawFd) -> Result<RawFd>;

    /// Invokes the per-type destructor for a driver object. The type tag
    /// is resolved by the object registry (§4.2); this call only needs to
    /// know how to destroy it.
    fn destroy_object(&self, object_type: ObjectType, handle: u64);

    /// Enqueues a fence submission on a ring's timeline. Retirement is
    /// asynchronous and arrives later via the registered retire callback
    /// (see [`crate::fence`]).
    fn submit_fence(&self, ring_idx: u8, seqno: u32) -> Result<()>;

    /// Marks `ring_id` alive to the host-level watchdog (C5).
    fn mark_ring_alive(&self, ring_id: u64);
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct FakeGbmBo {
        pub size: u64,
    }

    impl GbmBo for FakeGbmBo {
        fn export_fd(&self) -> Result<RawFd> {
            // A fake fd that does not correspond to a real dma-buf; good
            // enough for tests that only check bookkeeping, not the bytes.
            Ok(dup_devnull())
        }
    }

    fn dup_devnull() -> RawFd {
        unsafe {
            let fd = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY);
            assert!(fd >= 0, "failed to open /dev/null for test fd");
            fd
        }
    }

    /// A `HostDriver` fake for unit tests: every operation succeeds and is
    /// recorded, nothing touches real hardware.
    #[derive(Debug)]
    pub struct FakeDriver {
        pub caps: Mutex<DriverCaps>,
        pub memory_type_props: Mutex<Vec<vk::MemoryPropertyFlags>>,
        pub next_handle: AtomicU32,
        pub mark_alive_calls: Arc<AtomicUsize>,
        pub destroy_calls: Mutex<Vec<(ObjectType, u64)>>,
        pub exported_fds: Mutex<Vec<u64>>,
        pub submit_fence_calls: Mutex<Vec<(u8, u32)>>,
        pub unmap_calls: Mutex<Vec<u64>>,
    }

    impl FakeDriver {
        pub fn new() -> Self {
            #[cfg(test)]
            crate::test_logging::init();

            Self {
                caps: Mutex::new(DriverCaps::default()),
                memory_type_props: Mutex::new(vec![vk::MemoryPropertyFlags::empty(); 16]),
                next_handle: AtomicU32::new(1),
                mark_alive_calls: Arc::new(AtomicUsize::new(0)),
                destroy_calls: Mutex::new(Vec::new()),
                exported_fds: Mutex::new(Vec::new()),
                submit_fence_calls: Mutex::new(Vec::new()),
                unmap_calls: Mutex::new(Vec::new()),
            }
        }

        pub fn set_caps(&self, caps: DriverCaps) {
            *self.caps.lock() = caps;
        }

        pub fn set_memory_type_properties(&self, index: u32, flags: vk::MemoryPropertyFlags) {
            let mut props = self.memory_type_props.lock();
            if props.len() <= index as usize {
                props.resize(index as usize + 1, vk::MemoryPropertyFlags::empty());
            }
            props[index as usize] = flags;
        }
    }

    impl HostDriver for FakeDriver {
        fn caps(&self) -> DriverCaps {
            *self.caps.lock()
        }

        fn memory_type_properties(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
            self.memory_type_props
                .lock()
                .get(memory_type_index as usize)
                .copied()
                .unwrap_or_else(vk::MemoryPropertyFlags::empty)
        }

        fn allocate_memory(&self, _info: &MemoryAllocateInfo) -> Result<u64> {
            Ok(self.next_handle.fetch_add(1, Ordering::Relaxed) as u64)
        }

        fn export_memory_fd(
            &self,
            memory: u64,
            _handle_type: vk::ExternalMemoryHandleTypeFlags,
        ) -> Result<RawFd> {
            self.exported_fds.lock().push(memory);
            Ok(dup_devnull())
        }

        fn map_memory(&self, _memory: u64, size: u64) -> Result<*mut u8> {
            let mut v = vec![0u8; size as usize].into_boxed_slice();
            let ptr = v.as_mut_ptr();
            std::mem::forget(v);
            Ok(ptr)
        }

        fn unmap_memory(&self, memory: u64) {
            self.unmap_calls.lock().push(memory);
        }

        fn gbm_create_bo(&self, size: u64) -> Result<Box<dyn GbmBo>> {
            Ok(Box::new(FakeGbmBo { size }))
        }

        fn dup_fd(&self, fd: RawFd) -> Result<RawFd> {
            let new_fd = unsafe { libc::dup(fd) };
            if new_fd < 0 {
                let io_err = std::io::Error::last_os_error();
                let errno = io_err.raw_os_error().unwrap_or(0);
                Err(crate::error::Error::with_detail(
                    crate::error::kind_from_errno(errno),
                    io_err,
                ))
            } else {
                Ok(new_fd)
            }
        }

        fn destroy_object(&self, object_type: ObjectType, handle: u64) {
            self.destroy_calls.lock().push((object_type, handle));
        }

        fn submit_fence(&self, ring_idx: u8, seqno: u32) -> Result<()> {
            self.submit_fence_calls.lock().push((ring_idx, seqno));
            Ok(())
        }

        fn mark_ring_alive(&self, _ring_id: u64) {
            self.mark_alive_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}
