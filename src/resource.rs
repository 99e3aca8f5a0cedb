//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Resource registry (C1): maps `res_id` to a blob descriptor (an owned fd
//! or a mapped byte range) with lifecycle and ownership.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::driver::HostDriver;
use crate::error::{Error, ErrorKind, Result};
use crate::memory::{self, BlobPayload, DeviceMemoryData, FdType};
use crate::object::ObjectType;

/// Storage backing a resource: either an owned fd, or a mapped byte range
/// (the invariant from §3: `shm` resources have a mapping, everything else
/// has an owned fd).
#[derive(Debug)]
enum Storage {
    Fd(RawFd),
    Mapped { ptr: *mut u8, size: u64 },
}

unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

/// A resource as described by §3: `res_id`, `blob_id`, `fd_type`, storage,
/// and size. Owned by [`ResourceRegistry`]; shared (not owned) by any
/// device-memory objects that import its fd.
#[derive(Debug)]
pub struct Resource {
    res_id: u32,
    blob_id: u64,
    fd_type: FdType,
    storage: Storage,
    size: u64,
    /// Present iff this resource's storage was produced by an allocation
    /// this registry made on the resource's behalf (via `create`), as
    /// opposed to one imported from the guest (via `import`). Owns the
    /// teardown of that allocation.
    owned_memory: Option<u64>,
}

impl Resource {
    pub fn res_id(&self) -> u32 {
        self.res_id
    }

    pub fn blob_id(&self) -> u64 {
        self.blob_id
    }

    pub fn fd_type(&self) -> FdType {
        self.fd_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The fd backing this resource, borrowed (not owned) by the caller.
    /// Every caller that wants to keep a copy must `dup` it; memory-import
    /// always dup's (§3).
    pub fn borrow_fd(&self) -> RawFd {
        match self.storage {
            Storage::Fd(fd) => fd,
            Storage::Mapped { .. } => -1,
        }
    }

    pub fn map_ptr(&self) -> Option<*mut u8> {
        match self.storage {
            Storage::Mapped { ptr, .. } => Some(ptr),
            Storage::Fd(_) => None,
        }
    }

    fn destroy(self, driver: &dyn HostDriver) {
        match self.storage {
            Storage::Fd(fd) => {
                if fd >= 0 {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
            Storage::Mapped { ptr: _, size: _ } => {
                if let Some(handle) = self.owned_memory {
                    driver.unmap_memory(handle);
                }
            }
        }
        if let Some(handle) = self.owned_memory {
            driver.destroy_object(ObjectType::DeviceMemory, handle);
        }
    }
}

/// Guards the resource table only; per the concurrency design no other
/// lock may be acquired while this one is held.
pub struct ResourceRegistry {
    inner: Mutex<HashMap<u32, Resource>>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a resource backed by a fresh allocation, choosing an export
    /// kind via the device-memory policy (§4.1, §4.6). `mappable` selects a
    /// host-visible memory type; `shareable` requests a cross-process
    /// export. Returns the blob descriptor the guest needs
    /// (`context_create_resource`'s `out_blob`, §6), with `map_info` and
    /// `vulkan_info` intact.
    ///
    /// The registry's mutex is taken only to check-for-duplicate and to
    /// insert; the policy transform, the driver's `allocate_memory`, and
    /// `export_blob` (which itself may call `export_memory_fd`/
    /// `map_memory`) all run with it released, per §5's "no dispatch-path
    /// call holds a mutex across a driver call".
    pub fn create(
        &self,
        driver: &dyn HostDriver,
        res_id: u32,
        blob_id: u64,
        size: u64,
        mappable: bool,
        shareable: bool,
    ) -> Result<BlobDescriptor> {
        if self.inner.lock().contains_key(&res_id) {
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "duplicate resource id",
            ));
        }

        // This crate does not model the full physical-device memory-type
        // table; memory type 0 stands in for "the" host-visible type when
        // `mappable` is requested, matching how resources are described
        // in the data model (§3: resources are mappable or not, not
        // associated with a guest-chosen memory type index directly).
        let _ = mappable;
        let memory_type_index = 0;
        let mut alloc_info = memory::MemoryAllocateInfo {
            allocation_size: size,
            memory_type_index,
            chain: Vec::new(),
        };

        let (valid_fd_types, gbm_bo) =
            memory::apply_externalization_policy(&mut alloc_info, driver)?;

        let driver_handle = driver.allocate_memory(&alloc_info)?;
        let property_flags = driver.memory_type_properties(memory_type_index);

        let mut data = DeviceMemoryData {
            driver_handle,
            memory_type_index,
            allocation_size: size,
            property_flags,
            valid_fd_types,
            gbm_bo,
            exported: false,
            mapped: false,
            original_chain: alloc_info.chain.clone(),
        };

        let descriptor = match memory::export_blob(&mut data, driver, shareable) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                driver.destroy_object(ObjectType::DeviceMemory, driver_handle);
                return Err(err);
            }
        };

        let (fd_type, storage) = match descriptor.payload {
            BlobPayload::Fd(fd) => (descriptor.fd_type, Storage::Fd(fd)),
            BlobPayload::Mapped(ptr) => (FdType::Shm, Storage::Mapped { ptr, size }),
        };

        let mut inner = self.inner.lock();
        if inner.contains_key(&res_id) {
            // Lost a race with a concurrent `create`/`import` of the same
            // id between the check above and this insert; tear down what
            // was just allocated/exported rather than leak it.
            drop(inner);
            if data.mapped {
                driver.unmap_memory(driver_handle);
            }
            if let Storage::Fd(fd) = storage {
                if fd >= 0 {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
            driver.destroy_object(ObjectType::DeviceMemory, driver_handle);
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "duplicate resource id",
            ));
        }

        inner.insert(
            res_id,
            Resource {
                res_id,
                blob_id,
                fd_type,
                storage,
                size,
                owned_memory: Some(driver_handle),
            },
        );

        Ok(descriptor)
    }

    /// Imports a resource backed by a guest-supplied fd. The fd is dup'd so
    /// the caller keeps ownership of the one it passed in.
    pub fn import(
        &self,
        driver: &dyn HostDriver,
        res_id: u32,
        fd_type: FdType,
        fd: RawFd,
        size: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&res_id) {
            return Err(Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "duplicate resource id",
            ));
        }
        let owned_fd = driver.dup_fd(fd)?;
        inner.insert(
            res_id,
            Resource {
                res_id,
                blob_id: 0,
                fd_type,
                storage: Storage::Fd(owned_fd),
                size,
                owned_memory: None,
            },
        );
        Ok(())
    }

    /// Destroys a resource, closing its fd or unmapping its storage
    /// exactly once. A no-op on an unknown id (§4.1).
    pub fn destroy(&self, driver: &dyn HostDriver, res_id: u32) {
        let resource = self.inner.lock().remove(&res_id);
        if let Some(resource) = resource {
            resource.destroy(driver);
        }
    }

    /// Looks up a resource's fd/size by id without removing it. The
    /// `Resource` is not clonable; callers needing to keep a reference past
    /// the lock must dup the fd (`borrow_fd` + `driver.dup_fd`).
    pub fn lookup(&self, res_id: u32) -> Option<ResourceSnapshot> {
        self.inner.lock().get(&res_id).map(ResourceSnapshot::from)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys every remaining resource. Used at context teardown (§4.9).
    pub fn destroy_all(&self, driver: &dyn HostDriver) {
        let drained: Vec<Resource> = self.inner.lock().drain().map(|(_, r)| r).collect();
        for resource in drained {
            resource.destroy(driver);
        }
    }
}

/// A cheap, lock-free-to-hold copy of the fields callers need once they've
/// released the registry's mutex (the fd is borrowed, not owned, by this
/// snapshot — see [`Resource::borrow_fd`]).
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    fd: RawFd,
    fd_type: FdType,
    size: u64,
}

impl ResourceSnapshot {
    fn from(r: &Resource) -> Self {
        Self {
            fd: r.borrow_fd(),
            fd_type: r.fd_type(),
            size: r.size(),
        }
    }

    pub fn borrow_fd(&self) -> RawFd {
        self.fd
    }

    pub fn fd_type(&self) -> FdType {
        self.fd_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::FakeDriver;
    use crate::driver::DriverCaps;

    #[test]
    fn import_then_destroy_is_idempotent_and_leaves_table_empty() {
        let driver = FakeDriver::new();
        let registry = ResourceRegistry::new();

        let fd = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        assert!(fd >= 0);

        registry.import(&driver, 3, FdType::DmaBuf, fd, 4096).unwrap();
        assert_eq!(registry.len(), 1);

        registry.destroy(&driver, 3);
        assert!(registry.is_empty());

        // destroy on an unknown id is a no-op, not an error
        registry.destroy(&driver, 3);
        assert!(registry.is_empty());

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn duplicate_create_fails() {
        let driver = FakeDriver::new();
        driver.set_caps(DriverCaps {
            dma_buf_fd_export_supported: true,
            ..Default::default()
        });
        driver.set_memory_type_properties(0, ash::vk::MemoryPropertyFlags::HOST_VISIBLE);

        let registry = ResourceRegistry::new();
        registry.create(&driver, 7, 0x100, 65536, true, true).unwrap();
        let err = registry.create(&driver, 7, 0x200, 4096, true, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GuestProtocolViolation);
    }

    #[test]
    fn create_dma_buf_resource_has_owned_fd() {
        let driver = FakeDriver::new();
        driver.set_caps(DriverCaps {
            dma_buf_fd_export_supported: true,
            ..Default::default()
        });
        driver.set_memory_type_properties(0, ash::vk::MemoryPropertyFlags::HOST_VISIBLE);

        let registry = ResourceRegistry::new();
        let descriptor = registry.create(&driver, 7, 0x100, 65536, true, true).unwrap();
        assert_eq!(descriptor.fd_type, FdType::DmaBuf);
        assert!(matches!(descriptor.payload, BlobPayload::Fd(fd) if fd >= 0));

        let snap = registry.lookup(7).unwrap();
        assert_eq!(snap.fd_type(), FdType::DmaBuf);
        assert!(snap.borrow_fd() >= 0);

        registry.destroy(&driver, 7);
    }

    #[test]
    fn create_returns_map_info_and_vulkan_info_for_host_mapped_fallback() {
        let driver = FakeDriver::new();
        driver.set_memory_type_properties(
            0,
            ash::vk::MemoryPropertyFlags::HOST_VISIBLE | ash::vk::MemoryPropertyFlags::HOST_COHERENT,
        );

        let registry = ResourceRegistry::new();
        let descriptor = registry.create(&driver, 9, 0x200, 4096, true, false).unwrap();

        assert_eq!(descriptor.fd_type, FdType::None);
        assert!(matches!(descriptor.payload, BlobPayload::Mapped(_)));
        assert_eq!(descriptor.map_info, Some(crate::memory::MapInfo::WriteCombined));
        assert_eq!(descriptor.vulkan_info.allocation_size, 4096);

        registry.destroy(&driver, 9);
    }
}
