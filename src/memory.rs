//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Device-memory policy (C6): transforms a guest `AllocateMemory` request
//! into one that actually works on the host, and resolves blob exports for
//! cross-domain sharing.
//!
//! The pNext-chain extension structs Vulkan uses for this are modeled here
//! as an explicit enum rather than a raw pointer chain, since this crate
//! only ever hands them to the abstracted [`HostDriver`], never to a real
//! `vkAllocateMemory` call.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::driver::{GbmBo, HostDriver};
use crate::error::{Error, ErrorKind, Result};
use crate::resource::ResourceRegistry;

/// `fd_type` of a [`crate::resource::Resource`] or an exported blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdType {
    None,
    DmaBuf,
    OpaqueFd,
    Shm,
}

/// One pNext-chain entry a guest may attach to an `AllocateMemory` command,
/// or that the policy itself attaches/replaces.
#[derive(Debug, Clone)]
pub enum ChainEntry {
    /// `ImportMemoryResourceInfoMESA`-equivalent: import memory backing an
    /// existing resource by id.
    ImportMemoryResource { resource_id: u32 },
    /// `VkImportMemoryFdInfoKHR`-equivalent.
    ImportFd {
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        fd: RawFd,
    },
    /// `VkExportMemoryAllocateInfo`-equivalent.
    ExportMemoryAllocate {
        handle_types: vk::ExternalMemoryHandleTypeFlags,
    },
}

/// A `VkMemoryAllocateInfo`-shaped record.
#[derive(Debug, Clone)]
pub struct MemoryAllocateInfo {
    pub allocation_size: u64,
    pub memory_type_index: u32,
    pub chain: Vec<ChainEntry>,
}

impl MemoryAllocateInfo {
    fn export_entry_mut(&mut self) -> Option<&mut vk::ExternalMemoryHandleTypeFlags> {
        self.chain.iter_mut().find_map(|e| match e {
            ChainEntry::ExportMemoryAllocate { handle_types } => Some(handle_types),
            _ => None,
        })
    }

    fn requested_export_types(&self) -> vk::ExternalMemoryHandleTypeFlags {
        self.chain.iter().fold(vk::ExternalMemoryHandleTypeFlags::empty(), |acc, e| {
            match e {
                ChainEntry::ExportMemoryAllocate { handle_types } => acc | *handle_types,
                _ => acc,
            }
        })
    }

    fn strip_export_entries(&mut self) {
        self.chain
            .retain(|e| !matches!(e, ChainEntry::ExportMemoryAllocate { .. }));
    }

    fn merge_export(&mut self, handle_type: vk::ExternalMemoryHandleTypeFlags) {
        if let Some(existing) = self.export_entry_mut() {
            *existing |= handle_type;
        } else {
            self.chain.push(ChainEntry::ExportMemoryAllocate {
                handle_types: handle_type,
            });
        }
    }
}

/// gbm-path allocations above this size fail with `OutOfDeviceMemory` (§4.6,
/// §8 boundary behavior).
pub const GBM_MAX_ALLOCATION_SIZE: u64 = u32::MAX as u64;

const GBM_ALIGN: u64 = 4096;

fn round_up_4k(size: u64) -> u64 {
    (size + GBM_ALIGN - 1) & !(GBM_ALIGN - 1)
}

/// Runs the allocation decision table of §4.6 against `info`, mutating it
/// in place, and returns the resulting `valid_fd_types` plus an owned gbm
/// buffer object if the fallback path was taken (kept alive for the
/// lifetime of the memory object).
pub fn transform_allocate_info(
    info: &mut MemoryAllocateInfo,
    driver: &dyn HostDriver,
    resources: &ResourceRegistry,
) -> Result<(vk::ExternalMemoryHandleTypeFlags, Option<Box<dyn GbmBo>>)> {
    // Row 1: guest-supplied resource import always wins and is never
    // forwarded to the driver in its original form.
    if let Some(pos) = info
        .chain
        .iter()
        .position(|e| matches!(e, ChainEntry::ImportMemoryResource { .. }))
    {
        let resource_id = match &info.chain[pos] {
            ChainEntry::ImportMemoryResource { resource_id } => *resource_id,
            _ => unreachable!(),
        };
        let resource = resources.lookup(resource_id).ok_or_else(|| {
            Error::with_detail(
                ErrorKind::GuestProtocolViolation,
                "ImportMemoryResource references unknown resource",
            )
        })?;
        let dup_fd = driver.dup_fd(resource.borrow_fd())?;
        let handle_type = match resource.fd_type() {
            FdType::DmaBuf => vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
            FdType::OpaqueFd => vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
            other => {
                return Err(Error::with_detail(
                    ErrorKind::GuestProtocolViolation,
                    format!("resource fd_type {:?} is not importable as memory", other),
                ))
            }
        };
        info.chain[pos] = ChainEntry::ImportFd {
            handle_type,
            fd: dup_fd,
        };
        return Ok((vk::ExternalMemoryHandleTypeFlags::empty(), None));
    }

    apply_externalization_policy(info, driver)
}

/// Rows 2–5 of §4.6's decision table: the externalization policy applied
/// once a memory allocation is known *not* to be importing an existing
/// resource. Split out from [`transform_allocate_info`] so that
/// [`crate::resource::ResourceRegistry::create`] — whose synthetic
/// allocate-info never carries an `ImportMemoryResource` entry — can run
/// the policy without needing a `&ResourceRegistry` (and without risking a
/// reentrant lock on the registry it is itself a method of).
pub fn apply_externalization_policy(
    info: &mut MemoryAllocateInfo,
    driver: &dyn HostDriver,
) -> Result<(vk::ExternalMemoryHandleTypeFlags, Option<Box<dyn GbmBo>>)> {
    let caps = driver.caps();
    let props = driver.memory_type_properties(info.memory_type_index);
    let host_visible = props.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
    let requested = info.requested_export_types();

    // Row 2: DMA-buf export, when supported, is always preferred.
    if host_visible && caps.dma_buf_fd_export_supported {
        info.merge_export(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let valid = requested | vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT;
        return Ok((valid, None));
    }

    // Row 3: opaque fd export, only if the guest didn't already ask for
    // DMA-buf (which would have matched row 2 if supported).
    if host_visible
        && caps.opaque_fd_export_supported
        && !requested.contains(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
    {
        info.merge_export(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let valid = requested | vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD;
        return Ok((valid, None));
    }

    // Row 4: fall back to a gbm-backed dma-buf when the driver can import
    // one, even though it cannot export DMA-bufs directly.
    if host_visible && caps.external_memory_dma_buf {
        if info.allocation_size > GBM_MAX_ALLOCATION_SIZE {
            return Err(Error::new(ErrorKind::OutOfDeviceMemory));
        }
        let gbm_size = round_up_4k(info.allocation_size);
        let bo = driver.gbm_create_bo(gbm_size)?;
        let fd = bo.export_fd()?;
        info.strip_export_entries();
        info.chain.push(ChainEntry::ImportFd {
            handle_type: vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
            fd,
        });
        return Ok((vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT, Some(bo)));
    }

    // Row 5: no forced externalization; whatever the guest already asked
    // for (if anything) stands.
    Ok((requested, None))
}

/// Cacheability of a host-mapped fallback export (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapInfo {
    Cached,
    WriteCombined,
}

fn map_info_for(props: vk::MemoryPropertyFlags) -> MapInfo {
    let coherent = props.contains(vk::MemoryPropertyFlags::HOST_COHERENT);
    let cached = props.contains(vk::MemoryPropertyFlags::HOST_CACHED);
    if coherent && cached {
        MapInfo::Cached
    } else {
        MapInfo::WriteCombined
    }
}

/// UUIDs and allocation metadata carried alongside an opaque-fd export so
/// the guest can re-derive driver/device compatibility (§4.6, §6).
#[derive(Debug, Clone, Copy)]
pub struct VulkanInfo {
    pub device_uuid: [u8; 16],
    pub driver_uuid: [u8; 16],
    pub allocation_size: u64,
    pub memory_type_index: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum BlobPayload {
    Fd(RawFd),
    Mapped(*mut u8),
}

/// The blob descriptor §6 says `export_blob` returns.
#[derive(Debug, Clone, Copy)]
pub struct BlobDescriptor {
    pub fd_type: FdType,
    pub payload: BlobPayload,
    pub map_info: Option<MapInfo>,
    pub vulkan_info: VulkanInfo,
}

/// Bookkeeping for a device-memory object (C6, a specialization of Object).
#[derive(Debug)]
pub struct DeviceMemoryData {
    pub driver_handle: u64,
    pub memory_type_index: u32,
    pub allocation_size: u64,
    pub property_flags: vk::MemoryPropertyFlags,
    pub valid_fd_types: vk::ExternalMemoryHandleTypeFlags,
    pub gbm_bo: Option<Box<dyn GbmBo>>,
    pub exported: bool,
    /// Set once `export_blob` takes the host-mapped fallback path, so
    /// teardown knows to call `unmap_memory` before destroying the object.
    pub mapped: bool,
    /// The original pNext chain, kept by reference for diagnostics; this
    /// crate does not own the memory backing it.
    pub original_chain: Vec<ChainEntry>,
}

/// Chooses and performs the export per the priority order of §4.6:
/// cross-device requires DMA-buf or fails; otherwise DMA-buf if available;
/// otherwise opaque; otherwise a host-mapped fallback. At most one export
/// ever succeeds per memory object.
pub fn export_blob(
    data: &mut DeviceMemoryData,
    driver: &dyn HostDriver,
    cross_device: bool,
) -> Result<BlobDescriptor> {
    if data.exported {
        return Err(Error::with_detail(
            ErrorKind::GuestProtocolViolation,
            "memory already exported",
        ));
    }

    let caps = driver.caps();
    let has_dma_buf = data
        .valid_fd_types
        .contains(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let has_opaque = data
        .valid_fd_types
        .contains(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);

    if cross_device && !has_dma_buf {
        return Err(Error::with_detail(
            ErrorKind::GuestProtocolViolation,
            "cross-device export requires DMA-buf support",
        ));
    }

    let vulkan_info = VulkanInfo {
        device_uuid: caps.device_uuid,
        driver_uuid: caps.driver_uuid,
        allocation_size: data.allocation_size,
        memory_type_index: data.memory_type_index,
    };

    let descriptor = if has_dma_buf {
        let fd = driver.export_memory_fd(
            data.driver_handle,
            vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
        )?;
        BlobDescriptor {
            fd_type: FdType::DmaBuf,
            payload: BlobPayload::Fd(fd),
            map_info: None,
            vulkan_info,
        }
    } else if has_opaque {
        let fd = driver.export_memory_fd(
            data.driver_handle,
            vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
        )?;
        BlobDescriptor {
            fd_type: FdType::OpaqueFd,
            payload: BlobPayload::Fd(fd),
            map_info: None,
            vulkan_info,
        }
    } else {
        let ptr = driver.map_memory(data.driver_handle, data.allocation_size)?;
        data.mapped = true;
        BlobDescriptor {
            fd_type: FdType::None,
            payload: BlobPayload::Mapped(ptr),
            map_info: Some(map_info_for(data.property_flags)),
            vulkan_info,
        }
    };

    data.exported = true;
    Ok(descriptor)
}

/// Per-context table of device-memory objects, keyed by the same driver
/// handle the object registry stores for the `ObjectType::DeviceMemory`
/// entry. Guarded independently of the object registry proper; the object
/// registry only tracks the id/type/parent-child shape, this table carries
/// the memory-specific payload, and is looked up by handle so the registered
/// per-type destructor (which only ever sees a handle, not a guest id) can
/// find it at teardown.
#[derive(Default)]
pub struct MemoryTable {
    inner: Mutex<HashMap<u64, DeviceMemoryData>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u64, data: DeviceMemoryData) {
        self.inner.lock().insert(id, data);
    }

    pub fn remove(&self, id: u64) -> Option<DeviceMemoryData> {
        self.inner.lock().remove(&id)
    }

    pub fn with_mut<R>(&self, id: u64, f: impl FnOnce(&mut DeviceMemoryData) -> R) -> Option<R> {
        self.inner.lock().get_mut(&id).map(f)
    }
}
