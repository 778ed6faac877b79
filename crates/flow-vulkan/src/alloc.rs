//! Device memory suballocation.
//!
//! Memory is carved out of [`MemoryBlock`]s, one device allocation each, partitioned into
//! live chunks and free intervals. Fresh blocks carry an export chain so their memory can
//! be opened by other processes and GPU APIs; imported blocks wrap memory owned elsewhere.

use std::{
	collections::BTreeMap,
	sync::{Arc, Mutex, Weak},
};

use ash::{khr, vk};
use tracing::warn;

use crate::{
	interop::{MemoryExportInfo, MemoryProps},
	platform::{self, OsHandle},
	Error, Result,
};

/// Fresh blocks are at least this large, so most allocations suballocate.
pub const DEFAULT_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

#[cfg(windows)]
const GENERIC_ALL: u32 = 0x10000000;

pub fn align_up(offset: u64, alignment: u64) -> u64 { (offset + alignment - 1) & !(alignment - 1) }

fn interval_fits(offset: u64, len: u64, req_size: u64, alignment: u64) -> bool {
	// The aligned start may eat into the interval; what remains must still hold the request.
	len + offset >= align_up(offset, alignment) + req_size
}

/// Interval bookkeeping for one block: live chunks and free ranges, both keyed by offset.
///
/// Invariant: the disjoint union of `free` and `chunks` covers `[0, size)`, and no two
/// adjacent free intervals exist.
#[derive(Debug)]
struct Intervals {
	size: u64,
	in_use: u64,
	free: BTreeMap<u64, u64>,
	chunks: BTreeMap<u64, u64>,
}

impl Intervals {
	fn new(size: u64) -> Self {
		Self {
			size,
			in_use: 0,
			free: BTreeMap::from([(0, size)]),
			chunks: BTreeMap::new(),
		}
	}

	/// First fit over the free intervals in ascending offset order.
	fn allocate(&mut self, req_size: u64, alignment: u64) -> Option<u64> {
		if req_size == 0 || self.in_use + req_size > self.size {
			return None;
		}

		let (&start, &len) = self
			.free
			.iter()
			.find(|&(&off, &len)| interval_fits(off, len, req_size, alignment))?;

		let offset = align_up(start, alignment);
		let used_from_start = req_size + offset - start;

		self.chunks.insert(offset, req_size);
		if len > used_from_start {
			self.free.insert(offset + req_size, len - used_from_start);
		}
		if offset == start {
			self.free.remove(&start);
		} else {
			self.free.insert(start, offset - start);
		}

		self.in_use += req_size;
		Some(offset)
	}

	fn free(&mut self, offset: u64) {
		let Some(size) = self.chunks.remove(&offset) else {
			return;
		};
		self.in_use -= size;
		self.free.insert(offset, size);

		// Merge backward, then forward. One step each suffices since the map never holds
		// adjacent free intervals.
		let mut off = offset;
		if let Some((&prev_off, &prev_len)) = self.free.range(..off).next_back() {
			if prev_off + prev_len == off {
				let len = self.free.remove(&off).unwrap();
				*self.free.get_mut(&prev_off).unwrap() += len;
				off = prev_off;
			}
		}
		let len = self.free[&off];
		if let Some((&next_off, &next_len)) = self.free.range(off + 1..).next() {
			if off + len == next_off {
				self.free.remove(&next_off);
				*self.free.get_mut(&off).unwrap() += next_len;
			}
		}
	}
}

struct ExternalMemoryApi {
	#[cfg(windows)]
	win32: khr::external_memory_win32::Device,
	#[cfg(unix)]
	fd: khr::external_memory_fd::Device,
}

impl ExternalMemoryApi {
	fn new(instance: &ash::Instance, device: &ash::Device) -> Self {
		Self {
			#[cfg(windows)]
			win32: khr::external_memory_win32::Device::new(instance, device),
			#[cfg(unix)]
			fd: khr::external_memory_fd::Device::new(instance, device),
		}
	}

	/// The exported OS handle of `memory`. Each call hands out a new reference.
	fn export_handle(&self, memory: vk::DeviceMemory, handle_type: vk::ExternalMemoryHandleTypeFlags) -> Result<OsHandle> {
		unsafe {
			#[cfg(windows)]
			{
				let handle = self.win32.get_memory_win32_handle(
					&vk::MemoryGetWin32HandleInfoKHR::default()
						.memory(memory)
						.handle_type(handle_type),
				)?;
				Ok(handle as OsHandle)
			}
			#[cfg(unix)]
			{
				let fd = self
					.fd
					.get_memory_fd(&vk::MemoryGetFdInfoKHR::default().memory(memory).handle_type(handle_type))?;
				Ok(fd as OsHandle)
			}
		}
	}

	/// The memory-type mask the driver accepts for a foreign handle of a non-opaque type.
	fn import_type_bits(&self, handle_type: vk::ExternalMemoryHandleTypeFlags, handle: OsHandle) -> Result<u32> {
		unsafe {
			#[cfg(windows)]
			{
				let mut props = vk::MemoryWin32HandlePropertiesKHR::default();
				self.win32
					.get_memory_win32_handle_properties(handle_type, handle as _, &mut props)?;
				Ok(props.memory_type_bits)
			}
			#[cfg(unix)]
			{
				let mut props = vk::MemoryFdPropertiesKHR::default();
				self.fd.get_memory_fd_properties(handle_type, handle, &mut props)?;
				Ok(props.memory_type_bits)
			}
		}
	}
}

/// Select the memory type with the most matching property bits among those allowed by
/// `type_bits`; ties go to the lowest index.
pub fn memory_type_index(
	props: &vk::PhysicalDeviceMemoryProperties, type_bits: u32, requested: vk::MemoryPropertyFlags,
) -> Result<(u32, vk::MemoryPropertyFlags)> {
	let mut best: Option<(u32, u32)> = None;
	for i in 0..props.memory_type_count {
		if type_bits & (1 << i) == 0 {
			continue;
		}
		let flags = props.memory_types[i as usize].property_flags;
		let matched = (flags & requested).as_raw().count_ones();
		if best.map_or(true, |(_, count)| matched > count) {
			best = Some((i, matched));
		}
	}
	best.map(|(i, _)| (i, props.memory_types[i as usize].property_flags))
		.ok_or(Error::FeatureMissing("compatible memory type"))
}

struct AllocatorInner {
	device: ash::Device,
	external: ExternalMemoryApi,
	memory_props: vk::PhysicalDeviceMemoryProperties,
	// Blocks are owned by their live allocations and unregister themselves on drop, so the
	// registry only holds weak references, keyed alongside the raw memory handle.
	blocks: Mutex<rustc_hash::FxHashMap<u32, Vec<(vk::DeviceMemory, Weak<MemoryBlock>)>>>,
}

impl AllocatorInner {
	fn unregister(&self, type_index: u32, memory: vk::DeviceMemory) {
		let mut blocks = self.blocks.lock().unwrap();
		if let Some(list) = blocks.get_mut(&type_index) {
			list.retain(|(mem, _)| *mem != memory);
		}
	}
}

/// One device-memory object, suballocated into chunks.
pub struct MemoryBlock {
	allocator: Arc<AllocatorInner>,
	memory: vk::DeviceMemory,
	props: vk::MemoryPropertyFlags,
	type_index: u32,
	handle_type: vk::ExternalMemoryHandleTypeFlags,
	os_handle: OsHandle,
	/// The owning process, for blocks wrapping imported memory.
	imported_from: Option<u64>,
	mapping: Mutex<*mut u8>,
	/// Byte offset of this block within `memory`; non-zero when an import binds mid-memory.
	offset: u64,
	size: u64,
	state: Mutex<Intervals>,
}

unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
	pub fn memory(&self) -> vk::DeviceMemory { self.memory }

	pub fn size(&self) -> u64 { self.size }

	pub fn props(&self) -> vk::MemoryPropertyFlags { self.props }

	pub fn handle_type(&self) -> vk::ExternalMemoryHandleTypeFlags { self.handle_type }

	pub fn os_handle(&self) -> OsHandle { self.os_handle }

	pub fn imported(&self) -> bool { self.imported_from.is_some() }

	pub fn in_use(&self) -> u64 { self.state.lock().unwrap().in_use }

	fn allocate(self: &Arc<Self>, req_size: u64, alignment: u64) -> Option<Allocation> {
		let offset = self.state.lock().unwrap().allocate(req_size, alignment)?;
		Some(Allocation {
			block: self.clone(),
			offset,
			size: req_size,
		})
	}

	/// The host pointer for this block's range, mapping it on demand.
	fn map(&self) -> Result<*mut u8> {
		let mut mapping = self.mapping.lock().unwrap();
		if mapping.is_null() {
			if !self.props.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
				return Err(Error::Message("memory is not host visible".into()));
			}
			*mapping = unsafe {
				self.allocator
					.device
					.map_memory(self.memory, self.offset, self.size, vk::MemoryMapFlags::empty())?
			} as *mut u8;
		}
		Ok(*mapping)
	}
}

impl Drop for MemoryBlock {
	fn drop(&mut self) {
		self.allocator.unregister(self.type_index, self.memory);
		unsafe {
			if !self.mapping.get_mut().unwrap().is_null() {
				self.allocator.device.unmap_memory(self.memory);
			}
			self.allocator.device.free_memory(self.memory, None);
		}
		// Imported handles were consumed by the import; only exported ones are ours to close.
		if self.imported_from.is_none() && platform::handle_is_valid(self.os_handle) {
			platform::close_handle(self.os_handle);
		}
	}
}

/// A live chunk within a block. Dropping the last allocation of a block releases the
/// block's memory, mapping, and OS handle.
pub struct Allocation {
	block: Arc<MemoryBlock>,
	offset: u64,
	size: u64,
}

impl Allocation {
	pub fn block(&self) -> &Arc<MemoryBlock> { &self.block }

	/// Offset relative to the block's start.
	pub fn local_offset(&self) -> u64 { self.offset }

	/// Offset relative to the underlying device memory. An imported block may itself start
	/// at a non-zero offset within its memory.
	pub fn global_offset(&self) -> u64 { self.block.offset + self.offset }

	pub fn size(&self) -> u64 { self.size }

	pub fn allocation_size(&self) -> u64 { self.block.size }

	pub fn memory(&self) -> vk::DeviceMemory { self.block.memory }

	pub fn memory_type_index(&self) -> u32 { self.block.type_index }

	pub fn handle_type(&self) -> vk::ExternalMemoryHandleTypeFlags { self.block.handle_type }

	pub fn os_handle(&self) -> OsHandle { self.block.os_handle }

	pub fn imported(&self) -> bool { self.block.imported() }

	/// The process that owns the underlying memory object.
	pub fn owner_pid(&self) -> u64 { self.block.imported_from.unwrap_or_else(platform::current_pid) }

	/// Host pointer to this chunk, mapping the block on demand.
	pub fn map(&self) -> Result<*mut u8> { Ok(unsafe { self.block.map()?.add(self.offset as usize) }) }

	pub fn flush(&self) -> Result<()> {
		unsafe {
			self.block
				.allocator
				.device
				.flush_mapped_memory_ranges(&[vk::MappedMemoryRange::default()
					.memory(self.block.memory)
					.offset(self.global_offset())
					.size(self.size)])
				.map_err(Into::into)
		}
	}
}

impl Drop for Allocation {
	fn drop(&mut self) { self.block.state.lock().unwrap().free(self.offset); }
}

/// A buffer or image whose memory is being allocated.
#[derive(Copy, Clone)]
pub enum ResourceHandle {
	Buffer(vk::Buffer),
	Image(vk::Image),
}

#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryUsage {
	pub used: u64,
	pub allocated: u64,
}

/// The per-device suballocator. Keyed by memory-type index; fresh blocks are
/// `max(request, 256 MiB)` and carry the requested external-handle type.
pub struct Allocator {
	inner: Arc<AllocatorInner>,
}

impl Allocator {
	pub(crate) fn new(
		instance: &ash::Instance, device: &ash::Device, memory_props: vk::PhysicalDeviceMemoryProperties,
	) -> Self {
		Self {
			inner: Arc::new(AllocatorInner {
				device: device.clone(),
				external: ExternalMemoryApi::new(instance, device),
				memory_props,
				blocks: Mutex::new(rustc_hash::FxHashMap::default()),
			}),
		}
	}

	/// Allocate and bind memory for `resource`.
	///
	/// With `imported`, the foreign handle is duplicated into this process and the resource
	/// is bound at the import's intra-memory offset; the allocation spans the full imported
	/// size. Otherwise existing blocks of the chosen type are searched first-fit and a new
	/// exportable block is created when none fits.
	pub fn allocate(
		&self, resource: ResourceHandle, handle_type: vk::ExternalMemoryHandleTypeFlags, mem_props: MemoryProps,
		imported: Option<&MemoryExportInfo>,
	) -> Result<Allocation> {
		let req = unsafe {
			match resource {
				ResourceHandle::Buffer(buffer) => self.inner.device.get_buffer_memory_requirements(buffer),
				ResourceHandle::Image(image) => self.inner.device.get_image_memory_requirements(image),
			}
		};

		let mut requested = vk::MemoryPropertyFlags::empty();
		if mem_props.vram {
			requested |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
		}
		if mem_props.mapped {
			requested |= vk::MemoryPropertyFlags::HOST_VISIBLE
				| vk::MemoryPropertyFlags::HOST_COHERENT
				| vk::MemoryPropertyFlags::HOST_CACHED;
		}

		if let Some(info) = imported {
			return self.import(resource, req, requested, info);
		}

		let (type_index, actual) = memory_type_index(&self.inner.memory_props, req.memory_type_bits, requested)?;

		// Upgrade outside the registry lock: dropping the last strong reference to a block
		// re-enters the registry to unregister it.
		let candidates: Vec<Arc<MemoryBlock>> = {
			let blocks = self.inner.blocks.lock().unwrap();
			blocks
				.get(&type_index)
				.map(|list| list.iter().filter_map(|(_, block)| block.upgrade()).collect())
				.unwrap_or_default()
		};
		for block in candidates {
			if block.handle_type != handle_type {
				continue;
			}
			if let Some(alloc) = block.allocate(req.size, req.alignment) {
				self.bind(resource, &alloc)?;
				return Ok(alloc);
			}
		}

		let block = self.create_block(type_index, actual, req.size.max(DEFAULT_BLOCK_SIZE), handle_type)?;
		let alloc = block
			.allocate(req.size, req.alignment)
			.ok_or(Error::Message("fresh block cannot fit allocation".into()))?;
		self.inner
			.blocks
			.lock()
			.unwrap()
			.entry(type_index)
			.or_default()
			.push((block.memory, Arc::downgrade(&block)));
		self.bind(resource, &alloc)?;
		Ok(alloc)
	}

	fn bind(&self, resource: ResourceHandle, alloc: &Allocation) -> Result<()> {
		unsafe {
			match resource {
				ResourceHandle::Buffer(buffer) => {
					self.inner
						.device
						.bind_buffer_memory(buffer, alloc.memory(), alloc.global_offset())?
				},
				ResourceHandle::Image(image) => {
					self.inner
						.device
						.bind_image_memory(image, alloc.memory(), alloc.global_offset())?
				},
			}
		}
		Ok(())
	}

	fn import(
		&self, resource: ResourceHandle, req: vk::MemoryRequirements, requested: vk::MemoryPropertyFlags,
		info: &MemoryExportInfo,
	) -> Result<Allocation> {
		if info.size < req.size {
			debug_assert!(false, "imported memory is smaller than the resource requires");
			return Err(Error::InvalidExternalHandle);
		}

		let handle = platform::duplicate_handle(info.pid, info.handle)?;

		// Non-opaque (D3D) handles constrain the usable memory types beyond what the
		// resource reports.
		let mut type_bits = req.memory_type_bits;
		if info.handle_type.as_raw() > vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32_KMT.as_raw() {
			type_bits = self.inner.external.import_type_bits(info.handle_type, handle)?;
		}
		let (type_index, actual) = memory_type_index(&self.inner.memory_props, type_bits, requested)?;

		let allocation_size = if info.allocation_size != 0 {
			info.allocation_size
		} else {
			info.offset + info.size
		};

		#[cfg(windows)]
		let mut import_info = vk::ImportMemoryWin32HandleInfoKHR::default()
			.handle_type(info.handle_type)
			.handle(handle as _);
		#[cfg(unix)]
		let mut import_info = vk::ImportMemoryFdInfoKHR::default().handle_type(info.handle_type).fd(handle);

		let memory = unsafe {
			self.inner.device.allocate_memory(
				&vk::MemoryAllocateInfo::default()
					.allocation_size(allocation_size)
					.memory_type_index(type_index)
					.push_next(&mut import_info),
				None,
			)?
		};

		let block = Arc::new(MemoryBlock {
			allocator: self.inner.clone(),
			memory,
			props: actual,
			type_index,
			handle_type: info.handle_type,
			os_handle: handle,
			imported_from: Some(info.pid),
			mapping: Mutex::new(std::ptr::null_mut()),
			offset: info.offset,
			size: info.size,
			state: Mutex::new(Intervals::new(info.size)),
		});

		let alloc = block
			.allocate(info.size, 1)
			.ok_or(Error::Message("imported block cannot fit allocation".into()))?;
		self.bind(resource, &alloc)?;
		Ok(alloc)
	}

	fn create_block(
		&self, type_index: u32, props: vk::MemoryPropertyFlags, size: u64,
		handle_type: vk::ExternalMemoryHandleTypeFlags,
	) -> Result<Arc<MemoryBlock>> {
		#[cfg(windows)]
		let mut handle_info = vk::ExportMemoryWin32HandleInfoKHR::default().dw_access(GENERIC_ALL);
		let mut export_info = vk::ExportMemoryAllocateInfo::default().handle_types(handle_type);

		let mut info = vk::MemoryAllocateInfo::default()
			.allocation_size(size)
			.memory_type_index(type_index);
		if !handle_type.is_empty() {
			info = info.push_next(&mut export_info);
			#[cfg(windows)]
			{
				info = info.push_next(&mut handle_info);
			}
		}

		let memory = unsafe {
			self.inner.device.allocate_memory(&info, None).map_err(|e| {
				warn!("device memory allocation of {size} bytes failed: {e}");
				Error::from(e)
			})?
		};

		let mapping = if props.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
			unsafe { self.inner.device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty())? as *mut u8 }
		} else {
			std::ptr::null_mut()
		};

		let os_handle = if !handle_type.is_empty() {
			self.inner.external.export_handle(memory, handle_type)?
		} else {
			0
		};

		Ok(Arc::new(MemoryBlock {
			allocator: self.inner.clone(),
			memory,
			props,
			type_index,
			handle_type,
			os_handle,
			imported_from: None,
			mapping: Mutex::new(mapping),
			offset: 0,
			size,
			state: Mutex::new(Intervals::new(size)),
		}))
	}

	pub fn usage(&self) -> MemoryUsage {
		let blocks: Vec<Arc<MemoryBlock>> = {
			let blocks = self.inner.blocks.lock().unwrap();
			blocks
				.values()
				.flatten()
				.filter_map(|(_, block)| block.upgrade())
				.collect()
		};
		let mut usage = MemoryUsage::default();
		for block in blocks {
			usage.used += block.in_use();
			usage.allocated += block.size;
		}
		usage
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn check_invariants(iv: &Intervals) {
		// Disjoint union of chunks and free intervals covers [0, size).
		let mut ranges: Vec<_> = iv
			.free
			.iter()
			.chain(iv.chunks.iter())
			.map(|(&off, &len)| (off, len))
			.collect();
		ranges.sort();
		let mut cursor = 0;
		for (off, len) in ranges {
			assert_eq!(off, cursor, "gap or overlap at {off}");
			cursor = off + len;
		}
		assert_eq!(cursor, iv.size);
		assert_eq!(iv.in_use, iv.chunks.values().sum::<u64>());

		// No two adjacent free intervals survive a free.
		let mut prev: Option<(u64, u64)> = None;
		for (&off, &len) in iv.free.iter() {
			if let Some((poff, plen)) = prev {
				assert!(poff + plen < off, "uncoalesced intervals at {poff}+{plen} and {off}");
			}
			prev = Some((off, len));
		}
	}

	#[test]
	fn coalesces_on_free() {
		let mut iv = Intervals::new(1024);
		let a = iv.allocate(256, 1).unwrap();
		let b = iv.allocate(256, 1).unwrap();
		let c = iv.allocate(256, 1).unwrap();
		assert_eq!((a, b, c), (0, 256, 512));
		check_invariants(&iv);

		iv.free(b);
		check_invariants(&iv);
		iv.free(a);
		check_invariants(&iv);
		assert_eq!(iv.free, BTreeMap::from([(0, 512), (768, 256)]));

		iv.free(c);
		check_invariants(&iv);
		assert_eq!(iv.free, BTreeMap::from([(0, 1024)]));
	}

	#[test]
	fn respects_alignment() {
		let mut iv = Intervals::new(4096);
		let a = iv.allocate(10, 1).unwrap();
		let b = iv.allocate(100, 256).unwrap();
		assert_eq!(a, 0);
		assert_eq!(b % 256, 0);
		check_invariants(&iv);

		// The padding before the aligned chunk stays free.
		assert!(iv.free.contains_key(&10));

		let c = iv.allocate(6, 2).unwrap();
		assert_eq!(c % 2, 0);
		assert!(c >= 10 && c + 6 <= 256);
		check_invariants(&iv);
	}

	#[test]
	fn rejects_what_cannot_fit() {
		let mut iv = Intervals::new(128);
		assert!(iv.allocate(256, 1).is_none());
		let a = iv.allocate(100, 1).unwrap();
		assert!(iv.allocate(64, 1).is_none());
		// An interval large enough unaligned but too small aligned is skipped.
		assert!(iv.allocate(28, 64).is_none());
		iv.free(a);
		assert!(iv.allocate(128, 1).is_some());
		check_invariants(&iv);
	}

	#[test]
	fn free_is_idempotent_on_unknown_offsets() {
		let mut iv = Intervals::new(64);
		iv.free(32);
		check_invariants(&iv);
		assert_eq!(iv.free, BTreeMap::from([(0, 64)]));
	}

	#[test]
	fn interleaved_churn_keeps_invariants() {
		let mut iv = Intervals::new(1 << 16);
		let mut live = Vec::new();
		for round in 0..64u64 {
			for i in 0..8 {
				if let Some(off) = iv.allocate(64 + (round * 37 + i * 13) % 512, 1 << (i % 5)) {
					live.push(off);
				}
			}
			check_invariants(&iv);
			// Free every other allocation, oldest first.
			let mut idx = 0;
			live.retain(|&off| {
				idx += 1;
				if idx % 2 == 0 {
					iv.free(off);
					false
				} else {
					true
				}
			});
			check_invariants(&iv);
		}
		for off in live {
			iv.free(off);
		}
		check_invariants(&iv);
		assert_eq!(iv.free, BTreeMap::from([(0, 1 << 16)]));
	}

	#[test]
	fn memory_type_selection_prefers_most_matched_bits() {
		let mut props = vk::PhysicalDeviceMemoryProperties::default();
		props.memory_type_count = 3;
		props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
		props.memory_types[1].property_flags =
			vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
		props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
			| vk::MemoryPropertyFlags::HOST_COHERENT
			| vk::MemoryPropertyFlags::HOST_CACHED;

		let requested = vk::MemoryPropertyFlags::HOST_VISIBLE
			| vk::MemoryPropertyFlags::HOST_COHERENT
			| vk::MemoryPropertyFlags::HOST_CACHED;
		let (index, _) = memory_type_index(&props, 0b111, requested).unwrap();
		assert_eq!(index, 2);

		// Ties break to the lowest index.
		let (index, _) = memory_type_index(&props, 0b110, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
		assert_eq!(index, 1);

		// A mask excluding every candidate is unsupported.
		assert!(memory_type_index(&props, 0, requested).is_err());
	}
}
