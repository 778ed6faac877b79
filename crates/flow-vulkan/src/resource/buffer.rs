//! Buffers with host mapping, barrier tracking, and cross-process export.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::{
	alloc::{Allocation, ResourceHandle},
	cmd::CommandBuffer,
	device::{Device, Features},
	interop::{MemoryExportInfo, MemoryProps},
	resource,
	Result,
};

#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
	pub size: u64,
	pub usage: vk::BufferUsageFlags,
	pub mem_props: MemoryProps,
	pub external_handle_type: vk::ExternalMemoryHandleTypeFlags,
	pub imported: Option<MemoryExportInfo>,
	/// An opaque element-type tag checked against reflection at bind time.
	pub element_type: u32,
}

impl Default for BufferCreateInfo {
	fn default() -> Self {
		Self {
			size: 0,
			usage: vk::BufferUsageFlags::empty(),
			mem_props: MemoryProps::default(),
			external_handle_type: resource::default_handle_type(),
			imported: None,
			element_type: 0,
		}
	}
}

/// The fields that determine a buffer's physical layout, for pooled reuse.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BufferPoolKey {
	pub size: u64,
	pub mapped: bool,
	pub vram: bool,
	pub download: bool,
	pub usage: vk::BufferUsageFlags,
	pub external_handle_type: vk::ExternalMemoryHandleTypeFlags,
}

impl BufferCreateInfo {
	pub fn pool_key(&self) -> BufferPoolKey {
		BufferPoolKey {
			size: self.size,
			mapped: self.mem_props.mapped,
			vram: self.mem_props.vram,
			download: self.mem_props.download,
			usage: self.usage,
			external_handle_type: self.external_handle_type,
		}
	}
}

/// Pipeline-stage/access tracking for buffer barriers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferMemoryState {
	pub stage_mask: vk::PipelineStageFlags2,
	pub access_mask: vk::AccessFlags2,
}

pub struct Buffer {
	device: ash::Device,
	features: Features,
	handle: vk::Buffer,
	allocation: Option<Allocation>,
	size: u64,
	usage: vk::BufferUsageFlags,
	mem_props: MemoryProps,
	element_type: u32,
	state: Mutex<BufferMemoryState>,
}

impl Buffer {
	pub fn new(device: &Device, info: BufferCreateInfo) -> Result<Arc<Self>> {
		let mut external_info =
			vk::ExternalMemoryBufferCreateInfo::default().handle_types(info.external_handle_type);
		let mut create_info = vk::BufferCreateInfo::default().size(info.size).usage(info.usage);
		if !info.external_handle_type.is_empty() {
			create_info = create_info.push_next(&mut external_info);
		}

		let handle = unsafe { device.device().create_buffer(&create_info, None)? };
		let allocation = device
			.allocator()
			.allocate(
				ResourceHandle::Buffer(handle),
				info.external_handle_type,
				info.mem_props,
				info.imported.as_ref(),
			)
			.inspect_err(|_| unsafe { device.device().destroy_buffer(handle, None) })?;

		Ok(Arc::new(Self {
			device: device.device().clone(),
			features: device.features(),
			handle,
			size: allocation.size(),
			allocation: Some(allocation),
			usage: info.usage,
			mem_props: info.mem_props,
			element_type: info.element_type,
			state: Mutex::new(BufferMemoryState::default()),
		}))
	}

	pub fn handle(&self) -> vk::Buffer { self.handle }

	pub fn size(&self) -> u64 { self.size }

	pub fn usage(&self) -> vk::BufferUsageFlags { self.usage }

	pub fn element_type(&self) -> u32 { self.element_type }

	pub fn mem_props(&self) -> MemoryProps { self.mem_props }

	pub fn allocation(&self) -> Option<&Allocation> { self.allocation.as_ref() }

	pub fn export_info(&self) -> MemoryExportInfo {
		match &self.allocation {
			Some(alloc) => resource::export_info(alloc, self.size, self.mem_props),
			None => MemoryExportInfo::default(),
		}
	}

	/// Host pointer to the buffer contents. Imported-only allocations are map-bound on
	/// demand.
	pub fn map(&self) -> Result<*mut u8> {
		self.allocation
			.as_ref()
			.ok_or(crate::Error::Message("buffer has no allocation".into()))?
			.map()
	}

	/// Write into the mapped range at `offset`.
	pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
		assert!(offset + data.len() as u64 <= self.size);
		let ptr = self.map()?;
		unsafe {
			std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
		}
		Ok(())
	}

	/// Record a copy from `src`, keeping both buffers alive until the commands retire.
	pub fn upload(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, src: &Arc<Buffer>, region: Option<vk::BufferCopy>) {
		assert!(self.usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
		assert!(src.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));

		let region = region.unwrap_or(vk::BufferCopy {
			src_offset: 0,
			dst_offset: 0,
			size: src.size,
		});

		unsafe {
			self.device.cmd_pipeline_barrier(
				cmd.handle(),
				vk::PipelineStageFlags::ALL_COMMANDS,
				vk::PipelineStageFlags::ALL_COMMANDS,
				vk::DependencyFlags::empty(),
				&[],
				&[vk::BufferMemoryBarrier::default().buffer(self.handle).size(region.size)],
				&[],
			);
			self.device.cmd_copy_buffer(cmd.handle(), src.handle, self.handle, &[region]);
		}

		cmd.add_dependency(src.clone());
		cmd.add_dependency(self.clone());
	}

	/// Insert a barrier moving `range` of the buffer into `dst`, and track the new state.
	pub fn transition(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, dst: BufferMemoryState, offset: u64, size: u64) {
		let mut state = self.state.lock().unwrap();
		unsafe {
			if self.features.sync2 {
				let barrier = vk::BufferMemoryBarrier2::default()
					.src_stage_mask(state.stage_mask)
					.src_access_mask(state.access_mask)
					.dst_stage_mask(dst.stage_mask)
					.dst_access_mask(dst.access_mask)
					.buffer(self.handle)
					.offset(offset)
					.size(size);
				self.device.cmd_pipeline_barrier2(
					cmd.handle(),
					&vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier)),
				);
			} else {
				// Sync1 stage/access bits are the low words of their sync2 counterparts.
				self.device.cmd_pipeline_barrier(
					cmd.handle(),
					vk::PipelineStageFlags::from_raw(state.stage_mask.as_raw() as u32),
					vk::PipelineStageFlags::from_raw(dst.stage_mask.as_raw() as u32),
					vk::DependencyFlags::empty(),
					&[],
					&[vk::BufferMemoryBarrier::default()
						.src_access_mask(vk::AccessFlags::from_raw(state.access_mask.as_raw() as u32))
						.dst_access_mask(vk::AccessFlags::from_raw(dst.access_mask.as_raw() as u32))
						.buffer(self.handle)
						.offset(offset)
						.size(size)],
					&[],
				);
			}
		}
		*state = dst;
		cmd.add_dependency(self.clone());
	}

	pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
		vk::DescriptorBufferInfo {
			buffer: self.handle,
			offset: 0,
			range: vk::WHOLE_SIZE,
		}
	}
}

impl crate::cmd::CmdDependency for Buffer {}

impl Drop for Buffer {
	fn drop(&mut self) {
		unsafe {
			self.device.destroy_buffer(self.handle, None);
		}
		// The allocation drops afterwards, releasing its chunk (and possibly its block).
	}
}
