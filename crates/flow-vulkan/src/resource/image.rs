//! Images that track their own layout/stage/access state and cache their views.

use std::sync::{Arc, Mutex};

use ash::vk;
use rustc_hash::FxHashMap;
use tracing::error;

use crate::{
	alloc::{Allocation, ResourceHandle},
	cmd::CommandBuffer,
	device::{Device, Features},
	interop::{MemoryExportInfo, MemoryProps},
	resource::{self, is_ycbcr, Buffer, BufferCreateInfo},
	Result,
};

/// The pipeline-stage/access/layout tracking advanced by [`Image::transition`].
///
/// Not thread safe by contract: concurrent users of one image must synchronise externally.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageState {
	pub stage_mask: vk::PipelineStageFlags2,
	pub access_mask: vk::AccessFlags2,
	pub layout: vk::ImageLayout,
}

#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
	pub extent: vk::Extent2D,
	pub format: vk::Format,
	pub usage: vk::ImageUsageFlags,
	pub samples: vk::SampleCountFlags,
	pub tiling: vk::ImageTiling,
	pub flags: vk::ImageCreateFlags,
	pub external_handle_type: vk::ExternalMemoryHandleTypeFlags,
	pub imported: Option<MemoryExportInfo>,
}

impl Default for ImageCreateInfo {
	fn default() -> Self {
		Self {
			extent: vk::Extent2D::default(),
			format: vk::Format::UNDEFINED,
			usage: vk::ImageUsageFlags::empty(),
			samples: vk::SampleCountFlags::TYPE_1,
			tiling: vk::ImageTiling::OPTIMAL,
			flags: vk::ImageCreateFlags::ALIAS,
			external_handle_type: resource::default_handle_type(),
			imported: None,
		}
	}
}

/// The fields that determine an image's physical layout, for pooled reuse.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ImagePoolKey {
	pub extent: (u32, u32),
	pub format: vk::Format,
	pub usage: vk::ImageUsageFlags,
	pub samples: vk::SampleCountFlags,
	pub tiling: vk::ImageTiling,
	pub flags: vk::ImageCreateFlags,
	pub external_handle_type: vk::ExternalMemoryHandleTypeFlags,
}

impl ImageCreateInfo {
	pub fn pool_key(&self) -> ImagePoolKey {
		ImagePoolKey {
			extent: (self.extent.width, self.extent.height),
			format: self.format,
			usage: self.usage,
			samples: self.samples,
			tiling: self.tiling,
			flags: self.flags,
			external_handle_type: self.external_handle_type,
		}
	}
}

pub struct Image {
	device: ash::Device,
	features: Features,
	handle: vk::Image,
	allocation: Option<Allocation>,
	size: u64,
	extent: vk::Extent2D,
	format: vk::Format,
	usage: vk::ImageUsageFlags,
	samples: vk::SampleCountFlags,
	owned: bool,
	state: Mutex<ImageState>,
	views: Mutex<FxHashMap<u64, Arc<ImageView>>>,
}

impl Image {
	pub fn new(device: &Device, info: ImageCreateInfo) -> Result<Arc<Self>> {
		let effective_format = if is_ycbcr(info.format) {
			vk::Format::R8G8B8A8_UNORM
		} else {
			info.format
		};
		let effective_width = info.extent.width / (1 + is_ycbcr(info.format) as u32);

		// Downgrade to linear tiling when the format cannot serve a requested usage
		// optimally.
		let mut tiling = info.tiling;
		if tiling == vk::ImageTiling::OPTIMAL {
			let props = unsafe {
				device
					.instance()
					.get_physical_device_format_properties(device.physical_device(), effective_format)
			};
			let ft = props.optimal_tiling_features;
			let lacking = |usage: vk::ImageUsageFlags, feature: vk::FormatFeatureFlags| {
				info.usage.contains(usage) && !ft.contains(feature)
			};
			if lacking(vk::ImageUsageFlags::SAMPLED, vk::FormatFeatureFlags::SAMPLED_IMAGE)
				|| lacking(vk::ImageUsageFlags::TRANSFER_SRC, vk::FormatFeatureFlags::TRANSFER_SRC)
				|| lacking(vk::ImageUsageFlags::TRANSFER_DST, vk::FormatFeatureFlags::TRANSFER_DST)
				|| lacking(vk::ImageUsageFlags::STORAGE, vk::FormatFeatureFlags::STORAGE_IMAGE)
				|| lacking(vk::ImageUsageFlags::COLOR_ATTACHMENT, vk::FormatFeatureFlags::COLOR_ATTACHMENT)
				|| lacking(
					vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
					vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
				) {
				tiling = vk::ImageTiling::LINEAR;
			}
		}

		let mut external_info =
			vk::ExternalMemoryImageCreateInfo::default().handle_types(info.external_handle_type);
		let mut create_info = vk::ImageCreateInfo::default()
			.flags(info.flags)
			.image_type(vk::ImageType::TYPE_2D)
			.format(effective_format)
			.extent(vk::Extent3D {
				width: effective_width,
				height: info.extent.height,
				depth: 1,
			})
			.mip_levels(1)
			.array_layers(1)
			.samples(info.samples)
			.tiling(tiling)
			.usage(info.usage)
			.sharing_mode(vk::SharingMode::EXCLUSIVE)
			.initial_layout(vk::ImageLayout::UNDEFINED);
		if !info.external_handle_type.is_empty() {
			create_info = create_info.push_next(&mut external_info);
		}

		let handle = unsafe { device.device().create_image(&create_info, None)? };
		let allocation = device
			.allocator()
			.allocate(
				ResourceHandle::Image(handle),
				info.external_handle_type,
				MemoryProps {
					vram: true,
					..MemoryProps::default()
				},
				info.imported.as_ref(),
			)
			.inspect_err(|_| unsafe { device.device().destroy_image(handle, None) })?;

		let layout = if info.imported.is_some() {
			vk::ImageLayout::PREINITIALIZED
		} else {
			vk::ImageLayout::UNDEFINED
		};

		Ok(Arc::new(Self {
			device: device.device().clone(),
			features: device.features(),
			handle,
			size: allocation.size(),
			allocation: Some(allocation),
			extent: info.extent,
			format: info.format,
			usage: info.usage,
			samples: info.samples,
			owned: true,
			state: Mutex::new(ImageState {
				stage_mask: vk::PipelineStageFlags2::NONE,
				access_mask: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
				layout,
			}),
			views: Mutex::new(FxHashMap::default()),
		}))
	}

	/// Wrap an image owned elsewhere (e.g. a swapchain image).
	pub fn wrap(device: &Device, handle: vk::Image, extent: vk::Extent2D, format: vk::Format) -> Arc<Self> {
		Arc::new(Self {
			device: device.device().clone(),
			features: device.features(),
			handle,
			allocation: None,
			size: 0,
			extent,
			format,
			usage: vk::ImageUsageFlags::empty(),
			samples: vk::SampleCountFlags::TYPE_1,
			owned: false,
			state: Mutex::new(ImageState {
				stage_mask: vk::PipelineStageFlags2::NONE,
				access_mask: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
				layout: vk::ImageLayout::UNDEFINED,
			}),
			views: Mutex::new(FxHashMap::default()),
		})
	}

	pub fn handle(&self) -> vk::Image { self.handle }

	pub fn size(&self) -> u64 { self.size }

	pub fn extent(&self) -> vk::Extent2D { self.extent }

	pub fn format(&self) -> vk::Format { self.format }

	pub fn usage(&self) -> vk::ImageUsageFlags { self.usage }

	pub fn samples(&self) -> vk::SampleCountFlags { self.samples }

	pub fn state(&self) -> ImageState { *self.state.lock().unwrap() }

	pub fn effective_format(&self) -> vk::Format {
		if is_ycbcr(self.format) {
			vk::Format::R8G8B8A8_UNORM
		} else {
			self.format
		}
	}

	pub fn effective_extent(&self) -> vk::Extent2D {
		vk::Extent2D {
			width: self.extent.width / (1 + is_ycbcr(self.format) as u32),
			height: self.extent.height,
		}
	}

	pub fn aspect(&self) -> vk::ImageAspectFlags {
		if self.format == vk::Format::D32_SFLOAT {
			vk::ImageAspectFlags::DEPTH
		} else {
			vk::ImageAspectFlags::COLOR
		}
	}

	pub fn export_info(&self) -> MemoryExportInfo {
		match &self.allocation {
			Some(alloc) => resource::export_info(
				alloc,
				self.size,
				MemoryProps {
					vram: true,
					..MemoryProps::default()
				},
			),
			None => MemoryExportInfo::default(),
		}
	}

	/// Move the image into `dst`, recording the matching barrier. The image stays alive
	/// until `cmd` completes.
	pub fn transition(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, dst: ImageState) {
		let mut state = self.state.lock().unwrap();
		let src = *state;
		unsafe {
			if self.features.sync2 {
				let barrier = vk::ImageMemoryBarrier2::default()
					.src_stage_mask(src.stage_mask)
					.src_access_mask(src.access_mask)
					.dst_stage_mask(dst.stage_mask)
					.dst_access_mask(dst.access_mask)
					.old_layout(src.layout)
					.new_layout(dst.layout)
					.src_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
					.dst_queue_family_index(cmd.queue_family())
					.image(self.handle)
					.subresource_range(subresource_range(self.aspect()));
				self.device.cmd_pipeline_barrier2(
					cmd.handle(),
					&vk::DependencyInfo::default()
						.dependency_flags(vk::DependencyFlags::DEVICE_GROUP)
						.image_memory_barriers(std::slice::from_ref(&barrier)),
				);
			} else {
				// Sync1 stage/access bits are the low words of their sync2 counterparts.
				self.device.cmd_pipeline_barrier(
					cmd.handle(),
					vk::PipelineStageFlags::from_raw(src.stage_mask.as_raw() as u32),
					vk::PipelineStageFlags::from_raw(dst.stage_mask.as_raw() as u32),
					vk::DependencyFlags::DEVICE_GROUP,
					&[],
					&[],
					&[vk::ImageMemoryBarrier::default()
						.old_layout(src.layout)
						.new_layout(dst.layout)
						.src_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
						.dst_queue_family_index(cmd.queue_family())
						.image(self.handle)
						.subresource_range(subresource_range(self.aspect()))],
				);
			}
		}
		*state = dst;
		drop(state);
		cmd.add_dependency(self.clone());
	}

	pub fn clear(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, value: vk::ClearColorValue) {
		assert!(self.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
		self.transition(cmd, transfer_dst_state());
		unsafe {
			self.device.cmd_clear_color_image(
				cmd.handle(),
				self.handle,
				vk::ImageLayout::TRANSFER_DST_OPTIMAL,
				&value,
				&[subresource_range(self.aspect())],
			);
		}
	}

	/// Copy buffer contents into the image.
	pub fn upload(
		self: &Arc<Self>, cmd: &Arc<CommandBuffer>, src: &Arc<Buffer>, buffer_row_length: u32,
		buffer_image_height: u32,
	) {
		assert!(self.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
		assert!(src.usage().contains(vk::BufferUsageFlags::TRANSFER_SRC));

		cmd.add_dependency(src.clone());
		self.transition(cmd, transfer_dst_state());

		let region = vk::BufferImageCopy {
			buffer_row_length,
			buffer_image_height,
			image_subresource: subresource_layers(self.aspect()),
			image_extent: vk::Extent3D {
				width: self.effective_extent().width,
				height: self.extent.height,
				depth: 1,
			},
			..Default::default()
		};
		unsafe {
			self.device.cmd_copy_buffer_to_image(
				cmd.handle(),
				src.handle(),
				self.handle,
				vk::ImageLayout::TRANSFER_DST_OPTIMAL,
				&[region],
			);
		}
	}

	/// Copy into a fresh image with the same shape.
	pub fn copy(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, device: &Device) -> Result<Arc<Image>> {
		assert!(self.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
		let img = Image::new(
			device,
			ImageCreateInfo {
				extent: self.extent,
				format: self.format,
				usage: self.usage | vk::ImageUsageFlags::TRANSFER_DST,
				..ImageCreateInfo::default()
			},
		)?;
		img.copy_from(cmd, self);
		Ok(img)
	}

	pub fn copy_from(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, src: &Arc<Image>) {
		if Arc::ptr_eq(self, src) {
			error!("copy source and destination are the same image");
			return;
		}
		assert!(
			(self.extent.width == src.extent.width && self.extent.height == src.extent.height) || self.size >= src.size
		);

		src.transition(cmd, transfer_src_state());
		self.transition(cmd, transfer_dst_state());

		let region = vk::ImageCopy {
			src_subresource: subresource_layers(src.aspect()),
			dst_subresource: subresource_layers(self.aspect()),
			extent: vk::Extent3D {
				width: self.effective_extent().width,
				height: self.extent.height,
				depth: 1,
			},
			..Default::default()
		};
		unsafe {
			self.device.cmd_copy_image(
				cmd.handle(),
				src.handle,
				vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
				self.handle,
				vk::ImageLayout::TRANSFER_DST_OPTIMAL,
				&[region],
			);
		}
	}

	pub fn blit_from(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, src: &Arc<Image>, filter: vk::Filter) {
		if Arc::ptr_eq(self, src) {
			error!("blit source and destination are the same image");
			return;
		}

		src.transition(cmd, transfer_src_state());
		self.transition(cmd, transfer_dst_state());

		let src_extent = src.effective_extent();
		let dst_extent = self.effective_extent();
		let src_offsets = [
			vk::Offset3D::default(),
			vk::Offset3D {
				x: src_extent.width as i32,
				y: src_extent.height as i32,
				z: 1,
			},
		];
		let dst_offsets = [
			vk::Offset3D::default(),
			vk::Offset3D {
				x: dst_extent.width as i32,
				y: dst_extent.height as i32,
				z: 1,
			},
		];

		unsafe {
			if self.features.sync2 {
				let region = vk::ImageBlit2::default()
					.src_subresource(subresource_layers(vk::ImageAspectFlags::COLOR))
					.src_offsets(src_offsets)
					.dst_subresource(subresource_layers(vk::ImageAspectFlags::COLOR))
					.dst_offsets(dst_offsets);
				self.device.cmd_blit_image2(
					cmd.handle(),
					&vk::BlitImageInfo2::default()
						.src_image(src.handle)
						.src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
						.dst_image(self.handle)
						.dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
						.regions(std::slice::from_ref(&region))
						.filter(filter),
				);
			} else {
				let region = vk::ImageBlit {
					src_subresource: subresource_layers(src.aspect()),
					src_offsets,
					dst_subresource: subresource_layers(self.aspect()),
					dst_offsets,
				};
				self.device.cmd_blit_image(
					cmd.handle(),
					src.handle,
					vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
					self.handle,
					vk::ImageLayout::TRANSFER_DST_OPTIMAL,
					&[region],
					filter,
				);
			}
		}
	}

	pub fn resolve_from(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, src: &Arc<Image>) {
		assert!(self.extent.width == src.extent.width && self.extent.height == src.extent.height);

		src.transition(cmd, transfer_src_state());
		self.transition(cmd, transfer_dst_state());

		let region = vk::ImageResolve2::default()
			.src_subresource(subresource_layers(src.aspect()))
			.dst_subresource(subresource_layers(self.aspect()))
			.extent(vk::Extent3D {
				width: self.effective_extent().width,
				height: self.extent.height,
				depth: 1,
			});
		unsafe {
			self.device.cmd_resolve_image2(
				cmd.handle(),
				&vk::ResolveImageInfo2::default()
					.src_image(src.handle)
					.src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
					.dst_image(self.handle)
					.dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
					.regions(std::slice::from_ref(&region)),
			);
		}
	}

	/// Read the image back into a fresh mapped buffer.
	pub fn download(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, device: &Device) -> Result<Arc<Buffer>> {
		let staging = Buffer::new(
			device,
			BufferCreateInfo {
				size: self.size,
				usage: vk::BufferUsageFlags::TRANSFER_DST,
				mem_props: MemoryProps {
					mapped: true,
					download: true,
					..MemoryProps::default()
				},
				..BufferCreateInfo::default()
			},
		)?;
		self.download_into(cmd, &staging);
		Ok(staging)
	}

	pub fn download_into(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, buffer: &Arc<Buffer>) {
		assert!(self.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
		self.transition(cmd, transfer_src_state());

		let region = vk::BufferImageCopy {
			image_subresource: subresource_layers(self.aspect()),
			image_extent: vk::Extent3D {
				width: self.effective_extent().width,
				height: self.extent.height,
				depth: 1,
			},
			..Default::default()
		};
		unsafe {
			self.device.cmd_copy_image_to_buffer(
				cmd.handle(),
				self.handle,
				vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
				buffer.handle(),
				&[region],
			);
		}
		cmd.add_dependency(self.clone());
		cmd.add_dependency(buffer.clone());
	}

	/// The view for `(format, usage)`, both defaulting to the image's own; cached.
	pub fn view(self: &Arc<Self>, format: vk::Format, usage: vk::ImageUsageFlags) -> Result<Arc<ImageView>> {
		let format = if format == vk::Format::UNDEFINED { self.format } else { format };
		let usage = if usage.is_empty() { self.usage } else { usage };
		let hash = ((format.as_raw() as u64) << 32) | usage.as_raw() as u64;

		let mut views = self.views.lock().unwrap();
		if let Some(view) = views.get(&hash) {
			return Ok(view.clone());
		}
		let view = ImageView::new(self, format, usage)?;
		views.insert(hash, view.clone());
		Ok(view)
	}

	pub fn view_for_usage(self: &Arc<Self>, usage: vk::ImageUsageFlags) -> Result<Arc<ImageView>> {
		self.view(self.format, usage)
	}
}

impl crate::cmd::CmdDependency for Image {
	// Once the commands retire, the image may be touched by anything next.
	fn on_complete(&self) {
		let mut state = self.state.lock().unwrap();
		state.access_mask = vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE;
		state.stage_mask = vk::PipelineStageFlags2::ALL_COMMANDS;
	}
}

impl Drop for Image {
	fn drop(&mut self) {
		self.views.get_mut().unwrap().clear();
		if self.owned {
			unsafe {
				self.device.destroy_image(self.handle, None);
			}
		}
	}
}

pub struct ImageView {
	device: ash::Device,
	handle: vk::ImageView,
	format: vk::Format,
	usage: vk::ImageUsageFlags,
	image: vk::Image,
	effective_extent: vk::Extent2D,
}

impl ImageView {
	fn new(image: &Arc<Image>, format: vk::Format, usage: vk::ImageUsageFlags) -> Result<Arc<Self>> {
		let mut usage_info = vk::ImageViewUsageCreateInfo::default().usage(usage);
		let info = vk::ImageViewCreateInfo::default()
			.image(image.handle)
			.view_type(vk::ImageViewType::TYPE_2D)
			.format(if is_ycbcr(format) { vk::Format::R8G8B8A8_UNORM } else { format })
			.subresource_range(subresource_range(image.aspect()))
			.push_next(&mut usage_info);

		let handle = unsafe { image.device.create_image_view(&info, None)? };
		Ok(Arc::new(Self {
			device: image.device.clone(),
			handle,
			format,
			usage,
			image: image.handle,
			effective_extent: image.effective_extent(),
		}))
	}

	pub fn handle(&self) -> vk::ImageView { self.handle }

	pub fn format(&self) -> vk::Format { self.format }

	pub fn effective_format(&self) -> vk::Format {
		if is_ycbcr(self.format) {
			vk::Format::R8G8B8A8_UNORM
		} else {
			self.format
		}
	}

	pub fn usage(&self) -> vk::ImageUsageFlags { self.usage }

	pub fn image(&self) -> vk::Image { self.image }

	pub fn effective_extent(&self) -> vk::Extent2D { self.effective_extent }

	pub fn hash_key(&self) -> u64 { ((self.format.as_raw() as u64) << 32) | self.usage.as_raw() as u64 }

	pub fn descriptor_info(&self, device: &Device, filter: vk::Filter) -> Result<vk::DescriptorImageInfo> {
		Ok(vk::DescriptorImageInfo {
			sampler: device.sampler(filter)?,
			image_view: self.handle,
			image_layout: vk::ImageLayout::GENERAL,
		})
	}
}

impl crate::cmd::CmdDependency for ImageView {}

impl Drop for ImageView {
	fn drop(&mut self) {
		unsafe {
			self.device.destroy_image_view(self.handle, None);
		}
	}
}

fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
	vk::ImageSubresourceRange {
		aspect_mask: aspect,
		base_mip_level: 0,
		level_count: 1,
		base_array_layer: 0,
		layer_count: 1,
	}
}

fn subresource_layers(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
	vk::ImageSubresourceLayers {
		aspect_mask: aspect,
		mip_level: 0,
		base_array_layer: 0,
		layer_count: 1,
	}
}

pub(crate) fn transfer_src_state() -> ImageState {
	ImageState {
		stage_mask: vk::PipelineStageFlags2::TRANSFER,
		access_mask: vk::AccessFlags2::TRANSFER_READ,
		layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
	}
}

pub(crate) fn transfer_dst_state() -> ImageState {
	ImageState {
		stage_mask: vk::PipelineStageFlags2::TRANSFER,
		access_mask: vk::AccessFlags2::TRANSFER_WRITE,
		layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
	}
}
