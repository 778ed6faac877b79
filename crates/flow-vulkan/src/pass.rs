//! Passes: bind resources by name, transition inputs, execute, refresh the uniform buffer.

use std::{
	collections::BTreeMap,
	ops::Deref,
	sync::{Arc, Mutex},
};

use ash::vk;
use tracing::warn;

use crate::{
	cmd::{CmdDependency, CommandBuffer},
	descriptor::{self, Binding, DescriptorPool},
	device::Device,
	pipeline::{self, ComputePipeline, GraphicsPipeline, PassPipeline},
	resource::{Buffer, BufferCreateInfo, Image, ImageCreateInfo, ImageState},
	shader::{BindingIndex, SvType},
	Error, Result,
};

/// An indexed mesh to draw instead of the fullscreen pair.
pub struct VertexData {
	pub buffer: Arc<Buffer>,
	pub vertex_offset: u64,
	pub index_offset: u64,
	pub num_indices: u64,
	pub depth_write: bool,
	pub depth_test: bool,
	pub depth_func: vk::CompareOp,
}

pub struct DepthAttachment {
	pub buffer: Arc<Image>,
	pub clear: bool,
	pub clear_value: f32,
}

pub struct BeginPassInfo {
	pub out_image: Arc<Image>,
	pub depth: Option<DepthAttachment>,
	pub wireframe: bool,
	pub clear: bool,
	pub frame_number: u64,
	pub delta_seconds: f32,
	pub clear_color: [f32; 4],
}

impl BeginPassInfo {
	pub fn new(out_image: Arc<Image>) -> Self {
		Self {
			out_image,
			depth: None,
			wireframe: false,
			clear: true,
			frame_number: 0,
			delta_seconds: 0.0,
			clear_color: [0.0; 4],
		}
	}
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum UniformClass {
	ImageArray,
	Image,
	Buffer,
	Uniform,
}

struct ResolvedBinding {
	idx: BindingIndex,
	descriptor_type: vk::DescriptorType,
	ssbo: bool,
	access: crate::shader::Access,
	/// The type of the named thing: the binding's type, or a member's for member names.
	ty: Arc<SvType>,
	/// The whole binding's type.
	binding_ty: Arc<SvType>,
}

struct UniformState {
	buffer: Option<Arc<Buffer>>,
	dirty: bool,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::NoUninit)]
struct PassConstants {
	extent: [u32; 2],
	frame_number: u64,
	delta_seconds: f32,
	_pad: u32,
}

/// Shared machinery of render and compute passes: a pipeline, a descriptor pool, the
/// coalesced uniform buffer, per-binding storage buffers, and the staged bindings.
pub struct Basepass {
	device: Device,
	pipeline: PassPipeline,
	pool: Arc<DescriptorPool>,
	uniform: Mutex<UniformState>,
	storage: Mutex<BTreeMap<(u32, u32), (Arc<Buffer>, bool)>>,
	bindings: Mutex<BTreeMap<u32, BTreeMap<(u32, u32), Binding>>>,
}

impl Basepass {
	pub fn new(device: &Device, pipeline: PassPipeline) -> Result<Self> {
		let pool = pipeline.layout().create_pool()?;

		let uniform = if pipeline.layout().uniform_size() > 0 {
			Some(Self::create_uniform_buffer(device, pipeline.layout().uniform_size())?)
		} else {
			None
		};

		let mut storage = BTreeMap::new();
		for (&key, &size) in pipeline.layout().ssbo_sizes().iter() {
			storage.insert(key, (Self::create_storage_buffer(device, size.max(16) as u64)?, false));
		}

		Ok(Self {
			device: device.clone(),
			pipeline,
			pool,
			uniform: Mutex::new(UniformState {
				buffer: uniform,
				dirty: false,
			}),
			storage: Mutex::new(storage),
			bindings: Mutex::new(BTreeMap::new()),
		})
	}

	fn create_uniform_buffer(device: &Device, size: u32) -> Result<Arc<Buffer>> {
		Buffer::new(
			device,
			BufferCreateInfo {
				size: size as u64,
				usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
				mem_props: crate::interop::MemoryProps {
					mapped: true,
					..Default::default()
				},
				..Default::default()
			},
		)
	}

	fn create_storage_buffer(device: &Device, size: u64) -> Result<Arc<Buffer>> {
		Buffer::new(
			device,
			BufferCreateInfo {
				size,
				usage: vk::BufferUsageFlags::STORAGE_BUFFER,
				mem_props: crate::interop::MemoryProps {
					mapped: true,
					..Default::default()
				},
				..Default::default()
			},
		)
	}

	pub fn device(&self) -> &Device { &self.device }

	pub fn pipeline(&self) -> &PassPipeline { &self.pipeline }

	/// The pipeline stage this pass's shader runs in.
	pub fn stage(&self) -> vk::PipelineStageFlags2 {
		let mut stage = vk::PipelineStageFlags2::NONE;
		let shader = self.pipeline.main_stage();
		if shader.contains(vk::ShaderStageFlags::FRAGMENT) {
			stage |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
		}
		if shader.contains(vk::ShaderStageFlags::COMPUTE) {
			stage |= vk::PipelineStageFlags2::COMPUTE_SHADER;
		}
		stage
	}

	fn resolve(&self, name: &str) -> Option<ResolvedBinding> {
		let layout = self.pipeline.layout();
		let idx = layout.index(name)?;
		let nb = layout.binding(idx)?;
		let ty = if nb.name != name {
			nb.ty.member(name)?.ty.clone()
		} else {
			nb.ty.clone()
		};
		Some(ResolvedBinding {
			idx,
			descriptor_type: nb.descriptor_type,
			ssbo: nb.ssbo(),
			access: nb.access,
			ty,
			binding_ty: nb.ty.clone(),
		})
	}

	fn uniform_class(&self, resolved: &ResolvedBinding) -> UniformClass {
		if resolved.ssbo {
			return UniformClass::Buffer;
		}
		if resolved.ty.is_image() {
			if resolved.ty.array_len != 0 {
				return UniformClass::ImageArray;
			}
			return UniformClass::Image;
		}
		UniformClass::Uniform
	}

	fn stage_binding(&self, set: u32, binding: Binding) {
		self.bindings
			.lock()
			.unwrap()
			.entry(set)
			.or_default()
			.insert(binding.key(), binding);
	}

	/// Bind an image to `name`, sampled through `filter`.
	pub fn bind_image(&self, name: &str, image: &Arc<Image>, filter: vk::Filter) {
		let Some(resolved) = self.resolve(name) else {
			warn!("no binding named `{name}`");
			return;
		};
		debug_assert_eq!(self.uniform_class(&resolved), UniformClass::Image);
		self.stage_binding(resolved.idx.set, Binding::image(image.clone(), resolved.idx.binding, filter, 0));
	}

	/// Bind an array of images to `name`.
	pub fn bind_images(&self, name: &str, images: &[(Arc<Image>, vk::Filter)]) {
		let Some(resolved) = self.resolve(name) else {
			warn!("no binding named `{name}`");
			return;
		};
		debug_assert_eq!(self.uniform_class(&resolved), UniformClass::ImageArray);
		for (i, (image, filter)) in images.iter().enumerate() {
			self.stage_binding(
				resolved.idx.set,
				Binding::image(image.clone(), resolved.idx.binding, *filter, i as u32),
			);
		}
	}

	/// Bind a buffer to `name`.
	pub fn bind_buffer(&self, name: &str, buffer: &Arc<Buffer>) {
		let Some(resolved) = self.resolve(name) else {
			warn!("no binding named `{name}`");
			return;
		};
		debug_assert_eq!(self.uniform_class(&resolved), UniformClass::Buffer);
		self.stage_binding(resolved.idx.set, Binding::buffer(buffer.clone(), resolved.idx.binding, 0, 0));
	}

	/// Write raw bytes to the uniform or storage slot behind `name`.
	///
	/// Writes to a struct's trailing variable-length array copy the whole slab, growing the
	/// storage buffer as needed.
	pub fn bind_data(&self, name: &str, data: &[u8]) -> Result<()> {
		let Some(resolved) = self.resolve(name) else {
			warn!("no binding named `{name}`");
			return Ok(());
		};
		let class = self.uniform_class(&resolved);
		let layout = self.pipeline.layout();

		let base = layout.uniform_offset(BindingIndex {
			set: resolved.idx.set,
			binding: resolved.idx.binding,
			offset: 0,
		})
		.unwrap_or(0);
		let offset = base + resolved.idx.offset;

		// A write landing exactly past the fixed prefix targets the trailing VLA.
		let vla = class == UniformClass::Buffer && resolved.idx.offset == resolved.binding_ty.size;
		let copy_size = if vla {
			data.len()
		} else {
			data.len().min(resolved.ty.size as usize)
		};
		let zero_size = if vla { data.len() } else { resolved.ty.size as usize };

		let buffer = match class {
			UniformClass::Uniform => {
				let mut uniform = self.uniform.lock().unwrap();
				uniform.dirty = true;
				uniform
					.buffer
					.clone()
					.ok_or_else(|| Error::Message("pass has no uniform buffer".into()))?
			},
			UniformClass::Buffer => {
				let key = (resolved.idx.set, resolved.idx.binding);
				let mut storage = self.storage.lock().unwrap();
				let entry = storage
					.get_mut(&key)
					.ok_or_else(|| Error::Message(format!("no storage buffer behind `{name}`")))?;

				let needed = offset as u64 + copy_size as u64;
				if needed > entry.0.size() {
					let grown = Self::create_storage_buffer(&self.device, needed.next_power_of_two())?;
					unsafe {
						std::ptr::copy_nonoverlapping(entry.0.map()?, grown.map()?, entry.0.size() as usize);
					}
					entry.0 = grown;
				}
				entry.1 = true;
				entry.0.clone()
			},
			_ => return Err(Error::Message(format!("`{name}` is not a data binding"))),
		};

		unsafe {
			let ptr = buffer.map()?.add(offset as usize);
			std::ptr::write_bytes(ptr, 0, zero_size);
			std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, copy_size);
		}

		let binding_offset = if class == UniformClass::Uniform { base } else { 0 };
		self.stage_binding(
			resolved.idx.set,
			Binding::buffer(buffer, resolved.idx.binding, binding_offset, 0),
		);
		Ok(())
	}

	/// Transition an image input to the state its descriptor type implies.
	pub fn transition_input_image(&self, cmd: &Arc<CommandBuffer>, name: &str, image: &Arc<Image>) {
		let Some(resolved) = self.resolve(name) else { return };
		if !resolved.ty.is_image() {
			return;
		}
		image.transition(cmd, ImageState {
			stage_mask: self.stage(),
			access_mask: descriptor::access_for(resolved.descriptor_type),
			layout: descriptor::layout_for(resolved.descriptor_type),
		});
	}

	/// Transition a buffer input according to its reflected access flags.
	pub fn transition_input_buffer(&self, cmd: &Arc<CommandBuffer>, name: &str, buffer: &Arc<Buffer>) {
		let Some(resolved) = self.resolve(name) else { return };
		if !resolved.binding_ty.is_struct() {
			return;
		}
		let mut access = vk::AccessFlags2::empty();
		if resolved.access.read {
			access |= vk::AccessFlags2::MEMORY_READ;
		}
		if resolved.access.write {
			access |= vk::AccessFlags2::MEMORY_WRITE;
		}
		buffer.transition(
			cmd,
			crate::resource::BufferMemoryState {
				stage_mask: self.stage(),
				access_mask: access,
			},
			0,
			buffer.size(),
		);
	}

	/// Allocate and write descriptor sets for everything staged, then bind them.
	///
	/// The staged bindings survive for re-execution; only the command buffer keeps the
	/// written sets alive.
	pub fn bind_resources(&self, cmd: &Arc<CommandBuffer>) -> Result<()> {
		let staged = self.bindings.lock().unwrap();
		let mut sets = Vec::with_capacity(staged.len());
		for (&set_index, bindings) in staged.iter() {
			let set = self.pool.allocate_set(set_index)?;
			set.update(&self.device, bindings)?;
			for binding in bindings.values() {
				binding.hold(cmd);
			}
			sets.push(set);
		}
		drop(staged);

		let bind_point = self.pipeline.bind_point();
		for set in sets {
			set.bind(cmd, bind_point);
		}

		self.refresh_buffer(cmd)
	}

	/// Snapshot a dirty uniform buffer into a fresh one so later passes cannot clobber
	/// in-flight data; the old buffer stays referenced until `cmd` completes.
	pub fn refresh_buffer(&self, cmd: &Arc<CommandBuffer>) -> Result<()> {
		let mut uniform = self.uniform.lock().unwrap();
		if !uniform.dirty {
			return Ok(());
		}
		uniform.dirty = false;

		let Some(old) = uniform.buffer.clone() else {
			return Ok(());
		};
		cmd.add_dependency(old.clone());

		let size = self.pipeline.layout().uniform_size();
		let fresh = Self::create_uniform_buffer(&self.device, size)?;
		unsafe {
			std::ptr::copy_nonoverlapping(old.map()?, fresh.map()?, size as usize);
		}
		uniform.buffer = Some(fresh);
		Ok(())
	}

	/// Drop all staged bindings.
	pub fn clear_bindings(&self) { self.bindings.lock().unwrap().clear(); }
}

struct FramebufferTarget {
	handle: vk::Framebuffer,
	view: Option<Arc<crate::resource::ImageView>>,
}

/// A graphics pass drawing into one color output, with an optional depth attachment.
pub struct Renderpass {
	base: Basepass,
	framebuffer: Mutex<FramebufferTarget>,
}

impl Deref for Renderpass {
	type Target = Basepass;

	fn deref(&self) -> &Basepass { &self.base }
}

impl Renderpass {
	pub fn new(device: &Device, pipeline: Arc<GraphicsPipeline>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			base: Basepass::new(device, PassPipeline::Graphics(pipeline))?,
			framebuffer: Mutex::new(FramebufferTarget {
				handle: vk::Framebuffer::null(),
				view: None,
			}),
		}))
	}

	pub fn from_spirv(device: &Device, words: &[u32]) -> Result<Arc<Self>> {
		Self::new(device, GraphicsPipeline::from_spirv(device, words, Default::default(), 1)?)
	}

	pub fn graphics_pipeline(&self) -> &Arc<GraphicsPipeline> {
		match &self.base.pipeline {
			PassPipeline::Graphics(p) => p,
			PassPipeline::Compute(_) => unreachable!(),
		}
	}

	pub fn begin(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, info: &BeginPassInfo) -> Result<()> {
		let device = self.base.device.clone();
		let pl = self.graphics_pipeline();
		let out_view = info.out_image.view_for_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)?;

		// With multisampling, draw into a pooled transient target and resolve into the
		// real output.
		let mut attachment_view = out_view.clone();
		let mut resolve_view = None;
		let mut ms_buffer = None;
		if pl.samples() > 1 {
			let ms = device.pooled_image(
				ImageCreateInfo {
					extent: info.out_image.effective_extent(),
					format: info.out_image.effective_format(),
					usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
					samples: vk::SampleCountFlags::from_raw(pl.samples()),
					..Default::default()
				},
				"transient multisample target",
			)?;
			ms.transition(cmd, color_attachment_state());
			attachment_view = ms.view_for_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)?;
			resolve_view = Some(out_view.clone());
			ms_buffer = Some(ms);
		}

		let per_format = pl.recreate(out_view.effective_format())?;

		info.out_image.transition(cmd, color_attachment_state());

		let extent = info.out_image.effective_extent();
		if let Some(depth) = &info.depth {
			depth.buffer.transition(cmd, ImageState {
				stage_mask: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
				access_mask: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
				layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
			});
		}

		unsafe {
			let raw = cmd.device();
			raw.cmd_set_viewport(cmd.handle(), 0, &[vk::Viewport {
				x: 0.0,
				y: 0.0,
				width: extent.width as f32,
				height: extent.height as f32,
				min_depth: 0.0,
				max_depth: 1.0,
			}]);
			raw.cmd_set_scissor(cmd.handle(), 0, &[vk::Rect2D {
				offset: vk::Offset2D::default(),
				extent,
			}]);
			raw.cmd_set_depth_test_enable(cmd.handle(), false);
			raw.cmd_set_depth_write_enable(cmd.handle(), false);
			raw.cmd_set_depth_compare_op(cmd.handle(), vk::CompareOp::NEVER);
		}

		if device.features().dynamic_rendering {
			let mut color = vk::RenderingAttachmentInfo::default()
				.image_view(attachment_view.handle())
				.image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
				.load_op(if info.clear {
					vk::AttachmentLoadOp::CLEAR
				} else {
					vk::AttachmentLoadOp::LOAD
				})
				.store_op(vk::AttachmentStoreOp::STORE)
				.clear_value(vk::ClearValue {
					color: vk::ClearColorValue {
						float32: info.clear_color,
					},
				});
			if let Some(resolve) = &resolve_view {
				color = color
					.resolve_mode(vk::ResolveModeFlags::AVERAGE)
					.resolve_image_view(resolve.handle())
					.resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
			}

			let depth_attachment;
			let mut rendering = vk::RenderingInfo::default()
				.render_area(vk::Rect2D {
					offset: vk::Offset2D::default(),
					extent,
				})
				.layer_count(1)
				.color_attachments(std::slice::from_ref(&color));
			if let Some(depth) = &info.depth {
				depth_attachment = vk::RenderingAttachmentInfo::default()
					.image_view(depth.buffer.view_for_usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)?.handle())
					.image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
					.load_op(if depth.clear {
						vk::AttachmentLoadOp::CLEAR
					} else {
						vk::AttachmentLoadOp::LOAD
					})
					.store_op(vk::AttachmentStoreOp::STORE)
					.clear_value(vk::ClearValue {
						depth_stencil: vk::ClearDepthStencilValue {
							depth: depth.clear_value,
							stencil: 0,
						},
					});
				rendering = rendering.depth_attachment(&depth_attachment);
			}

			unsafe {
				cmd.device().cmd_begin_rendering(cmd.handle(), &rendering);
			}
		} else {
			// The renderpass path lazily (re)creates a framebuffer when the target view
			// changes.
			let mut fb = self.framebuffer.lock().unwrap();
			let stale = fb
				.view
				.as_ref()
				.map_or(true, |view| !Arc::ptr_eq(view, &attachment_view));
			if stale {
				if fb.handle != vk::Framebuffer::null() {
					unsafe {
						cmd.device().destroy_framebuffer(fb.handle, None);
					}
				}
				let attachments = [attachment_view.handle()];
				fb.handle = unsafe {
					cmd.device().create_framebuffer(
						&vk::FramebufferCreateInfo::default()
							.render_pass(per_format.render_pass)
							.attachments(&attachments)
							.width(extent.width)
							.height(extent.height)
							.layers(1),
						None,
					)?
				};
				fb.view = Some(attachment_view.clone());
			}

			let clear = [vk::ClearValue {
				color: vk::ClearColorValue {
					float32: info.clear_color,
				},
			}];
			unsafe {
				cmd.device().cmd_begin_render_pass(
					cmd.handle(),
					&vk::RenderPassBeginInfo::default()
						.render_pass(per_format.render_pass)
						.framebuffer(fb.handle)
						.render_area(vk::Rect2D {
							offset: vk::Offset2D::default(),
							extent,
						})
						.clear_values(&clear),
					vk::SubpassContents::INLINE,
				);
			}
		}

		unsafe {
			cmd.device().cmd_bind_pipeline(
				cmd.handle(),
				vk::PipelineBindPoint::GRAPHICS,
				if info.wireframe { per_format.wireframe } else { per_format.fill },
			);
		}
		cmd.add_dependency(self.clone());
		cmd.add_dependency(attachment_view);
		if let Some(resolve) = resolve_view {
			cmd.add_dependency(resolve);
		}

		pipeline::push_constants(
			self.base.pipeline.layout(),
			cmd,
			&PassConstants {
				extent: [info.out_image.extent().width, info.out_image.extent().height],
				frame_number: info.frame_number,
				delta_seconds: info.delta_seconds,
				_pad: 0,
			},
		);

		// The transient target goes straight back to the pool; the transition above keeps
		// it alive through this command buffer.
		if let Some(ms) = ms_buffer {
			device.pools().images.release(ash::vk::Handle::as_raw(ms.handle()));
		}

		Ok(())
	}

	pub fn draw(&self, cmd: &Arc<CommandBuffer>, verts: Option<&VertexData>) {
		unsafe {
			let raw = cmd.device();
			match verts {
				Some(verts) => {
					raw.cmd_set_depth_write_enable(cmd.handle(), verts.depth_write);
					raw.cmd_set_depth_test_enable(cmd.handle(), verts.depth_test);
					raw.cmd_set_depth_compare_op(cmd.handle(), verts.depth_func);
					raw.cmd_bind_vertex_buffers(cmd.handle(), 0, &[verts.buffer.handle()], &[verts.vertex_offset]);
					raw.cmd_bind_index_buffer(
						cmd.handle(),
						verts.buffer.handle(),
						verts.index_offset,
						vk::IndexType::UINT32,
					);
					raw.cmd_draw_indexed(cmd.handle(), verts.num_indices as u32, 1, 0, 0, 0);
					cmd.add_dependency(verts.buffer.clone());
				},
				// The fullscreen quad pair.
				None => raw.cmd_draw(cmd.handle(), 6, 1, 0, 0),
			}
		}
	}

	pub fn end(&self, cmd: &Arc<CommandBuffer>) {
		unsafe {
			if self.base.device.features().dynamic_rendering {
				cmd.device().cmd_end_rendering(cmd.handle());
			} else {
				cmd.device().cmd_end_render_pass(cmd.handle());
			}
		}
		self.base.clear_bindings();
	}

	pub fn exec(
		self: &Arc<Self>, cmd: &Arc<CommandBuffer>, info: &BeginPassInfo, verts: Option<&VertexData>,
	) -> Result<()> {
		self.base.bind_resources(cmd)?;
		self.begin(cmd, info)?;
		self.draw(cmd, verts);
		self.end(cmd);
		Ok(())
	}
}

impl CmdDependency for Renderpass {}

impl Drop for Renderpass {
	fn drop(&mut self) {
		let fb = self.framebuffer.get_mut().unwrap();
		if fb.handle != vk::Framebuffer::null() {
			unsafe {
				self.base.device.device().destroy_framebuffer(fb.handle, None);
			}
		}
	}
}

fn color_attachment_state() -> ImageState {
	ImageState {
		stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
		access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
		layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
	}
}

/// A compute pass dispatching one pipeline.
pub struct Computepass {
	base: Basepass,
}

impl Deref for Computepass {
	type Target = Basepass;

	fn deref(&self) -> &Basepass { &self.base }
}

impl Computepass {
	pub fn new(device: &Device, pipeline: Arc<ComputePipeline>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			base: Basepass::new(device, PassPipeline::Compute(pipeline))?,
		}))
	}

	pub fn from_spirv(device: &Device, words: &[u32]) -> Result<Arc<Self>> {
		Self::new(device, ComputePipeline::from_spirv(device, words)?)
	}

	pub fn dispatch(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, x: u32, y: u32, z: u32) {
		let PassPipeline::Compute(pipeline) = &self.base.pipeline else {
			unreachable!();
		};
		unsafe {
			cmd.device()
				.cmd_bind_pipeline(cmd.handle(), vk::PipelineBindPoint::COMPUTE, pipeline.handle());
			cmd.device().cmd_dispatch(cmd.handle(), x, y, z);
		}
		cmd.add_dependency(self.clone());
	}
}

impl CmdDependency for Computepass {}
