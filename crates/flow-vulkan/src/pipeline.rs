//! Graphics pipelines with lazily materialised per-output-format variants, and compute
//! pipelines.

use std::sync::{Arc, Mutex};

use ash::vk;
use rustc_hash::FxHashMap;

use crate::{
	cmd::CommandBuffer,
	descriptor::PipelineLayout,
	device::Device,
	shader::{fullscreen, Shader},
	Result,
};

/// Color blending for one pass: factors, ops, and the write mask.
#[derive(Copy, Clone, Debug)]
pub struct BlendMode {
	pub enable: bool,
	pub src_color_factor: vk::BlendFactor,
	pub dst_color_factor: vk::BlendFactor,
	pub color_op: vk::BlendOp,
	pub src_alpha_factor: vk::BlendFactor,
	pub dst_alpha_factor: vk::BlendFactor,
	pub alpha_op: vk::BlendOp,
	pub color_mask: vk::ColorComponentFlags,
}

impl Default for BlendMode {
	fn default() -> Self {
		Self {
			enable: false,
			src_color_factor: vk::BlendFactor::ZERO,
			dst_color_factor: vk::BlendFactor::ZERO,
			color_op: vk::BlendOp::ADD,
			src_alpha_factor: vk::BlendFactor::ZERO,
			dst_alpha_factor: vk::BlendFactor::ZERO,
			alpha_op: vk::BlendOp::ADD,
			color_mask: vk::ColorComponentFlags::RGBA,
		}
	}
}

/// The pipeline variants for one output format.
#[derive(Copy, Clone, Default)]
pub struct PerFormat {
	pub fill: vk::Pipeline,
	pub wireframe: vk::Pipeline,
	/// Only present when the device lacks dynamic rendering.
	pub render_pass: vk::RenderPass,
}

/// The default vertex shader, registered once per device under the globals key
/// `"fullscreen_vs"`.
pub fn fullscreen_vs(device: &Device) -> Result<Arc<Shader>> {
	if let Some(vs) = device.global::<Shader>("fullscreen_vs") {
		return Ok(vs);
	}
	let vs = Shader::new(device, &fullscreen::assemble())?;
	device.register_global("fullscreen_vs", vs.clone());
	Ok(vs)
}

pub struct GraphicsPipeline {
	device: Device,
	fragment: Arc<Shader>,
	vertex: Arc<Shader>,
	layout: Arc<PipelineLayout>,
	blend: BlendMode,
	samples: u32,
	handles: Mutex<FxHashMap<vk::Format, PerFormat>>,
}

impl GraphicsPipeline {
	/// `vertex` defaults to the fullscreen-triangle shader.
	pub fn new(
		device: &Device, fragment: Arc<Shader>, vertex: Option<Arc<Shader>>, blend: BlendMode, samples: u32,
	) -> Result<Arc<Self>> {
		let vertex = match vertex {
			Some(vs) => vs,
			None => fullscreen_vs(device)?,
		};
		let layout = PipelineLayout::new(device, fragment.layout().merge(vertex.layout()))?;
		Ok(Arc::new(Self {
			device: device.clone(),
			fragment,
			vertex,
			layout,
			blend,
			samples: samples.max(1),
			handles: Mutex::new(FxHashMap::default()),
		}))
	}

	pub fn from_spirv(device: &Device, words: &[u32], blend: BlendMode, samples: u32) -> Result<Arc<Self>> {
		Self::new(device, Shader::new(device, words)?, None, blend, samples)
	}

	pub fn layout(&self) -> &Arc<PipelineLayout> { &self.layout }

	pub fn fragment(&self) -> &Arc<Shader> { &self.fragment }

	pub fn vertex(&self) -> &Arc<Shader> { &self.vertex }

	pub fn samples(&self) -> u32 { self.samples }

	/// The variants for `format`, building them on first use.
	pub fn recreate(&self, format: vk::Format) -> Result<PerFormat> {
		let mut handles = self.handles.lock().unwrap();
		if let Some(per_format) = handles.get(&format) {
			return Ok(*per_format);
		}

		let render_pass = if self.device.features().dynamic_rendering {
			vk::RenderPass::null()
		} else {
			self.create_render_pass(format)?
		};
		let fill = self.create_pipeline(format, vk::PolygonMode::FILL, render_pass)?;
		let wireframe = self.create_pipeline(format, vk::PolygonMode::LINE, render_pass)?;

		let per_format = PerFormat {
			fill,
			wireframe,
			render_pass,
		};
		handles.insert(format, per_format);
		Ok(per_format)
	}

	fn create_render_pass(&self, format: vk::Format) -> Result<vk::RenderPass> {
		let attachment = vk::AttachmentDescription::default()
			.format(format)
			.samples(vk::SampleCountFlags::from_raw(self.samples))
			.load_op(vk::AttachmentLoadOp::LOAD)
			.store_op(vk::AttachmentStoreOp::STORE)
			.initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
			.final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
		let color_ref = [vk::AttachmentReference::default()
			.attachment(0)
			.layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
		let subpass = vk::SubpassDescription::default()
			.pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
			.color_attachments(&color_ref);

		unsafe {
			self.device
				.device()
				.create_render_pass(
					&vk::RenderPassCreateInfo::default()
						.attachments(std::slice::from_ref(&attachment))
						.subpasses(std::slice::from_ref(&subpass)),
					None,
				)
				.map_err(Into::into)
		}
	}

	fn create_pipeline(
		&self, format: vk::Format, polygon_mode: vk::PolygonMode, render_pass: vk::RenderPass,
	) -> Result<vk::Pipeline> {
		let stages = [
			vk::PipelineShaderStageCreateInfo::default()
				.stage(vk::ShaderStageFlags::VERTEX)
				.module(self.vertex.module())
				.name(c"main"),
			vk::PipelineShaderStageCreateInfo::default()
				.stage(vk::ShaderStageFlags::FRAGMENT)
				.module(self.fragment.module())
				.name(c"main"),
		];

		let mut vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
		if let Some((binding, attributes)) = self.vertex.vertex_input() {
			vertex_input = vertex_input
				.vertex_binding_descriptions(std::slice::from_ref(binding))
				.vertex_attribute_descriptions(attributes);
		}

		let attachments = vec![
			vk::PipelineColorBlendAttachmentState::default()
				.blend_enable(self.blend.enable)
				.src_color_blend_factor(self.blend.src_color_factor)
				.dst_color_blend_factor(self.blend.dst_color_factor)
				.color_blend_op(self.blend.color_op)
				.src_alpha_blend_factor(self.blend.src_alpha_factor)
				.dst_alpha_blend_factor(self.blend.dst_alpha_factor)
				.alpha_blend_op(self.blend.alpha_op)
				.color_write_mask(self.blend.color_mask);
			self.layout.rt_count().max(1) as usize
		];
		let color_formats = vec![format; self.layout.rt_count().max(1) as usize];

		let dynamic = [
			vk::DynamicState::VIEWPORT,
			vk::DynamicState::SCISSOR,
			vk::DynamicState::DEPTH_TEST_ENABLE,
			vk::DynamicState::DEPTH_WRITE_ENABLE,
			vk::DynamicState::DEPTH_COMPARE_OP,
		];

		let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
			.color_attachment_formats(&color_formats)
			.depth_attachment_format(vk::Format::D32_SFLOAT);

		let input_assembly =
			vk::PipelineInputAssemblyStateCreateInfo::default().topology(vk::PrimitiveTopology::TRIANGLE_LIST);
		let viewports = [vk::Viewport::default()];
		let scissors = [vk::Rect2D::default()];
		let viewport = vk::PipelineViewportStateCreateInfo::default()
			.viewports(&viewports)
			.scissors(&scissors);
		let raster = vk::PipelineRasterizationStateCreateInfo::default()
			.polygon_mode(polygon_mode)
			.cull_mode(vk::CullModeFlags::BACK)
			.front_face(vk::FrontFace::COUNTER_CLOCKWISE)
			.line_width(1.0);
		let multisample = vk::PipelineMultisampleStateCreateInfo::default()
			.rasterization_samples(vk::SampleCountFlags::from_raw(self.samples));
		let depth = vk::PipelineDepthStencilStateCreateInfo::default()
			.depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
			.min_depth_bounds(0.0)
			.max_depth_bounds(1.0);
		let blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
		let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic);

		let mut info = vk::GraphicsPipelineCreateInfo::default()
			.stages(&stages)
			.vertex_input_state(&vertex_input)
			.input_assembly_state(&input_assembly)
			.viewport_state(&viewport)
			.rasterization_state(&raster)
			.multisample_state(&multisample)
			.depth_stencil_state(&depth)
			.color_blend_state(&blend)
			.dynamic_state(&dynamic_state)
			.layout(self.layout.handle());

		if self.device.features().dynamic_rendering {
			info = info.push_next(&mut rendering_info);
		} else {
			info = info.render_pass(render_pass).subpass(0);
		}

		unsafe {
			self.device
				.device()
				.create_graphics_pipelines(self.device.pipeline_cache(), &[info], None)
				.map(|p| p[0])
				.map_err(|(_, e)| e.into())
		}
	}
}

impl Drop for GraphicsPipeline {
	fn drop(&mut self) {
		let device = self.device.device();
		for (_, per_format) in self.handles.get_mut().unwrap().drain() {
			unsafe {
				device.destroy_pipeline(per_format.fill, None);
				device.destroy_pipeline(per_format.wireframe, None);
				if per_format.render_pass != vk::RenderPass::null() {
					device.destroy_render_pass(per_format.render_pass, None);
				}
			}
		}
	}
}

pub struct ComputePipeline {
	device: Device,
	shader: Arc<Shader>,
	layout: Arc<PipelineLayout>,
	handle: vk::Pipeline,
}

impl ComputePipeline {
	pub fn new(device: &Device, shader: Arc<Shader>) -> Result<Arc<Self>> {
		let layout = PipelineLayout::new(device, shader.layout().clone())?;
		let handle = unsafe {
			device
				.device()
				.create_compute_pipelines(
					device.pipeline_cache(),
					&[vk::ComputePipelineCreateInfo::default()
						.stage(
							vk::PipelineShaderStageCreateInfo::default()
								.stage(vk::ShaderStageFlags::COMPUTE)
								.module(shader.module())
								.name(c"main"),
						)
						.layout(layout.handle())],
					None,
				)
				.map(|p| p[0])
				.map_err(|(_, e)| crate::Error::from(e))?
		};
		Ok(Arc::new(Self {
			device: device.clone(),
			shader,
			layout,
			handle,
		}))
	}

	pub fn from_spirv(device: &Device, words: &[u32]) -> Result<Arc<Self>> {
		Self::new(device, Shader::new(device, words)?)
	}

	pub fn handle(&self) -> vk::Pipeline { self.handle }

	pub fn shader(&self) -> &Arc<Shader> { &self.shader }

	pub fn layout(&self) -> &Arc<PipelineLayout> { &self.layout }
}

impl Drop for ComputePipeline {
	fn drop(&mut self) {
		unsafe {
			self.device.device().destroy_pipeline(self.handle, None);
		}
	}
}

/// Either pipeline kind, as a pass drives it.
#[derive(Clone)]
pub enum PassPipeline {
	Graphics(Arc<GraphicsPipeline>),
	Compute(Arc<ComputePipeline>),
}

impl PassPipeline {
	pub fn layout(&self) -> &Arc<PipelineLayout> {
		match self {
			PassPipeline::Graphics(p) => p.layout(),
			PassPipeline::Compute(p) => p.layout(),
		}
	}

	pub fn main_stage(&self) -> vk::ShaderStageFlags {
		match self {
			PassPipeline::Graphics(p) => p.fragment().stage(),
			PassPipeline::Compute(p) => p.shader().stage(),
		}
	}

	pub fn bind_point(&self) -> vk::PipelineBindPoint {
		match self {
			PassPipeline::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
			PassPipeline::Compute(_) => vk::PipelineBindPoint::COMPUTE,
		}
	}
}

/// Push a value through the pass push-constant range, clamped to the declared size.
pub fn push_constants<T: bytemuck::NoUninit>(layout: &PipelineLayout, cmd: &Arc<CommandBuffer>, value: &T) {
	if layout.push_constant_size() == 0 {
		return;
	}
	let bytes = bytemuck::bytes_of(value);
	let len = bytes.len().min(layout.push_constant_size() as usize);
	unsafe {
		cmd.device().cmd_push_constants(
			cmd.handle(),
			layout.handle(),
			layout.push_constant_stages(),
			0,
			&bytes[..len],
		);
	}
}
