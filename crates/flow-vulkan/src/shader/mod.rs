//! Shader modules and the reflection that drives descriptor layouts.

use std::sync::Arc;

use ash::{util::read_spv, vk};

use crate::{device::Device, Result};

pub mod fullscreen;
pub mod reflect;

pub use reflect::{
	Access,
	BindingIndex,
	ImageMeta,
	NamedBinding,
	Reflection,
	ShaderLayout,
	SvKind,
	SvMember,
	SvType,
	TypeInterner,
};

/// A shader module plus everything reflected out of its binary.
pub struct Shader {
	device: ash::Device,
	module: vk::ShaderModule,
	reflection: Reflection,
}

impl Shader {
	pub fn new(device: &Device, words: &[u32]) -> Result<Arc<Self>> {
		let reflection = reflect::reflect(words, device.types())?;
		let module = unsafe {
			device
				.device()
				.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(words), None)?
		};
		Ok(Arc::new(Self {
			device: device.device().clone(),
			module,
			reflection,
		}))
	}

	/// Create from raw bytes, e.g. a `.spv` file read off disk.
	pub fn from_bytes(device: &Device, bytes: &[u8]) -> Result<Arc<Self>> {
		let words = read_spv(&mut std::io::Cursor::new(bytes))
			.map_err(|e| crate::Error::ShaderCompile(format!("unreadable SPIR-V: {e}")))?;
		Self::new(device, &words)
	}

	pub fn module(&self) -> vk::ShaderModule { self.module }

	pub fn stage(&self) -> vk::ShaderStageFlags { self.reflection.stage }

	pub fn layout(&self) -> &ShaderLayout { &self.reflection.layout }

	/// The vertex input state, for vertex shaders with at least one attribute.
	pub fn vertex_input(
		&self,
	) -> Option<(
		&vk::VertexInputBindingDescription,
		&[vk::VertexInputAttributeDescription],
	)> {
		if self.reflection.stage != vk::ShaderStageFlags::VERTEX || self.reflection.vertex_attributes.is_empty() {
			return None;
		}
		Some((&self.reflection.vertex_binding, &self.reflection.vertex_attributes))
	}
}

impl Drop for Shader {
	fn drop(&mut self) {
		unsafe {
			self.device.destroy_shader_module(self.module, None);
		}
	}
}
