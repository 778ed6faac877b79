use ash::vk;
use rustc_hash::FxHashMap;

use crate::Result;

/// A filter-keyed sampler cache. Samplers live until the device does.
pub(crate) struct Samplers {
	samplers: FxHashMap<vk::Filter, vk::Sampler>,
}

impl Samplers {
	pub fn new() -> Self {
		Self {
			samplers: FxHashMap::default(),
		}
	}

	pub fn get(&mut self, device: &ash::Device, filter: vk::Filter) -> Result<vk::Sampler> {
		if let Some(&sampler) = self.samplers.get(&filter) {
			return Ok(sampler);
		}
		let sampler = unsafe {
			device.create_sampler(
				&vk::SamplerCreateInfo::default()
					.mag_filter(filter)
					.min_filter(filter)
					.mipmap_mode(vk::SamplerMipmapMode::NEAREST)
					.address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
					.address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
					.address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
					.max_lod(vk::LOD_CLAMP_NONE),
				None,
			)?
		};
		self.samplers.insert(filter, sampler);
		Ok(sampler)
	}

	pub unsafe fn cleanup(&mut self, device: &ash::Device) {
		for (_, sampler) in self.samplers.drain() {
			unsafe {
				device.destroy_sampler(sampler, None);
			}
		}
	}
}
