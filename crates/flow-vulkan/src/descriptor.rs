//! Descriptor set layouts, the chained descriptor pool, and name-addressed bindings.

use std::{
	collections::BTreeMap,
	sync::{Arc, Mutex},
};

use ash::vk;
use rustc_hash::FxHashMap;

use crate::{
	cmd::{CmdDependency, CommandBuffer},
	device::Device,
	resource::{Buffer, Image},
	shader::{BindingIndex, NamedBinding, ShaderLayout},
	Error, Result,
};

/// Sets nominally available per pool link before a successor is chained.
const SETS_PER_LAYOUT: u32 = 1024;

/// The shape of one bindable set.
pub struct DescriptorLayout {
	device: ash::Device,
	handle: vk::DescriptorSetLayout,
	bindings: BTreeMap<u32, NamedBinding>,
	max_descriptors: u32,
}

impl DescriptorLayout {
	fn new(device: &ash::Device, bindings: BTreeMap<u32, NamedBinding>) -> Result<Arc<Self>> {
		let mut max_descriptors = 0;
		let vk_bindings: Vec<_> = bindings
			.values()
			.map(|b| {
				max_descriptors += b.descriptor_count;
				vk::DescriptorSetLayoutBinding::default()
					.binding(b.binding)
					.descriptor_type(b.descriptor_type)
					.descriptor_count(b.descriptor_count)
					.stage_flags(b.stage_mask)
			})
			.collect();

		let handle = unsafe {
			device.create_descriptor_set_layout(
				&vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings),
				None,
			)?
		};
		Ok(Arc::new(Self {
			device: device.clone(),
			handle,
			bindings,
			max_descriptors,
		}))
	}

	pub fn handle(&self) -> vk::DescriptorSetLayout { self.handle }

	pub fn bindings(&self) -> &BTreeMap<u32, NamedBinding> { &self.bindings }

	pub fn binding(&self, index: u32) -> Option<&NamedBinding> { self.bindings.get(&index) }

	pub fn max_descriptors(&self) -> u32 { self.max_descriptors }
}

impl Drop for DescriptorLayout {
	fn drop(&mut self) {
		unsafe {
			self.device.destroy_descriptor_set_layout(self.handle, None);
		}
	}
}

/// Pack the non-SSBO bindings of a merged layout into one coalesced uniform buffer.
///
/// Returns `(offset map, ssbo size map, total uniform size)`; each offset is aligned to its
/// binding type's alignment.
pub fn compute_uniform_layout(
	sets: &BTreeMap<u32, BTreeMap<u32, NamedBinding>>,
) -> (BTreeMap<(u32, u32), u32>, BTreeMap<(u32, u32), u32>, u32) {
	let mut offsets = BTreeMap::new();
	let mut ssbo_sizes = BTreeMap::new();
	let mut uniform_size = 0u32;

	for (&set, bindings) in sets.iter() {
		for (&binding, nb) in bindings.iter() {
			if nb.ssbo() {
				ssbo_sizes.insert((set, binding), nb.ty.size);
				continue;
			}
			let shift = uniform_size % nb.ty.alignment;
			if shift != 0 {
				uniform_size += nb.ty.alignment - shift;
			}
			offsets.insert((set, binding), uniform_size);
			uniform_size += nb.ty.size;
		}
	}

	(offsets, ssbo_sizes, uniform_size)
}

/// One descriptor set layout per set, a push-constant range over every used stage, and the
/// uniform packing of all loose values.
pub struct PipelineLayout {
	device: ash::Device,
	handle: vk::PipelineLayout,
	rt_count: u32,
	push_constant_size: u32,
	push_constant_stages: vk::ShaderStageFlags,
	uniform_size: u32,
	offset_map: BTreeMap<(u32, u32), u32>,
	ssbo_sizes: BTreeMap<(u32, u32), u32>,
	set_layouts: BTreeMap<u32, Arc<DescriptorLayout>>,
	by_name: FxHashMap<String, BindingIndex>,
}

impl PipelineLayout {
	pub fn new(device: &Device, layout: ShaderLayout) -> Result<Arc<Self>> {
		let mut stages = vk::ShaderStageFlags::empty();
		for bindings in layout.sets.values() {
			for nb in bindings.values() {
				stages |= nb.stage_mask;
			}
		}
		if stages.is_empty() {
			stages = vk::ShaderStageFlags::ALL;
		}

		let (offset_map, ssbo_sizes, uniform_size) = compute_uniform_layout(&layout.sets);

		// Set numbers index `pSetLayouts` positionally, so gaps get empty layouts.
		let max_set = layout.sets.keys().next_back().copied();
		let mut set_layouts = BTreeMap::new();
		let mut handles = Vec::new();
		if let Some(max_set) = max_set {
			for set in 0..=max_set {
				let bindings = layout.sets.get(&set).cloned().unwrap_or_default();
				let l = DescriptorLayout::new(device.device(), bindings)?;
				handles.push(l.handle());
				set_layouts.insert(set, l);
			}
		}

		let range = vk::PushConstantRange::default()
			.offset(0)
			.size(layout.push_constant_size)
			.stage_flags(stages);
		let mut info = vk::PipelineLayoutCreateInfo::default().set_layouts(&handles);
		let ranges = [range];
		if layout.push_constant_size > 0 {
			info = info.push_constant_ranges(&ranges);
		}

		let handle = unsafe { device.device().create_pipeline_layout(&info, None)? };
		Ok(Arc::new(Self {
			device: device.device().clone(),
			handle,
			rt_count: layout.rt_count,
			push_constant_size: layout.push_constant_size,
			push_constant_stages: stages,
			uniform_size,
			offset_map,
			ssbo_sizes,
			set_layouts,
			by_name: layout.by_name,
		}))
	}

	pub fn handle(&self) -> vk::PipelineLayout { self.handle }

	pub fn rt_count(&self) -> u32 { self.rt_count }

	pub fn push_constant_size(&self) -> u32 { self.push_constant_size }

	pub fn push_constant_stages(&self) -> vk::ShaderStageFlags { self.push_constant_stages }

	pub fn uniform_size(&self) -> u32 { self.uniform_size }

	pub fn uniform_offset(&self, idx: BindingIndex) -> Option<u32> {
		self.offset_map.get(&(idx.set, idx.binding)).copied()
	}

	pub fn ssbo_sizes(&self) -> &BTreeMap<(u32, u32), u32> { &self.ssbo_sizes }

	pub fn set_layouts(&self) -> &BTreeMap<u32, Arc<DescriptorLayout>> { &self.set_layouts }

	pub fn index(&self, name: &str) -> Option<BindingIndex> { self.by_name.get(name).copied() }

	pub fn binding(&self, idx: BindingIndex) -> Option<&NamedBinding> {
		self.set_layouts.get(&idx.set)?.binding(idx.binding)
	}

	pub fn create_pool(self: &Arc<Self>) -> Result<Arc<DescriptorPool>> { DescriptorPool::new(self) }
}

impl Drop for PipelineLayout {
	fn drop(&mut self) {
		unsafe {
			self.device.destroy_pipeline_layout(self.handle, None);
		}
	}
}

struct DescriptorPoolState {
	in_use: u32,
	next: Option<Arc<DescriptorPool>>,
}

/// A fixed-capacity pool that chains a successor when it runs dry. Live sets keep their
/// pool alive.
pub struct DescriptorPool {
	layout: Arc<PipelineLayout>,
	handle: vk::DescriptorPool,
	max_sets: u32,
	state: Mutex<DescriptorPoolState>,
}

impl DescriptorPool {
	pub fn new(layout: &Arc<PipelineLayout>) -> Result<Arc<Self>> {
		let mut counts: BTreeMap<vk::DescriptorType, u32> = BTreeMap::new();
		for set in layout.set_layouts.values() {
			for binding in set.bindings().values() {
				*counts.entry(binding.descriptor_type).or_default() += binding.descriptor_count;
			}
		}
		let sizes: Vec<_> = counts
			.into_iter()
			.map(|(ty, count)| {
				vk::DescriptorPoolSize::default()
					.ty(ty)
					.descriptor_count(count * SETS_PER_LAYOUT)
			})
			.collect();
		let max_sets = (layout.set_layouts.len() as u32).max(1) * SETS_PER_LAYOUT;

		let handle = unsafe {
			layout.device.create_descriptor_pool(
				&vk::DescriptorPoolCreateInfo::default()
					.flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
					.max_sets(max_sets)
					.pool_sizes(&sizes),
				None,
			)?
		};
		Ok(Arc::new(Self {
			layout: layout.clone(),
			handle,
			max_sets,
			state: Mutex::new(DescriptorPoolState { in_use: 0, next: None }),
		}))
	}

	pub fn layout(&self) -> &Arc<PipelineLayout> { &self.layout }

	/// Allocate a set of shape `set`, chaining into a successor pool on exhaustion.
	pub fn allocate_set(self: &Arc<Self>, set: u32) -> Result<Arc<DescriptorSet>> {
		let next = {
			let mut state = self.state.lock().unwrap();
			if state.in_use < self.max_sets {
				match DescriptorSet::new(self, set) {
					Ok(s) => {
						state.in_use += 1;
						return Ok(s);
					},
					Err(Error::PoolExhausted) => {},
					Err(e) => return Err(e),
				}
			}
			if state.next.is_none() {
				state.next = Some(DescriptorPool::new(&self.layout)?);
			}
			state.next.clone().unwrap()
		};
		next.allocate_set(set)
	}
}

impl Drop for DescriptorPool {
	fn drop(&mut self) {
		unsafe {
			self.layout.device.destroy_descriptor_pool(self.handle, None);
		}
	}
}

pub struct DescriptorSet {
	pool: Arc<DescriptorPool>,
	set_index: u32,
	handle: vk::DescriptorSet,
}

impl DescriptorSet {
	fn new(pool: &Arc<DescriptorPool>, set: u32) -> Result<Arc<Self>> {
		let layout = pool
			.layout
			.set_layouts
			.get(&set)
			.ok_or_else(|| Error::Message(format!("no descriptor layout for set {set}")))?;
		let handle = unsafe {
			pool.layout
				.device
				.allocate_descriptor_sets(
					&vk::DescriptorSetAllocateInfo::default()
						.descriptor_pool(pool.handle)
						.set_layouts(&[layout.handle()]),
				)
				.map_err(|res| match res {
					vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => Error::PoolExhausted,
					res => res.into(),
				})?[0]
		};
		Ok(Arc::new(Self {
			pool: pool.clone(),
			set_index: set,
			handle,
		}))
	}

	pub fn handle(&self) -> vk::DescriptorSet { self.handle }

	pub fn set_index(&self) -> u32 { self.set_index }

	/// Write every staged binding in one call, grouping array elements into contiguous
	/// info runs.
	pub fn update(&self, device: &Device, bindings: &BTreeMap<(u32, u32), Binding>) -> Result<()> {
		enum Infos {
			Images(Vec<vk::DescriptorImageInfo>),
			Buffers(Vec<vk::DescriptorBufferInfo>),
		}

		let layout = &self.pool.layout.set_layouts[&self.set_index];
		let mut grouped: Vec<(u32, vk::DescriptorType, Infos)> = Vec::new();

		let mut entries = bindings.values().peekable();
		while let Some(first) = entries.peek() {
			let binding = first.binding;
			let Some(nb) = layout.binding(binding) else {
				entries.next();
				continue;
			};
			let ty = nb.descriptor_type;
			let count = nb.descriptor_count as usize;

			let mut run: Vec<&Binding> = Vec::new();
			while let Some(entry) = entries.peek() {
				if entry.binding != binding {
					break;
				}
				run.push(entries.next().unwrap());
			}

			let infos = match run[0].target {
				BindTarget::Image { .. } => {
					let mut infos = Vec::with_capacity(count);
					for entry in run.iter() {
						infos.push(entry.image_info(device, ty)?);
					}
					// Pad partially-bound arrays with the first element.
					while infos.len() < count {
						infos.push(infos[0]);
					}
					Infos::Images(infos)
				},
				BindTarget::Buffer { .. } => {
					let mut infos = Vec::with_capacity(count);
					for entry in run.iter() {
						infos.push(entry.buffer_info());
					}
					while infos.len() < count {
						infos.push(infos[0]);
					}
					Infos::Buffers(infos)
				},
			};
			grouped.push((binding, ty, infos));
		}

		let writes: Vec<_> = grouped
			.iter()
			.map(|(binding, ty, infos)| {
				let write = vk::WriteDescriptorSet::default()
					.dst_set(self.handle)
					.dst_binding(*binding)
					.descriptor_type(*ty);
				match infos {
					Infos::Images(v) => write.image_info(v),
					Infos::Buffers(v) => write.buffer_info(v),
				}
			})
			.collect();

		unsafe {
			self.pool.layout.device.update_descriptor_sets(&writes, &[]);
		}
		Ok(())
	}

	pub fn bind(self: &Arc<Self>, cmd: &Arc<CommandBuffer>, bind_point: vk::PipelineBindPoint) {
		cmd.add_dependency(self.clone());
		unsafe {
			cmd.device().cmd_bind_descriptor_sets(
				cmd.handle(),
				bind_point,
				self.pool.layout.handle,
				self.set_index,
				&[self.handle],
				&[],
			);
		}
	}
}

impl CmdDependency for DescriptorSet {}

impl Drop for DescriptorSet {
	fn drop(&mut self) {
		let mut state = self.pool.state.lock().unwrap();
		unsafe {
			let _ = self.pool.layout.device.free_descriptor_sets(self.pool.handle, &[self.handle]);
		}
		state.in_use -= 1;
	}
}

/// What a name is bound to right now: an image (sampled through `filter`) or a buffer at a
/// byte offset, optionally one element of an array.
#[derive(Clone)]
pub enum BindTarget {
	Image { image: Arc<Image>, filter: vk::Filter },
	Buffer { buffer: Arc<Buffer>, offset: u32 },
}

#[derive(Clone)]
pub struct Binding {
	pub target: BindTarget,
	pub binding: u32,
	pub array_index: u32,
}

impl Binding {
	pub fn image(image: Arc<Image>, binding: u32, filter: vk::Filter, array_index: u32) -> Self {
		Self {
			target: BindTarget::Image { image, filter },
			binding,
			array_index,
		}
	}

	pub fn buffer(buffer: Arc<Buffer>, binding: u32, offset: u32, array_index: u32) -> Self {
		Self {
			target: BindTarget::Buffer { buffer, offset },
			binding,
			array_index,
		}
	}

	pub fn key(&self) -> (u32, u32) { (self.binding, self.array_index) }

	fn image_info(&self, device: &Device, ty: vk::DescriptorType) -> Result<vk::DescriptorImageInfo> {
		let BindTarget::Image { image, filter } = &self.target else {
			return Err(Error::Message("binding is not an image".into()));
		};
		let view = image.view_for_usage(image_usage_for(ty))?;
		let mut info = view.descriptor_info(device, *filter)?;
		info.image_layout = layout_for(ty);
		Ok(info)
	}

	fn buffer_info(&self) -> vk::DescriptorBufferInfo {
		let BindTarget::Buffer { buffer, offset } = &self.target else {
			unreachable!();
		};
		let mut info = buffer.descriptor_info();
		info.offset = *offset as u64;
		info
	}

	/// The resources this binding must keep alive through submission.
	pub fn hold(&self, cmd: &Arc<CommandBuffer>) {
		match &self.target {
			BindTarget::Image { image, .. } => cmd.add_dependency(image.clone()),
			BindTarget::Buffer { buffer, .. } => cmd.add_dependency(buffer.clone()),
		}
	}
}

/// The image usage implied by a descriptor type.
pub fn image_usage_for(ty: vk::DescriptorType) -> vk::ImageUsageFlags {
	match ty {
		vk::DescriptorType::COMBINED_IMAGE_SAMPLER | vk::DescriptorType::SAMPLED_IMAGE => vk::ImageUsageFlags::SAMPLED,
		vk::DescriptorType::STORAGE_IMAGE => vk::ImageUsageFlags::STORAGE,
		vk::DescriptorType::INPUT_ATTACHMENT => vk::ImageUsageFlags::INPUT_ATTACHMENT,
		_ => vk::ImageUsageFlags::empty(),
	}
}

/// The buffer usage implied by a descriptor type.
pub fn buffer_usage_for(ty: vk::DescriptorType) -> vk::BufferUsageFlags {
	match ty {
		vk::DescriptorType::UNIFORM_TEXEL_BUFFER => vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
		vk::DescriptorType::STORAGE_TEXEL_BUFFER => vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
		vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
			vk::BufferUsageFlags::UNIFORM_BUFFER
		},
		vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
			vk::BufferUsageFlags::STORAGE_BUFFER
		},
		_ => vk::BufferUsageFlags::empty(),
	}
}

/// The image layout a descriptor of this type is accessed in.
pub fn layout_for(ty: vk::DescriptorType) -> vk::ImageLayout {
	match ty {
		vk::DescriptorType::COMBINED_IMAGE_SAMPLER
		| vk::DescriptorType::SAMPLED_IMAGE
		| vk::DescriptorType::INPUT_ATTACHMENT => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
		vk::DescriptorType::STORAGE_IMAGE => vk::ImageLayout::GENERAL,
		_ => vk::ImageLayout::UNDEFINED,
	}
}

/// The access mask a descriptor of this type implies.
pub fn access_for(ty: vk::DescriptorType) -> vk::AccessFlags2 {
	match ty {
		vk::DescriptorType::COMBINED_IMAGE_SAMPLER | vk::DescriptorType::SAMPLED_IMAGE => vk::AccessFlags2::SHADER_READ,
		vk::DescriptorType::STORAGE_IMAGE => vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
		vk::DescriptorType::INPUT_ATTACHMENT => vk::AccessFlags2::INPUT_ATTACHMENT_READ,
		_ => vk::AccessFlags2::empty(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::shader::{Access, SvKind, SvType, TypeInterner};

	fn vec_ty(interner: &TypeInterner, kind: SvKind, width: u32, vec: u32, cols: u32) -> Arc<SvType> {
		let v = if vec == 3 { 4 } else { vec };
		let alignment = (v * width / 8).max(1);
		interner.intern(SvType {
			kind,
			width,
			vec,
			cols,
			size: alignment * cols,
			alignment,
			array_len: 0,
		})
	}

	fn named(binding: u32, ty: Arc<SvType>, descriptor_type: vk::DescriptorType) -> NamedBinding {
		NamedBinding {
			binding,
			descriptor_type,
			descriptor_count: 1,
			name: format!("b{binding}"),
			ty,
			stage_mask: vk::ShaderStageFlags::FRAGMENT,
			access: Access::default(),
		}
	}

	#[test]
	fn uniform_offsets_are_aligned_and_bounded() {
		let interner = TypeInterner::default();
		let float = vec_ty(&interner, SvKind::Float, 32, 1, 1);
		let vec4 = vec_ty(&interner, SvKind::Float, 32, 4, 1);
		let mat4 = vec_ty(&interner, SvKind::Float, 32, 4, 4);

		let mut sets: BTreeMap<u32, BTreeMap<u32, NamedBinding>> = BTreeMap::new();
		let set0 = sets.entry(0).or_default();
		set0.insert(0, named(0, float.clone(), vk::DescriptorType::UNIFORM_BUFFER));
		set0.insert(1, named(1, mat4.clone(), vk::DescriptorType::UNIFORM_BUFFER));
		set0.insert(2, named(2, vec4.clone(), vk::DescriptorType::STORAGE_BUFFER));
		sets.entry(1)
			.or_default()
			.insert(0, named(0, vec4.clone(), vk::DescriptorType::UNIFORM_BUFFER));

		let (offsets, ssbo_sizes, uniform_size) = compute_uniform_layout(&sets);

		// The SSBO stays out of the uniform block.
		assert!(!offsets.contains_key(&(0, 2)));
		assert_eq!(ssbo_sizes[&(0, 2)], 16);

		for (key, &offset) in offsets.iter() {
			let nb = &sets[&key.0][&key.1];
			assert_eq!(offset % nb.ty.alignment, 0, "binding {key:?} misaligned");
			assert!(offset + nb.ty.size <= uniform_size);
		}

		// The float at (0,0) packs first; the mat4 starts on its own 16-byte boundary.
		assert_eq!(offsets[&(0, 0)], 0);
		assert_eq!(offsets[&(0, 1)], 16);
		assert_eq!(offsets[&(1, 0)], 80);
		assert_eq!(uniform_size, 96);
	}

	#[test]
	fn descriptor_type_mappings() {
		assert_eq!(
			layout_for(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
			vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
		);
		assert_eq!(layout_for(vk::DescriptorType::STORAGE_IMAGE), vk::ImageLayout::GENERAL);
		assert_eq!(
			image_usage_for(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
			vk::ImageUsageFlags::SAMPLED
		);
		assert_eq!(
			buffer_usage_for(vk::DescriptorType::STORAGE_BUFFER),
			vk::BufferUsageFlags::STORAGE_BUFFER
		);
		assert_eq!(
			access_for(vk::DescriptorType::STORAGE_IMAGE),
			vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE
		);
	}
}
