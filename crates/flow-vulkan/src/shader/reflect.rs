//! SPIR-V reflection: from a shader binary to a set/binding/type tree.
//!
//! Types are hash-consed through a device-scoped [`TypeInterner`], so two reflections of
//! the same declarations yield pointer-equal [`SvType`]s.

use std::{
	collections::BTreeMap,
	sync::{Arc, Mutex},
};

use ash::vk;
use rspirv::{
	dr,
	spirv::{Decoration, Dim, ExecutionModel, ImageFormat, Op, StorageClass, Word},
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::{Error, Result};

/// Where a name binds: a descriptor slot, plus a byte offset for struct members.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct BindingIndex {
	pub set: u32,
	pub binding: u32,
	pub offset: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct ImageMeta {
	pub depth: bool,
	pub arrayed: bool,
	pub ms: bool,
	pub read: bool,
	pub write: bool,
	pub sampled: u32,
	pub format: vk::Format,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SvMember {
	pub ty: Arc<SvType>,
	pub idx: u32,
	pub size: u32,
	pub offset: u32,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum SvKind {
	Uint,
	Sint,
	Float,
	Image(ImageMeta),
	Struct {
		name: String,
		members: BTreeMap<String, SvMember>,
	},
	Sampler,
}

/// A reflected shader type. `width`/`vec`/`cols` describe numeric shapes; structs carry
/// their members by name.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SvType {
	pub kind: SvKind,
	pub width: u32,
	pub vec: u32,
	pub cols: u32,
	pub size: u32,
	pub alignment: u32,
	/// `0` when not an array, `!0` when unbounded.
	pub array_len: u32,
}

impl SvType {
	pub fn is_struct(&self) -> bool { matches!(self.kind, SvKind::Struct { .. }) }

	pub fn is_image(&self) -> bool { matches!(self.kind, SvKind::Image(_)) }

	pub fn member(&self, name: &str) -> Option<&SvMember> {
		match &self.kind {
			SvKind::Struct { members, .. } => members.get(name),
			_ => None,
		}
	}
}

/// Deduplicates structurally identical type trees.
#[derive(Default)]
pub struct TypeInterner {
	table: Mutex<FxHashSet<Arc<SvType>>>,
}

impl TypeInterner {
	pub fn intern(&self, ty: SvType) -> Arc<SvType> {
		let mut table = self.table.lock().unwrap();
		if let Some(existing) = table.get(&ty) {
			return existing.clone();
		}
		let ty = Arc::new(ty);
		table.insert(ty.clone());
		ty
	}
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct Access {
	pub read: bool,
	pub write: bool,
}

#[derive(Clone, PartialEq, Debug)]
pub struct NamedBinding {
	pub binding: u32,
	pub descriptor_type: vk::DescriptorType,
	pub descriptor_count: u32,
	pub name: String,
	pub ty: Arc<SvType>,
	pub stage_mask: vk::ShaderStageFlags,
	pub access: Access,
}

impl NamedBinding {
	pub fn ssbo(&self) -> bool {
		matches!(
			self.descriptor_type,
			vk::DescriptorType::STORAGE_BUFFER
				| vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
				| vk::DescriptorType::STORAGE_TEXEL_BUFFER
		)
	}
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct ShaderLayout {
	pub rt_count: u32,
	pub push_constant_size: u32,
	pub sets: BTreeMap<u32, BTreeMap<u32, NamedBinding>>,
	pub by_name: FxHashMap<String, BindingIndex>,
}

impl ShaderLayout {
	pub fn binding(&self, idx: BindingIndex) -> Option<&NamedBinding> { self.sets.get(&idx.set)?.get(&idx.binding) }

	pub fn index(&self, name: &str) -> Option<BindingIndex> { self.by_name.get(name).copied() }

	/// Union of two layouts: `other` wins on conflicting bindings, stage masks OR together,
	/// `rt_count` and `push_constant_size` take the max.
	pub fn merge(&self, other: &ShaderLayout) -> ShaderLayout {
		let mut out = self.clone();
		out.rt_count = self.rt_count.max(other.rt_count);
		out.push_constant_size = self.push_constant_size.max(other.push_constant_size);
		out.by_name.extend(other.by_name.iter().map(|(k, v)| (k.clone(), *v)));
		for (&set, bindings) in other.sets.iter() {
			let dst = out.sets.entry(set).or_default();
			for (&binding, nb) in bindings.iter() {
				match dst.entry(binding) {
					std::collections::btree_map::Entry::Occupied(mut o) => {
						let mask = o.get().stage_mask;
						let mut nb = nb.clone();
						nb.stage_mask |= mask;
						o.insert(nb);
					},
					std::collections::btree_map::Entry::Vacant(v) => {
						v.insert(nb.clone());
					},
				}
			}
		}
		out
	}
}

/// Everything reflected out of one shader binary.
#[derive(Clone, Default)]
pub struct Reflection {
	pub stage: vk::ShaderStageFlags,
	pub layout: ShaderLayout,
	pub vertex_binding: vk::VertexInputBindingDescription,
	pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
}

pub fn reflect(words: &[u32], types: &TypeInterner) -> Result<Reflection> {
	let module = dr::load_words(words).map_err(|e| Error::ShaderCompile(format!("invalid SPIR-V: {e}")))?;
	reflect_module(&module, types)
}

pub fn reflect_module(module: &dr::Module, types: &TypeInterner) -> Result<Reflection> {
	Reflector::new(module, types)?.run()
}

struct Reflector<'m> {
	defs: FxHashMap<Word, &'m dr::Instruction>,
	names: FxHashMap<Word, String>,
	member_names: FxHashMap<(Word, u32), String>,
	decorations: FxHashMap<Word, Vec<(Decoration, Option<u32>)>>,
	member_decorations: FxHashMap<(Word, u32), Vec<(Decoration, Option<u32>)>>,
	interner: &'m TypeInterner,
	stage: vk::ShaderStageFlags,
}

fn operand_id(op: &dr::Operand) -> Option<Word> {
	match op {
		dr::Operand::IdRef(id) => Some(*id),
		_ => None,
	}
}

fn operand_u32(op: &dr::Operand) -> Option<u32> {
	match op {
		dr::Operand::LiteralBit32(v) => Some(*v),
		_ => None,
	}
}

impl<'m> Reflector<'m> {
	fn new(module: &'m dr::Module, interner: &'m TypeInterner) -> Result<Self> {
		if module.entry_points.len() != 1 {
			return Err(Error::ShaderCompile(format!(
				"expected exactly one entry point, found {}",
				module.entry_points.len()
			)));
		}

		let stage = module.entry_points[0]
			.operands
			.iter()
			.find_map(|op| match op {
				dr::Operand::ExecutionModel(model) => Some(match model {
					ExecutionModel::Vertex => vk::ShaderStageFlags::VERTEX,
					ExecutionModel::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
					ExecutionModel::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
					ExecutionModel::Geometry => vk::ShaderStageFlags::GEOMETRY,
					ExecutionModel::Fragment => vk::ShaderStageFlags::FRAGMENT,
					ExecutionModel::GLCompute => vk::ShaderStageFlags::COMPUTE,
					_ => vk::ShaderStageFlags::empty(),
				}),
				_ => None,
			})
			.filter(|s| !s.is_empty())
			.ok_or_else(|| Error::ShaderCompile("unsupported execution model".into()))?;

		let mut this = Self {
			defs: FxHashMap::default(),
			names: FxHashMap::default(),
			member_names: FxHashMap::default(),
			decorations: FxHashMap::default(),
			member_decorations: FxHashMap::default(),
			interner,
			stage,
		};

		for inst in module.types_global_values.iter() {
			if let Some(id) = inst.result_id {
				this.defs.insert(id, inst);
			}
		}
		for inst in module.debug_names.iter() {
			match inst.class.opcode {
				Op::Name => {
					if let (Some(id), Some(dr::Operand::LiteralString(name))) =
						(operand_id(&inst.operands[0]), inst.operands.get(1))
					{
						this.names.insert(id, name.clone());
					}
				},
				Op::MemberName => {
					if let (Some(id), Some(member), Some(dr::Operand::LiteralString(name))) = (
						operand_id(&inst.operands[0]),
						inst.operands.get(1).and_then(operand_u32),
						inst.operands.get(2),
					) {
						this.member_names.insert((id, member), name.clone());
					}
				},
				_ => {},
			}
		}
		for inst in module.annotations.iter() {
			match inst.class.opcode {
				Op::Decorate => {
					let Some(id) = operand_id(&inst.operands[0]) else { continue };
					let Some(dr::Operand::Decoration(dec)) = inst.operands.get(1) else {
						continue;
					};
					let value = inst.operands.get(2).and_then(operand_u32);
					this.decorations.entry(id).or_default().push((*dec, value));
				},
				Op::MemberDecorate => {
					let Some(id) = operand_id(&inst.operands[0]) else { continue };
					let Some(member) = inst.operands.get(1).and_then(operand_u32) else {
						continue;
					};
					let Some(dr::Operand::Decoration(dec)) = inst.operands.get(2) else {
						continue;
					};
					let value = inst.operands.get(3).and_then(operand_u32);
					this.member_decorations
						.entry((id, member))
						.or_default()
						.push((*dec, value));
				},
				_ => {},
			}
		}

		Ok(this)
	}

	fn decoration(&self, id: Word, dec: Decoration) -> Option<u32> {
		self.decorations
			.get(&id)?
			.iter()
			.find(|(d, _)| *d == dec)
			.map(|(_, v)| v.unwrap_or(0))
	}

	fn has_decoration(&self, id: Word, dec: Decoration) -> bool { self.decoration(id, dec).is_some() }

	fn member_decoration(&self, id: Word, member: u32, dec: Decoration) -> Option<u32> {
		self.member_decorations
			.get(&(id, member))?
			.iter()
			.find(|(d, _)| *d == dec)
			.map(|(_, v)| v.unwrap_or(0))
	}

	fn def(&self, id: Word) -> Result<&'m dr::Instruction> {
		self.defs
			.get(&id)
			.copied()
			.ok_or_else(|| Error::ShaderCompile(format!("undefined id %{id}")))
	}

	fn constant_u32(&self, id: Word) -> Result<u32> {
		let inst = self.def(id)?;
		if inst.class.opcode != Op::Constant {
			return Err(Error::ShaderCompile(format!("%{id} is not a scalar constant")));
		}
		inst.operands
			.first()
			.and_then(operand_u32)
			.ok_or_else(|| Error::ShaderCompile(format!("%{id} has no 32-bit value")))
	}

	fn pointee(&self, var: &dr::Instruction) -> Result<Word> {
		let ptr = self.def(var.result_type.unwrap_or(0))?;
		if ptr.class.opcode != Op::TypePointer {
			return Err(Error::ShaderCompile("variable type is not a pointer".into()));
		}
		ptr.operands
			.get(1)
			.and_then(operand_id)
			.ok_or_else(|| Error::ShaderCompile("pointer has no pointee".into()))
	}

	fn run(mut self) -> Result<Reflection> {
		let mut layout = ShaderLayout::default();
		let mut vertex_binding =
			vk::VertexInputBindingDescription::default().input_rate(vk::VertexInputRate::VERTEX);
		let mut vertex_attributes = Vec::new();

		let variables: Vec<&dr::Instruction> = self
			.defs
			.values()
			.copied()
			.filter(|inst| inst.class.opcode == Op::Variable)
			.collect();

		// Stage IO: fragment outputs become the render-target count; vertex inputs build a
		// single interleaved binding in location order.
		let mut inputs: Vec<(u32, Word)> = Vec::new();
		for var in variables.iter() {
			let id = var.result_id.unwrap_or(0);
			let Some(dr::Operand::StorageClass(class)) = var.operands.first() else {
				continue;
			};
			let location = self.decoration(id, Decoration::Location);
			match class {
				StorageClass::Output if self.stage == vk::ShaderStageFlags::FRAGMENT => {
					if location.is_some() {
						layout.rt_count += 1;
					}
				},
				StorageClass::Input if self.stage == vk::ShaderStageFlags::VERTEX => {
					if let Some(location) = location {
						inputs.push((location, self.pointee(var)?));
					}
				},
				StorageClass::PushConstant => {
					let ty = self.build_type(self.pointee(var)?)?;
					layout.push_constant_size = layout.push_constant_size.max(ty.size);
				},
				_ => {},
			}
		}

		inputs.sort_by_key(|&(location, _)| location);
		for (location, type_id) in inputs {
			let ty = self.build_type(type_id)?;
			let (format, size) = attribute_format(&ty);
			vertex_attributes.push(
				vk::VertexInputAttributeDescription::default()
					.location(location)
					.binding(0)
					.format(format)
					.offset(vertex_binding.stride),
			);
			vertex_binding.stride += size;
		}

		for var in variables.iter() {
			let id = var.result_id.unwrap_or(0);
			let Some(dr::Operand::StorageClass(class)) = var.operands.first() else {
				continue;
			};
			if !matches!(
				class,
				StorageClass::Uniform | StorageClass::UniformConstant | StorageClass::StorageBuffer
			) {
				continue;
			}

			let pointee = self.pointee(var)?;
			let (inner, descriptor_count, unbounded) = self.peel_arrays(pointee)?;
			let inner_inst = self.def(inner)?;

			let descriptor_type = match inner_inst.class.opcode {
				Op::TypeSampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
				Op::TypeImage => {
					let dim = inner_inst.operands.get(1);
					let sampled = inner_inst.operands.get(5).and_then(operand_u32).unwrap_or(0);
					if matches!(dim, Some(dr::Operand::Dim(Dim::DimSubpassData))) {
						vk::DescriptorType::INPUT_ATTACHMENT
					} else if sampled == 2 {
						vk::DescriptorType::STORAGE_IMAGE
					} else {
						vk::DescriptorType::SAMPLED_IMAGE
					}
				},
				Op::TypeStruct => {
					if *class == StorageClass::StorageBuffer || self.has_decoration(inner, Decoration::BufferBlock) {
						vk::DescriptorType::STORAGE_BUFFER
					} else {
						vk::DescriptorType::UNIFORM_BUFFER
					}
				},
				Op::TypeSampler => {
					warn!("separate samplers are not supported, skipping binding");
					continue;
				},
				op => {
					return Err(Error::ShaderCompile(format!("unsupported resource type {op:?}")));
				},
			};

			let set = self.decoration(id, Decoration::DescriptorSet).unwrap_or(0);
			let binding = self.decoration(id, Decoration::Binding).unwrap_or(0);
			let ty = self.build_type(pointee)?;

			let name = match self.names.get(&id).filter(|n| !n.is_empty()) {
				Some(name) => name.clone(),
				None => match &ty.kind {
					SvKind::Struct { name, .. } => name.clone(),
					_ => String::new(),
				},
			};

			let mut access = Access { read: true, write: true };
			if ty.is_struct() {
				access.read = !self.block_decorated(id, inner, Decoration::NonReadable);
				access.write = !self.block_decorated(id, inner, Decoration::NonWritable);
			}

			let idx = BindingIndex { set, binding, offset: 0 };
			layout.by_name.insert(name.clone(), idx);
			if let SvKind::Struct { members, .. } = &ty.kind {
				for (member_name, member) in members.iter() {
					layout.by_name.insert(
						member_name.clone(),
						BindingIndex {
							set,
							binding,
							offset: member.offset,
						},
					);
				}
			}

			layout.sets.entry(set).or_default().insert(
				binding,
				NamedBinding {
					binding,
					descriptor_type,
					descriptor_count: if unbounded { 16 } else { descriptor_count },
					name,
					ty,
					stage_mask: self.stage,
					access,
				},
			);
		}

		Ok(Reflection {
			stage: self.stage,
			layout,
			vertex_binding,
			vertex_attributes,
		})
	}

	fn block_decorated(&self, var: Word, struct_id: Word, dec: Decoration) -> bool {
		if self.has_decoration(var, dec) || self.has_decoration(struct_id, dec) {
			return true;
		}
		let member_count = self.def(struct_id).map(|s| s.operands.len()).unwrap_or(0);
		member_count > 0 && (0..member_count as u32).all(|i| self.member_decoration(struct_id, i, dec).is_some())
	}

	/// Strip array wrappers off a resource type, returning the element type, the flattened
	/// descriptor count, and whether any dimension was unbounded.
	fn peel_arrays(&self, mut id: Word) -> Result<(Word, u32, bool)> {
		let mut count = 1u32;
		let mut unbounded = false;
		loop {
			let inst = self.def(id)?;
			match inst.class.opcode {
				Op::TypeArray => {
					let len = self.constant_u32(inst.operands.get(1).and_then(operand_id).unwrap_or(0))?;
					count = count.saturating_mul(len);
					id = inst.operands.first().and_then(operand_id).unwrap_or(0);
				},
				Op::TypeRuntimeArray => {
					unbounded = true;
					id = inst.operands.first().and_then(operand_id).unwrap_or(0);
				},
				_ => return Ok((id, count, unbounded)),
			}
		}
	}

	fn build_type(&mut self, id: Word) -> Result<Arc<SvType>> {
		let inst = self.def(id)?;
		let ty = match inst.class.opcode {
			Op::TypeBool => scalar(SvKind::Uint, 32),
			Op::TypeInt => {
				let width = inst.operands.first().and_then(operand_u32).unwrap_or(32);
				let signed = inst.operands.get(1).and_then(operand_u32).unwrap_or(0) != 0;
				scalar(if signed { SvKind::Sint } else { SvKind::Uint }, width)
			},
			Op::TypeFloat => scalar(SvKind::Float, inst.operands.first().and_then(operand_u32).unwrap_or(32)),
			Op::TypeVector => {
				let comp = self.build_type(inst.operands.first().and_then(operand_id).unwrap_or(0))?;
				let count = inst.operands.get(1).and_then(operand_u32).unwrap_or(1);
				shaped(comp.kind.clone(), comp.width, count, 1)
			},
			Op::TypeMatrix => {
				let col = self.build_type(inst.operands.first().and_then(operand_id).unwrap_or(0))?;
				let cols = inst.operands.get(1).and_then(operand_u32).unwrap_or(1);
				shaped(col.kind.clone(), col.width, col.vec, cols)
			},
			Op::TypeImage => self.image_type(inst),
			Op::TypeSampledImage => {
				let image = self.def(inst.operands.first().and_then(operand_id).unwrap_or(0))?;
				self.image_type(image)
			},
			Op::TypeSampler => SvType {
				kind: SvKind::Sampler,
				width: 1,
				vec: 1,
				cols: 1,
				size: 0,
				alignment: 1,
				array_len: 0,
			},
			Op::TypeStruct => self.struct_type(id, inst)?,
			Op::TypeArray => {
				let elem = self.build_type(inst.operands.first().and_then(operand_id).unwrap_or(0))?;
				let len = self.constant_u32(inst.operands.get(1).and_then(operand_id).unwrap_or(0))?;
				let mut ty = (*elem).clone();
				ty.array_len = if len == 0 { !0 } else { len };
				if ty.size != 0 && len != 0 {
					ty.size *= len;
				}
				ty
			},
			Op::TypeRuntimeArray => {
				let elem = self.build_type(inst.operands.first().and_then(operand_id).unwrap_or(0))?;
				let mut ty = (*elem).clone();
				ty.array_len = !0;
				ty
			},
			op => return Err(Error::ShaderCompile(format!("unsupported type {op:?}"))),
		};
		Ok(self.interner.intern(ty))
	}

	fn image_type(&self, inst: &dr::Instruction) -> SvType {
		let depth = inst.operands.get(2).and_then(operand_u32).unwrap_or(0) == 1;
		let arrayed = inst.operands.get(3).and_then(operand_u32).unwrap_or(0) != 0;
		let ms = inst.operands.get(4).and_then(operand_u32).unwrap_or(0) != 0;
		let sampled = inst.operands.get(5).and_then(operand_u32).unwrap_or(0);
		let format = match inst.operands.get(6) {
			Some(dr::Operand::ImageFormat(format)) => map_image_format(*format),
			_ => vk::Format::UNDEFINED,
		};
		let (read, write) = match inst.operands.get(7) {
			Some(dr::Operand::AccessQualifier(q)) => {
				use rspirv::spirv::AccessQualifier;
				(
					matches!(q, AccessQualifier::ReadOnly | AccessQualifier::ReadWrite),
					matches!(q, AccessQualifier::WriteOnly | AccessQualifier::ReadWrite),
				)
			},
			_ => (false, false),
		};
		SvType {
			kind: SvKind::Image(ImageMeta {
				depth,
				arrayed,
				ms,
				read,
				write,
				sampled,
				format,
			}),
			width: 1,
			vec: 1,
			cols: 1,
			size: 0,
			alignment: 1,
			array_len: 0,
		}
	}

	fn struct_type(&mut self, id: Word, inst: &'m dr::Instruction) -> Result<SvType> {
		let member_types: Vec<Word> = inst.operands.iter().filter_map(operand_id).collect();
		let mut members = BTreeMap::new();
		let mut size = 0u32;
		let mut alignment = 1u32;

		for (i, &type_id) in member_types.iter().enumerate() {
			let i = i as u32;
			let ty = self.build_type(type_id)?;
			let offset = self.member_decoration(id, i, Decoration::Offset).unwrap_or(0);
			let member_size = declared_size(&ty);
			let name = self
				.member_names
				.get(&(id, i))
				.cloned()
				.unwrap_or_else(|| format!("_{i}"));

			size = size.max(offset + member_size);
			alignment = alignment.max(ty.alignment);
			members.insert(
				name,
				SvMember {
					ty,
					idx: i,
					size: member_size,
					offset,
				},
			);
		}

		Ok(SvType {
			kind: SvKind::Struct {
				name: self.names.get(&id).cloned().unwrap_or_default(),
				members,
			},
			width: 1,
			vec: 1,
			cols: 1,
			size,
			alignment,
			array_len: 0,
		})
	}
}

fn scalar(kind: SvKind, width: u32) -> SvType { shaped(kind, width, 1, 1) }

fn shaped(kind: SvKind, width: u32, vec: u32, cols: u32) -> SvType {
	// vec3 rounds up to vec4 for alignment purposes.
	let v = if vec == 3 { 4 } else { vec };
	let alignment = (v * width / 8).max(1);
	SvType {
		kind,
		width,
		vec,
		cols,
		size: alignment * cols,
		alignment,
		array_len: 0,
	}
}

/// The tightly declared byte size, as opposed to the aligned [`SvType::size`]: a vec3 is
/// 12 declared bytes inside a struct even though it occupies a 16-byte slot.
fn declared_size(ty: &SvType) -> u32 {
	if ty.array_len == !0 {
		return 0;
	}
	let base = match &ty.kind {
		SvKind::Uint | SvKind::Sint | SvKind::Float => {
			if ty.cols > 1 {
				ty.alignment * ty.cols
			} else {
				ty.width / 8 * ty.vec
			}
		},
		SvKind::Struct { .. } => ty.size,
		SvKind::Image(_) | SvKind::Sampler => 0,
	};
	if ty.array_len != 0 {
		// `size` already carries the multiplied length for sized arrays.
		ty.size
	} else {
		base
	}
}

fn attribute_format(ty: &SvType) -> (vk::Format, u32) {
	use vk::Format as F;
	let format = match (&ty.kind, ty.width, ty.vec) {
		(SvKind::Float, 64, 1) => F::R64_SFLOAT,
		(SvKind::Float, 64, 2) => F::R64G64_SFLOAT,
		(SvKind::Float, 64, 3) => F::R64G64B64_SFLOAT,
		(SvKind::Float, 64, 4) => F::R64G64B64A64_SFLOAT,
		(SvKind::Float, 32, 1) => F::R32_SFLOAT,
		(SvKind::Float, 32, 2) => F::R32G32_SFLOAT,
		(SvKind::Float, 32, 3) => F::R32G32B32_SFLOAT,
		(SvKind::Float, 32, 4) => F::R32G32B32A32_SFLOAT,
		(SvKind::Float, 16, 1) => F::R16_SFLOAT,
		(SvKind::Float, 16, 2) => F::R16G16_SFLOAT,
		(SvKind::Float, 16, 3) => F::R16G16B16_SFLOAT,
		(SvKind::Float, 16, 4) => F::R16G16B16A16_SFLOAT,
		(SvKind::Sint, 32, 1) => F::R32_SINT,
		(SvKind::Sint, 32, 2) => F::R32G32_SINT,
		(SvKind::Sint, 32, 3) => F::R32G32B32_SINT,
		(SvKind::Sint, 32, 4) => F::R32G32B32A32_SINT,
		(SvKind::Sint, 16, 2) => F::R16G16_SINT,
		(SvKind::Sint, 16, 3) => F::R16G16B16_SINT,
		(SvKind::Sint, 16, 4) => F::R16G16B16A16_SINT,
		(SvKind::Sint, 8, 2) => F::R8G8_SINT,
		(SvKind::Sint, 8, 3) => F::R8G8B8_SINT,
		(SvKind::Sint, 8, 4) => F::R8G8B8A8_SINT,
		(SvKind::Uint, 32, 1) => F::R32_UINT,
		(SvKind::Uint, 32, 2) => F::R32G32_UINT,
		(SvKind::Uint, 32, 3) => F::R32G32B32_UINT,
		(SvKind::Uint, 32, 4) => F::R32G32B32A32_UINT,
		(SvKind::Uint, 16, 2) => F::R16G16_UINT,
		(SvKind::Uint, 16, 3) => F::R16G16B16_UINT,
		(SvKind::Uint, 16, 4) => F::R16G16B16A16_UINT,
		(SvKind::Uint, 8, 2) => F::R8G8_UINT,
		(SvKind::Uint, 8, 3) => F::R8G8B8_UINT,
		(SvKind::Uint, 8, 4) => F::R8G8B8A8_UINT,
		_ => F::UNDEFINED,
	};
	(format, ty.vec * ty.width / 8)
}

fn map_image_format(format: ImageFormat) -> vk::Format {
	use vk::Format as F;
	match format {
		ImageFormat::Rgba32f => F::R32G32B32A32_SFLOAT,
		ImageFormat::Rgba16f => F::R16G16B16A16_SFLOAT,
		ImageFormat::R32f => F::R32_SFLOAT,
		ImageFormat::Rgba8 => F::R8G8B8A8_UNORM,
		ImageFormat::Rgba8Snorm => F::R8G8B8A8_SNORM,
		ImageFormat::Rg32f => F::R32G32_SFLOAT,
		ImageFormat::Rg16f => F::R16G16_SFLOAT,
		ImageFormat::R11fG11fB10f => F::B10G11R11_UFLOAT_PACK32,
		ImageFormat::R16f => F::R16_SFLOAT,
		ImageFormat::Rgba16 => F::R16G16B16A16_UNORM,
		ImageFormat::Rgb10A2 => F::A2R10G10B10_UNORM_PACK32,
		ImageFormat::Rg16 => F::R16G16_UNORM,
		ImageFormat::Rg8 => F::R8G8_UNORM,
		ImageFormat::R16 => F::R16_UNORM,
		ImageFormat::R8 => F::R8_UNORM,
		ImageFormat::Rgba16Snorm => F::R16G16B16A16_SNORM,
		ImageFormat::Rg16Snorm => F::R16G16_SNORM,
		ImageFormat::Rg8Snorm => F::R8G8_SNORM,
		ImageFormat::R16Snorm => F::R16_SNORM,
		ImageFormat::R8Snorm => F::R8_SNORM,
		ImageFormat::Rgba32i => F::R32G32B32A32_SINT,
		ImageFormat::Rgba16i => F::R16G16B16A16_SINT,
		ImageFormat::Rgba8i => F::R8G8B8A8_SINT,
		ImageFormat::R32i => F::R32_SINT,
		ImageFormat::Rg32i => F::R32G32_SINT,
		ImageFormat::Rg16i => F::R16G16_SINT,
		ImageFormat::Rg8i => F::R8G8_SINT,
		ImageFormat::R16i => F::R16_SINT,
		ImageFormat::R8i => F::R8_SINT,
		ImageFormat::Rgba32ui => F::R32G32B32A32_UINT,
		ImageFormat::Rgba16ui => F::R16G16B16A16_UINT,
		ImageFormat::Rgba8ui => F::R8G8B8A8_UINT,
		ImageFormat::R32ui => F::R32_UINT,
		ImageFormat::Rgb10a2ui => F::A2R10G10B10_UINT_PACK32,
		ImageFormat::Rg32ui => F::R32G32_UINT,
		ImageFormat::Rg16ui => F::R16G16_UINT,
		ImageFormat::Rg8ui => F::R8G8_UINT,
		ImageFormat::R16ui => F::R16_UINT,
		ImageFormat::R8ui => F::R8_UINT,
		ImageFormat::R64ui => F::R64_UINT,
		ImageFormat::R64i => F::R64_SINT,
		_ => F::UNDEFINED,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn inst(op: Op, result_type: Option<u32>, result_id: Option<u32>, operands: Vec<dr::Operand>) -> dr::Instruction {
		dr::Instruction::new(op, result_type, result_id, operands)
	}

	struct ModuleBuilder {
		module: dr::Module,
		next_id: u32,
	}

	impl ModuleBuilder {
		fn new() -> Self {
			Self {
				module: dr::Module::new(),
				next_id: 1,
			}
		}

		fn id(&mut self) -> u32 {
			let id = self.next_id;
			self.next_id += 1;
			id
		}

		fn ty(&mut self, op: Op, operands: Vec<dr::Operand>) -> u32 {
			let id = self.id();
			self.module.types_global_values.push(inst(op, None, Some(id), operands));
			id
		}

		fn constant(&mut self, ty: u32, value: u32) -> u32 {
			let id = self.id();
			self.module
				.types_global_values
				.push(inst(Op::Constant, Some(ty), Some(id), vec![dr::Operand::LiteralBit32(value)]));
			id
		}

		fn variable(&mut self, ptr_ty: u32, class: StorageClass) -> u32 {
			let id = self.id();
			self.module
				.types_global_values
				.push(inst(Op::Variable, Some(ptr_ty), Some(id), vec![dr::Operand::StorageClass(class)]));
			id
		}

		fn pointer(&mut self, class: StorageClass, pointee: u32) -> u32 {
			self.ty(
				Op::TypePointer,
				vec![dr::Operand::StorageClass(class), dr::Operand::IdRef(pointee)],
			)
		}

		fn name(&mut self, id: u32, name: &str) {
			self.module.debug_names.push(inst(
				Op::Name,
				None,
				None,
				vec![dr::Operand::IdRef(id), dr::Operand::LiteralString(name.into())],
			));
		}

		fn member_name(&mut self, id: u32, member: u32, name: &str) {
			self.module.debug_names.push(inst(
				Op::MemberName,
				None,
				None,
				vec![
					dr::Operand::IdRef(id),
					dr::Operand::LiteralBit32(member),
					dr::Operand::LiteralString(name.into()),
				],
			));
		}

		fn decorate(&mut self, id: u32, dec: Decoration, value: Option<u32>) {
			let mut operands = vec![dr::Operand::IdRef(id), dr::Operand::Decoration(dec)];
			if let Some(value) = value {
				operands.push(dr::Operand::LiteralBit32(value));
			}
			self.module.annotations.push(inst(Op::Decorate, None, None, operands));
		}

		fn member_decorate(&mut self, id: u32, member: u32, dec: Decoration, value: Option<u32>) {
			let mut operands = vec![
				dr::Operand::IdRef(id),
				dr::Operand::LiteralBit32(member),
				dr::Operand::Decoration(dec),
			];
			if let Some(value) = value {
				operands.push(dr::Operand::LiteralBit32(value));
			}
			self.module.annotations.push(inst(Op::MemberDecorate, None, None, operands));
		}

		fn entry_point(&mut self, model: ExecutionModel, interface: Vec<u32>) {
			let main = self.id();
			let mut operands = vec![
				dr::Operand::ExecutionModel(model),
				dr::Operand::IdRef(main),
				dr::Operand::LiteralString("main".into()),
			];
			operands.extend(interface.into_iter().map(dr::Operand::IdRef));
			self.module.entry_points.push(inst(Op::EntryPoint, None, None, operands));
		}

		fn finish(self) -> dr::Module { self.module }
	}

	/// `uniform Params { mat4 M; vec3 tint; } p;` + `sampler2D tex` + one color output.
	fn fragment_fixture() -> dr::Module {
		let mut b = ModuleBuilder::new();

		let f32_ty = b.ty(Op::TypeFloat, vec![dr::Operand::LiteralBit32(32)]);
		let vec3 = b.ty(
			Op::TypeVector,
			vec![dr::Operand::IdRef(f32_ty), dr::Operand::LiteralBit32(3)],
		);
		let vec4 = b.ty(
			Op::TypeVector,
			vec![dr::Operand::IdRef(f32_ty), dr::Operand::LiteralBit32(4)],
		);
		let mat4 = b.ty(
			Op::TypeMatrix,
			vec![dr::Operand::IdRef(vec4), dr::Operand::LiteralBit32(4)],
		);

		let params = b.ty(
			Op::TypeStruct,
			vec![dr::Operand::IdRef(mat4), dr::Operand::IdRef(vec3)],
		);
		b.name(params, "Params");
		b.member_name(params, 0, "M");
		b.member_name(params, 1, "tint");
		b.decorate(params, Decoration::Block, None);
		b.member_decorate(params, 0, Decoration::Offset, Some(0));
		b.member_decorate(params, 1, Decoration::Offset, Some(64));

		let params_ptr = b.pointer(StorageClass::Uniform, params);
		let params_var = b.variable(params_ptr, StorageClass::Uniform);
		b.name(params_var, "p");
		b.decorate(params_var, Decoration::DescriptorSet, Some(0));
		b.decorate(params_var, Decoration::Binding, Some(0));

		let image = b.ty(
			Op::TypeImage,
			vec![
				dr::Operand::IdRef(f32_ty),
				dr::Operand::Dim(Dim::Dim2D),
				dr::Operand::LiteralBit32(0),
				dr::Operand::LiteralBit32(0),
				dr::Operand::LiteralBit32(0),
				dr::Operand::LiteralBit32(1),
				dr::Operand::ImageFormat(ImageFormat::Unknown),
			],
		);
		let sampled = b.ty(Op::TypeSampledImage, vec![dr::Operand::IdRef(image)]);
		let tex_ptr = b.pointer(StorageClass::UniformConstant, sampled);
		let tex_var = b.variable(tex_ptr, StorageClass::UniformConstant);
		b.name(tex_var, "tex");
		b.decorate(tex_var, Decoration::DescriptorSet, Some(0));
		b.decorate(tex_var, Decoration::Binding, Some(1));

		let out_ptr = b.pointer(StorageClass::Output, vec4);
		let out_var = b.variable(out_ptr, StorageClass::Output);
		b.decorate(out_var, Decoration::Location, Some(0));

		b.entry_point(ExecutionModel::Fragment, vec![out_var]);
		b.finish()
	}

	#[test]
	fn reflects_uniform_block_and_sampler() {
		let module = fragment_fixture();
		let interner = TypeInterner::default();
		let r = reflect_module(&module, &interner).unwrap();

		assert_eq!(r.stage, vk::ShaderStageFlags::FRAGMENT);
		assert_eq!(r.layout.rt_count, 1);

		let params = &r.layout.sets[&0][&0];
		assert_eq!(params.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
		assert_eq!(params.descriptor_count, 1);
		assert_eq!(params.name, "p");
		assert_eq!(params.ty.size, 76);

		let m = params.ty.member("M").unwrap();
		assert_eq!((m.offset, m.size), (0, 64));
		let tint = params.ty.member("tint").unwrap();
		assert_eq!((tint.offset, tint.size), (64, 12));
		assert_eq!(tint.ty.alignment, 16);

		let tex = &r.layout.sets[&0][&1];
		assert_eq!(tex.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
		assert!(tex.ty.is_image());

		assert_eq!(r.layout.index("M").unwrap(), BindingIndex { set: 0, binding: 0, offset: 0 });
		assert_eq!(
			r.layout.index("tint").unwrap(),
			BindingIndex { set: 0, binding: 0, offset: 64 }
		);
		assert_eq!(
			r.layout.index("tex").unwrap(),
			BindingIndex { set: 0, binding: 1, offset: 0 }
		);
	}

	#[test]
	fn reflection_is_pure_and_types_are_interned() {
		let module = fragment_fixture();
		let interner = TypeInterner::default();
		let a = reflect_module(&module, &interner).unwrap();
		let b = reflect_module(&module, &interner).unwrap();

		assert_eq!(a.layout, b.layout);
		assert!(Arc::ptr_eq(&a.layout.sets[&0][&0].ty, &b.layout.sets[&0][&0].ty));
		assert!(Arc::ptr_eq(&a.layout.sets[&0][&1].ty, &b.layout.sets[&0][&1].ty));
	}

	#[test]
	fn reflects_vertex_inputs_into_one_binding() {
		let mut b = ModuleBuilder::new();
		let f32_ty = b.ty(Op::TypeFloat, vec![dr::Operand::LiteralBit32(32)]);
		let vec3 = b.ty(
			Op::TypeVector,
			vec![dr::Operand::IdRef(f32_ty), dr::Operand::LiteralBit32(3)],
		);
		let vec2 = b.ty(
			Op::TypeVector,
			vec![dr::Operand::IdRef(f32_ty), dr::Operand::LiteralBit32(2)],
		);

		// Declared out of order; attributes come out in location order.
		let uv_ptr = b.pointer(StorageClass::Input, vec2);
		let uv = b.variable(uv_ptr, StorageClass::Input);
		b.decorate(uv, Decoration::Location, Some(1));
		let pos_ptr = b.pointer(StorageClass::Input, vec3);
		let pos = b.variable(pos_ptr, StorageClass::Input);
		b.decorate(pos, Decoration::Location, Some(0));

		b.entry_point(ExecutionModel::Vertex, vec![pos, uv]);
		let module = b.finish();

		let interner = TypeInterner::default();
		let r = reflect_module(&module, &interner).unwrap();

		assert_eq!(r.stage, vk::ShaderStageFlags::VERTEX);
		assert_eq!(r.vertex_binding.stride, 20);
		assert_eq!(r.vertex_attributes.len(), 2);
		assert_eq!(r.vertex_attributes[0].format, vk::Format::R32G32B32_SFLOAT);
		assert_eq!(r.vertex_attributes[0].offset, 0);
		assert_eq!(r.vertex_attributes[1].format, vk::Format::R32G32_SFLOAT);
		assert_eq!(r.vertex_attributes[1].offset, 12);
	}

	#[test]
	fn reflects_storage_buffer_access_and_runtime_arrays() {
		let mut b = ModuleBuilder::new();
		let u32_ty = b.ty(
			Op::TypeInt,
			vec![dr::Operand::LiteralBit32(32), dr::Operand::LiteralBit32(0)],
		);
		let run = b.ty(Op::TypeRuntimeArray, vec![dr::Operand::IdRef(u32_ty)]);
		let block = b.ty(
			Op::TypeStruct,
			vec![dr::Operand::IdRef(u32_ty), dr::Operand::IdRef(run)],
		);
		b.name(block, "Histogram");
		b.member_name(block, 0, "total");
		b.member_name(block, 1, "bins");
		b.member_decorate(block, 0, Decoration::Offset, Some(0));
		b.member_decorate(block, 1, Decoration::Offset, Some(4));
		b.decorate(block, Decoration::Block, None);

		let ptr = b.pointer(StorageClass::StorageBuffer, block);
		let var = b.variable(ptr, StorageClass::StorageBuffer);
		b.name(var, "histogram");
		b.decorate(var, Decoration::DescriptorSet, Some(1));
		b.decorate(var, Decoration::Binding, Some(2));
		b.decorate(var, Decoration::NonWritable, None);

		b.entry_point(ExecutionModel::GLCompute, vec![]);
		let module = b.finish();

		let interner = TypeInterner::default();
		let r = reflect_module(&module, &interner).unwrap();
		let nb = &r.layout.sets[&1][&2];

		assert_eq!(r.stage, vk::ShaderStageFlags::COMPUTE);
		assert_eq!(nb.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
		assert!(nb.ssbo());
		assert_eq!(nb.access, Access { read: true, write: false });

		let bins = nb.ty.member("bins").unwrap();
		assert_eq!(bins.ty.array_len, !0);
		assert_eq!(bins.size, 0);
		// The unsized tail contributes nothing to the declared size.
		assert_eq!(nb.ty.size, 4);
		assert_eq!(r.layout.index("bins").unwrap().offset, 4);
	}

	#[test]
	fn unbounded_image_arrays_default_to_sixteen_descriptors() {
		let mut b = ModuleBuilder::new();
		let f32_ty = b.ty(Op::TypeFloat, vec![dr::Operand::LiteralBit32(32)]);
		let image = b.ty(
			Op::TypeImage,
			vec![
				dr::Operand::IdRef(f32_ty),
				dr::Operand::Dim(Dim::Dim2D),
				dr::Operand::LiteralBit32(0),
				dr::Operand::LiteralBit32(0),
				dr::Operand::LiteralBit32(0),
				dr::Operand::LiteralBit32(1),
				dr::Operand::ImageFormat(ImageFormat::Unknown),
			],
		);
		let sampled = b.ty(Op::TypeSampledImage, vec![dr::Operand::IdRef(image)]);
		let run = b.ty(Op::TypeRuntimeArray, vec![dr::Operand::IdRef(sampled)]);
		let ptr = b.pointer(StorageClass::UniformConstant, run);
		let var = b.variable(ptr, StorageClass::UniformConstant);
		b.name(var, "textures");
		b.decorate(var, Decoration::DescriptorSet, Some(0));
		b.decorate(var, Decoration::Binding, Some(0));

		b.entry_point(ExecutionModel::Fragment, vec![]);
		let module = b.finish();

		let interner = TypeInterner::default();
		let r = reflect_module(&module, &interner).unwrap();
		let nb = &r.layout.sets[&0][&0];

		assert_eq!(nb.descriptor_count, 16);
		assert_eq!(nb.ty.array_len, !0);
	}

	#[test]
	fn merge_unions_bindings_and_or_combines_stages() {
		let frag = reflect_module(&fragment_fixture(), &TypeInterner::default()).unwrap();

		let mut vs_layout = ShaderLayout::default();
		let interner = TypeInterner::default();
		let ty = interner.intern(shaped(SvKind::Float, 32, 4, 4));
		vs_layout.sets.entry(0).or_default().insert(
			0,
			NamedBinding {
				binding: 0,
				descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
				descriptor_count: 1,
				name: "p".into(),
				ty,
				stage_mask: vk::ShaderStageFlags::VERTEX,
				access: Access::default(),
			},
		);

		let merged = vs_layout.merge(&frag.layout);
		assert_eq!(
			merged.sets[&0][&0].stage_mask,
			vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
		);
		assert_eq!(merged.rt_count, 1);
		assert!(merged.sets[&0].contains_key(&1));
	}

	#[test]
	fn push_constants_take_the_max_block_size() {
		let mut b = ModuleBuilder::new();
		let f32_ty = b.ty(Op::TypeFloat, vec![dr::Operand::LiteralBit32(32)]);
		let vec4 = b.ty(
			Op::TypeVector,
			vec![dr::Operand::IdRef(f32_ty), dr::Operand::LiteralBit32(4)],
		);
		let block = b.ty(Op::TypeStruct, vec![dr::Operand::IdRef(vec4)]);
		b.member_decorate(block, 0, Decoration::Offset, Some(0));
		let ptr = b.pointer(StorageClass::PushConstant, block);
		b.variable(ptr, StorageClass::PushConstant);
		b.entry_point(ExecutionModel::Vertex, vec![]);

		let module = b.finish();
		let r = reflect_module(&module, &TypeInterner::default()).unwrap();
		assert_eq!(r.layout.push_constant_size, 16);
	}
}
