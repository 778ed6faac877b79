//! The default fullscreen vertex shader, assembled at first use.
//!
//! Maps vertex indices 0..6 onto a screen-covering quad pair and passes UVs at location 0:
//!
//! ```glsl
//! uint u = (14u >> idx) & 1u, v = (28u >> idx) & 1u;
//! uv = vec2(u, v);
//! gl_Position = vec4(uv * 2.0 - 1.0, 0.0, 1.0);
//! ```

use rspirv::{
	binary::Assemble,
	dr,
	spirv::{AddressingModel, BuiltIn, Capability, Decoration, ExecutionModel, FunctionControl, MemoryModel, Op, StorageClass},
};

use dr::Operand;

fn inst(op: Op, result_type: Option<u32>, result_id: Option<u32>, operands: Vec<Operand>) -> dr::Instruction {
	dr::Instruction::new(op, result_type, result_id, operands)
}

/// Assemble the shader binary.
pub fn assemble() -> Vec<u32> {
	let mut module = dr::Module::new();
	let mut next = 0u32;
	let mut id = || {
		next += 1;
		next
	};

	let void = id();
	let fn_void = id();
	let f32_ty = id();
	let vec2 = id();
	let vec4 = id();
	let u32_ty = id();
	let ptr_in_u32 = id();
	let vertex_index = id();
	let ptr_out_vec4 = id();
	let position = id();
	let ptr_out_vec2 = id();
	let uv_out = id();

	let x_bits = id();
	let y_bits = id();
	let one_u = id();
	let two_f = id();
	let one_f = id();
	let zero_f = id();

	let main = id();

	module.capabilities.push(inst(
		Op::Capability,
		None,
		None,
		vec![Operand::Capability(Capability::Shader)],
	));
	module.memory_model = Some(inst(
		Op::MemoryModel,
		None,
		None,
		vec![
			Operand::AddressingModel(AddressingModel::Logical),
			Operand::MemoryModel(MemoryModel::GLSL450),
		],
	));
	module.entry_points.push(inst(
		Op::EntryPoint,
		None,
		None,
		vec![
			Operand::ExecutionModel(ExecutionModel::Vertex),
			Operand::IdRef(main),
			Operand::LiteralString("main".into()),
			Operand::IdRef(vertex_index),
			Operand::IdRef(position),
			Operand::IdRef(uv_out),
		],
	));

	let decorate = |target: u32, dec: Decoration, value: Option<u32>| {
		let mut operands = vec![Operand::IdRef(target), Operand::Decoration(dec)];
		if let Some(value) = value {
			operands.push(Operand::LiteralBit32(value));
		}
		inst(Op::Decorate, None, None, operands)
	};
	module
		.annotations
		.push(inst(Op::Decorate, None, None, vec![
			Operand::IdRef(vertex_index),
			Operand::Decoration(Decoration::BuiltIn),
			Operand::BuiltIn(BuiltIn::VertexIndex),
		]));
	module
		.annotations
		.push(inst(Op::Decorate, None, None, vec![
			Operand::IdRef(position),
			Operand::Decoration(Decoration::BuiltIn),
			Operand::BuiltIn(BuiltIn::Position),
		]));
	module.annotations.push(decorate(uv_out, Decoration::Location, Some(0)));

	let types = &mut module.types_global_values;
	types.push(inst(Op::TypeVoid, None, Some(void), vec![]));
	types.push(inst(Op::TypeFunction, None, Some(fn_void), vec![Operand::IdRef(void)]));
	types.push(inst(Op::TypeFloat, None, Some(f32_ty), vec![Operand::LiteralBit32(32)]));
	types.push(inst(Op::TypeVector, None, Some(vec2), vec![
		Operand::IdRef(f32_ty),
		Operand::LiteralBit32(2),
	]));
	types.push(inst(Op::TypeVector, None, Some(vec4), vec![
		Operand::IdRef(f32_ty),
		Operand::LiteralBit32(4),
	]));
	types.push(inst(Op::TypeInt, None, Some(u32_ty), vec![
		Operand::LiteralBit32(32),
		Operand::LiteralBit32(0),
	]));
	types.push(inst(Op::TypePointer, None, Some(ptr_in_u32), vec![
		Operand::StorageClass(StorageClass::Input),
		Operand::IdRef(u32_ty),
	]));
	types.push(inst(Op::Variable, Some(ptr_in_u32), Some(vertex_index), vec![Operand::StorageClass(
		StorageClass::Input,
	)]));
	types.push(inst(Op::TypePointer, None, Some(ptr_out_vec4), vec![
		Operand::StorageClass(StorageClass::Output),
		Operand::IdRef(vec4),
	]));
	types.push(inst(Op::Variable, Some(ptr_out_vec4), Some(position), vec![Operand::StorageClass(
		StorageClass::Output,
	)]));
	types.push(inst(Op::TypePointer, None, Some(ptr_out_vec2), vec![
		Operand::StorageClass(StorageClass::Output),
		Operand::IdRef(vec2),
	]));
	types.push(inst(Op::Variable, Some(ptr_out_vec2), Some(uv_out), vec![Operand::StorageClass(
		StorageClass::Output,
	)]));

	types.push(inst(Op::Constant, Some(u32_ty), Some(x_bits), vec![Operand::LiteralBit32(0b0001110)]));
	types.push(inst(Op::Constant, Some(u32_ty), Some(y_bits), vec![Operand::LiteralBit32(0b0011100)]));
	types.push(inst(Op::Constant, Some(u32_ty), Some(one_u), vec![Operand::LiteralBit32(1)]));
	types.push(inst(Op::Constant, Some(f32_ty), Some(two_f), vec![Operand::LiteralBit32(2.0f32.to_bits())]));
	types.push(inst(Op::Constant, Some(f32_ty), Some(one_f), vec![Operand::LiteralBit32(1.0f32.to_bits())]));
	types.push(inst(Op::Constant, Some(f32_ty), Some(zero_f), vec![Operand::LiteralBit32(0.0f32.to_bits())]));

	let label = id();
	let idx = id();
	let sx = id();
	let ux = id();
	let sy = id();
	let uy = id();
	let fx = id();
	let fy = id();
	let uv = id();
	let x2 = id();
	let x = id();
	let y2 = id();
	let y = id();
	let pos = id();

	let body = vec![
		inst(Op::Load, Some(u32_ty), Some(idx), vec![Operand::IdRef(vertex_index)]),
		inst(Op::ShiftRightLogical, Some(u32_ty), Some(sx), vec![
			Operand::IdRef(x_bits),
			Operand::IdRef(idx),
		]),
		inst(Op::BitwiseAnd, Some(u32_ty), Some(ux), vec![
			Operand::IdRef(sx),
			Operand::IdRef(one_u),
		]),
		inst(Op::ShiftRightLogical, Some(u32_ty), Some(sy), vec![
			Operand::IdRef(y_bits),
			Operand::IdRef(idx),
		]),
		inst(Op::BitwiseAnd, Some(u32_ty), Some(uy), vec![
			Operand::IdRef(sy),
			Operand::IdRef(one_u),
		]),
		inst(Op::ConvertUToF, Some(f32_ty), Some(fx), vec![Operand::IdRef(ux)]),
		inst(Op::ConvertUToF, Some(f32_ty), Some(fy), vec![Operand::IdRef(uy)]),
		inst(Op::CompositeConstruct, Some(vec2), Some(uv), vec![
			Operand::IdRef(fx),
			Operand::IdRef(fy),
		]),
		inst(Op::FMul, Some(f32_ty), Some(x2), vec![Operand::IdRef(fx), Operand::IdRef(two_f)]),
		inst(Op::FSub, Some(f32_ty), Some(x), vec![Operand::IdRef(x2), Operand::IdRef(one_f)]),
		inst(Op::FMul, Some(f32_ty), Some(y2), vec![Operand::IdRef(fy), Operand::IdRef(two_f)]),
		inst(Op::FSub, Some(f32_ty), Some(y), vec![Operand::IdRef(y2), Operand::IdRef(one_f)]),
		inst(Op::CompositeConstruct, Some(vec4), Some(pos), vec![
			Operand::IdRef(x),
			Operand::IdRef(y),
			Operand::IdRef(zero_f),
			Operand::IdRef(one_f),
		]),
		inst(Op::Store, None, None, vec![Operand::IdRef(position), Operand::IdRef(pos)]),
		inst(Op::Store, None, None, vec![Operand::IdRef(uv_out), Operand::IdRef(uv)]),
		inst(Op::Return, None, None, vec![]),
	];

	module.functions.push(dr::Function {
		def: Some(inst(Op::Function, Some(void), Some(main), vec![
			Operand::FunctionControl(FunctionControl::NONE),
			Operand::IdRef(fn_void),
		])),
		end: Some(inst(Op::FunctionEnd, None, None, vec![])),
		parameters: Vec::new(),
		blocks: vec![dr::Block {
			label: Some(inst(Op::Label, None, Some(label), vec![])),
			instructions: body,
		}],
	});

	let mut header = dr::ModuleHeader::new(next + 1);
	header.set_version(1, 0);
	module.header = Some(header);

	module.assemble()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn assembles_a_vertex_shader() {
		let words = assemble();
		// SPIR-V magic number.
		assert_eq!(words[0], 0x0723_0203);

		let module = dr::load_words(&words).unwrap();
		let r = crate::shader::reflect::reflect_module(&module, &crate::shader::TypeInterner::default()).unwrap();
		assert_eq!(r.stage, ash::vk::ShaderStageFlags::VERTEX);
		// Only builtins and outputs; no vertex attributes to bind.
		assert!(r.vertex_attributes.is_empty());
		assert!(r.layout.sets.is_empty());
	}
}
