//! Images and buffers: creation, state tracking, transfer operations, cached views.

use ash::vk;

use crate::interop::{MemoryExportInfo, MemoryProps, PLATFORM_EXTERNAL_MEMORY_HANDLE_TYPE};

pub mod buffer;
pub mod image;

pub use buffer::{Buffer, BufferCreateInfo, BufferMemoryState};
pub use image::{Image, ImageCreateInfo, ImageState, ImageView};

/// Formats whose chroma samples halve the logical width; they are viewed as
/// `R8G8B8A8_UNORM` after YCbCr conversion.
pub fn is_ycbcr(format: vk::Format) -> bool {
	use vk::Format as F;
	matches!(
		format,
		F::G8B8G8R8_422_UNORM
			| F::B8G8R8G8_422_UNORM
			| F::R10X6_UNORM_PACK16
			| F::R10X6G10X6_UNORM_2PACK16
			| F::R10X6G10X6B10X6A10X6_UNORM_4PACK16
			| F::G10X6B10X6G10X6R10X6_422_UNORM_4PACK16
			| F::B10X6G10X6R10X6G10X6_422_UNORM_4PACK16
			| F::R12X4_UNORM_PACK16
			| F::R12X4G12X4_UNORM_2PACK16
			| F::R12X4G12X4B12X4A12X4_UNORM_4PACK16
			| F::G12X4B12X4G12X4R12X4_422_UNORM_4PACK16
			| F::B12X4G12X4R12X4G12X4_422_UNORM_4PACK16
			| F::G16B16G16R16_422_UNORM
			| F::B16G16R16G16_422_UNORM
			| F::G16_B16_R16_3PLANE_420_UNORM
			| F::G16_B16R16_2PLANE_420_UNORM
			| F::G16_B16_R16_3PLANE_422_UNORM
			| F::G16_B16R16_2PLANE_422_UNORM
			| F::G16_B16_R16_3PLANE_444_UNORM
			| F::G12X4_B12X4_R12X4_3PLANE_420_UNORM_3PACK16
			| F::G12X4_B12X4R12X4_2PLANE_420_UNORM_3PACK16
			| F::G12X4_B12X4_R12X4_3PLANE_422_UNORM_3PACK16
			| F::G12X4_B12X4R12X4_2PLANE_422_UNORM_3PACK16
			| F::G12X4_B12X4_R12X4_3PLANE_444_UNORM_3PACK16
			| F::G8_B8_R8_3PLANE_420_UNORM
			| F::G8_B8R8_2PLANE_420_UNORM
			| F::G8_B8_R8_3PLANE_422_UNORM
			| F::G8_B8R8_2PLANE_422_UNORM
			| F::G8_B8_R8_3PLANE_444_UNORM
			| F::G10X6_B10X6_R10X6_3PLANE_420_UNORM_3PACK16
			| F::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16
			| F::G10X6_B10X6_R10X6_3PLANE_422_UNORM_3PACK16
			| F::G10X6_B10X6R10X6_2PLANE_422_UNORM_3PACK16
			| F::G10X6_B10X6_R10X6_3PLANE_444_UNORM_3PACK16
	)
}

/// Build export information shared by both resource kinds.
pub(crate) fn export_info(alloc: &crate::alloc::Allocation, size: u64, mem_props: MemoryProps) -> MemoryExportInfo {
	MemoryExportInfo {
		handle_type: alloc.handle_type(),
		pid: alloc.owner_pid(),
		handle: alloc.os_handle(),
		offset: alloc.global_offset(),
		size,
		allocation_size: alloc.allocation_size(),
		mem_props,
	}
}

pub(crate) fn default_handle_type() -> vk::ExternalMemoryHandleTypeFlags { PLATFORM_EXTERNAL_MEMORY_HANDLE_TYPE }
