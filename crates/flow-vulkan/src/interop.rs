//! The seam to a foreign GPU API: shareable handle creation and format mapping.
//!
//! The crate never talks to DirectX itself; an embedder that needs D3D-backed heaps,
//! fences, or textures injects a [`NativeInterop`] implementation.

use ash::vk;

use crate::{platform::OsHandle, Result};

/// The external handle type native to this platform.
#[cfg(windows)]
pub const PLATFORM_EXTERNAL_MEMORY_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
	vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32;
#[cfg(unix)]
pub const PLATFORM_EXTERNAL_MEMORY_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
	vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD;

#[cfg(windows)]
pub const PLATFORM_EXTERNAL_SEMAPHORE_HANDLE_TYPE: vk::ExternalSemaphoreHandleTypeFlags =
	vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32;
#[cfg(unix)]
pub const PLATFORM_EXTERNAL_SEMAPHORE_HANDLE_TYPE: vk::ExternalSemaphoreHandleTypeFlags =
	vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD;

/// How a resource's memory should behave on the host side.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct MemoryProps {
	pub mapped: bool,
	pub vram: bool,
	pub download: bool,
	pub alignment: u32,
}

/// Everything a consumer needs to import a resource's memory from another process.
///
/// The consumer duplicates `handle` out of process `pid` before allocating.
#[derive(Copy, Clone, Default, Debug)]
pub struct MemoryExportInfo {
	pub handle_type: vk::ExternalMemoryHandleTypeFlags,
	pub pid: u64,
	pub handle: OsHandle,
	/// Byte offset of the resource within the exported memory object.
	pub offset: u64,
	pub size: u64,
	pub allocation_size: u64,
	pub mem_props: MemoryProps,
}

/// Shareable-object creation backed by a foreign GPU API (D3D11/D3D12).
///
/// Implementations create heaps/fences/textures with the SHARED flag and return
/// NT handles opened with `GENERIC_ALL` access.
pub trait NativeInterop: Send + Sync {
	fn create_shared_memory(&self, size: u64) -> Result<OsHandle>;

	fn create_shared_sync(&self) -> Result<OsHandle>;

	fn create_shared_texture(&self, extent: vk::Extent2D, format: vk::Format) -> Result<OsHandle>;
}

/// A `DXGI_FORMAT` value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct DxgiFormat(pub u32);

impl DxgiFormat {
	pub const B8G8R8A8_UNORM: Self = Self(87);
	pub const B8G8R8A8_UNORM_SRGB: Self = Self(91);
	pub const D16_UNORM: Self = Self(55);
	pub const D24_UNORM_S8_UINT: Self = Self(45);
	pub const D32_FLOAT: Self = Self(40);
	pub const R10G10B10A2_UINT: Self = Self(25);
	pub const R10G10B10A2_UNORM: Self = Self(24);
	pub const R11G11B10_FLOAT: Self = Self(26);
	pub const R16G16B16A16_FLOAT: Self = Self(10);
	pub const R16G16B16A16_SINT: Self = Self(14);
	pub const R16G16B16A16_SNORM: Self = Self(13);
	pub const R16G16B16A16_UINT: Self = Self(12);
	pub const R16G16B16A16_UNORM: Self = Self(11);
	pub const R16G16_FLOAT: Self = Self(34);
	pub const R16G16_SINT: Self = Self(38);
	pub const R16G16_SNORM: Self = Self(37);
	pub const R16G16_UINT: Self = Self(36);
	pub const R16G16_UNORM: Self = Self(35);
	pub const R16_FLOAT: Self = Self(54);
	pub const R16_SINT: Self = Self(59);
	pub const R16_SNORM: Self = Self(58);
	pub const R16_UINT: Self = Self(57);
	pub const R16_UNORM: Self = Self(56);
	pub const R32G32B32A32_FLOAT: Self = Self(2);
	pub const R32G32B32A32_SINT: Self = Self(4);
	pub const R32G32B32A32_UINT: Self = Self(3);
	pub const R32G32_FLOAT: Self = Self(16);
	pub const R32G32_SINT: Self = Self(18);
	pub const R32G32_UINT: Self = Self(17);
	pub const R32_FLOAT: Self = Self(41);
	pub const R32_SINT: Self = Self(43);
	pub const R32_UINT: Self = Self(42);
	pub const R8G8B8A8_SINT: Self = Self(32);
	pub const R8G8B8A8_SNORM: Self = Self(31);
	pub const R8G8B8A8_UINT: Self = Self(30);
	pub const R8G8B8A8_UNORM: Self = Self(28);
	pub const R8G8B8A8_UNORM_SRGB: Self = Self(29);
	pub const R8G8_UNORM: Self = Self(49);
	pub const R8_SINT: Self = Self(64);
	pub const R8_SNORM: Self = Self(63);
	pub const R8_UINT: Self = Self(62);
	pub const R8_UNORM: Self = Self(61);
	pub const UNKNOWN: Self = Self(0);
}

const FORMAT_TABLE: &[(vk::Format, DxgiFormat)] = &[
	(vk::Format::R8G8B8A8_UNORM, DxgiFormat::R8G8B8A8_UNORM),
	(vk::Format::R8G8B8A8_SRGB, DxgiFormat::R8G8B8A8_UNORM_SRGB),
	(vk::Format::R8G8B8A8_UINT, DxgiFormat::R8G8B8A8_UINT),
	(vk::Format::R8G8B8A8_SNORM, DxgiFormat::R8G8B8A8_SNORM),
	(vk::Format::R8G8B8A8_SINT, DxgiFormat::R8G8B8A8_SINT),
	(vk::Format::B8G8R8A8_UNORM, DxgiFormat::B8G8R8A8_UNORM),
	(vk::Format::B8G8R8A8_SRGB, DxgiFormat::B8G8R8A8_UNORM_SRGB),
	(vk::Format::R16G16B16A16_SFLOAT, DxgiFormat::R16G16B16A16_FLOAT),
	(vk::Format::R16G16B16A16_UNORM, DxgiFormat::R16G16B16A16_UNORM),
	(vk::Format::R16G16B16A16_UINT, DxgiFormat::R16G16B16A16_UINT),
	(vk::Format::R16G16B16A16_SNORM, DxgiFormat::R16G16B16A16_SNORM),
	(vk::Format::R16G16B16A16_SINT, DxgiFormat::R16G16B16A16_SINT),
	(vk::Format::R32G32B32A32_SFLOAT, DxgiFormat::R32G32B32A32_FLOAT),
	(vk::Format::R32G32B32A32_UINT, DxgiFormat::R32G32B32A32_UINT),
	(vk::Format::R32G32B32A32_SINT, DxgiFormat::R32G32B32A32_SINT),
	(vk::Format::R32G32_SFLOAT, DxgiFormat::R32G32_FLOAT),
	(vk::Format::R32G32_UINT, DxgiFormat::R32G32_UINT),
	(vk::Format::R32G32_SINT, DxgiFormat::R32G32_SINT),
	(vk::Format::R16G16_SFLOAT, DxgiFormat::R16G16_FLOAT),
	(vk::Format::R16G16_UNORM, DxgiFormat::R16G16_UNORM),
	(vk::Format::R16G16_UINT, DxgiFormat::R16G16_UINT),
	(vk::Format::R16G16_SNORM, DxgiFormat::R16G16_SNORM),
	(vk::Format::R16G16_SINT, DxgiFormat::R16G16_SINT),
	(vk::Format::R32_SFLOAT, DxgiFormat::R32_FLOAT),
	(vk::Format::R32_UINT, DxgiFormat::R32_UINT),
	(vk::Format::R32_SINT, DxgiFormat::R32_SINT),
	(vk::Format::D32_SFLOAT, DxgiFormat::D32_FLOAT),
	(vk::Format::R16_SFLOAT, DxgiFormat::R16_FLOAT),
	(vk::Format::D16_UNORM, DxgiFormat::D16_UNORM),
	(vk::Format::R16_UNORM, DxgiFormat::R16_UNORM),
	(vk::Format::R16_UINT, DxgiFormat::R16_UINT),
	(vk::Format::R16_SNORM, DxgiFormat::R16_SNORM),
	(vk::Format::R16_SINT, DxgiFormat::R16_SINT),
	(vk::Format::R8G8_UNORM, DxgiFormat::R8G8_UNORM),
	(vk::Format::R8_UNORM, DxgiFormat::R8_UNORM),
	(vk::Format::R8_UINT, DxgiFormat::R8_UINT),
	(vk::Format::R8_SNORM, DxgiFormat::R8_SNORM),
	(vk::Format::R8_SINT, DxgiFormat::R8_SINT),
	(vk::Format::A2B10G10R10_UNORM_PACK32, DxgiFormat::R10G10B10A2_UNORM),
	(vk::Format::A2B10G10R10_UINT_PACK32, DxgiFormat::R10G10B10A2_UINT),
	(vk::Format::B10G11R11_UFLOAT_PACK32, DxgiFormat::R11G11B10_FLOAT),
	(vk::Format::D24_UNORM_S8_UINT, DxgiFormat::D24_UNORM_S8_UINT),
];

pub fn format_to_dxgi(format: vk::Format) -> DxgiFormat {
	FORMAT_TABLE
		.iter()
		.find(|(f, _)| *f == format)
		.map(|(_, d)| *d)
		.unwrap_or(DxgiFormat::UNKNOWN)
}

pub fn dxgi_to_format(format: DxgiFormat) -> vk::Format {
	FORMAT_TABLE
		.iter()
		.find(|(_, d)| *d == format)
		.map(|(f, _)| *f)
		.unwrap_or(vk::Format::UNDEFINED)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn format_table_round_trips() {
		for &(vk_fmt, dxgi) in FORMAT_TABLE {
			assert_eq!(format_to_dxgi(vk_fmt), dxgi);
			assert_eq!(dxgi_to_format(dxgi), vk_fmt);
		}
	}

	#[test]
	fn unmapped_formats_are_unknown() {
		assert_eq!(format_to_dxgi(vk::Format::E5B9G9R9_UFLOAT_PACK32), DxgiFormat::UNKNOWN);
		assert_eq!(dxgi_to_format(DxgiFormat(9999)), vk::Format::UNDEFINED);
	}
}
