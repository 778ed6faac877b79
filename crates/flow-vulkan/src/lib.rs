//! A thin but disciplined layer above raw Vulkan: device memory, state-tracked resources,
//! reflected descriptor layouts, name-addressed passes, timeline-synchronised submission,
//! cross-process sharing, and a time-windowed transient resource pool.

use std::fmt::{Debug, Display};

pub use ash;
use ash::vk;

pub mod alloc;
pub mod cmd;
pub mod descriptor;
pub mod device;
pub mod interop;
pub mod pass;
pub mod pipeline;
pub mod platform;
pub mod pool;
pub mod resource;
pub mod shader;
pub mod stream;
pub mod sync;

#[derive(Clone)]
pub enum Error {
	HostOom,
	DeviceOom,
	DeviceLost,
	LayerMissing(String),
	ExtensionMissing(String),
	FeatureMissing(&'static str),
	InvalidExternalHandle,
	UnsupportedFormat(vk::Format),
	PoolExhausted,
	Timeout,
	FenceNotSignalled,
	ShaderCompile(String),
	Vulkan(vk::Result),
	Message(String),
}

impl Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::HostOom => write!(f, "out of host memory"),
			Error::DeviceOom => write!(f, "out of device memory"),
			Error::DeviceLost => write!(f, "device lost"),
			Error::LayerMissing(name) => write!(f, "layer missing: {}", name),
			Error::ExtensionMissing(name) => write!(f, "extension missing: {}", name),
			Error::FeatureMissing(name) => write!(f, "feature missing: {}", name),
			Error::InvalidExternalHandle => write!(f, "invalid external handle"),
			Error::UnsupportedFormat(fmt) => write!(f, "unsupported format: {:?}", fmt),
			Error::PoolExhausted => write!(f, "pool exhausted"),
			Error::Timeout => write!(f, "timed out"),
			Error::FenceNotSignalled => write!(f, "fence not signalled"),
			Error::ShaderCompile(msg) => write!(f, "shader compile error: {}", msg),
			Error::Vulkan(res) => write!(f, "Vulkan error: {}", res),
			Error::Message(msg) => write!(f, "{}", msg),
		}
	}
}

impl Debug for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result { <Self as Display>::fmt(self, f) }
}

impl From<String> for Error {
	fn from(message: String) -> Self { Error::Message(message) }
}

impl From<vk::Result> for Error {
	fn from(result: vk::Result) -> Self {
		match result {
			vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::HostOom,
			vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::DeviceOom,
			vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
			vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => Error::InvalidExternalHandle,
			vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Error::UnsupportedFormat(vk::Format::UNDEFINED),
			vk::Result::ERROR_OUT_OF_POOL_MEMORY => Error::PoolExhausted,
			vk::Result::TIMEOUT => Error::Timeout,
			res => Error::Vulkan(res),
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
