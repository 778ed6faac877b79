//! Instance and device bring-up.
//!
//! `samplerYcbcrConversion` and `timelineSemaphore` are hard requirements; devices missing
//! `synchronization2` or `dynamicRendering` get the declared fallback paths instead of
//! being rejected.

use std::ffi::{c_void, CStr, CString};

use ash::{ext, khr, vk};
use tracing::{info, warn};

use crate::{
	device::{Device, Features},
	Error,
	Result,
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[cfg(windows)]
const DEVICE_EXTENSIONS: [&CStr; 2] = [khr::external_memory_win32::NAME, khr::external_semaphore_win32::NAME];
#[cfg(unix)]
const DEVICE_EXTENSIONS: [&CStr; 2] = [khr::external_memory_fd::NAME, khr::external_semaphore_fd::NAME];

/// Context construction options. Validation must be decided before the instance exists.
pub struct ContextBuilder {
	validation: bool,
	app_name: CString,
}

impl Default for ContextBuilder {
	fn default() -> Self {
		Self {
			validation: false,
			app_name: CString::new("flow").unwrap(),
		}
	}
}

impl ContextBuilder {
	pub fn validation(mut self, enable: bool) -> Self {
		self.validation = enable;
		self
	}

	pub fn app_name(mut self, name: &str) -> Self {
		self.app_name = CString::new(name).unwrap();
		self
	}

	pub fn build(self) -> Result<Context> {
		let entry = match unsafe { ash::Entry::load() } {
			Ok(entry) => entry,
			Err(err) => return Err(format!("failed to load Vulkan: {err}").into()),
		};

		let mut layers: Vec<&CStr> = Vec::new();
		if self.validation {
			let available = unsafe { entry.enumerate_instance_layer_properties()? };
			let present = available
				.iter()
				.any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
			if !present {
				return Err(Error::LayerMissing(VALIDATION_LAYER.to_string_lossy().into_owned()));
			}
			layers.push(VALIDATION_LAYER);
		}

		let debug_utils_available = unsafe {
			entry
				.enumerate_instance_extension_properties(None)?
				.iter()
				.any(|props| CStr::from_ptr(props.extension_name.as_ptr()) == ext::debug_utils::NAME)
		};
		let mut extensions: Vec<&CStr> = Vec::new();
		if self.validation && debug_utils_available {
			extensions.push(ext::debug_utils::NAME);
		}

		let instance = unsafe {
			entry.create_instance(
				&vk::InstanceCreateInfo::default()
					.application_info(
						&vk::ApplicationInfo::default()
							.application_name(&self.app_name)
							.engine_name(&self.app_name)
							.api_version(vk::make_api_version(0, 1, 3, 0)),
					)
					.enabled_layer_names(&layers.iter().map(|x| x.as_ptr()).collect::<Vec<_>>())
					.enabled_extension_names(&extensions.iter().map(|x| x.as_ptr()).collect::<Vec<_>>()),
				None,
			)?
		};

		let messenger = if self.validation && debug_utils_available {
			let loader = ext::debug_utils::Instance::new(&entry, &instance);
			unsafe {
				loader
					.create_debug_utils_messenger(
						&vk::DebugUtilsMessengerCreateInfoEXT::default()
							.message_severity(
								vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
									| vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
							)
							.message_type(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION)
							.pfn_user_callback(Some(debug_messenger)),
						None,
					)
					.ok()
					.map(|m| (loader, m))
			}
		} else {
			None
		};

		let mut devices = Vec::new();
		for physical_device in unsafe { instance.enumerate_physical_devices()? } {
			match create_device(&entry, &instance, physical_device) {
				Ok(Some(device)) => devices.push(device),
				Ok(None) => {},
				Err(err) => warn!("failed to create device: {err}"),
			}
		}

		// Discrete adapters come first.
		devices.sort_by_key(|d| {
			let props = unsafe { instance.get_physical_device_properties(d.physical_device()) };
			match props.device_type {
				vk::PhysicalDeviceType::DISCRETE_GPU => 0,
				vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
				vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
				_ => 3,
			}
		});

		Ok(Context {
			devices,
			messenger,
			instance,
			entry,
		})
	}
}

unsafe extern "system" fn debug_messenger(
	severity: vk::DebugUtilsMessageSeverityFlagsEXT, _: vk::DebugUtilsMessageTypeFlagsEXT,
	cb: *const vk::DebugUtilsMessengerCallbackDataEXT, _: *mut c_void,
) -> u32 {
	unsafe {
		let cb = &*cb;
		let message = CStr::from_ptr(cb.p_message).to_string_lossy();
		match severity {
			vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[{}] {}", cb.message_id_number, message),
			_ => tracing::error!("[{}] {}", cb.message_id_number, message),
		}
	}
	0
}

fn create_device(
	entry: &ash::Entry, instance: &ash::Instance, physical_device: vk::PhysicalDevice,
) -> Result<Option<Device>> {
	let props = unsafe { instance.get_physical_device_properties(physical_device) };
	let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
		.to_string_lossy()
		.into_owned();
	if props.api_version < vk::make_api_version(0, 1, 3, 0) {
		warn!("{name} does not support Vulkan 1.3");
		return Ok(None);
	}

	let mut features11 = vk::PhysicalDeviceVulkan11Features::default();
	let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
	let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
	{
		let mut features2 = vk::PhysicalDeviceFeatures2::default()
			.push_next(&mut features11)
			.push_next(&mut features12)
			.push_next(&mut features13);
		unsafe {
			instance.get_physical_device_features2(physical_device, &mut features2);
		}
	}

	if features11.sampler_ycbcr_conversion == 0 {
		warn!("{name} does not support samplerYcbcrConversion");
		return Ok(None);
	}
	if features12.timeline_semaphore == 0 {
		warn!("{name} does not support timelineSemaphore");
		return Ok(None);
	}
	let features = Features {
		ycbcr: true,
		timeline: true,
		sync2: features13.synchronization2 != 0,
		dynamic_rendering: features13.dynamic_rendering != 0,
		copy2: features13.synchronization2 != 0,
	};
	if !features.sync2 {
		info!("{name}: synchronization2 unavailable, using the sync1 fallback");
	}
	if !features.dynamic_rendering {
		info!("{name}: dynamicRendering unavailable, using the renderpass fallback");
	}

	let available = unsafe { instance.enumerate_device_extension_properties(physical_device)? };
	for ext in DEVICE_EXTENSIONS {
		let present = available
			.iter()
			.any(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) } == ext);
		if !present {
			warn!("{name} does not support {}", ext.to_string_lossy());
			return Ok(None);
		}
	}

	let queue_family = unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
		.iter()
		.position(|family| {
			family
				.queue_flags
				.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
		});
	let Some(queue_family) = queue_family else {
		warn!("{name} has no graphics+compute queue");
		return Ok(None);
	};

	let mut enable11 = vk::PhysicalDeviceVulkan11Features::default().sampler_ycbcr_conversion(true);
	let mut enable12 = vk::PhysicalDeviceVulkan12Features::default()
		.timeline_semaphore(true)
		.host_query_reset(true);
	let mut enable13 = vk::PhysicalDeviceVulkan13Features::default()
		.synchronization2(features.sync2)
		.dynamic_rendering(features.dynamic_rendering);
	let mut enable = vk::PhysicalDeviceFeatures2::default()
		.push_next(&mut enable11)
		.push_next(&mut enable12)
		.push_next(&mut enable13);

	let extensions: Vec<_> = DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();
	let device = unsafe {
		instance.create_device(
			physical_device,
			&vk::DeviceCreateInfo::default()
				.queue_create_infos(&[vk::DeviceQueueCreateInfo::default()
					.queue_family_index(queue_family as u32)
					.queue_priorities(&[1.0])])
				.enabled_extension_names(&extensions)
				.push_next(&mut enable),
			None,
		)?
	};
	info!("created device: {name}");

	let luid = device_luid(instance, physical_device);
	Device::from_parts(
		entry.clone(),
		instance.clone(),
		physical_device,
		device,
		features,
		name,
		luid,
		queue_family as u32,
	)
	.map(Some)
}

fn device_luid(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> u64 {
	let mut id_props = vk::PhysicalDeviceIDProperties::default();
	let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut id_props);
	unsafe {
		instance.get_physical_device_properties2(physical_device, &mut props);
	}
	if id_props.device_luid_valid != 0 {
		u64::from_le_bytes(id_props.device_luid)
	} else {
		0
	}
}

/// The loader, instance, and every usable device, ordered discrete-first.
///
/// Devices (and their clones) must not outlive the context that created them.
pub struct Context {
	pub devices: Vec<Device>,
	messenger: Option<(ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
	instance: ash::Instance,
	entry: ash::Entry,
}

impl Context {
	pub fn builder() -> ContextBuilder { ContextBuilder::default() }

	pub fn new() -> Result<Context> { ContextBuilder::default().build() }

	pub fn entry(&self) -> &ash::Entry { &self.entry }

	pub fn instance(&self) -> &ash::Instance { &self.instance }

	/// The device whose adapter LUID matches, if any.
	pub fn device_for_luid(&self, luid: u64) -> Option<&Device> {
		self.devices.iter().find(|d| d.luid() == luid)
	}
}

impl Drop for Context {
	fn drop(&mut self) {
		// Devices go first; they borrow the instance.
		self.devices.clear();
		unsafe {
			if let Some((loader, messenger)) = self.messenger.take() {
				loader.destroy_debug_utils_messenger(messenger, None);
			}
			self.instance.destroy_instance(None);
		}
	}
}
