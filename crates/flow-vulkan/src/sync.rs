//! Timeline semaphores with exportable OS handles.
//!
//! These are the only cross-submission ordering primitive: wait/signal groups on command
//! buffers carry monotonically increasing 64-bit values, and the exported handle lets other
//! processes and GPU APIs wait on the same timeline.

use ash::{khr, vk};

use crate::{
	device::Device,
	interop::PLATFORM_EXTERNAL_SEMAPHORE_HANDLE_TYPE,
	platform::{self, OsHandle},
	Error, Result,
};

#[cfg(windows)]
const GENERIC_ALL: u32 = 0x10000000;

pub struct Semaphore {
	device: ash::Device,
	handle: vk::Semaphore,
	os_handle: OsHandle,
	/// The process the semaphore was imported from, if any.
	pid: u64,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
	/// Create an exportable timeline semaphore starting at zero.
	pub fn new(device: &Device) -> Result<Self> { Self::create(device, None) }

	/// Wrap a timeline semaphore exported by process `pid`.
	pub fn import(device: &Device, pid: u64, handle: OsHandle) -> Result<Self> {
		Self::create(device, Some((pid, handle)))
	}

	fn create(device: &Device, imported: Option<(u64, OsHandle)>) -> Result<Self> {
		#[cfg(windows)]
		let mut handle_info = vk::ExportSemaphoreWin32HandleInfoKHR::default().dw_access(GENERIC_ALL);
		let mut export_info =
			vk::ExportSemaphoreCreateInfo::default().handle_types(PLATFORM_EXTERNAL_SEMAPHORE_HANDLE_TYPE);
		let mut type_info = vk::SemaphoreTypeCreateInfo::default()
			.semaphore_type(vk::SemaphoreType::TIMELINE)
			.initial_value(0);

		#[cfg(windows)]
		let info = vk::SemaphoreCreateInfo::default()
			.push_next(&mut type_info)
			.push_next(&mut export_info)
			.push_next(&mut handle_info);
		#[cfg(unix)]
		let info = vk::SemaphoreCreateInfo::default()
			.push_next(&mut type_info)
			.push_next(&mut export_info);

		let handle = unsafe { device.device().create_semaphore(&info, None)? };

		if let Some((pid, foreign)) = imported {
			let dup = platform::duplicate_handle(pid, foreign)?;
			unsafe {
				#[cfg(windows)]
				{
					khr::external_semaphore_win32::Device::new(device.instance(), device.device())
						.import_semaphore_win32_handle(
							&vk::ImportSemaphoreWin32HandleInfoKHR::default()
								.semaphore(handle)
								.handle_type(PLATFORM_EXTERNAL_SEMAPHORE_HANDLE_TYPE)
								.handle(dup as _),
						)?;
				}
				#[cfg(unix)]
				{
					khr::external_semaphore_fd::Device::new(device.instance(), device.device()).import_semaphore_fd(
						&vk::ImportSemaphoreFdInfoKHR::default()
							.semaphore(handle)
							.handle_type(PLATFORM_EXTERNAL_SEMAPHORE_HANDLE_TYPE)
							.fd(dup),
					)?;
				}
			}
		}

		let os_handle = unsafe {
			#[cfg(windows)]
			{
				khr::external_semaphore_win32::Device::new(device.instance(), device.device())
					.get_semaphore_win32_handle(
						&vk::SemaphoreGetWin32HandleInfoKHR::default()
							.semaphore(handle)
							.handle_type(PLATFORM_EXTERNAL_SEMAPHORE_HANDLE_TYPE),
					)? as OsHandle
			}
			#[cfg(unix)]
			{
				khr::external_semaphore_fd::Device::new(device.instance(), device.device()).get_semaphore_fd(
					&vk::SemaphoreGetFdInfoKHR::default()
						.semaphore(handle)
						.handle_type(PLATFORM_EXTERNAL_SEMAPHORE_HANDLE_TYPE),
				)? as OsHandle
			}
		};

		Ok(Self {
			device: device.device().clone(),
			handle,
			os_handle,
			pid: imported.map(|(pid, _)| pid).unwrap_or_else(platform::current_pid),
		})
	}

	pub fn handle(&self) -> vk::Semaphore { self.handle }

	pub fn os_handle(&self) -> OsHandle { self.os_handle }

	pub fn pid(&self) -> u64 { self.pid }

	/// Signal the timeline from the host.
	pub fn signal(&self, value: u64) -> Result<()> {
		unsafe {
			self.device
				.signal_semaphore(&vk::SemaphoreSignalInfo::default().semaphore(self.handle).value(value))
				.map_err(Into::into)
		}
	}

	/// Wait until the timeline reaches `value`. `Timeout` is non-fatal.
	pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<()> {
		unsafe {
			self.device
				.wait_semaphores(
					&vk::SemaphoreWaitInfo::default()
						.semaphores(&[self.handle])
						.values(&[value]),
					timeout_ns,
				)
				.map_err(|res| match res {
					vk::Result::TIMEOUT => Error::Timeout,
					res => res.into(),
				})
		}
	}

	pub fn value(&self) -> Result<u64> {
		unsafe { self.device.get_semaphore_counter_value(self.handle).map_err(Into::into) }
	}
}

impl Drop for Semaphore {
	fn drop(&mut self) {
		if platform::handle_is_valid(self.os_handle) {
			platform::close_handle(self.os_handle);
		}
		unsafe {
			self.device.destroy_semaphore(self.handle, None);
		}
	}
}
