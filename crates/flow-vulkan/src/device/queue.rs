use std::sync::{
	atomic::{AtomicU64, Ordering},
	Mutex,
};

use ash::vk;
use tracing::{span, Level};

use crate::Result;

/// The device's main queue. Submission is serialised under the queue mutex; ordering
/// across submissions is expressed with timeline semaphores, never host sleeps.
pub struct Queue {
	device: ash::Device,
	inner: Mutex<vk::Queue>,
	family: u32,
	index: u32,
	submits: AtomicU64,
}

impl Queue {
	pub(crate) fn new(device: &ash::Device, family: u32, index: u32) -> Self {
		let queue = unsafe { device.get_device_queue(family, index) };
		Self {
			device: device.clone(),
			inner: Mutex::new(queue),
			family,
			index,
			submits: AtomicU64::new(0),
		}
	}

	pub fn family(&self) -> u32 { self.family }

	pub fn index(&self) -> u32 { self.index }

	/// Total submissions since creation.
	pub fn submits(&self) -> u64 { self.submits.load(Ordering::Relaxed) }

	pub fn submit(&self, submits: &[vk::SubmitInfo], fence: vk::Fence) -> Result<()> {
		let s = span!(Level::TRACE, "gpu submit");
		let _e = s.enter();

		let queue = self.inner.lock().unwrap();
		self.submits.fetch_add(submits.len() as u64, Ordering::Relaxed);
		unsafe { self.device.queue_submit(*queue, submits, fence).map_err(Into::into) }
	}

	/// A global barrier: drains everything submitted so far. Must not be called while
	/// another thread may be submitting on this queue, or the two will deadlock on the
	/// queue mutex.
	pub fn wait_idle(&self) -> Result<()> {
		let queue = self.inner.lock().unwrap();
		unsafe { self.device.queue_wait_idle(*queue).map_err(Into::into) }
	}
}
