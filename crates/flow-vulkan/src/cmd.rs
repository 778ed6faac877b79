//! Command buffers and their pools.
//!
//! A command buffer walks `Initial → Recording → Executable → Pending → Initial`; the last
//! edge is taken when its fence is observed signalled, at which point deferred callbacks
//! run and retained resources are released. Pools hand out buffers round-robin and never
//! grow.

use std::{
	sync::{Arc, Mutex},
	time::Instant,
};

use ash::vk;
use rustc_hash::FxHashMap;
use tracing::{error, warn};

use crate::{device::queue::Queue, device::Device, Error, Result};

pub const DEFAULT_POOL_SIZE: usize = 256;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CmdState {
	Initial,
	Recording,
	Executable,
	Pending,
	Invalid,
}

/// A resource retained by a command buffer until its commands complete.
pub trait CmdDependency: Send + Sync {
	/// Runs when the fence is observed signalled, before the reference is released.
	fn on_complete(&self) {}
}

struct CmdInner {
	state: CmdState,
	wait: FxHashMap<vk::Semaphore, (u64, vk::PipelineStageFlags)>,
	signal: FxHashMap<vk::Semaphore, u64>,
	callbacks: Vec<Box<dyn FnOnce() + Send>>,
	// Pre-submit hooks persist across submissions; callbacks are one-shot.
	pre_submit: Vec<Arc<dyn Fn(&Arc<CommandBuffer>) + Send + Sync>>,
	dependencies: Vec<Arc<dyn CmdDependency>>,
}

/// The vk pool handle, shared so buffers can outlive the [`CommandPool`] wrapper.
struct PoolShared {
	device: ash::Device,
	handle: vk::CommandPool,
}

impl Drop for PoolShared {
	fn drop(&mut self) {
		unsafe {
			self.device.destroy_command_pool(self.handle, None);
		}
	}
}

pub struct CommandBuffer {
	device: ash::Device,
	queue: Arc<Queue>,
	pool: Arc<PoolShared>,
	handle: vk::CommandBuffer,
	fence: vk::Fence,
	inner: Mutex<CmdInner>,
}

impl CommandBuffer {
	fn new(queue: Arc<Queue>, pool: Arc<PoolShared>, handle: vk::CommandBuffer) -> Result<Arc<Self>> {
		let device = pool.device.clone();
		let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None)? };
		Ok(Arc::new(Self {
			device,
			queue,
			pool,
			handle,
			fence,
			inner: Mutex::new(CmdInner {
				state: CmdState::Initial,
				wait: FxHashMap::default(),
				signal: FxHashMap::default(),
				callbacks: Vec::new(),
				pre_submit: Vec::new(),
				dependencies: Vec::new(),
			}),
		}))
	}

	pub fn handle(&self) -> vk::CommandBuffer { self.handle }

	pub fn device(&self) -> &ash::Device { &self.device }

	pub fn queue(&self) -> &Arc<Queue> { &self.queue }

	pub fn queue_family(&self) -> u32 { self.queue.family() }

	pub fn state(&self) -> CmdState { self.inner.lock().unwrap().state }

	pub fn begin(&self) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		if inner.state != CmdState::Initial {
			return Err(Error::Message("command buffer is not in the initial state".into()));
		}
		debug_assert!(inner.wait.is_empty() && inner.signal.is_empty());
		unsafe {
			self.device.begin_command_buffer(
				self.handle,
				&vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
			)?;
		}
		inner.state = CmdState::Recording;
		Ok(())
	}

	fn end(&self, inner: &mut CmdInner) -> Result<()> {
		if inner.state != CmdState::Recording {
			return Err(Error::Message("command buffer is not recording".into()));
		}
		unsafe {
			self.device.end_command_buffer(self.handle)?;
		}
		inner.state = CmdState::Executable;
		Ok(())
	}

	/// Wait for `semaphore` to reach `value` before executing, at `stage`.
	pub fn add_wait(&self, semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags) {
		self.inner.lock().unwrap().wait.insert(semaphore, (value, stage));
	}

	/// Signal `semaphore` to `value` once execution finishes.
	pub fn add_signal(&self, semaphore: vk::Semaphore, value: u64) {
		self.inner.lock().unwrap().signal.insert(semaphore, value);
	}

	/// Run `f` after the commands complete, during the Pending → Initial edge.
	pub fn add_callback(&self, f: impl FnOnce() + Send + 'static) {
		self.inner.lock().unwrap().callbacks.push(Box::new(f));
	}

	/// Run `f` right before every submission of this buffer.
	pub fn add_pre_submit(&self, f: impl Fn(&Arc<CommandBuffer>) + Send + Sync + 'static) {
		self.inner.lock().unwrap().pre_submit.push(Arc::new(f));
	}

	/// Keep `resource` alive until the commands complete.
	pub fn add_dependency(&self, resource: Arc<dyn CmdDependency>) {
		self.inner.lock().unwrap().dependencies.push(resource);
	}

	/// Submit to the owning queue, signalling this buffer's fence. Still-recording buffers
	/// are ended first; submitting a Pending buffer fails with no state change.
	pub fn submit(self: &Arc<Self>) -> Result<Arc<CommandBuffer>> {
		let hooks = self.inner.lock().unwrap().pre_submit.clone();
		for hook in hooks.iter() {
			hook(self);
		}

		let mut inner = self.inner.lock().unwrap();
		if inner.state == CmdState::Recording {
			self.end(&mut inner)?;
		}
		match inner.state {
			CmdState::Executable => {},
			CmdState::Pending => return Err(Error::FenceNotSignalled),
			_ => return Err(Error::Message("command buffer is not executable".into())),
		}

		let mut wait = Vec::with_capacity(inner.wait.len());
		let mut wait_values = Vec::with_capacity(inner.wait.len());
		let mut stages = Vec::with_capacity(inner.wait.len());
		for (&sem, &(value, stage)) in inner.wait.iter() {
			wait.push(sem);
			wait_values.push(value);
			stages.push(stage);
		}
		let mut signal = Vec::with_capacity(inner.signal.len());
		let mut signal_values = Vec::with_capacity(inner.signal.len());
		for (&sem, &value) in inner.signal.iter() {
			signal.push(sem);
			signal_values.push(value);
		}

		let mut timeline = vk::TimelineSemaphoreSubmitInfo::default()
			.wait_semaphore_values(&wait_values)
			.signal_semaphore_values(&signal_values);
		let bufs = [self.handle];
		let submit = vk::SubmitInfo::default()
			.wait_semaphores(&wait)
			.wait_dst_stage_mask(&stages)
			.command_buffers(&bufs)
			.signal_semaphores(&signal)
			.push_next(&mut timeline);

		self.queue.submit(&[submit], self.fence)?;
		inner.state = CmdState::Pending;
		Ok(self.clone())
	}

	/// True if the buffer can start a new recording. Observing a signalled fence flips
	/// Pending back to Initial, running callbacks and releasing dependencies.
	pub fn is_free(self: &Arc<Self>) -> bool {
		{
			let inner = self.inner.lock().unwrap();
			match inner.state {
				CmdState::Initial => return true,
				CmdState::Pending => {},
				_ => return false,
			}
		}
		if unsafe { self.device.get_fence_status(self.fence).unwrap_or(false) } {
			self.clear();
			true
		} else {
			false
		}
	}

	/// Opportunistically flip Pending → Initial if the fence has signalled.
	pub fn update_pending_state(self: &Arc<Self>) {
		let _ = self.is_free();
	}

	/// Block until the fence signals, up to `timeout_ns`. On timeout the buffer stays
	/// Pending and no callbacks run.
	pub fn wait(self: &Arc<Self>, timeout_ns: u64) -> Result<()> {
		if self.inner.lock().unwrap().state == CmdState::Pending {
			unsafe {
				self.device
					.wait_for_fences(&[self.fence], false, timeout_ns)
					.map_err(|res| match res {
						vk::Result::TIMEOUT => {
							warn!("command buffer wait timed out");
							Error::Timeout
						},
						res => res.into(),
					})?;
			}
		}
		self.clear();
		Ok(())
	}

	/// Block without bound, then reset to Initial.
	pub fn wait_and_clear(self: &Arc<Self>) {
		if self.inner.lock().unwrap().state == CmdState::Pending {
			let res = unsafe { self.device.wait_for_fences(&[self.fence], false, u64::MAX) };
			if res.is_err() {
				error!("clearing command buffer without finishing");
			}
		}
		self.clear();
	}

	/// Reset to Initial: fence and recording reset, callbacks fired, wait/signal groups and
	/// dependencies dropped.
	pub fn clear(self: &Arc<Self>) {
		let (callbacks, dependencies);
		{
			let mut inner = self.inner.lock().unwrap();
			unsafe {
				if let Err(e) = self.device.reset_fences(&[self.fence]) {
					error!("failed to reset fence: {e}");
				}
				if let Err(e) = self
					.device
					.reset_command_buffer(self.handle, vk::CommandBufferResetFlags::RELEASE_RESOURCES)
				{
					error!("failed to reset command buffer: {e}");
				}
			}
			callbacks = std::mem::take(&mut inner.callbacks);
			dependencies = std::mem::take(&mut inner.dependencies);
			inner.wait.clear();
			inner.signal.clear();
			inner.state = CmdState::Initial;
		}
		for callback in callbacks {
			callback();
		}
		for dependency in dependencies {
			dependency.on_complete();
		}
	}
}

impl Drop for CommandBuffer {
	fn drop(&mut self) {
		// Cannot route through `wait_and_clear` without an Arc; same semantics inline.
		let inner = self.inner.get_mut().unwrap();
		if inner.state == CmdState::Pending {
			let res = unsafe { self.device.wait_for_fences(&[self.fence], false, u64::MAX) };
			if res.is_err() {
				error!("dropping command buffer without finishing");
			}
		}
		for callback in std::mem::take(&mut inner.callbacks) {
			callback();
		}
		for dependency in std::mem::take(&mut inner.dependencies) {
			dependency.on_complete();
		}
		unsafe {
			self.device.free_command_buffers(self.pool.handle, &[self.handle]);
			self.device.destroy_fence(self.fence, None);
		}
	}
}

/// A fixed ring of command buffers over one queue.
pub struct CommandPool {
	shared: Arc<PoolShared>,
	queue: Arc<Queue>,
	buffers: Vec<Arc<CommandBuffer>>,
	next: Mutex<usize>,
}

impl CommandPool {
	pub fn new(device: &Device, queue: Arc<Queue>, size: usize) -> Result<Arc<Self>> {
		let handle = unsafe {
			device.device().create_command_pool(
				&vk::CommandPoolCreateInfo::default()
					.flags(
						vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER | vk::CommandPoolCreateFlags::TRANSIENT,
					)
					.queue_family_index(queue.family()),
				None,
			)?
		};
		let shared = Arc::new(PoolShared {
			device: device.device().clone(),
			handle,
		});

		let raw = unsafe {
			device.device().allocate_command_buffers(
				&vk::CommandBufferAllocateInfo::default()
					.command_pool(handle)
					.level(vk::CommandBufferLevel::PRIMARY)
					.command_buffer_count(size as u32),
			)?
		};
		let buffers = raw
			.into_iter()
			.map(|cb| CommandBuffer::new(queue.clone(), shared.clone(), cb))
			.collect::<Result<Vec<_>>>()?;

		Ok(Arc::new(Self {
			shared,
			queue,
			buffers,
			next: Mutex::new(0),
		}))
	}

	pub fn for_queue(device: &Device, queue: Arc<Queue>) -> Result<Arc<Self>> {
		Self::new(device, queue, DEFAULT_POOL_SIZE)
	}

	pub fn queue(&self) -> &Arc<Queue> { &self.queue }

	/// The next free command buffer, advancing a wrapping cursor. Polls (and complains)
	/// rather than growing when every buffer is in flight.
	pub fn alloc(&self) -> Arc<CommandBuffer> {
		for cmd in self.buffers.iter() {
			cmd.update_pending_state();
		}

		let start = Instant::now();
		let mut exhausted = false;
		let mut next = self.next.lock().unwrap();
		loop {
			let cmd = &self.buffers[*next];
			if cmd.is_free() {
				return cmd.clone();
			}
			*next = (*next + 1) % self.buffers.len();
			if !exhausted && start.elapsed().as_millis() > 10 {
				warn!("command pool is exhausted");
				exhausted = true;
			}
		}
	}

	/// Allocate and begin recording.
	pub fn begin_cmd(&self) -> Result<Arc<CommandBuffer>> {
		let cmd = self.alloc();
		cmd.begin()?;
		Ok(cmd)
	}

	/// Drain every in-flight buffer.
	pub fn clear(&self) {
		for cmd in self.buffers.iter() {
			if cmd.state() != CmdState::Initial {
				cmd.wait_and_clear();
			}
		}
	}
}

impl Drop for CommandPool {
	fn drop(&mut self) { self.clear(); }
}

static_assertions::assert_impl_all!(CommandBuffer: Send, Sync);
static_assertions::assert_impl_all!(CommandPool: Send, Sync);
