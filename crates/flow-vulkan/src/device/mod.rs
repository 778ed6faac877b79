//! An abstraction over a raw Vulkan device: one main queue, the suballocator, per-thread
//! command/query pools, the sampler cache, the globals registry, and the transient
//! resource pools.

use std::{
	any::Any,
	mem::ManuallyDrop,
	sync::{Arc, Mutex},
	thread::ThreadId,
	time::Duration,
};

use ash::vk;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::{
	alloc::{Allocator, MemoryUsage},
	cmd::{CommandBuffer, CommandPool},
	device::{query::QueryPool, sampler::Samplers},
	pool::{ResourcePool, DEFAULT_MAX_UNUSED_TIME},
	resource::{Buffer, BufferCreateInfo, Image, ImageCreateInfo},
	shader::TypeInterner,
	Result,
};

pub mod init;
pub mod query;
pub mod queue;
mod sampler;

pub use init::{Context, ContextBuilder};
pub use queue::Queue;

/// What the selected device can do; drives the sync2/dynamic-rendering fallbacks.
#[derive(Copy, Clone, Debug, Default)]
pub struct Features {
	pub ycbcr: bool,
	pub timeline: bool,
	pub sync2: bool,
	pub dynamic_rendering: bool,
	pub copy2: bool,
}

/// The per-device reuse caches for transient images and buffers.
pub struct ResourcePools {
	pub images: ResourcePool<Image>,
	pub buffers: ResourcePool<Buffer>,
}

impl ResourcePools {
	fn new(max_unused: Duration) -> Self {
		Self {
			images: ResourcePool::new(max_unused),
			buffers: ResourcePool::new(max_unused),
		}
	}

	pub fn garbage_collect(&self) {
		self.images.garbage_collect();
		self.buffers.garbage_collect();
	}

	pub fn set_max_unused_time(&self, time: Duration) {
		self.images.set_max_unused_time(time);
		self.buffers.set_max_unused_time(time);
	}
}

struct ThreadPools {
	cmd: Arc<CommandPool>,
	query: Arc<QueryPool>,
}

pub(crate) struct DeviceInner {
	physical_device: vk::PhysicalDevice,
	device: ash::Device,
	features: Features,
	name: String,
	luid: u64,
	queue: Arc<Queue>,
	allocator: Allocator,
	types: TypeInterner,
	pipeline_cache: vk::PipelineCache,
	samplers: Mutex<Samplers>,
	// Dropped by hand before the device goes away.
	globals: ManuallyDrop<Mutex<FxHashMap<String, Arc<dyn Any + Send + Sync>>>>,
	thread_pools: ManuallyDrop<RwLock<FxHashMap<ThreadId, ThreadPools>>>,
	pools: ManuallyDrop<ResourcePools>,
	instance: ash::Instance,
	entry: ash::Entry,
}

/// Has everything you need to do Vulkan stuff.
#[derive(Clone)]
pub struct Device {
	inner: Arc<DeviceInner>,
}

impl Device {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn from_parts(
		entry: ash::Entry, instance: ash::Instance, physical_device: vk::PhysicalDevice, device: ash::Device,
		features: Features, name: String, luid: u64, queue_family: u32,
	) -> Result<Self> {
		let memory_props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
		let pipeline_cache =
			unsafe { device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)? };
		let allocator = Allocator::new(&instance, &device, memory_props);
		let queue = Arc::new(Queue::new(&device, queue_family, 0));

		Ok(Self {
			inner: Arc::new(DeviceInner {
				physical_device,
				device,
				features,
				name,
				luid,
				queue,
				allocator,
				types: TypeInterner::default(),
				pipeline_cache,
				samplers: Mutex::new(Samplers::new()),
				globals: ManuallyDrop::new(Mutex::new(FxHashMap::default())),
				thread_pools: ManuallyDrop::new(RwLock::new(FxHashMap::default())),
				pools: ManuallyDrop::new(ResourcePools::new(DEFAULT_MAX_UNUSED_TIME)),
				instance,
				entry,
			}),
		})
	}

	pub fn entry(&self) -> &ash::Entry { &self.inner.entry }

	pub fn instance(&self) -> &ash::Instance { &self.inner.instance }

	pub fn device(&self) -> &ash::Device { &self.inner.device }

	pub fn physical_device(&self) -> vk::PhysicalDevice { self.inner.physical_device }

	pub fn features(&self) -> Features { self.inner.features }

	pub fn name(&self) -> &str { &self.inner.name }

	/// The adapter LUID, for matching against DXGI adapters. Zero when the driver reports
	/// none.
	pub fn luid(&self) -> u64 { self.inner.luid }

	pub fn queue(&self) -> &Arc<Queue> { &self.inner.queue }

	pub fn allocator(&self) -> &Allocator { &self.inner.allocator }

	pub fn types(&self) -> &TypeInterner { &self.inner.types }

	pub fn pipeline_cache(&self) -> vk::PipelineCache { self.inner.pipeline_cache }

	pub fn pools(&self) -> &ResourcePools { &self.inner.pools }

	pub fn memory_usage(&self) -> MemoryUsage { self.inner.allocator.usage() }

	pub fn sampler(&self, filter: vk::Filter) -> Result<vk::Sampler> {
		self.inner.samplers.lock().unwrap().get(&self.inner.device, filter)
	}

	/// This thread's command pool, created on first use.
	pub fn command_pool(&self) -> Result<Arc<CommandPool>> { Ok(self.thread_pools()?.0) }

	/// This thread's query pool, created on first use.
	pub fn query_pool(&self) -> Result<Arc<QueryPool>> { Ok(self.thread_pools()?.1) }

	fn thread_pools(&self) -> Result<(Arc<CommandPool>, Arc<QueryPool>)> {
		let id = std::thread::current().id();
		{
			let pools = self.inner.thread_pools.read();
			if let Some(entry) = pools.get(&id) {
				return Ok((entry.cmd.clone(), entry.query.clone()));
			}
		}

		let cmd = CommandPool::for_queue(self, self.inner.queue.clone())?;
		let query = QueryPool::new(self)?;
		self.inner.thread_pools.write().insert(
			id,
			ThreadPools {
				cmd: cmd.clone(),
				query: query.clone(),
			},
		);
		Ok((cmd, query))
	}

	/// Begin recording on this thread's pool.
	pub fn begin_cmd(&self) -> Result<Arc<CommandBuffer>> { self.command_pool()?.begin_cmd() }

	pub fn wait_idle(&self) -> Result<()> { self.inner.queue.wait_idle() }

	/// Look up a registered global by name.
	///
	/// The registry is owner-thread territory by convention: register everything during
	/// bring-up.
	pub fn global<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
		let globals = self.inner.globals.lock().unwrap();
		globals.get(name)?.clone().downcast::<T>().ok()
	}

	pub fn register_global<T: Send + Sync + 'static>(&self, name: &str, value: Arc<T>) {
		self.inner.globals.lock().unwrap().insert(name.to_string(), value);
	}

	pub fn remove_global(&self, name: &str) -> bool { self.inner.globals.lock().unwrap().remove(name).is_some() }

	/// A transient image from the reuse cache.
	pub fn pooled_image(&self, info: ImageCreateInfo, tag: &str) -> Result<Arc<Image>> {
		let key = info.pool_key();
		self.inner.pools.images.get_with(key, tag, || Image::new(self, info))
	}

	/// A transient buffer from the reuse cache.
	pub fn pooled_buffer(&self, info: BufferCreateInfo, tag: &str) -> Result<Arc<Buffer>> {
		let key = info.pool_key();
		self.inner.pools.buffers.get_with(key, tag, || Buffer::new(self, info))
	}
}

impl Drop for DeviceInner {
	fn drop(&mut self) {
		unsafe {
			// Everything that owns GPU objects goes first; the raw device last.
			ManuallyDrop::drop(&mut self.thread_pools);
			ManuallyDrop::drop(&mut self.pools);
			ManuallyDrop::drop(&mut self.globals);
			self.samplers.get_mut().unwrap().cleanup(&self.device);
			self.device.destroy_pipeline_cache(self.pipeline_cache, None);
			self.device.destroy_device(None);
		}
	}
}

static_assertions::assert_impl_all!(Device: Send, Sync);
