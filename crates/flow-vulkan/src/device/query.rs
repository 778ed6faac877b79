//! GPU timestamp queries with host-visible readback.

use std::{
	sync::{Arc, Mutex},
	time::Duration,
};

use ash::vk;
use rustc_hash::FxHashMap;

use crate::{
	cmd::CommandBuffer,
	device::Device,
	interop::MemoryProps,
	resource::{Buffer, BufferCreateInfo},
	Result,
};

const QUERY_COUNT: u32 = 1 << 16;

struct QueryState {
	next: u32,
	begin_queries: FxHashMap<u64, u32>,
}

/// Paired begin/end timestamps keyed by the caller, resolved in command-buffer completion
/// callbacks and averaged over a window of frames.
pub struct QueryPool {
	device: ash::Device,
	handle: vk::QueryPool,
	results: Arc<Buffer>,
	/// Nanoseconds per timestamp tick.
	period: f64,
	state: Mutex<QueryState>,
	ready: Arc<Mutex<FxHashMap<u64, Vec<Duration>>>>,
}

impl QueryPool {
	pub fn new(device: &Device) -> Result<Arc<Self>> {
		let results = Buffer::new(
			device,
			BufferCreateInfo {
				size: QUERY_COUNT as u64 * 8,
				usage: vk::BufferUsageFlags::TRANSFER_DST,
				mem_props: MemoryProps {
					mapped: true,
					download: true,
					..MemoryProps::default()
				},
				..BufferCreateInfo::default()
			},
		)?;

		let period = unsafe {
			device
				.instance()
				.get_physical_device_properties(device.physical_device())
				.limits
				.timestamp_period as f64
		};

		let handle = unsafe {
			device.device().create_query_pool(
				&vk::QueryPoolCreateInfo::default()
					.query_type(vk::QueryType::TIMESTAMP)
					.query_count(QUERY_COUNT),
				None,
			)?
		};
		unsafe {
			device.device().reset_query_pool(handle, 0, QUERY_COUNT);
		}

		Ok(Arc::new(Self {
			device: device.device().clone(),
			handle,
			results,
			period,
			state: Mutex::new(QueryState {
				next: 0,
				begin_queries: FxHashMap::default(),
			}),
			ready: Arc::new(Mutex::new(FxHashMap::default())),
		}))
	}

	/// Stamp the start of a measured span named by `key`.
	pub fn perf_begin(&self, key: u64, cmd: &Arc<CommandBuffer>) {
		let mut state = self.state.lock().unwrap();
		debug_assert!(!state.begin_queries.contains_key(&key));
		let query = state.next;
		state.next = (state.next + 1) % QUERY_COUNT;
		state.begin_queries.insert(key, query);
		unsafe {
			self.device
				.cmd_write_timestamp(cmd.handle(), vk::PipelineStageFlags::TOP_OF_PIPE, self.handle, query);
		}
	}

	/// Stamp the end of the span, queue the readback, and return the rolling average once
	/// `frames` samples have resolved.
	pub fn perf_end(&self, key: u64, cmd: &Arc<CommandBuffer>, frames: u64) -> Option<Duration> {
		let (begin, end) = {
			let mut state = self.state.lock().unwrap();
			let begin = state.begin_queries.remove(&key)?;
			let end = state.next;
			state.next = (state.next + 1) % QUERY_COUNT;
			(begin, end)
		};

		unsafe {
			self.device
				.cmd_write_timestamp(cmd.handle(), vk::PipelineStageFlags::BOTTOM_OF_PIPE, self.handle, end);
			for query in [begin, end] {
				self.device.cmd_copy_query_pool_results(
					cmd.handle(),
					self.handle,
					query,
					1,
					self.results.handle(),
					query as u64 * 8,
					8,
					vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
				);
				self.device.cmd_reset_query_pool(cmd.handle(), self.handle, query, 1);
			}
		}

		let results = self.results.clone();
		let ready = self.ready.clone();
		let period = self.period;
		cmd.add_callback(move || {
			let Ok(ptr) = results.map() else { return };
			let ptr = ptr as *mut u64;
			unsafe {
				let start = (ptr.add(begin as usize).read() as f64 * period) as u64;
				let finish = (ptr.add(end as usize).read() as f64 * period) as u64;
				ptr.add(begin as usize).write(0);
				ptr.add(end as usize).write(0);
				ready
					.lock()
					.unwrap()
					.entry(key)
					.or_default()
					.push(Duration::from_nanos(finish.saturating_sub(start)));
			}
		});

		let mut ready = self.ready.lock().unwrap();
		let samples = ready.entry(key).or_default();
		if samples.len() as u64 >= frames {
			let avg = samples.iter().sum::<Duration>() / samples.len() as u32;
			samples.clear();
			return Some(avg);
		}
		None
	}
}

impl Drop for QueryPool {
	fn drop(&mut self) {
		unsafe {
			self.device.destroy_query_pool(self.handle, None);
		}
	}
}
