//! Content-addressed reuse of transient resources with time-based eviction.
//!
//! Released resources park in per-create-info free lists and are handed back to matching
//! `get`s; a free list that sits untouched past `max_unused_time` is dropped whole.

use std::{
	hash::Hash,
	sync::Arc,
	time::{Duration, Instant},
};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::Result;

pub const DEFAULT_MAX_UNUSED_TIME: Duration = Duration::from_secs(10);

/// A resource the pool can recycle. The key covers exactly the fields that affect the
/// physical layout.
pub trait PooledResource: Send + Sync {
	type Key: Clone + Eq + Hash + Send + Sync;

	fn raw_handle(&self) -> u64;

	fn byte_size(&self) -> u64;
}

impl PooledResource for crate::resource::Image {
	type Key = crate::resource::image::ImagePoolKey;

	fn raw_handle(&self) -> u64 { ash::vk::Handle::as_raw(self.handle()) }

	fn byte_size(&self) -> u64 { self.size() }
}

impl PooledResource for crate::resource::Buffer {
	type Key = crate::resource::buffer::BufferPoolKey;

	fn raw_handle(&self) -> u64 { ash::vk::Handle::as_raw(self.handle()) }

	fn byte_size(&self) -> u64 { self.size() }
}

pub struct UsedResourceInfo<R: PooledResource> {
	pub tag: String,
	pub key: R::Key,
	pub resource: Arc<R>,
}

struct PoolState<R: PooledResource> {
	used: HashMap<u64, UsedResourceInfo<R>>,
	free: HashMap<R::Key, Vec<Arc<R>>>,
	release_time: HashMap<R::Key, Instant>,
	used_bytes: u64,
	ready_bytes: u64,
}

impl<R: PooledResource> PoolState<R> {
	/// Drop every free list whose last release is older than `max_unused`.
	fn sweep(&mut self, max_unused: Duration) {
		let now = Instant::now();
		let mut expired = Vec::new();
		for (key, &released) in self.release_time.iter() {
			if now.duration_since(released) > max_unused && self.free.contains_key(key) {
				expired.push(key.clone());
			}
		}
		for key in expired {
			if let Some(list) = self.free.remove(&key) {
				for resource in list {
					self.ready_bytes -= resource.byte_size();
				}
			}
			self.release_time.remove(&key);
		}
	}
}

pub struct ResourcePool<R: PooledResource> {
	state: RwLock<PoolState<R>>,
	max_unused: Mutex<Duration>,
}

impl<R: PooledResource> ResourcePool<R> {
	pub fn new(max_unused: Duration) -> Self {
		Self {
			state: RwLock::new(PoolState {
				used: HashMap::new(),
				free: HashMap::new(),
				release_time: HashMap::new(),
				used_bytes: 0,
				ready_bytes: 0,
			}),
			max_unused: Mutex::new(max_unused),
		}
	}

	/// A resource for `key`: recycled if a fresh-enough one is free, otherwise created via
	/// `create`.
	pub fn get_with(&self, key: R::Key, tag: &str, create: impl FnOnce() -> Result<Arc<R>>) -> Result<Arc<R>> {
		let max_unused = *self.max_unused.lock();
		let mut state = self.state.write();
		state.sweep(max_unused);

		let resource = match state.free.get_mut(&key).and_then(Vec::pop) {
			Some(resource) => {
				state.ready_bytes -= resource.byte_size();
				if state.free.get(&key).is_some_and(Vec::is_empty) {
					state.free.remove(&key);
				}
				resource
			},
			None => create()?,
		};

		state.used_bytes += resource.byte_size();
		state.used.insert(
			resource.raw_handle(),
			UsedResourceInfo {
				tag: tag.to_string(),
				key,
				resource: resource.clone(),
			},
		);
		Ok(resource)
	}

	/// Return a resource to its free list, stamping the eviction clock for its key.
	pub fn release(&self, handle: u64) -> bool {
		let max_unused = *self.max_unused.lock();
		let mut state = self.state.write();

		let Some(info) = state.used.remove(&handle) else {
			warn!("releasing a resource the pool does not own");
			return false;
		};
		let size = info.resource.byte_size();
		state.used_bytes -= size;
		state.ready_bytes += size;
		state.free.entry(info.key.clone()).or_default().push(info.resource);
		state.release_time.insert(info.key, Instant::now());

		state.sweep(max_unused);
		true
	}

	/// Drop every free list immediately.
	pub fn garbage_collect(&self) {
		let mut state = self.state.write();
		state.free.clear();
		state.release_time.clear();
		state.ready_bytes = 0;
	}

	pub fn is_used(&self, handle: u64) -> bool { self.state.read().used.contains_key(&handle) }

	pub fn find_used(&self, handle: u64) -> Option<Arc<R>> {
		self.state.read().used.get(&handle).map(|info| info.resource.clone())
	}

	pub fn set_tag(&self, handle: u64, tag: &str) {
		let mut state = self.state.write();
		match state.used.get_mut(&handle) {
			Some(info) => info.tag = tag.to_string(),
			None => warn!("tagging a resource the pool does not own"),
		}
	}

	pub fn available_count(&self) -> u64 { self.state.read().free.values().map(|l| l.len() as u64).sum() }

	pub fn used_count(&self) -> u64 { self.state.read().used.len() as u64 }

	pub fn used_bytes(&self) -> u64 { self.state.read().used_bytes }

	pub fn ready_bytes(&self) -> u64 { self.state.read().ready_bytes }

	pub fn total_bytes(&self) -> u64 {
		let state = self.state.read();
		state.used_bytes + state.ready_bytes
	}

	pub fn set_max_unused_time(&self, time: Duration) { *self.max_unused.lock() = time; }
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU64, Ordering};

	use super::*;

	struct Dummy {
		id: u64,
	}

	impl PooledResource for Dummy {
		type Key = u32;

		fn raw_handle(&self) -> u64 { self.id }

		fn byte_size(&self) -> u64 { 64 }
	}

	static NEXT: AtomicU64 = AtomicU64::new(1);

	fn fresh() -> Result<Arc<Dummy>> {
		Ok(Arc::new(Dummy {
			id: NEXT.fetch_add(1, Ordering::Relaxed),
		}))
	}

	#[test]
	fn recycles_within_the_window() {
		let pool = ResourcePool::<Dummy>::new(Duration::from_millis(100));

		let a = pool.get_with(7, "a", fresh).unwrap();
		let handle = a.id;
		assert!(pool.is_used(handle));
		assert_eq!(pool.used_count(), 1);

		assert!(pool.release(handle));
		assert!(!pool.is_used(handle));
		assert_eq!(pool.available_count(), 1);

		let b = pool.get_with(7, "b", fresh).unwrap();
		assert_eq!(b.id, handle);
	}

	#[test]
	fn keys_do_not_cross() {
		let pool = ResourcePool::<Dummy>::new(Duration::from_millis(100));
		let a = pool.get_with(1, "a", fresh).unwrap();
		pool.release(a.id);
		let b = pool.get_with(2, "b", fresh).unwrap();
		assert_ne!(a.id, b.id);
		assert_eq!(pool.available_count(), 1);
	}

	#[test]
	fn evicts_idle_free_lists() {
		let pool = ResourcePool::<Dummy>::new(Duration::from_millis(10));

		let a = pool.get_with(3, "a", fresh).unwrap();
		let first = a.id;
		pool.release(first);

		// Within the window the same handle comes back.
		let b = pool.get_with(3, "b", fresh).unwrap();
		assert_eq!(b.id, first);
		pool.release(first);

		std::thread::sleep(Duration::from_millis(25));
		let c = pool.get_with(3, "c", fresh).unwrap();
		assert_ne!(c.id, first);
		assert_eq!(pool.available_count(), 0);
	}

	#[test]
	fn garbage_collect_clears_free_lists() {
		let pool = ResourcePool::<Dummy>::new(Duration::from_secs(10));
		let a = pool.get_with(4, "a", fresh).unwrap();
		pool.release(a.id);
		assert_eq!(pool.ready_bytes(), 64);

		pool.garbage_collect();
		assert_eq!(pool.available_count(), 0);
		assert_eq!(pool.ready_bytes(), 0);

		let b = pool.get_with(4, "b", fresh).unwrap();
		assert_ne!(b.id, a.id);
	}

	#[test]
	fn byte_accounting_tracks_moves() {
		let pool = ResourcePool::<Dummy>::new(Duration::from_secs(10));
		let a = pool.get_with(5, "a", fresh).unwrap();
		let b = pool.get_with(5, "b", fresh).unwrap();
		assert_eq!(pool.used_bytes(), 128);
		assert_eq!(pool.total_bytes(), 128);

		pool.release(a.id);
		assert_eq!(pool.used_bytes(), 64);
		assert_eq!(pool.ready_bytes(), 64);
		assert_eq!(pool.total_bytes(), 128);

		pool.release(b.id);
		assert_eq!(pool.used_bytes(), 0);
		assert_eq!(pool.ready_bytes(), 128);
	}

	#[test]
	fn double_release_is_rejected() {
		let pool = ResourcePool::<Dummy>::new(Duration::from_secs(10));
		let a = pool.get_with(6, "a", fresh).unwrap();
		assert!(pool.release(a.id));
		assert!(!pool.release(a.id));
	}
}
