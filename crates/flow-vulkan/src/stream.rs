//! A bounded producer/consumer ring of images.

use std::sync::{Arc, Condvar, Mutex};

use crate::{
	device::Device,
	resource::{Image, ImageCreateInfo},
	Result,
};

struct StreamState {
	head: u64,
	tail: u64,
	written: Vec<bool>,
	read: Vec<bool>,
}

/// A fixed ring with separate producer (`head`) and consumer (`tail`) cursors.
///
/// `acquire_write` blocks while the ring is full or the slot is being read;
/// `acquire_read` blocks while the ring is empty or the slot is being written. A slot is
/// never simultaneously written and read.
pub struct Stream<T> {
	slots: Vec<Arc<T>>,
	size: u32,
	state: Mutex<StreamState>,
	write_cv: Condvar,
	read_cv: Condvar,
}

impl<T> Stream<T> {
	pub fn from_items(slots: Vec<Arc<T>>) -> Self {
		let size = slots.len() as u32;
		Self {
			slots,
			size,
			state: Mutex::new(StreamState {
				head: 0,
				tail: 0,
				written: vec![false; size as usize],
				read: vec![false; size as usize],
			}),
			write_cv: Condvar::new(),
			read_cv: Condvar::new(),
		}
	}

	pub fn size(&self) -> u32 { self.size }

	pub fn in_use(&self) -> u32 {
		let state = self.state.lock().unwrap();
		(state.head - state.tail) as u32
	}

	fn slot_of(&self, item: &Arc<T>) -> usize {
		self.slots
			.iter()
			.position(|slot| Arc::ptr_eq(slot, item))
			.expect("item does not belong to this stream")
	}

	/// Claim the next slot for writing, blocking while the ring is full or a reader holds
	/// the slot.
	pub fn acquire_write(&self) -> Arc<T> {
		let mut state = self.state.lock().unwrap();
		loop {
			let slot = (state.head % self.size as u64) as usize;
			if state.head - state.tail < self.size as u64 && !state.read[slot] {
				assert!(!state.written[slot]);
				state.written[slot] = true;
				state.head += 1;
				return self.slots[slot].clone();
			}
			state = self.write_cv.wait(state).unwrap();
		}
	}

	/// Mark a written slot readable.
	pub fn release_write(&self, item: &Arc<T>) {
		let slot = self.slot_of(item);
		let mut state = self.state.lock().unwrap();
		assert!(state.written[slot] && !state.read[slot]);
		state.written[slot] = false;
		drop(state);
		self.read_cv.notify_one();
	}

	/// Claim the oldest readable slot, blocking while the ring is empty or the producer is
	/// still writing it.
	pub fn acquire_read(&self) -> Arc<T> {
		let mut state = self.state.lock().unwrap();
		loop {
			let slot = (state.tail % self.size as u64) as usize;
			if state.head != state.tail && !state.written[slot] {
				assert!(!state.read[slot]);
				state.read[slot] = true;
				state.tail += 1;
				return self.slots[slot].clone();
			}
			state = self.read_cv.wait(state).unwrap();
		}
	}

	/// Hand a read slot back to the producer side.
	pub fn release_read(&self, item: &Arc<T>) {
		let slot = self.slot_of(item);
		let mut state = self.state.lock().unwrap();
		assert!(state.read[slot] && !state.written[slot]);
		state.read[slot] = false;
		drop(state);
		self.write_cv.notify_one();
	}
}

impl Stream<Image> {
	/// A ring of `size` identically shaped images.
	pub fn new(device: &Device, size: u32, info: ImageCreateInfo) -> Result<Self> {
		let slots = (0..size)
			.map(|_| Image::new(device, info.clone()))
			.collect::<Result<Vec<_>>>()?;
		Ok(Self::from_items(slots))
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicU32, Ordering},
		time::Duration,
	};

	use super::*;

	#[test]
	fn cursors_stay_within_bounds() {
		let stream = Stream::from_items((0..3u32).map(Arc::new).collect());

		let a = stream.acquire_write();
		let b = stream.acquire_write();
		assert_eq!(stream.in_use(), 2);

		stream.release_write(&a);
		let r = stream.acquire_read();
		assert!(Arc::ptr_eq(&r, &a));
		stream.release_read(&r);
		assert_eq!(stream.in_use(), 1);

		stream.release_write(&b);
		let r = stream.acquire_read();
		assert!(Arc::ptr_eq(&r, &b));
		stream.release_read(&r);
		assert_eq!(stream.in_use(), 0);
	}

	#[test]
	fn writers_block_when_full() {
		let stream = Arc::new(Stream::from_items((0..3u32).map(Arc::new).collect()));
		let acquired = Arc::new(AtomicU32::new(0));

		let mut handles = Vec::new();
		for _ in 0..4 {
			let stream = stream.clone();
			let acquired = acquired.clone();
			handles.push(std::thread::spawn(move || {
				let item = stream.acquire_write();
				acquired.fetch_add(1, Ordering::SeqCst);
				item
			}));
		}

		// Three producers get a slot; the fourth blocks on the full ring.
		std::thread::sleep(Duration::from_millis(200));
		assert_eq!(acquired.load(Ordering::SeqCst), 3);
		assert_eq!(stream.in_use(), 3);

		// One full write/read cycle unblocks it.
		let first = stream.slots[0].clone();
		stream.release_write(&first);
		let r = stream.acquire_read();
		stream.release_read(&r);

		std::thread::sleep(Duration::from_millis(200));
		assert_eq!(acquired.load(Ordering::SeqCst), 4);

		for handle in handles {
			let _ = handle.join().unwrap();
		}
	}

	#[test]
	fn readers_block_until_released() {
		let stream = Arc::new(Stream::from_items((0..2u32).map(Arc::new).collect()));
		let item = stream.acquire_write();

		let reader = {
			let stream = stream.clone();
			std::thread::spawn(move || stream.acquire_read())
		};

		// The slot is still being written; the reader must not see it yet.
		std::thread::sleep(Duration::from_millis(100));
		assert!(!reader.is_finished());

		stream.release_write(&item);
		let r = reader.join().unwrap();
		assert!(Arc::ptr_eq(&r, &item));
	}
}
