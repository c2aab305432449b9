use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// A page-granular region of memory obtained directly from the OS, outside the
/// malloc heap. While a region sits unused its pages are advised away, so the
/// process's resident set stays honest during variable-bitrate periods; the
/// virtual address range is kept so reuse is cheap.
struct Region {
	ptr: *mut u8,
	len: usize,
}

unsafe impl Send for Region {}

impl Region {
	fn allocate(len: usize) -> Self {
		let ptr = unsafe {
			libc::mmap(
				std::ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
				-1,
				0,
			)
		};
		assert!(ptr != libc::MAP_FAILED, "Failed to allocate a {len} byte region.");

		Self { ptr: ptr as *mut u8, len }
	}

	/// Tell the OS the contents are no longer needed. The pages may be
	/// reclaimed and will read back as zeroes if they were.
	fn mark_unused(&self) {
		let result = unsafe { libc::madvise(self.ptr as *mut libc::c_void, self.len, libc::MADV_DONTNEED) };
		if result != 0 {
			tracing::warn!("Failed to mark region as unused: {}", std::io::Error::last_os_error());
		}
	}

	fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
	}

	fn as_mut_slice(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
	}
}

impl Drop for Region {
	fn drop(&mut self) {
		let result = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
		if result != 0 {
			tracing::warn!("Failed to unmap region: {}", std::io::Error::last_os_error());
		}
	}
}

struct Pool {
	block_size: usize,
	region_size: usize,
	free: Mutex<Vec<Region>>,
}

/// Hands out fixed-size [`Block`]s backed by OS regions. Freed blocks return
/// to the pool with their pages marked reclaimable rather than being unmapped,
/// so frame-buffer churn does not thrash the allocator.
#[derive(Clone)]
pub struct BlockAllocator {
	pool: Arc<Pool>,
}

impl BlockAllocator {
	pub fn new(block_size: usize) -> Self {
		assert!(block_size > 0);

		let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
		let region_size = block_size.div_ceil(page_size) * page_size;

		Self {
			pool: Arc::new(Pool {
				block_size,
				region_size,
				free: Mutex::new(Vec::new()),
			}),
		}
	}

	pub fn allocate(&self) -> Block {
		let recycled = self.pool.free.lock().unwrap().pop();
		let region = match recycled {
			Some(region) => region,
			None => Region::allocate(self.pool.region_size),
		};

		Block {
			region: Some(region),
			pool: self.pool.clone(),
		}
	}

	pub fn block_size(&self) -> usize {
		self.pool.block_size
	}

	#[cfg(test)]
	fn free_blocks(&self) -> usize {
		self.pool.free.lock().unwrap().len()
	}
}

/// One fixed-size buffer owned by the caller. Dropping it returns the backing
/// region to its allocator.
pub struct Block {
	region: Option<Region>,
	pool: Arc<Pool>,
}

impl Deref for Block {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		&self.region.as_ref().unwrap().as_slice()[..self.pool.block_size]
	}
}

impl DerefMut for Block {
	fn deref_mut(&mut self) -> &mut [u8] {
		let block_size = self.pool.block_size;
		&mut self.region.as_mut().unwrap().as_mut_slice()[..block_size]
	}
}

impl Drop for Block {
	fn drop(&mut self) {
		if let Some(region) = self.region.take() {
			region.mark_unused();
			self.pool.free.lock().unwrap().push(region);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn blocks_are_writable_and_sized() {
		let allocator = BlockAllocator::new(10_000);
		let mut block = allocator.allocate();
		assert_eq!(block.len(), 10_000);

		block[0] = 0xAA;
		block[9_999] = 0xBB;
		assert_eq!(block[0], 0xAA);
		assert_eq!(block[9_999], 0xBB);
	}

	#[test]
	fn freed_blocks_are_recycled() {
		let allocator = BlockAllocator::new(4096);
		assert_eq!(allocator.free_blocks(), 0);

		let block = allocator.allocate();
		drop(block);
		assert_eq!(allocator.free_blocks(), 1);

		let _block = allocator.allocate();
		assert_eq!(allocator.free_blocks(), 0);
	}

	#[test]
	fn allocator_is_shared_across_clones() {
		let allocator = BlockAllocator::new(4096);
		let clone = allocator.clone();

		drop(clone.allocate());
		assert_eq!(allocator.free_blocks(), 1);
	}
}
