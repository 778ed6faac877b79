//! OS handle plumbing for cross-process resource sharing.

use crate::{Error, Result};

/// An OS-level reference to a memory or synchronisation object: an NT handle on Windows,
/// a file descriptor elsewhere.
#[cfg(windows)]
pub type OsHandle = isize;
#[cfg(unix)]
pub type OsHandle = i32;

pub fn handle_is_valid(handle: OsHandle) -> bool { handle > 0 }

#[cfg(windows)]
pub fn current_pid() -> u64 {
	unsafe { windows_sys::Win32::System::Threading::GetCurrentProcessId() as u64 }
}

#[cfg(unix)]
pub fn current_pid() -> u64 { unsafe { libc::getpid() as u64 } }

/// Duplicate a handle owned by process `pid` into the current process.
#[cfg(windows)]
pub fn duplicate_handle(pid: u64, handle: OsHandle) -> Result<OsHandle> {
	use windows_sys::Win32::{
		Foundation::{CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS},
		System::Threading::{GetCurrentProcess, OpenProcess, PROCESS_DUP_HANDLE},
	};

	unsafe {
		let src = OpenProcess(PROCESS_DUP_HANDLE, 0, pid as u32);
		if src.is_null() {
			return Err(Error::InvalidExternalHandle);
		}
		let mut out = std::ptr::null_mut();
		let ok = DuplicateHandle(
			src,
			handle as _,
			GetCurrentProcess(),
			&mut out,
			0,
			0,
			DUPLICATE_SAME_ACCESS,
		);
		CloseHandle(src);
		if ok == 0 {
			return Err(Error::InvalidExternalHandle);
		}
		Ok(out as OsHandle)
	}
}

#[cfg(unix)]
pub fn duplicate_handle(pid: u64, handle: OsHandle) -> Result<OsHandle> {
	unsafe {
		if pid == current_pid() {
			let fd = libc::dup(handle);
			if fd < 0 {
				return Err(Error::InvalidExternalHandle);
			}
			return Ok(fd);
		}

		#[cfg(target_os = "linux")]
		{
			let pidfd = libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0u32);
			if pidfd < 0 {
				return Err(Error::InvalidExternalHandle);
			}
			let fd = libc::syscall(libc::SYS_pidfd_getfd, pidfd, handle, 0u32);
			libc::close(pidfd as i32);
			if fd < 0 {
				return Err(Error::InvalidExternalHandle);
			}
			Ok(fd as OsHandle)
		}
		#[cfg(not(target_os = "linux"))]
		Err(Error::InvalidExternalHandle)
	}
}

#[cfg(windows)]
pub fn close_handle(handle: OsHandle) -> bool {
	unsafe { windows_sys::Win32::Foundation::CloseHandle(handle as _) != 0 }
}

#[cfg(unix)]
pub fn close_handle(handle: OsHandle) -> bool { unsafe { libc::close(handle) == 0 } }
