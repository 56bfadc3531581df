//! The mapped region backing a pool.

use std::{alloc::Layout, io, num::NonZeroUsize, ptr::NonNull};

use log::{debug, error};

use crate::base::BasePtr;

/// Types which provide the memory that backs an arena.
///
/// This trait is sealed and implemented by the following types:
/// - [`Mmap`] reserves anonymous private mappings from the operating system.
///   This is the default backing on unix targets.
/// - [`Global`] borrows the region from the global allocator.
pub trait Backing: Sealed {
    /// Reserves a region of `size` bytes.
    ///
    /// `hint` is a preferred base address. Backings are free to ignore it.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the region cannot be reserved.
    fn reserve(&self, size: usize, hint: Option<NonZeroUsize>) -> io::Result<NonNull<u8>>;

    /// Releases a region previously returned by [`reserve`].
    ///
    /// # Safety
    ///
    /// `base` must have been returned by `self.reserve(size, _)` and must not
    /// have been released already. No references into the region may outlive
    /// this call.
    ///
    /// [`reserve`]: Backing::reserve
    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> io::Result<()>;
}

/// A backing of anonymous memory mappings.
#[cfg(unix)]
#[derive(Clone, Debug, Default)]
pub struct Mmap;

#[cfg(unix)]
impl Sealed for Mmap {}

#[cfg(unix)]
impl Backing for Mmap {
    fn reserve(&self, size: usize, hint: Option<NonZeroUsize>) -> io::Result<NonNull<u8>> {
        let addr = hint.map_or(std::ptr::null_mut(), |h| h.get() as *mut libc::c_void);

        let ptr = unsafe {
            libc::mmap(
                addr,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> io::Result<()> {
        match unsafe { libc::munmap(base.as_ptr().cast(), size) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

/// The global memory allocator.
#[derive(Clone, Debug, Default)]
pub struct Global;

impl Global {
    /// Regions are aligned to their size, capped at a typical page size.
    const MAX_ALIGN: usize = 4096;

    fn layout(size: usize) -> io::Result<Layout> {
        let align = size.min(Self::MAX_ALIGN).next_power_of_two();
        Layout::from_size_align(size, align)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

impl Sealed for Global {}

impl Backing for Global {
    fn reserve(&self, size: usize, _hint: Option<NonZeroUsize>) -> io::Result<NonNull<u8>> {
        let layout = Self::layout(size)?;
        if layout.size() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot reserve an empty region",
            ));
        }

        let raw = unsafe { std::alloc::alloc(layout) };
        NonNull::new(raw).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> io::Result<()> {
        let layout = Self::layout(size)?;
        unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
        Ok(())
    }
}

/// A reserved region of `size` bytes.
///
/// The region is released when the arena is dropped, or explicitly with
/// [`Arena::release`], which reports failure instead of logging it.
pub struct Arena<B: Backing> {
    base: BasePtr,
    backing: B,
    released: bool,
}

impl<B: Backing> Arena<B> {
    /// Reserves `size` bytes from `backing`.
    pub fn reserve(size: usize, hint: Option<NonZeroUsize>, backing: B) -> io::Result<Arena<B>> {
        let ptr = backing.reserve(size, hint)?;

        debug!("reserved arena of {size} bytes at {ptr:p}");

        Ok(Arena {
            base: BasePtr::new(ptr, size),
            backing,
            released: false,
        })
    }

    #[inline]
    pub fn base(&self) -> BasePtr {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.base.extent()
    }

    /// Releases the region.
    ///
    /// # Errors
    ///
    /// Returns the backing's error if the region could not be released. The
    /// region is not released a second time on drop.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        unsafe { self.backing.release(self.base.ptr(), self.base.extent()) }
    }
}

impl<B: Backing> Drop for Arena<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let size = self.base.extent();
        if let Err(e) = unsafe { self.backing.release(self.base.ptr(), size) } {
            error!("failed to release arena of {size} bytes: {e}");
        }
    }
}

impl<B: Backing> std::fmt::Debug for Arena<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base.ptr())
            .field("size", &self.size())
            .finish()
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
