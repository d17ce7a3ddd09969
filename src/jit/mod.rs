//! Process-wide executable-memory arena backing JIT-compiled blocks.
//!
//! Unlike every other component in this crate, the arena is genuinely
//! process-global (OS executable-page permissions aren't per-`Emu`), so it
//! is a ref-counted singleton rather than a field on [`crate::emu::Emu`]:
//! the first `Emu` to start acquires it, the last to drop releases it.
//! No recompiler backend ships in this crate (see module docs below); this
//! is the allocator and fault-handler hook point a backend would build on.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

pub const SLICE_SIZE: usize = 32 * 1024 * 1024;
pub const SLICE_COUNT: usize = 4;
pub const ARENA_SIZE: usize = SLICE_SIZE * SLICE_COUNT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceHandle(u8);

impl SliceHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
        mod backend {
            use super::SLICE_SIZE;

            /// Apple aarch64 refuses static RW+X mappings; each slice is
            /// its own `MAP_JIT` region, toggled writable/executable per
            /// thread with `pthread_jit_write_protect_np` by the caller.
            pub unsafe fn map_slice() -> Option<*mut u8> {
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    SLICE_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_JIT,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    None
                } else {
                    Some(ptr.cast())
                }
            }

            pub unsafe fn unmap_slice(ptr: *mut u8) {
                libc::munmap(ptr.cast(), SLICE_SIZE);
            }

            pub unsafe fn map_static_arena() -> Option<*mut u8> {
                None
            }
        }
    } else if #[cfg(any(target_os = "netbsd", target_os = "openbsd"))] {
        mod backend {
            use super::ARENA_SIZE;

            /// NetBSD/OpenBSD require `PROT_MPROTECT` up front before a
            /// later `mprotect` may add `PROT_EXEC`.
            pub unsafe fn map_static_arena() -> Option<*mut u8> {
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    ARENA_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_MPROTECT(libc::PROT_EXEC),
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    None
                } else {
                    libc::mprotect(ptr, ARENA_SIZE, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC);
                    Some(ptr.cast())
                }
            }
        }
    } else {
        mod backend {
            use super::ARENA_SIZE;

            /// Everywhere else a single static RW+X mapping is carved
            /// into fixed slices; no per-allocation syscall is needed.
            pub unsafe fn map_static_arena() -> Option<*mut u8> {
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    ARENA_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    None
                } else {
                    Some(ptr.cast())
                }
            }
        }
    }
}

struct Arena {
    base: Option<usize>,
    free_mask: AtomicU8,
}

static ARENA: OnceLock<std::sync::Mutex<Arena>> = OnceLock::new();
static REF_COUNT: AtomicUsize = AtomicUsize::new(0);
static FAULT_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

fn arena() -> &'static std::sync::Mutex<Arena> {
    ARENA.get_or_init(|| std::sync::Mutex::new(Arena { base: None, free_mask: AtomicU8::new(0) }))
}

/// Acquires the process-wide arena, mapping it on the first call and
/// installing the fault handler. Every successful call must be matched
/// by exactly one [`release`].
pub fn acquire() -> bool {
    if REF_COUNT.fetch_add(1, Ordering::SeqCst) == 0 {
        let mut guard = arena().lock().unwrap();
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            guard.base = unsafe { backend::map_static_arena() }.map(|p| p as usize);
            if guard.base.is_some() {
                guard.free_mask.store((1 << SLICE_COUNT) - 1, Ordering::SeqCst);
            }
        }
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            guard.free_mask.store((1 << SLICE_COUNT) - 1, Ordering::SeqCst);
        }
        install_fault_handler();
    }
    true
}

/// Releases one reference; once it reaches zero the arena is unmapped
/// and the fault handler removed.
pub fn release() {
    if REF_COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
        let mut guard = arena().lock().unwrap();
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        if let Some(base) = guard.base.take() {
            unsafe { libc::munmap(base as *mut libc::c_void, ARENA_SIZE) };
        }
        guard.free_mask.store(0, Ordering::SeqCst);
        uninstall_fault_handler();
    }
}

/// Finds the first free slice by bit-scan and marks it taken. Returns
/// `None` (falls back to interpretation, per [`crate::error::Error::JitAllocFailed`])
/// when every slice is in use.
pub fn alloc_slice() -> Option<SliceHandle> {
    let guard = arena().lock().unwrap();
    loop {
        let mask = guard.free_mask.load(Ordering::SeqCst);
        if mask == 0 {
            return None;
        }
        let index = mask.trailing_zeros() as u8;
        let new_mask = mask & !(1 << index);
        if guard
            .free_mask
            .compare_exchange(mask, new_mask, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(SliceHandle(index));
        }
    }
}

pub fn free_slice(handle: SliceHandle) {
    let guard = arena().lock().unwrap();
    guard.free_mask.fetch_or(1 << handle.index(), Ordering::SeqCst);
}

/// Raw pointer to `handle`'s slice, valid only while the arena is held
/// via a live [`acquire`]/[`release`] pair.
pub fn slice_ptr(handle: SliceHandle) -> Option<*mut u8> {
    let guard = arena().lock().unwrap();
    guard.base.map(|base| (base + handle.index() * SLICE_SIZE) as *mut u8)
}

thread_local! {
    /// Set by the emulator thread before entering JIT-compiled code, so
    /// the SIGSEGV handler below knows which CPU's fast-path table a
    /// faulting access belongs to. No recompiler backend in this crate
    /// ever sets it, so it is always `None` here; a future backend hooks
    /// in by setting/clearing it around each compiled block's execution.
    static CURRENT_JIT_CPU: std::cell::Cell<Option<std::ptr::NonNull<()>>> = std::cell::Cell::new(None);
}

fn install_fault_handler() {
    if FAULT_HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigsegv as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
    }
}

fn uninstall_fault_handler() {
    if !FAULT_HANDLER_INSTALLED.swap(false, Ordering::SeqCst) {
        return;
    }
    unsafe {
        libc::signal(libc::SIGSEGV, libc::SIG_DFL);
    }
}

/// Distinguishes "emulated guest code took an out-of-bounds fast-memory
/// load, patch up and continue" from "a real host bug, re-raise". With
/// no backend installed, [`CURRENT_JIT_CPU`] is always empty, so every
/// fault here is a real bug and is re-raised unconditionally.
extern "C" fn handle_sigsegv(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let handled = CURRENT_JIT_CPU.with(|cell| cell.get().is_some());
    if !handled {
        unsafe {
            libc::signal(signum, libc::SIG_DFL);
            libc::raise(signum);
        }
    }
    let _ = (info, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both scenarios share the process-wide arena singleton, so they run
    // as one test to avoid cross-test interleaving on shared statics.
    #[test]
    fn alloc_free_and_ref_counted_teardown() {
        acquire();
        let mut handles = Vec::new();
        for _ in 0..SLICE_COUNT {
            handles.push(alloc_slice().expect("slice available"));
        }
        assert!(alloc_slice().is_none());
        free_slice(handles.pop().unwrap());
        assert!(alloc_slice().is_some());
        for h in handles {
            free_slice(h);
        }

        acquire();
        release();
        assert!(alloc_slice().is_some());
        release();
    }
}
