//! A global allocator that can be told to fail a single allocation on the
//! current thread.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr;

#[global_allocator]
static ALLOC: FailingAlloc = FailingAlloc;

thread_local! {
    // 0 disables failures, otherwise the n-th allocation from now on fails
    static COUNTDOWN: Cell<usize> = const { Cell::new(0) };
}

struct FailingAlloc;

unsafe impl GlobalAlloc for FailingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let fail = COUNTDOWN
            .try_with(|countdown| match countdown.get() {
                0 => false,
                1 => {
                    countdown.set(0);
                    true
                }
                n => {
                    countdown.set(n - 1);
                    false
                }
            })
            .unwrap_or(false);

        if fail {
            ptr::null_mut()
        } else {
            System.alloc(layout)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

/// Runs `f` with the `n`-th allocation it makes on the current thread failing.
pub fn fail_nth_alloc<R>(n: usize, f: impl FnOnce() -> R) -> R {
    COUNTDOWN.with(|countdown| countdown.set(n));
    let res = f();
    COUNTDOWN.with(|countdown| countdown.set(0));
    res
}
