// Copyright 2026 strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The machine-level context switch primitives.
//!
//! Everything in this module is a thin, typed veneer over three assembly
//! routines following the Boost.Context `fcontext` convention. They are the
//! trust boundary of the crate: the engine assumes they save and restore the
//! callee-saved register set faithfully and nothing more.

use std::fmt;
use std::os::raw::c_void;
use std::ptr;

// Requires the default C calling convention for the current target.
// `jump` and `ontop` are declared "C-unwind" because a forced unwind raised by
// an ontop trampoline propagates out of the suspended jump on the target
// stack.
extern "C-unwind" {
    /// Creates a new `Context` on top of some stack.
    ///
    /// # Arguments
    /// * `sp`   - A pointer to the top of the stack.
    /// * `size` - The size of the stack.
    /// * `f`    - A function invoked on the first jump into the new context.
    fn strand_make_fcontext(sp: *mut c_void, size: usize, f: ContextFn) -> *mut c_void;

    /// Yields the execution to another `Context`.
    ///
    /// # Arguments
    /// * `to` - The `Context` with which we swap execution.
    /// * `p`  - An arbitrary argument that will be set as the `data` field
    ///          of the `Transfer` object passed to the other Context.
    fn strand_jump_fcontext(to: *mut c_void, p: *mut c_void) -> Transfer;

    /// Yields the execution to another `Context` and executes a function on
    /// top of that context's stack.
    ///
    /// # Arguments
    /// * `to` - The `Context` with which we swap execution.
    /// * `p`  - An arbitrary argument that will be set as the `data` field
    ///          of the `Transfer` object passed to the other Context.
    /// * `f`  - A function to be invoked on `to` before it resumes.
    fn strand_ontop_fcontext(to: *mut c_void, p: *mut c_void, f: OntopFn) -> Transfer;
}

/// Functions of this signature are used as the entry point of a new `Context`.
///
/// They never return; a context entry function terminates by switching away a
/// final time (the engine does so with [`Context::resume_ontop`]).
pub type ContextFn = extern "C" fn(t: Transfer) -> !;

/// Functions of this signature are used as the callback of
/// [`Context::resume_ontop`].
///
/// The callback runs on the target stack with interrupted-context semantics;
/// the `Transfer` it returns is the one the target observes from its pending
/// jump. It may also decline to return by unwinding, which is how the engine
/// tears down suspended coroutines.
pub type OntopFn = extern "C-unwind" fn(t: Transfer) -> Transfer;

/// A `Context` stores the state of execution of a paused stack, sufficient to
/// resume it exactly where it left off.
///
/// A context is a single machine word. The null word is reserved: it is
/// produced by the engine's exit trampoline to report that the peer has
/// terminated and must never be jumped to.
#[repr(C)]
pub struct Context(*mut c_void);

// A paused context may be resumed from another thread, provided resumes never
// overlap. The word itself is just an address into the owning stack.
unsafe impl Send for Context {}

impl Context {
    /// The terminated-peer marker. Calling [`resume`](Context::resume) on it
    /// is undefined behaviour; check [`is_null`](Context::is_null) first.
    pub fn null() -> Context {
        Context(ptr::null_mut())
    }

    /// Creates a new `Context` prepared to execute `f` at the top of the
    /// stack region `[sp - size, sp)`.
    ///
    /// `f` is not entered until the first call to `resume()`.
    ///
    /// # Safety
    ///
    /// `sp` must be the one-past-top address of a writable region of at least
    /// `size` bytes that outlives the returned `Context` and every context
    /// subsequently derived from it.
    #[inline(always)]
    pub unsafe fn new(sp: *mut c_void, size: usize, f: ContextFn) -> Context {
        Context(strand_make_fcontext(sp, size, f))
    }

    /// Returns true if this is the terminated-peer marker.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Yields the execution to the paused context.
    ///
    /// The current state of execution is saved and the state in `self` is
    /// restored and continued. The call returns only when some other context
    /// resumes the caller in turn; the returned `Transfer` carries the
    /// context that jumped back here and the payload word it sent.
    ///
    /// # Safety
    ///
    /// `self` must be a live paused context (not null, not already resumed).
    /// Data reachable from `data` must stay valid until the peer is done
    /// with it.
    #[inline(always)]
    pub unsafe fn resume(self, data: *mut c_void) -> Transfer {
        debug_assert!(!self.is_null());
        strand_jump_fcontext(self.0, data)
    }

    /// Yields the execution to the paused context and executes `f` on top of
    /// its stack before it resumes.
    ///
    /// `f` receives the `Transfer` the target would have observed from its
    /// pending jump and may replace it, or unwind the target stack instead of
    /// returning. This is the mechanism behind deterministic teardown: a
    /// frame's destructor can run after control has left the dying stack but
    /// while the frame pointer is still known.
    ///
    /// # Safety
    ///
    /// Same contract as [`resume`](Context::resume); additionally the target
    /// must have been entered at least once, so that its pending jump frame
    /// exists for `f` to interrupt.
    #[inline(always)]
    pub unsafe fn resume_ontop(self, data: *mut c_void, f: OntopFn) -> Transfer {
        debug_assert!(!self.is_null());
        strand_ontop_fcontext(self.0, data, f)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({:p})", self.0)
    }
}

/// Contains the previously active `Context` and the payload word passed to
/// resume the current one. Used as the return value of [`Context::resume`]
/// and [`Context::resume_ontop`], and as the argument of [`ContextFn`] and
/// [`OntopFn`].
#[repr(C)]
#[derive(Debug)]
pub struct Transfer {
    /// The previously executed `Context` which yielded to resume the current
    /// one. Null when the peer terminated.
    pub context: Context,

    /// The payload word passed to `resume()` or `resume_ontop()`.
    pub data: *mut c_void,
}

impl Transfer {
    /// Returns a new `Transfer` with the members set to the arguments.
    #[inline(always)]
    pub fn new(context: Context, data: *mut c_void) -> Transfer {
        Transfer { context, data }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::os::raw::c_void;
    use std::ptr;

    use super::*;
    use crate::stack::{FixedSizeStackAllocator, StackAllocator};

    #[test]
    fn type_sizes() {
        assert_eq!(mem::size_of::<Context>(), mem::size_of::<usize>());
        assert_eq!(mem::size_of::<Transfer>(), 2 * mem::size_of::<usize>());
    }

    #[test]
    fn number_generator() {
        extern "C" fn context_function(mut t: Transfer) -> ! {
            for i in 0usize.. {
                assert_eq!(t.data as usize, i);
                t = unsafe { t.context.resume(i as *mut c_void) };
            }

            unreachable!();
        }

        let allocator = FixedSizeStackAllocator::new(512 * 1024).unwrap();
        let mut stack = allocator.allocate().unwrap();

        let mut t = Transfer::new(
            unsafe { Context::new(stack.top(), stack.size(), context_function) },
            ptr::null_mut(),
        );

        for i in 0..10usize {
            t = unsafe { t.context.resume(i as *mut c_void) };
            assert_eq!(t.data as usize, i);

            if t.data as usize == 9 {
                break;
            }
        }

        allocator.deallocate(&mut stack);
    }

    #[test]
    fn resume_ontop() {
        extern "C" fn entry(t: Transfer) -> ! {
            assert_eq!(t.data as usize, 0);
            unsafe { t.context.resume_ontop(1 as *mut c_void, ontop) };
            unreachable!();
        }

        extern "C-unwind" fn ontop(mut t: Transfer) -> Transfer {
            assert_eq!(t.data as usize, 1);
            t.data = 123 as *mut c_void;
            t
        }

        let allocator = FixedSizeStackAllocator::new(512 * 1024).unwrap();
        let mut stack = allocator.allocate().unwrap();

        let t = Transfer::new(
            unsafe { Context::new(stack.top(), stack.size(), entry) },
            ptr::null_mut(),
        );

        let t = unsafe { t.context.resume(ptr::null_mut()) };
        assert_eq!(t.data as usize, 123);

        allocator.deallocate(&mut stack);
    }
}
