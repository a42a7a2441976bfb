// Copyright 2026 strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The execution engine: frame layout, the control-transfer protocol and
//! deterministic teardown of suspended stacks.
//!
//! An execution owns one foreign stack with a [`Frame`] control block placed
//! near its top. Control alternates strictly between the resumer and the
//! foreign stack: `resume` jumps in, [`Suspender::suspend`] jumps out. When
//! the flow returns (or panics) the frame destroys itself on the *resumer's*
//! stack via an ontop trampoline, because it cannot free the memory it is
//! standing on. Dropping a still-suspended [`Execution`] injects a
//! [`ForcedUnwind`] panic into the foreign stack so that every live value on
//! it is dropped before the stack is released.

use std::any::Any;
use std::marker::PhantomData;
use std::mem;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr::{self, NonNull};

use crate::error::Error;
use crate::flow::Flow;
use crate::machine::{Context, Transfer};
use crate::stack::{Stack, StackAllocator};

/// Minimum usable stack size accepted by [`Execution::create`].
///
/// The flow runs on that stack with the full language machinery, including
/// panics and drop chains, so tiny regions are rejected outright.
pub const MIN_STACK_SIZE: usize = 128_000;

/// Gap left between the frame storage and the entry stack pointer. Keeps the
/// frame clear of the entry function's red zone; must stay 16-byte aligned.
const FRAME_GAP: usize = 64;

type PanicPayload = Box<dyn Any + Send>;

/// The panic payload used to tear down a suspended stack when its
/// [`Execution`] handle is dropped.
///
/// User code must never swallow it: a `catch_unwind` inside a flow that
/// observes a `ForcedUnwind` has to propagate it (e.g. with
/// `std::panic::resume_unwind`), otherwise the stack cannot be reclaimed.
pub struct ForcedUnwind {
    pub(crate) context: Context,
}

/// The handle the running flow uses to yield back to its resumer.
///
/// It points at the in-flight transfer record of the current entry; it lives
/// on the foreign stack and is only valid for the duration of one
/// [`Flow::run`] call.
pub struct Suspender {
    transfer: *mut Transfer,
}

impl Suspender {
    fn new(transfer: *mut Transfer) -> Suspender {
        Suspender { transfer }
    }

    /// Transfers control back to the most recent resumer.
    ///
    /// Returns once the execution is resumed again. Suspending while the
    /// foreign stack is unwinding is unsupported.
    pub fn suspend(&mut self) {
        unsafe {
            let transfer = &mut *self.transfer;
            let context = mem::replace(&mut transfer.context, Context::null());
            *transfer = context.resume(ptr::null_mut());
        }
    }
}

/// How the frame holds its flow: owned, or borrowed from a caller that
/// guarantees the lifetime (the coroutine layer points the frame back at
/// itself this way).
enum FlowRef {
    Owned(Box<dyn Flow + Send>),
    Raw(NonNull<dyn Flow + Send>),
}

impl FlowRef {
    fn as_mut(&mut self) -> &mut (dyn Flow + Send) {
        match self {
            FlowRef::Owned(flow) => &mut **flow,
            FlowRef::Raw(flow) => unsafe { flow.as_mut() },
        }
    }
}

/// The per-execution control block, constructed in place inside the foreign
/// stack. The main stack never holds a pointer to it after installation.
struct Frame<A: StackAllocator> {
    allocator: A,
    stack: Stack,
    flow: FlowRef,
}

impl<A: StackAllocator> Frame<A> {
    fn run(&mut self, suspender: &mut Suspender) {
        self.flow.as_mut().run(suspender);
    }

    /// Moves the frame contents off the foreign stack and releases the
    /// stack. Must run on a different stack than `frame` points into.
    unsafe fn destroy(frame: *mut Frame<A>) {
        let Frame {
            allocator,
            mut stack,
            flow,
        } = ptr::read(frame);

        drop(flow);
        allocator.deallocate(&mut stack);
        log::trace!("execution frame destroyed");
    }

    /// Entry point of the foreign stack. Never unwinds: anything escaping
    /// the teardown protocol below is unrecoverable.
    extern "C" fn entry(mut t: Transfer) -> ! {
        let frame = t.data as *mut Frame<A>;
        debug_assert!(!t.context.is_null());
        debug_assert!(!frame.is_null());

        // `t` is the in-flight transfer record for the whole lifetime of
        // this stack; it has to survive an unwind of the closure below, so
        // the closure reaches it through a raw pointer.
        let transfer = &mut t as *mut Transfer;

        // The initial jump back to `create()` happens inside the unwind
        // guard: a handle dropped before the first resume raises the forced
        // unwind at exactly that suspension point.
        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            let context = mem::replace(&mut (*transfer).context, Context::null());
            *transfer = context.resume(ptr::null_mut());

            let mut suspender = Suspender::new(transfer);
            (*frame).run(&mut suspender);
        }));

        match result {
            Ok(()) => {}
            Err(payload) => match payload.downcast::<ForcedUnwind>() {
                Ok(unwind) => {
                    // The handle was dropped; the stack below us has been
                    // unwound. The payload carries the context to fall back
                    // to.
                    t = Transfer::new(unwind.context, ptr::null_mut());
                }
                Err(payload) => {
                    // A panic escaped the flow. Hand it to the resumer, which
                    // re-raises it on its own stack. We are entered one final
                    // time for teardown, either by another resume or by a
                    // forced unwind at this very suspension point.
                    let mut slot = Some(payload);
                    let slot_ptr = &mut slot as *mut Option<PanicPayload> as *mut c_void;
                    let context = mem::replace(&mut t.context, Context::null());

                    let handoff = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                        context.resume(slot_ptr)
                    }));

                    t = match handoff {
                        Ok(t) => t,
                        Err(second) => match second.downcast::<ForcedUnwind>() {
                            Ok(unwind) => Transfer::new(unwind.context, ptr::null_mut()),
                            // A stray panic on the teardown path; nothing
                            // sane can continue from here.
                            Err(_) => process::abort(),
                        },
                    };
                }
            },
        }

        debug_assert!(!t.context.is_null());

        // Destroy the frame of `this` stack on the resumer's stack.
        unsafe { t.context.resume_ontop(frame as *mut c_void, Self::exit) };
        unreachable!("execution already terminated");
    }

    /// Ontop trampoline of the final switch: runs on the resumer's stack,
    /// with the foreign stack no longer in use but its frame pointer still
    /// known. Reports termination with a null context.
    extern "C-unwind" fn exit(t: Transfer) -> Transfer {
        unsafe {
            Frame::destroy(t.data as *mut Frame<A>);
        }

        Transfer::new(Context::null(), ptr::null_mut())
    }
}

/// Ontop trampoline of [`Execution`]'s drop: raises [`ForcedUnwind`] on the
/// suspended stack, carrying the context of the dropping thread so the entry
/// trampoline can fall back to it after the unwind.
extern "C-unwind" fn unwind(t: Transfer) -> Transfer {
    panic::panic_any(ForcedUnwind { context: t.context });
}

/// An owning handle to a suspended flow running on its own stack.
///
/// The handle is either *paused* (holds a live context, ready for
/// [`resume`](Execution::resume)) or *terminated* (the flow returned and the
/// foreign stack is already reclaimed). Dropping a paused handle forcibly
/// unwinds the foreign stack first; see [`ForcedUnwind`].
pub struct Execution<'f> {
    context: Option<Context>,
    _flow: PhantomData<&'f mut ()>,
}

impl<'f> Execution<'f> {
    /// Launches `flow` onto a freshly allocated stack and returns the paused
    /// handle. The flow is not run yet; the first
    /// [`resume`](Execution::resume) enters it.
    ///
    /// Fails with [`Error::InvalidStackSize`] when the allocator produces
    /// regions smaller than [`MIN_STACK_SIZE`] (the region is returned to the
    /// allocator), or with the allocator's own error.
    pub fn create<A>(allocator: A, flow: Box<dyn Flow + Send + 'f>) -> Result<Execution<'f>, Error>
    where
        A: StackAllocator + Send + 'f,
    {
        // The lifetime is erased here and re-imposed on the returned handle.
        let flow: Box<dyn Flow + Send> = unsafe { mem::transmute(flow) };
        Execution::create_inner(allocator, FlowRef::Owned(flow))
    }

    /// Like [`create`](Execution::create), but the frame only borrows the
    /// flow.
    ///
    /// # Safety
    ///
    /// `flow` must be non-dangling, stay valid and unaliased until the
    /// execution terminates or is dropped, and must not move in the meantime.
    pub unsafe fn create_with_raw_flow<A>(
        allocator: A,
        flow: *mut (dyn Flow + Send + 'f),
    ) -> Result<Execution<'f>, Error>
    where
        A: StackAllocator + Send + 'f,
    {
        if flow.is_null() {
            return Err(Error::InvalidFlow);
        }

        let flow = NonNull::new_unchecked(mem::transmute::<
            *mut (dyn Flow + Send + 'f),
            *mut (dyn Flow + Send),
        >(flow));
        Execution::create_inner(allocator, FlowRef::Raw(flow))
    }

    fn create_inner<A>(allocator: A, flow: FlowRef) -> Result<Execution<'f>, Error>
    where
        A: StackAllocator + Send + 'f,
    {
        let mut stack = allocator.allocate()?;

        let size = stack.size();
        if size < MIN_STACK_SIZE {
            allocator.deallocate(&mut stack);
            return Err(Error::InvalidStackSize {
                size,
                min: MIN_STACK_SIZE,
            });
        }

        // Reserve space for the control block at the highest 256-byte
        // boundary that leaves room for it.
        let storage = (stack.top() as usize - mem::size_of::<Frame<A>>()) & !0xff;
        let base = stack.base() as usize;

        let frame = storage as *mut Frame<A>;
        unsafe {
            ptr::write(
                frame,
                Frame {
                    allocator,
                    stack,
                    flow,
                },
            );
        }

        let sp = (storage - FRAME_GAP) as *mut c_void;
        let usable = storage - FRAME_GAP - base;

        let context = unsafe { Context::new(sp, usable, Frame::<A>::entry) };

        // Transfer the control block pointer to the foreign stack; the entry
        // trampoline stashes it and immediately jumps back, leaving the
        // execution paused at its first suspension point.
        let t = unsafe { context.resume(frame as *mut c_void) };
        debug_assert!(!t.context.is_null());

        log::trace!("execution created with a {} byte stack", size);

        Ok(Execution {
            context: Some(t.context),
            _flow: PhantomData,
        })
    }

    /// Transfers control into the foreign stack until it suspends or
    /// terminates.
    ///
    /// A panic that escaped the flow is re-raised here, on the resumer's
    /// stack.
    ///
    /// # Panics
    ///
    /// Panics when called on a terminated handle; termination is observable
    /// beforehand at the coroutine layer via `is_completed`.
    pub fn resume(&mut self) {
        let context = self
            .context
            .take()
            .expect("resume on a terminated execution");

        let t = unsafe { context.resume(ptr::null_mut()) };

        if !t.context.is_null() {
            self.context = Some(t.context);
        }

        if !t.data.is_null() {
            // The flow panicked; the payload slot lives on the (still
            // suspended) foreign stack.
            let slot = unsafe { &mut *(t.data as *mut Option<PanicPayload>) };
            let payload = slot.take().expect("panic payload already taken");
            panic::resume_unwind(payload);
        }
    }
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            log::trace!("force unwinding a suspended execution");

            // Runs `unwind` on the foreign stack; the resulting panic drops
            // every live value there, after which the entry trampoline
            // destroys the frame on this stack and reports back.
            let t = unsafe { context.resume_ontop(ptr::null_mut(), unwind) };
            debug_assert!(t.context.is_null());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::flow::BasicFlow;
    use crate::stack::{FixedSizeStackAllocator, ProtectedStackAllocator};

    fn allocator(size: usize) -> FixedSizeStackAllocator {
        FixedSizeStackAllocator::new(size).unwrap()
    }

    #[test]
    fn just_works() {
        let counter = AtomicUsize::new(0);
        let step = |expected: usize| {
            assert_eq!(counter.fetch_add(1, Ordering::Relaxed) + 1, expected);
        };

        let flow = BasicFlow::boxed(|suspender: &mut Suspender| {
            step(2);
            suspender.suspend();

            step(4);
            suspender.suspend();

            step(6);
            suspender.suspend();

            step(8);
            suspender.suspend();
        });

        let mut execution = Execution::create(allocator(1_000_000), flow).unwrap();

        step(1);
        execution.resume();

        step(3);
        execution.resume();

        step(5);
        execution.resume();

        step(7);
        execution.resume();
    }

    #[test]
    fn just_works_partial() {
        let counter = AtomicUsize::new(0);
        let step = |expected: usize| {
            assert_eq!(counter.fetch_add(1, Ordering::Relaxed) + 1, expected);
        };

        {
            let flow = BasicFlow::boxed(|suspender: &mut Suspender| {
                step(2);
                suspender.suspend();

                unreachable!("the handle is dropped before a second resume");
            });

            let mut execution = Execution::create(allocator(1_000_000), flow).unwrap();

            step(1);
            execution.resume();

            step(3);
        }

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn create_rejects_small_stacks() {
        let flow = BasicFlow::boxed(|_: &mut Suspender| {});
        let result = Execution::create(allocator(100), flow);

        assert!(matches!(
            result,
            Err(Error::InvalidStackSize { size: 100, .. })
        ));
    }

    #[test]
    fn create_rejects_null_flows() {
        let null_flow: *mut BasicFlow<fn(&mut Suspender)> = ptr::null_mut();
        let result = unsafe {
            Execution::create_with_raw_flow(
                allocator(1_000_000),
                null_flow as *mut (dyn Flow + Send),
            )
        };

        assert!(matches!(result, Err(Error::InvalidFlow)));
    }

    #[test]
    fn rethrows_unhandled_panics() {
        struct MyError;

        let counter = AtomicUsize::new(0);
        let step = |expected: usize| {
            assert_eq!(counter.fetch_add(1, Ordering::Relaxed) + 1, expected);
        };

        let flow = BasicFlow::boxed(|suspender: &mut Suspender| {
            step(2);
            suspender.suspend();

            step(4);
            suspender.suspend();

            step(6);
            panic::panic_any(MyError);
        });

        let mut execution = Execution::create(allocator(1_000_000), flow).unwrap();

        step(1);
        execution.resume();

        step(3);
        execution.resume();

        step(5);
        let caught = panic::catch_unwind(AssertUnwindSafe(|| execution.resume()));
        assert!(caught.unwrap_err().is::<MyError>());

        step(7);
    }

    #[test]
    fn forced_unwind_runs_destructors() {
        struct Echo<'c>(&'c AtomicUsize);

        impl Drop for Echo<'_> {
            fn drop(&mut self) {
                self.0.store(222, Ordering::Relaxed);
            }
        }

        let counter = AtomicUsize::new(0);

        {
            let flow = BasicFlow::boxed(|suspender: &mut Suspender| {
                let _echo = Box::new(Echo(&counter));
                counter.store(111, Ordering::Relaxed);

                suspender.suspend();

                unreachable!("the handle is dropped before a second resume");
            });

            // A guarded mmap stack gets torn down the same way as a heap one.
            let mut execution =
                Execution::create(ProtectedStackAllocator::new(1_000_000).unwrap(), flow).unwrap();

            execution.resume();
            assert_eq!(counter.load(Ordering::Relaxed), 111);
        }

        assert_eq!(counter.load(Ordering::Relaxed), 222);
    }

    #[test]
    fn every_allocation_is_released_once() {
        struct CountingAllocator<'c> {
            inner: FixedSizeStackAllocator,
            allocated: &'c AtomicUsize,
            released: &'c AtomicUsize,
        }

        impl StackAllocator for CountingAllocator<'_> {
            fn allocate(&self) -> Result<Stack, Error> {
                let stack = self.inner.allocate()?;
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Ok(stack)
            }

            fn deallocate(&self, stack: &mut Stack) {
                self.released.fetch_add(1, Ordering::Relaxed);
                self.inner.deallocate(stack);
            }
        }

        let allocated = AtomicUsize::new(0);
        let released = AtomicUsize::new(0);
        let counting = || CountingAllocator {
            inner: FixedSizeStackAllocator::new(1_000_000).unwrap(),
            allocated: &allocated,
            released: &released,
        };

        // Normal completion.
        let mut execution =
            Execution::create(counting(), BasicFlow::boxed(|_: &mut Suspender| {})).unwrap();
        execution.resume();
        drop(execution);
        assert_eq!(allocated.load(Ordering::Relaxed), 1);
        assert_eq!(released.load(Ordering::Relaxed), 1);

        // A panic escaping the flow.
        struct Boom;
        let mut execution = Execution::create(
            counting(),
            BasicFlow::boxed(|_: &mut Suspender| panic::panic_any(Boom)),
        )
        .unwrap();
        assert!(panic::catch_unwind(AssertUnwindSafe(|| execution.resume())).is_err());
        drop(execution);
        assert_eq!(allocated.load(Ordering::Relaxed), 2);
        assert_eq!(released.load(Ordering::Relaxed), 2);

        // Dropped while suspended.
        let mut execution = Execution::create(
            counting(),
            BasicFlow::boxed(|suspender: &mut Suspender| suspender.suspend()),
        )
        .unwrap();
        execution.resume();
        drop(execution);
        assert_eq!(allocated.load(Ordering::Relaxed), 3);
        assert_eq!(released.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn nested_executions() {
        let counter = AtomicUsize::new(0);
        let step = |expected: usize| {
            assert_eq!(counter.fetch_add(1, Ordering::Relaxed) + 1, expected);
        };

        let mut execution_one = Execution::create(
            allocator(1_000_000),
            BasicFlow::boxed(|suspender: &mut Suspender| {
                step(2);
                suspender.suspend();

                step(4);
            }),
        )
        .unwrap();

        let mut execution_two = Execution::create(
            allocator(1_000_000),
            BasicFlow::boxed(|_: &mut Suspender| {
                step(1);
                execution_one.resume();

                step(3);
                execution_one.resume();

                let mut nested = Execution::create(
                    allocator(1_000_000),
                    BasicFlow::boxed(|suspender: &mut Suspender| {
                        step(5);
                        suspender.suspend();

                        step(7);
                    }),
                )
                .unwrap();

                nested.resume();

                step(6);
                nested.resume();
            }),
        )
        .unwrap();

        execution_two.resume();

        assert_eq!(counter.load(Ordering::Relaxed), 7);
    }
}
