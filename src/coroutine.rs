// Copyright 2026 strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The user-facing symmetric coroutine.
//!
//! A [`Coroutine`] couples a straight-line [`Routine`] with an
//! [`Execution`]; the routine needs no knowledge of the engine's suspender
//! and can yield by calling [`Coroutine::suspend`] from anywhere inside
//! itself, arbitrarily deep in its own call tree.

use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use crate::error::Error;
use crate::execution::{Execution, Suspender};
use crate::flow::Flow;
use crate::stack::{FixedSizeStackAllocator, StackAllocator};

/// Stack size used by [`Coroutine::with_default_stack`]: 1 MiB.
const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// What the user wants to compute inside a [`Coroutine`].
pub trait Routine {
    /// Runs the routine to completion.
    fn run_routine(&mut self);
}

/// A [`Routine`] wrapping a plain nullary closure.
pub struct BasicRoutine<F> {
    func: Option<F>,
}

impl<F> BasicRoutine<F>
where
    F: FnOnce() + Send,
{
    pub fn new(func: F) -> BasicRoutine<F> {
        BasicRoutine { func: Some(func) }
    }

    /// Boxes the closure up for [`Coroutine::create`].
    pub fn boxed<'r>(func: F) -> Box<dyn Routine + Send + 'r>
    where
        F: 'r,
    {
        Box::new(BasicRoutine::new(func))
    }
}

impl<F> Routine for BasicRoutine<F>
where
    F: FnOnce() + Send,
{
    fn run_routine(&mut self) {
        if let Some(func) = self.func.take() {
            func();
        }
    }
}

/// The coroutine state. The execution's frame keeps a raw flow pointer back
/// to this block, so it lives behind a `Box` and never moves.
struct Core<'r> {
    completed: bool,
    /// Points at the engine's suspender while the coroutine runs; installed
    /// on first entry, which is what arms [`Coroutine::suspend`].
    suspender: Option<NonNull<Suspender>>,
    /// Declared before `routine`: a drop-triggered forced unwind still runs
    /// frames of the routine on the foreign stack.
    execution: Option<Execution<'r>>,
    routine: Box<dyn Routine + Send + 'r>,
}

// The suspender pointer is only dereferenced on whichever thread currently
// runs the coroutine; resumes must not overlap.
unsafe impl Send for Core<'_> {}

impl Flow for Core<'_> {
    fn run(&mut self, suspender: &mut Suspender) {
        self.suspender = Some(NonNull::from(suspender));
        self.routine.run_routine();
        self.completed = true;
    }
}

/// A reusable handle around one suspendable routine.
///
/// Not `Sync`: a coroutine may hop between threads, but only one thread may
/// touch it at a time, and a resume must have returned before the next one
/// starts elsewhere.
pub struct Coroutine<'r> {
    core: Box<Core<'r>>,
}

impl<'r> Coroutine<'r> {
    /// Creates a coroutine running `routine` on a stack from `allocator`.
    ///
    /// The routine is not entered; the first [`resume`](Coroutine::resume)
    /// starts it.
    pub fn create<A>(
        allocator: A,
        routine: Box<dyn Routine + Send + 'r>,
    ) -> Result<Coroutine<'r>, Error>
    where
        A: StackAllocator + Send + 'r,
    {
        let mut core = Box::new(Core {
            completed: false,
            suspender: None,
            execution: None,
            routine,
        });

        let flow = &mut *core as *mut Core<'r> as *mut (dyn Flow + Send + 'r);
        // The core is boxed and the box outlives the execution, so the raw
        // flow pointer stays valid and in place.
        let execution = unsafe { Execution::create_with_raw_flow(allocator, flow)? };
        core.execution = Some(execution);

        Ok(Coroutine { core })
    }

    /// [`create`](Coroutine::create) with a 1 MiB fixed-size stack.
    pub fn with_default_stack(routine: Box<dyn Routine + Send + 'r>) -> Result<Coroutine<'r>, Error> {
        Coroutine::create(FixedSizeStackAllocator::new(DEFAULT_STACK_SIZE)?, routine)
    }

    /// Runs the routine until its next suspension point or completion.
    ///
    /// Fails with [`Error::ResumeOnCompletedCoroutine`] once the routine has
    /// finished. A panic escaping the routine marks the coroutine completed
    /// and is re-raised here.
    pub fn resume(&mut self) -> Result<(), Error> {
        if self.core.completed {
            return Err(Error::ResumeOnCompletedCoroutine);
        }

        let execution = self
            .core
            .execution
            .as_mut()
            .expect("execution is present after create");

        match panic::catch_unwind(AssertUnwindSafe(|| execution.resume())) {
            Ok(()) => Ok(()),
            Err(payload) => {
                self.core.completed = true;
                panic::resume_unwind(payload);
            }
        }
    }

    /// Transfers control back to the caller of the current
    /// [`resume`](Coroutine::resume).
    ///
    /// Fails with [`Error::SuspendOnNotStartedCoroutine`] before the first
    /// resume. Only meaningful from within the running routine; calling it
    /// from outside is a programmer error.
    pub fn suspend(&mut self) -> Result<(), Error> {
        match self.core.suspender {
            None => Err(Error::SuspendOnNotStartedCoroutine),
            Some(mut suspender) => {
                unsafe { suspender.as_mut().suspend() };
                Ok(())
            }
        }
    }

    /// True once the routine has returned or a panic escaped it.
    pub fn is_completed(&self) -> bool {
        self.core.completed
    }
}
