// Copyright 2026 strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A leaner coroutine whose routine takes the suspender explicitly.
//!
//! Where [`Coroutine`](crate::coroutine::Coroutine) stashes the engine's
//! suspender so that plain nullary routines can yield through the handle,
//! [`NaiveCoroutine`] skips the indirection: its routine receives the
//! [`Suspender`] as an argument and yields on it directly.

use std::panic::{self, AssertUnwindSafe};

use crate::error::Error;
use crate::execution::{Execution, Suspender};
use crate::flow::Flow;
use crate::stack::{FixedSizeStackAllocator, StackAllocator};

/// Stack size used by [`NaiveCoroutine::create`].
const DEFAULT_STACK_SIZE: usize = 1_000_000;

struct Core<'r> {
    completed: bool,
    /// Declared before `routine`: a drop-triggered forced unwind still runs
    /// frames of the routine on the foreign stack.
    execution: Option<Execution<'r>>,
    routine: Option<Box<dyn FnOnce(&mut Suspender) + Send + 'r>>,
}

impl Flow for Core<'_> {
    fn run(&mut self, suspender: &mut Suspender) {
        if let Some(routine) = self.routine.take() {
            routine(suspender);
        }
        self.completed = true;
    }
}

/// A coroutine over a `FnOnce(&mut Suspender)` routine.
pub struct NaiveCoroutine<'r> {
    core: Box<Core<'r>>,
}

impl<'r> NaiveCoroutine<'r> {
    /// Creates a coroutine running `routine` on a default-sized stack.
    pub fn create<F>(routine: F) -> Result<NaiveCoroutine<'r>, Error>
    where
        F: FnOnce(&mut Suspender) + Send + 'r,
    {
        NaiveCoroutine::create_with(FixedSizeStackAllocator::new(DEFAULT_STACK_SIZE)?, routine)
    }

    /// Creates a coroutine running `routine` on a stack from `allocator`.
    pub fn create_with<A, F>(allocator: A, routine: F) -> Result<NaiveCoroutine<'r>, Error>
    where
        A: StackAllocator + Send + 'r,
        F: FnOnce(&mut Suspender) + Send + 'r,
    {
        let mut core = Box::new(Core {
            completed: false,
            execution: None,
            routine: Some(Box::new(routine)),
        });

        let flow = &mut *core as *mut Core<'r> as *mut (dyn Flow + Send + 'r);
        // The core is boxed and the box outlives the execution, so the raw
        // flow pointer stays valid and in place.
        let execution = unsafe { Execution::create_with_raw_flow(allocator, flow)? };
        core.execution = Some(execution);

        Ok(NaiveCoroutine { core })
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

    /// True once the routine has returned or a panic escaped it.
    pub fn is_completed(&self) -> bool {
        self.core.completed
    }
}
