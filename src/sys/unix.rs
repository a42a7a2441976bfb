// Copyright 2026 strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::stack::Stack;

pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut ret = PAGE_SIZE.load(Ordering::Relaxed);

    if ret == 0 {
        ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(ret, Ordering::Relaxed);
    }

    ret
}

pub fn min_stack_size() -> usize {
    libc::MINSIGSTKSZ as usize
}

pub fn max_stack_size() -> usize {
    static MAX_STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut ret = MAX_STACK_SIZE.load(Ordering::Relaxed);

    if ret == 0 {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let err = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) };

        // Unlimited or unknown: cap at 1 GiB.
        ret = if err == 0
            && limit.rlim_max != libc::RLIM_INFINITY
            && (limit.rlim_max as u64) < (usize::MAX as u64)
        {
            limit.rlim_max as usize
        } else {
            1024 * 1024 * 1024
        };

        MAX_STACK_SIZE.store(ret, Ordering::Relaxed);
    }

    ret
}

pub fn allocate_stack(size: usize) -> io::Result<Stack> {
    const PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
    const TYPE: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, PROT, TYPE, -1, 0) };

    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(Stack::new(size, (ptr as usize + size) as *mut c_void))
    }
}

pub fn protect_stack(stack: &Stack) -> io::Result<Stack> {
    let page_size = page_size();

    debug_assert!(stack.size() % page_size == 0 && stack.size() != 0);

    let ret = unsafe { libc::mprotect(stack.base(), page_size, libc::PROT_NONE) };

    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(Stack::new(stack.size() - page_size, stack.top()))
    }
}

pub fn deallocate_stack(stack: &mut Stack) {
    if !stack.is_empty() {
        unsafe {
            libc::munmap(stack.base(), stack.size());
        }
    }

    stack.release();
}
