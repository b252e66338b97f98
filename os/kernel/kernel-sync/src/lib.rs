//! # Kernel synchronization primitives
//!
//! The virtual-memory core only needs one primitive: a short-hold spin lock
//! guarding allocator watermarks and the identity-window slot pool. Critical
//! sections are a handful of loads and stores; sleeping locks would be
//! overkill and are unavailable this early anyway.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
