#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod cfg;
pub mod drivers;
pub mod mem;
pub mod net;
pub mod sync;
pub mod task;
pub mod util;
