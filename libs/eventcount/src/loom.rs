// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shims that switch between `core`/`std` primitives and their loom
//! counterparts depending on `--cfg loom`.

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) mod sync {
            pub(crate) use loom::sync::atomic;
        }
        pub(crate) mod thread {
            pub(crate) use loom::thread::yield_now;
        }
    } else {
        pub(crate) mod sync {
            pub(crate) use core::sync::atomic;
        }
    }
}
