// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, tailored for the current target. Each architecture
//! support module must define the same set of names.
//!
//! On anything that is not the AVR target we substitute a software fake, so
//! the kernel's own test suite runs under plain `cargo test` on the host.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "avr")] {
        #[macro_use]
        pub mod avr;
        pub use avr::*;
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
