// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The stack integrity fold.

use abi::StackChecksum;

/// Folds a byte sequence into a single byte: each byte is XORed into the
/// accumulator, which is rotated left by one bit between bytes.
///
/// The rotation makes the fold position-sensitive, so any single bit flip
/// anywhere in the input changes the result. Flips of the same bit in two
/// bytes whose positions differ by a multiple of eight land on the same
/// accumulator bit and cancel; that collision class is accepted in exchange
/// for a fold cheap enough to run twice per tick.
pub fn fold_bytes(bytes: &[u8]) -> StackChecksum {
    let mut acc: u8 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if i != 0 {
            acc = acc.rotate_left(1);
        }
        acc ^= b;
    }
    acc
}
