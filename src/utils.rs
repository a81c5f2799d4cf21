// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

use lazy_static::lazy_static;
use std::time::Instant;

lazy_static! {
    static ref STARTUP: Instant = Instant::now();
}

/// Milliseconds of monotonic time since the driver was first used.
///
/// All cooldown and tuner deadlines are expressed in this timebase so that
/// the decision logic can be driven with an explicit `now` in tests.
pub fn now_ms() -> u64 {
    STARTUP.elapsed().as_millis() as u64
}

/// Convert a pool difficulty into the compact target word the chip filters
/// nonces against (same format as the block header `nBits` field).
pub fn target_from_diff(diff: f64) -> u32 {
    let mut shift = 29i32;
    let mut f = f64::from(0x0000_ffffu32) / diff;
    while f < f64::from(0x8000u16) {
        shift -= 1;
        f *= 256.0;
    }
    while f >= f64::from(0x0080_0000u32) {
        shift += 1;
        f /= 256.0;
    }
    (f as u32).wrapping_add((shift as u32) << 24)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_target_diff_one() {
        assert_eq!(target_from_diff(1.0), 0x1d00ffff);
    }

    #[test]
    fn test_target_higher_diff() {
        // diff 2 halves the target mantissa
        assert_eq!(target_from_diff(2.0), 0x1c7fff80);
        // diff 256 shifts the exponent down by one byte
        assert_eq!(target_from_diff(256.0), 0x1c00ffff);
    }

    #[test]
    fn test_now_ms_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
