//! RTP sequence-number arithmetic under 16-bit modular wrap (RFC 3550 A.1).
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


/// True iff `a` is later-than-or-equal to `b` under 16-bit modular wrap.
///
/// `a` is later-than-or-equal `b` iff `(a - b) mod 2^16` has its high bit
/// clear (RFC 3550 Appendix A.1).
pub fn later(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) & 0x8000) == 0
}

/// True iff `a` is strictly earlier than `b` under 16-bit modular wrap.
///
/// The complement of `later`, excluding equality.
pub fn earlier(a: u16, b: u16) -> bool {
    a != b && !later(a, b)
}

/// True iff comparing `a` against `b` crosses the 16-bit wraparound boundary.
pub fn crosses_wrap(a: u16, b: u16) -> bool {
    a > b && (a & 0x8000) != 0 && (b & 0x8000) == 0
}

/// Build an extended (32-bit) sequence number from a cycle counter and the
/// current 16-bit sn. `cycles` must already be a multiple of `2^16`.
pub fn extend(cycles: u32, sn: u16) -> u32 {
    cycles | sn as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_handles_simple_order() {
        assert!(later(10, 5));
        assert!(later(5, 5));
        assert!(!later(5, 10));
    }

    #[test]
    fn later_handles_wrap() {
        // 2 is "later" than 65534 once the counter has wrapped.
        assert!(later(2, 65534));
        assert!(!later(65534, 2));
    }

    #[test]
    fn earlier_is_strict_complement_of_later() {
        for a in [0u16, 1, 100, 32768, 65535] {
            for b in [0u16, 1, 100, 32768, 65535] {
                let l = later(a, b) && a != b;
                let e = earlier(a, b);
                assert_eq!(l, !e || a == b);
                // exactly one of later-strict, earlier, equal holds
                let eq = a == b;
                let strict_later = later(a, b) && !eq;
                assert_eq!([strict_later, e, eq].iter().filter(|x| **x).count(), 1);
            }
        }
    }

    #[test]
    fn crosses_wrap_detects_boundary() {
        assert!(crosses_wrap(0x8001, 0x0001));
        assert!(!crosses_wrap(10, 5));
    }

    #[test]
    fn extend_combines_cycle_and_sn() {
        assert_eq!(extend(0, 10), 10);
        assert_eq!(extend(1 << 16, 10), (1 << 16) + 10);
    }
}
