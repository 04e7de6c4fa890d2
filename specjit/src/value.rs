//! The 64-bit boxed representation of dynamic values.
//!
//! Values are NaN-boxed:
//!
//! ```text
//!   pointer  { 0000:PPPP:PPPP:PPPP
//!            / 0001:****:****:****
//!   double   {         ...
//!            \ FFFE:****:****:****
//!   int32    { FFFF:0000:IIII:IIII
//! ```
//!
//! Doubles are stored with `2^48` added to their bit pattern. Immediates other than numbers live
//! in the low bits of the "pointer" space: `null = 0x02`, `undefined = 0x0a`, `false = 0x06`,
//! `true = 0x07`. The all-zero pattern is the "empty" value (an array hole), never observable by
//! user code.

use std::fmt;

/// The tag of every boxed int32. Any value `>=` this is an int32; any value with one of these
/// bits set is a number.
pub const TAG_TYPE_NUMBER: u64 = 0xFFFF_0000_0000_0000;
/// Added to a double's bit pattern when it is boxed.
pub const DOUBLE_ENCODE_OFFSET: u64 = 1 << 48;
/// The tag bit set on all non-cell immediates.
pub const TAG_BIT_TYPE_OTHER: u64 = 0x2;
pub const TAG_BIT_BOOL: u64 = 0x4;
pub const TAG_BIT_UNDEFINED: u64 = 0x8;
/// A value `v` is a cell iff `v & TAG_MASK == 0` (and `v != 0`).
pub const TAG_MASK: u64 = TAG_TYPE_NUMBER | TAG_BIT_TYPE_OTHER;

pub const VALUE_EMPTY: u64 = 0x0;
pub const VALUE_NULL: u64 = TAG_BIT_TYPE_OTHER;
pub const VALUE_UNDEFINED: u64 = TAG_BIT_TYPE_OTHER | TAG_BIT_UNDEFINED;
pub const VALUE_FALSE: u64 = TAG_BIT_TYPE_OTHER | TAG_BIT_BOOL;
pub const VALUE_TRUE: u64 = VALUE_FALSE | 1;

#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct JSValue(u64);

impl JSValue {
    pub const EMPTY: JSValue = JSValue(VALUE_EMPTY);
    pub const NULL: JSValue = JSValue(VALUE_NULL);
    pub const UNDEFINED: JSValue = JSValue(VALUE_UNDEFINED);
    pub const FALSE: JSValue = JSValue(VALUE_FALSE);
    pub const TRUE: JSValue = JSValue(VALUE_TRUE);

    pub fn from_bits(bits: u64) -> Self {
        JSValue(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn int32(x: i32) -> Self {
        JSValue(TAG_TYPE_NUMBER | u64::from(x as u32))
    }

    /// Box `x` as a double. Note that this never produces an int32, even if `x` is integral: use
    /// [JSValue::number] for the canonical representation.
    pub fn double(x: f64) -> Self {
        JSValue(x.to_bits().wrapping_add(DOUBLE_ENCODE_OFFSET))
    }

    /// Box `x` as an int32 if that is lossless (including preserving negative zero), or as a
    /// double otherwise.
    pub fn number(x: f64) -> Self {
        let i = x as i32;
        if f64::from(i) == x && !(i == 0 && x.is_sign_negative()) {
            Self::int32(i)
        } else {
            Self::double(x)
        }
    }

    pub fn boolean(b: bool) -> Self {
        if b { Self::TRUE } else { Self::FALSE }
    }

    /// Box the cell at address `addr`.
    pub fn cell(addr: u64) -> Self {
        debug_assert!(addr != 0 && addr & TAG_MASK == 0);
        JSValue(addr)
    }

    pub fn is_empty(self) -> bool {
        self.0 == VALUE_EMPTY
    }

    pub fn is_int32(self) -> bool {
        self.0 & TAG_TYPE_NUMBER == TAG_TYPE_NUMBER
    }

    pub fn is_double(self) -> bool {
        self.is_number() && !self.is_int32()
    }

    pub fn is_number(self) -> bool {
        self.0 & TAG_TYPE_NUMBER != 0
    }

    pub fn is_cell(self) -> bool {
        self.0 != VALUE_EMPTY && self.0 & TAG_MASK == 0
    }

    pub fn is_boolean(self) -> bool {
        self.0 & !1 == VALUE_FALSE
    }

    pub fn is_null(self) -> bool {
        self.0 == VALUE_NULL
    }

    pub fn is_undefined(self) -> bool {
        self.0 == VALUE_UNDEFINED
    }

    /// Is this `null` or `undefined`?
    pub fn is_undefined_or_null(self) -> bool {
        self.0 & !TAG_BIT_UNDEFINED == VALUE_NULL
    }

    pub fn as_int32(self) -> Option<i32> {
        if self.is_int32() {
            Some(self.0 as u32 as i32)
        } else {
            None
        }
    }

    pub fn as_double(self) -> Option<f64> {
        if self.is_double() {
            Some(f64::from_bits(self.0.wrapping_sub(DOUBLE_ENCODE_OFFSET)))
        } else {
            None
        }
    }

    /// If this is a number of either representation, return it as an `f64`.
    pub fn as_number(self) -> Option<f64> {
        self.as_int32().map(f64::from).or_else(|| self.as_double())
    }

    pub fn as_boolean(self) -> Option<bool> {
        if self.is_boolean() {
            Some(self.0 == VALUE_TRUE)
        } else {
            None
        }
    }

    pub fn as_cell(self) -> Option<u64> {
        if self.is_cell() { Some(self.0) } else { None }
    }
}

impl fmt::Debug for JSValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for JSValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(x) = self.as_int32() {
            write!(f, "Int32: {x}")
        } else if let Some(x) = self.as_double() {
            write!(f, "Double: {x:?}")
        } else if let Some(x) = self.as_boolean() {
            write!(f, "{x}")
        } else if self.is_null() {
            write!(f, "null")
        } else if self.is_undefined() {
            write!(f, "undefined")
        } else if self.is_empty() {
            write!(f, "<empty>")
        } else if self.is_cell() {
            write!(f, "Cell: 0x{:x}", self.0)
        } else {
            write!(f, "<invalid 0x{:x}>", self.0)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodings() {
        assert_eq!(JSValue::int32(-1).bits(), 0xFFFF_0000_FFFF_FFFF);
        assert_eq!(JSValue::int32(-1).as_int32(), Some(-1));
        assert_eq!(JSValue::double(1.5).as_double(), Some(1.5));
        assert!(JSValue::double(f64::NAN).as_double().unwrap().is_nan());
        assert_eq!(JSValue::number(3.0), JSValue::int32(3));
        assert!(JSValue::number(-0.0).is_double());
        assert!(JSValue::TRUE.is_boolean() && JSValue::FALSE.is_boolean());
        assert!(!JSValue::NULL.is_boolean());
        assert!(JSValue::NULL.is_undefined_or_null());
        assert!(JSValue::UNDEFINED.is_undefined_or_null());
        assert!(!JSValue::FALSE.is_undefined_or_null());
        assert!(JSValue::cell(0x1000).is_cell());
        assert!(!JSValue::int32(0).is_cell());
        assert!(!JSValue::EMPTY.is_cell());
    }
}
