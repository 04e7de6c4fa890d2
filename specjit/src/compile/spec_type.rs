//! Speculated types: sets of run-time value kinds, used both for upstream predictions and for
//! the types the backend has proven.

use crate::value::JSValue;
use std::fmt;

#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct SpecType(u16);

impl SpecType {
    pub const EMPTY: SpecType = SpecType(0);
    pub const INT32: SpecType = SpecType(1 << 0);
    /// Non-integral or out-of-int32-range doubles, excluding NaN.
    pub const DOUBLE_REAL: SpecType = SpecType(1 << 1);
    pub const DOUBLE_NAN: SpecType = SpecType(1 << 2);
    pub const BOOLEAN: SpecType = SpecType(1 << 3);
    /// `null` and `undefined`.
    pub const OTHER: SpecType = SpecType(1 << 4);
    pub const STRING: SpecType = SpecType(1 << 5);
    pub const FINAL_OBJECT: SpecType = SpecType(1 << 6);
    pub const ARRAY: SpecType = SpecType(1 << 7);
    pub const FUNCTION: SpecType = SpecType(1 << 8);
    pub const INT32_ARRAY: SpecType = SpecType(1 << 9);
    pub const FLOAT64_ARRAY: SpecType = SpecType(1 << 10);

    pub const DOUBLE: SpecType = SpecType(Self::DOUBLE_REAL.0 | Self::DOUBLE_NAN.0);
    pub const NUMBER: SpecType = SpecType(Self::INT32.0 | Self::DOUBLE.0);
    pub const OBJECT: SpecType = SpecType(
        Self::FINAL_OBJECT.0
            | Self::ARRAY.0
            | Self::FUNCTION.0
            | Self::INT32_ARRAY.0
            | Self::FLOAT64_ARRAY.0,
    );
    pub const CELL: SpecType = SpecType(Self::STRING.0 | Self::OBJECT.0);
    pub const TOP: SpecType = SpecType((1 << 11) - 1);

    pub fn union(self, other: SpecType) -> SpecType {
        SpecType(self.0 | other.0)
    }

    pub fn intersect(self, other: SpecType) -> SpecType {
        SpecType(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Is every value in `self` also in `other`? Note that the empty set is a subset of
    /// everything: callers that care about "no prediction" must check [Self::is_empty] first.
    pub fn is_subset_of(self, other: SpecType) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersects(self, other: SpecType) -> bool {
        self.0 & other.0 != 0
    }

    /// Is this a non-empty subset of `other`? This is the usual "should we speculate" test.
    pub fn is(self, other: SpecType) -> bool {
        !self.is_empty() && self.is_subset_of(other)
    }

    /// The most precise type of a known value. `heap_type` gives the type of cells, which can't
    /// be determined from the value alone.
    pub fn from_value(v: JSValue, heap_type: impl Fn(u64) -> SpecType) -> SpecType {
        if v.is_int32() {
            SpecType::INT32
        } else if let Some(d) = v.as_double() {
            if d.is_nan() {
                SpecType::DOUBLE_NAN
            } else {
                SpecType::DOUBLE_REAL
            }
        } else if v.is_boolean() {
            SpecType::BOOLEAN
        } else if v.is_undefined_or_null() {
            SpecType::OTHER
        } else if let Some(c) = v.as_cell() {
            heap_type(c)
        } else {
            SpecType::EMPTY
        }
    }
}

impl fmt::Debug for SpecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for SpecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == SpecType::TOP {
            return write!(f, "Top");
        }
        if self.is_empty() {
            return write!(f, "Empty");
        }
        let names = [
            (SpecType::INT32, "Int32"),
            (SpecType::DOUBLE_REAL, "DoubleReal"),
            (SpecType::DOUBLE_NAN, "DoubleNaN"),
            (SpecType::BOOLEAN, "Boolean"),
            (SpecType::OTHER, "Other"),
            (SpecType::STRING, "String"),
            (SpecType::FINAL_OBJECT, "FinalObject"),
            (SpecType::ARRAY, "Array"),
            (SpecType::FUNCTION, "Function"),
            (SpecType::INT32_ARRAY, "Int32Array"),
            (SpecType::FLOAT64_ARRAY, "Float64Array"),
        ];
        let s = names
            .iter()
            .filter(|(t, _)| self.intersects(*t))
            .map(|(_, n)| *n)
            .collect::<Vec<_>>()
            .join("|");
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lattice() {
        assert!(SpecType::INT32.is(SpecType::NUMBER));
        assert!(!SpecType::EMPTY.is(SpecType::NUMBER));
        assert!(SpecType::EMPTY.is_subset_of(SpecType::NUMBER));
        assert!(!SpecType::NUMBER.is_subset_of(SpecType::INT32));
        assert!(SpecType::ARRAY.is(SpecType::CELL));
        assert_eq!(
            SpecType::NUMBER.intersect(SpecType::CELL),
            SpecType::EMPTY
        );
        assert_eq!(
            SpecType::INT32.union(SpecType::BOOLEAN).to_string(),
            "Int32|Boolean"
        );
        assert_eq!(SpecType::TOP.to_string(), "Top");
    }

    #[test]
    fn from_value() {
        let cell = |_| SpecType::STRING;
        assert_eq!(SpecType::from_value(JSValue::int32(3), cell), SpecType::INT32);
        assert_eq!(
            SpecType::from_value(JSValue::double(f64::NAN), cell),
            SpecType::DOUBLE_NAN
        );
        assert_eq!(SpecType::from_value(JSValue::NULL, cell), SpecType::OTHER);
        assert_eq!(
            SpecType::from_value(JSValue::cell(0x1000), cell),
            SpecType::STRING
        );
    }
}
