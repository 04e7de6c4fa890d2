//! The generation-info ledger: for each value slot, where its value currently lives and in what
//! representation.

use crate::compile::{
    graph::NodeIdx,
    machine::{Fpr, Gpr},
};
use strum::Display;

/// The representation of a value in a register or spill slot.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum DataFormat {
    None,
    /// A raw int32 with the upper 32 bits zeroed.
    Int32,
    /// A raw double in an FPR (or its bit pattern in a spill slot).
    Double,
    /// A raw `0` or `1`.
    Boolean,
    /// A cell pointer.
    Cell,
    /// A pointer into a cell's out-of-line storage.
    Storage,
    /// A boxed value of unknown type.
    JS,
    JSInt32,
    JSDouble,
    JSCell,
    JSBoolean,
}

impl DataFormat {
    /// Is this a boxed representation?
    pub fn is_js(self) -> bool {
        matches!(
            self,
            DataFormat::JS
                | DataFormat::JSInt32
                | DataFormat::JSDouble
                | DataFormat::JSCell
                | DataFormat::JSBoolean
        )
    }

    /// A cell pointer is bit-identical to the boxed cell.
    pub fn is_cell(self) -> bool {
        matches!(self, DataFormat::Cell | DataFormat::JSCell)
    }
}

/// The order in which registers are chosen as spill victims: lower values are spilled first.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum SpillOrder {
    /// No value: the register is free.
    Free = 0,
    /// Constants can be rematerialised without a load.
    Constant = 1,
    /// The value is already in its spill slot.
    Spilled = 2,
    /// Boxed values, cells and storage pointers.
    JS = 4,
    Int32 = 5,
    Double = 6,
}

impl SpillOrder {
    pub fn for_format(fmt: DataFormat) -> SpillOrder {
        match fmt {
            DataFormat::None => SpillOrder::Free,
            DataFormat::Int32 | DataFormat::Boolean => SpillOrder::Int32,
            DataFormat::Double => SpillOrder::Double,
            _ => SpillOrder::JS,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegLoc {
    None,
    Gpr(Gpr),
    Fpr(Fpr),
}

#[derive(Clone, Debug)]
pub struct GenerationInfo {
    node: Option<NodeIdx>,
    use_count: u32,
    register_format: DataFormat,
    spill_format: DataFormat,
    is_constant: bool,
    loc: RegLoc,
}

impl Default for GenerationInfo {
    fn default() -> Self {
        Self {
            node: None,
            use_count: 0,
            register_format: DataFormat::None,
            spill_format: DataFormat::None,
            is_constant: false,
            loc: RegLoc::None,
        }
    }
}

impl GenerationInfo {
    /// `node` is a constant: it has no register or spill slot and is rematerialised on demand.
    pub fn init_constant(&mut self, node: NodeIdx, use_count: u32) {
        *self = Self {
            node: Some(node),
            use_count,
            is_constant: true,
            ..Self::default()
        };
    }

    pub fn init_gpr(&mut self, node: NodeIdx, use_count: u32, gpr: Gpr, fmt: DataFormat) {
        debug_assert!(fmt != DataFormat::Double && fmt != DataFormat::None);
        *self = Self {
            node: Some(node),
            use_count,
            register_format: fmt,
            loc: RegLoc::Gpr(gpr),
            ..Self::default()
        };
    }

    pub fn init_fpr(&mut self, node: NodeIdx, use_count: u32, fpr: Fpr) {
        *self = Self {
            node: Some(node),
            use_count,
            register_format: DataFormat::Double,
            loc: RegLoc::Fpr(fpr),
            ..Self::default()
        };
    }

    pub fn node(&self) -> Option<NodeIdx> {
        self.node
    }

    pub fn is_alive(&self) -> bool {
        self.node.is_some()
    }

    pub fn is_constant(&self) -> bool {
        self.is_constant
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn register_format(&self) -> DataFormat {
        self.register_format
    }

    pub fn spill_format(&self) -> DataFormat {
        self.spill_format
    }

    pub fn is_spilled(&self) -> bool {
        self.spill_format != DataFormat::None
    }

    pub fn gpr(&self) -> Option<Gpr> {
        match self.loc {
            RegLoc::Gpr(r) => Some(r),
            _ => None,
        }
    }

    pub fn fpr(&self) -> Option<Fpr> {
        match self.loc {
            RegLoc::Fpr(r) => Some(r),
            _ => None,
        }
    }

    pub fn loc(&self) -> RegLoc {
        self.loc
    }

    /// The spill order of the register holding this value.
    pub fn spill_order(&self) -> SpillOrder {
        if self.is_constant {
            SpillOrder::Constant
        } else if self.is_spilled() {
            SpillOrder::Spilled
        } else {
            SpillOrder::for_format(self.register_format)
        }
    }

    /// Record that the value is now (also) in `gpr` in format `fmt`.
    pub fn fill_gpr(&mut self, gpr: Gpr, fmt: DataFormat) {
        debug_assert!(fmt != DataFormat::Double && fmt != DataFormat::None);
        self.register_format = fmt;
        self.loc = RegLoc::Gpr(gpr);
    }

    pub fn fill_fpr(&mut self, fpr: Fpr) {
        self.register_format = DataFormat::Double;
        self.loc = RegLoc::Fpr(fpr);
    }

    /// Record that the value has been stored to its spill slot in format `fmt` and is no longer in
    /// a register.
    pub fn spill(&mut self, fmt: DataFormat) {
        debug_assert!(!self.is_constant);
        self.spill_format = fmt;
        self.register_format = DataFormat::None;
        self.loc = RegLoc::None;
    }

    /// The value is no longer in a register, though it may still be spilled or be a constant.
    pub fn release_registers(&mut self) {
        self.register_format = DataFormat::None;
        self.loc = RegLoc::None;
    }

    /// Consume one use of this value, returning `true` if that was the last use.
    pub fn use_value(&mut self) -> bool {
        debug_assert!(self.use_count > 0);
        self.use_count -= 1;
        self.use_count == 0
    }

    /// Forget everything about this value.
    pub fn kill(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle() {
        let mut gi = GenerationInfo::default();
        assert!(!gi.is_alive());
        gi.init_gpr(NodeIdx::from_usize(3), 2, Gpr::R1, DataFormat::Int32);
        assert_eq!(gi.gpr(), Some(Gpr::R1));
        assert_eq!(gi.spill_order(), SpillOrder::Int32);
        gi.spill(DataFormat::Int32);
        assert_eq!(gi.loc(), RegLoc::None);
        assert_eq!(gi.spill_order(), SpillOrder::Spilled);
        gi.fill_gpr(Gpr::R2, DataFormat::JSInt32);
        assert_eq!(gi.spill_format(), DataFormat::Int32);
        assert!(!gi.use_value());
        assert!(gi.use_value());
        gi.kill();
        assert!(!gi.is_alive());
    }

    #[test]
    fn constants_spill_first() {
        assert!(SpillOrder::Constant < SpillOrder::Spilled);
        assert!(SpillOrder::Spilled < SpillOrder::JS);
        assert!(SpillOrder::JS < SpillOrder::Double);
    }
}
