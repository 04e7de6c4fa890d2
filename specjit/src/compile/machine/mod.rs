//! The SJM64 register machine: the target of code generation.
//!
//! SJM64 is a small 64-bit load/store machine with 16 general purpose registers and 9 double
//! precision floating point registers. Instructions are byte encoded (see [encode]) with fixed
//! per-opcode layouts so that branch displacements, call targets, and inline cache constants can
//! be patched in place after code has been emitted.
//!
//! 32-bit ALU operations read the low 32 bits of their operands, zero the upper 32 bits of their
//! destination, and set the overflow / carry / sign / zero flags as a 32-bit operation. Native
//! division faults on a zero divisor and on `INT_MIN / -1`: generated code must guard against
//! both.

pub(crate) mod abi;
pub(crate) mod asm;
pub(crate) mod disasm;
pub(crate) mod encode;

use strum::{Display, EnumCount, FromRepr};

#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Gpr {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    /// Assembler scratch: never allocated, clobbered freely by multi-instruction sequences.
    R12,
    /// Always holds [crate::value::TAG_MASK].
    R13,
    /// Always holds [crate::value::TAG_TYPE_NUMBER].
    R14,
    /// The call frame register.
    R15,
}

#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Fpr {
    F0 = 0,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    /// Assembler scratch.
    F8,
}

/// The width of a memory access.
#[derive(Clone, Copy, Debug, EnumCount, Eq, FromRepr, PartialEq)]
#[repr(u8)]
pub enum Width {
    B8 = 0,
    B16,
    B32,
    B64,
}

/// The size of an ALU / comparison operation.
#[derive(Clone, Copy, Debug, Eq, FromRepr, PartialEq)]
#[repr(u8)]
pub enum OpSize {
    S32 = 0,
    S64,
}

#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    /// Arithmetic (sign-propagating) shift right.
    Sar,
    /// Logical shift right.
    Shr,
}

#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum DAluOp {
    Add = 0,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum DUnaryOp {
    Sqrt = 0,
    Abs,
    Neg,
}

/// Condition codes. The integer codes test the flags set by the last integer ALU / compare /
/// test; the `D*` codes test the result of the last [Inst::DCmp].
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Cc {
    E = 0,
    NE,
    L,
    LE,
    G,
    GE,
    B,
    BE,
    A,
    AE,
    O,
    NO,
    S,
    NS,
    DEq,
    DNeOrUnordered,
    DLt,
    DGeOrUnordered,
    DLe,
    DGtOrUnordered,
    DGt,
    DLeOrUnordered,
    DGe,
    DLtOrUnordered,
    DUnordered,
    DOrdered,
}

impl Cc {
    pub fn invert(self) -> Cc {
        match self {
            Cc::E => Cc::NE,
            Cc::NE => Cc::E,
            Cc::L => Cc::GE,
            Cc::LE => Cc::G,
            Cc::G => Cc::LE,
            Cc::GE => Cc::L,
            Cc::B => Cc::AE,
            Cc::BE => Cc::A,
            Cc::A => Cc::BE,
            Cc::AE => Cc::B,
            Cc::O => Cc::NO,
            Cc::NO => Cc::O,
            Cc::S => Cc::NS,
            Cc::NS => Cc::S,
            Cc::DEq => Cc::DNeOrUnordered,
            Cc::DNeOrUnordered => Cc::DEq,
            Cc::DLt => Cc::DGeOrUnordered,
            Cc::DGeOrUnordered => Cc::DLt,
            Cc::DLe => Cc::DGtOrUnordered,
            Cc::DGtOrUnordered => Cc::DLe,
            Cc::DGt => Cc::DLeOrUnordered,
            Cc::DLeOrUnordered => Cc::DGt,
            Cc::DGe => Cc::DLtOrUnordered,
            Cc::DLtOrUnordered => Cc::DGe,
            Cc::DUnordered => Cc::DOrdered,
            Cc::DOrdered => Cc::DUnordered,
        }
    }
}

/// A memory operand: `base + index * (1 << scale) + disp`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Addr {
    pub base: Gpr,
    pub index: Option<(Gpr, u8)>,
    pub disp: i32,
}

impl Addr {
    pub fn base(base: Gpr, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    pub fn indexed(base: Gpr, index: Gpr, scale: u8, disp: i32) -> Self {
        debug_assert!(scale <= 3);
        Self {
            base,
            index: Some((index, scale)),
            disp,
        }
    }
}

/// The second operand of an ALU / compare operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand {
    Reg(Gpr),
    Imm(i32),
}

impl From<Gpr> for Operand {
    fn from(r: Gpr) -> Self {
        Operand::Reg(r)
    }
}

impl From<i32> for Operand {
    fn from(x: i32) -> Self {
        Operand::Imm(x)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Inst {
    Nop,
    Breakpoint,
    Ret,
    Mov { dst: Gpr, src: Gpr },
    /// `dst = src & 0xFFFFFFFF`.
    Zext32 { dst: Gpr, src: Gpr },
    MovImm { dst: Gpr, imm: u64 },
    Load { width: Width, signed: bool, dst: Gpr, addr: Addr },
    Store { width: Width, src: Gpr, addr: Addr },
    LoadD { dst: Fpr, addr: Addr },
    StoreD { src: Fpr, addr: Addr },
    /// Load a double from `pc + rel` where `pc` is the address of the next instruction.
    LoadDConst { dst: Fpr, rel: i32 },
    Alu { size: OpSize, op: AluOp, dst: Gpr, src: Operand },
    Neg32 { dst: Gpr },
    /// Signed 32-bit division (or remainder if `rem`). Faults on zero / overflow.
    Div32 { rem: bool, dst: Gpr, src: Gpr },
    Cmp { size: OpSize, lhs: Gpr, rhs: Operand },
    Test { size: OpSize, lhs: Gpr, rhs: Operand },
    SetCc { cc: Cc, dst: Gpr },
    Jcc { cc: Cc, rel: i32 },
    Jmp { rel: i32 },
    JmpAbs { target: u64 },
    JmpReg { src: Gpr },
    /// Jump to entry `index` of the executing code block's dense switch table `table`.
    JmpTable { table: u16, index: Gpr },
    Call { target: u64 },
    /// Record which OSR exit is about to be taken.
    SetExitIndex { index: u32 },
    /// A patchable no-op the same size as [Inst::Jmp]: firing a watchpoint overwrites it with a
    /// jump to an OSR exit.
    WatchpointLabel { id: u32 },
    DAlu { op: DAluOp, dst: Fpr, src: Fpr },
    DUnary { op: DUnaryOp, dst: Fpr, src: Fpr },
    DMov { dst: Fpr, src: Fpr },
    DCmp { lhs: Fpr, rhs: Fpr },
    CvtI32ToD { dst: Fpr, src: Gpr },
    /// Truncate a double to int32; produces `0x80000000` if the result is out of range or NaN.
    CvtTDToI32 { dst: Gpr, src: Fpr },
    MovGToD { dst: Fpr, src: Gpr },
    MovDToG { dst: Gpr, src: Fpr },
}
