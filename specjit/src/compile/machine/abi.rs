//! The contract between generated code and the runtime: register roles, calling convention,
//! frame layout, the layout of runtime objects that generated code accesses inline, and the
//! addresses of runtime helpers and trampolines.

use super::{Fpr, Gpr};
use strum::{Display, EnumCount, FromRepr};

/// The call frame register.
pub(crate) const FRAME: Gpr = Gpr::R15;
/// Pinned: always holds [crate::value::TAG_TYPE_NUMBER].
pub(crate) const TAG_TYPE_NUMBER_REG: Gpr = Gpr::R14;
/// Pinned: always holds [crate::value::TAG_MASK].
pub(crate) const TAG_MASK_REG: Gpr = Gpr::R13;
pub(crate) const SCRATCH_GPR: Gpr = Gpr::R12;
pub(crate) const SCRATCH_FPR: Fpr = Fpr::F8;

pub(crate) const ARG_GPRS: [Gpr; 6] = [Gpr::R0, Gpr::R1, Gpr::R2, Gpr::R3, Gpr::R4, Gpr::R5];
pub(crate) const ARG_FPRS: [Fpr; 4] = [Fpr::F0, Fpr::F1, Fpr::F2, Fpr::F3];
pub(crate) const RET_GPR: Gpr = Gpr::R0;
pub(crate) const RET_FPR: Fpr = Fpr::F0;

/// Registers the allocator may hand out. Every one of these is clobbered by a call.
pub(crate) const ALLOCATABLE_GPRS: [Gpr; 12] = [
    Gpr::R0,
    Gpr::R1,
    Gpr::R2,
    Gpr::R3,
    Gpr::R4,
    Gpr::R5,
    Gpr::R6,
    Gpr::R7,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
];
pub(crate) const ALLOCATABLE_FPRS: [Fpr; 8] = [
    Fpr::F0,
    Fpr::F1,
    Fpr::F2,
    Fpr::F3,
    Fpr::F4,
    Fpr::F5,
    Fpr::F6,
    Fpr::F7,
];

// Call frame header, in 8-byte slots from the frame register. Arguments (`this` first) follow
// the header; locals are at negative offsets.
pub(crate) const HEADER_CALLER_FRAME: i32 = 0;
pub(crate) const HEADER_RETURN_PC: i32 = 1;
pub(crate) const HEADER_CODE_BLOCK: i32 = 2;
pub(crate) const HEADER_CALLEE: i32 = 3;
pub(crate) const HEADER_ARG_COUNT: i32 = 4;
pub(crate) const CALL_FRAME_HEADER_SIZE: i32 = 5;

// The VM context record. Its address is part of the compilation plan.
pub(crate) const VM_STACK_LIMIT: i32 = 0;
pub(crate) const VM_EXCEPTION: i32 = 8;
/// Pointer to a 256 entry table of single-character string cells.
pub(crate) const VM_SINGLE_CHAR_STRINGS: i32 = 16;
pub(crate) const VM_SIZE: usize = 24;

// Cells.
pub(crate) const CELL_STRUCTURE: i32 = 0;
/// Butterfly (arrays), character storage (strings), or element vector (typed arrays).
pub(crate) const CELL_STORAGE: i32 = 8;
/// Length of strings and typed arrays; host function index for functions.
pub(crate) const CELL_LENGTH: i32 = 16;
pub(crate) const CELL_INLINE_STORAGE: i32 = 24;
pub(crate) const INLINE_CAPACITY: usize = 8;
pub(crate) const CELL_SIZE: usize = CELL_INLINE_STORAGE as usize + INLINE_CAPACITY * 8;

// Structures.
pub(crate) const STRUCTURE_ID: i32 = 0;
pub(crate) const STRUCTURE_CELL_TYPE: i32 = 4;
pub(crate) const STRUCTURE_INDEXING_TYPE: i32 = 5;
pub(crate) const STRUCTURE_TYPE_FLAGS: i32 = 6;
pub(crate) const STRUCTURE_PROTOTYPE: i32 = 8;
pub(crate) const STRUCTURE_SIZE: usize = 16;

// Butterflies: the header lives immediately before the element storage.
pub(crate) const BUTTERFLY_PUBLIC_LENGTH: i32 = -8;
pub(crate) const BUTTERFLY_VECTOR_LENGTH: i32 = -4;

#[derive(Clone, Copy, Debug, Eq, FromRepr, PartialEq)]
#[repr(u8)]
pub(crate) enum CellType {
    Object = 1,
    String,
    Function,
    Int32Array,
    Float64Array,
}

pub(crate) const INDEXING_NONE: u8 = 0;
pub(crate) const INDEXING_CONTIGUOUS: u8 = 1;
pub(crate) const INDEXING_DOUBLE: u8 = 2;
pub(crate) const INDEXING_SHAPE_MASK: u8 = 0x0F;
pub(crate) const INDEXING_IS_ARRAY: u8 = 0x10;

pub(crate) const TYPE_FLAG_MASQUERADES_AS_UNDEFINED: u8 = 0x01;
/// Indexed accesses on such objects must always go through the generic path.
pub(crate) const TYPE_FLAG_INTERCEPTS_INDEXING: u8 = 0x02;
pub(crate) const TYPE_FLAG_IMPLEMENTS_DEFAULT_HAS_INSTANCE: u8 = 0x04;

/// Runtime helpers callable from generated code. Arguments are passed in [ARG_GPRS] /
/// [ARG_FPRS] in order; results are returned in [RET_GPR] / [RET_FPR].
#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, Hash, PartialEq)]
#[repr(u8)]
pub(crate) enum HelperId {
    /// `(lhs: JS, rhs: JS) -> JS`.
    ValueAdd,
    /// `(lhs: JS, rhs: JS, op: GenericArithOp) -> JS`.
    ValueArith,
    /// `(F0, F1) -> F0`.
    FMod,
    /// `(F0) -> i32`: full modulo-2^32 truncation.
    ToInt32,
    /// `(JS) -> i32`.
    ToInt32Generic,
    /// `(lhs: JS, rhs: JS, op: GenericCompareOp) -> bool`.
    CompareGeneric,
    /// `(JS) -> bool`.
    ToBoolean,
    /// `(cell) -> indexing type`: convert the object's storage to contiguous if possible.
    EnsureContiguous,
    /// `(cell) -> indexing type`: convert the object's storage to unboxed doubles if possible.
    EnsureDouble,
    /// `(base: cell, ident) -> JS`.
    GetById,
    /// `(base: JS, ident) -> JS`.
    GetByIdGeneric,
    /// `(base: JS, ident, value: JS) -> ()`.
    PutById,
    /// `(table, value: JS) -> code address`.
    SwitchImm,
    /// `(table, value: JS) -> code address`.
    SwitchString,
    /// `(char code) -> string cell`.
    SingleCharacterString,
    /// `(frame) -> ()`: always throws.
    StackOverflow,
    /// `(frame) -> new frame, or 0 on failure`.
    ArityFixup,
    /// `(frame) -> handler address`.
    LookupExceptionHandler,
    /// `(frame) -> handler address`.
    LookupExceptionHandlerFromCaller,
    /// `(value: JS) -> ()`: always throws.
    Throw,
}

impl HelperId {
    /// Can this helper leave an exception pending in [VM_EXCEPTION]?
    pub(crate) fn may_throw(self) -> bool {
        matches!(
            self,
            HelperId::GetById
                | HelperId::GetByIdGeneric
                | HelperId::PutById
                | HelperId::StackOverflow
                | HelperId::Throw
        )
    }
}

/// Thunks: shared, out-of-line code sequences provided by the runtime.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub(crate) enum ThunkId {
    /// The shared OSR exit trampoline. The index of the exit being taken has been stored with
    /// [super::Inst::SetExitIndex].
    OsrExit,
    /// Reached once an exception handler has been found.
    Throw,
    /// `(callee: JS, this: JS, args...) -> JS`: calls are linked to this thunk until the inline
    /// caching subsystem repatches them.
    VirtualCall,
}

const HELPER_BASE: u64 = 0x7F00_0000_0000;
const HELPER_STRIDE: u64 = 0x10;
const THUNK_BASE: u64 = 0x7F10_0000_0000;

pub(crate) fn helper_address(h: HelperId) -> u64 {
    HELPER_BASE + u64::from(h as u8) * HELPER_STRIDE
}

pub(crate) fn thunk_address(t: ThunkId) -> u64 {
    THUNK_BASE
        + match t {
            ThunkId::OsrExit => 0,
            ThunkId::Throw => 0x10,
            ThunkId::VirtualCall => 0x20,
        }
}

pub(crate) fn helper_at(addr: u64) -> Option<HelperId> {
    if addr < HELPER_BASE || (addr - HELPER_BASE) % HELPER_STRIDE != 0 {
        return None;
    }
    u8::try_from((addr - HELPER_BASE) / HELPER_STRIDE)
        .ok()
        .and_then(HelperId::from_repr)
}

pub(crate) fn thunk_at(addr: u64) -> Option<ThunkId> {
    [ThunkId::OsrExit, ThunkId::Throw, ThunkId::VirtualCall]
        .into_iter()
        .find(|t| thunk_address(*t) == addr)
}

/// Give a human readable name to a helper or thunk address, if it is one.
pub(crate) fn symbolize(addr: u64) -> Option<String> {
    helper_at(addr)
        .map(|h| format!("helper:{h}"))
        .or_else(|| thunk_at(addr).map(|t| format!("thunk:{t}")))
}

#[derive(Clone, Copy, Debug, Eq, FromRepr, PartialEq)]
#[repr(u8)]
pub(crate) enum GenericArithOp {
    Sub = 0,
    Mul,
    Div,
    Mod,
    /// The right-hand side is ignored.
    Negate,
}

#[derive(Clone, Copy, Debug, Eq, FromRepr, PartialEq)]
#[repr(u8)]
pub(crate) enum GenericCompareOp {
    Less = 0,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    StrictEq,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn addresses_round_trip() {
        for i in 0..HelperId::COUNT {
            let h = HelperId::from_repr(u8::try_from(i).unwrap()).unwrap();
            assert_eq!(helper_at(helper_address(h)), Some(h));
            assert!(thunk_at(helper_address(h)).is_none());
        }
        assert_eq!(thunk_at(thunk_address(ThunkId::Throw)), Some(ThunkId::Throw));
        assert_eq!(helper_at(helper_address(HelperId::ValueAdd) + 1), None);
        assert_eq!(
            symbolize(helper_address(HelperId::FMod)).as_deref(),
            Some("helper:FMod")
        );
    }
}
