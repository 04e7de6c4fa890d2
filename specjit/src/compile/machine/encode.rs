//! Byte encoding / decoding of SJM64 instructions.
//!
//! Every instruction starts with a one byte opcode. Multi-byte fields are little endian. Memory
//! operands are encoded as `base, index, scale, disp32` with an index of `0xFF` meaning "no
//! index". ALU / compare operands are a tag byte (0 = register, 1 = imm32) followed by the
//! register or immediate.

use super::{AluOp, Addr, Cc, DAluOp, DUnaryOp, Fpr, Gpr, Inst, OpSize, Operand, Width};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

const OP_NOP: u8 = 0x00;
const OP_BREAKPOINT: u8 = 0x01;
const OP_RET: u8 = 0x02;
const OP_MOV: u8 = 0x03;
const OP_ZEXT32: u8 = 0x04;
const OP_MOVIMM: u8 = 0x05;
const OP_LOAD: u8 = 0x06;
const OP_STORE: u8 = 0x07;
const OP_LOADD: u8 = 0x08;
const OP_STORED: u8 = 0x09;
const OP_LOADDCONST: u8 = 0x0A;
const OP_ALU: u8 = 0x0B;
const OP_NEG32: u8 = 0x0C;
const OP_DIV32: u8 = 0x0D;
const OP_CMP: u8 = 0x0E;
const OP_TEST: u8 = 0x0F;
const OP_SETCC: u8 = 0x10;
const OP_JCC: u8 = 0x11;
const OP_JMP: u8 = 0x12;
const OP_JMPABS: u8 = 0x13;
const OP_JMPREG: u8 = 0x14;
const OP_JMPTABLE: u8 = 0x15;
const OP_CALL: u8 = 0x16;
const OP_SETEXITINDEX: u8 = 0x17;
const OP_WATCHPOINT: u8 = 0x18;
const OP_DALU: u8 = 0x19;
const OP_DUNARY: u8 = 0x1A;
const OP_DMOV: u8 = 0x1B;
const OP_DCMP: u8 = 0x1C;
const OP_CVTI32TOD: u8 = 0x1D;
const OP_CVTTDTOI32: u8 = 0x1E;
const OP_MOVGTOD: u8 = 0x1F;
const OP_MOVDTOG: u8 = 0x20;

const NO_INDEX: u8 = 0xFF;

/// The offset of the 64-bit immediate within a [Inst::MovImm].
pub(crate) const MOVIMM_IMM_OFFSET: usize = 2;
/// The offset of the 32-bit displacement within a [Inst::Load] / [Inst::Store].
pub(crate) const LOAD_STORE_DISP_OFFSET: usize = 6;
/// The size in bytes of a [Inst::Jmp]: a [Inst::WatchpointLabel] must be exactly this big.
pub(crate) const JMP_LEN: usize = 5;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Truncated instruction at offset {0}")]
    Truncated(usize),
    #[error("Invalid opcode 0x{0:02x} at offset {1}")]
    InvalidOpcode(u8, usize),
    #[error("Invalid operand in instruction at offset {0}")]
    InvalidOperand(usize),
}

/// Append the encoding of `inst` to `out`.
pub(crate) fn encode(inst: &Inst, out: &mut Vec<u8>) {
    match *inst {
        Inst::Nop => out.push(OP_NOP),
        Inst::Breakpoint => out.push(OP_BREAKPOINT),
        Inst::Ret => out.push(OP_RET),
        Inst::Mov { dst, src } => out.extend_from_slice(&[OP_MOV, dst as u8, src as u8]),
        Inst::Zext32 { dst, src } => out.extend_from_slice(&[OP_ZEXT32, dst as u8, src as u8]),
        Inst::MovImm { dst, imm } => {
            out.extend_from_slice(&[OP_MOVIMM, dst as u8]);
            put_u64(out, imm);
        }
        Inst::Load {
            width,
            signed,
            dst,
            addr,
        } => {
            out.extend_from_slice(&[OP_LOAD, width as u8 | (u8::from(signed) << 4), dst as u8]);
            put_addr(out, &addr);
        }
        Inst::Store { width, src, addr } => {
            out.extend_from_slice(&[OP_STORE, width as u8, src as u8]);
            put_addr(out, &addr);
        }
        Inst::LoadD { dst, addr } => {
            out.extend_from_slice(&[OP_LOADD, dst as u8]);
            put_addr(out, &addr);
        }
        Inst::StoreD { src, addr } => {
            out.extend_from_slice(&[OP_STORED, src as u8]);
            put_addr(out, &addr);
        }
        Inst::LoadDConst { dst, rel } => {
            out.extend_from_slice(&[OP_LOADDCONST, dst as u8]);
            put_i32(out, rel);
        }
        Inst::Alu { size, op, dst, src } => {
            out.extend_from_slice(&[OP_ALU, size as u8, op as u8, dst as u8]);
            put_operand(out, src);
        }
        Inst::Neg32 { dst } => out.extend_from_slice(&[OP_NEG32, dst as u8]),
        Inst::Div32 { rem, dst, src } => {
            out.extend_from_slice(&[OP_DIV32, u8::from(rem), dst as u8, src as u8])
        }
        Inst::Cmp { size, lhs, rhs } => {
            out.extend_from_slice(&[OP_CMP, size as u8, lhs as u8]);
            put_operand(out, rhs);
        }
        Inst::Test { size, lhs, rhs } => {
            out.extend_from_slice(&[OP_TEST, size as u8, lhs as u8]);
            put_operand(out, rhs);
        }
        Inst::SetCc { cc, dst } => out.extend_from_slice(&[OP_SETCC, cc as u8, dst as u8]),
        Inst::Jcc { cc, rel } => {
            out.extend_from_slice(&[OP_JCC, cc as u8]);
            put_i32(out, rel);
        }
        Inst::Jmp { rel } => {
            out.push(OP_JMP);
            put_i32(out, rel);
        }
        Inst::JmpAbs { target } => {
            out.push(OP_JMPABS);
            put_u64(out, target);
        }
        Inst::JmpReg { src } => out.extend_from_slice(&[OP_JMPREG, src as u8]),
        Inst::JmpTable { table, index } => {
            out.push(OP_JMPTABLE);
            let mut b = [0; 2];
            LittleEndian::write_u16(&mut b, table);
            out.extend_from_slice(&b);
            out.push(index as u8);
        }
        Inst::Call { target } => {
            out.push(OP_CALL);
            put_u64(out, target);
        }
        Inst::SetExitIndex { index } => {
            out.push(OP_SETEXITINDEX);
            put_u32(out, index);
        }
        Inst::WatchpointLabel { id } => {
            out.push(OP_WATCHPOINT);
            put_u32(out, id);
        }
        Inst::DAlu { op, dst, src } => {
            out.extend_from_slice(&[OP_DALU, op as u8, dst as u8, src as u8])
        }
        Inst::DUnary { op, dst, src } => {
            out.extend_from_slice(&[OP_DUNARY, op as u8, dst as u8, src as u8])
        }
        Inst::DMov { dst, src } => out.extend_from_slice(&[OP_DMOV, dst as u8, src as u8]),
        Inst::DCmp { lhs, rhs } => out.extend_from_slice(&[OP_DCMP, lhs as u8, rhs as u8]),
        Inst::CvtI32ToD { dst, src } => {
            out.extend_from_slice(&[OP_CVTI32TOD, dst as u8, src as u8])
        }
        Inst::CvtTDToI32 { dst, src } => {
            out.extend_from_slice(&[OP_CVTTDTOI32, dst as u8, src as u8])
        }
        Inst::MovGToD { dst, src } => out.extend_from_slice(&[OP_MOVGTOD, dst as u8, src as u8]),
        Inst::MovDToG { dst, src } => out.extend_from_slice(&[OP_MOVDTOG, dst as u8, src as u8]),
    }
}

/// If `inst` contains a pc-relative 32-bit displacement, return the offset of that field within
/// the encoded instruction.
pub(crate) fn rel32_field(inst: &Inst) -> Option<usize> {
    match inst {
        Inst::Jmp { .. } => Some(1),
        Inst::Jcc { .. } | Inst::LoadDConst { .. } => Some(2),
        _ => None,
    }
}

/// If `inst` contains a patchable absolute 64-bit address, return the offset of that field within
/// the encoded instruction.
pub(crate) fn abs64_field(inst: &Inst) -> Option<usize> {
    match inst {
        Inst::JmpAbs { .. } | Inst::Call { .. } => Some(1),
        Inst::MovImm { .. } => Some(MOVIMM_IMM_OFFSET),
        _ => None,
    }
}

/// Decode the instruction starting at `buf[off]`, returning the instruction and its length.
pub(crate) fn decode(buf: &[u8], off: usize) -> Result<(Inst, usize), DecodeError> {
    let mut r = Reader { buf, start: off, off };
    let opc = r.u8()?;
    let inst = match opc {
        OP_NOP => Inst::Nop,
        OP_BREAKPOINT => Inst::Breakpoint,
        OP_RET => Inst::Ret,
        OP_MOV => Inst::Mov {
            dst: r.gpr()?,
            src: r.gpr()?,
        },
        OP_ZEXT32 => Inst::Zext32 {
            dst: r.gpr()?,
            src: r.gpr()?,
        },
        OP_MOVIMM => Inst::MovImm {
            dst: r.gpr()?,
            imm: r.u64()?,
        },
        OP_LOAD => {
            let b = r.u8()?;
            let width = Width::from_repr(b & 0xF).ok_or(DecodeError::InvalidOperand(off))?;
            Inst::Load {
                width,
                signed: b & 0x10 != 0,
                dst: r.gpr()?,
                addr: r.addr()?,
            }
        }
        OP_STORE => Inst::Store {
            width: Width::from_repr(r.u8()?).ok_or(DecodeError::InvalidOperand(off))?,
            src: r.gpr()?,
            addr: r.addr()?,
        },
        OP_LOADD => Inst::LoadD {
            dst: r.fpr()?,
            addr: r.addr()?,
        },
        OP_STORED => Inst::StoreD {
            src: r.fpr()?,
            addr: r.addr()?,
        },
        OP_LOADDCONST => Inst::LoadDConst {
            dst: r.fpr()?,
            rel: r.i32()?,
        },
        OP_ALU => Inst::Alu {
            size: r.size()?,
            op: AluOp::from_repr(r.u8()?).ok_or(DecodeError::InvalidOperand(off))?,
            dst: r.gpr()?,
            src: r.operand()?,
        },
        OP_NEG32 => Inst::Neg32 { dst: r.gpr()? },
        OP_DIV32 => Inst::Div32 {
            rem: r.u8()? != 0,
            dst: r.gpr()?,
            src: r.gpr()?,
        },
        OP_CMP => Inst::Cmp {
            size: r.size()?,
            lhs: r.gpr()?,
            rhs: r.operand()?,
        },
        OP_TEST => Inst::Test {
            size: r.size()?,
            lhs: r.gpr()?,
            rhs: r.operand()?,
        },
        OP_SETCC => Inst::SetCc {
            cc: r.cc()?,
            dst: r.gpr()?,
        },
        OP_JCC => Inst::Jcc {
            cc: r.cc()?,
            rel: r.i32()?,
        },
        OP_JMP => Inst::Jmp { rel: r.i32()? },
        OP_JMPABS => Inst::JmpAbs { target: r.u64()? },
        OP_JMPREG => Inst::JmpReg { src: r.gpr()? },
        OP_JMPTABLE => {
            let lo = r.u8()?;
            let hi = r.u8()?;
            Inst::JmpTable {
                table: u16::from_le_bytes([lo, hi]),
                index: r.gpr()?,
            }
        }
        OP_CALL => Inst::Call { target: r.u64()? },
        OP_SETEXITINDEX => Inst::SetExitIndex { index: r.u32()? },
        OP_WATCHPOINT => Inst::WatchpointLabel { id: r.u32()? },
        OP_DALU => Inst::DAlu {
            op: DAluOp::from_repr(r.u8()?).ok_or(DecodeError::InvalidOperand(off))?,
            dst: r.fpr()?,
            src: r.fpr()?,
        },
        OP_DUNARY => Inst::DUnary {
            op: DUnaryOp::from_repr(r.u8()?).ok_or(DecodeError::InvalidOperand(off))?,
            dst: r.fpr()?,
            src: r.fpr()?,
        },
        OP_DMOV => Inst::DMov {
            dst: r.fpr()?,
            src: r.fpr()?,
        },
        OP_DCMP => Inst::DCmp {
            lhs: r.fpr()?,
            rhs: r.fpr()?,
        },
        OP_CVTI32TOD => Inst::CvtI32ToD {
            dst: r.fpr()?,
            src: r.gpr()?,
        },
        OP_CVTTDTOI32 => Inst::CvtTDToI32 {
            dst: r.gpr()?,
            src: r.fpr()?,
        },
        OP_MOVGTOD => Inst::MovGToD {
            dst: r.fpr()?,
            src: r.gpr()?,
        },
        OP_MOVDTOG => Inst::MovDToG {
            dst: r.gpr()?,
            src: r.fpr()?,
        },
        x => return Err(DecodeError::InvalidOpcode(x, off)),
    };
    Ok((inst, r.off - off))
}

fn put_i32(out: &mut Vec<u8>, x: i32) {
    let mut b = [0; 4];
    LittleEndian::write_i32(&mut b, x);
    out.extend_from_slice(&b);
}

fn put_u32(out: &mut Vec<u8>, x: u32) {
    let mut b = [0; 4];
    LittleEndian::write_u32(&mut b, x);
    out.extend_from_slice(&b);
}

fn put_u64(out: &mut Vec<u8>, x: u64) {
    let mut b = [0; 8];
    LittleEndian::write_u64(&mut b, x);
    out.extend_from_slice(&b);
}

fn put_addr(out: &mut Vec<u8>, addr: &Addr) {
    match addr.index {
        Some((idx, scale)) => out.extend_from_slice(&[addr.base as u8, idx as u8, scale]),
        None => out.extend_from_slice(&[addr.base as u8, NO_INDEX, 0]),
    }
    put_i32(out, addr.disp);
}

fn put_operand(out: &mut Vec<u8>, op: Operand) {
    match op {
        Operand::Reg(r) => out.extend_from_slice(&[0, r as u8]),
        Operand::Imm(x) => {
            out.push(1);
            put_i32(out, x);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    /// The offset of the instruction being decoded.
    start: usize,
    off: usize,
}

impl Reader<'_> {
    fn bytes(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        if self.off + n > self.buf.len() {
            return Err(DecodeError::Truncated(self.start));
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(LittleEndian::read_i32(self.bytes(4)?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }

    fn gpr(&mut self) -> Result<Gpr, DecodeError> {
        let start = self.start;
        Gpr::from_repr(self.u8()?).ok_or(DecodeError::InvalidOperand(start))
    }

    fn fpr(&mut self) -> Result<Fpr, DecodeError> {
        let start = self.start;
        Fpr::from_repr(self.u8()?).ok_or(DecodeError::InvalidOperand(start))
    }

    fn cc(&mut self) -> Result<Cc, DecodeError> {
        let start = self.start;
        Cc::from_repr(self.u8()?).ok_or(DecodeError::InvalidOperand(start))
    }

    fn size(&mut self) -> Result<OpSize, DecodeError> {
        let start = self.start;
        OpSize::from_repr(self.u8()?).ok_or(DecodeError::InvalidOperand(start))
    }

    fn addr(&mut self) -> Result<Addr, DecodeError> {
        let base = self.gpr()?;
        let idx = self.u8()?;
        let scale = self.u8()?;
        let disp = self.i32()?;
        let index = if idx == NO_INDEX {
            None
        } else {
            let idx = Gpr::from_repr(idx).ok_or(DecodeError::InvalidOperand(self.start))?;
            if scale > 3 {
                return Err(DecodeError::InvalidOperand(self.start));
            }
            Some((idx, scale))
        };
        Ok(Addr { base, index, disp })
    }

    fn operand(&mut self) -> Result<Operand, DecodeError> {
        match self.u8()? {
            0 => Ok(Operand::Reg(self.gpr()?)),
            1 => Ok(Operand::Imm(self.i32()?)),
            _ => Err(DecodeError::InvalidOperand(self.start)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn enc(inst: Inst) -> Vec<u8> {
        let mut v = Vec::new();
        encode(&inst, &mut v);
        v
    }

    #[test]
    fn patchable_layouts() {
        let b = enc(Inst::Jmp { rel: 0x01020304 });
        assert_eq!(b.len(), JMP_LEN);
        assert_eq!(&b[rel32_field(&Inst::Jmp { rel: 0 }).unwrap()..], &[4, 3, 2, 1]);
        assert_eq!(enc(Inst::WatchpointLabel { id: 7 }).len(), JMP_LEN);

        let ld = Inst::Load {
            width: Width::B64,
            signed: false,
            dst: Gpr::R1,
            addr: Addr::base(Gpr::R2, 0x10),
        };
        let b = enc(ld);
        assert_eq!(
            LittleEndian::read_i32(&b[LOAD_STORE_DISP_OFFSET..]),
            0x10
        );
        let st = Inst::Store {
            width: Width::B64,
            src: Gpr::R1,
            addr: Addr::base(Gpr::R2, -8),
        };
        let b = enc(st);
        assert_eq!(LittleEndian::read_i32(&b[LOAD_STORE_DISP_OFFSET..]), -8);

        let mi = Inst::MovImm {
            dst: Gpr::R3,
            imm: 0xdead_beef,
        };
        let b = enc(mi);
        assert_eq!(LittleEndian::read_u64(&b[MOVIMM_IMM_OFFSET..]), 0xdead_beef);
    }

    #[test]
    fn decode_matches_encode() {
        let insts = [
            Inst::Alu {
                size: OpSize::S32,
                op: AluOp::Add,
                dst: Gpr::R0,
                src: Operand::Imm(-5),
            },
            Inst::Load {
                width: Width::B16,
                signed: true,
                dst: Gpr::R4,
                addr: Addr::indexed(Gpr::R1, Gpr::R2, 1, 24),
            },
            Inst::JmpTable {
                table: 300,
                index: Gpr::R9,
            },
            Inst::Jcc {
                cc: Cc::DGeOrUnordered,
                rel: -6,
            },
            Inst::CvtTDToI32 {
                dst: Gpr::R11,
                src: Fpr::F8,
            },
        ];
        let mut buf = Vec::new();
        for i in &insts {
            encode(i, &mut buf);
        }
        let mut off = 0;
        for i in &insts {
            let (d, len) = decode(&buf, off).unwrap();
            assert_eq!(&d, i);
            off += len;
        }
        assert_eq!(off, buf.len());
    }

    #[test]
    fn decode_errors() {
        assert_eq!(decode(&[0xEE], 0), Err(DecodeError::InvalidOpcode(0xEE, 0)));
        assert_eq!(decode(&[OP_JMP, 0, 0], 0), Err(DecodeError::Truncated(0)));
        assert_eq!(
            decode(&[OP_MOV, 0, 99], 0),
            Err(DecodeError::InvalidOperand(0))
        );
    }
}
