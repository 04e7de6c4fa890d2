//! Textual rendering of SJM64 instructions.

use super::{Addr, Inst, OpSize, Operand, Width, abi, encode::decode};
use std::fmt::{self, Display, Formatter, Write};

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.base)?;
        if let Some((idx, scale)) = self.index {
            write!(f, "+{idx}*{}", 1 << scale)?;
        }
        match self.disp {
            0 => (),
            x if x < 0 => write!(f, "-0x{:x}", -i64::from(x))?,
            x => write!(f, "+0x{x:x}")?,
        }
        write!(f, "]")
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(x) if *x < 0 => write!(f, "-0x{:x}", -i64::from(*x)),
            Operand::Imm(x) => write!(f, "0x{x:x}"),
        }
    }
}

fn size_suffix(s: OpSize) -> &'static str {
    match s {
        OpSize::S32 => "32",
        OpSize::S64 => "64",
    }
}

fn width_suffix(w: Width) -> &'static str {
    match w {
        Width::B8 => "8",
        Width::B16 => "16",
        Width::B32 => "32",
        Width::B64 => "64",
    }
}

fn fmt_abs(target: u64) -> String {
    abi::symbolize(target).unwrap_or_else(|| format!("0x{target:x}"))
}

fn fmt_rel(rel: i32) -> String {
    if rel < 0 {
        format!("-0x{:x}", -i64::from(rel))
    } else {
        format!("+0x{rel:x}")
    }
}

impl Inst {
    /// Render this instruction, using `target` (if `Some`) in place of the instruction's own
    /// branch / call target. The assembler uses this to print labels before they are resolved.
    pub(crate) fn render(&self, target: Option<&str>) -> String {
        let tgt = |s: String| target.map(|x| x.to_owned()).unwrap_or(s);
        match *self {
            Inst::Nop => "nop".to_owned(),
            Inst::Breakpoint => "brk".to_owned(),
            Inst::Ret => "ret".to_owned(),
            Inst::Mov { dst, src } => format!("mov {dst}, {src}"),
            Inst::Zext32 { dst, src } => format!("zext32 {dst}, {src}"),
            Inst::MovImm { dst, imm } => format!("mov {dst}, {}", tgt(format!("0x{imm:x}"))),
            Inst::Load {
                width,
                signed,
                dst,
                addr,
            } => format!(
                "load{}{} {dst}, {addr}",
                width_suffix(width),
                if signed { "s" } else { "" }
            ),
            Inst::Store { width, src, addr } => {
                format!("store{} {addr}, {src}", width_suffix(width))
            }
            Inst::LoadD { dst, addr } => format!("loadd {dst}, {addr}"),
            Inst::StoreD { src, addr } => format!("stored {addr}, {src}"),
            Inst::LoadDConst { dst, rel } => format!("loaddc {dst}, {}", tgt(fmt_rel(rel))),
            Inst::Alu { size, op, dst, src } => format!("{op}{} {dst}, {src}", size_suffix(size)),
            Inst::Neg32 { dst } => format!("neg32 {dst}"),
            Inst::Div32 { rem, dst, src } => {
                format!("{}32 {dst}, {src}", if rem { "rem" } else { "div" })
            }
            Inst::Cmp { size, lhs, rhs } => format!("cmp{} {lhs}, {rhs}", size_suffix(size)),
            Inst::Test { size, lhs, rhs } => format!("test{} {lhs}, {rhs}", size_suffix(size)),
            Inst::SetCc { cc, dst } => format!("set{cc} {dst}"),
            Inst::Jcc { cc, rel } => format!("j{cc} {}", tgt(fmt_rel(rel))),
            Inst::Jmp { rel } => format!("jmp {}", tgt(fmt_rel(rel))),
            Inst::JmpAbs { target: t } => format!("jmpabs {}", tgt(fmt_abs(t))),
            Inst::JmpReg { src } => format!("jmp {src}"),
            Inst::JmpTable { table, index } => format!("jmptable {table}, {index}"),
            Inst::Call { target: t } => format!("call {}", tgt(fmt_abs(t))),
            Inst::SetExitIndex { index } => format!("setexit {index}"),
            Inst::WatchpointLabel { id } => format!("watchpoint {id}"),
            Inst::DAlu { op, dst, src } => format!("{op}d {dst}, {src}"),
            Inst::DUnary { op, dst, src } => format!("{op}d {dst}, {src}"),
            Inst::DMov { dst, src } => format!("movd {dst}, {src}"),
            Inst::DCmp { lhs, rhs } => format!("cmpd {lhs}, {rhs}"),
            Inst::CvtI32ToD { dst, src } => format!("cvti2d {dst}, {src}"),
            Inst::CvtTDToI32 { dst, src } => format!("cvttd2i {dst}, {src}"),
            Inst::MovGToD { dst, src } => format!("movgd {dst}, {src}"),
            Inst::MovDToG { dst, src } => format!("movdg {dst}, {src}"),
        }
    }
}

impl Display for Inst {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(None))
    }
}

/// Disassemble `code`, which is mapped at address `base`, one instruction per line. Bytes which
/// cannot be decoded (e.g. a trailing constant pool) are rendered as a `.data` line.
pub(crate) fn disassemble(code: &[u8], base: u64, with_addrs: bool) -> String {
    let mut out = String::new();
    let mut off = 0;
    while off < code.len() {
        let addr = base + off as u64;
        match decode(code, off) {
            Ok((inst, len)) => {
                if with_addrs {
                    write!(out, "{addr:016x} {off:05x}: ").ok();
                }
                let s = match inst {
                    Inst::Jcc { rel, .. } | Inst::Jmp { rel } | Inst::LoadDConst { rel, .. } => {
                        let t = (addr + len as u64).wrapping_add_signed(i64::from(rel));
                        inst.render(Some(&format!("0x{:x}", t - base)))
                    }
                    _ => inst.render(None),
                };
                out.push_str(&s);
                out.push('\n');
                off += len;
            }
            Err(_) => {
                if with_addrs {
                    write!(out, "{addr:016x} {off:05x}: ").ok();
                }
                writeln!(out, ".data {} bytes", code.len() - off).ok();
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::machine::{AluOp, Cc, Gpr, encode::encode};

    #[test]
    fn render() {
        let i = Inst::Alu {
            size: OpSize::S32,
            op: AluOp::Add,
            dst: Gpr::R1,
            src: Operand::Reg(Gpr::R2),
        };
        assert_eq!(i.to_string(), "add32 r1, r2");
        let i = Inst::Load {
            width: Width::B32,
            signed: true,
            dst: Gpr::R0,
            addr: Addr::indexed(Gpr::R1, Gpr::R2, 2, -8),
        };
        assert_eq!(i.to_string(), "load32s r0, [r1+r2*4-0x8]");
        let i = Inst::Jcc { cc: Cc::O, rel: 0 };
        assert_eq!(i.render(Some("l3")), "jo l3");
        let i = Inst::Call {
            target: abi::helper_address(abi::HelperId::ValueAdd),
        };
        assert_eq!(i.to_string(), "call helper:ValueAdd");
    }

    #[test]
    fn disassemble_branches() {
        let mut buf = Vec::new();
        encode(&Inst::Jmp { rel: 1 }, &mut buf);
        encode(&Inst::Ret, &mut buf);
        encode(&Inst::Ret, &mut buf);
        buf.push(0xEE);
        assert_eq!(
            disassemble(&buf, 0x1000, false),
            "jmp 0x6\nret\nret\n.data 1 bytes\n"
        );
    }
}
