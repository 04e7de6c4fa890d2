//! The product of a successful compile, and the operations the runtime performs on it after
//! installation: counting exits, repatching inline caches and calls, and firing watchpoints.

use crate::compile::{
    code_block::CodeBlock,
    codebuf::ExeCodeBuf,
    graph::{BlockIdx, CodeOrigin, Graph},
    machine::{
        Inst,
        disasm::disassemble,
        encode::{DecodeError, JMP_LEN, LOAD_STORE_DISP_OFFSET, MOVIMM_IMM_OFFSET, decode, encode},
        abi::{CELL_INLINE_STORAGE, INLINE_CAPACITY},
    },
    osr_exit::{ExitIdx, OsrExit},
    variable_event::VariableEventStream,
};
use index_vec::IndexVec;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};
use thiserror::Error;

/// The kind of an inline cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IcKind {
    GetById,
    PutById,
}

/// A patchable named property access.
#[derive(Clone, Debug)]
pub struct IcSite {
    pub kind: IcKind,
    pub ident: Arc<str>,
    pub origin: CodeOrigin,
    /// The code offset of the instruction holding the expected structure.
    structure_imm: u32,
    /// The code offset of the load or store of the property.
    access: u32,
}

/// A call site, initially linked to the virtual call thunk.
#[derive(Clone, Debug)]
pub struct CallLinkInfo {
    pub origin: CodeOrigin,
    call_off: u32,
}

/// A watchpoint site: when the watchpoint fires, the no-op at `source` is overwritten with a jump
/// to `dest`, the stub of exit `exit`.
#[derive(Clone, Copy, Debug)]
pub struct JumpReplacement {
    pub source: u32,
    pub dest: u32,
    pub exit: ExitIdx,
}

/// An exit as installed: its record, the offset of its stub, and how often it has been taken.
#[derive(Debug)]
pub struct CompiledExit {
    pub exit: OsrExit,
    pub stub_off: u32,
    count: AtomicU32,
}

impl CompiledExit {
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("No {0} site {1}")]
    NoSuchSite(&'static str, usize),
    #[error("Site {0} is not a {1:?} cache")]
    WrongKind(usize, IcKind),
    #[error("Slot {0} is not inline")]
    SlotOutOfRange(usize),
}

/// Everything [super::jit_compiler::JitCompiler] hands over to build a [CompiledCode].
pub(crate) struct CompiledParts {
    pub(crate) graph: Graph,
    pub(crate) code_block: Arc<CodeBlock>,
    pub(crate) buf: ExeCodeBuf,
    pub(crate) insts_len: usize,
    pub(crate) entry: u32,
    pub(crate) arity_entry: Option<u32>,
    pub(crate) exits: Vec<(OsrExit, u32)>,
    pub(crate) events: VariableEventStream,
    pub(crate) ic_sites: Vec<IcSite>,
    pub(crate) call_links: Vec<CallLinkInfo>,
    pub(crate) jump_replacements: Vec<JumpReplacement>,
    pub(crate) osr_entries: HashMap<BlockIdx, u32>,
    pub(crate) frame_slots: usize,
    pub(crate) exit_threshold: u32,
    pub(crate) asm_log: Option<String>,
}

pub struct CompiledCode {
    name: String,
    graph: Graph,
    code_block: Arc<CodeBlock>,
    buf: Mutex<ExeCodeBuf>,
    base: u64,
    /// The length of the instructions, excluding the trailing constant pool.
    insts_len: usize,
    entry: u32,
    arity_entry: Option<u32>,
    exits: IndexVec<ExitIdx, CompiledExit>,
    events: VariableEventStream,
    ic_sites: Vec<IcSite>,
    call_links: Vec<CallLinkInfo>,
    jump_replacements: Vec<JumpReplacement>,
    osr_entries: HashMap<BlockIdx, u32>,
    frame_slots: usize,
    exit_threshold: u32,
    asm_log: Option<String>,
}

impl CompiledCode {
    pub(crate) fn new(name: String, p: CompiledParts) -> Self {
        let base = p.buf.base();
        Self {
            name,
            graph: p.graph,
            code_block: p.code_block,
            buf: Mutex::new(p.buf),
            base,
            insts_len: p.insts_len,
            entry: p.entry,
            arity_entry: p.arity_entry,
            exits: p
                .exits
                .into_iter()
                .map(|(exit, stub_off)| CompiledExit {
                    exit,
                    stub_off,
                    count: AtomicU32::new(0),
                })
                .collect(),
            events: p.events,
            ic_sites: p.ic_sites,
            call_links: p.call_links,
            jump_replacements: p.jump_replacements,
            osr_entries: p.osr_entries,
            frame_slots: p.frame_slots,
            exit_threshold: p.exit_threshold,
            asm_log: p.asm_log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn code_block(&self) -> &Arc<CodeBlock> {
        &self.code_block
    }

    /// The address of the first byte of code.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The address callers with the right number of arguments enter at.
    pub fn entry(&self) -> u64 {
        self.base + u64::from(self.entry)
    }

    /// The address callers enter at if they may have passed too few arguments. `None` for
    /// program code, which takes no arguments.
    pub fn arity_entry(&self) -> Option<u64> {
        self.arity_entry.map(|x| self.base + u64::from(x))
    }

    /// The address at which the lower tier can jump into block `bidx`, if it is an OSR target.
    pub fn osr_entry(&self, bidx: BlockIdx) -> Option<u64> {
        self.osr_entries
            .get(&bidx)
            .map(|x| self.base + u64::from(*x))
    }

    /// How many frame slots below the frame register the code uses.
    pub fn frame_slots(&self) -> usize {
        self.frame_slots
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.insts_len as u64
    }

    /// Decode the instruction at `addr`.
    pub(crate) fn decode_at(&self, addr: u64) -> Result<(Inst, usize), DecodeError> {
        let off = (addr - self.base) as usize;
        decode(self.buf.lock().code(), off)
    }

    pub(crate) fn read_data(&self, addr: u64) -> Option<u64> {
        let off = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let buf = self.buf.lock();
        let bytes = buf.code().get(off..off + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn exits(&self) -> &IndexVec<ExitIdx, CompiledExit> {
        &self.exits
    }

    pub fn events(&self) -> &VariableEventStream {
        &self.events
    }

    /// Count a taking of exit `idx`. Returns `true` once the exits of this code have been taken
    /// often enough that it should be thrown away and recompiled.
    pub fn note_exit(&self, idx: ExitIdx) -> bool {
        let n = self.exits[idx].count.fetch_add(1, Ordering::Relaxed) + 1;
        n >= self.exit_threshold
            || self
                .exits
                .iter()
                .map(|x| u64::from(x.count()))
                .sum::<u64>()
                >= u64::from(self.exit_threshold) * 2
    }

    pub fn ic_sites(&self) -> &[IcSite] {
        &self.ic_sites
    }

    pub fn call_links(&self) -> &[CallLinkInfo] {
        &self.call_links
    }

    pub fn jump_replacements(&self) -> &[JumpReplacement] {
        &self.jump_replacements
    }

    /// Fill get-by-id cache `site` with a structure and the inline slot its property lives in.
    pub fn patch_get_by_id(
        &self,
        site: usize,
        structure: u64,
        slot: usize,
    ) -> Result<(), PatchError> {
        self.patch_ic(site, IcKind::GetById, structure, slot)
    }

    pub fn patch_put_by_id(
        &self,
        site: usize,
        structure: u64,
        slot: usize,
    ) -> Result<(), PatchError> {
        self.patch_ic(site, IcKind::PutById, structure, slot)
    }

    fn patch_ic(
        &self,
        site: usize,
        kind: IcKind,
        structure: u64,
        slot: usize,
    ) -> Result<(), PatchError> {
        let s = self
            .ic_sites
            .get(site)
            .ok_or(PatchError::NoSuchSite("inline cache", site))?;
        if s.kind != kind {
            return Err(PatchError::WrongKind(site, kind));
        }
        if slot >= INLINE_CAPACITY {
            return Err(PatchError::SlotOutOfRange(slot));
        }
        let disp = CELL_INLINE_STORAGE + (slot as i32) * 8;
        let mut buf = self.buf.lock();
        buf.patch(
            s.structure_imm as usize + MOVIMM_IMM_OFFSET,
            &structure.to_le_bytes(),
        );
        buf.patch(
            s.access as usize + LOAD_STORE_DISP_OFFSET,
            &disp.to_le_bytes(),
        );
        Ok(())
    }

    /// Repoint call site `site` directly at `target`.
    pub fn link_call(&self, site: usize, target: u64) -> Result<(), PatchError> {
        let c = self
            .call_links
            .get(site)
            .ok_or(PatchError::NoSuchSite("call", site))?;
        let mut bytes = Vec::new();
        encode(&Inst::Call { target }, &mut bytes);
        self.buf.lock().patch(c.call_off as usize, &bytes);
        Ok(())
    }

    /// A watchpoint this code relied on has fired: turn every watchpoint site into a jump to its
    /// exit. Returns how many sites were patched.
    pub fn fire_watchpoints(&self) -> usize {
        let mut buf = self.buf.lock();
        for jr in &self.jump_replacements {
            let rel = i64::from(jr.dest) - (i64::from(jr.source) + JMP_LEN as i64);
            let mut bytes = Vec::new();
            // Code is far smaller than 2GiB, so the displacement always fits.
            encode(&Inst::Jmp { rel: rel as i32 }, &mut bytes);
            buf.patch(jr.source as usize, &bytes);
        }
        self.jump_replacements.len()
    }

    /// Disassemble the code as it currently is, including any patches.
    pub fn disassemble(&self, with_addrs: bool) -> String {
        let buf = self.buf.lock();
        let code = buf.code();
        let mut s = disassemble(&code[..self.insts_len], self.base, with_addrs);
        if code.len() > self.insts_len {
            s.push_str(&format!(".data {} bytes\n", code.len() - self.insts_len));
        }
        s
    }

    /// The assembler's log of this compile, if it was kept.
    pub fn asm_log(&self) -> Option<&str> {
        self.asm_log.as_deref()
    }
}

impl fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCode")
            .field("name", &self.name)
            .field("base", &format_args!("0x{:x}", self.base))
            .field("len", &self.insts_len)
            .field("exits", &self.exits.len())
            .finish()
    }
}

impl IcSite {
    pub(crate) fn new(
        kind: IcKind,
        ident: Arc<str>,
        origin: CodeOrigin,
        structure_imm: u32,
        access: u32,
    ) -> Self {
        Self {
            kind,
            ident,
            origin,
            structure_imm,
            access,
        }
    }
}

impl CallLinkInfo {
    pub(crate) fn new(origin: CodeOrigin, call_off: u32) -> Self {
        Self { origin, call_off }
    }
}
