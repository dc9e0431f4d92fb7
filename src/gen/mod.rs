//! Code generator
//!
//! One [`Generator`] per build owns the code buffer, the symbol and patch
//! tables, and the resolved target. Lowering walks the AST once per
//! top-level statement; forward references (calls, labels, string
//! addresses, header fields) are recorded as patch sites and resolved in
//! the footer passes.
//!
//! The two ISA backends sit behind the `Arch` tag: every capability
//! method here matches on it and forwards to `amd64::codegen` or
//! `arm64::codegen`, passing the generator explicitly.

pub mod buffer;
pub mod builtins;
pub mod expr;
pub mod frame;
pub mod labels;
pub mod stmt;
pub mod strings;

use std::collections::HashMap;

use crate::ast::{self, CallLang, Expr, Stmt};
use crate::diag::{n_error, Diag};
use crate::prefs::{Arch, Os, Preferences};
use crate::types::{TypeId, TypeTable};
use crate::{amd64, arm64, elf, macho, pe};
use crate::{GenError, Result};

use buffer::CodeBuffer;
use frame::Frame;
use labels::{LabelId, LabelTable, PatchKind};
use strings::{RelocKind, StringPool};

/// Architecture-neutral registers the lowerer works with. `R0` is the
/// primary integer result register, `R1` the secondary (pair returns).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
}

/// Architecture-neutral float registers; `F0` carries float results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FReg {
    F0,
    F1,
}

/// Comparison conditions for `cjmp` and `cset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cond {
    pub fn negate(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ge => Cond::Lt,
        }
    }
}

/// Two-operand integer primitives. Operate on `(R0, R1)`, result in
/// `R0`; `R2` may be clobbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Argument classification for the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    Int,
    Float,
}

/// A call displacement waiting for its callee address.
#[derive(Debug, Clone)]
pub struct CallPatch {
    pub pos: usize,
    pub name: String,
    pub kind: PatchKind,
}

/// A call site referencing an external symbol, resolved by the linker.
#[derive(Debug, Clone)]
pub struct ExternCall {
    pub pos: usize,
    pub name: String,
}

/// A deferred block, guarded by a one-byte flag variable.
#[derive(Debug, Clone)]
pub struct DeferEntry {
    pub guard: String,
    pub stmts: Vec<Stmt>,
}

pub struct Generator<'a> {
    pub prefs: &'a Preferences,
    pub arch: Arch,
    pub os: Os,
    pub table: &'a mut TypeTable,
    pub buf: CodeBuffer,
    pub diag: Diag,
    pub strings: StringPool,
    pub labels: LabelTable,
    pub frame: Frame,

    /// Fully-qualified function name -> entry offset in the buffer.
    pub fn_addr: HashMap<String, usize>,
    pub main_fn_addr: Option<usize>,
    pub call_patches: Vec<CallPatch>,
    pub extern_calls: Vec<ExternCall>,
    /// Absolute references the relocatable object must carry:
    /// (immediate offset, target offset in text).
    pub abs_relocs: Vec<(usize, usize)>,
    pub builtins: builtins::Builtins,
    /// Eagerly computed enum values: enum name -> field -> value.
    pub enum_vals: HashMap<String, HashMap<String, i64>>,

    // Per-function state, reset by `fn_decl`.
    pub fn_name: String,
    pub fn_ret_type: TypeId,
    pub ret_label: LabelId,
    pub defers: Vec<DeferEntry>,

    /// Emitting a relocatable object instead of an executable image.
    pub link_object: bool,
    /// File offset where the text section starts.
    pub code_start: usize,
    /// Load address of file offset zero.
    pub base_addr: u64,
    /// Extra distance between file offsets and virtual addresses (PE).
    pub addr_delta: u64,
    pub pe: Option<pe::PeLayout>,
    pub pe_patch_slots: Option<pe::PePatches>,
    pub elf_patches: Option<elf::ElfPatches>,
    pub macho_patches: Option<macho::MachoPatches>,

    /// Counter for synthesised frame slot names.
    pub anon: usize,
    /// Annotated instruction lines, the first half of the metrics pair.
    pub lines: usize,
    debug_pos: usize,
}

impl<'a> Generator<'a> {
    pub fn new(prefs: &'a Preferences, table: &'a mut TypeTable) -> Result<Self> {
        let arch = prefs.resolved_arch()?;
        Ok(Self {
            prefs,
            arch,
            os: prefs.os,
            table,
            buf: CodeBuffer::with_capacity(4096),
            diag: Diag::new(prefs.output_mode, &prefs.path),
            strings: StringPool::new(),
            labels: LabelTable::new(),
            frame: Frame::new(),
            fn_addr: HashMap::new(),
            main_fn_addr: None,
            call_patches: Vec::new(),
            extern_calls: Vec::new(),
            abs_relocs: Vec::new(),
            builtins: builtins::Builtins::new(),
            enum_vals: HashMap::new(),
            fn_name: String::new(),
            fn_ret_type: crate::types::VOID,
            ret_label: 0,
            defers: Vec::new(),
            link_object: false,
            code_start: 0,
            base_addr: 0,
            addr_delta: 0,
            pe: None,
            pe_patch_slots: None,
            elf_patches: None,
            macho_patches: None,
            anon: 0,
            lines: 0,
            debug_pos: 0,
        })
    }

    /// Virtual address of a buffer offset in the final image.
    pub fn abs_addr(&self, off: usize) -> u64 {
        self.base_addr + self.addr_delta + off as u64
    }

    /// Drive the whole pipeline and return the output image (or the
    /// relocatable object when external symbols force the link path).
    pub fn run(&mut self, files: &[ast::File]) -> Result<Vec<u8>> {
        if self.arch == Arch::Arm64 && self.os == Os::Windows {
            return Err(GenError::User {
                message: "arm64 is not a supported architecture for windows targets".into(),
                line: 0,
                col: 0,
            });
        }

        self.collect_enums(files);
        let has_extern = files.iter().any(|f| stmts_reference_extern(&f.stmts));
        self.link_object = has_extern && self.os == Os::Linux && self.arch == Arch::Amd64;

        match self.os {
            Os::Linux if !self.link_object => elf::write_exec_header(self),
            Os::Linux => {} // text assembled into an object file at footer time
            Os::Macos => macho::write_header(self),
            Os::Windows => pe::write_header(self),
            Os::Raw => {}
        }

        if !self.link_object {
            self.gen_start_stub();
        }

        for file in files {
            for stmt in &file.stmts {
                self.top_stmt(stmt)?;
            }
        }

        if self.main_fn_addr.is_none() && !self.link_object {
            return Err(n_error("no main.main function found"));
        }

        builtins::generate_all(self)?;
        self.patch_calls()?;
        self.write_string_pool()?;

        match self.os {
            Os::Linux if self.link_object => return elf::build_object(self),
            Os::Linux => elf::patch_footer(self),
            Os::Macos => macho::patch_footer(self),
            Os::Windows => pe::write_footer(self)?,
            Os::Raw => {}
        }

        Ok(self.buf.code().to_vec())
    }

    fn top_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Fn(decl) => stmt::fn_decl(self, decl),
            // Layout and enum values are derived from the shared tables;
            // the declarations themselves emit nothing.
            Stmt::Struct(_) | Stmt::Enum(_) | Stmt::Const(_) => Ok(()),
            Stmt::Import { .. } | Stmt::Module { .. } => Ok(()),
            other => Err(n_error(format!(
                "unexpected top-level statement at {}:{}",
                other.pos().line,
                other.pos().col
            ))),
        }
    }

    fn collect_enums(&mut self, files: &[ast::File]) {
        for file in files {
            for stmt in &file.stmts {
                if let Stmt::Enum(decl) = stmt {
                    let mut vals = HashMap::new();
                    let mut next: i64 = if decl.is_flag { 1 } else { 0 };
                    for field in &decl.fields {
                        let val = field.value.unwrap_or(next);
                        vals.insert(field.name.clone(), val);
                        next = if decl.is_flag {
                            // Doubling keeps each flag a distinct bit.
                            if val == 0 {
                                1
                            } else {
                                val << 1
                            }
                        } else {
                            val + 1
                        };
                    }
                    self.enum_vals.insert(decl.name.clone(), vals);
                }
            }
        }
    }

    /// Entry stub: the container's entry vector lands here; it calls
    /// `main.main` through the ordinary pending-call machinery and exits 0.
    fn gen_start_stub(&mut self) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::gen_start_stub(self),
            Arch::Arm64 => arm64::codegen::gen_start_stub(self),
        }
    }

    /// Resolve every pending call displacement against the
    /// function-address map. External referents are left for the linker.
    fn patch_calls(&mut self) -> Result<()> {
        let patches = std::mem::take(&mut self.call_patches);
        for patch in &patches {
            let target = match self.fn_addr.get(&patch.name) {
                Some(&addr) => addr as i64,
                None => {
                    return Err(n_error(format!("unknown function: {}", patch.name)));
                }
            };
            match patch.kind {
                PatchKind::Rel32 => {
                    let rel = target - (patch.pos as i64 + 4);
                    if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                        return Err(n_error("call target out of rel32 range"));
                    }
                    self.buf.patch_i32(patch.pos, rel as i32);
                }
                PatchKind::Branch26 => {
                    let rel = target - patch.pos as i64;
                    if rel % 4 != 0 || rel < -(1 << 27) || rel >= (1 << 27) {
                        return Err(n_error("call target out of branch range"));
                    }
                    let imm26 = ((rel / 4) as u32) & 0x03FF_FFFF;
                    let word = self.buf.read_u32(patch.pos) | imm26;
                    self.buf.patch_u32(patch.pos, word);
                }
                PatchKind::Branch19 => {
                    return Err(n_error("conditional patch recorded for a call"));
                }
            }
        }
        Ok(())
    }

    /// Append the string pool to the buffer and patch every displacement
    /// slot. Absolute entries become relocation records in object mode.
    fn write_string_pool(&mut self) -> Result<()> {
        let entries = std::mem::take(&mut self.strings.entries);
        for entry in entries {
            let target = self.buf.pos();
            self.buf.emit_bytes(&entry.bytes);
            match entry.kind {
                RelocKind::Rel8 => {
                    let rel = target as i64 - (entry.ref_pos as i64 + 1);
                    if rel < i8::MIN as i64 || rel > i8::MAX as i64 {
                        return Err(n_error("string reference out of rel8 range"));
                    }
                    self.buf.patch_u8(entry.ref_pos, rel as i8 as u8);
                }
                RelocKind::Rel16 => {
                    let rel = target as i64 - (entry.ref_pos as i64 + 2);
                    if rel < i16::MIN as i64 || rel > i16::MAX as i64 {
                        return Err(n_error("string reference out of rel16 range"));
                    }
                    self.buf.patch_u16(entry.ref_pos, rel as i16 as u16);
                }
                RelocKind::Rel32 => {
                    let rel = target as i64 - (entry.ref_pos as i64 + 4);
                    if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                        return Err(n_error("string reference out of rel32 range"));
                    }
                    self.buf.patch_i32(entry.ref_pos, rel as i32);
                }
                RelocKind::Rel64 => {
                    let rel = target as i64 - (entry.ref_pos as i64 + 8);
                    self.buf.patch_u64(entry.ref_pos, rel as u64);
                }
                RelocKind::Abs64 => {
                    if self.link_object {
                        self.abs_relocs.push((entry.ref_pos, target));
                    } else {
                        let addr = self.abs_addr(target);
                        self.buf.patch_u64(entry.ref_pos, addr);
                    }
                }
                RelocKind::Adr21 => {
                    let rel = target as i64 - entry.ref_pos as i64;
                    if rel < -(1 << 20) || rel >= (1 << 20) {
                        return Err(n_error("string reference out of adr range"));
                    }
                    let rel = rel as u32;
                    let immlo = (rel & 0b11) << 29;
                    let immhi = ((rel >> 2) & 0x7FFFF) << 5;
                    let word = self.buf.read_u32(entry.ref_pos) | immlo | immhi;
                    self.buf.patch_u32(entry.ref_pos, word);
                }
            }
        }
        Ok(())
    }

    /// Trace one emitted instruction: everything appended since the last
    /// annotation belongs to it.
    pub fn annotate(&mut self, text: impl AsRef<str>) {
        let start = self.debug_pos;
        let end = self.buf.pos();
        self.debug_pos = end;
        self.lines += 1;
        let text = text.as_ref();
        if log::log_enabled!(log::Level::Trace) || self.prefs.is_verbose {
            let hex: String = self.buf.code()[start..end]
                .iter()
                .map(|b| format!("{b:02x} "))
                .collect();
            log::trace!("{start:06x}: {} ; {text}", hex.trim_end());
            if self.prefs.is_verbose {
                eprintln!("{start:06x}  {:<30} ; {text}", hex.trim_end());
            }
        }
    }

    /// Reset the annotation cursor after non-instruction bytes (headers,
    /// inline data).
    pub fn sync_debug_pos(&mut self) {
        self.debug_pos = self.buf.pos();
    }

    /// Fresh name for a synthesised frame slot.
    pub fn anon_name(&mut self, prefix: &str) -> String {
        self.anon += 1;
        format!("_{prefix}{}", self.anon)
    }
}

// ==================== ISA capability surface ====================
//
// Every method forwards to the backend selected by `self.arch`.

impl Generator<'_> {
    /// Function prologue; returns the frame-reservation patch offset.
    pub fn prologue(&mut self) -> usize {
        match self.arch {
            Arch::Amd64 => amd64::codegen::prologue(self),
            Arch::Arm64 => arm64::codegen::prologue(self),
        }
    }

    /// Function epilogue: patches the frame reservation, restores the
    /// frame and returns.
    pub fn epilogue(&mut self, frame_patch: usize) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::epilogue(self, frame_patch),
            Arch::Arm64 => arm64::codegen::epilogue(self, frame_patch),
        }
    }

    /// Materialise a small immediate.
    pub fn mov(&mut self, reg: Reg, val: i32) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov(self, reg, val),
            Arch::Arm64 => arm64::codegen::mov(self, reg, val),
        }
    }

    /// Materialise a full 64-bit immediate.
    pub fn mov64(&mut self, reg: Reg, val: i64) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov64(self, reg, val),
            Arch::Arm64 => arm64::codegen::mov64(self, reg, val),
        }
    }

    /// Materialise an absolute 64-bit value; returns the immediate's
    /// offset so it can serve as a relocation site.
    pub fn movabs(&mut self, reg: Reg, val: u64) -> Result<usize> {
        match self.arch {
            Arch::Amd64 => Ok(amd64::codegen::movabs(self, reg, val)),
            Arch::Arm64 => Err(n_error("movabs is not available on arm64")),
        }
    }

    pub fn mov_reg(&mut self, dst: Reg, src: Reg) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_reg(self, dst, src),
            Arch::Arm64 => arm64::codegen::mov_reg(self, dst, src),
        }
    }

    /// Load a local into a register, widening by `size`/`signed`.
    pub fn mov_var_to_reg(&mut self, reg: Reg, off: i32, size: u32, signed: bool) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_var_to_reg(self, reg, off, size, signed),
            Arch::Arm64 => arm64::codegen::mov_var_to_reg(self, reg, off, size, signed),
        }
    }

    /// Store a register into a local with the given width.
    pub fn mov_reg_to_var(&mut self, off: i32, size: u32, reg: Reg) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_reg_to_var(self, off, size, reg),
            Arch::Arm64 => arm64::codegen::mov_reg_to_var(self, off, size, reg),
        }
    }

    /// Store an immediate into a local.
    pub fn mov_int_to_var(&mut self, off: i32, size: u32, val: i64) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_int_to_var(self, off, size, val),
            Arch::Arm64 => arm64::codegen::mov_int_to_var(self, off, size, val),
        }
    }

    /// Load the address of a local.
    pub fn lea_var_to_reg(&mut self, reg: Reg, off: i32) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::lea_var_to_reg(self, reg, off),
            Arch::Arm64 => arm64::codegen::lea_var_to_reg(self, reg, off),
        }
    }

    /// Replace `reg` with the `size`-wide value it points at.
    pub fn mov_deref(&mut self, reg: Reg, size: u32, signed: bool) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_deref(self, reg, size, signed),
            Arch::Arm64 => arm64::codegen::mov_deref(self, reg, size, signed),
        }
    }

    /// Store `val` through the address in `addr` with the given width.
    pub fn mov_store(&mut self, addr: Reg, val: Reg, size: u32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_store(self, addr, val, size),
            Arch::Arm64 => arm64::codegen::mov_store(self, addr, val, size),
        }
    }

    /// Load the (future) address of a string-pool entry into `reg`.
    /// Returns the displacement offset and its relocation kind; the pool
    /// patches it at footer time.
    pub fn load_str_addr(&mut self, reg: Reg) -> (usize, RelocKind) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::load_str_addr(self, reg),
            Arch::Arm64 => arm64::codegen::load_str_addr(self, reg),
        }
    }

    pub fn cmp_reg(&mut self, left: Reg, right: Reg) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::cmp_reg(self, left, right),
            Arch::Arm64 => arm64::codegen::cmp_reg(self, left, right),
        }
    }

    pub fn cmp_reg_imm(&mut self, reg: Reg, imm: i32) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::cmp_reg_imm(self, reg, imm),
            Arch::Arm64 => arm64::codegen::cmp_reg_imm(self, reg, imm),
        }
    }

    /// Compare a local against an immediate.
    pub fn cmp_var(&mut self, off: i32, imm: i32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::cmp_var(self, off, imm),
            Arch::Arm64 => arm64::codegen::cmp_var(self, off, imm),
        }
    }

    /// Materialise the last comparison's condition as 0/1.
    pub fn cset(&mut self, cond: Cond, reg: Reg) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::cset(self, cond, reg),
            Arch::Arm64 => arm64::codegen::cset(self, cond, reg),
        }
    }

    /// Unconditional jump to a label.
    pub fn jmp(&mut self, label: LabelId) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::jmp(self, label),
            Arch::Arm64 => arm64::codegen::jmp(self, label),
        }
    }

    /// Conditional jump on the last comparison.
    pub fn cjmp(&mut self, cond: Cond, label: LabelId) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::cjmp(self, cond, label),
            Arch::Arm64 => arm64::codegen::cjmp(self, cond, label),
        }
    }

    /// Bind a label to the current position.
    pub fn bind(&mut self, label: LabelId) {
        let pos = self.buf.pos();
        self.labels.bind(label, pos);
    }

    /// Call a function by qualified name through the pending-call list.
    pub fn call_fn(&mut self, name: &str) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::call_fn(self, name),
            Arch::Arm64 => arm64::codegen::call_fn(self, name),
        }
    }

    /// Call an external symbol; the displacement becomes a relocation.
    pub fn call_extern(&mut self, name: &str) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::call_extern(self, name),
            Arch::Arm64 => arm64::codegen::call_extern(self, name),
        }
    }

    /// Integer primitive on `(R0, R1)`, result in `R0`.
    pub fn arith(&mut self, op: ArithOp) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::arith(self, op),
            Arch::Arm64 => arm64::codegen::arith(self, op),
        }
    }

    /// Bitwise AND of two registers, result in `dst`.
    pub fn bitand_reg(&mut self, dst: Reg, src: Reg) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::bitand_reg(self, dst, src),
            Arch::Arm64 => arm64::codegen::bitand_reg(self, dst, src),
        }
    }

    pub fn neg(&mut self, reg: Reg) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::neg(self, reg),
            Arch::Arm64 => arm64::codegen::neg(self, reg),
        }
    }

    pub fn bitnot(&mut self, reg: Reg) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::bitnot(self, reg),
            Arch::Arm64 => arm64::codegen::bitnot(self, reg),
        }
    }

    pub fn push(&mut self, reg: Reg) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::push(self, reg),
            Arch::Arm64 => arm64::codegen::push(self, reg),
        }
    }

    pub fn pop(&mut self, reg: Reg) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::pop(self, reg),
            Arch::Arm64 => arm64::codegen::pop(self, reg),
        }
    }

    /// Increment a 64-bit local in place.
    pub fn inc_var(&mut self, off: i32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::inc_var(self, off),
            Arch::Arm64 => arm64::codegen::inc_var(self, off),
        }
    }

    /// Decrement a 64-bit local in place.
    pub fn dec_var(&mut self, off: i32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::dec_var(self, off),
            Arch::Arm64 => arm64::codegen::dec_var(self, off),
        }
    }

    /// Narrow or extend `reg` to `size` bytes in place, re-extending to
    /// the full register per `signed`.
    pub fn cast_reg(&mut self, reg: Reg, size: u32, signed: bool) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::cast_reg(self, reg, size, signed),
            Arch::Arm64 => arm64::codegen::cast_reg(self, reg, size, signed),
        }
    }

    /// Copy `size` bytes from the address in `src` to the address in
    /// `dst` in 8-byte chunks plus a tail.
    pub fn copy_mem(&mut self, dst: Reg, src: Reg, size: u32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::copy_mem(self, dst, src, size),
            Arch::Arm64 => arm64::codegen::copy_mem(self, dst, src, size),
        }
    }

    /// `C.syscall` special form: `nargs` values are on the stack, last
    /// on top; pop them into the host syscall convention and trap.
    pub fn gen_syscall(&mut self, nargs: usize) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::gen_syscall(self, nargs),
            Arch::Arm64 => arm64::codegen::gen_syscall(self, nargs),
        }
    }

    /// Exit with the status currently in `R0`.
    pub fn gen_exit_reg(&mut self) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::gen_exit_reg(self),
            Arch::Arm64 => arm64::codegen::gen_exit_reg(self),
        }
    }

    /// Store incoming argument `index` of its class into a local.
    pub fn mov_arg_to_var(
        &mut self,
        index: usize,
        class: ArgClass,
        off: i32,
        size: u32,
    ) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_arg_to_var(self, index, class, off, size),
            Arch::Arm64 => arm64::codegen::mov_arg_to_var(self, index, class, off, size),
        }
    }

    /// Load a stack-passed parameter (beyond the register set) into a
    /// local. `stack_index` counts from the first stack argument.
    pub fn mov_stack_param_to_var(&mut self, stack_index: usize, off: i32, size: u32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_stack_param_to_var(self, stack_index, off, size),
            Arch::Arm64 => Err(n_error("stack parameters are not supported on arm64")),
        }
    }

    /// Load a call argument from its staging slot into the convention
    /// register for (`index`, `class`).
    pub fn mov_var_to_call_arg(&mut self, index: usize, class: ArgClass, off: i32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::mov_var_to_call_arg(self, index, class, off),
            Arch::Arm64 => arm64::codegen::mov_var_to_call_arg(self, index, class, off),
        }
    }

    /// Push a staged argument slot for a stack-passed call argument.
    pub fn push_var(&mut self, off: i32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::push_var(self, off),
            Arch::Arm64 => Err(n_error("stack arguments are not supported on arm64")),
        }
    }

    /// Release bytes pushed for stack arguments.
    pub fn free_stack(&mut self, bytes: u32) {
        match self.arch {
            Arch::Amd64 => amd64::codegen::free_stack(self, bytes),
            Arch::Arm64 => arm64::codegen::free_stack(self, bytes),
        }
    }

    // -------------------- float path --------------------
    //
    // The arm64 float path is deliberately refused: the encoders exist as
    // stubs upstream never wired, and exercising them would emit nothing.

    /// Materialise an IEEE-754 bit pattern in `F0` via `R0`.
    pub fn fmov_bits(&mut self, bits: u64) -> Result<()> {
        match self.arch {
            Arch::Amd64 => {
                amd64::codegen::fmov_bits(self, bits);
                Ok(())
            }
            Arch::Arm64 => Err(n_error("float literals are not implemented on arm64")),
        }
    }

    pub fn fmov(&mut self, dst: FReg, src: FReg) -> Result<()> {
        match self.arch {
            Arch::Amd64 => {
                amd64::codegen::fmov(self, dst, src);
                Ok(())
            }
            Arch::Arm64 => Err(n_error("float moves are not implemented on arm64")),
        }
    }

    pub fn fload_var(&mut self, off: i32, size: u32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::fload_var(self, off, size),
            Arch::Arm64 => Err(n_error("float loads are not implemented on arm64")),
        }
    }

    pub fn fstore_var(&mut self, off: i32, size: u32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::fstore_var(self, off, size),
            Arch::Arm64 => Err(n_error("float stores are not implemented on arm64")),
        }
    }

    pub fn fpush(&mut self) -> Result<()> {
        match self.arch {
            Arch::Amd64 => {
                amd64::codegen::fpush(self);
                Ok(())
            }
            Arch::Arm64 => Err(n_error("float pushes are not implemented on arm64")),
        }
    }

    /// Pop the top of stack into `F0`.
    pub fn pop_sse(&mut self) -> Result<()> {
        match self.arch {
            Arch::Amd64 => {
                amd64::codegen::pop_sse(self);
                Ok(())
            }
            Arch::Arm64 => Err(n_error("float pops are not implemented on arm64")),
        }
    }

    /// Float primitive on `(F0, F1)`, result in `F0`.
    pub fn farith(&mut self, op: ArithOp) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::farith(self, op),
            Arch::Arm64 => Err(n_error("float arithmetic is not implemented on arm64")),
        }
    }

    /// Compare `(F0, F1)` and materialise `cond` as 0/1 in `R0`.
    pub fn fcmp_set(&mut self, cond: Cond) -> Result<()> {
        match self.arch {
            Arch::Amd64 => {
                amd64::codegen::fcmp_set(self, cond);
                Ok(())
            }
            Arch::Arm64 => Err(n_error("float comparisons are not implemented on arm64")),
        }
    }

    /// Narrow `F0` from f64 to f32.
    pub fn cvt_f64_to_f32(&mut self) -> Result<()> {
        match self.arch {
            Arch::Amd64 => {
                amd64::codegen::cvt_f64_to_f32(self);
                Ok(())
            }
            Arch::Arm64 => Err(n_error("float conversions are not implemented on arm64")),
        }
    }

    /// Convert the integer in `R0` to a float in `F0`.
    pub fn cvt_int_to_float(&mut self) -> Result<()> {
        match self.arch {
            Arch::Amd64 => {
                amd64::codegen::cvt_int_to_float(self);
                Ok(())
            }
            Arch::Arm64 => Err(n_error("float conversions are not implemented on arm64")),
        }
    }

    /// Truncate the float in `F0` to an integer in `R0`.
    pub fn cvt_float_to_int(&mut self) -> Result<()> {
        match self.arch {
            Arch::Amd64 => {
                amd64::codegen::cvt_float_to_int(self);
                Ok(())
            }
            Arch::Arm64 => Err(n_error("float conversions are not implemented on arm64")),
        }
    }

    // -------------------- print family --------------------

    /// Write a literal byte payload to `fd`.
    pub fn gen_print_str(&mut self, bytes: Vec<u8>, fd: u32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::gen_print_str(self, bytes, fd),
            Arch::Arm64 => arm64::codegen::gen_print_str(self, bytes, fd),
        }
    }

    /// Print the integer in `R0` in decimal.
    pub fn gen_print_int(&mut self, fd: u32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::gen_print_int(self, fd),
            Arch::Arm64 => arm64::codegen::gen_print_int(self, fd),
        }
    }

    /// Print the boolean in `R0` as `true`/`false`.
    pub fn gen_print_bool(&mut self, fd: u32) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::gen_print_bool(self, fd),
            Arch::Arm64 => arm64::codegen::gen_print_bool(self, fd),
        }
    }

    /// A bounded inline-assembly subset, per backend.
    pub fn gen_asm_instr(&mut self, instr: &ast::AsmInstr) -> Result<()> {
        match self.arch {
            Arch::Amd64 => amd64::codegen::gen_asm_instr(self, instr),
            Arch::Arm64 => arm64::codegen::gen_asm_instr(self, instr),
        }
    }
}

/// Does any statement reference an external (`C.`) symbol other than the
/// `C.syscall` special form?
fn stmts_reference_extern(stmts: &[Stmt]) -> bool {
    stmts.iter().any(stmt_references_extern)
}

fn stmt_references_extern(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Fn(decl) => stmts_reference_extern(&decl.body),
        Stmt::Assign(assign) => {
            expr_references_extern(&assign.left) || expr_references_extern(&assign.right)
        }
        Stmt::Block { stmts, .. } | Stmt::Defer { stmts, .. } => stmts_reference_extern(stmts),
        Stmt::Expr(expr) => expr_references_extern(expr),
        Stmt::For(f) => {
            f.init.as_deref().is_some_and(stmt_references_extern)
                || f.cond.as_ref().is_some_and(expr_references_extern)
                || f.post.as_deref().is_some_and(stmt_references_extern)
                || stmts_reference_extern(&f.body)
        }
        Stmt::ForIn(f) => {
            expr_references_extern(&f.low)
                || expr_references_extern(&f.high)
                || stmts_reference_extern(&f.body)
        }
        Stmt::ForCond(f) => {
            f.cond.as_ref().is_some_and(expr_references_extern) || stmts_reference_extern(&f.body)
        }
        Stmt::Assert { cond, .. } => expr_references_extern(cond),
        Stmt::Return { expr, .. } => expr.as_ref().is_some_and(expr_references_extern),
        _ => false,
    }
}

fn expr_references_extern(expr: &Expr) -> bool {
    match expr {
        Expr::Call(call) => {
            (call.lang == CallLang::C && call.name != "syscall")
                || call.receiver.as_deref().is_some_and(expr_references_extern)
                || call.args.iter().any(expr_references_extern)
        }
        Expr::Selector { expr, .. } | Expr::Cast { expr, .. } => expr_references_extern(expr),
        Expr::Infix { left, right, .. } => {
            expr_references_extern(left) || expr_references_extern(right)
        }
        Expr::Prefix { expr, .. } | Expr::Postfix { expr, .. } => expr_references_extern(expr),
        Expr::If(ifx) => ifx.branches.iter().any(|b| {
            b.cond.as_ref().is_some_and(expr_references_extern) || stmts_reference_extern(&b.stmts)
        }),
        Expr::Match(mx) => {
            expr_references_extern(&mx.cond)
                || mx.branches.iter().any(|b| {
                    b.exprs.iter().any(expr_references_extern) || stmts_reference_extern(&b.stmts)
                })
        }
        Expr::Paren { inner }
        | Expr::Unsafe { inner }
        | Expr::Likely { inner }
        | Expr::Lock { inner } => expr_references_extern(inner),
        Expr::StructInit { fields, .. } => {
            fields.iter().any(|(_, e)| expr_references_extern(e))
        }
        _ => false,
    }
}
