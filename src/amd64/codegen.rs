//! amd64 backend
//!
//! Implements the generator's capability set for amd64: System V
//! conventions on Linux and macOS, the Win64 convention plus IAT calls on
//! Windows. Every function takes the generator explicitly; the shared
//! code buffer is the only emission target.

use super::registers::{fmap, map, Reg64, Xmm, SYSCALL_ARG_REGS, SYSV_ARG_REGS, SYSV_FARG_REGS, WIN64_ARG_REGS};
use super::encoding::Cc;
use crate::ast::AsmInstr;
use crate::diag::n_error;
use crate::gen::labels::PatchKind;
use crate::gen::strings::RelocKind;
use crate::gen::{ArgClass, ArithOp, CallPatch, Cond, ExternCall, FReg, Generator, Reg};
use crate::prefs::Os;
use crate::Result;

/// Syscall numbers for the supported kernels.
pub mod syscall {
    pub const LINUX_WRITE: i32 = 1;
    pub const LINUX_EXIT: i32 = 60;
    // macOS puts BSD calls in class 2.
    pub const MACOS_WRITE: i32 = 0x200_0004;
    pub const MACOS_EXIT: i32 = 0x200_0001;
}

fn write_num(os: Os) -> i32 {
    match os {
        Os::Macos => syscall::MACOS_WRITE,
        _ => syscall::LINUX_WRITE,
    }
}

fn exit_num(os: Os) -> i32 {
    match os {
        Os::Macos => syscall::MACOS_EXIT,
        _ => syscall::LINUX_EXIT,
    }
}

fn cc(cond: Cond) -> Cc {
    match cond {
        Cond::Eq => Cc::E,
        Cond::Ne => Cc::Ne,
        Cond::Lt => Cc::L,
        Cond::Le => Cc::Le,
        Cond::Gt => Cc::G,
        Cond::Ge => Cc::Ge,
    }
}

/// Condition codes after UCOMISD, which sets the unsigned flags.
fn fcc(cond: Cond) -> Cc {
    match cond {
        Cond::Eq => Cc::E,
        Cond::Ne => Cc::Ne,
        Cond::Lt => Cc::B,
        Cond::Le => Cc::Be,
        Cond::Gt => Cc::A,
        Cond::Ge => Cc::Ae,
    }
}

// ==================== frame ====================

pub fn prologue(g: &mut Generator) -> usize {
    g.buf.push_r64(Reg64::RBP);
    g.annotate("push rbp");
    g.buf.mov_r64_r64(Reg64::RBP, Reg64::RSP);
    g.annotate("mov rbp, rsp");
    let patch = g.buf.sub_r64_imm32(Reg64::RSP, 0);
    g.annotate("sub rsp, <frame>");
    patch
}

pub fn epilogue(g: &mut Generator, frame_patch: usize) -> Result<()> {
    let frame = g.frame.frame_size();
    if frame > i32::MAX as u32 {
        return Err(n_error("stack frame too large"));
    }
    g.buf.patch_i32(frame_patch, frame as i32);
    g.buf.mov_r64_r64(Reg64::RSP, Reg64::RBP);
    g.annotate("mov rsp, rbp");
    g.buf.pop_r64(Reg64::RBP);
    g.annotate("pop rbp");
    g.buf.ret();
    g.annotate("ret");
    Ok(())
}

// ==================== moves ====================

pub fn mov(g: &mut Generator, reg: Reg, val: i32) {
    let r = map(reg);
    g.buf.mov_r64_imm32(r, val);
    g.annotate(format!("mov {r}, {val}"));
}

pub fn mov64(g: &mut Generator, reg: Reg, val: i64) {
    let r = map(reg);
    if val >= i32::MIN as i64 && val <= i32::MAX as i64 {
        g.buf.mov_r64_imm32(r, val as i32);
    } else {
        g.buf.mov_r64_imm64(r, val as u64);
    }
    g.annotate(format!("mov {r}, {val}"));
}

pub fn movabs(g: &mut Generator, reg: Reg, val: u64) -> usize {
    let r = map(reg);
    let pos = g.buf.mov_r64_imm64(r, val);
    g.annotate(format!("movabs {r}, {val:#x}"));
    pos
}

pub fn mov_reg(g: &mut Generator, dst: Reg, src: Reg) {
    let (d, s) = (map(dst), map(src));
    g.buf.mov_r64_r64(d, s);
    g.annotate(format!("mov {d}, {s}"));
}

pub fn mov_var_to_reg(g: &mut Generator, reg: Reg, off: i32, size: u32, signed: bool) -> Result<()> {
    let r = map(reg);
    match (size, signed) {
        (8, _) => g.buf.mov_r64_mem(r, Reg64::RBP, off),
        (4, true) => g.buf.movsxd_r64_mem(r, Reg64::RBP, off),
        (4, false) => g.buf.mov_r32_mem(r, Reg64::RBP, off),
        (2, true) => g.buf.movsx_r64_mem16(r, Reg64::RBP, off),
        (2, false) => g.buf.movzx_r64_mem16(r, Reg64::RBP, off),
        (1, true) => g.buf.movsx_r64_mem8(r, Reg64::RBP, off),
        (1, false) => g.buf.movzx_r64_mem8(r, Reg64::RBP, off),
        _ => return Err(n_error(format!("unsupported load width: {size}"))),
    }
    g.annotate(format!("mov {r}, [rbp{off:+}] ({size}b)"));
    Ok(())
}

pub fn mov_reg_to_var(g: &mut Generator, off: i32, size: u32, reg: Reg) -> Result<()> {
    let r = map(reg);
    match size {
        8 => g.buf.mov_mem_r64(Reg64::RBP, off, r),
        4 => g.buf.mov_mem_r32(Reg64::RBP, off, r),
        2 => g.buf.mov_mem_r16(Reg64::RBP, off, r),
        1 => g.buf.mov_mem_r8(Reg64::RBP, off, r),
        _ => return Err(n_error(format!("unsupported store width: {size}"))),
    }
    g.annotate(format!("mov [rbp{off:+}], {r} ({size}b)"));
    Ok(())
}

pub fn mov_int_to_var(g: &mut Generator, off: i32, size: u32, val: i64) -> Result<()> {
    mov64(g, Reg::R3, val);
    mov_reg_to_var(g, off, size, Reg::R3)
}

pub fn lea_var_to_reg(g: &mut Generator, reg: Reg, off: i32) {
    let r = map(reg);
    g.buf.lea_r64_mem(r, Reg64::RBP, off);
    g.annotate(format!("lea {r}, [rbp{off:+}]"));
}

pub fn mov_deref(g: &mut Generator, reg: Reg, size: u32, signed: bool) -> Result<()> {
    let r = map(reg);
    match (size, signed) {
        (8, _) => g.buf.mov_r64_mem(r, r, 0),
        (4, true) => g.buf.movsxd_r64_mem(r, r, 0),
        (4, false) => g.buf.mov_r32_mem(r, r, 0),
        (2, true) => g.buf.movsx_r64_mem16(r, r, 0),
        (2, false) => g.buf.movzx_r64_mem16(r, r, 0),
        (1, true) => g.buf.movsx_r64_mem8(r, r, 0),
        (1, false) => g.buf.movzx_r64_mem8(r, r, 0),
        _ => return Err(n_error(format!("unsupported dereference width: {size}"))),
    }
    g.annotate(format!("mov {r}, [{r}] ({size}b)"));
    Ok(())
}

pub fn mov_store(g: &mut Generator, addr: Reg, val: Reg, size: u32) -> Result<()> {
    let (a, v) = (map(addr), map(val));
    match size {
        8 => g.buf.mov_mem_r64(a, 0, v),
        4 => g.buf.mov_mem_r32(a, 0, v),
        2 => g.buf.mov_mem_r16(a, 0, v),
        1 => g.buf.mov_mem_r8(a, 0, v),
        _ => return Err(n_error(format!("unsupported store width: {size}"))),
    }
    g.annotate(format!("mov [{a}], {v} ({size}b)"));
    Ok(())
}

pub fn load_str_addr(g: &mut Generator, reg: Reg) -> (usize, RelocKind) {
    str_addr_into(g, map(reg))
}

/// Emit an address load whose displacement the string pool will patch.
/// Executables use RIP-relative `lea`; the relocatable object uses an
/// absolute `movabs` carried in the rela section.
fn str_addr_into(g: &mut Generator, reg: Reg64) -> (usize, RelocKind) {
    if g.link_object {
        let pos = g.buf.mov_r64_imm64(reg, 0);
        g.annotate(format!("movabs {reg}, <str>"));
        (pos, RelocKind::Abs64)
    } else {
        let pos = g.buf.lea_r64_rip(reg);
        g.annotate(format!("lea {reg}, [rip+<str>]"));
        (pos, RelocKind::Rel32)
    }
}

// ==================== compare and branch ====================

pub fn cmp_reg(g: &mut Generator, left: Reg, right: Reg) {
    let (l, r) = (map(left), map(right));
    g.buf.cmp_r64_r64(l, r);
    g.annotate(format!("cmp {l}, {r}"));
}

pub fn cmp_reg_imm(g: &mut Generator, reg: Reg, imm: i32) {
    let r = map(reg);
    g.buf.cmp_r64_imm32(r, imm);
    g.annotate(format!("cmp {r}, {imm}"));
}

pub fn cmp_var(g: &mut Generator, off: i32, imm: i32) -> Result<()> {
    g.buf.cmp_mem64_imm32(Reg64::RBP, off, imm);
    g.annotate(format!("cmp qword [rbp{off:+}], {imm}"));
    Ok(())
}

pub fn cset(g: &mut Generator, cond: Cond, reg: Reg) {
    let r = map(reg);
    g.buf.setcc(cc(cond), r);
    g.buf.movzx_r64_r8(r, r);
    g.annotate(format!("set{cond:?} {r}").to_lowercase());
}

pub fn jmp(g: &mut Generator, label: usize) {
    let pos = g.buf.jmp_rel32();
    g.labels.add_patch(label, pos, PatchKind::Rel32);
    g.annotate(format!("jmp .L{label}"));
}

pub fn cjmp(g: &mut Generator, cond: Cond, label: usize) {
    let pos = g.buf.jcc_rel32(cc(cond));
    g.labels.add_patch(label, pos, PatchKind::Rel32);
    g.annotate(format!("j{cond:?} .L{label}").to_lowercase());
}

// ==================== calls ====================

pub fn call_fn(g: &mut Generator, name: &str) {
    let pos = g.buf.call_rel32();
    g.call_patches.push(CallPatch {
        pos,
        name: name.to_string(),
        kind: PatchKind::Rel32,
    });
    g.annotate(format!("call {name}"));
}

pub fn call_extern(g: &mut Generator, name: &str) {
    let pos = g.buf.call_rel32();
    g.extern_calls.push(ExternCall {
        pos,
        name: name.to_string(),
    });
    g.annotate(format!("call {name} (extern)"));
}

pub fn mov_arg_to_var(
    g: &mut Generator,
    index: usize,
    class: ArgClass,
    off: i32,
    size: u32,
) -> Result<()> {
    match class {
        ArgClass::Int => {
            let regs: &[Reg64] = if g.os == Os::Windows {
                &WIN64_ARG_REGS
            } else {
                &SYSV_ARG_REGS
            };
            let src = *regs
                .get(index)
                .ok_or_else(|| n_error("argument register index out of range"))?;
            match size {
                8 => g.buf.mov_mem_r64(Reg64::RBP, off, src),
                4 => g.buf.mov_mem_r32(Reg64::RBP, off, src),
                2 => g.buf.mov_mem_r16(Reg64::RBP, off, src),
                1 => g.buf.mov_mem_r8(Reg64::RBP, off, src),
                _ => return Err(n_error(format!("unsupported parameter width: {size}"))),
            }
            g.annotate(format!("mov [rbp{off:+}], {src} (arg {index})"));
        }
        ArgClass::Float => {
            let src = *SYSV_FARG_REGS
                .get(index)
                .ok_or_else(|| n_error("float argument register index out of range"))?;
            if size == 4 {
                g.buf.movss_mem_xmm(Reg64::RBP, off, src);
            } else {
                g.buf.movsd_mem_xmm(Reg64::RBP, off, src);
            }
            g.annotate(format!("movsd [rbp{off:+}], {src} (arg {index})"));
        }
    }
    Ok(())
}

pub fn mov_stack_param_to_var(g: &mut Generator, stack_index: usize, off: i32, size: u32) -> Result<()> {
    // Stack parameters sit above the saved base pointer and return
    // address.
    let disp = 16 + 8 * stack_index as i32;
    g.buf.mov_r64_mem(Reg64::R10, Reg64::RBP, disp);
    g.annotate(format!("mov r10, [rbp+{disp}] (stack arg)"));
    mov_reg_to_var(g, off, size, Reg::R3)?;
    Ok(())
}

pub fn mov_var_to_call_arg(g: &mut Generator, index: usize, class: ArgClass, off: i32) -> Result<()> {
    match class {
        ArgClass::Int => {
            let regs: &[Reg64] = if g.os == Os::Windows {
                &WIN64_ARG_REGS
            } else {
                &SYSV_ARG_REGS
            };
            let dst = *regs
                .get(index)
                .ok_or_else(|| n_error("too many register arguments"))?;
            g.buf.mov_r64_mem(dst, Reg64::RBP, off);
            g.annotate(format!("mov {dst}, [rbp{off:+}] (arg {index})"));
        }
        ArgClass::Float => {
            let dst = *SYSV_FARG_REGS
                .get(index)
                .ok_or_else(|| n_error("too many float arguments"))?;
            g.buf.movsd_xmm_mem(dst, Reg64::RBP, off);
            g.annotate(format!("movsd {dst}, [rbp{off:+}] (arg {index})"));
        }
    }
    Ok(())
}

pub fn push_var(g: &mut Generator, off: i32) -> Result<()> {
    g.buf.mov_r64_mem(Reg64::R10, Reg64::RBP, off);
    g.buf.push_r64(Reg64::R10);
    g.annotate(format!("push qword [rbp{off:+}]"));
    Ok(())
}

pub fn free_stack(g: &mut Generator, bytes: u32) {
    g.buf.add_r64_imm32(Reg64::RSP, bytes as i32);
    g.annotate(format!("add rsp, {bytes}"));
}

// ==================== arithmetic ====================

pub fn arith(g: &mut Generator, op: ArithOp) {
    let (r0, r1, r2) = (Reg64::RAX, Reg64::RDX, Reg64::RCX);
    match op {
        ArithOp::Add => {
            g.buf.add_r64_r64(r0, r1);
            g.annotate("add rax, rdx");
        }
        ArithOp::Sub => {
            g.buf.sub_r64_r64(r0, r1);
            g.annotate("sub rax, rdx");
        }
        ArithOp::Mul => {
            g.buf.imul_r64_r64(r0, r1);
            g.annotate("imul rax, rdx");
        }
        ArithOp::Div => {
            // CQO clobbers RDX, so park the divisor first.
            g.buf.mov_r64_r64(r2, r1);
            g.buf.cqo();
            g.buf.idiv_r64(r2);
            g.annotate("idiv rcx");
        }
        ArithOp::Mod => {
            g.buf.mov_r64_r64(r2, r1);
            g.buf.cqo();
            g.buf.idiv_r64(r2);
            g.buf.mov_r64_r64(r0, r1);
            g.annotate("idiv rcx (mod)");
        }
        ArithOp::And => {
            g.buf.and_r64_r64(r0, r1);
            g.annotate("and rax, rdx");
        }
        ArithOp::Or => {
            g.buf.or_r64_r64(r0, r1);
            g.annotate("or rax, rdx");
        }
        ArithOp::Xor => {
            g.buf.xor_r64_r64(r0, r1);
            g.annotate("xor rax, rdx");
        }
        ArithOp::Shl => {
            g.buf.mov_r64_r64(r2, r1);
            g.buf.shl_r64_cl(r0);
            g.annotate("shl rax, cl");
        }
        ArithOp::Shr => {
            g.buf.mov_r64_r64(r2, r1);
            g.buf.sar_r64_cl(r0);
            g.annotate("sar rax, cl");
        }
    }
}

pub fn bitand_reg(g: &mut Generator, dst: Reg, src: Reg) {
    let (d, s) = (map(dst), map(src));
    g.buf.and_r64_r64(d, s);
    g.annotate(format!("and {d}, {s}"));
}

pub fn neg(g: &mut Generator, reg: Reg) {
    let r = map(reg);
    g.buf.neg_r64(r);
    g.annotate(format!("neg {r}"));
}

pub fn bitnot(g: &mut Generator, reg: Reg) {
    let r = map(reg);
    g.buf.not_r64(r);
    g.annotate(format!("not {r}"));
}

pub fn push(g: &mut Generator, reg: Reg) {
    let r = map(reg);
    g.buf.push_r64(r);
    g.annotate(format!("push {r}"));
}

pub fn pop(g: &mut Generator, reg: Reg) {
    let r = map(reg);
    g.buf.pop_r64(r);
    g.annotate(format!("pop {r}"));
}

pub fn inc_var(g: &mut Generator, off: i32) -> Result<()> {
    g.buf.inc_mem64(Reg64::RBP, off);
    g.annotate(format!("inc qword [rbp{off:+}]"));
    Ok(())
}

pub fn dec_var(g: &mut Generator, off: i32) -> Result<()> {
    g.buf.dec_mem64(Reg64::RBP, off);
    g.annotate(format!("dec qword [rbp{off:+}]"));
    Ok(())
}

pub fn cast_reg(g: &mut Generator, reg: Reg, size: u32, signed: bool) -> Result<()> {
    let r = map(reg);
    match (size, signed) {
        (8, _) => return Ok(()),
        (4, true) => g.buf.movsxd_r64_r32(r, r),
        (4, false) => g.buf.mov_r32_r32(r, r),
        (2, true) => g.buf.movsx_r64_r16(r, r),
        (2, false) => g.buf.movzx_r64_r16(r, r),
        (1, true) => g.buf.movsx_r64_r8(r, r),
        (1, false) => g.buf.movzx_r64_r8(r, r),
        _ => return Err(n_error(format!("unsupported cast width: {size}"))),
    }
    g.annotate(format!("cast {r} to {size}b"));
    Ok(())
}

pub fn copy_mem(g: &mut Generator, dst: Reg, src: Reg, size: u32) -> Result<()> {
    let (d, s) = (map(dst), map(src));
    let tmp = Reg64::R10;
    let mut off = 0i32;
    let mut left = size;
    while left >= 8 {
        g.buf.mov_r64_mem(tmp, s, off);
        g.buf.mov_mem_r64(d, off, tmp);
        off += 8;
        left -= 8;
    }
    if left >= 4 {
        g.buf.mov_r32_mem(tmp, s, off);
        g.buf.mov_mem_r32(d, off, tmp);
        off += 4;
        left -= 4;
    }
    if left >= 2 {
        g.buf.movzx_r64_mem16(tmp, s, off);
        g.buf.mov_mem_r16(d, off, tmp);
        off += 2;
        left -= 2;
    }
    if left >= 1 {
        g.buf.movzx_r64_mem8(tmp, s, off);
        g.buf.mov_mem_r8(d, off, tmp);
    }
    g.annotate(format!("copy {size}b [{s}] -> [{d}]"));
    Ok(())
}

// ==================== system ====================

pub fn gen_syscall(g: &mut Generator, nargs: usize) -> Result<()> {
    if nargs > SYSCALL_ARG_REGS.len() {
        return Err(n_error(format!(
            "too many syscall arguments: {nargs} (max {})",
            SYSCALL_ARG_REGS.len()
        )));
    }
    for i in (0..nargs).rev() {
        let r = SYSCALL_ARG_REGS[i];
        g.buf.pop_r64(r);
        g.annotate(format!("pop {r}"));
    }
    g.buf.syscall();
    g.annotate("syscall");
    Ok(())
}

pub fn gen_exit_reg(g: &mut Generator) {
    if g.os == Os::Windows {
        g.buf.mov_r64_r64(Reg64::RCX, Reg64::RAX);
        g.annotate("mov rcx, rax");
        let iat = g.pe.as_ref().map(|p| p.iat_exit_process).unwrap_or(0);
        iat_call(g, iat);
        return;
    }
    g.buf.mov_r64_r64(Reg64::RDI, Reg64::RAX);
    g.annotate("mov rdi, rax");
    g.buf.mov_r64_imm32(Reg64::RAX, exit_num(g.os));
    g.annotate("mov rax, <sys_exit>");
    g.buf.syscall();
    g.annotate("syscall");
}

/// Entry stub: call `main.main`, then exit 0. On Windows the stub also
/// fetches the stdout handle and parks it in the text data cell.
pub fn gen_start_stub(g: &mut Generator) {
    if g.os == Os::Windows {
        g.buf.sub_r64_imm32(Reg64::RSP, 40);
        g.annotate("sub rsp, 40 (shadow)");
        g.buf.mov_r32_imm32(Reg64::RCX, -11i32 as u32);
        g.annotate("mov ecx, -11 (STD_OUTPUT_HANDLE)");
        let get_std = g.pe.as_ref().map(|p| p.iat_get_std_handle).unwrap_or(0);
        iat_call(g, get_std);
        stdout_cell_store(g, Reg64::RAX);
        call_fn(g, "main.main");
        g.buf.mov_r32_imm32(Reg64::RCX, 0);
        g.annotate("mov ecx, 0");
        let exit = g.pe.as_ref().map(|p| p.iat_exit_process).unwrap_or(0);
        iat_call(g, exit);
        g.buf.emit(0xF4); // hlt, never reached
        g.annotate("hlt");
        return;
    }
    call_fn(g, "main.main");
    g.buf.mov_r64_imm32(Reg64::RAX, exit_num(g.os));
    g.annotate("mov rax, <sys_exit>");
    g.buf.xor_r64_r64(Reg64::RDI, Reg64::RDI);
    g.annotate("xor rdi, rdi");
    g.buf.syscall();
    g.annotate("syscall");
}

/// CALL through an IAT slot: `FF 15` with an RVA-relative displacement.
fn iat_call(g: &mut Generator, iat_rva: u32) {
    let (text_rva, text_off) = g
        .pe
        .as_ref()
        .map(|p| (p.text_rva, p.text_file_off))
        .unwrap_or((0, 0));
    let pos = g.buf.call_rip();
    let end = g.buf.pos();
    let rva_end = (end - text_off as usize) as u32 + text_rva;
    g.buf.patch_i32(pos, iat_rva as i32 - rva_end as i32);
    g.annotate("call [rip+<iat>]");
}

fn stdout_cell_store(g: &mut Generator, src: Reg64) {
    let cell = g.pe.as_ref().map(|p| p.stdout_cell).unwrap_or(0);
    let pos = g.buf.mov_rip_r64(src);
    let end = g.buf.pos();
    g.buf.patch_i32(pos, cell as i32 - end as i32);
    g.annotate("mov [rip+<stdout>], rax");
}

fn stdout_cell_load(g: &mut Generator, dst: Reg64) {
    let cell = g.pe.as_ref().map(|p| p.stdout_cell).unwrap_or(0);
    let pos = g.buf.mov_r64_rip(dst);
    let end = g.buf.pos();
    g.buf.patch_i32(pos, cell as i32 - end as i32);
    g.annotate(format!("mov {dst}, [rip+<stdout>]"));
}

// ==================== float path ====================

pub fn fmov_bits(g: &mut Generator, bits: u64) {
    // Stack round-trip through R0, as the SSE units have no 64-bit
    // immediate form.
    g.buf.mov_r64_imm64(Reg64::RAX, bits);
    g.annotate(format!("mov rax, {bits:#x} (f64 bits)"));
    g.buf.push_r64(Reg64::RAX);
    g.annotate("push rax");
    g.buf.movsd_xmm_mem(Xmm::XMM0, Reg64::RSP, 0);
    g.annotate("movsd xmm0, [rsp]");
    g.buf.add_r64_imm32(Reg64::RSP, 8);
    g.annotate("add rsp, 8");
}

pub fn fmov(g: &mut Generator, dst: FReg, src: FReg) {
    let (d, s) = (fmap(dst), fmap(src));
    g.buf.movsd_xmm_xmm(d, s);
    g.annotate(format!("movsd {d}, {s}"));
}

pub fn fload_var(g: &mut Generator, off: i32, size: u32) -> Result<()> {
    match size {
        8 => {
            g.buf.movsd_xmm_mem(Xmm::XMM0, Reg64::RBP, off);
            g.annotate(format!("movsd xmm0, [rbp{off:+}]"));
        }
        4 => {
            g.buf.movss_xmm_mem(Xmm::XMM0, Reg64::RBP, off);
            g.buf.cvtss2sd(Xmm::XMM0, Xmm::XMM0);
            g.annotate(format!("movss xmm0, [rbp{off:+}]; cvtss2sd"));
        }
        _ => return Err(n_error(format!("unsupported float width: {size}"))),
    }
    Ok(())
}

pub fn fstore_var(g: &mut Generator, off: i32, size: u32) -> Result<()> {
    match size {
        8 => {
            g.buf.movsd_mem_xmm(Reg64::RBP, off, Xmm::XMM0);
            g.annotate(format!("movsd [rbp{off:+}], xmm0"));
        }
        4 => {
            g.buf.cvtsd2ss(Xmm::XMM0, Xmm::XMM0);
            g.buf.movss_mem_xmm(Reg64::RBP, off, Xmm::XMM0);
            g.annotate(format!("cvtsd2ss; movss [rbp{off:+}], xmm0"));
        }
        _ => return Err(n_error(format!("unsupported float width: {size}"))),
    }
    Ok(())
}

pub fn fpush(g: &mut Generator) {
    g.buf.sub_r64_imm32(Reg64::RSP, 8);
    g.buf.movsd_mem_xmm(Reg64::RSP, 0, Xmm::XMM0);
    g.annotate("push xmm0");
}

pub fn pop_sse(g: &mut Generator) {
    g.buf.movsd_xmm_mem(Xmm::XMM0, Reg64::RSP, 0);
    g.buf.add_r64_imm32(Reg64::RSP, 8);
    g.annotate("pop xmm0");
}

pub fn farith(g: &mut Generator, op: ArithOp) -> Result<()> {
    match op {
        ArithOp::Add => {
            g.buf.addsd(Xmm::XMM0, Xmm::XMM1);
            g.annotate("addsd xmm0, xmm1");
        }
        ArithOp::Sub => {
            g.buf.subsd(Xmm::XMM0, Xmm::XMM1);
            g.annotate("subsd xmm0, xmm1");
        }
        ArithOp::Mul => {
            g.buf.mulsd(Xmm::XMM0, Xmm::XMM1);
            g.annotate("mulsd xmm0, xmm1");
        }
        ArithOp::Div => {
            g.buf.divsd(Xmm::XMM0, Xmm::XMM1);
            g.annotate("divsd xmm0, xmm1");
        }
        _ => return Err(n_error("invalid float operation")),
    }
    Ok(())
}

pub fn fcmp_set(g: &mut Generator, cond: Cond) {
    g.buf.ucomisd(Xmm::XMM0, Xmm::XMM1);
    g.buf.setcc(fcc(cond), Reg64::RAX);
    g.buf.movzx_r64_r8(Reg64::RAX, Reg64::RAX);
    g.annotate(format!("ucomisd xmm0, xmm1; set{cond:?} al").to_lowercase());
}

pub fn cvt_f64_to_f32(g: &mut Generator) {
    g.buf.cvtsd2ss(Xmm::XMM0, Xmm::XMM0);
    g.annotate("cvtsd2ss xmm0, xmm0");
}

pub fn cvt_int_to_float(g: &mut Generator) {
    g.buf.cvtsi2sd_xmm_r64(Xmm::XMM0, Reg64::RAX);
    g.annotate("cvtsi2sd xmm0, rax");
}

pub fn cvt_float_to_int(g: &mut Generator) {
    g.buf.cvttsd2si_r64_xmm(Reg64::RAX, Xmm::XMM0);
    g.annotate("cvttsd2si rax, xmm0");
}

// ==================== print family ====================

/// Reference a pooled string: address lands in `reg`, the displacement
/// is patched at footer time.
fn emit_str_ref(g: &mut Generator, bytes: Vec<u8>, reg: Reg64) {
    let (pos, kind) = str_addr_into(g, reg);
    g.strings.allocate(bytes, pos, kind);
}

pub fn gen_print_str(g: &mut Generator, bytes: Vec<u8>, fd: u32) -> Result<()> {
    let len = bytes.len();
    if g.os == Os::Windows {
        emit_str_ref(g, bytes, Reg64::RDI);
        g.buf.mov_r64_imm32(Reg64::RSI, len as i32);
        g.annotate(format!("mov rsi, {len}"));
        g.builtins.register("write_stdout");
        call_fn(g, "write_stdout");
        return Ok(());
    }
    emit_str_ref(g, bytes, Reg64::RSI);
    g.buf.mov_r64_imm32(Reg64::RDX, len as i32);
    g.annotate(format!("mov rdx, {len}"));
    g.buf.mov_r64_imm32(Reg64::RAX, write_num(g.os));
    g.annotate("mov rax, <sys_write>");
    g.buf.mov_r64_imm32(Reg64::RDI, fd as i32);
    g.annotate(format!("mov rdi, {fd}"));
    g.buf.syscall();
    g.annotate("syscall");
    Ok(())
}

pub fn gen_print_int(g: &mut Generator, fd: u32) -> Result<()> {
    g.builtins.register("int_to_string");
    g.buf.mov_r64_r64(Reg64::RDI, Reg64::RAX);
    g.annotate("mov rdi, rax");
    g.buf.sub_r64_imm32(Reg64::RSP, 40);
    g.annotate("sub rsp, 40 (itoa buffer)");
    g.buf.mov_r64_r64(Reg64::RSI, Reg64::RSP);
    g.annotate("mov rsi, rsp");
    call_fn(g, "int_to_string");
    if g.os == Os::Windows {
        g.builtins.register("write_stdout");
        g.buf.mov_r64_r64(Reg64::RDI, Reg64::RAX);
        g.annotate("mov rdi, rax");
        g.buf.mov_r64_r64(Reg64::RSI, Reg64::RDX);
        g.annotate("mov rsi, rdx");
        call_fn(g, "write_stdout");
    } else {
        g.buf.mov_r64_r64(Reg64::RSI, Reg64::RAX);
        g.annotate("mov rsi, rax");
        g.buf.mov_r64_imm32(Reg64::RAX, write_num(g.os));
        g.annotate("mov rax, <sys_write>");
        g.buf.mov_r64_imm32(Reg64::RDI, fd as i32);
        g.annotate(format!("mov rdi, {fd}"));
        g.buf.syscall();
        g.annotate("syscall");
    }
    g.buf.add_r64_imm32(Reg64::RSP, 40);
    g.annotate("add rsp, 40");
    Ok(())
}

pub fn gen_print_bool(g: &mut Generator, fd: u32) -> Result<()> {
    g.builtins.register("bool_to_string");
    g.buf.mov_r64_r64(Reg64::RDI, Reg64::RAX);
    g.annotate("mov rdi, rax");
    call_fn(g, "bool_to_string");
    if g.os == Os::Windows {
        g.builtins.register("write_stdout");
        g.buf.mov_r64_r64(Reg64::RDI, Reg64::RAX);
        g.annotate("mov rdi, rax");
        g.buf.mov_r64_r64(Reg64::RSI, Reg64::RDX);
        g.annotate("mov rsi, rdx");
        call_fn(g, "write_stdout");
        return Ok(());
    }
    g.buf.mov_r64_r64(Reg64::RSI, Reg64::RAX);
    g.annotate("mov rsi, rax");
    g.buf.mov_r64_imm32(Reg64::RAX, write_num(g.os));
    g.annotate("mov rax, <sys_write>");
    g.buf.mov_r64_imm32(Reg64::RDI, fd as i32);
    g.annotate(format!("mov rdi, {fd}"));
    g.buf.syscall();
    g.annotate("syscall");
    Ok(())
}

// ==================== builtin bodies ====================

/// Emit the body of a named builtin at the current position.
pub fn emit_builtin(g: &mut Generator, name: &str) -> Result<()> {
    match name {
        "int_to_string" => emit_int_to_string(g),
        "bool_to_string" => emit_bool_to_string(g),
        "write_stdout" => emit_write_stdout(g),
        other => Err(n_error(format!("unknown builtin: {other}"))),
    }
}

/// rdi = value, rsi = 32-byte buffer. Returns rax = first char,
/// rdx = length. Digits are built backwards from the buffer end.
fn emit_int_to_string(g: &mut Generator) -> Result<()> {
    g.buf.mov_r64_r64(Reg64::RAX, Reg64::RDI);
    g.annotate("mov rax, rdi");
    g.buf.lea_r64_mem(Reg64::RCX, Reg64::RSI, 31);
    g.annotate("lea rcx, [rsi+31]");
    g.buf.mov_r64_imm32(Reg64::R8, 10);
    g.annotate("mov r8, 10");
    g.buf.xor_r64_r64(Reg64::R9, Reg64::R9);
    g.annotate("xor r9, r9 (sign)");
    g.buf.cmp_r64_imm32(Reg64::RAX, 0);
    g.annotate("cmp rax, 0");
    let skip_neg = g.buf.jcc_rel8(Cc::Ge);
    g.annotate("jge +");
    g.buf.neg_r64(Reg64::RAX);
    g.annotate("neg rax");
    g.buf.mov_r64_imm32(Reg64::R9, 1);
    g.annotate("mov r9, 1");
    let here = g.buf.pos();
    g.buf.patch_u8(skip_neg, (here - (skip_neg + 1)) as u8);

    let loop_start = g.buf.pos();
    g.buf.xor_r64_r64(Reg64::RDX, Reg64::RDX);
    g.annotate("xor rdx, rdx");
    g.buf.div_r64(Reg64::R8);
    g.annotate("div r8");
    g.buf.add_r64_imm32(Reg64::RDX, i32::from(b'0'));
    g.annotate("add rdx, '0'");
    g.buf.mov_mem_r8(Reg64::RCX, 0, Reg64::RDX);
    g.annotate("mov [rcx], dl");
    g.buf.sub_r64_imm32(Reg64::RCX, 1);
    g.annotate("sub rcx, 1");
    g.buf.cmp_r64_imm32(Reg64::RAX, 0);
    g.annotate("cmp rax, 0");
    let back = g.buf.jcc_rel8(Cc::Ne);
    let rel = loop_start as i64 - (back as i64 + 1);
    g.buf.patch_u8(back, rel as i8 as u8);
    g.annotate("jne loop");

    g.buf.cmp_r64_imm32(Reg64::R9, 0);
    g.annotate("cmp r9, 0");
    let skip_sign = g.buf.jcc_rel8(Cc::E);
    g.annotate("je +");
    g.buf.mov_r64_imm32(Reg64::R9, i32::from(b'-'));
    g.annotate("mov r9, '-'");
    g.buf.mov_mem_r8(Reg64::RCX, 0, Reg64::R9);
    g.annotate("mov [rcx], r9b");
    g.buf.sub_r64_imm32(Reg64::RCX, 1);
    g.annotate("sub rcx, 1");
    let here = g.buf.pos();
    g.buf.patch_u8(skip_sign, (here - (skip_sign + 1)) as u8);

    g.buf.lea_r64_mem(Reg64::RAX, Reg64::RCX, 1);
    g.annotate("lea rax, [rcx+1]");
    g.buf.lea_r64_mem(Reg64::RDX, Reg64::RSI, 31);
    g.annotate("lea rdx, [rsi+31]");
    g.buf.sub_r64_r64(Reg64::RDX, Reg64::RCX);
    g.annotate("sub rdx, rcx");
    g.buf.ret();
    g.annotate("ret");
    Ok(())
}

/// rdi = value. Returns rax = pooled "true"/"false", rdx = length.
fn emit_bool_to_string(g: &mut Generator) -> Result<()> {
    g.buf.cmp_r64_imm32(Reg64::RDI, 0);
    g.annotate("cmp rdi, 0");
    let to_false = g.buf.jcc_rel8(Cc::E);
    g.annotate("je false");
    emit_str_ref(g, b"true".to_vec(), Reg64::RAX);
    g.buf.mov_r64_imm32(Reg64::RDX, 4);
    g.annotate("mov rdx, 4");
    g.buf.ret();
    g.annotate("ret");
    let here = g.buf.pos();
    g.buf.patch_u8(to_false, (here - (to_false + 1)) as u8);
    emit_str_ref(g, b"false".to_vec(), Reg64::RAX);
    g.buf.mov_r64_imm32(Reg64::RDX, 5);
    g.annotate("mov rdx, 5");
    g.buf.ret();
    g.annotate("ret");
    Ok(())
}

/// Windows shim: rdi = ptr, rsi = len; WriteFile to the cached stdout
/// handle with shadow space and a stack slot for the written count.
fn emit_write_stdout(g: &mut Generator) -> Result<()> {
    g.buf.sub_r64_imm32(Reg64::RSP, 0x38);
    g.annotate("sub rsp, 0x38");
    stdout_cell_load(g, Reg64::RCX);
    g.buf.mov_r64_r64(Reg64::RDX, Reg64::RDI);
    g.annotate("mov rdx, rdi");
    g.buf.mov_r64_r64(Reg64::R8, Reg64::RSI);
    g.annotate("mov r8, rsi");
    g.buf.lea_r64_mem(Reg64::R9, Reg64::RSP, 0x28);
    g.annotate("lea r9, [rsp+0x28]");
    g.buf.xor_r64_r64(Reg64::R10, Reg64::R10);
    g.buf.mov_mem_r64(Reg64::RSP, 0x20, Reg64::R10);
    g.annotate("mov qword [rsp+0x20], 0 (lpOverlapped)");
    let write_file = g.pe.as_ref().map(|p| p.iat_write_file).unwrap_or(0);
    iat_call(g, write_file);
    g.buf.add_r64_imm32(Reg64::RSP, 0x38);
    g.annotate("add rsp, 0x38");
    g.buf.ret();
    g.annotate("ret");
    Ok(())
}

// ==================== inline assembly subset ====================

pub fn gen_asm_instr(g: &mut Generator, instr: &AsmInstr) -> Result<()> {
    match instr.mnemonic.as_str() {
        "nop" => {
            g.buf.emit(0x90);
            g.annotate("nop");
            Ok(())
        }
        "ret" => {
            g.buf.ret();
            g.annotate("ret");
            Ok(())
        }
        "syscall" => {
            g.buf.syscall();
            g.annotate("syscall");
            Ok(())
        }
        "mov" if instr.operands.len() == 2 => {
            let reg = parse_reg(&instr.operands[0])
                .ok_or_else(|| n_error(format!("unknown register: {}", instr.operands[0])))?;
            let imm: i64 = instr.operands[1]
                .parse()
                .map_err(|_| n_error(format!("bad immediate: {}", instr.operands[1])))?;
            if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
                g.buf.mov_r64_imm32(reg, imm as i32);
            } else {
                g.buf.mov_r64_imm64(reg, imm as u64);
            }
            g.annotate(format!("mov {reg}, {imm}"));
            Ok(())
        }
        other => {
            g.diag.error(
                format!("unsupported inline assembly instruction: {other}"),
                instr.pos,
            )
        }
    }
}

fn parse_reg(name: &str) -> Option<Reg64> {
    Some(match name {
        "rax" => Reg64::RAX,
        "rcx" => Reg64::RCX,
        "rdx" => Reg64::RDX,
        "rbx" => Reg64::RBX,
        "rsi" => Reg64::RSI,
        "rdi" => Reg64::RDI,
        "r8" => Reg64::R8,
        "r9" => Reg64::R9,
        "r10" => Reg64::R10,
        "r11" => Reg64::R11,
        _ => return None,
    })
}
