//! arm64 backend
//!
//! Implements the generator capability set for AAPCS64 Linux and macOS
//! targets. Floats are deliberately unimplemented here; the generator
//! refuses them before dispatch.

use super::encoding::{self, Condition};
use super::registers::{map, Reg64, ARG_REGS};
use crate::ast::AsmInstr;
use crate::diag::n_error;
use crate::gen::labels::PatchKind;
use crate::gen::strings::RelocKind;
use crate::gen::{ArgClass, ArithOp, CallPatch, Cond, ExternCall, Generator, Reg};
use crate::prefs::Os;
use crate::Result;

/// Syscall numbers for the supported kernels.
pub mod syscall {
    pub const LINUX_WRITE: u16 = 64;
    pub const LINUX_EXIT: u16 = 93;
    // macOS arm64 traps through svc #0x80 with the number in x16.
    pub const MACOS_WRITE: u16 = 4;
    pub const MACOS_EXIT: u16 = 1;
}

fn cond(c: Cond) -> Condition {
    match c {
        Cond::Eq => Condition::Eq,
        Cond::Ne => Condition::Ne,
        Cond::Lt => Condition::Lt,
        Cond::Le => Condition::Le,
        Cond::Gt => Condition::Gt,
        Cond::Ge => Condition::Ge,
    }
}

/// Resolve a frame offset to a base register and an LDUR/STUR range
/// displacement, computing the address into X10 when out of range.
fn var_base(g: &mut Generator, off: i32) -> (Reg64, i32) {
    if (-256..=255).contains(&off) {
        (Reg64::X29, off)
    } else {
        encoding::mov_imm64(&mut g.buf, Reg64::X10, (-off) as u64);
        encoding::sub_x(&mut g.buf, Reg64::X10, Reg64::X29, Reg64::X10);
        g.annotate(format!("sub x10, x29, #{}", -off));
        (Reg64::X10, 0)
    }
}

// ==================== frame ====================

pub fn prologue(g: &mut Generator) -> usize {
    encoding::stp_pre(&mut g.buf, Reg64::X29, Reg64::X30);
    g.annotate("stp x29, x30, [sp, #-16]!");
    encoding::add_imm_x(&mut g.buf, Reg64::X29, Reg64::SP, 0);
    g.annotate("mov x29, sp");
    let patch = encoding::sub_imm_x(&mut g.buf, Reg64::SP, Reg64::SP, 0);
    g.annotate("sub sp, sp, <frame>");
    patch
}

pub fn epilogue(g: &mut Generator, frame_patch: usize) -> Result<()> {
    let frame = g.frame.frame_size();
    if frame > 4095 {
        return Err(n_error("stack frame too large for arm64 reservation"));
    }
    encoding::patch_imm12(&mut g.buf, frame_patch, frame as u16);
    encoding::add_imm_x(&mut g.buf, Reg64::SP, Reg64::X29, 0);
    g.annotate("mov sp, x29");
    encoding::ldp_post(&mut g.buf, Reg64::X29, Reg64::X30);
    g.annotate("ldp x29, x30, [sp], #16");
    encoding::ret(&mut g.buf);
    g.annotate("ret");
    Ok(())
}

// ==================== moves ====================

pub fn mov(g: &mut Generator, reg: Reg, val: i32) {
    let r = map(reg);
    if (0..65536).contains(&val) {
        encoding::movz_x(&mut g.buf, r, val as u16, 0);
    } else {
        encoding::mov_imm64(&mut g.buf, r, val as i64 as u64);
    }
    g.annotate(format!("mov {r}, {val}"));
}

pub fn mov64(g: &mut Generator, reg: Reg, val: i64) {
    let r = map(reg);
    encoding::mov_imm64(&mut g.buf, r, val as u64);
    g.annotate(format!("mov {r}, {val}"));
}

pub fn mov_reg(g: &mut Generator, dst: Reg, src: Reg) {
    let (d, s) = (map(dst), map(src));
    encoding::mov_x(&mut g.buf, d, s);
    g.annotate(format!("mov {d}, {s}"));
}

fn load_sized(g: &mut Generator, dst: Reg64, base: Reg64, disp: i32, size: u32, signed: bool) -> Result<()> {
    match (size, signed) {
        (8, _) => encoding::ldur_x(&mut g.buf, dst, base, disp),
        (4, true) => encoding::ldursw_x(&mut g.buf, dst, base, disp),
        (4, false) => encoding::ldur_w(&mut g.buf, dst, base, disp),
        (2, true) => encoding::ldursh_x(&mut g.buf, dst, base, disp),
        (2, false) => encoding::ldurh_w(&mut g.buf, dst, base, disp),
        (1, true) => encoding::ldursb_x(&mut g.buf, dst, base, disp),
        (1, false) => encoding::ldurb_w(&mut g.buf, dst, base, disp),
        _ => return Err(n_error(format!("unsupported load width: {size}"))),
    }
    Ok(())
}

fn store_sized(g: &mut Generator, src: Reg64, base: Reg64, disp: i32, size: u32) -> Result<()> {
    match size {
        8 => encoding::stur_x(&mut g.buf, src, base, disp),
        4 => encoding::stur_w(&mut g.buf, src, base, disp),
        2 => encoding::sturh_w(&mut g.buf, src, base, disp),
        1 => encoding::sturb_w(&mut g.buf, src, base, disp),
        _ => return Err(n_error(format!("unsupported store width: {size}"))),
    }
    Ok(())
}

pub fn mov_var_to_reg(g: &mut Generator, reg: Reg, off: i32, size: u32, signed: bool) -> Result<()> {
    let r = map(reg);
    let (base, disp) = var_base(g, off);
    load_sized(g, r, base, disp, size, signed)?;
    g.annotate(format!("ldr {r}, [x29, #{off}] ({size}b)"));
    Ok(())
}

pub fn mov_reg_to_var(g: &mut Generator, off: i32, size: u32, reg: Reg) -> Result<()> {
    let r = map(reg);
    let (base, disp) = var_base(g, off);
    store_sized(g, r, base, disp, size)?;
    g.annotate(format!("str {r}, [x29, #{off}] ({size}b)"));
    Ok(())
}

pub fn mov_int_to_var(g: &mut Generator, off: i32, size: u32, val: i64) -> Result<()> {
    mov64(g, Reg::R3, val);
    mov_reg_to_var(g, off, size, Reg::R3)
}

pub fn lea_var_to_reg(g: &mut Generator, reg: Reg, off: i32) {
    let r = map(reg);
    let dist = -off;
    if (0..=4095).contains(&dist) {
        encoding::sub_imm_x(&mut g.buf, r, Reg64::X29, dist as u16);
    } else {
        encoding::mov_imm64(&mut g.buf, Reg64::X10, dist as u64);
        encoding::sub_x(&mut g.buf, r, Reg64::X29, Reg64::X10);
    }
    g.annotate(format!("sub {r}, x29, #{dist}"));
}

pub fn mov_deref(g: &mut Generator, reg: Reg, size: u32, signed: bool) -> Result<()> {
    let r = map(reg);
    load_sized(g, r, r, 0, size, signed)?;
    g.annotate(format!("ldr {r}, [{r}] ({size}b)"));
    Ok(())
}

pub fn mov_store(g: &mut Generator, addr: Reg, val: Reg, size: u32) -> Result<()> {
    let (a, v) = (map(addr), map(val));
    store_sized(g, v, a, 0, size)?;
    g.annotate(format!("str {v}, [{a}] ({size}b)"));
    Ok(())
}

pub fn load_str_addr(g: &mut Generator, reg: Reg) -> (usize, RelocKind) {
    let r = map(reg);
    let pos = encoding::adr(&mut g.buf, r);
    g.annotate(format!("adr {r}, <str>"));
    (pos, RelocKind::Adr21)
}

// ==================== compare and branch ====================

pub fn cmp_reg(g: &mut Generator, left: Reg, right: Reg) {
    let (l, r) = (map(left), map(right));
    encoding::cmp_x(&mut g.buf, l, r);
    g.annotate(format!("cmp {l}, {r}"));
}

pub fn cmp_reg_imm(g: &mut Generator, reg: Reg, imm: i32) {
    let r = map(reg);
    if (0..=4095).contains(&imm) {
        encoding::cmp_imm_x(&mut g.buf, r, imm as u16);
    } else {
        encoding::mov_imm64(&mut g.buf, Reg64::X11, imm as i64 as u64);
        encoding::cmp_x(&mut g.buf, r, Reg64::X11);
    }
    g.annotate(format!("cmp {r}, {imm}"));
}

pub fn cmp_var(g: &mut Generator, off: i32, imm: i32) -> Result<()> {
    let (base, disp) = var_base(g, off);
    encoding::ldur_x(&mut g.buf, Reg64::X11, base, disp);
    if (0..=4095).contains(&imm) {
        encoding::cmp_imm_x(&mut g.buf, Reg64::X11, imm as u16);
    } else {
        encoding::mov_imm64(&mut g.buf, Reg64::X12, imm as i64 as u64);
        encoding::cmp_x(&mut g.buf, Reg64::X11, Reg64::X12);
    }
    g.annotate(format!("cmp [x29, #{off}], {imm}"));
    Ok(())
}

pub fn cset(g: &mut Generator, c: Cond, reg: Reg) {
    let r = map(reg);
    encoding::cset_x(&mut g.buf, r, cond(c));
    g.annotate(format!("cset {r}, {c:?}").to_lowercase());
}

pub fn jmp(g: &mut Generator, label: usize) {
    let pos = encoding::b(&mut g.buf);
    g.labels.add_patch(label, pos, PatchKind::Branch26);
    g.annotate(format!("b .L{label}"));
}

pub fn cjmp(g: &mut Generator, c: Cond, label: usize) {
    let pos = encoding::b_cond(&mut g.buf, cond(c));
    g.labels.add_patch(label, pos, PatchKind::Branch19);
    g.annotate(format!("b.{c:?} .L{label}").to_lowercase());
}

// ==================== calls ====================

pub fn call_fn(g: &mut Generator, name: &str) {
    let pos = encoding::bl(&mut g.buf);
    g.call_patches.push(CallPatch {
        pos,
        name: name.to_string(),
        kind: PatchKind::Branch26,
    });
    g.annotate(format!("bl {name}"));
}

pub fn call_extern(g: &mut Generator, name: &str) {
    let pos = encoding::bl(&mut g.buf);
    g.extern_calls.push(ExternCall {
        pos,
        name: name.to_string(),
    });
    g.annotate(format!("bl {name} (extern)"));
}

pub fn mov_arg_to_var(
    g: &mut Generator,
    index: usize,
    class: ArgClass,
    off: i32,
    size: u32,
) -> Result<()> {
    if class == ArgClass::Float {
        return Err(n_error("float parameters are not implemented on arm64"));
    }
    let src = *ARG_REGS
        .get(index)
        .ok_or_else(|| n_error("argument register index out of range"))?;
    let (base, disp) = var_base(g, off);
    store_sized(g, src, base, disp, size)?;
    g.annotate(format!("str {src}, [x29, #{off}] (arg {index})"));
    Ok(())
}

pub fn mov_var_to_call_arg(g: &mut Generator, index: usize, class: ArgClass, off: i32) -> Result<()> {
    if class == ArgClass::Float {
        return Err(n_error("float arguments are not implemented on arm64"));
    }
    let dst = *ARG_REGS
        .get(index)
        .ok_or_else(|| n_error("too many register arguments"))?;
    let (base, disp) = var_base(g, off);
    encoding::ldur_x(&mut g.buf, dst, base, disp);
    g.annotate(format!("ldr {dst}, [x29, #{off}] (arg {index})"));
    Ok(())
}

pub fn free_stack(g: &mut Generator, bytes: u32) {
    encoding::add_imm_x(&mut g.buf, Reg64::SP, Reg64::SP, bytes as u16);
    g.annotate(format!("add sp, sp, #{bytes}"));
}

// ==================== arithmetic ====================

pub fn arith(g: &mut Generator, op: ArithOp) {
    let (x0, x1, x2) = (Reg64::X0, Reg64::X1, Reg64::X2);
    match op {
        ArithOp::Add => {
            encoding::add_x(&mut g.buf, x0, x0, x1);
            g.annotate("add x0, x0, x1");
        }
        ArithOp::Sub => {
            encoding::sub_x(&mut g.buf, x0, x0, x1);
            g.annotate("sub x0, x0, x1");
        }
        ArithOp::Mul => {
            encoding::mul_x(&mut g.buf, x0, x0, x1);
            g.annotate("mul x0, x0, x1");
        }
        ArithOp::Div => {
            encoding::sdiv_x(&mut g.buf, x0, x0, x1);
            g.annotate("sdiv x0, x0, x1");
        }
        ArithOp::Mod => {
            encoding::sdiv_x(&mut g.buf, x2, x0, x1);
            encoding::msub_x(&mut g.buf, x0, x2, x1, x0);
            g.annotate("sdiv+msub (mod)");
        }
        ArithOp::And => {
            encoding::and_x(&mut g.buf, x0, x0, x1);
            g.annotate("and x0, x0, x1");
        }
        ArithOp::Or => {
            encoding::orr_x(&mut g.buf, x0, x0, x1);
            g.annotate("orr x0, x0, x1");
        }
        ArithOp::Xor => {
            encoding::eor_x(&mut g.buf, x0, x0, x1);
            g.annotate("eor x0, x0, x1");
        }
        ArithOp::Shl => {
            encoding::lslv_x(&mut g.buf, x0, x0, x1);
            g.annotate("lsl x0, x0, x1");
        }
        ArithOp::Shr => {
            encoding::asrv_x(&mut g.buf, x0, x0, x1);
            g.annotate("asr x0, x0, x1");
        }
    }
}

pub fn bitand_reg(g: &mut Generator, dst: Reg, src: Reg) {
    let (d, s) = (map(dst), map(src));
    encoding::and_x(&mut g.buf, d, d, s);
    g.annotate(format!("and {d}, {d}, {s}"));
}

pub fn neg(g: &mut Generator, reg: Reg) {
    let r = map(reg);
    encoding::neg_x(&mut g.buf, r, r);
    g.annotate(format!("neg {r}, {r}"));
}

pub fn bitnot(g: &mut Generator, reg: Reg) {
    let r = map(reg);
    encoding::mvn_x(&mut g.buf, r, r);
    g.annotate(format!("mvn {r}, {r}"));
}

pub fn push(g: &mut Generator, reg: Reg) {
    let r = map(reg);
    encoding::push_x(&mut g.buf, r);
    g.annotate(format!("str {r}, [sp, #-16]!"));
}

pub fn pop(g: &mut Generator, reg: Reg) {
    let r = map(reg);
    encoding::pop_x(&mut g.buf, r);
    g.annotate(format!("ldr {r}, [sp], #16"));
}

pub fn inc_var(g: &mut Generator, off: i32) -> Result<()> {
    let (base, disp) = var_base(g, off);
    encoding::ldur_x(&mut g.buf, Reg64::X11, base, disp);
    encoding::add_imm_x(&mut g.buf, Reg64::X11, Reg64::X11, 1);
    encoding::stur_x(&mut g.buf, Reg64::X11, base, disp);
    g.annotate(format!("inc [x29, #{off}]"));
    Ok(())
}

pub fn dec_var(g: &mut Generator, off: i32) -> Result<()> {
    let (base, disp) = var_base(g, off);
    encoding::ldur_x(&mut g.buf, Reg64::X11, base, disp);
    emit_sub1(g, Reg64::X11);
    encoding::stur_x(&mut g.buf, Reg64::X11, base, disp);
    g.annotate(format!("dec [x29, #{off}]"));
    Ok(())
}

fn emit_sub1(g: &mut Generator, reg: Reg64) {
    encoding::sub_imm_x(&mut g.buf, reg, reg, 1);
}

pub fn cast_reg(g: &mut Generator, reg: Reg, size: u32, signed: bool) -> Result<()> {
    let r = map(reg);
    match (size, signed) {
        (8, _) => return Ok(()),
        (4, true) => encoding::sxtw_x(&mut g.buf, r, r),
        (4, false) => encoding::mov_w(&mut g.buf, r, r),
        (2, true) => encoding::sxth_x(&mut g.buf, r, r),
        (2, false) => encoding::uxth_x(&mut g.buf, r, r),
        (1, true) => encoding::sxtb_x(&mut g.buf, r, r),
        (1, false) => encoding::uxtb_x(&mut g.buf, r, r),
        _ => return Err(n_error(format!("unsupported cast width: {size}"))),
    }
    g.annotate(format!("cast {r} to {size}b"));
    Ok(())
}

pub fn copy_mem(g: &mut Generator, dst: Reg, src: Reg, size: u32) -> Result<()> {
    let (d, s) = (map(dst), map(src));
    let tmp = Reg64::X11;
    let mut off = 0u32;
    let mut left = size;
    while left >= 8 {
        encoding::ldr_x_imm(&mut g.buf, tmp, s, (off / 8) as u16);
        encoding::str_x_imm(&mut g.buf, tmp, d, (off / 8) as u16);
        off += 8;
        left -= 8;
    }
    // Tail bytes go through the unscaled forms, which cap the offset.
    if left > 0 && off > 248 {
        return Err(n_error("struct copy tail out of range on arm64"));
    }
    let mut off = off as i32;
    if left >= 4 {
        encoding::ldur_w(&mut g.buf, tmp, s, off);
        encoding::stur_w(&mut g.buf, tmp, d, off);
        off += 4;
        left -= 4;
    }
    if left >= 2 {
        encoding::ldurh_w(&mut g.buf, tmp, s, off);
        encoding::sturh_w(&mut g.buf, tmp, d, off);
        off += 2;
        left -= 2;
    }
    if left >= 1 {
        encoding::ldurb_w(&mut g.buf, tmp, s, off);
        encoding::sturb_w(&mut g.buf, tmp, d, off);
    }
    g.annotate(format!("copy {size}b [{s}] -> [{d}]"));
    Ok(())
}

// ==================== system ====================

/// Registers for the `C.syscall` special form, number first.
fn syscall_regs(os: Os) -> [Reg64; 4] {
    match os {
        Os::Macos => [Reg64::X16, Reg64::X0, Reg64::X1, Reg64::X2],
        _ => [Reg64::X8, Reg64::X0, Reg64::X1, Reg64::X2],
    }
}

fn svc_imm(os: Os) -> u16 {
    if os == Os::Macos {
        0x80
    } else {
        0
    }
}

pub fn gen_syscall(g: &mut Generator, nargs: usize) -> Result<()> {
    let regs = syscall_regs(g.os);
    if nargs > regs.len() {
        return Err(n_error(format!(
            "too many syscall arguments: {nargs} (max {})",
            regs.len()
        )));
    }
    for i in (0..nargs).rev() {
        encoding::pop_x(&mut g.buf, regs[i]);
        g.annotate(format!("ldr {}, [sp], #16", regs[i]));
    }
    encoding::svc(&mut g.buf, svc_imm(g.os));
    g.annotate("svc");
    Ok(())
}

pub fn gen_exit_reg(g: &mut Generator) {
    let num = if g.os == Os::Macos {
        syscall::MACOS_EXIT
    } else {
        syscall::LINUX_EXIT
    };
    let reg = syscall_regs(g.os)[0];
    encoding::movz_x(&mut g.buf, reg, num, 0);
    g.annotate(format!("mov {reg}, #{num} (exit)"));
    encoding::svc(&mut g.buf, svc_imm(g.os));
    g.annotate("svc");
}

pub fn gen_start_stub(g: &mut Generator) {
    call_fn(g, "main.main");
    encoding::movz_x(&mut g.buf, Reg64::X0, 0, 0);
    g.annotate("mov x0, #0");
    gen_exit_reg(g);
}

// ==================== print family ====================

fn emit_str_ref(g: &mut Generator, bytes: Vec<u8>, reg: Reg64) {
    let pos = encoding::adr(&mut g.buf, reg);
    g.annotate(format!("adr {reg}, <str>"));
    g.strings.allocate(bytes, pos, RelocKind::Adr21);
}

fn write_call(g: &mut Generator, fd: u32) {
    // Buffer pointer in x1 and length in x2 are already in place.
    encoding::movz_x(&mut g.buf, Reg64::X0, fd as u16, 0);
    g.annotate(format!("mov x0, #{fd}"));
    let (reg, num) = if g.os == Os::Macos {
        (Reg64::X16, syscall::MACOS_WRITE)
    } else {
        (Reg64::X8, syscall::LINUX_WRITE)
    };
    encoding::movz_x(&mut g.buf, reg, num, 0);
    g.annotate(format!("mov {reg}, #{num} (write)"));
    encoding::svc(&mut g.buf, svc_imm(g.os));
    g.annotate("svc");
}

pub fn gen_print_str(g: &mut Generator, bytes: Vec<u8>, fd: u32) -> Result<()> {
    let len = bytes.len();
    emit_str_ref(g, bytes, Reg64::X1);
    encoding::mov_imm64(&mut g.buf, Reg64::X2, len as u64);
    g.annotate(format!("mov x2, #{len}"));
    write_call(g, fd);
    Ok(())
}

pub fn gen_print_int(g: &mut Generator, fd: u32) -> Result<()> {
    g.builtins.register("int_to_string");
    encoding::sub_imm_x(&mut g.buf, Reg64::SP, Reg64::SP, 48);
    g.annotate("sub sp, sp, #48 (itoa buffer)");
    encoding::add_imm_x(&mut g.buf, Reg64::X1, Reg64::SP, 0);
    g.annotate("mov x1, sp");
    call_fn(g, "int_to_string");
    encoding::mov_x(&mut g.buf, Reg64::X2, Reg64::X1);
    g.annotate("mov x2, x1 (len)");
    encoding::mov_x(&mut g.buf, Reg64::X1, Reg64::X0);
    g.annotate("mov x1, x0 (buf)");
    write_call(g, fd);
    encoding::add_imm_x(&mut g.buf, Reg64::SP, Reg64::SP, 48);
    g.annotate("add sp, sp, #48");
    Ok(())
}

pub fn gen_print_bool(g: &mut Generator, fd: u32) -> Result<()> {
    g.builtins.register("bool_to_string");
    call_fn(g, "bool_to_string");
    encoding::mov_x(&mut g.buf, Reg64::X2, Reg64::X1);
    g.annotate("mov x2, x1 (len)");
    encoding::mov_x(&mut g.buf, Reg64::X1, Reg64::X0);
    g.annotate("mov x1, x0 (buf)");
    write_call(g, fd);
    Ok(())
}

// ==================== builtin bodies ====================

pub fn emit_builtin(g: &mut Generator, name: &str) -> Result<()> {
    match name {
        "int_to_string" => emit_int_to_string(g),
        "bool_to_string" => emit_bool_to_string(g),
        other => Err(n_error(format!("unknown builtin: {other}"))),
    }
}

/// x0 = value, x1 = 32-byte buffer. Returns x0 = first char, x1 = length.
fn emit_int_to_string(g: &mut Generator) -> Result<()> {
    let skip_neg = g.labels.new_label();
    let conv = g.labels.new_label();
    let done = g.labels.new_label();

    encoding::mov_x(&mut g.buf, Reg64::X2, Reg64::X0);
    g.annotate("mov x2, x0");
    encoding::add_imm_x(&mut g.buf, Reg64::X3, Reg64::X1, 31);
    g.annotate("add x3, x1, #31");
    encoding::movz_x(&mut g.buf, Reg64::X4, 10, 0);
    g.annotate("mov x4, #10");
    encoding::movz_x(&mut g.buf, Reg64::X5, 0, 0);
    g.annotate("mov x5, #0 (sign)");
    encoding::cmp_imm_x(&mut g.buf, Reg64::X2, 0);
    g.annotate("cmp x2, #0");
    cjmp(g, Cond::Ge, skip_neg);
    encoding::neg_x(&mut g.buf, Reg64::X2, Reg64::X2);
    g.annotate("neg x2, x2");
    encoding::movz_x(&mut g.buf, Reg64::X5, 1, 0);
    g.annotate("mov x5, #1");
    g.bind(skip_neg);

    g.bind(conv);
    encoding::udiv_x(&mut g.buf, Reg64::X6, Reg64::X2, Reg64::X4);
    g.annotate("udiv x6, x2, x4");
    encoding::msub_x(&mut g.buf, Reg64::X7, Reg64::X6, Reg64::X4, Reg64::X2);
    g.annotate("msub x7, x6, x4, x2");
    encoding::add_imm_x(&mut g.buf, Reg64::X7, Reg64::X7, u16::from(b'0'));
    g.annotate("add x7, x7, #'0'");
    encoding::sturb_w(&mut g.buf, Reg64::X7, Reg64::X3, 0);
    g.annotate("sturb w7, [x3]");
    encoding::sub_imm_x(&mut g.buf, Reg64::X3, Reg64::X3, 1);
    g.annotate("sub x3, x3, #1");
    encoding::mov_x(&mut g.buf, Reg64::X2, Reg64::X6);
    g.annotate("mov x2, x6");
    encoding::cmp_imm_x(&mut g.buf, Reg64::X2, 0);
    g.annotate("cmp x2, #0");
    cjmp(g, Cond::Ne, conv);

    encoding::cmp_imm_x(&mut g.buf, Reg64::X5, 0);
    g.annotate("cmp x5, #0");
    cjmp(g, Cond::Eq, done);
    encoding::movz_x(&mut g.buf, Reg64::X7, u16::from(b'-'), 0);
    g.annotate("mov x7, #'-'");
    encoding::sturb_w(&mut g.buf, Reg64::X7, Reg64::X3, 0);
    g.annotate("sturb w7, [x3]");
    encoding::sub_imm_x(&mut g.buf, Reg64::X3, Reg64::X3, 1);
    g.annotate("sub x3, x3, #1");
    g.bind(done);

    encoding::add_imm_x(&mut g.buf, Reg64::X0, Reg64::X3, 1);
    g.annotate("add x0, x3, #1");
    encoding::add_imm_x(&mut g.buf, Reg64::X1, Reg64::X1, 31);
    g.annotate("add x1, x1, #31");
    encoding::sub_x(&mut g.buf, Reg64::X1, Reg64::X1, Reg64::X3);
    g.annotate("sub x1, x1, x3");
    encoding::ret(&mut g.buf);
    g.annotate("ret");
    Ok(())
}

/// x0 = value. Returns x0 = pooled "true"/"false", x1 = length.
fn emit_bool_to_string(g: &mut Generator) -> Result<()> {
    let to_false = g.labels.new_label();
    encoding::cmp_imm_x(&mut g.buf, Reg64::X0, 0);
    g.annotate("cmp x0, #0");
    cjmp(g, Cond::Eq, to_false);
    emit_str_ref(g, b"true".to_vec(), Reg64::X0);
    encoding::movz_x(&mut g.buf, Reg64::X1, 4, 0);
    g.annotate("mov x1, #4");
    encoding::ret(&mut g.buf);
    g.annotate("ret");
    g.bind(to_false);
    emit_str_ref(g, b"false".to_vec(), Reg64::X0);
    encoding::movz_x(&mut g.buf, Reg64::X1, 5, 0);
    g.annotate("mov x1, #5");
    encoding::ret(&mut g.buf);
    g.annotate("ret");
    Ok(())
}

// ==================== inline assembly subset ====================

pub fn gen_asm_instr(g: &mut Generator, instr: &AsmInstr) -> Result<()> {
    match instr.mnemonic.as_str() {
        "nop" => {
            encoding::nop(&mut g.buf);
            g.annotate("nop");
            Ok(())
        }
        "ret" => {
            encoding::ret(&mut g.buf);
            g.annotate("ret");
            Ok(())
        }
        "svc" => {
            let imm: u16 = instr
                .operands
                .first()
                .and_then(|s| s.trim_start_matches("#").parse().ok())
                .unwrap_or(0);
            encoding::svc(&mut g.buf, imm);
            g.annotate(format!("svc #{imm}"));
            Ok(())
        }
        "mov" if instr.operands.len() == 2 => {
            let reg = parse_reg(&instr.operands[0])
                .ok_or_else(|| n_error(format!("unknown register: {}", instr.operands[0])))?;
            let imm: i64 = instr.operands[1]
                .trim_start_matches('#')
                .parse()
                .map_err(|_| n_error(format!("bad immediate: {}", instr.operands[1])))?;
            encoding::mov_imm64(&mut g.buf, reg, imm as u64);
            g.annotate(format!("mov {reg}, #{imm}"));
            Ok(())
        }
        other => g.diag.error(
            format!("unsupported inline assembly instruction: {other}"),
            instr.pos,
        ),
    }
}

fn parse_reg(name: &str) -> Option<Reg64> {
    let n: u8 = name.strip_prefix('x')?.parse().ok()?;
    if n <= 15 {
        // Safe: Reg64 is repr(u8) over 0..=31.
        Some(unsafe { std::mem::transmute::<u8, Reg64>(n) })
    } else {
        None
    }
}
