//! Expression lowering
//!
//! Every expression leaves its result in `R0` (integers, booleans,
//! pointers, enum values, struct addresses) or `F0` (floats). Struct
//! expressions always yield the address of their storage.

use crate::ast::{CallExpr, CallLang, Expr, IfExpr, InfixOp, MatchExpr, PostfixOp, PrefixOp};
use crate::diag::n_error;
use crate::gen::strings::decode_escapes;
use crate::gen::{stmt, ArgClass, ArithOp, Cond, FReg, Generator, Reg};
use crate::prefs::{Arch, Os};
use crate::types::TypeId;
use crate::Result;

/// Lower one expression.
pub fn expr(g: &mut Generator, e: &Expr) -> Result<()> {
    match e {
        Expr::IntLit { val, .. } => {
            g.mov64(Reg::R0, *val);
            Ok(())
        }
        Expr::FloatLit { val, .. } => g.fmov_bits(val.to_bits()),
        Expr::BoolLit { val, .. } => {
            g.mov(Reg::R0, i32::from(*val));
            Ok(())
        }
        Expr::StrLit { val, is_raw, .. } => {
            let bytes = if *is_raw {
                val.clone().into_bytes()
            } else {
                decode_escapes(val)?
            };
            let (ref_pos, kind) = g.load_str_addr(Reg::R0);
            g.strings.allocate(bytes, ref_pos, kind);
            Ok(())
        }
        Expr::Ident { name, typ, .. } => ident(g, name, *typ),
        Expr::Selector { .. } => selector(g, e),
        Expr::EnumVal {
            enum_name,
            field,
            pos,
            ..
        } => {
            let val = g
                .enum_vals
                .get(enum_name)
                .and_then(|vals| vals.get(field))
                .copied()
                .ok_or_else(|| {
                    n_error(format!(
                        "unknown enum value {enum_name}.{field} at {}:{}",
                        pos.line, pos.col
                    ))
                })?;
            g.mov64(Reg::R0, val);
            Ok(())
        }
        Expr::Infix {
            op, left, right, ..
        } => infix(g, *op, left, right),
        Expr::Prefix {
            op, expr: inner, ..
        } => prefix(g, *op, inner, e.typ()),
        Expr::Postfix {
            op, expr: inner, ..
        } => postfix(g, *op, inner),
        Expr::Call(call) => call_expr(g, call),
        Expr::If(ifx) => if_expr(g, ifx),
        Expr::Match(mx) => match_expr(g, mx),
        Expr::Cast {
            expr: inner, typ, ..
        } => cast(g, inner, *typ),
        Expr::Paren { inner } | Expr::Unsafe { inner } | Expr::Likely { inner } => expr(g, inner),
        Expr::Lock { inner } => {
            g.diag
                .warning("lock ignored: threads are not supported", inner.pos());
            expr(g, inner)
        }
        Expr::StructInit { typ, fields, .. } => struct_init(g, *typ, fields),
    }
}

/// Lower an assignable expression to its address in `R0`.
pub fn expr_addr(g: &mut Generator, e: &Expr) -> Result<()> {
    match e {
        Expr::Ident { name, .. } => {
            let off = g.frame.offset(name)?;
            g.lea_var_to_reg(Reg::R0, off);
            Ok(())
        }
        Expr::Selector {
            expr: base, field, ..
        } => {
            let base_typ = g.table.base_type(base.typ());
            if !g.table.is_struct(base_typ) {
                return Err(n_error(format!(
                    "selector on non-struct at {}:{}",
                    e.pos().line,
                    e.pos().col
                )));
            }
            // Struct expressions yield their address; pointers their value.
            expr(g, base)?;
            let (index, _) = g.table.find_field(base_typ, field)?;
            let off = g.table.field_offset(base_typ, index)?;
            if off != 0 {
                g.mov(Reg::R1, off as i32);
                g.arith(ArithOp::Add);
            }
            Ok(())
        }
        Expr::Prefix {
            op: PrefixOp::Deref,
            expr: inner,
            ..
        } => expr(g, inner),
        Expr::Paren { inner } | Expr::Unsafe { inner } => expr_addr(g, inner),
        _ => Err(n_error(format!(
            "expression has no address at {}:{}",
            e.pos().line,
            e.pos().col
        ))),
    }
}

fn ident(g: &mut Generator, name: &str, typ: TypeId) -> Result<()> {
    let off = g.frame.offset(name)?;
    let base = g.table.base_type(typ);
    if g.table.is_float(typ) {
        let size = g.table.size_of(typ)?;
        return g.fload_var(off, size);
    }
    if g.table.is_struct(base) && !g.table.is_pointer(typ) {
        g.lea_var_to_reg(Reg::R0, off);
        return Ok(());
    }
    if g.table.is_enum(typ) {
        return g.mov_var_to_reg(Reg::R0, off, 4, true);
    }
    let size = g.table.size_of(typ)?;
    let signed = g.table.is_signed(typ);
    g.mov_var_to_reg(Reg::R0, off, size, signed)
}

fn selector(g: &mut Generator, e: &Expr) -> Result<()> {
    let typ = e.typ();
    expr_addr(g, e)?;
    let base = g.table.base_type(typ);
    if g.table.is_struct(base) && !g.table.is_pointer(typ) {
        // Leave the field address for aggregate fields.
        return Ok(());
    }
    if g.table.is_float(typ) {
        let size = g.table.size_of(typ)?;
        if size != 8 {
            return Err(n_error("f32 struct fields are not supported"));
        }
        // Bits travel through the stack into F0.
        g.mov_deref(Reg::R0, 8, false)?;
        g.push(Reg::R0);
        g.pop_sse()?;
        return Ok(());
    }
    let size = g.table.size_of(typ)?;
    let signed = g.table.is_signed(typ) || g.table.is_enum(typ);
    g.mov_deref(Reg::R0, size, signed)
}

fn is_float(g: &Generator, e: &Expr) -> bool {
    g.table.is_float(e.typ())
}

fn infix(g: &mut Generator, op: InfixOp, left: &Expr, right: &Expr) -> Result<()> {
    match op {
        InfixOp::AndAnd | InfixOp::OrOr => return short_circuit(g, op, left, right),
        _ => {}
    }
    if is_float(g, left) || is_float(g, right) {
        return float_infix(g, op, left, right);
    }
    expr(g, left)?;
    g.push(Reg::R0);
    expr(g, right)?;
    g.mov_reg(Reg::R1, Reg::R0);
    g.pop(Reg::R0);
    match op {
        InfixOp::Add => g.arith(ArithOp::Add),
        InfixOp::Sub => g.arith(ArithOp::Sub),
        InfixOp::Mul => g.arith(ArithOp::Mul),
        InfixOp::Div => g.arith(ArithOp::Div),
        InfixOp::Mod => g.arith(ArithOp::Mod),
        InfixOp::BitAnd => g.arith(ArithOp::And),
        InfixOp::BitOr => g.arith(ArithOp::Or),
        InfixOp::BitXor => g.arith(ArithOp::Xor),
        InfixOp::Shl => g.arith(ArithOp::Shl),
        InfixOp::Shr => g.arith(ArithOp::Shr),
        InfixOp::Eq
        | InfixOp::Ne
        | InfixOp::Lt
        | InfixOp::Le
        | InfixOp::Gt
        | InfixOp::Ge => {
            g.cmp_reg(Reg::R0, Reg::R1);
            g.cset(cond_of(op), Reg::R0);
        }
        InfixOp::AndAnd | InfixOp::OrOr => unreachable!(),
    }
    Ok(())
}

fn cond_of(op: InfixOp) -> Cond {
    match op {
        InfixOp::Eq => Cond::Eq,
        InfixOp::Ne => Cond::Ne,
        InfixOp::Lt => Cond::Lt,
        InfixOp::Le => Cond::Le,
        InfixOp::Gt => Cond::Gt,
        InfixOp::Ge => Cond::Ge,
        _ => unreachable!("not a comparison"),
    }
}

fn float_infix(g: &mut Generator, op: InfixOp, left: &Expr, right: &Expr) -> Result<()> {
    expr(g, left)?;
    if !is_float(g, left) {
        g.cvt_int_to_float()?;
    }
    g.fpush()?;
    expr(g, right)?;
    if !is_float(g, right) {
        g.cvt_int_to_float()?;
    }
    g.fmov(FReg::F1, FReg::F0)?;
    g.pop_sse()?;
    match op {
        InfixOp::Add => g.farith(ArithOp::Add),
        InfixOp::Sub => g.farith(ArithOp::Sub),
        InfixOp::Mul => g.farith(ArithOp::Mul),
        InfixOp::Div => g.farith(ArithOp::Div),
        InfixOp::Eq
        | InfixOp::Ne
        | InfixOp::Lt
        | InfixOp::Le
        | InfixOp::Gt
        | InfixOp::Ge => g.fcmp_set(cond_of(op)),
        _ => Err(n_error("invalid float operation")),
    }
}

fn short_circuit(g: &mut Generator, op: InfixOp, left: &Expr, right: &Expr) -> Result<()> {
    let short = g.labels.new_label();
    let end = g.labels.new_label();
    let (short_val, other_cond) = match op {
        InfixOp::AndAnd => (0, Cond::Eq),
        InfixOp::OrOr => (1, Cond::Ne),
        _ => unreachable!(),
    };
    expr(g, left)?;
    g.cmp_reg_imm(Reg::R0, 0);
    g.cjmp(other_cond, short);
    expr(g, right)?;
    g.cmp_reg_imm(Reg::R0, 0);
    g.cjmp(other_cond, short);
    g.mov(Reg::R0, 1 - short_val);
    g.jmp(end);
    g.bind(short);
    g.mov(Reg::R0, short_val);
    g.bind(end);
    Ok(())
}

fn prefix(g: &mut Generator, op: PrefixOp, inner: &Expr, typ: TypeId) -> Result<()> {
    match op {
        PrefixOp::Neg => {
            if g.table.is_float(typ) {
                // 0.0 - x through the float primitives.
                expr(g, inner)?;
                g.fmov(FReg::F1, FReg::F0)?;
                g.fmov_bits(0)?;
                g.farith(ArithOp::Sub)?;
                return Ok(());
            }
            expr(g, inner)?;
            g.neg(Reg::R0);
            Ok(())
        }
        PrefixOp::Not => {
            expr(g, inner)?;
            g.cmp_reg_imm(Reg::R0, 0);
            g.cset(Cond::Eq, Reg::R0);
            Ok(())
        }
        PrefixOp::BitNot => {
            expr(g, inner)?;
            g.bitnot(Reg::R0);
            Ok(())
        }
        PrefixOp::Amp => expr_addr(g, inner),
        PrefixOp::Deref => {
            expr(g, inner)?;
            let size = g.table.size_of(typ)?;
            let signed = g.table.is_signed(typ);
            if g.table.is_struct(g.table.base_type(typ)) {
                return Ok(()); // address is the value for aggregates
            }
            g.mov_deref(Reg::R0, size, signed)
        }
    }
}

fn postfix(g: &mut Generator, op: PostfixOp, inner: &Expr) -> Result<()> {
    let Expr::Ident { name, .. } = inner else {
        return Err(n_error(format!(
            "postfix operator needs an identifier at {}:{}",
            inner.pos().line,
            inner.pos().col
        )));
    };
    let off = g.frame.offset(name)?;
    // The expression value is the identifier before mutation.
    g.mov_var_to_reg(Reg::R0, off, 8, true)?;
    match op {
        PostfixOp::Inc => g.inc_var(off),
        PostfixOp::Dec => g.dec_var(off),
    }
}

fn if_expr(g: &mut Generator, ifx: &IfExpr) -> Result<()> {
    let end = g.labels.new_label();
    for branch in &ifx.branches {
        match &branch.cond {
            Some(cond) => {
                let next = g.labels.new_label();
                expr(g, cond)?;
                g.cmp_reg_imm(Reg::R0, 0);
                g.cjmp(Cond::Eq, next);
                stmt::block(g, &branch.stmts)?;
                g.jmp(end);
                g.bind(next);
            }
            None => {
                stmt::block(g, &branch.stmts)?;
            }
        }
    }
    g.bind(end);
    Ok(())
}

fn match_expr(g: &mut Generator, mx: &MatchExpr) -> Result<()> {
    let typ = mx.cond.typ();
    if g.table.is_float(typ) || g.table.is_struct(g.table.base_type(typ)) {
        return Err(n_error(format!(
            "match on unsupported type at {}:{}",
            mx.pos.line, mx.pos.col
        )));
    }
    expr(g, &mx.cond)?;
    let slot = g.anon_name("match");
    let off = g.frame.allocate(&slot, 8, 8);
    g.mov_reg_to_var(off, 8, Reg::R0)?;

    let end = g.labels.new_label();
    let bodies: Vec<usize> = mx.branches.iter().map(|_| g.labels.new_label()).collect();
    let mut else_body = None;
    for (branch, &body) in mx.branches.iter().zip(&bodies) {
        if branch.exprs.is_empty() {
            else_body = Some(body);
            continue;
        }
        for pattern in &branch.exprs {
            expr(g, pattern)?;
            g.mov_var_to_reg(Reg::R1, off, 8, true)?;
            g.cmp_reg(Reg::R1, Reg::R0);
            g.cjmp(Cond::Eq, body);
        }
    }
    match else_body {
        Some(body) => g.jmp(body),
        None => g.jmp(end),
    }
    for (branch, &body) in mx.branches.iter().zip(&bodies) {
        g.bind(body);
        stmt::block(g, &branch.stmts)?;
        g.jmp(end);
    }
    g.bind(end);
    Ok(())
}

fn cast(g: &mut Generator, inner: &Expr, typ: TypeId) -> Result<()> {
    let from = inner.typ();
    let from_float = g.table.is_float(from);
    let to_float = g.table.is_float(typ);
    expr(g, inner)?;
    match (from_float, to_float) {
        (false, false) => {
            let size = g.table.size_of(typ)?;
            let signed = g.table.is_signed(typ);
            g.cast_reg(Reg::R0, size, signed)
        }
        (false, true) => g.cvt_int_to_float(),
        (true, false) => g.cvt_float_to_int(),
        (true, true) => Ok(()), // width handled at the store/return edge
    }
}

fn struct_init(g: &mut Generator, typ: TypeId, fields: &[(String, Expr)]) -> Result<()> {
    let size = g.table.size_of(typ)?;
    let align = if g.arch == Arch::Arm64 {
        g.table.align_of(typ)?
    } else {
        1
    };
    let slot = g.anon_name("sinit");
    let base_off = g.frame.allocate(&slot, size, align);
    for (name, value) in fields {
        let (index, ftyp) = g.table.find_field(typ, name)?;
        let foff = g.table.field_offset(typ, index)? as i32;
        let fsize = g.table.size_of(ftyp)?;
        let var_off = base_off + foff;
        if g.table.is_struct(g.table.base_type(ftyp)) && !g.table.is_pointer(ftyp) {
            expr(g, value)?;
            g.lea_var_to_reg(Reg::R1, var_off);
            g.copy_mem(Reg::R1, Reg::R0, fsize)?;
        } else if g.table.is_float(ftyp) {
            expr(g, value)?;
            g.fstore_var(var_off, fsize)?;
        } else {
            expr(g, value)?;
            g.mov_reg_to_var(var_off, fsize, Reg::R0)?;
        }
    }
    g.lea_var_to_reg(Reg::R0, base_off);
    Ok(())
}

// ==================== calls ====================

const PRINT_FNS: [&str; 4] = ["println", "print", "eprintln", "eprint"];

fn call_expr(g: &mut Generator, call: &CallExpr) -> Result<()> {
    if call.lang == CallLang::C {
        if call.name == "syscall" {
            return syscall_call(g, call);
        }
        return extern_call(g, call);
    }
    if call.receiver.is_none() {
        if call.name == "exit" {
            let arg = call
                .args
                .first()
                .ok_or_else(|| n_error("exit takes one argument"))?;
            expr(g, arg)?;
            g.gen_exit_reg();
            return Ok(());
        }
        if PRINT_FNS.contains(&call.name.as_str()) {
            return print_call(g, call);
        }
    }
    plain_call(g, call)
}

/// `C.syscall(num, args…)`: arguments go to the host trap convention.
fn syscall_call(g: &mut Generator, call: &CallExpr) -> Result<()> {
    for arg in &call.args {
        if matches!(arg, Expr::StrLit { .. }) {
            g.diag
                .warning("passing a C string literal to syscall", arg.pos());
        }
        expr(g, arg)?;
        g.push(Reg::R0);
    }
    g.gen_syscall(call.args.len())
}

fn extern_call(g: &mut Generator, call: &CallExpr) -> Result<()> {
    if !g.link_object {
        return g.diag.error(
            format!(
                "external call C.{} needs the linker, which is only wired for linux/amd64",
                call.name
            ),
            call.pos,
        );
    }
    let slots = stage_args(g, None, &call.args, None)?;
    assign_args(g, &slots)?;
    g.call_extern(&call.name);
    Ok(())
}

fn print_call(g: &mut Generator, call: &CallExpr) -> Result<()> {
    let newline = call.name.ends_with("ln");
    let fd = if call.name.starts_with('e') { 2 } else { 1 };
    let arg = call
        .args
        .first()
        .ok_or_else(|| n_error(format!("{} takes one argument", call.name)))?;

    if let Expr::StrLit { val, is_raw, .. } = arg {
        let mut bytes = if *is_raw {
            val.clone().into_bytes()
        } else {
            decode_escapes(val)?
        };
        if newline {
            bytes.push(b'\n');
        }
        return g.gen_print_str(bytes, fd);
    }

    let typ = arg.typ();
    if g.table.is_float(typ) {
        return g.diag.error(
            format!("cannot print a float with {}", call.name),
            arg.pos(),
        );
    }
    if typ == crate::types::STRING {
        return g.diag.error(
            "printing string variables is not supported, use a literal",
            arg.pos(),
        );
    }
    if g.table.is_struct(g.table.base_type(typ)) {
        return g
            .diag
            .error(format!("cannot print a struct with {}", call.name), arg.pos());
    }
    expr(g, arg)?;
    if typ == crate::types::BOOL {
        g.gen_print_bool(fd)?;
    } else {
        g.gen_print_int(fd)?;
    }
    if newline {
        g.gen_print_str(b"\n".to_vec(), fd)?;
    }
    Ok(())
}

/// One staged call argument: its class and staging-slot offset.
struct StagedArg {
    class: ArgClass,
    off: i32,
}

/// Evaluate the receiver and arguments left to right into anonymous
/// frame slots. Returns the slots in convention order (hidden return
/// pointer first, then receiver, then arguments).
fn stage_args(
    g: &mut Generator,
    receiver: Option<&Expr>,
    args: &[Expr],
    ret_slot: Option<i32>,
) -> Result<Vec<StagedArg>> {
    let mut slots = Vec::new();
    if let Some(ret_off) = ret_slot {
        let name = g.anon_name("arg");
        let off = g.frame.allocate(&name, 8, 8);
        g.lea_var_to_reg(Reg::R0, ret_off);
        g.mov_reg_to_var(off, 8, Reg::R0)?;
        slots.push(StagedArg {
            class: ArgClass::Int,
            off,
        });
    }
    if let Some(recv) = receiver {
        let name = g.anon_name("arg");
        let off = g.frame.allocate(&name, 8, 8);
        expr(g, recv)?;
        g.mov_reg_to_var(off, 8, Reg::R0)?;
        slots.push(StagedArg {
            class: ArgClass::Int,
            off,
        });
    }
    for arg in args {
        let typ = arg.typ();
        if g.table.is_struct(g.table.base_type(typ)) && !g.table.is_pointer(typ) {
            return Err(n_error(format!(
                "struct arguments are not supported at {}:{}",
                arg.pos().line,
                arg.pos().col
            )));
        }
        let name = g.anon_name("arg");
        let off = g.frame.allocate(&name, 8, 8);
        if g.table.is_float(typ) {
            expr(g, arg)?;
            g.fstore_var(off, 8)?;
            slots.push(StagedArg {
                class: ArgClass::Float,
                off,
            });
        } else {
            expr(g, arg)?;
            g.mov_reg_to_var(off, 8, Reg::R0)?;
            slots.push(StagedArg {
                class: ArgClass::Int,
                off,
            });
        }
    }
    Ok(slots)
}

/// Move staged arguments into convention registers, pushing integer
/// overflow arguments right to left. Returns the stack bytes to free.
fn assign_args(g: &mut Generator, slots: &[StagedArg]) -> Result<u32> {
    let int_regs = match (g.arch, g.os) {
        (Arch::Amd64, Os::Windows) => 4,
        (Arch::Amd64, _) => 6,
        (Arch::Arm64, _) => 8,
    };
    let mut int_index = 0;
    let mut float_index = 0;
    let mut overflow: Vec<i32> = Vec::new();
    let mut assignments: Vec<(usize, ArgClass, i32)> = Vec::new();
    for slot in slots {
        match slot.class {
            ArgClass::Int => {
                if int_index < int_regs {
                    assignments.push((int_index, ArgClass::Int, slot.off));
                    int_index += 1;
                } else {
                    overflow.push(slot.off);
                }
            }
            ArgClass::Float => {
                assignments.push((float_index, ArgClass::Float, slot.off));
                float_index += 1;
            }
        }
    }
    let mut pushed = overflow.len() as u32;
    if pushed % 2 == 1 {
        // Keep the stack 16-aligned across the call.
        g.push(Reg::R3);
        pushed += 1;
    }
    for &off in overflow.iter().rev() {
        g.push_var(off)?;
    }
    for (index, class, off) in assignments {
        g.mov_var_to_call_arg(index, class, off)?;
    }
    Ok(pushed * 8)
}

fn plain_call(g: &mut Generator, call: &CallExpr) -> Result<()> {
    let qualified = match &call.receiver {
        Some(recv) => {
            let base = g.table.base_type(recv.typ());
            format!("{}.{}", g.table.name(base), call.name)
        }
        None if call.name.contains('.') => call.name.clone(),
        None => format!("main.{}", call.name),
    };

    let ret_typ = call.ret_type;
    let ret_size = if ret_typ == crate::types::VOID {
        0
    } else {
        g.table.size_of(ret_typ)?
    };
    let ret_is_struct =
        g.table.is_struct(g.table.base_type(ret_typ)) && !g.table.is_pointer(ret_typ);

    // Returns wider than two registers travel through a hidden pointer.
    let ret_slot = if ret_is_struct && ret_size > 16 {
        let name = g.anon_name("ret");
        Some(g.frame.allocate(&name, ret_size, 8))
    } else {
        None
    };

    let slots = stage_args(g, call.receiver.as_deref(), &call.args, ret_slot)?;
    let freed = assign_args(g, &slots)?;
    g.call_fn(&qualified);
    if freed > 0 {
        g.free_stack(freed);
    }

    if let Some(off) = ret_slot {
        g.lea_var_to_reg(Reg::R0, off);
        return Ok(());
    }
    if ret_is_struct {
        // Pair or single-register returns are normalised back to an
        // address so struct expressions stay uniform.
        let name = g.anon_name("ret");
        let slot_size = if ret_size > 8 { 16 } else { 8 };
        let off = g.frame.allocate(&name, slot_size, 8);
        g.mov_reg_to_var(off, 8, Reg::R0)?;
        if ret_size > 8 {
            g.mov_reg_to_var(off + 8, 8, Reg::R1)?;
        }
        g.lea_var_to_reg(Reg::R0, off);
    }
    Ok(())
}
