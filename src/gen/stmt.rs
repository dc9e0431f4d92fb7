//! Statement lowering
//!
//! Function declarations install a fresh label table and frame; loops
//! push branch-label records for `break`/`continue`; deferred blocks run
//! in reverse declaration order under their guard flags just before the
//! epilogue.

use crate::ast::{
    Assign, AssignOp, BranchKind, Expr, FnDecl, ForCondStmt, ForInStmt, ForStmt, Pos, PrefixOp,
    Stmt,
};
use crate::diag::n_error;
use crate::gen::labels::{BranchLabel, LabelTable};
use crate::gen::{expr, ArgClass, ArithOp, Cond, DeferEntry, FReg, Generator, Reg};
use crate::prefs::Arch;
use crate::types::TypeId;
use crate::Result;

/// Lower a statement list.
pub fn block(g: &mut Generator, stmts: &[Stmt]) -> Result<()> {
    for s in stmts {
        stmt(g, s)?;
    }
    Ok(())
}

pub fn stmt(g: &mut Generator, s: &Stmt) -> Result<()> {
    match s {
        Stmt::Fn(decl) => Err(n_error(format!(
            "nested function declaration at {}:{}",
            decl.pos.line, decl.pos.col
        ))),
        Stmt::Struct(_) | Stmt::Enum(_) | Stmt::Const(_) => Ok(()),
        Stmt::Import { .. } | Stmt::Module { .. } => Ok(()),
        Stmt::Assign(assign) => lower_assign(g, assign),
        Stmt::Block { stmts, .. } => block(g, stmts),
        Stmt::Branch { kind, label, pos } => branch(g, *kind, label.as_deref(), *pos),
        Stmt::Defer { stmts, .. } => defer(g, stmts),
        Stmt::Expr(e) => expr::expr(g, e),
        Stmt::For(f) => for_stmt(g, f),
        Stmt::ForIn(f) => for_in(g, f),
        Stmt::ForCond(f) => for_cond(g, f),
        Stmt::Hash { val, pos } => hash(g, val, *pos),
        Stmt::Asm(asm) => {
            for instr in &asm.instrs {
                g.gen_asm_instr(instr)?;
            }
            Ok(())
        }
        Stmt::Assert { cond, pos } => assert_stmt(g, cond, *pos),
        Stmt::Return { expr: e, pos } => ret(g, e.as_ref(), *pos),
    }
}

// ==================== function declarations ====================

pub fn fn_decl(g: &mut Generator, decl: &FnDecl) -> Result<()> {
    let qualified = decl.qualified_name(g.table);
    let addr = g.buf.pos();
    if g.fn_addr.insert(qualified.clone(), addr).is_some() {
        return Err(n_error(format!("duplicate function: {qualified}")));
    }
    if qualified == "main.main" {
        g.main_fn_addr = Some(addr);
    }

    // Fresh per-function state.
    g.labels = LabelTable::new();
    g.frame.clear();
    g.defers.clear();
    g.fn_name = qualified;
    g.fn_ret_type = decl.ret_type;
    g.ret_label = g.labels.new_label();

    let frame_patch = g.prologue();

    let ret_size = if decl.ret_type == crate::types::VOID {
        0
    } else {
        g.table.size_of(decl.ret_type)?
    };
    let big_ret = g.table.is_struct(g.table.base_type(decl.ret_type)) && ret_size > 16;

    let int_regs = match g.arch {
        Arch::Amd64 if g.os == crate::prefs::Os::Windows => 4,
        Arch::Amd64 => 6,
        Arch::Arm64 => 8,
    };
    let mut int_index = 0;
    let mut float_index = 0;
    let mut stack_index = 0;

    if big_ret {
        let off = g.frame.allocate("_return_val_addr", 8, 8);
        g.mov_arg_to_var(int_index, ArgClass::Int, off, 8)?;
        int_index += 1;
    }
    if let Some(recv) = &decl.receiver {
        let off = g.frame.allocate(&recv.name, 8, 8);
        g.mov_arg_to_var(int_index, ArgClass::Int, off, 8)?;
        int_index += 1;
    }
    for param in &decl.params {
        let typ = param.typ;
        if g.table.is_struct(g.table.base_type(typ)) && !g.table.is_pointer(typ) {
            return Err(n_error(format!(
                "struct parameters are not supported at {}:{}",
                param.pos.line, param.pos.col
            )));
        }
        let size = g.table.size_of(typ)?;
        let align = if g.arch == Arch::Arm64 {
            g.table.align_of(typ)?
        } else {
            1
        };
        let off = g.frame.allocate(&param.name, size, align);
        if g.table.is_float(typ) {
            g.mov_arg_to_var(float_index, ArgClass::Float, off, size)?;
            float_index += 1;
        } else if int_index < int_regs {
            g.mov_arg_to_var(int_index, ArgClass::Int, off, size)?;
            int_index += 1;
        } else {
            g.mov_stack_param_to_var(stack_index, off, size)?;
            stack_index += 1;
        }
    }

    // Defer guards are cleared up front so an epilogue walk never reads
    // an uninitialised flag.
    let defer_count = count_defers(&decl.body);
    for i in 0..defer_count {
        let off = g.frame.allocate(&format!("_defer{i}"), 8, 8);
        g.mov_int_to_var(off, 8, 0)?;
    }

    block(g, &decl.body)?;

    g.bind(g.ret_label);
    let defers = std::mem::take(&mut g.defers);
    for entry in defers.iter().rev() {
        let off = g.frame.offset(&entry.guard)?;
        let skip = g.labels.new_label();
        g.cmp_var(off, 0)?;
        g.cjmp(Cond::Eq, skip);
        block(g, &entry.stmts)?;
        g.bind(skip);
    }
    g.epilogue(frame_patch)?;

    let mut labels = std::mem::take(&mut g.labels);
    let result = labels.patch_all(&mut g.buf);
    g.labels = labels;
    result
}

/// Count the `defer` statements a body can reach, so the prologue can
/// pre-allocate one guard slot per lexical `defer`. `if`/`match` are
/// value-producing expressions here, so any position holding an
/// expression must be walked too.
fn count_defers(stmts: &[Stmt]) -> usize {
    let mut count = 0;
    for s in stmts {
        count += match s {
            Stmt::Defer { .. } => 1,
            Stmt::Block { stmts, .. } => count_defers(stmts),
            Stmt::Assign(a) => count_defers_expr(&a.left) + count_defers_expr(&a.right),
            Stmt::Expr(e) => count_defers_expr(e),
            Stmt::For(f) => {
                f.init.as_deref().map_or(0, |s| count_defers(std::slice::from_ref(s)))
                    + f.cond.as_ref().map_or(0, count_defers_expr)
                    + f.post.as_deref().map_or(0, |s| count_defers(std::slice::from_ref(s)))
                    + count_defers(&f.body)
            }
            Stmt::ForIn(f) => {
                count_defers_expr(&f.low) + count_defers_expr(&f.high) + count_defers(&f.body)
            }
            Stmt::ForCond(f) => {
                f.cond.as_ref().map_or(0, count_defers_expr) + count_defers(&f.body)
            }
            Stmt::Assert { cond, .. } => count_defers_expr(cond),
            Stmt::Return { expr, .. } => expr.as_ref().map_or(0, count_defers_expr),
            _ => 0,
        };
    }
    count
}

fn count_defers_expr(e: &Expr) -> usize {
    match e {
        Expr::If(ifx) => ifx
            .branches
            .iter()
            .map(|b| b.cond.as_ref().map_or(0, count_defers_expr) + count_defers(&b.stmts))
            .sum(),
        Expr::Match(mx) => {
            count_defers_expr(&mx.cond)
                + mx.branches
                    .iter()
                    .map(|b| {
                        b.exprs.iter().map(count_defers_expr).sum::<usize>()
                            + count_defers(&b.stmts)
                    })
                    .sum::<usize>()
        }
        Expr::Infix { left, right, .. } => count_defers_expr(left) + count_defers_expr(right),
        Expr::Prefix { expr, .. } | Expr::Postfix { expr, .. } => count_defers_expr(expr),
        Expr::Selector { expr, .. } | Expr::Cast { expr, .. } => count_defers_expr(expr),
        Expr::Call(call) => {
            call.receiver.as_deref().map_or(0, count_defers_expr)
                + call.args.iter().map(count_defers_expr).sum::<usize>()
        }
        Expr::Paren { inner }
        | Expr::Unsafe { inner }
        | Expr::Likely { inner }
        | Expr::Lock { inner } => count_defers_expr(inner),
        Expr::StructInit { fields, .. } => {
            fields.iter().map(|(_, e)| count_defers_expr(e)).sum()
        }
        _ => 0,
    }
}

fn defer(g: &mut Generator, stmts: &[Stmt]) -> Result<()> {
    let index = g.defers.len();
    let guard = format!("_defer{index}");
    let off = g.frame.offset(&guard)?;
    // Reaching the defer statement arms its guard.
    g.mov_int_to_var(off, 8, 1)?;
    g.defers.push(DeferEntry {
        guard,
        stmts: stmts.to_vec(),
    });
    Ok(())
}

// ==================== assignment ====================

fn lower_assign(g: &mut Generator, assign: &Assign) -> Result<()> {
    match assign.op {
        AssignOp::Decl => decl_assign(g, assign),
        AssignOp::Assign => plain_assign(g, assign),
        _ => compound_assign(g, assign),
    }
}

fn decl_assign(g: &mut Generator, assign: &Assign) -> Result<()> {
    let Expr::Ident { name, typ, .. } = &assign.left else {
        return Err(n_error(format!(
            "declaration target must be an identifier at {}:{}",
            assign.pos.line, assign.pos.col
        )));
    };
    let typ = if *typ == crate::types::VOID {
        assign.right.typ()
    } else {
        *typ
    };
    let size = g.table.size_of(typ)?;
    let align = if g.arch == Arch::Arm64 {
        g.table.align_of(typ)?
    } else {
        1
    };
    if g.table.is_struct(g.table.base_type(typ)) && !g.table.is_pointer(typ) {
        expr::expr(g, &assign.right)?;
        let off = g.frame.allocate(name, size, align);
        g.lea_var_to_reg(Reg::R1, off);
        return g.copy_mem(Reg::R1, Reg::R0, size);
    }
    if g.table.is_float(typ) {
        expr::expr(g, &assign.right)?;
        let off = g.frame.allocate(name, size, align);
        return g.fstore_var(off, size);
    }
    expr::expr(g, &assign.right)?;
    let off = g.frame.allocate(name, size, align);
    g.mov_reg_to_var(off, size, Reg::R0)
}

fn plain_assign(g: &mut Generator, assign: &Assign) -> Result<()> {
    let typ = assign.left.typ();
    match &assign.left {
        Expr::Ident { name, .. } => {
            let off = g.frame.offset(name)?;
            let size = g.table.size_of(typ)?;
            if g.table.is_struct(g.table.base_type(typ)) && !g.table.is_pointer(typ) {
                expr::expr(g, &assign.right)?;
                g.lea_var_to_reg(Reg::R1, off);
                return g.copy_mem(Reg::R1, Reg::R0, size);
            }
            if g.table.is_float(typ) {
                expr::expr(g, &assign.right)?;
                return g.fstore_var(off, size);
            }
            expr::expr(g, &assign.right)?;
            g.mov_reg_to_var(off, size, Reg::R0)
        }
        target @ (Expr::Selector { .. } | Expr::Prefix { op: PrefixOp::Deref, .. }) => {
            let size = g.table.size_of(typ)?;
            expr::expr_addr(g, target)?;
            g.push(Reg::R0);
            expr::expr(g, &assign.right)?;
            if g.table.is_float(typ) {
                // Float bits travel through the integer path for the
                // store through a pointer.
                if size == 4 {
                    g.cvt_f64_to_f32()?;
                }
                g.fpush()?;
                g.pop(Reg::R0);
            }
            g.pop(Reg::R2);
            if g.table.is_struct(g.table.base_type(typ)) && !g.table.is_pointer(typ) {
                return g.copy_mem(Reg::R2, Reg::R0, size);
            }
            g.mov_store(Reg::R2, Reg::R0, size)
        }
        other => Err(n_error(format!(
            "invalid assignment target at {}:{}",
            other.pos().line,
            other.pos().col
        ))),
    }
}

fn compound_assign(g: &mut Generator, assign: &Assign) -> Result<()> {
    let Expr::Ident { name, typ, .. } = &assign.left else {
        return Err(n_error(format!(
            "compound assignment target must be an identifier at {}:{}",
            assign.pos.line, assign.pos.col
        )));
    };
    let op = match assign.op {
        AssignOp::AddAssign => ArithOp::Add,
        AssignOp::SubAssign => ArithOp::Sub,
        AssignOp::MulAssign => ArithOp::Mul,
        AssignOp::DivAssign => ArithOp::Div,
        AssignOp::ModAssign => ArithOp::Mod,
        _ => unreachable!(),
    };
    let off = g.frame.offset(name)?;
    let size = g.table.size_of(*typ)?;
    if g.table.is_float(*typ) {
        g.fload_var(off, size)?;
        g.fpush()?;
        expr::expr(g, &assign.right)?;
        g.fmov(FReg::F1, FReg::F0)?;
        g.pop_sse()?;
        g.farith(op)?;
        return g.fstore_var(off, size);
    }
    let signed = g.table.is_signed(*typ);
    g.mov_var_to_reg(Reg::R0, off, size, signed)?;
    g.push(Reg::R0);
    expr::expr(g, &assign.right)?;
    g.mov_reg(Reg::R1, Reg::R0);
    g.pop(Reg::R0);
    g.arith(op);
    g.mov_reg_to_var(off, size, Reg::R0)
}

// ==================== control flow ====================

fn branch(g: &mut Generator, kind: BranchKind, label: Option<&str>, pos: Pos) -> Result<()> {
    let target = g
        .labels
        .find_branch(label)
        .cloned()
        .ok_or_else(|| {
            n_error(format!(
                "break/continue outside a matching loop at {}:{}",
                pos.line, pos.col
            ))
        })?;
    match kind {
        BranchKind::Break => g.jmp(target.end),
        BranchKind::Continue => g.jmp(target.start),
    }
    Ok(())
}

fn for_stmt(g: &mut Generator, f: &ForStmt) -> Result<()> {
    if let Some(init) = &f.init {
        stmt(g, init)?;
    }
    let cond_label = g.labels.new_label();
    let post_label = g.labels.new_label();
    let end = g.labels.new_label();
    g.labels.branches.push(BranchLabel {
        name: f.label.clone(),
        start: post_label,
        end,
    });
    g.bind(cond_label);
    if let Some(cond) = &f.cond {
        expr::expr(g, cond)?;
        g.cmp_reg_imm(Reg::R0, 0);
        g.cjmp(Cond::Eq, end);
    }
    block(g, &f.body)?;
    g.bind(post_label);
    if let Some(post) = &f.post {
        stmt(g, post)?;
    }
    g.jmp(cond_label);
    g.bind(end);
    g.labels.branches.pop();
    Ok(())
}

fn for_in(g: &mut Generator, f: &ForInStmt) -> Result<()> {
    // Only numeric `lo..hi` ranges are iterable here.
    expr::expr(g, &f.low)?;
    let var_off = g.frame.allocate(&f.var, 8, 8);
    g.mov_reg_to_var(var_off, 8, Reg::R0)?;
    expr::expr(g, &f.high)?;
    let limit = g.anon_name("limit");
    let limit_off = g.frame.allocate(&limit, 8, 8);
    g.mov_reg_to_var(limit_off, 8, Reg::R0)?;

    let cond_label = g.labels.new_label();
    let incr_label = g.labels.new_label();
    let end = g.labels.new_label();
    g.labels.branches.push(BranchLabel {
        name: f.label.clone(),
        start: incr_label,
        end,
    });
    g.bind(cond_label);
    g.mov_var_to_reg(Reg::R0, var_off, 8, true)?;
    g.mov_var_to_reg(Reg::R1, limit_off, 8, true)?;
    g.cmp_reg(Reg::R0, Reg::R1);
    g.cjmp(Cond::Ge, end);
    block(g, &f.body)?;
    g.bind(incr_label);
    g.inc_var(var_off)?;
    g.jmp(cond_label);
    g.bind(end);
    g.labels.branches.pop();
    Ok(())
}

fn for_cond(g: &mut Generator, f: &ForCondStmt) -> Result<()> {
    let start = g.labels.new_label();
    let end = g.labels.new_label();
    g.labels.branches.push(BranchLabel {
        name: f.label.clone(),
        start,
        end,
    });
    g.bind(start);
    if let Some(cond) = &f.cond {
        expr::expr(g, cond)?;
        g.cmp_reg_imm(Reg::R0, 0);
        g.cjmp(Cond::Eq, end);
    }
    block(g, &f.body)?;
    g.jmp(start);
    g.bind(end);
    g.labels.branches.pop();
    Ok(())
}

// ==================== misc statements ====================

/// `#` statement: hex byte tokens injected verbatim into the text
/// section.
fn hash(g: &mut Generator, val: &str, pos: Pos) -> Result<()> {
    let mut bytes = Vec::new();
    for token in val.split([',', ' ']).filter(|t| !t.is_empty()) {
        let digits = token.trim().trim_start_matches("0x").trim_start_matches("0X");
        match u8::from_str_radix(digits, 16) {
            Ok(b) => bytes.push(b),
            Err(_) => {
                return g
                    .diag
                    .error(format!("invalid hex byte in hash statement: {token}"), pos);
            }
        }
    }
    g.buf.emit_bytes(&bytes);
    g.annotate(format!("inline bytes ({})", bytes.len()));
    Ok(())
}

fn assert_stmt(g: &mut Generator, cond: &Expr, pos: Pos) -> Result<()> {
    expr::expr(g, cond)?;
    g.cmp_reg_imm(Reg::R0, 0);
    let ok = g.labels.new_label();
    g.cjmp(Cond::Ne, ok);
    let message = format!("assertion failed at {}:{}\n", pos.line, pos.col);
    g.gen_print_str(message.into_bytes(), 2)?;
    g.mov(Reg::R0, 1);
    g.gen_exit_reg();
    g.bind(ok);
    Ok(())
}

// ==================== return ====================

fn ret(g: &mut Generator, value: Option<&Expr>, pos: Pos) -> Result<()> {
    let ret_label = g.ret_label;
    let Some(value) = value else {
        g.jmp(ret_label);
        return Ok(());
    };
    let declared = g.fn_ret_type;
    if g.table.is_float(declared) {
        expr::expr(g, value)?;
        let declared_size = g.table.size_of(declared)?;
        if declared_size == 4 && matches!(value, Expr::FloatLit { .. }) {
            g.cvt_f64_to_f32()?;
        }
        g.jmp(ret_label);
        return Ok(());
    }
    let base = g.table.base_type(declared);
    if g.table.is_struct(base) && !g.table.is_pointer(declared) {
        return struct_ret(g, value, base, pos);
    }
    expr::expr(g, value)?;
    g.jmp(ret_label);
    Ok(())
}

/// Aggregate return protocol: one register with a size mask up to 8
/// bytes, a register pair up to 16, and the hidden pointer beyond that.
fn struct_ret(g: &mut Generator, value: &Expr, typ: TypeId, _pos: Pos) -> Result<()> {
    let size = g.table.size_of(typ)?;
    expr::expr(g, value)?; // address in R0
    if size <= 8 {
        match size {
            1 | 2 | 4 | 8 => g.mov_deref(Reg::R0, size, false)?,
            _ => {
                g.mov_deref(Reg::R0, 8, false)?;
                let mask = (1u64 << (size * 8)) - 1;
                g.movabs(Reg::R1, mask)?;
                g.bitand_reg(Reg::R0, Reg::R1);
            }
        }
    } else if size <= 16 {
        g.mov_reg(Reg::R1, Reg::R0);
        g.mov_deref(Reg::R0, 8, false)?;
        g.push(Reg::R0);
        g.mov_reg(Reg::R0, Reg::R1);
        g.mov(Reg::R1, 8);
        g.arith(ArithOp::Add);
        let tail = size - 8;
        match tail {
            1 | 2 | 4 | 8 => g.mov_deref(Reg::R0, tail, false)?,
            _ => g.mov_deref(Reg::R0, 8, false)?,
        }
        g.mov_reg(Reg::R1, Reg::R0);
        g.pop(Reg::R0);
    } else {
        let dest_off = g.frame.offset("_return_val_addr")?;
        g.mov_var_to_reg(Reg::R1, dest_off, 8, false)?;
        g.copy_mem(Reg::R1, Reg::R0, size)?;
        g.mov_reg(Reg::R0, Reg::R1);
    }
    g.jmp(g.ret_label);
    Ok(())
}
