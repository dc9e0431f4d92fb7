//! Input AST
//!
//! The generator consumes an already-resolved tree: the upstream frontend
//! has lexed, parsed and typechecked it, folded constants, and resolved
//! compile-time `if` branches. Every expression carries the `TypeId` the
//! checker assigned to it. Nothing in here is produced by this crate.

use crate::types::TypeId;

/// Source position, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: usize,
    pub col: usize,
}

impl Pos {
    pub fn new(line: usize, col: usize) -> Self {
        Self { line, col }
    }
}

/// One parsed source file.
#[derive(Debug, Clone)]
pub struct File {
    pub path: String,
    /// Module the file belongs to; plain functions qualify as
    /// `<module>.<name>`.
    pub module: String,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Fn(FnDecl),
    Struct(StructDecl),
    Enum(EnumDecl),
    /// Constants are folded upstream; the declaration is a no-op here.
    Const(ConstDecl),
    Assign(Assign),
    Block {
        stmts: Vec<Stmt>,
        pos: Pos,
    },
    /// `break` / `continue`, optionally targeting a labelled loop.
    Branch {
        kind: BranchKind,
        label: Option<String>,
        pos: Pos,
    },
    Defer {
        stmts: Vec<Stmt>,
        pos: Pos,
    },
    Expr(Expr),
    /// C-style `for init; cond; post { .. }`.
    For(ForStmt),
    /// Range form `for i in lo..hi { .. }` (numeric ranges only).
    ForIn(ForInStmt),
    /// Bare or condition-only `for`.
    ForCond(ForCondStmt),
    /// Literal byte sequence injected verbatim into the text section.
    Hash {
        val: String,
        pos: Pos,
    },
    Asm(AsmStmt),
    Assert {
        cond: Expr,
        pos: Pos,
    },
    Import {
        module: String,
        pos: Pos,
    },
    Module {
        name: String,
        pos: Pos,
    },
    Return {
        expr: Option<Expr>,
        pos: Pos,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Break,
    Continue,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub typ: TypeId,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct FnDecl {
    pub name: String,
    pub module: String,
    /// Method receiver; qualifies the name as `<receiver-type>.<name>`.
    pub receiver: Option<Param>,
    pub params: Vec<Param>,
    /// `types::VOID` when the function returns nothing.
    pub ret_type: TypeId,
    pub body: Vec<Stmt>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct StructDecl {
    pub name: String,
    pub typ: TypeId,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct EnumField {
    pub name: String,
    /// Explicit value, already folded by the constant evaluator.
    pub value: Option<i64>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct EnumDecl {
    pub name: String,
    /// Flag enums count 1, 2, 4, …; plain enums 0, 1, 2, ….
    pub is_flag: bool,
    pub fields: Vec<EnumField>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct ConstDecl {
    pub name: String,
    pub pos: Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `:=` declaration.
    Decl,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
}

#[derive(Debug, Clone)]
pub struct Assign {
    pub op: AssignOp,
    /// Identifier, selector or dereference.
    pub left: Expr,
    pub right: Expr,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct ForStmt {
    pub init: Option<Box<Stmt>>,
    pub cond: Option<Expr>,
    pub post: Option<Box<Stmt>>,
    pub body: Vec<Stmt>,
    pub label: Option<String>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct ForInStmt {
    pub var: String,
    pub low: Expr,
    pub high: Expr,
    pub body: Vec<Stmt>,
    pub label: Option<String>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct ForCondStmt {
    pub cond: Option<Expr>,
    pub body: Vec<Stmt>,
    pub label: Option<String>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct AsmInstr {
    pub mnemonic: String,
    pub operands: Vec<String>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct AsmStmt {
    pub instrs: Vec<AsmInstr>,
    pub pos: Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    /// Arithmetic negation.
    Neg,
    /// Logical not.
    Not,
    /// Bitwise not.
    BitNot,
    /// Address of a local.
    Amp,
    /// Pointer dereference.
    Deref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostfixOp {
    Inc,
    Dec,
}

/// Which namespace a call resolves in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallLang {
    Tern,
    /// `C.name(..)`: an external symbol, or the `C.syscall` special form.
    C,
}

#[derive(Debug, Clone)]
pub struct CallExpr {
    pub name: String,
    pub lang: CallLang,
    /// Receiver expression for method calls.
    pub receiver: Option<Box<Expr>>,
    pub args: Vec<Expr>,
    pub ret_type: TypeId,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct IfBranch {
    /// `None` for the trailing `else`.
    pub cond: Option<Expr>,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct IfExpr {
    pub branches: Vec<IfBranch>,
    pub typ: TypeId,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct MatchBranch {
    /// Literal or enum-value patterns; empty for the `else` arm.
    pub exprs: Vec<Expr>,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct MatchExpr {
    pub cond: Box<Expr>,
    pub branches: Vec<MatchBranch>,
    pub typ: TypeId,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub enum Expr {
    IntLit {
        val: i64,
        typ: TypeId,
        pos: Pos,
    },
    FloatLit {
        val: f64,
        typ: TypeId,
        pos: Pos,
    },
    BoolLit {
        val: bool,
        pos: Pos,
    },
    StrLit {
        val: String,
        /// Raw literals bypass escape decoding.
        is_raw: bool,
        pos: Pos,
    },
    Ident {
        name: String,
        typ: TypeId,
        pos: Pos,
    },
    /// Field access `base.field`.
    Selector {
        expr: Box<Expr>,
        field: String,
        typ: TypeId,
        pos: Pos,
    },
    /// Enum value `Color.red`.
    EnumVal {
        enum_name: String,
        field: String,
        typ: TypeId,
        pos: Pos,
    },
    Infix {
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
        typ: TypeId,
        pos: Pos,
    },
    Prefix {
        op: PrefixOp,
        expr: Box<Expr>,
        typ: TypeId,
        pos: Pos,
    },
    Postfix {
        op: PostfixOp,
        expr: Box<Expr>,
        pos: Pos,
    },
    Call(CallExpr),
    If(IfExpr),
    Match(MatchExpr),
    Cast {
        expr: Box<Expr>,
        typ: TypeId,
        pos: Pos,
    },
    Paren {
        inner: Box<Expr>,
    },
    Unsafe {
        inner: Box<Expr>,
    },
    Likely {
        inner: Box<Expr>,
    },
    Lock {
        inner: Box<Expr>,
    },
    StructInit {
        typ: TypeId,
        fields: Vec<(String, Expr)>,
        pos: Pos,
    },
}

impl Expr {
    pub fn pos(&self) -> Pos {
        match self {
            Expr::IntLit { pos, .. }
            | Expr::FloatLit { pos, .. }
            | Expr::BoolLit { pos, .. }
            | Expr::StrLit { pos, .. }
            | Expr::Ident { pos, .. }
            | Expr::Selector { pos, .. }
            | Expr::EnumVal { pos, .. }
            | Expr::Infix { pos, .. }
            | Expr::Prefix { pos, .. }
            | Expr::Postfix { pos, .. }
            | Expr::Cast { pos, .. }
            | Expr::StructInit { pos, .. } => *pos,
            Expr::Call(call) => call.pos,
            Expr::If(ifx) => ifx.pos,
            Expr::Match(mx) => mx.pos,
            Expr::Paren { inner }
            | Expr::Unsafe { inner }
            | Expr::Likely { inner }
            | Expr::Lock { inner } => inner.pos(),
        }
    }

    /// The type the checker resolved for this expression.
    pub fn typ(&self) -> TypeId {
        use crate::types;
        match self {
            Expr::IntLit { typ, .. }
            | Expr::FloatLit { typ, .. }
            | Expr::Ident { typ, .. }
            | Expr::Selector { typ, .. }
            | Expr::EnumVal { typ, .. }
            | Expr::Infix { typ, .. }
            | Expr::Prefix { typ, .. }
            | Expr::Cast { typ, .. }
            | Expr::StructInit { typ, .. } => *typ,
            Expr::BoolLit { .. } => types::BOOL,
            Expr::StrLit { .. } => types::STRING,
            Expr::Postfix { expr, .. } => expr.typ(),
            Expr::Call(call) => call.ret_type,
            Expr::If(ifx) => ifx.typ,
            Expr::Match(mx) => mx.typ,
            Expr::Paren { inner }
            | Expr::Unsafe { inner }
            | Expr::Likely { inner }
            | Expr::Lock { inner } => inner.typ(),
        }
    }
}

impl FnDecl {
    /// Fully-qualified name used in the function-address map: methods are
    /// `<receiver-type>.<name>`, plain functions `<module>.<name>`.
    pub fn qualified_name(&self, table: &crate::types::TypeTable) -> String {
        match &self.receiver {
            Some(recv) => {
                let base = table.base_type(recv.typ);
                format!("{}.{}", table.name(base), self.name)
            }
            None => format!("{}.{}", self.module, self.name),
        }
    }
}

impl Stmt {
    pub fn pos(&self) -> Pos {
        match self {
            Stmt::Fn(f) => f.pos,
            Stmt::Struct(s) => s.pos,
            Stmt::Enum(e) => e.pos,
            Stmt::Const(c) => c.pos,
            Stmt::Assign(a) => a.pos,
            Stmt::Block { pos, .. }
            | Stmt::Branch { pos, .. }
            | Stmt::Defer { pos, .. }
            | Stmt::Hash { pos, .. }
            | Stmt::Assert { pos, .. }
            | Stmt::Import { pos, .. }
            | Stmt::Module { pos, .. }
            | Stmt::Return { pos, .. } => *pos,
            Stmt::Expr(e) => e.pos(),
            Stmt::For(f) => f.pos,
            Stmt::ForIn(f) => f.pos,
            Stmt::ForCond(f) => f.pos,
            Stmt::Asm(a) => a.pos,
        }
    }
}
