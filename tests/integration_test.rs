//! Integration tests for the native generator
//!
//! Each test drives the full pipeline from a hand-built AST to
//! container bytes. Where the build host matches the target, the
//! produced binary is executed and its output checked.

use tern_native::ast::*;
use tern_native::prefs::{Arch, Os, Preferences};
use tern_native::types::{self, StructField, TypeKind, TypeTable};
use tern_native::{generate, generate_image};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn prefs_linux_amd64() -> Preferences {
    let mut prefs = Preferences::new(Os::Linux);
    prefs.arch = Some(Arch::Amd64);
    prefs.path = "test.tern".to_string();
    prefs
}

// ==================== AST builders ====================

fn pos() -> Pos {
    Pos::default()
}

fn int(val: i64) -> Expr {
    Expr::IntLit {
        val,
        typ: types::INT_LITERAL,
        pos: pos(),
    }
}

fn ident(name: &str, typ: usize) -> Expr {
    Expr::Ident {
        name: name.to_string(),
        typ,
        pos: pos(),
    }
}

fn str_lit(val: &str) -> Expr {
    Expr::StrLit {
        val: val.to_string(),
        is_raw: false,
        pos: pos(),
    }
}

fn infix(op: InfixOp, left: Expr, right: Expr, typ: usize) -> Expr {
    Expr::Infix {
        op,
        left: Box::new(left),
        right: Box::new(right),
        typ,
        pos: pos(),
    }
}

fn println_call(arg: Expr) -> Stmt {
    Stmt::Expr(Expr::Call(CallExpr {
        name: "println".to_string(),
        lang: CallLang::Tern,
        receiver: None,
        args: vec![arg],
        ret_type: types::VOID,
        pos: pos(),
    }))
}

fn call(name: &str, args: Vec<Expr>, ret_type: usize) -> Expr {
    Expr::Call(CallExpr {
        name: name.to_string(),
        lang: CallLang::Tern,
        receiver: None,
        args,
        ret_type,
        pos: pos(),
    })
}

fn fn_decl(name: &str, ret_type: usize, body: Vec<Stmt>) -> Stmt {
    Stmt::Fn(FnDecl {
        name: name.to_string(),
        module: "main".to_string(),
        receiver: None,
        params: vec![],
        ret_type,
        body,
        pos: pos(),
    })
}

fn file(stmts: Vec<Stmt>) -> File {
    File {
        path: "test.tern".to_string(),
        module: "main".to_string(),
        stmts,
    }
}

// ==================== execution helper ====================

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run_image(image: &[u8]) -> (i32, Vec<u8>) {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let path = std::env::temp_dir().join(format!(
        "tern-native-test-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::write(&path, image).expect("write test binary");
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let output = std::process::Command::new(&path)
        .output()
        .expect("execute test binary");
    let _ = std::fs::remove_file(&path);
    (output.status.code().unwrap_or(-1), output.stdout)
}

// ==================== scenarios ====================

#[test]
fn test_hello_world_elf() {
    init_logging();
    let program = file(vec![fn_decl(
        "main",
        types::VOID,
        vec![println_call(str_lit("Hello, World!"))],
    )]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    assert_eq!(&image[0..8], &[0x7F, 0x45, 0x4C, 0x46, 0x02, 0x01, 0x01, 0x00]);

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"Hello, World!\n");
    }
}

#[test]
fn test_integer_arithmetic() {
    init_logging();
    // println(2 + 3 * 4)
    let sum = infix(
        InfixOp::Add,
        int(2),
        infix(InfixOp::Mul, int(3), int(4), types::INT_LITERAL),
        types::INT_LITERAL,
    );
    let program = file(vec![fn_decl("main", types::VOID, vec![println_call(sum)])]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"14\n");
    }
}

#[test]
fn test_for_loop_with_break() {
    init_logging();
    // for i := 0; i < 3; i++ { if i == 2 { break } println(i) }
    let body = vec![
        Stmt::Expr(Expr::If(IfExpr {
            branches: vec![IfBranch {
                cond: Some(infix(
                    InfixOp::Eq,
                    ident("i", types::I64),
                    int(2),
                    types::BOOL,
                )),
                stmts: vec![Stmt::Branch {
                    kind: BranchKind::Break,
                    label: None,
                    pos: pos(),
                }],
            }],
            typ: types::VOID,
            pos: pos(),
        })),
        println_call(ident("i", types::I64)),
    ];
    let loop_stmt = Stmt::For(ForStmt {
        init: Some(Box::new(Stmt::Assign(Assign {
            op: AssignOp::Decl,
            left: ident("i", types::I64),
            right: int(0),
            pos: pos(),
        }))),
        cond: Some(infix(
            InfixOp::Lt,
            ident("i", types::I64),
            int(3),
            types::BOOL,
        )),
        post: Some(Box::new(Stmt::Expr(Expr::Postfix {
            op: PostfixOp::Inc,
            expr: Box::new(ident("i", types::I64)),
            pos: pos(),
        }))),
        body,
        label: None,
        pos: pos(),
    });
    let program = file(vec![fn_decl("main", types::VOID, vec![loop_stmt])]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"0\n1\n");
    }
}

#[test]
fn test_range_for_and_struct_return() {
    init_logging();
    let mut table = TypeTable::new();
    let pair = table.register(
        "Pair",
        TypeKind::Struct {
            fields: vec![
                StructField {
                    name: "a".into(),
                    typ: types::I64,
                },
                StructField {
                    name: "b".into(),
                    typ: types::I64,
                },
            ],
        },
    );

    // fn make() Pair { return Pair{ a: 40, b: 2 } }
    let make = fn_decl(
        "make",
        pair,
        vec![Stmt::Return {
            expr: Some(Expr::StructInit {
                typ: pair,
                fields: vec![("a".to_string(), int(40)), ("b".to_string(), int(2))],
                pos: pos(),
            }),
            pos: pos(),
        }],
    );
    // fn main() { p := make(); println(p.a); println(p.b)
    //             for i in 0..2 { println(i) } }
    let main = fn_decl(
        "main",
        types::VOID,
        vec![
            Stmt::Assign(Assign {
                op: AssignOp::Decl,
                left: ident("p", pair),
                right: call("make", vec![], pair),
                pos: pos(),
            }),
            println_call(Expr::Selector {
                expr: Box::new(ident("p", pair)),
                field: "a".to_string(),
                typ: types::I64,
                pos: pos(),
            }),
            println_call(Expr::Selector {
                expr: Box::new(ident("p", pair)),
                field: "b".to_string(),
                typ: types::I64,
                pos: pos(),
            }),
            Stmt::ForIn(ForInStmt {
                var: "i".to_string(),
                low: int(0),
                high: int(2),
                body: vec![println_call(ident("i", types::I64))],
                label: None,
                pos: pos(),
            }),
        ],
    );
    let program = file(vec![make, main]);
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"40\n2\n0\n1\n");
    }
}

#[test]
fn test_enum_values() {
    init_logging();
    let mut table = TypeTable::new();
    let perm = table.register(
        "Perm",
        TypeKind::Enum {
            is_flag: true,
            variants: vec!["read".into(), "write".into(), "exec".into()],
        },
    );
    let color = table.register(
        "Color",
        TypeKind::Enum {
            is_flag: false,
            variants: vec!["red".into(), "green".into(), "blue".into()],
        },
    );

    let enum_val = |enum_name: &str, field: &str, typ: usize| Expr::EnumVal {
        enum_name: enum_name.to_string(),
        field: field.to_string(),
        typ,
        pos: pos(),
    };
    let decls = vec![
        Stmt::Enum(EnumDecl {
            name: "Perm".to_string(),
            is_flag: true,
            fields: ["read", "write", "exec"]
                .iter()
                .map(|n| EnumField {
                    name: n.to_string(),
                    value: None,
                    pos: pos(),
                })
                .collect(),
            pos: pos(),
        }),
        Stmt::Enum(EnumDecl {
            name: "Color".to_string(),
            is_flag: false,
            fields: ["red", "green", "blue"]
                .iter()
                .map(|n| EnumField {
                    name: n.to_string(),
                    value: None,
                    pos: pos(),
                })
                .collect(),
            pos: pos(),
        }),
        fn_decl(
            "main",
            types::VOID,
            vec![
                println_call(enum_val("Perm", "read", perm)),
                println_call(enum_val("Perm", "write", perm)),
                println_call(enum_val("Perm", "exec", perm)),
                println_call(enum_val("Color", "red", color)),
                println_call(enum_val("Color", "green", color)),
                println_call(enum_val("Color", "blue", color)),
            ],
        ),
    ];
    let program = file(decls);
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"1\n2\n4\n0\n1\n2\n");
    }
}

#[test]
fn test_escape_decoding() {
    init_logging();
    // "\x41B\101" prints ABA, with the UTF-16 NUL in between.
    let program = file(vec![fn_decl(
        "main",
        types::VOID,
        vec![println_call(str_lit("\\x41\\u0042\\101"))],
    )]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    let needle = b"A\x42\x00A\n";
    assert!(image.windows(needle.len()).any(|w| w == needle));

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"A\x42\x00A\n");
    }
}

// ==================== further pipeline checks ====================

#[test]
fn test_exit_code_propagates() {
    init_logging();
    let exit_call = Stmt::Expr(call("exit", vec![int(7)], types::VOID));
    let program = file(vec![fn_decl("main", types::VOID, vec![exit_call])]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, _) = run_image(&image);
        assert_eq!(status, 7);
    }
}

#[test]
fn test_function_call_and_bool_print() {
    init_logging();
    // fn both() bool { return 1 < 2 }  fn main() { println(both()) }
    let both = fn_decl(
        "both",
        types::BOOL,
        vec![Stmt::Return {
            expr: Some(infix(InfixOp::Lt, int(1), int(2), types::BOOL)),
            pos: pos(),
        }],
    );
    let main = fn_decl(
        "main",
        types::VOID,
        vec![println_call(call("both", vec![], types::BOOL))],
    );
    let program = file(vec![both, main]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();
    // bool_to_string pools both spellings.
    assert!(image.windows(4).any(|w| w == b"true"));
    assert!(image.windows(5).any(|w| w == b"false"));

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"true\n");
    }
}

#[test]
fn test_defer_runs_in_reverse_order() {
    init_logging();
    let program = file(vec![fn_decl(
        "main",
        types::VOID,
        vec![
            Stmt::Defer {
                stmts: vec![println_call(str_lit("first"))],
                pos: pos(),
            },
            Stmt::Defer {
                stmts: vec![println_call(str_lit("second"))],
                pos: pos(),
            },
            println_call(str_lit("body")),
        ],
    )]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"body\nsecond\nfirst\n");
    }
}

#[test]
fn test_match_expression() {
    init_logging();
    // x := 2; match x { 1 => println("one") 2 => println("two")
    //                   else => println("many") }
    let match_stmt = Stmt::Expr(Expr::Match(MatchExpr {
        cond: Box::new(ident("x", types::I64)),
        branches: vec![
            MatchBranch {
                exprs: vec![int(1)],
                stmts: vec![println_call(str_lit("one"))],
            },
            MatchBranch {
                exprs: vec![int(2)],
                stmts: vec![println_call(str_lit("two"))],
            },
            MatchBranch {
                exprs: vec![],
                stmts: vec![println_call(str_lit("many"))],
            },
        ],
        typ: types::VOID,
        pos: pos(),
    }));
    let program = file(vec![fn_decl(
        "main",
        types::VOID,
        vec![
            Stmt::Assign(Assign {
                op: AssignOp::Decl,
                left: ident("x", types::I64),
                right: int(2),
                pos: pos(),
            }),
            match_stmt,
        ],
    )]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"two\n");
    }
}

#[test]
fn test_sibling_scopes_can_redeclare_a_name() {
    init_logging();
    // Both branches of an if declare `x`, and two sibling loops reuse
    // `i`; every branch is emitted, so the later declarations shadow.
    let branch_if = Stmt::Expr(Expr::If(IfExpr {
        branches: vec![
            IfBranch {
                cond: Some(Expr::BoolLit {
                    val: true,
                    pos: pos(),
                }),
                stmts: vec![
                    Stmt::Assign(Assign {
                        op: AssignOp::Decl,
                        left: ident("x", types::I64),
                        right: int(1),
                        pos: pos(),
                    }),
                    println_call(ident("x", types::I64)),
                ],
            },
            IfBranch {
                cond: None,
                stmts: vec![
                    Stmt::Assign(Assign {
                        op: AssignOp::Decl,
                        left: ident("x", types::I64),
                        right: int(2),
                        pos: pos(),
                    }),
                    println_call(ident("x", types::I64)),
                ],
            },
        ],
        typ: types::VOID,
        pos: pos(),
    }));
    let counting_loop = |low: i64, high: i64| {
        Stmt::For(ForStmt {
            init: Some(Box::new(Stmt::Assign(Assign {
                op: AssignOp::Decl,
                left: ident("i", types::I64),
                right: int(low),
                pos: pos(),
            }))),
            cond: Some(infix(
                InfixOp::Lt,
                ident("i", types::I64),
                int(high),
                types::BOOL,
            )),
            post: Some(Box::new(Stmt::Expr(Expr::Postfix {
                op: PostfixOp::Inc,
                expr: Box::new(ident("i", types::I64)),
                pos: pos(),
            }))),
            body: vec![println_call(ident("i", types::I64))],
            label: None,
            pos: pos(),
        })
    };
    let program = file(vec![fn_decl(
        "main",
        types::VOID,
        vec![branch_if, counting_loop(0, 2), counting_loop(5, 7)],
    )]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"1\n0\n1\n5\n6\n");
    }
}

#[test]
fn test_defer_inside_value_if_gets_a_guard() {
    init_logging();
    // x := if true { defer println("cleanup"); 1 } else { 2 }
    let value_if = Expr::If(IfExpr {
        branches: vec![
            IfBranch {
                cond: Some(Expr::BoolLit {
                    val: true,
                    pos: pos(),
                }),
                stmts: vec![
                    Stmt::Defer {
                        stmts: vec![println_call(str_lit("cleanup"))],
                        pos: pos(),
                    },
                    Stmt::Expr(int(1)),
                ],
            },
            IfBranch {
                cond: None,
                stmts: vec![Stmt::Expr(int(2))],
            },
        ],
        typ: types::I64,
        pos: pos(),
    });
    let program = file(vec![fn_decl(
        "main",
        types::VOID,
        vec![
            Stmt::Assign(Assign {
                op: AssignOp::Decl,
                left: ident("x", types::I64),
                right: value_if,
                pos: pos(),
            }),
            println_call(ident("x", types::I64)),
        ],
    )]);
    let mut table = TypeTable::new();
    let image = generate_image(&[program], &mut table, &prefs_linux_amd64()).unwrap();

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let (status, stdout) = run_image(&image);
        assert_eq!(status, 0);
        assert_eq!(stdout, b"1\ncleanup\n");
    }
}

#[test]
fn test_generate_writes_executable_file() {
    init_logging();
    let program = file(vec![fn_decl(
        "main",
        types::VOID,
        vec![println_call(str_lit("ok"))],
    )]);
    let mut table = TypeTable::new();
    let out = std::env::temp_dir().join(format!("tern-native-out-{}", std::process::id()));
    let out_name = out.to_string_lossy().to_string();
    let (lines, bytes) = generate(&[program], &mut table, &out_name, &prefs_linux_amd64()).unwrap();
    assert!(lines > 0);
    assert_eq!(bytes as u64, std::fs::metadata(&out).unwrap().len());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o775);
    }
    let _ = std::fs::remove_file(&out);
}
