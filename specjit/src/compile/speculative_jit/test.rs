//! Compile small graphs, run them on the simulator, and check both what comes out and (where the
//! exact instruction sequence matters) what was emitted.

use super::SpeculativeJit;
use crate::{
    compile::{
        CompilationPlan, CompileQueue, CompileResult, CompiledCode, Profiler, ProfilerReport,
        code_block::CodeBlock,
        compile,
        compiled_code::PatchError,
        graph::{
            ArrayMode, BlockIdx, FlushFormat, Graph, GraphKind, NodeFlags, Op, SwitchCase,
            SwitchData, SwitchKind,
        },
        graph_builder::GraphBuilder,
        machine::abi::{INDEXING_CONTIGUOUS, INDEXING_DOUBLE, INDEXING_NONE, INDEXING_SHAPE_MASK},
        osr_exit::ExitKind,
        spec_type::SpecType,
    },
    options::JitOptions,
    runtime::{ArrayShape, ExitState, Function, Outcome, Runtime, SimError},
    value::JSValue,
};
use fm::{FMBuilder, FMatcher};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::{Arc, mpsc};

lazy_static! {
    /// Use `{{name}}` to match non-literal strings in tests.
    static ref PTN_RE: Regex = {
        Regex::new(r"\{\{.+?\}\}").unwrap()
    };

    static ref TEXT_RE: Regex = {
        Regex::new(r"[a-zA-Z0-9\._]+").unwrap()
    };
}

fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

/// Match the assembler's log of `cc` against the [fm] pattern `ptn`.
fn match_asm(cc: &CompiledCode, ptn: &str) {
    let log = cc.asm_log().unwrap();
    if let Err(e) = fmatcher(ptn).matches(log) {
        panic!("\n!!! Emitted code didn't match !!!\n\n{e}\nFull asm:\n{log}\n");
    }
}

fn compile_plan(plan: CompilationPlan) -> Arc<CompiledCode> {
    match compile(&plan) {
        CompileResult::Compiled(cc) => cc,
        CompileResult::Failed(f) => panic!("compiling {} failed: {}", f.name, f.reason),
    }
}

fn compile_graph(rt: &Runtime, g: Graph) -> Arc<CompiledCode> {
    let cb = CodeBlock::new(&g.name, g.arguments.len());
    compile_plan(CompilationPlan::new(g, cb, rt.vm()))
}

fn returned(o: Outcome) -> JSValue {
    match o {
        Outcome::Returned(v) => v,
        o => panic!("expected a return, got {o:?}"),
    }
}

fn exited(o: Outcome) -> ExitState {
    match o {
        Outcome::Exited(x) => *x,
        o => panic!("expected an exit, got {o:?}"),
    }
}

fn int(x: i32) -> JSValue {
    JSValue::int32(x)
}

/// `function(a, b) { return a <op> b; }`.
fn binop(op: Op, args: SpecType, pred: SpecType, flags: NodeFlags) -> Graph {
    let mut gb = GraphBuilder::new("binop", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(args, FlushFormat::JSValue);
    let b = gb.argument(args, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let y = gb.get_local(b);
    let n = gb.node(op, &[x, y], pred);
    gb.add_flags(n, flags);
    gb.node(Op::Return, &[n], SpecType::EMPTY);
    gb.finish().unwrap()
}

fn int_binop(op: Op, flags: NodeFlags) -> Graph {
    binop(op, SpecType::INT32, SpecType::INT32, flags)
}

#[test]
fn int_add() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, int_binop(Op::ArithAdd, NodeFlags::NONE));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(5), int(7)]).unwrap();
    assert_eq!(returned(r), int(12));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(-5), int(2)]).unwrap();
    assert_eq!(returned(r), int(-3));
    match_asm(
        &cc,
        "
        ...
        ; @2: ArithAdd
        cmp64 {{a}}, r14
        jb {{l1}}
        cmp64 {{b}}, r14
        jb {{l2}}
        add32 {{a}}, {{b}}
        jo {{l3}}
        ; @3: Return
        ...
        ",
    );
}

#[test]
fn int_add_overflow_exits() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, int_binop(Op::ArithAdd, NodeFlags::NONE));
    let x = exited(
        rt.call(&cc, JSValue::UNDEFINED, &[int(i32::MAX), int(1)])
            .unwrap(),
    );
    assert_eq!(x.kind, ExitKind::Overflow);
    assert_eq!(x.arguments, vec![JSValue::UNDEFINED, int(i32::MAX), int(1)]);
    assert!(!x.recompile);
    assert_eq!(cc.exits()[x.exit].count(), 1);
    assert_eq!(
        cc.exits()
            .iter()
            .filter(|e| e.exit.kind == ExitKind::Overflow)
            .count(),
        1
    );
    // A type check fails before any arithmetic is done.
    let s = rt.new_string("5").unwrap();
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[s, int(1)]).unwrap());
    assert_eq!(x.kind, ExitKind::BadType);
}

#[test]
fn speculative_add_is_undone() {
    // The hinted local holds the add's left operand, whose register the add reuses.
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("inc", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let v = gb.variable(SpecType::INT32, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    gb.node(Op::MovHint(v), &[x], SpecType::EMPTY);
    let one = gb.constant(int(1));
    let add = gb.node(Op::ArithAdd, &[x, one], SpecType::INT32);
    gb.node(Op::Return, &[add], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());

    assert_eq!(
        returned(rt.call(&cc, JSValue::UNDEFINED, &[int(41)]).unwrap()),
        int(42)
    );
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(i32::MAX)]).unwrap());
    assert_eq!(x.kind, ExitKind::Overflow);
    assert!(cc.exits()[x.exit].exit.recovery.is_some());
    assert_eq!(x.locals, vec![int(i32::MAX)]);
}

#[test]
fn truncated_add_wraps() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, int_binop(Op::ArithAdd, NodeFlags::CAN_TRUNCATE));
    let r = rt
        .call(&cc, JSValue::UNDEFINED, &[int(i32::MAX), int(1)])
        .unwrap();
    assert_eq!(returned(r), int(i32::MIN));
    assert!(cc.exits().iter().all(|e| e.exit.kind != ExitKind::Overflow));
}

#[test]
fn mul_negative_zero() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, int_binop(Op::ArithMul, NodeFlags::NEEDS_NEG_ZERO));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(3), int(4)]).unwrap();
    assert_eq!(returned(r), int(12));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(0), int(5)]).unwrap();
    assert_eq!(returned(r), int(0));
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(0), int(-5)]).unwrap());
    assert_eq!(x.kind, ExitKind::NegativeZero);
    let x = exited(
        rt.call(&cc, JSValue::UNDEFINED, &[int(0x10000), int(0x10000)])
            .unwrap(),
    );
    assert_eq!(x.kind, ExitKind::Overflow);

    // Without the flag, nobody can tell -0 from 0.
    let cc = compile_graph(&rt, int_binop(Op::ArithMul, NodeFlags::NONE));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(0), int(-5)]).unwrap();
    assert_eq!(returned(r), int(0));
}

#[test]
fn int_division() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, int_binop(Op::ArithDiv, NodeFlags::NONE));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(-8), int(2)]).unwrap();
    assert_eq!(returned(r), int(-4));
    for (a, b) in [(7, 0), (i32::MIN, -1), (7, 2)] {
        let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(a), int(b)]).unwrap());
        assert_eq!(x.kind, ExitKind::Overflow, "{a} / {b}");
    }

    let cc = compile_graph(&rt, int_binop(Op::ArithDiv, NodeFlags::CAN_TRUNCATE));
    for (a, b, r) in [(7, 0, 0), (i32::MIN, -1, i32::MIN), (7, 2, 3), (-7, 2, -3)] {
        let o = rt.call(&cc, JSValue::UNDEFINED, &[int(a), int(b)]).unwrap();
        assert_eq!(returned(o), int(r), "({a} / {b}) | 0");
    }
}

#[test]
fn int_modulo() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, int_binop(Op::ArithMod, NodeFlags::NEEDS_NEG_ZERO));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(-7), int(3)]).unwrap();
    assert_eq!(returned(r), int(-1));
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(-6), int(3)]).unwrap());
    assert_eq!(x.kind, ExitKind::NegativeZero);
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(6), int(0)]).unwrap());
    assert_eq!(x.kind, ExitKind::Overflow);
}

#[test]
fn double_arith() {
    let mut rt = Runtime::new().unwrap();
    let g = binop(
        Op::ArithAdd,
        SpecType::NUMBER,
        SpecType::DOUBLE_REAL,
        NodeFlags::NONE,
    );
    let cc = compile_graph(&rt, g);
    let r = rt
        .call(&cc, JSValue::UNDEFINED, &[JSValue::double(1.5), int(2)])
        .unwrap();
    assert_eq!(returned(r).as_number(), Some(3.5));
    let s = rt.new_string("x").unwrap();
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[s, int(2)]).unwrap());
    assert_eq!(x.kind, ExitKind::BadType);
}

#[test]
fn double_results_reuse_dead_inputs() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("dbl", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::DOUBLE_REAL, FlushFormat::JSValue);
    let b = gb.argument(SpecType::DOUBLE_REAL, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let y = gb.get_local(b);
    // `x` and `t1` stay live past their first use, `t2` dies in `r`.
    let t1 = gb.node(Op::ArithMul, &[x, y], SpecType::DOUBLE_REAL);
    let t2 = gb.node(Op::ArithAdd, &[t1, x], SpecType::DOUBLE_REAL);
    let r = gb.node(Op::ArithSub, &[t2, t1], SpecType::DOUBLE_REAL);
    let r = gb.node(Op::ArithMul, &[r, r], SpecType::DOUBLE_REAL);
    gb.node(Op::Return, &[r], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());
    let r = rt
        .call(
            &cc,
            JSValue::UNDEFINED,
            &[JSValue::double(1.5), JSValue::double(2.5)],
        )
        .unwrap();
    assert_eq!(returned(r).as_number(), Some(2.25));
}

#[test]
fn generic_add() {
    let mut rt = Runtime::new().unwrap();
    let g = binop(Op::ValueAdd, SpecType::TOP, SpecType::TOP, NodeFlags::NONE);
    let cc = compile_graph(&rt, g);
    let a = rt.new_string("a").unwrap();
    let r = returned(rt.call(&cc, JSValue::UNDEFINED, &[a, int(1)]).unwrap());
    assert_eq!(rt.string_value(r).unwrap(), "a1");
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(1), int(2)]).unwrap();
    assert_eq!(returned(r).as_number(), Some(3.0));
}

#[test]
fn fused_compare_and_branch() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("lt", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let b = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let bb0 = gb.block();
    let bb1 = gb.block();
    let bb2 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let y = gb.get_local(b);
    let c = gb.node(Op::CompareLess, &[x, y], SpecType::BOOLEAN);
    gb.node(
        Op::Branch {
            taken: bb1,
            not_taken: bb2,
        },
        &[c],
        SpecType::EMPTY,
    );
    gb.switch_to(bb1);
    let one = gb.constant(int(1));
    gb.node(Op::Return, &[one], SpecType::EMPTY);
    gb.switch_to(bb2);
    let two = gb.constant(int(2));
    gb.node(Op::Return, &[two], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());

    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(1), int(2)]).unwrap();
    assert_eq!(returned(r), int(1));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(3), int(2)]).unwrap();
    assert_eq!(returned(r), int(2));
    // The branch is never lowered on its own and no boolean is materialised.
    match_asm(
        &cc,
        "
        ...
        ; @2: CompareLess
        ...
        cmp32 {{a}}, {{b}}
        jge {{l}}
        ; {{l1}}
        ; bb1
        ...
        ",
    );
    assert!(!cc.asm_log().unwrap().contains("Branch"));
    assert!(!cc.asm_log().unwrap().contains("setl"));
}

/// `function(a, b) { if (a OP b) return 1; return 2; }`. Unless `fused`, the compare's result is
/// also stored to a local before the branch, so it has to be materialised as a boolean.
fn compare_branch(op: Op, pa: SpecType, pb: SpecType, fused: bool) -> Graph {
    let mut gb = GraphBuilder::new("cmp", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(pa, FlushFormat::JSValue);
    let b = gb.argument(pb, FlushFormat::JSValue);
    let t = gb.variable(SpecType::BOOLEAN, FlushFormat::JSValue);
    let bb0 = gb.block();
    let bb1 = gb.block();
    let bb2 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let y = gb.get_local(b);
    let c = gb.node(op, &[x, y], SpecType::BOOLEAN);
    if !fused {
        gb.set_local(t, c);
    }
    gb.node(
        Op::Branch {
            taken: bb1,
            not_taken: bb2,
        },
        &[c],
        SpecType::EMPTY,
    );
    gb.switch_to(bb1);
    let one = gb.constant(int(1));
    gb.node(Op::Return, &[one], SpecType::EMPTY);
    gb.switch_to(bb2);
    let two = gb.constant(int(2));
    gb.node(Op::Return, &[two], SpecType::EMPTY);
    gb.finish().unwrap()
}

/// Run `a OP b` fused and unfused over `inputs`, check both agree, and return the outcomes.
fn fused_and_unfused(
    rt: &mut Runtime,
    op: Op,
    pa: SpecType,
    pb: SpecType,
    inputs: &[(JSValue, JSValue)],
) -> Vec<bool> {
    let fused = compile_graph(rt, compare_branch(op.clone(), pa, pb, true));
    let unfused = compile_graph(rt, compare_branch(op.clone(), pa, pb, false));
    assert!(!fused.asm_log().unwrap().contains("Branch"));
    assert!(unfused.asm_log().unwrap().contains("Branch"));
    inputs
        .iter()
        .map(|(a, b)| {
            let f = returned(rt.call(&fused, JSValue::UNDEFINED, &[*a, *b]).unwrap());
            let u = returned(rt.call(&unfused, JSValue::UNDEFINED, &[*a, *b]).unwrap());
            assert_eq!(f, u, "{op}({a:?}, {b:?})");
            f == int(1)
        })
        .collect()
}

const COMPARES: [Op; 6] = [
    Op::CompareLess,
    Op::CompareLessEq,
    Op::CompareGreater,
    Op::CompareGreaterEq,
    Op::CompareEq,
    Op::CompareStrictEq,
];

#[test]
fn fused_double_compares() {
    let mut rt = Runtime::new().unwrap();
    let vals = [f64::NAN, 0.0, -0.0, 1.5, -1.5, 2.0];
    let inputs = vals
        .iter()
        .flat_map(|a| vals.iter().map(move |b| (*a, *b)))
        .collect::<Vec<_>>();
    let boxed = inputs
        .iter()
        .map(|(a, b)| (JSValue::double(*a), JSValue::double(*b)))
        .collect::<Vec<_>>();
    for op in COMPARES {
        let expected = inputs
            .iter()
            .map(|(a, b)| match op {
                Op::CompareLess => a < b,
                Op::CompareLessEq => a <= b,
                Op::CompareGreater => a > b,
                Op::CompareGreaterEq => a >= b,
                _ => a == b,
            })
            .collect::<Vec<_>>();
        let got = fused_and_unfused(
            &mut rt,
            op.clone(),
            SpecType::NUMBER,
            SpecType::NUMBER,
            &boxed,
        );
        assert_eq!(got, expected, "{op}");
    }
}

#[test]
fn fused_object_compares() {
    let mut rt = Runtime::new().unwrap();
    let o1 = rt.new_object(JSValue::NULL).unwrap();
    let o2 = rt.new_object(JSValue::NULL).unwrap();
    let ooo = SpecType::OBJECT.union(SpecType::OTHER);
    for op in [Op::CompareEq, Op::CompareStrictEq] {
        let got = fused_and_unfused(
            &mut rt,
            op.clone(),
            SpecType::FINAL_OBJECT,
            SpecType::FINAL_OBJECT,
            &[(o1, o1), (o1, o2), (o2, o1)],
        );
        assert_eq!(got, [true, false, false]);

        let others = [o1, o2, JSValue::NULL, JSValue::UNDEFINED];
        let inputs = others.iter().map(|v| (o1, *v)).collect::<Vec<_>>();
        let got = fused_and_unfused(&mut rt, op.clone(), SpecType::FINAL_OBJECT, ooo, &inputs);
        assert_eq!(got, [true, false, false, false]);
        let inputs = others.iter().map(|v| (*v, o2)).collect::<Vec<_>>();
        let got = fused_and_unfused(&mut rt, op.clone(), ooo, SpecType::FINAL_OBJECT, &inputs);
        assert_eq!(got, [false, true, false, false]);
    }
}

#[test]
fn fused_generic_compares() {
    let mut rt = Runtime::new().unwrap();
    let a = rt.new_string("a").unwrap();
    let b = rt.new_string("b").unwrap();
    let one = rt.new_string("1").unwrap();
    let inputs = [
        (a, b),
        (b, a),
        (a, a),
        (int(1), one),
        (JSValue::NULL, JSValue::UNDEFINED),
        (JSValue::double(f64::NAN), int(1)),
    ];
    let mut got = Vec::new();
    for op in COMPARES {
        got.push(fused_and_unfused(
            &mut rt,
            op,
            SpecType::TOP,
            SpecType::TOP,
            &inputs,
        ));
    }
    // <
    assert_eq!(got[0], [true, false, false, false, false, false]);
    // >=
    assert_eq!(got[3], [false, true, true, true, false, false]);
    // ==
    assert_eq!(got[4], [false, false, true, true, true, false]);
    // ===
    assert_eq!(got[5], [false, false, true, false, false, false]);
}

#[test]
fn forward_exit_resumes_after_store() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("urshift", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let v = gb.variable(SpecType::NUMBER, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    gb.bytecode(1);
    let x = gb.get_local(a);
    let zero = gb.constant(int(0));
    let sh = gb.node(Op::BitURShift, &[x, zero], SpecType::INT32);
    let u = gb.node(Op::UInt32ToNumber, &[sh], SpecType::INT32);
    gb.bytecode(5);
    gb.set_local(v, u);
    gb.bytecode(6);
    gb.node(Op::Return, &[u], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());

    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(7)]).unwrap();
    assert_eq!(returned(r), int(7));
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(-1)]).unwrap());
    assert_eq!(x.kind, ExitKind::Overflow);
    assert!(cc.exits()[x.exit].exit.is_forward);
    assert_eq!(x.origin.bytecode_index, 5);
    assert_eq!(x.locals[0].as_number(), Some(4294967295.0));
}

#[test]
fn argument_type_checks() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("id", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::INT32, FlushFormat::Int32);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    gb.node(Op::Return, &[x], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());

    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(4)]).unwrap();
    assert_eq!(returned(r), int(4));
    let x = exited(
        rt.call(&cc, JSValue::UNDEFINED, &[JSValue::double(1.5)])
            .unwrap(),
    );
    assert_eq!(x.kind, ExitKind::ArgumentTypeCheck);
    assert_eq!(x.arguments[1], JSValue::double(1.5));
}

#[test]
fn argument_check_exits_keep_boxed_arguments() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("args", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let i = gb.argument(SpecType::INT32, FlushFormat::Int32);
    gb.argument(SpecType::BOOLEAN, FlushFormat::Boolean);
    gb.argument(SpecType::CELL, FlushFormat::Cell);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(i);
    gb.node(Op::Return, &[x], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());

    let s = rt.new_string("abc").unwrap();
    let r = rt
        .call(&cc, JSValue::UNDEFINED, &[int(7), JSValue::boolean(true), s])
        .unwrap();
    assert_eq!(returned(r), int(7));

    for args in [
        [s, JSValue::boolean(false), s],
        [JSValue::double(-0.5), JSValue::boolean(true), s],
        [int(1), int(1), s],
        [int(1), JSValue::boolean(true), JSValue::double(2.25)],
        [int(1), JSValue::boolean(true), JSValue::NULL],
    ] {
        let x = exited(rt.call(&cc, JSValue::UNDEFINED, &args).unwrap());
        assert_eq!(x.kind, ExitKind::ArgumentTypeCheck);
        assert_eq!(x.arguments[0], JSValue::UNDEFINED);
        assert_eq!(&x.arguments[1..], &args[..]);
    }
}

#[test]
fn missing_arguments_are_undefined() {
    let mut rt = Runtime::new().unwrap();
    let g = binop(Op::ValueAdd, SpecType::TOP, SpecType::TOP, NodeFlags::NONE);
    let cc = compile_graph(&rt, g);
    let r = returned(rt.call(&cc, JSValue::UNDEFINED, &[int(1)]).unwrap());
    assert!(r.as_number().unwrap().is_nan());
}

#[test]
fn stack_overflow_throws() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, int_binop(Op::ArithAdd, NodeFlags::NONE));
    let limit = rt.stack_limit().unwrap();
    rt.set_stack_limit(u64::MAX).unwrap();
    match rt.call(&cc, JSValue::UNDEFINED, &[int(1), int(2)]).unwrap() {
        Outcome::Threw(e) => assert!(rt.string_value(e).unwrap().starts_with("RangeError")),
        o => panic!("{o:?}"),
    }
    assert_eq!(rt.pending_exception().unwrap(), None);
    rt.set_stack_limit(limit).unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(1), int(2)]).unwrap();
    assert_eq!(returned(r), int(3));
}

#[test]
fn throw() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("throw", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::TOP, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    gb.node(Op::Throw, &[x], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());
    match rt.call(&cc, JSValue::UNDEFINED, &[int(9)]).unwrap() {
        Outcome::Threw(e) => assert_eq!(e, int(9)),
        o => panic!("{o:?}"),
    }
}

/// `function(f, a) { return f(a, 2); }`.
fn caller() -> Graph {
    let mut gb = GraphBuilder::new("caller", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let f = gb.argument(SpecType::FUNCTION, FlushFormat::JSValue);
    let a = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let fv = gb.get_local(f);
    let this = gb.constant(JSValue::UNDEFINED);
    let av = gb.get_local(a);
    let two = gb.constant(int(2));
    let call = gb.node(Op::Call, &[fv, this, av, two], SpecType::TOP);
    gb.node(Op::Return, &[call], SpecType::EMPTY);
    gb.finish().unwrap()
}

fn count_args(_: &mut Runtime, _: JSValue, args: &[JSValue]) -> Result<JSValue, SimError> {
    Ok(JSValue::int32(args.len() as i32 * 100))
}

#[test]
fn calls() {
    let mut rt = Runtime::new().unwrap();
    let callee = compile_graph(&rt, int_binop(Op::ArithAdd, NodeFlags::NONE));
    let cc = compile_graph(&rt, caller());
    assert_eq!(cc.call_links().len(), 1);

    let f = rt.new_function(Function::Compiled(Arc::clone(&callee))).unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[f, int(40)]).unwrap();
    assert_eq!(returned(r), int(42));

    let h = rt.new_function(Function::Host(count_args)).unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[h, int(40)]).unwrap();
    assert_eq!(returned(r), int(200));

    match rt.call(&cc, JSValue::UNDEFINED, &[int(3), int(40)]).unwrap() {
        Outcome::Threw(e) => {
            assert_eq!(rt.string_value(e).unwrap(), "TypeError: 3 is not a function")
        }
        o => panic!("{o:?}"),
    }

    // An exit in the callee ends the whole run.
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[f, int(i32::MAX)]).unwrap());
    assert_eq!(x.kind, ExitKind::Overflow);

    cc.link_call(0, callee.entry()).unwrap();
    assert!(!cc.disassemble(false).contains("thunk:VirtualCall"));
    let r = rt.call(&cc, JSValue::UNDEFINED, &[f, int(1)]).unwrap();
    assert_eq!(returned(r), int(3));
    assert!(matches!(
        cc.link_call(1, callee.entry()),
        Err(PatchError::NoSuchSite(_, 1))
    ));
}

#[test]
fn get_by_id_cache() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("get", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::FINAL_OBJECT, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let y = gb.identifier("y");
    let get = gb.node(Op::GetById(y), &[x], SpecType::TOP);
    gb.node(Op::Return, &[get], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());
    assert_eq!(cc.ic_sites().len(), 1);
    assert_eq!(&*cc.ic_sites()[0].ident, "y");

    let o = rt.new_object(JSValue::NULL).unwrap();
    rt.put_property(o, "x", int(1)).unwrap();
    rt.put_property(o, "y", int(2)).unwrap();
    // Unpatched, every access takes the slow path.
    assert_eq!(returned(rt.call(&cc, JSValue::UNDEFINED, &[o]).unwrap()), int(2));

    let s = rt.structure_of(o).unwrap();
    let slot = rt.slot_of(s, "y").unwrap();
    assert_eq!(slot, 1);
    // Patch in the wrong slot to see that the fast path really is taken.
    cc.patch_get_by_id(0, s, 0).unwrap();
    assert_eq!(returned(rt.call(&cc, JSValue::UNDEFINED, &[o]).unwrap()), int(1));
    cc.patch_get_by_id(0, s, slot).unwrap();
    assert_eq!(returned(rt.call(&cc, JSValue::UNDEFINED, &[o]).unwrap()), int(2));

    // Objects of other structures still take the slow path.
    let p = rt.new_object(JSValue::NULL).unwrap();
    rt.put_property(p, "y", int(5)).unwrap();
    assert_eq!(returned(rt.call(&cc, JSValue::UNDEFINED, &[p]).unwrap()), int(5));
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(1)]).unwrap());
    assert_eq!(x.kind, ExitKind::BadType);

    assert!(matches!(
        cc.patch_put_by_id(0, s, slot),
        Err(PatchError::WrongKind(0, _))
    ));
    assert!(matches!(
        cc.patch_get_by_id(0, s, 8),
        Err(PatchError::SlotOutOfRange(8))
    ));
}

/// `function(a, b) { return a == b; }` for objects.
fn object_eq() -> Graph {
    let mut gb = GraphBuilder::new("eq", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::FINAL_OBJECT, FlushFormat::JSValue);
    let b = gb.argument(SpecType::FINAL_OBJECT, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let y = gb.get_local(b);
    let c = gb.node(Op::CompareEq, &[x, y], SpecType::BOOLEAN);
    gb.node(Op::Return, &[c], SpecType::EMPTY);
    gb.finish().unwrap()
}

#[test]
fn masquerade_watchpoint() {
    let mut rt = Runtime::new().unwrap();
    let g = object_eq();
    let cb = CodeBlock::new(&g.name, 3);
    let plan = CompilationPlan::new(g, cb, rt.vm())
        .with_masquerades_watchpoint(Arc::clone(rt.masquerades_watchpoint()));
    let cc = compile_plan(plan);
    assert_eq!(cc.jump_replacements().len(), 1);
    let o1 = rt.new_object(JSValue::NULL).unwrap();
    let o2 = rt.new_object(JSValue::NULL).unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[o1, o1]).unwrap();
    assert_eq!(returned(r), JSValue::TRUE);
    let r = rt.call(&cc, JSValue::UNDEFINED, &[o1, o2]).unwrap();
    assert_eq!(returned(r), JSValue::FALSE);

    rt.make_masquerader(o2).unwrap();
    assert!(!rt.masquerades_watchpoint().is_valid());
    assert!(!cc.disassemble(false).contains("watchpoint"));
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[o1, o1]).unwrap());
    assert_eq!(x.kind, ExitKind::UncountableWatchpoint);
    assert!(cc.exits()[x.exit].exit.is_watchpoint);

    // Once the watchpoint is invalid, code checks each object instead.
    let g = object_eq();
    let cb = CodeBlock::new(&g.name, 3);
    let plan = CompilationPlan::new(g, cb, rt.vm())
        .with_masquerades_watchpoint(Arc::clone(rt.masquerades_watchpoint()));
    let cc = compile_plan(plan);
    assert!(cc.jump_replacements().is_empty());
    let r = rt.call(&cc, JSValue::UNDEFINED, &[o1, o1]).unwrap();
    assert_eq!(returned(r), JSValue::TRUE);
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[o2, o2]).unwrap());
    assert_eq!(x.kind, ExitKind::BadType);
}

/// `function(a) { switch (a) { case k0: return 10; case k1: return 20; default: return 30; } }`.
fn switch_graph(kind: SwitchKind, table: usize, keys: [SwitchCase; 2], pred: SpecType) -> Graph {
    let mut gb = GraphBuilder::new("switch", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(pred, FlushFormat::JSValue);
    let bb0 = gb.block();
    let bbs = [gb.block(), gb.block(), gb.block()];
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let [k0, k1] = keys;
    gb.node(
        Op::Switch(Box::new(SwitchData {
            kind,
            table,
            cases: vec![(k0, bbs[0]), (k1, bbs[1])],
            fallthrough: bbs[2],
        })),
        &[x],
        SpecType::EMPTY,
    );
    for (i, bb) in bbs.into_iter().enumerate() {
        gb.switch_to(bb);
        let c = gb.constant(int(10 * (i as i32 + 1)));
        gb.node(Op::Return, &[c], SpecType::EMPTY);
    }
    gb.finish().unwrap()
}

#[test]
fn int_switch() {
    let mut rt = Runtime::new().unwrap();
    let cb = CodeBlock::new("switch", 2);
    let t = cb.add_imm_switch_table(0, 3);
    let g = switch_graph(
        SwitchKind::Imm,
        t,
        [SwitchCase::Imm(0), SwitchCase::Imm(2)],
        SpecType::INT32,
    );
    let cc = compile_plan(CompilationPlan::new(g, Arc::clone(&cb), rt.vm()));
    for (v, r) in [(0, 10), (1, 30), (2, 20), (3, 30), (-1, 30)] {
        let o = rt.call(&cc, JSValue::UNDEFINED, &[int(v)]).unwrap();
        assert_eq!(returned(o), int(r), "switch ({v})");
    }
    assert_eq!(cb.tables().imm[t].ctis.len(), 3);
    assert_eq!(cb.imm_target(t, 1), Some(cb.tables().imm[t].default));
    match_asm(
        &cc,
        "
        ...
        ; @1: Switch
        ...
        sub32 r12, 0x0
        cmp32 r12, 0x3
        jae {{l}}
        jmptable 0, r12
        ...
        ",
    );
}

#[test]
fn untyped_int_switch() {
    let mut rt = Runtime::new().unwrap();
    let cb = CodeBlock::new("switch", 2);
    let t = cb.add_imm_switch_table(5, 2);
    let g = switch_graph(
        SwitchKind::Imm,
        t,
        [SwitchCase::Imm(5), SwitchCase::Imm(6)],
        SpecType::TOP,
    );
    let cc = compile_plan(CompilationPlan::new(g, cb, rt.vm()));
    let s = rt.new_string("5").unwrap();
    for (v, r) in [(int(5), 10), (JSValue::double(6.0), 20), (JSValue::double(5.5), 30), (s, 30)] {
        let o = rt.call(&cc, JSValue::UNDEFINED, &[v]).unwrap();
        assert_eq!(returned(o), int(r), "switch ({v})");
    }
}

#[test]
fn string_switch() {
    let mut rt = Runtime::new().unwrap();
    let cb = CodeBlock::new("switch", 2);
    let t = cb.add_string_switch_table(&["a", "bc", "q"]);
    let g = switch_graph(
        SwitchKind::String,
        t,
        [
            SwitchCase::String(Arc::from("a")),
            SwitchCase::String(Arc::from("bc")),
        ],
        SpecType::STRING,
    );
    let cc = compile_plan(CompilationPlan::new(g, Arc::clone(&cb), rt.vm()));
    let a = rt.new_string("a").unwrap();
    let bc = rt.new_string("bc").unwrap();
    let q = rt.new_string("q").unwrap();
    let z = rt.new_string("z").unwrap();
    for (v, r) in [(a, 10), (bc, 20), (q, 30), (z, 30), (int(1), 30)] {
        let o = rt.call(&cc, JSValue::UNDEFINED, &[v]).unwrap();
        assert_eq!(returned(o), int(r));
    }

    // Linking rewrites targets but never the key set.
    let tables = cb.tables();
    let st = &tables.string[t];
    let mut keys = st.entries.keys().map(|k| k.as_ref()).collect::<Vec<_>>();
    keys.sort();
    assert_eq!(keys, ["a", "bc", "q"]);
    assert_eq!(st.entries["q"], st.default);
    assert_ne!(st.entries["a"], st.default);
    assert_ne!(st.entries["a"], st.entries["bc"]);
}

#[test]
fn string_switch_case_missing_from_table() {
    let rt = Runtime::new().unwrap();
    let cb = CodeBlock::new("switch", 2);
    let t = cb.add_string_switch_table(&["a"]);
    let g = switch_graph(
        SwitchKind::String,
        t,
        [
            SwitchCase::String(Arc::from("a")),
            SwitchCase::String(Arc::from("zz")),
        ],
        SpecType::STRING,
    );
    match compile(&CompilationPlan::new(g, cb, rt.vm())) {
        CompileResult::Failed(f) => {
            assert!(f.reason.contains("\"zz\" is not in string jump table"), "{}", f.reason);
            assert!(!f.is_resource_exhaustion());
        }
        CompileResult::Compiled(_) => panic!(),
    }
}

/// `function(arr, i) { return arr[i]; }` for arrays of shape `mode`.
fn get_by_val(mode: ArrayMode, pred: SpecType) -> Graph {
    let mut gb = GraphBuilder::new("at", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let arr = gb.argument(pred, FlushFormat::JSValue);
    let i = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let a = gb.get_local(arr);
    let j = gb.get_local(i);
    gb.node(Op::CheckArray(mode), &[a], SpecType::EMPTY);
    let st = gb.node(Op::GetIndexedPropertyStorage(mode), &[a], SpecType::EMPTY);
    let v = gb.node(Op::GetByVal(mode), &[a, j, st], SpecType::TOP);
    gb.node(Op::Return, &[v], SpecType::EMPTY);
    gb.finish().unwrap()
}

#[test]
fn contiguous_get_by_val() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, get_by_val(ArrayMode::Contiguous, SpecType::ARRAY));
    let arr = rt
        .new_array(ArrayShape::Contiguous, &[int(10), int(20), JSValue::EMPTY])
        .unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[arr, int(1)]).unwrap();
    assert_eq!(returned(r), int(20));
    for (i, kind) in [
        (2, ExitKind::LoadFromHole),
        (3, ExitKind::OutOfBounds),
        (-1, ExitKind::OutOfBounds),
    ] {
        let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[arr, int(i)]).unwrap());
        assert_eq!(x.kind, kind, "arr[{i}]");
    }
    let darr = rt
        .new_array(ArrayShape::Double, &[JSValue::double(0.5)])
        .unwrap();
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[darr, int(0)]).unwrap());
    assert_eq!(x.kind, ExitKind::BadIndexingType);
}

#[test]
fn typed_array_get_by_val() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(
        &rt,
        get_by_val(ArrayMode::Int32Array, SpecType::INT32_ARRAY),
    );
    let arr = rt.new_int32_array(&[3, -4, 5]).unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[arr, int(1)]).unwrap();
    assert_eq!(returned(r), int(-4));
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[arr, int(3)]).unwrap());
    assert_eq!(x.kind, ExitKind::OutOfBounds);
    let farr = rt.new_float64_array(&[1.0]).unwrap();
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[farr, int(0)]).unwrap());
    assert_eq!(x.kind, ExitKind::BadType);
}

#[test]
fn osr_entry() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("loop", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let v = gb.variable(SpecType::INT32, FlushFormat::JSValue);
    let bb0 = gb.block();
    let bb1 = gb.block();
    gb.switch_to(bb0);
    let zero = gb.constant(int(0));
    gb.set_local(v, zero);
    gb.node(Op::Jump(bb1), &[], SpecType::EMPTY);
    gb.switch_to(bb1);
    gb.live_at_head(bb1, v);
    gb.set_osr_target(bb1);
    let x = gb.get_local(v);
    let one = gb.constant(int(1));
    let add = gb.node(Op::ArithAdd, &[x, one], SpecType::INT32);
    gb.node(Op::Return, &[add], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());

    assert!(cc.osr_entry(BlockIdx::new(0)).is_none());
    assert_eq!(returned(rt.call(&cc, JSValue::UNDEFINED, &[]).unwrap()), int(1));
    let r = rt
        .call_osr(&cc, BlockIdx::new(1), JSValue::UNDEFINED, &[], &[int(41)])
        .unwrap();
    assert_eq!(returned(r), int(42));
}

#[test]
fn registers_do_not_cross_blocks() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("blocks", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let v = gb.variable(SpecType::INT32, FlushFormat::Int32);
    let bb0 = gb.block();
    let bb1 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let one = gb.constant(int(1));
    let add = gb.node(Op::ArithAdd, &[x, one], SpecType::INT32);
    gb.set_local(v, add);
    gb.node(Op::Jump(bb1), &[], SpecType::EMPTY);
    gb.switch_to(bb1);
    gb.live_at_head(bb1, v);
    let y = gb.get_local(v);
    let three = gb.constant(int(3));
    let mul = gb.node(Op::ArithMul, &[y, three], SpecType::INT32);
    gb.node(Op::Return, &[mul], SpecType::EMPTY);
    let g = gb.finish().unwrap();

    {
        let plan = CompilationPlan::new(g.clone(), CodeBlock::new("blocks", 2), rt.vm());
        let mut sj = SpeculativeJit::new(&plan);
        sj.begin_entry();
        for bidx in plan.graph.blocks.indices() {
            sj.compile_block(bidx).unwrap();
            assert!(!sj.any_register_resident(), "bb{}", usize::from(bidx));
            assert!(!sj.gprs.any_locked() && !sj.fprs.any_locked());
        }
    }

    let cc = compile_graph(&rt, g);
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(3)]).unwrap();
    assert_eq!(returned(r), int(12));
}

#[test]
fn force_exit() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("cold", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    gb.bytecode(4);
    gb.node(Op::ForceOSRExit, &[], SpecType::EMPTY);
    gb.node(Op::Return, &[], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[]).unwrap());
    assert_eq!(x.kind, ExitKind::InadequateCoverage);
    assert_eq!(x.origin.bytecode_index, 4);
}

#[test]
fn exit_threshold_recommends_recompile() {
    let mut rt = Runtime::new().unwrap();
    let g = int_binop(Op::ArithAdd, NodeFlags::NONE);
    let cb = CodeBlock::new(&g.name, 3);
    let opts = JitOptions {
        exit_threshold: 2,
        ..JitOptions::default()
    };
    let cc = compile_plan(CompilationPlan::new(g, cb, rt.vm()).with_options(Arc::new(opts)));
    let args = [int(i32::MAX), int(1)];
    assert!(!exited(rt.call(&cc, JSValue::UNDEFINED, &args).unwrap()).recompile);
    assert!(exited(rt.call(&cc, JSValue::UNDEFINED, &args).unwrap()).recompile);
}

#[test]
fn code_buffer_limit() {
    let rt = Runtime::new().unwrap();
    let g = int_binop(Op::ArithAdd, NodeFlags::NONE);
    let cb = CodeBlock::new(&g.name, 3);
    let opts = JitOptions {
        code_buffer_limit: 16,
        ..JitOptions::default()
    };
    let plan = CompilationPlan::new(g, cb, rt.vm()).with_options(Arc::new(opts));
    match compile(&plan) {
        CompileResult::Failed(f) => {
            assert!(f.is_resource_exhaustion());
            assert_eq!(f.name, "binop");
        }
        CompileResult::Compiled(_) => panic!("compiled despite the limit"),
    }
}

#[test]
fn malformed_graph_fails_compile() {
    let rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("bad", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let a = gb.constant(int(1));
    gb.node(
        Op::Arrayify(ArrayMode::Int32Array),
        &[a],
        SpecType::EMPTY,
    );
    gb.node(Op::Return, &[], SpecType::EMPTY);
    let g = gb.finish().unwrap();
    let plan = CompilationPlan::new(g, CodeBlock::new("bad", 1), rt.vm());
    match compile(&plan) {
        CompileResult::Failed(f) => {
            assert!(!f.is_resource_exhaustion());
            assert!(f.reason.contains("arrayify"), "{}", f.reason);
        }
        CompileResult::Compiled(_) => panic!("compiled a malformed graph"),
    }
}

/// `function(o) { return arrayify(o).length; }`
fn arrayify_length(mode: ArrayMode) -> Graph {
    let mut gb = GraphBuilder::new("arrayify", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let o = gb.argument(SpecType::OBJECT, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    gb.bytecode(1);
    let a = gb.get_local(o);
    gb.node(Op::Arrayify(mode), &[a], SpecType::EMPTY);
    let st = gb.node(Op::GetIndexedPropertyStorage(mode), &[a], SpecType::EMPTY);
    let len = gb.node(Op::GetArrayLength(mode), &[a, st], SpecType::INT32);
    gb.node(Op::Return, &[len], SpecType::EMPTY);
    gb.finish().unwrap()
}

#[test]
fn arrayify_converts() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, arrayify_length(ArrayMode::Contiguous));

    // Already contiguous: the fast path.
    let arr = rt
        .new_array(ArrayShape::Contiguous, &[int(1), int(2), int(3)])
        .unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[arr]).unwrap();
    assert_eq!(returned(r), int(3));

    // Doubles are boxed in place by the helper.
    let arr = rt
        .new_array(ArrayShape::Double, &[JSValue::double(1.5), JSValue::double(2.5)])
        .unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[arr]).unwrap();
    assert_eq!(returned(r), int(2));
    assert_eq!(
        rt.indexing_type(arr).unwrap() & INDEXING_SHAPE_MASK,
        INDEXING_CONTIGUOUS
    );
    assert_eq!(rt.array_get(arr, 1).unwrap(), JSValue::double(2.5));

    // An object without indexed storage gets an empty butterfly, after which the fast path
    // applies.
    let o = rt.new_object(JSValue::NULL).unwrap();
    for _ in 0..2 {
        let r = rt.call(&cc, JSValue::UNDEFINED, &[o]).unwrap();
        assert_eq!(returned(r), int(0));
    }
    assert_eq!(
        rt.indexing_type(o).unwrap() & INDEXING_SHAPE_MASK,
        INDEXING_CONTIGUOUS
    );
}

#[test]
fn arrayify_exits() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, arrayify_length(ArrayMode::Double));

    // Objects that intercept indexing can never be converted.
    let o = rt.new_object(JSValue::NULL).unwrap();
    rt.make_index_interceptor(o).unwrap();
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[o]).unwrap());
    assert_eq!(x.kind, ExitKind::BadIndexingType);
    assert_eq!(x.origin.bytecode_index, 1);
    assert_eq!(x.arguments[1], o);
    assert_eq!(rt.indexing_type(o).unwrap() & INDEXING_SHAPE_MASK, INDEXING_NONE);

    // The helper leaves arrays with non-numbers alone, so the re-check fails.
    let s = rt.new_string("s").unwrap();
    let arr = rt.new_array(ArrayShape::Contiguous, &[int(1), s]).unwrap();
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[arr]).unwrap());
    assert_eq!(x.kind, ExitKind::BadIndexingType);
    assert_eq!(rt.array_get(arr, 1).unwrap(), s);

    let arr = rt.new_array(ArrayShape::Contiguous, &[int(1), int(2)]).unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[arr]).unwrap();
    assert_eq!(returned(r), int(2));
    assert_eq!(
        rt.indexing_type(arr).unwrap() & INDEXING_SHAPE_MASK,
        INDEXING_DOUBLE
    );
}

#[test]
fn unreachable_blocks_trap() {
    let mut rt = Runtime::new().unwrap();
    let mut compiled = Vec::new();
    for brk in [false, true] {
        let mut gb = GraphBuilder::new("dead", GraphKind::Function);
        gb.argument(SpecType::OTHER, FlushFormat::JSValue);
        let bb0 = gb.block();
        let bb1 = gb.block();
        let bb2 = gb.block();
        gb.set_unreachable(bb1);
        gb.switch_to(bb0);
        gb.node(Op::Jump(bb1), &[], SpecType::EMPTY);
        gb.switch_to(bb2);
        gb.node(Op::Return, &[], SpecType::EMPTY);
        let g = gb.finish().unwrap();
        let opts = JitOptions {
            breakpoint_unreachable: brk,
            ..JitOptions::default()
        };
        let cb = CodeBlock::new(&g.name, 1);
        let cc = compile_plan(CompilationPlan::new(g, cb, rt.vm()).with_options(Arc::new(opts)));
        assert_eq!(cc.asm_log().unwrap().contains("brk"), brk);
        compiled.push(cc);
    }
    match rt.call(&compiled[1], JSValue::UNDEFINED, &[]) {
        Err(SimError::Breakpoint(_)) => (),
        r => panic!("{r:?}"),
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<ProfilerReport>>);

impl Profiler for Recorder {
    fn report(&self, report: ProfilerReport) {
        self.0.lock().push(report);
    }
}

#[test]
fn profiler_reports() {
    let rt = Runtime::new().unwrap();
    let g = int_binop(Op::ArithAdd, NodeFlags::NONE);
    let cb = CodeBlock::new(&g.name, 3);
    let rec = Arc::new(Recorder::default());
    let plan = CompilationPlan::new(g, cb, rt.vm()).with_profiler(Arc::clone(&rec) as _);
    let cc = compile_plan(plan);
    let reports = rec.0.lock();
    assert_eq!(reports.len(), 1);
    let r = &reports[0];
    assert_eq!(r.name, "binop");
    assert!(r.disassembly.contains("add32"));
    assert_eq!(r.exit_sites.len(), cc.exits().len());
    assert!(r.exit_sites.iter().any(|(_, k)| *k == ExitKind::Overflow));
}

#[test]
fn queue_compiles_off_thread() {
    let mut rt = Runtime::new().unwrap();
    let q = CompileQueue::new(2);
    let (tx, rx) = mpsc::channel();
    for i in 0..4 {
        let tx = tx.clone();
        let g = int_binop(Op::ArithAdd, NodeFlags::NONE);
        let cb = CodeBlock::new(&g.name, 3);
        q.push(
            CompilationPlan::new(g, cb, rt.vm()),
            Box::new(move |r| tx.send((i, r)).unwrap()),
        );
    }
    let mut done = (0..4).map(|_| rx.recv().unwrap()).collect::<Vec<_>>();
    done.sort_by_key(|(i, _)| *i);
    assert_eq!(q.pending(), 0);
    for (i, r) in done {
        let CompileResult::Compiled(cc) = r else {
            panic!("compile {i} failed");
        };
        let o = rt.call(&cc, JSValue::UNDEFINED, &[int(i), int(i)]).unwrap();
        assert_eq!(returned(o), int(2 * i));
    }
}

/// `function(s, i) { return s.<op>(i); }`.
fn string_access(op: Op, pred: SpecType) -> Graph {
    let mut gb = GraphBuilder::new("char", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let s = gb.argument(SpecType::STRING, FlushFormat::JSValue);
    let i = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let sv = gb.get_local(s);
    let iv = gb.get_local(i);
    let st = gb.node(
        Op::GetIndexedPropertyStorage(ArrayMode::String),
        &[sv],
        SpecType::EMPTY,
    );
    let c = gb.node(op, &[sv, iv, st], pred);
    gb.node(Op::Return, &[c], SpecType::EMPTY);
    gb.finish().unwrap()
}

#[test]
fn string_chars() {
    let mut rt = Runtime::new().unwrap();
    let cc = compile_graph(&rt, string_access(Op::StringCharCodeAt, SpecType::INT32));
    let s = rt.new_string("hi").unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[s, int(1)]).unwrap();
    assert_eq!(returned(r), int(i32::from(b'i')));
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[s, int(2)]).unwrap());
    assert_eq!(x.kind, ExitKind::OutOfBounds);
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(2), int(0)]).unwrap());
    assert_eq!(x.kind, ExitKind::BadType);

    let cc = compile_graph(&rt, string_access(Op::StringCharAt, SpecType::STRING));
    let s = rt.new_string("a\u{263a}").unwrap();
    let r = returned(rt.call(&cc, JSValue::UNDEFINED, &[s, int(0)]).unwrap());
    assert_eq!(rt.string_value(r).unwrap(), "a");
    // Characters outside the single character cache are made by the slow path.
    let r = returned(rt.call(&cc, JSValue::UNDEFINED, &[s, int(1)]).unwrap());
    assert_eq!(rt.string_value(r).unwrap(), "\u{263a}");
}

#[test]
fn put_by_val_and_length() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("store", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let arr = gb.argument(SpecType::ARRAY, FlushFormat::JSValue);
    let i = gb.argument(SpecType::INT32, FlushFormat::JSValue);
    let v = gb.argument(SpecType::TOP, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let a = gb.get_local(arr);
    let iv = gb.get_local(i);
    let vv = gb.get_local(v);
    let mode = ArrayMode::Contiguous;
    gb.node(Op::CheckArray(mode), &[a], SpecType::EMPTY);
    let st = gb.node(Op::GetIndexedPropertyStorage(mode), &[a], SpecType::EMPTY);
    gb.node(Op::PutByVal(mode), &[a, iv, vv, st], SpecType::EMPTY);
    let len = gb.node(Op::GetArrayLength(mode), &[a, st], SpecType::INT32);
    gb.node(Op::Return, &[len], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());

    let a = rt
        .new_array(ArrayShape::Contiguous, &[int(1), int(2), int(3)])
        .unwrap();
    let r = rt.call(&cc, JSValue::UNDEFINED, &[a, int(1), JSValue::TRUE]).unwrap();
    assert_eq!(returned(r), int(3));
    assert_eq!(rt.array_get(a, 1).unwrap(), JSValue::TRUE);
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[a, int(3), int(0)]).unwrap());
    assert_eq!(x.kind, ExitKind::OutOfBounds);
    assert_eq!(rt.array_get(a, 2).unwrap(), int(3));
}

#[test]
fn instance_of() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("instanceof", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let v = gb.argument(SpecType::TOP, FlushFormat::JSValue);
    let p = gb.argument(SpecType::FINAL_OBJECT, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let vv = gb.get_local(v);
    let pv = gb.get_local(p);
    let r = gb.node(Op::InstanceOf, &[vv, pv], SpecType::BOOLEAN);
    gb.node(Op::Return, &[r], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());

    let proto = rt.new_object(JSValue::NULL).unwrap();
    let mid = rt.new_object(proto).unwrap();
    let o = rt.new_object(mid).unwrap();
    let other = rt.new_object(JSValue::NULL).unwrap();
    for (v, expected) in [
        (o, JSValue::TRUE),
        (mid, JSValue::TRUE),
        (proto, JSValue::FALSE),
        (other, JSValue::FALSE),
        (int(1), JSValue::FALSE),
    ] {
        let r = rt.call(&cc, JSValue::UNDEFINED, &[v, proto]).unwrap();
        assert_eq!(returned(r), expected);
    }
}

#[test]
fn double_to_int32() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("toint", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::NUMBER, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let i = gb.node(Op::ValueToInt32, &[x], SpecType::INT32);
    gb.node(Op::Return, &[i], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());
    for (d, r) in [(3.7, 3), (-2.5, -2), (1e10, 1410065408), (f64::NAN, 0)] {
        let o = rt
            .call(&cc, JSValue::UNDEFINED, &[JSValue::double(d)])
            .unwrap();
        assert_eq!(returned(o), int(r), "ToInt32({d})");
    }
    let r = rt.call(&cc, JSValue::UNDEFINED, &[int(-9)]).unwrap();
    assert_eq!(returned(r), int(-9));
}

#[test]
fn logical_not() {
    let mut rt = Runtime::new().unwrap();
    let mut gb = GraphBuilder::new("not", GraphKind::Function);
    gb.argument(SpecType::OTHER, FlushFormat::JSValue);
    let a = gb.argument(SpecType::BOOLEAN, FlushFormat::JSValue);
    let bb0 = gb.block();
    gb.switch_to(bb0);
    let x = gb.get_local(a);
    let n = gb.node(Op::LogicalNot, &[x], SpecType::BOOLEAN);
    gb.node(Op::Return, &[n], SpecType::EMPTY);
    let cc = compile_graph(&rt, gb.finish().unwrap());
    let r = rt.call(&cc, JSValue::UNDEFINED, &[JSValue::TRUE]).unwrap();
    assert_eq!(returned(r), JSValue::FALSE);
    let r = rt.call(&cc, JSValue::UNDEFINED, &[JSValue::FALSE]).unwrap();
    assert_eq!(returned(r), JSValue::TRUE);
    let x = exited(rt.call(&cc, JSValue::UNDEFINED, &[int(1)]).unwrap());
    assert_eq!(x.kind, ExitKind::BadType);
}
