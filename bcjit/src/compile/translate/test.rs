use super::*;
use crate::{
    asm::assemble,
    compile::CompiledFunction,
    frame::Frame,
    interp::interpret,
    ir::{eval, EvalResult},
    runtime::{FrameEvaluator, FrameResult, InvalidationListener, Object, RtResult},
};
use fm::{FMBuilder, FMatcher};
use regex::Regex;
use std::{cell::Cell, rc::Weak, sync::LazyLock};

/// Use `{{name}}` to match non-literal strings in tests.
static PTN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{.+?\}\}").unwrap());
static PTN_RE_IGNORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{_}\}").unwrap());
static TEXT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap());

fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher_ignore(PTN_RE_IGNORE.clone(), TEXT_RE.clone())
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

fn assert_ir(cf: &CompiledFunction, ptn: &str) {
    let s = cf.func.to_string();
    if let Err(e) = fmatcher(ptn).matches(&s) {
        eprintln!("{e}");
        panic!();
    }
}

/// Runs frames of one code descriptor through its translation, and everything else (including
/// frames that bail out) through the interpreter.
struct Translated {
    cf: CompiledFunction,
    bails: Cell<usize>,
}

impl FrameEvaluator for Translated {
    fn eval_frame(&self, rt: &mut Runtime, frame: &mut Frame) -> FrameResult {
        if frame.code.id() == self.cf.code.id() {
            match eval(&self.cf.func, rt, frame, &self.cf.guards) {
                EvalResult::Return(Some(v)) if frame.stacktop >= 0 => return FrameResult::Yield(v),
                EvalResult::Return(Some(v)) => return FrameResult::Return(v),
                EvalResult::Return(None) => return FrameResult::Raise,
                EvalResult::Bail => self.bails.set(self.bails.get() + 1),
            }
        }
        interpret(rt, frame, None)
    }
}

/// Run the module `src` in the interpreter, returning its globals and the code of the function
/// it bound to `name`.
fn define(rt: &mut Runtime, src: &str, name: &str) -> (ObjId, Rc<CodeDescriptor>) {
    let code = assemble(rt, src).unwrap();
    let g = rt.new_dict();
    let r = rt.run_code(Rc::new(code), g).unwrap();
    rt.decref(r);
    let f = rt.dict_get_str(g, name).unwrap();
    let code = match rt.get(f) {
        Object::Function(func) => match rt.get(func.code) {
            Object::Code(c) => Rc::clone(c),
            _ => panic!(),
        },
        _ => panic!(),
    };
    (g, code)
}

/// Translate `code` and make the runtime run it translated.
fn install(
    rt: &mut Runtime,
    code: &Rc<CodeDescriptor>,
    globals: Option<ObjId>,
    feedback: &FeedbackMap,
    config: &TranslatorConfig,
) -> Rc<Translated> {
    let cf = translate(rt, code, globals, feedback, config).unwrap();
    cf.func.assert_well_formed();
    let t = Rc::new(Translated {
        cf,
        bails: Cell::new(0),
    });
    rt.set_evaluator(Rc::clone(&t) as Rc<dyn FrameEvaluator>);
    t
}

fn call(rt: &mut Runtime, g: ObjId, name: &str, args: &[ObjId]) -> RtResult<ObjId> {
    let f = rt.dict_get_str(g, name).unwrap();
    rt.call(f, args, &[])
}

fn module(def: &str, name: &str) -> String {
    format!("{def}\nmake_function {name} 0\nstore_name {name}\nload_const None\nreturn_value\n")
}

const ADD: &str = "
def add(a, b):
  load_fast a
  load_fast b
  binary_add
  return_value
end";

#[test]
fn binary_op_shape() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(ADD, "add"), "add");
    let cf = translate(
        &rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    )
    .unwrap();
    assert_ir(
        &cf,
        "
        func add(%0: ptr) {
        bb0: ; entry
        ...
        bb{{_}}: ; 2 BINARY_ADD
        %{{_}}: i1 = call @tracing_active()
        ...
        bb{{_}}: ; 3 RETURN_VALUE
        ...
        bb{{_}}: ; 2 untraced
        ...
        %{{r}}: obj = call @binary_add(%{{_}}, %{{_}})
        call @dec_ref(%{{_}})
        call @dec_ref(%{{_}})
        %{{_}}: i1 = icmp eq %{{r}}, null
        ...
        bb{{_}}: ; 2 ok
        %{{sp}}: ptr = load %{{_}}
        store %{{sp}}, %{{r}}
        ...
        }",
    );
    assert!(cf.guards.types().is_empty());
    assert_eq!(cf.elided_branches, 0);
    rt.decref(g);
}

#[test]
fn propagate_records_i32_line() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(ADD, "add"), "add");
    let cf = translate(
        &rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    )
    .unwrap();
    cf.func.assert_well_formed();
    assert_ir(
        &cf,
        "
        func add(%0: ptr) {
        bb0: ; entry
        ...
        %{{ln}}: ptr = alloca i32, 1
        ...
        bb{{_}}: ; propagate
        store %{{_}}, {{_}}
        %{{line}}: i32 = load %{{ln}}
        call @traceback_here(%{{line}})
        %{{_}}: i64 = load %{{_}}
        %{{_}}: ptr = frame_addr %0, lasti
        store %{{_}}, %{{_}}
        %{{_}}: ptr = frame_addr %0, lineno
        store %{{_}}, %{{line}}
        br bb{{_}}
        ...
        }",
    );
    rt.decref(g);
}

#[test]
fn no_line_checks_without_tracing() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(ADD, "add"), "add");
    let config = TranslatorConfig {
        line_trace_checks: false,
        ..TranslatorConfig::default()
    };
    let cf = translate(&rt, &code, Some(g), &FeedbackMap::new(), &config).unwrap();
    // Only the check on entry remains.
    assert_eq!(
        cf.func
            .calls()
            .filter(|f| *f == crate::ir::RuntimeFn::TracingActive)
            .count(),
        1
    );
    rt.decref(g);
}

const LOOP: &str = "
def f(n):
  load_const 0
  store_fast acc
  setup_loop done
  load_global range
  load_fast n
  call_function 1
  get_iter
top:
  for_iter out
  store_fast i
  setup_finally fin
  load_fast acc
  load_fast i
  binary_add
  store_fast acc
  pop_block
  load_const None
fin:
  end_finally
  jump_absolute top
out:
  pop_block
done:
  load_fast acc
  return_value
end";

#[test]
fn loop_matches_interpreter() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(LOOP, "f"), "f");
    let n = rt.new_int(5);
    let expected = call(&mut rt, g, "f", &[n]).unwrap();
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    let before = rt.live_objects();
    for _ in 0..3 {
        let r = call(&mut rt, g, "f", &[n]).unwrap();
        assert_eq!(rt.int_value(r), rt.int_value(expected));
        rt.decref(r);
    }
    assert_eq!(rt.live_objects(), before);
    assert_eq!(t.bails.get(), 0);
    for o in [expected, n, g] {
        rt.decref(o);
    }
}

const SPIN: &str = "
def spin(n):
top:
  load_fast n
  load_const 1
  binary_subtract
  store_fast n
  load_fast n
  pop_jump_if_true top
  load_const None
  return_value
end";

#[test]
fn conditional_back_edge_checks_ticker() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(SPIN, "spin"), "spin");
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    assert_ir(
        &t.cf,
        "
        ...
        bb{{_}}: ; 5 untraced
        ...
        condbr %{{_}}, bb{{be}}, bb{{_}}
        ...
        bb{{be}}: ; 5 back edge
        %{{_}}: i32 = call @decrement_ticker()
        ...
        }",
    );
    let n = rt.new_int(10);
    let before = rt.live_objects();
    let r = call(&mut rt, g, "spin", &[n]).unwrap();
    rt.decref(r);

    rt.set_check_interval(1);
    rt.signal_pending();
    assert!(call(&mut rt, g, "spin", &[n]).is_err());
    let info = rt.err_fetch().unwrap();
    assert_eq!(rt.type_name(info.ty), "KeyboardInterrupt");
    rt.release_exc(info);
    assert_eq!(rt.live_objects(), before);
    assert_eq!(t.bails.get(), 0);
    rt.decref(n);
    rt.decref(g);
}

#[test]
fn forced_bailout_resumes_mid_block() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(LOOP, "f"), "f");
    // Offset 12 is the `BINARY_ADD` inside the `try`: two values are on the stack above the
    // iterator, and the loop and `finally` blocks are both live.
    assert_eq!(code.instrs()[12].op, Opcode::BinaryAdd);
    let config = TranslatorConfig {
        force_bail: [12].into_iter().collect(),
        ..TranslatorConfig::default()
    };
    let t = install(&mut rt, &code, Some(g), &FeedbackMap::new(), &config);
    let before = rt.live_objects();
    let n = rt.new_int(4);
    let r = call(&mut rt, g, "f", &[n]).unwrap();
    assert_eq!(rt.int_value(r), Some(6));
    assert_eq!(t.bails.get(), 1);
    rt.decref(r);
    rt.decref(n);
    assert_eq!(rt.live_objects(), before);
    rt.decref(g);
}

#[test]
fn trace_on_entry_bails() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(ADD, "add"), "add");
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    let (a, b) = (rt.new_int(2), rt.new_int(3));
    rt.set_tracing(true);
    let r = call(&mut rt, g, "add", &[a, b]).unwrap();
    rt.set_tracing(false);
    assert_eq!(rt.int_value(r), Some(5));
    assert_eq!(t.bails.get(), 1);
    for o in [r, a, b, g] {
        rt.decref(o);
    }
}

const SIGN: &str = "
def sign(x):
  load_fast x
  load_const 0
  compare_op <
  pop_jump_if_false pos
  load_const -1
  return_value
pos:
  load_const 1
  return_value
end";

#[test]
fn never_taken_arm_is_elided() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(SIGN, "sign"), "sign");
    let mut fb = FeedbackMap::new();
    for _ in 0..3 {
        fb.record_branch(3, true);
    }
    let config = TranslatorConfig {
        branch_min_samples: 3,
        ..TranslatorConfig::default()
    };
    let t = install(&mut rt, &code, Some(g), &fb, &config);
    assert_eq!(t.cf.elided_branches, 1);
    assert_ir(
        &t.cf,
        "
        ...
        bb{{_}}: ; 3 untraced
        ...
        condbr %{{_}}, bb{{_}}, bb{{bail}}
        ...
        bb{{bail}}: ; 3 bail GuardFail to 4
        store %{{_}}, 4i64
        ...
        }",
    );
    let pos = rt.new_int(5);
    let r = call(&mut rt, g, "sign", &[pos]).unwrap();
    assert_eq!(rt.int_value(r), Some(1));
    assert_eq!(t.bails.get(), 0);
    rt.decref(r);
    // The elided arm still computes the right answer, in the interpreter.
    let neg = rt.new_int(-5);
    let r = call(&mut rt, g, "sign", &[neg]).unwrap();
    assert_eq!(rt.int_value(r), Some(-1));
    assert_eq!(t.bails.get(), 1);
    for o in [r, pos, neg, g] {
        rt.decref(o);
    }
}

#[test]
fn too_few_samples_keeps_both_arms() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(SIGN, "sign"), "sign");
    let mut fb = FeedbackMap::new();
    fb.record_branch(3, true);
    let cf = translate(&rt, &code, Some(g), &fb, &TranslatorConfig::default()).unwrap();
    assert_eq!(cf.elided_branches, 0);
    assert!(!cf.func.to_string().contains("GuardFail"));
    rt.decref(g);
}

const GET_X: &str = "
def get(o):
  load_fast o
  load_attr x
  return_value
end";

#[test]
fn speculated_slot_load() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(GET_X, "get"), "get");
    let c = rt.new_class("C", None, &["x"], false);
    let o = rt.new_instance(c);
    let v = rt.new_int(7);
    rt.setattr_str(o, "x", Some(v)).unwrap();
    let mut fb = FeedbackMap::new();
    fb.record_type(1, 0, c);
    let t = install(&mut rt, &code, Some(g), &fb, &TranslatorConfig::default());
    assert_eq!(t.cf.guards.types(), &[c]);
    assert_ir(
        &t.cf,
        "
        ...
        bb{{_}}: ; 1 LOAD_ATTR
        ...
        %{{_}}: i1 = call @guards_valid()
        ...
        %{{t}}: obj = call @type_of(%{{_}})
        %{{_}}: i1 = icmp eq %{{t}}, {{_}}
        ...
        bb{{_}}: ; 1 fast
        ...
        %{{_}}: obj = call @slot_get(%{{_}}, 0i32, 0i32)
        ...
        bb{{_}}: ; 1 slow
        ...
        %{{_}}: obj = call @get_attr(%{{_}}, 0i32)
        ...
        }",
    );
    let l: Weak<dyn InvalidationListener> = Rc::downgrade(&t.cf.guards) as _;
    rt.subscribe(c, l);
    let r = call(&mut rt, g, "get", &[o]).unwrap();
    assert_eq!(r, v);
    rt.decref(r);
    assert_eq!(t.bails.get(), 0);

    // Any other type takes the generic lookup without leaving translated code.
    let d = rt.new_class("D", None, &[], true);
    let x = rt.new_instance(d);
    rt.setattr_str(x, "x", Some(v)).unwrap();
    let before = rt.live_objects();
    let r = call(&mut rt, g, "get", &[x]).unwrap();
    assert_eq!(r, v);
    rt.decref(r);
    assert_eq!(rt.live_objects(), before);
    assert_eq!(t.bails.get(), 0);
    rt.setattr_str(x, "x", None).unwrap();
    rt.decref(x);
    rt.decref(d);

    // Once the class changes, the fast path can no longer be trusted.
    let none = rt.none();
    rt.setattr_str(c, "y", Some(none)).unwrap();
    assert!(!t.cf.guards.is_valid());
    let r = call(&mut rt, g, "get", &[o]).unwrap();
    assert_eq!(r, v);
    assert_eq!(t.bails.get(), 1);
    for x in [r, v, o, c, g] {
        rt.decref(x);
    }
}

#[test]
fn polymorphic_attr_is_generic() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(GET_X, "get"), "get");
    let c = rt.new_class("C", None, &["x"], false);
    let d = rt.new_class("D", None, &[], true);
    let mut fb = FeedbackMap::new();
    fb.record_type(1, 0, c);
    fb.record_type(1, 0, d);
    let cf = translate(&rt, &code, Some(g), &fb, &TranslatorConfig::default()).unwrap();
    assert!(cf.guards.types().is_empty());
    assert!(!cf
        .func
        .calls()
        .any(|f| f == crate::ir::RuntimeFn::GuardsValid));
    for x in [c, d, g] {
        rt.decref(x);
    }
}

const GET_K: &str = "
def get():
  load_global k
  return_value
end";

#[test]
fn global_fast_path_and_fallback() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(GET_K, "get"), "get");
    let (one, two) = (rt.new_int(1), rt.new_int(2));
    rt.dict_set_str(g, "k", one);
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    assert_ir(
        &t.cf,
        "
        ...
        bb{{_}}: ; 0 LOAD_GLOBAL
        ...
        %{{_}}: i64 = call @dict_version(%{{_}})
        ...
        bb{{_}}: ; 0 fast
        ...
        bb{{_}}: ; 0 slow
        ...
        %{{_}}: obj = call @load_global(%{{_}}, %{{_}}, 0i32)
        ...
        }",
    );
    let r = call(&mut rt, g, "get", &[]).unwrap();
    assert_eq!(r, one);
    rt.decref(r);
    // A changed global takes the slow path.
    rt.dict_set_str(g, "k", two);
    let r = call(&mut rt, g, "get", &[]).unwrap();
    assert_eq!(r, two);
    rt.decref(r);
    assert_eq!(t.bails.get(), 0);
    for o in [one, two, g] {
        rt.decref(o);
    }
}

#[test]
fn unknown_globals_are_not_speculated() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(GET_K, "get"), "get");
    let cf = translate(
        &rt,
        &code,
        None,
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    )
    .unwrap();
    let calls = cf.func.calls().collect::<Vec<_>>();
    assert!(calls.contains(&crate::ir::RuntimeFn::LoadGlobal));
    assert!(!calls.contains(&crate::ir::RuntimeFn::DictVersion));
    rt.decref(g);
}

#[test]
fn generator_resumes_after_yield() {
    let mut rt = Runtime::new();
    let (g, code) = define(
        &mut rt,
        &module(
            "
def gen(n):
  .generator
  setup_loop done
  load_global range
  load_fast n
  call_function 1
  get_iter
top:
  for_iter out
  load_const 10
  binary_multiply
  yield_value
  pop_top
  jump_absolute top
out:
  pop_block
done:
  load_const None
  return_value
end",
            "gen",
        ),
        "gen",
    );
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    let before = rt.live_objects();
    let n = rt.new_int(3);
    let gen = call(&mut rt, g, "gen", &[n]).unwrap();
    let items = rt.collect_iter(gen).unwrap();
    assert_eq!(
        items.iter().map(|x| rt.int_value(*x)).collect::<Vec<_>>(),
        vec![Some(0), Some(10), Some(20)]
    );
    for o in items.into_iter().chain([gen, n]) {
        rt.decref(o);
    }
    assert_eq!(rt.live_objects(), before);
    assert_eq!(t.bails.get(), 0);
    rt.decref(g);
}

#[test]
fn yield_outside_generator() {
    let mut rt = Runtime::new();
    let code = assemble(
        &mut rt,
        "
def f():
  load_const None
  yield_value
  return_value
end
load_const None
return_value
",
    )
    .unwrap();
    let f = match rt.get(code.consts[0]) {
        Object::Code(c) => Rc::clone(c),
        _ => panic!(),
    };
    match translate(
        &rt,
        &f,
        None,
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    ) {
        Err(CompilationError::General(m)) => assert_eq!(m, "f: YIELD_VALUE outside a generator"),
        _ => panic!(),
    }
}

#[test]
fn nested_try() {
    let mut rt = Runtime::new();
    let (g, code) = define(
        &mut rt,
        &module(
            "
def f(d):
  setup_finally fin
  setup_except handler
  load_fast d
  load_const 'k'
  binary_subscr
  pop_top
  pop_block
  jump_forward after
handler:
  pop_top
  pop_top
  pop_top
  load_global print
  load_const 'caught'
  call_function 1
  pop_top
after:
  pop_block
  load_const None
fin:
  load_global print
  load_const 'finally'
  call_function 1
  pop_top
  end_finally
  load_const 7
  return_value
end",
            "f",
        ),
        "f",
    );
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    let (empty, full, one) = (rt.new_dict(), rt.new_dict(), rt.new_int(1));
    rt.dict_set_str(full, "k", one);
    // The first exception handled stays alive as the one most recently handled, until the
    // next replaces it.
    let r = call(&mut rt, g, "f", &[empty]).unwrap();
    rt.decref(r);
    rt.take_stdout();
    let before = rt.live_objects();
    for (d, out) in [(empty, "caught\nfinally\n"), (full, "finally\n")] {
        let r = call(&mut rt, g, "f", &[d]).unwrap();
        assert_eq!(rt.int_value(r), Some(7));
        assert_eq!(rt.take_stdout(), out);
        assert!(!rt.err_occurred());
        rt.decref(r);
    }
    assert_eq!(rt.live_objects(), before);
    assert_eq!(t.bails.get(), 0);
    for o in [empty, full, one, g] {
        rt.decref(o);
    }
}

#[test]
fn three_deep_try() {
    let mut rt = Runtime::new();
    let (g, code) = define(
        &mut rt,
        &module(
            "
def f(d):
  setup_finally outer_fin
  setup_except handler
  setup_finally inner_fin
  load_fast d
  load_const 'k'
  binary_subscr
  pop_top
  pop_block
  load_const None
inner_fin:
  load_global print
  load_const 'inner finally'
  call_function 1
  pop_top
  end_finally
  pop_block
  jump_forward after
handler:
  pop_top
  pop_top
  pop_top
  load_global print
  load_const 'caught'
  call_function 1
  pop_top
after:
  pop_block
  load_const None
outer_fin:
  load_global print
  load_const 'outer finally'
  call_function 1
  pop_top
  end_finally
  load_const 7
  return_value
end",
            "f",
        ),
        "f",
    );
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    let (empty, full, one) = (rt.new_dict(), rt.new_dict(), rt.new_int(1));
    rt.dict_set_str(full, "k", one);
    let r = call(&mut rt, g, "f", &[empty]).unwrap();
    rt.decref(r);
    assert_eq!(rt.take_stdout(), "inner finally\ncaught\nouter finally\n");
    let before = rt.live_objects();
    for (d, out) in [
        (full, "inner finally\nouter finally\n"),
        (empty, "inner finally\ncaught\nouter finally\n"),
    ] {
        let r = call(&mut rt, g, "f", &[d]).unwrap();
        assert_eq!(rt.int_value(r), Some(7));
        assert_eq!(rt.take_stdout(), out);
        rt.decref(r);
    }
    assert_eq!(rt.live_objects(), before);
    assert_eq!(t.bails.get(), 0);
    for o in [empty, full, one, g] {
        rt.decref(o);
    }
}

#[test]
fn two_yield_sites() {
    let mut rt = Runtime::new();
    let (g, code) = define(
        &mut rt,
        &module(
            "
def gen():
  .generator
  load_const 1
  yield_value
  pop_top
  load_global print
  load_const 'after first'
  call_function 1
  pop_top
  load_const 2
  yield_value
  pop_top
  load_global print
  load_const 'after second'
  call_function 1
  pop_top
  load_const None
  return_value
end",
            "gen",
        ),
        "gen",
    );
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    let before = rt.live_objects();
    let gen = call(&mut rt, g, "gen", &[]).unwrap();
    let none = rt.none();
    let first = rt.gen_send(gen, none).unwrap().unwrap();
    assert_eq!(rt.int_value(first), Some(1));
    assert_eq!(rt.take_stdout(), "");
    let second = rt.gen_send(gen, none).unwrap().unwrap();
    assert_eq!(rt.int_value(second), Some(2));
    assert_eq!(rt.take_stdout(), "after first\n");
    assert_eq!(rt.gen_send(gen, none).unwrap(), None);
    assert_eq!(rt.take_stdout(), "after second\n");
    // A finished generator stays finished.
    assert_eq!(rt.gen_send(gen, none).unwrap(), None);
    for o in [first, second, gen] {
        rt.decref(o);
    }
    assert_eq!(rt.live_objects(), before);
    assert_eq!(t.bails.get(), 0);
    rt.decref(g);
}

#[test]
fn forced_bailout_on_attr_and_call() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(GET_X, "get"), "get");
    let c = rt.new_class("C", None, &["x"], false);
    let o = rt.new_instance(c);
    let v = rt.new_int(7);
    rt.setattr_str(o, "x", Some(v)).unwrap();
    let mut fb = FeedbackMap::new();
    fb.record_type(1, 0, c);
    let config = TranslatorConfig {
        force_bail: [1].into_iter().collect(),
        ..TranslatorConfig::default()
    };
    let t = install(&mut rt, &code, Some(g), &fb, &config);
    let r = call(&mut rt, g, "get", &[o]).unwrap();
    assert_eq!(r, v);
    assert_eq!(t.bails.get(), 1);
    for x in [r, v, o, c, g] {
        rt.decref(x);
    }

    let (g, code) = define(
        &mut rt,
        &module(
            "
def twice(f, x):
  load_fast f
  load_fast x
  call_function 1
  load_const 2
  binary_multiply
  return_value
end",
            "twice",
        ),
        "twice",
    );
    assert_eq!(code.instrs()[2].op, Opcode::CallFunction);
    let config = TranslatorConfig {
        force_bail: [2].into_iter().collect(),
        ..TranslatorConfig::default()
    };
    let t = install(&mut rt, &code, Some(g), &FeedbackMap::new(), &config);
    let len = rt.dict_get_str(rt.builtins(), "len").unwrap();
    let s = rt.new_str("abc");
    let r = call(&mut rt, g, "twice", &[len, s]).unwrap();
    assert_eq!(rt.int_value(r), Some(6));
    assert_eq!(t.bails.get(), 1);
    for x in [r, s, g] {
        rt.decref(x);
    }
}

#[test]
fn exception_propagates_with_traceback() {
    let mut rt = Runtime::new();
    let (g, code) = define(
        &mut rt,
        &module(
            "
def boom(a):
  load_fast a
  load_const 0
  binary_divide
  return_value
end",
            "boom",
        ),
        "boom",
    );
    install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    let before = rt.live_objects();
    let a = rt.new_int(1);
    assert!(call(&mut rt, g, "boom", &[a]).is_err());
    let info = rt.err_fetch().unwrap();
    assert_eq!(rt.type_name(info.ty), "ZeroDivisionError");
    assert_eq!(rt.traceback_lines(info.tb), vec![5]);
    rt.release_exc(info);
    rt.decref(a);
    assert_eq!(rt.live_objects(), before);
    rt.decref(g);
}

#[test]
fn unbound_local() {
    let mut rt = Runtime::new();
    let (g, code) = define(
        &mut rt,
        &module(
            "
def f():
  load_fast x
  return_value
end",
            "f",
        ),
        "f",
    );
    install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    assert!(call(&mut rt, g, "f", &[]).is_err());
    let info = rt.err_fetch().unwrap();
    assert_eq!(
        rt.format_exception(&info),
        "UnboundLocalError: local variable 'x' referenced before assignment"
    );
    rt.release_exc(info);
    rt.decref(g);
}

#[test]
fn block_stack_limit() {
    let mut rt = Runtime::new();
    let depth = MAX_BLOCKS + 1;
    let mut src = String::new();
    for i in 0..depth {
        src.push_str(&format!("setup_loop l{i}\n"));
    }
    for i in (0..depth).rev() {
        src.push_str(&format!("pop_block\nl{i}:\n"));
    }
    src.push_str("load_const None\nreturn_value\n");
    let code = Rc::new(assemble(&mut rt, &src).unwrap());
    assert!(matches!(
        translate(
            &rt,
            &code,
            None,
            &FeedbackMap::new(),
            &TranslatorConfig::default()
        ),
        Err(CompilationError::LimitExceeded(_))
    ));
}

#[test]
fn operands_out_of_range() {
    let rt = Runtime::new();
    let cases: [&[(Opcode, u32)]; 3] = [
        &[(Opcode::LoadConst, 5), (Opcode::ReturnValue, 0)],
        &[(Opcode::LoadFast, 0), (Opcode::ReturnValue, 0)],
        &[(Opcode::LoadDeref, 2), (Opcode::ReturnValue, 0)],
    ];
    for instrs in cases {
        let instrs = instrs
            .iter()
            .map(|(op, arg)| Instr { op: *op, arg: *arg })
            .collect::<Vec<_>>();
        let code = Rc::new(CodeDescriptor::new("f", crate::code::encode(&instrs)).unwrap());
        match translate(
            &rt,
            &code,
            None,
            &FeedbackMap::new(),
            &TranslatorConfig::default(),
        ) {
            Err(CompilationError::General(msg)) => assert!(msg.contains("out of range")),
            _ => panic!(),
        }
    }
}

#[test]
fn end_finally_rejects_unknown_reason() {
    let mut rt = Runtime::new();
    let (g, code) = define(
        &mut rt,
        &module(
            "
def f():
  setup_finally fin
  pop_block
  load_const 99
fin:
  end_finally
  load_const None
  return_value
end",
            "f",
        ),
        "f",
    );
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    let before = rt.live_objects();
    assert!(call(&mut rt, g, "f", &[]).is_err());
    let info = rt.err_fetch().unwrap();
    assert_eq!(
        rt.format_exception(&info),
        "SystemError: 'finally' pops bad exception"
    );
    rt.release_exc(info);
    assert_eq!(rt.live_objects(), before);
    assert_eq!(t.bails.get(), 0);
    rt.decref(g);
}

const WITH: &str = "
def swallow(t, v, tb):
  load_global print
  load_const 'exit'
  call_function 1
  pop_top
  load_fast t
  return_value
end
def keep(t, v, tb):
  load_global print
  load_const 'exit'
  call_function 1
  pop_top
  load_const None
  return_value
end
def f(mgr, x):
  setup_finally fin
  load_const 1
  load_fast x
  binary_divide
  pop_top
  pop_block
  load_const None
fin:
  load_fast mgr
  with_cleanup
  end_finally
  load_const 'after'
  return_value
end
make_function swallow 0
store_name swallow
make_function keep 0
store_name keep
make_function f 0
store_name f
load_const None
return_value
";

#[test]
fn with_cleanup_calls_exit() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, WITH, "f");
    let swallow = rt.dict_get_str(g, "swallow").unwrap();
    let keep = rt.dict_get_str(g, "keep").unwrap();
    let (zero, one) = (rt.new_int(0), rt.new_int(1));
    let t = install(
        &mut rt,
        &code,
        Some(g),
        &FeedbackMap::new(),
        &TranslatorConfig::default(),
    );
    assert_ir(
        &t.cf,
        "
        ...
        bb{{_}}: ; 8 with exception
        ...
        %{{_}}: obj = call @call_exit(%{{_}}, %{{_}}, %{{_}}, %{{_}})
        ...
        bb{{_}}: ; 8 with no exception
        ...
        }",
    );
    // Warm up the exception machinery before counting objects.
    let r = call(&mut rt, g, "f", &[swallow, zero]).unwrap();
    rt.decref(r);
    rt.take_stdout();
    let before = rt.live_objects();

    let r = call(&mut rt, g, "f", &[keep, one]).unwrap();
    assert_eq!(rt.str_of(r), "after");
    rt.decref(r);
    let r = call(&mut rt, g, "f", &[swallow, zero]).unwrap();
    assert_eq!(rt.str_of(r), "after");
    assert!(!rt.err_occurred());
    rt.decref(r);
    assert_eq!(rt.take_stdout(), "exit\nexit\n");
    assert_eq!(rt.live_objects(), before);

    assert!(call(&mut rt, g, "f", &[keep, zero]).is_err());
    assert_eq!(rt.take_stdout(), "exit\n");
    let info = rt.err_fetch().unwrap();
    assert_eq!(rt.type_name(info.ty), "ZeroDivisionError");
    rt.release_exc(info);
    assert_eq!(t.bails.get(), 0);
    for o in [zero, one, g] {
        rt.decref(o);
    }
}

const SIZE: &str = "
def size(x):
  load_global len
  load_fast x
  call_function 1
  return_value
end";

#[test]
fn builtin_call_fast_path_and_fallback() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(SIZE, "size"), "size");
    let len = rt.dict_get_str(rt.builtins(), "len").unwrap();
    let mut fb = FeedbackMap::new();
    fb.record_call(2, len, 1);
    let t = install(&mut rt, &code, Some(g), &fb, &TranslatorConfig::default());
    assert_ir(
        &t.cf,
        "
        ...
        bb{{_}}: ; 2 call
        ...
        %{{_}}: i1 = icmp eq %{{_}}, {{_}}
        condbr %{{_}}, bb{{fast}}, bb{{slow}}
        ...
        bb{{fast}}: ; 2 fast
        %{{_}}: ptr = load %{{_}}
        %{{args}}: ptr = ptr_add %{{_}}, -1i64
        %{{_}}: obj = call @call_builtin[len](%{{args}}, 1i64)
        ...
        bb{{slow}}: ; 2 slow
        ...
        %{{_}}: obj = call @call_function(%{{_}}, 1i32)
        ...
        }",
    );
    let s = rt.new_str("abcd");
    let before = rt.live_objects();
    let r = call(&mut rt, g, "size", &[s]).unwrap();
    assert_eq!(rt.int_value(r), Some(4));
    rt.decref(r);
    assert_eq!(rt.live_objects(), before);

    // Rebinding `len` sends the call down the generic path.
    let abs = rt.dict_get_str(rt.builtins(), "abs").unwrap();
    rt.dict_set_str(g, "len", abs);
    let n = rt.new_int(-3);
    let r = call(&mut rt, g, "size", &[n]).unwrap();
    assert_eq!(rt.int_value(r), Some(3));
    assert_eq!(t.bails.get(), 0);
    for o in [r, n, s, g] {
        rt.decref(o);
    }
}

#[test]
fn polymorphic_call_is_generic() {
    let mut rt = Runtime::new();
    let (g, code) = define(&mut rt, &module(SIZE, "size"), "size");
    let len = rt.dict_get_str(rt.builtins(), "len").unwrap();
    let abs = rt.dict_get_str(rt.builtins(), "abs").unwrap();
    let mut fb = FeedbackMap::new();
    fb.record_call(2, len, 1);
    fb.record_call(2, abs, 1);
    let cf = translate(&rt, &code, Some(g), &fb, &TranslatorConfig::default()).unwrap();
    assert!(!cf.func.to_string().contains("call_builtin"));

    // Only builtins are called directly.
    let mut fb = FeedbackMap::new();
    let f = rt.new_code(Rc::clone(&code));
    fb.record_call(2, f, 1);
    let cf = translate(&rt, &code, Some(g), &fb, &TranslatorConfig::default()).unwrap();
    assert!(!cf.func.to_string().contains("call_builtin"));
    rt.decref(f);
    rt.decref(g);
}
