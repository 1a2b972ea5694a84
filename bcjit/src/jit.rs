//! The JIT driver: decides when functions are translated, runs translated code, and hands frames
//! back to the interpreter when translated code bails out.

use crate::{
    code::{CodeDescriptor, CodeId},
    compile::{translate, CompilationError, CompiledFunction, TranslatorConfig},
    feedback::FeedbackMap,
    frame::Frame,
    interp::interpret,
    ir::{eval, EvalResult},
    log::{
        log_ir, should_log_ir,
        stats::{Stats, TimingState},
        IRPhase, Log, Verbosity,
    },
    runtime::{FrameEvaluator, FrameResult, InvalidationListener, ObjId, Runtime},
};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    env,
    error::Error,
    mem,
    rc::{Rc, Weak},
};

/// How many calls a function is interpreted for before it is translated.
pub type HotThreshold = u32;
const DEFAULT_HOT_THRESHOLD: HotThreshold = 2;

/// Configure and create a [Jit].
pub struct JitBuilder {
    hot_threshold: HotThreshold,
    config: TranslatorConfig,
    log: Option<Log>,
}

impl JitBuilder {
    /// Create a JIT builder with default parameters.
    pub fn new() -> Self {
        Self {
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            config: TranslatorConfig::default(),
            log: None,
        }
    }

    /// Create a JIT builder whose parameters are overridden by the `BCJIT_HOT_THRESHOLD` and
    /// `BCJIT_BRANCH_MIN_SAMPLES` environment variables, and which logs according to
    /// `BCJIT_LOG`.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut b = Self::new().log(Log::new()?);
        if let Ok(s) = env::var("BCJIT_HOT_THRESHOLD") {
            b.hot_threshold = s
                .parse()
                .map_err(|e| format!("Invalid BCJIT_HOT_THRESHOLD '{s}': {e}"))?;
        }
        if let Ok(s) = env::var("BCJIT_BRANCH_MIN_SAMPLES") {
            b.config.branch_min_samples = s
                .parse()
                .map_err(|e| format!("Invalid BCJIT_BRANCH_MIN_SAMPLES '{s}': {e}"))?;
        }
        Ok(b)
    }

    /// Consume the `JitBuilder` and create a [Jit].
    pub fn build(self) -> Rc<Jit> {
        Rc::new(Jit {
            hot_threshold: self.hot_threshold,
            config: self.config,
            log: match self.log {
                Some(l) => l,
                None => Log::disabled(),
            },
            stats: Stats::new(),
            funcs: RefCell::new(HashMap::new()),
        })
    }

    /// Translate a function once it has been called more than `hot_threshold` times.
    pub fn hot_threshold(mut self, hot_threshold: HotThreshold) -> Self {
        self.hot_threshold = hot_threshold;
        self
    }

    pub fn branch_min_samples(mut self, n: u64) -> Self {
        self.config.branch_min_samples = n;
        self
    }

    pub fn speculate_attrs(mut self, on: bool) -> Self {
        self.config.speculate_attrs = on;
        self
    }

    pub fn speculate_globals(mut self, on: bool) -> Self {
        self.config.speculate_globals = on;
        self
    }

    pub fn speculate_calls(mut self, on: bool) -> Self {
        self.config.speculate_calls = on;
        self
    }

    pub fn line_trace_checks(mut self, on: bool) -> Self {
        self.config.line_trace_checks = on;
        self
    }

    /// Translate the instructions at `offsets` as unconditional bailouts.
    pub fn force_bail(mut self, offsets: impl IntoIterator<Item = usize>) -> Self {
        self.config.force_bail = offsets.into_iter().collect::<HashSet<_>>();
        self
    }

    pub fn log(mut self, log: Log) -> Self {
        self.log = Some(log);
        self
    }
}

impl Default for JitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What the driver knows about one code descriptor.
#[derive(Default)]
struct FuncState {
    /// How many times a frame for this code has been entered from the start.
    calls: u64,
    /// Feedback recorded while interpreting. Taken out while a frame is being interpreted.
    feedback: FeedbackMap,
    compiled: Option<Rc<CompiledFunction>>,
    /// Translation failed: don't try again.
    untranslatable: bool,
}

/// A [FrameEvaluator] which interprets functions until they are hot and then runs translated
/// code.
pub struct Jit {
    hot_threshold: HotThreshold,
    config: TranslatorConfig,
    log: Log,
    stats: Stats,
    funcs: RefCell<HashMap<CodeId, FuncState>>,
}

impl Jit {
    /// Translate `code` with explicit `feedback`. `globals` is the dictionary `LOAD_GLOBAL` fast
    /// paths are specialised on, if any.
    pub fn translate(
        &self,
        rt: &Runtime,
        code: &Rc<CodeDescriptor>,
        globals: Option<ObjId>,
        feedback: &FeedbackMap,
    ) -> Result<CompiledFunction, CompilationError> {
        if should_log_ir(IRPhase::Bytecode) {
            log_ir(&format!(
                "--- Begin bytecode: {} ---\n{}--- End bytecode ---\n",
                code.name,
                code.disassemble(rt)
            ));
        }
        self.log.log(
            Verbosity::JITEvent,
            &format!("start translating {}", code.name),
        );
        self.stats.timing_state(TimingState::Translating);
        let r = translate(rt, code, globals, feedback, &self.config);
        self.stats.timing_state(TimingState::Interpreting);
        match &r {
            Ok(cf) => {
                self.stats.function_translated_ok(cf.elided_branches);
                self.log.log(
                    Verbosity::JITEvent,
                    &format!(
                        "stop translating {} ({} elided branches, {} guard dependencies)",
                        code.name,
                        cf.elided_branches,
                        cf.guards.types().len()
                    ),
                );
                if should_log_ir(IRPhase::IR) {
                    log_ir(&format!(
                        "--- Begin ir: {} ---\n{}\n--- End ir ---\n",
                        code.name, cf.func
                    ));
                }
            }
            Err(e) => {
                self.stats.function_translated_err();
                self.log.log(
                    Verbosity::Warning,
                    &format!("translating {} failed: {e}", code.name),
                );
            }
        }
        r
    }

    /// Is there a translation of `code` ready to run?
    pub fn is_compiled(&self, code: &CodeDescriptor) -> bool {
        matches!(self.funcs.borrow().get(&code.id()), Some(st) if st.compiled.is_some())
    }

    /// Find the translation to run for `frame`, translating it first if it has become hot.
    fn compiled_for(&self, rt: &mut Runtime, frame: &Frame) -> Option<Rc<CompiledFunction>> {
        let mut funcs = self.funcs.borrow_mut();
        let st = funcs.entry(frame.code.id()).or_default();
        if let Some(cf) = &st.compiled {
            if !cf.guards.is_valid() {
                self.stats.invalidated();
                self.log.log(
                    Verbosity::JITEvent,
                    &format!("discarding invalidated translation of {}", frame.code.name),
                );
                st.compiled = None;
            }
        }
        if frame.lasti == -1 {
            st.calls += 1;
        }
        if st.compiled.is_none() && !st.untranslatable && st.calls > u64::from(self.hot_threshold)
        {
            match self.translate(rt, &frame.code, Some(frame.globals), &st.feedback) {
                Ok(cf) => {
                    let cf = Rc::new(cf);
                    let guards = Rc::clone(&cf.guards);
                    for ty in guards.types() {
                        let l: Weak<dyn InvalidationListener> = Rc::downgrade(&guards) as _;
                        rt.subscribe(*ty, l);
                    }
                    st.compiled = Some(cf);
                }
                Err(_) => st.untranslatable = true,
            }
        }
        st.compiled.clone()
    }

    fn interpret(&self, rt: &mut Runtime, frame: &mut Frame) -> FrameResult {
        let id = frame.code.id();
        // Recursive calls of the same code record into a fresh map, which is merged back in
        // before ours is.
        let mut fb = match self.funcs.borrow_mut().get_mut(&id) {
            Some(st) => mem::take(&mut st.feedback),
            None => FeedbackMap::new(),
        };
        let r = interpret(rt, frame, Some(&mut fb));
        self.funcs
            .borrow_mut()
            .entry(id)
            .or_default()
            .feedback
            .merge(fb);
        r
    }
}

impl FrameEvaluator for Jit {
    fn eval_frame(&self, rt: &mut Runtime, frame: &mut Frame) -> FrameResult {
        if let Some(cf) = self.compiled_for(rt, frame) {
            self.stats.native_executed();
            self.stats.timing_state(TimingState::NativeExecuting);
            let r = eval(&cf.func, rt, frame, &cf.guards);
            self.stats.timing_state(TimingState::Interpreting);
            match r {
                EvalResult::Return(Some(v)) if frame.stacktop >= 0 => {
                    return FrameResult::Yield(v)
                }
                EvalResult::Return(Some(v)) => return FrameResult::Return(v),
                EvalResult::Return(None) => return FrameResult::Raise,
                EvalResult::Bail => {
                    self.stats.bailout();
                    self.log.log(
                        Verbosity::JITEvent,
                        &format!(
                            "bailout from {}: {} resuming at {}",
                            cf.code.name, frame.bail_reason, frame.lasti
                        ),
                    );
                }
            }
        }
        self.interpret(rt, frame)
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        self.stats.output();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::asm::assemble;

    fn jit_runtime(b: JitBuilder) -> (Runtime, Rc<Jit>) {
        let mut rt = Runtime::new();
        let jit = b.build();
        rt.set_evaluator(Rc::clone(&jit) as Rc<dyn FrameEvaluator>);
        (rt, jit)
    }

    fn counter(jit: &Jit, name: &str) -> u64 {
        jit.stats
            .counters()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .unwrap()
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
  load_fast acc
  binary_add
  store_fast acc
  jump_absolute top
out:
  pop_block
done:
  load_fast acc
  return_value
end
make_function f 0
store_name f
load_const None
return_value
";

    #[test]
    fn translates_when_hot() {
        let (mut rt, jit) = jit_runtime(JitBuilder::new().hot_threshold(2));
        let code = assemble(&mut rt, LOOP).unwrap();
        let g = rt.new_dict();
        let r = rt.run_code(Rc::new(code), g).unwrap();
        rt.decref(r);
        let f = rt.dict_get_str(g, "f").unwrap();
        let n = rt.new_int(5);
        for i in 0..4 {
            let r = rt.call(f, &[n], &[]).unwrap();
            assert_eq!(rt.int_value(r), Some(10));
            rt.decref(r);
            assert_eq!(counter(&jit, "native_executions"), i.max(1) - 1);
        }
        assert_eq!(counter(&jit, "functions_translated_ok"), 1);
        rt.decref(n);
        rt.decref(g);
    }

    #[test]
    fn forced_bailout_resumes_in_interpreter() {
        // Offset 8 is `load_fast acc` in the loop body.
        let (mut rt, jit) = jit_runtime(JitBuilder::new().hot_threshold(0).force_bail([8]));
        let code = assemble(&mut rt, LOOP).unwrap();
        let g = rt.new_dict();
        let r = rt.run_code(Rc::new(code), g).unwrap();
        rt.decref(r);
        let f = rt.dict_get_str(g, "f").unwrap();
        let n = rt.new_int(4);
        let r = rt.call(f, &[n], &[]).unwrap();
        assert_eq!(rt.int_value(r), Some(6));
        assert_eq!(counter(&jit, "bailouts"), 1);
        for o in [r, n, g] {
            rt.decref(o);
        }
    }

    #[test]
    fn invalidated_translation_is_discarded() {
        let (mut rt, jit) = jit_runtime(JitBuilder::new().hot_threshold(2));
        let code = assemble(
            &mut rt,
            "
def get(o):
  load_fast o
  load_attr x
  return_value
end
make_function get 0
store_name get
load_const None
return_value
",
        )
        .unwrap();
        let g = rt.new_dict();
        let r = rt.run_code(Rc::new(code), g).unwrap();
        rt.decref(r);
        let get = rt.dict_get_str(g, "get").unwrap();
        let c = rt.new_class("C", None, &[], true);
        let o = rt.new_instance(c);
        let one = rt.new_int(1);
        rt.setattr_str(o, "x", Some(one)).unwrap();
        for _ in 0..3 {
            let r = rt.call(get, &[o], &[]).unwrap();
            assert_eq!(r, one);
            rt.decref(r);
        }
        let code = match rt.get(get) {
            crate::runtime::Object::Function(func) => match rt.get(func.code) {
                crate::runtime::Object::Code(c) => Rc::clone(c),
                _ => panic!(),
            },
            _ => panic!(),
        };
        assert!(jit.is_compiled(&code));
        // Mutating the class invalidates the speculative attribute access.
        rt.setattr_str(c, "y", Some(one)).unwrap();
        let r = rt.call(get, &[o], &[]).unwrap();
        assert_eq!(r, one);
        rt.decref(r);
        assert_eq!(counter(&jit, "invalidations"), 1);
        assert_eq!(counter(&jit, "functions_translated_ok"), 2);
        for x in [one, o, c, g] {
            rt.decref(x);
        }
    }

    #[test]
    fn untranslatable_code_keeps_interpreting() {
        let (rt, jit) = jit_runtime(JitBuilder::new());
        let raw = crate::code::encode(&[crate::code::Instr {
            op: crate::code::Opcode::ReturnValue,
            arg: 0,
        }]);
        // An unvalidated descriptor whose stack underflows.
        let code = Rc::new(CodeDescriptor::new("bad", raw).unwrap());
        assert!(jit
            .translate(&rt, &code, None, &FeedbackMap::new())
            .is_err());
        assert_eq!(counter(&jit, "functions_translated_err"), 1);
    }
}
