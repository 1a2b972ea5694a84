//! The object runtime that interpreted and translated code share.
//!
//! This is a deliberately small, single-threaded model of the runtime a dynamic language VM
//! provides to its JIT: a reference-counted heap of [Object]s addressed by [ObjId]s, the
//! "current exception" state, a tick counter for cooperative scheduling, and the C-level
//! operations (arithmetic, attribute access, calls, ...) that translated code calls into. Its
//! reference counts are exact and observable (see [Runtime::refcount] and
//! [Runtime::live_objects]), which is what makes it useful for checking that translated code
//! honours its ownership discipline.
//!
//! Conventions: unless documented otherwise, operations borrow their [ObjId] arguments and
//! return new references. Operations that can raise return [RtResult]: `Err(Raised)` means the
//! runtime's current exception has been set.

use crate::{frame::Frame, interp::Interpreter};
use std::{num::NonZeroU32, rc::Rc};
use std::{fmt, rc::Weak};

mod call;
mod object;
mod ops;
mod types;

pub use object::{
    Builtin, Dict, Function, Generator, HashKey, Instance, Iter, Method,
    ModuleObj, Object, SliceObj, SlotDescr, Traceback, TypeKind, TypeObject,
};
pub use call::FinallyDisposition;
pub use ops::{BinaryOp, CompareOp, UnaryOp};
pub use types::{InvalidationListener, TypeRegistry};

/// The default number of ticks between checks for pending asynchronous events.
pub const DEFAULT_CHECK_INTERVAL: i32 = 100;
/// The maximum depth of nested frame evaluations.
const MAX_RECURSION_DEPTH: usize = 200;

/// A reference to a live heap object.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjId(NonZeroU32);

impl ObjId {
    fn from_slot(slot: usize) -> Self {
        // Slots are bounded by `u32::MAX - 1` in `Runtime::alloc`.
        Self(NonZeroU32::MIN.saturating_add(slot as u32))
    }

    fn slot(self) -> usize {
        (self.0.get() - 1) as usize
    }

    pub fn to_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

/// An exception has been raised: the details are in the runtime's current exception state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Raised;

pub type RtResult<T> = Result<T, Raised>;

/// An exception triple. All three are owned references.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExcInfo {
    pub ty: ObjId,
    pub value: ObjId,
    pub tb: Option<ObjId>,
}

/// The outcome of evaluating a frame until it returns, raises or suspends.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FrameResult {
    Return(ObjId),
    Yield(ObjId),
    Raise,
}

/// Something that can evaluate frames: the interpreter, or a JIT sitting in front of it.
pub trait FrameEvaluator {
    fn eval_frame(&self, rt: &mut Runtime, frame: &mut Frame) -> FrameResult;
}

/// The runtime's builtin types.
#[derive(Debug)]
pub struct BuiltinTypes {
    pub object: ObjId,
    pub type_: ObjId,
    pub none: ObjId,
    pub bool_: ObjId,
    pub int: ObjId,
    pub float: ObjId,
    pub str_: ObjId,
    pub tuple: ObjId,
    pub list: ObjId,
    pub dict: ObjId,
    pub slice: ObjId,
    pub cell: ObjId,
    pub code: ObjId,
    pub function: ObjId,
    pub builtin: ObjId,
    pub method: ObjId,
    pub member_descriptor: ObjId,
    pub property: ObjId,
    pub module: ObjId,
    pub iterator: ObjId,
    pub generator: ObjId,
    pub traceback: ObjId,
    pub base_exception: ObjId,
    pub exception: ObjId,
    pub stop_iteration: ObjId,
    pub type_error: ObjId,
    pub name_error: ObjId,
    pub unbound_local_error: ObjId,
    pub attribute_error: ObjId,
    pub zero_division_error: ObjId,
    pub lookup_error: ObjId,
    pub key_error: ObjId,
    pub index_error: ObjId,
    pub value_error: ObjId,
    pub runtime_error: ObjId,
    pub system_error: ObjId,
    pub import_error: ObjId,
    pub keyboard_interrupt: ObjId,
}

#[derive(Debug)]
struct HeapEntry {
    refcount: usize,
    obj: Object,
}

pub struct Runtime {
    heap: Vec<Option<HeapEntry>>,
    free: Vec<usize>,
    /// The last dictionary version stamp handed out.
    last_version: u64,
    none: ObjId,
    true_: ObjId,
    false_: ObjId,
    pub types: BuiltinTypes,
    builtins: ObjId,
    modules: ObjId,
    /// The exception currently being raised.
    curexc: Option<ExcInfo>,
    /// The exception currently being handled (for a bare `raise`).
    exc_info: Option<ExcInfo>,
    ticker: i32,
    check_interval: i32,
    pending_signal: bool,
    tracing: bool,
    profiling: bool,
    stdout: String,
    pub(crate) registry: TypeRegistry,
    evaluator: Rc<dyn FrameEvaluator>,
    depth: usize,
}

impl Runtime {
    pub fn new() -> Self {
        let mut rt = Runtime {
            heap: Vec::new(),
            free: Vec::new(),
            last_version: 0,
            none: ObjId::from_slot(0),
            true_: ObjId::from_slot(0),
            false_: ObjId::from_slot(0),
            types: BuiltinTypes::placeholder(),
            builtins: ObjId::from_slot(0),
            modules: ObjId::from_slot(0),
            curexc: None,
            exc_info: None,
            ticker: DEFAULT_CHECK_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            pending_signal: false,
            tracing: false,
            profiling: false,
            stdout: String::new(),
            registry: TypeRegistry::default(),
            evaluator: Rc::new(Interpreter::new()),
            depth: 0,
        };
        rt.none = rt.alloc(Object::None);
        rt.true_ = rt.alloc(Object::Bool(true));
        rt.false_ = rt.alloc(Object::Bool(false));
        rt.types = BuiltinTypes::create(&mut rt);
        rt.builtins = rt.new_dict();
        rt.modules = rt.new_dict();
        rt.install_builtins();
        rt
    }

    /// Replace the frame evaluator used for calls made by the runtime.
    pub fn set_evaluator(&mut self, evaluator: Rc<dyn FrameEvaluator>) {
        self.evaluator = evaluator;
    }

    /// Evaluate `frame` with the current frame evaluator.
    pub fn eval_frame(&mut self, frame: &mut Frame) -> FrameResult {
        if self.depth >= MAX_RECURSION_DEPTH {
            let rte = self.types.runtime_error;
            self.raise_new(rte, "maximum recursion depth exceeded");
            return FrameResult::Raise;
        }
        self.depth += 1;
        let ev = Rc::clone(&self.evaluator);
        let r = ev.eval_frame(self, frame);
        self.depth -= 1;
        r
    }

    // Heap.

    pub(crate) fn alloc(&mut self, obj: Object) -> ObjId {
        let entry = HeapEntry { refcount: 1, obj };
        match self.free.pop() {
            Some(slot) => {
                self.heap[slot] = Some(entry);
                ObjId::from_slot(slot)
            }
            None => {
                assert!(self.heap.len() < (u32::MAX - 1) as usize, "heap exhausted");
                self.heap.push(Some(entry));
                ObjId::from_slot(self.heap.len() - 1)
            }
        }
    }

    fn entry(&self, id: ObjId) -> &HeapEntry {
        match self.heap.get(id.slot()) {
            Some(Some(e)) => e,
            _ => panic!("access to dead object {id}"),
        }
    }

    fn entry_mut(&mut self, id: ObjId) -> &mut HeapEntry {
        match self.heap.get_mut(id.slot()) {
            Some(Some(e)) => e,
            _ => panic!("access to dead object {id}"),
        }
    }

    pub fn get(&self, id: ObjId) -> &Object {
        &self.entry(id).obj
    }

    pub(crate) fn get_mut(&mut self, id: ObjId) -> &mut Object {
        &mut self.entry_mut(id).obj
    }

    /// Is `id` a live object?
    pub fn is_live(&self, id: ObjId) -> bool {
        matches!(self.heap.get(id.slot()), Some(Some(_)))
    }

    pub fn refcount(&self, id: ObjId) -> usize {
        self.entry(id).refcount
    }

    /// How many objects are currently allocated?
    pub fn live_objects(&self) -> usize {
        self.heap.len() - self.free.len()
    }

    pub fn incref(&mut self, id: ObjId) {
        self.entry_mut(id).refcount += 1;
    }

    /// Increment `id`'s reference count and return it: turns a borrowed reference into an owned
    /// one.
    pub fn new_ref(&mut self, id: ObjId) -> ObjId {
        self.incref(id);
        id
    }

    pub fn decref(&mut self, id: ObjId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let e = self.entry_mut(id);
            assert!(e.refcount > 0, "decref of object {id} with refcount 0");
            e.refcount -= 1;
            if e.refcount > 0 {
                continue;
            }
            let Some(e) = self.heap[id.slot()].take() else {
                unreachable!()
            };
            self.free.push(id.slot());
            match e.obj {
                Object::Code(rc) => {
                    // A code descriptor still referenced by a running frame or a compiled
                    // function keeps its constants alive.
                    if let Ok(code) = Rc::try_unwrap(rc) {
                        code.referents(&mut work);
                    }
                }
                obj => {
                    if matches!(obj, Object::Type(_)) {
                        self.type_freed(id);
                    }
                    obj.referents(&mut work);
                }
            }
        }
    }

    pub fn xdecref(&mut self, id: Option<ObjId>) {
        if let Some(id) = id {
            self.decref(id);
        }
    }

    // Singletons.

    /// A borrowed reference to `None`.
    pub fn none(&self) -> ObjId {
        self.none
    }

    /// A borrowed reference to `True` or `False`.
    pub fn bool_obj(&self, b: bool) -> ObjId {
        if b {
            self.true_
        } else {
            self.false_
        }
    }

    /// A borrowed reference to the builtins dictionary.
    pub fn builtins(&self) -> ObjId {
        self.builtins
    }

    // Hooks and counters.

    pub fn set_tracing(&mut self, on: bool) {
        self.tracing = on;
    }

    pub fn tracing(&self) -> bool {
        self.tracing
    }

    pub fn set_profiling(&mut self, on: bool) {
        self.profiling = on;
    }

    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Request that the next expired tick check raises `KeyboardInterrupt`.
    pub fn signal_pending(&mut self) {
        self.pending_signal = true;
    }

    pub fn set_check_interval(&mut self, interval: i32) {
        self.check_interval = interval;
        self.ticker = interval;
    }

    /// Decrement the tick counter, returning its new value.
    pub fn decrement_ticker(&mut self) -> i32 {
        self.ticker -= 1;
        self.ticker
    }

    /// The tick counter expired: reset it and deliver any pending asynchronous event.
    pub fn handle_pending_calls(&mut self) -> RtResult<()> {
        self.ticker = self.check_interval;
        if self.pending_signal {
            self.pending_signal = false;
            let ki = self.types.keyboard_interrupt;
            return Err(self.raise_new(ki, ""));
        }
        Ok(())
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn take_stdout(&mut self) -> String {
        std::mem::take(&mut self.stdout)
    }

    pub(crate) fn write_stdout(&mut self, s: &str) {
        self.stdout.push_str(s);
    }

    pub(crate) fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    // Exception state.

    /// Create an instance of the exception type `ty` with a single string argument and make it
    /// the current exception.
    pub fn raise_new(&mut self, ty: ObjId, msg: &str) -> Raised {
        let args = if msg.is_empty() {
            self.new_tuple(vec![])
        } else {
            let s = self.new_str(msg);
            self.new_tuple(vec![s])
        };
        let value = self.new_exception(ty, args);
        let ty = self.new_ref(ty);
        self.set_exc(ExcInfo {
            ty,
            value,
            tb: None,
        });
        Raised
    }

    /// Make `info` the current exception, stealing its references.
    pub(crate) fn set_exc(&mut self, info: ExcInfo) {
        if let Some(old) = self.curexc.replace(info) {
            self.release_exc(old);
        }
    }

    pub(crate) fn release_exc(&mut self, info: ExcInfo) {
        self.decref(info.ty);
        self.decref(info.value);
        self.xdecref(info.tb);
    }

    pub fn err_occurred(&self) -> bool {
        self.curexc.is_some()
    }

    /// Take the current exception, transferring ownership of its references to the caller.
    pub fn err_fetch(&mut self) -> Option<ExcInfo> {
        self.curexc.take()
    }

    /// A borrowed view of the current exception.
    pub fn current_exception(&self) -> Option<&ExcInfo> {
        self.curexc.as_ref()
    }

    pub fn err_clear(&mut self) {
        if let Some(info) = self.curexc.take() {
            self.release_exc(info);
        }
    }

    /// Make `info` the exception being handled, stealing its references.
    pub(crate) fn set_exc_info(&mut self, info: ExcInfo) {
        if let Some(old) = self.exc_info.replace(info) {
            self.release_exc(old);
        }
    }

    /// If the current exception is `StopIteration`, clear it. Returns `false` iff a different
    /// exception is pending.
    pub fn err_clear_stop_iteration(&mut self) -> bool {
        match self.curexc {
            None => true,
            Some(info) if self.is_subtype(info.ty, self.types.stop_iteration) => {
                self.err_clear();
                true
            }
            Some(_) => false,
        }
    }

    /// Prepend a traceback entry for `lineno` to the current exception.
    pub fn traceback_here(&mut self, lineno: i32) {
        if let Some(mut info) = self.curexc.take() {
            info.tb = Some(self.alloc(Object::Traceback(Traceback {
                lineno,
                next: info.tb,
            })));
            self.curexc = Some(info);
        }
    }

    /// The line numbers recorded in traceback `tb`, outermost first.
    pub fn traceback_lines(&self, mut tb: Option<ObjId>) -> Vec<i32> {
        let mut lines = Vec::new();
        while let Some(t) = tb {
            match self.get(t) {
                Object::Traceback(x) => {
                    lines.push(x.lineno);
                    tb = x.next;
                }
                _ => break,
            }
        }
        lines
    }

    /// Format an exception as `TypeName: message`.
    pub fn format_exception(&self, info: &ExcInfo) -> String {
        let name = self.type_name(info.ty);
        let msg = self.str_of(info.value);
        if msg.is_empty() {
            name
        } else {
            format!("{name}: {msg}")
        }
    }

    // Type registry.

    /// Subscribe `listener` to modifications and destruction of `ty`.
    pub fn subscribe(&mut self, ty: ObjId, listener: Weak<dyn InvalidationListener>) {
        self.registry.subscribe(ty, listener);
    }

    /// `ty` (or an ancestor of it) has been modified: notify the subscribers of `ty` and of every
    /// subscribed subtype.
    pub(crate) fn type_modified(&mut self, ty: ObjId) {
        let affected = self
            .registry
            .subscribed_types()
            .into_iter()
            .filter(|t| self.is_live(*t) && self.is_subtype(*t, ty))
            .collect::<Vec<_>>();
        for t in affected {
            self.registry.notify(t);
        }
    }

    fn type_freed(&mut self, ty: ObjId) {
        self.registry.notify(ty);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinTypes {
    fn placeholder() -> Self {
        let p = ObjId::from_slot(0);
        BuiltinTypes {
            object: p,
            type_: p,
            none: p,
            bool_: p,
            int: p,
            float: p,
            str_: p,
            tuple: p,
            list: p,
            dict: p,
            slice: p,
            cell: p,
            code: p,
            function: p,
            builtin: p,
            method: p,
            member_descriptor: p,
            property: p,
            module: p,
            iterator: p,
            generator: p,
            traceback: p,
            base_exception: p,
            exception: p,
            stop_iteration: p,
            type_error: p,
            name_error: p,
            unbound_local_error: p,
            attribute_error: p,
            zero_division_error: p,
            lookup_error: p,
            key_error: p,
            index_error: p,
            value_error: p,
            runtime_error: p,
            system_error: p,
            import_error: p,
            keyboard_interrupt: p,
        }
    }

    fn create(rt: &mut Runtime) -> Self {
        let object = rt.new_builtin_type("object", None);
        let b = |rt: &mut Runtime, name: &str| rt.new_builtin_type(name, Some(object));
        let type_ = b(rt, "type");
        let none = b(rt, "NoneType");
        let int = b(rt, "int");
        let bool_ = rt.new_builtin_type("bool", Some(int));
        let float = b(rt, "float");
        let str_ = b(rt, "str");
        let tuple = b(rt, "tuple");
        let list = b(rt, "list");
        let dict = b(rt, "dict");
        let slice = b(rt, "slice");
        let cell = b(rt, "cell");
        let code = b(rt, "code");
        let function = b(rt, "function");
        let builtin = b(rt, "builtin_function_or_method");
        let method = b(rt, "instancemethod");
        let member_descriptor = b(rt, "member_descriptor");
        let property = b(rt, "property");
        let module = b(rt, "module");
        let iterator = b(rt, "iterator");
        let generator = b(rt, "generator");
        let traceback = b(rt, "traceback");
        let e = |rt: &mut Runtime, name: &str, base: ObjId| rt.new_exception_type(name, base);
        let base_exception = e(rt, "BaseException", object);
        let exception = e(rt, "Exception", base_exception);
        let stop_iteration = e(rt, "StopIteration", exception);
        let type_error = e(rt, "TypeError", exception);
        let name_error = e(rt, "NameError", exception);
        let unbound_local_error = e(rt, "UnboundLocalError", name_error);
        let attribute_error = e(rt, "AttributeError", exception);
        let zero_division_error = e(rt, "ZeroDivisionError", exception);
        let lookup_error = e(rt, "LookupError", exception);
        let key_error = e(rt, "KeyError", lookup_error);
        let index_error = e(rt, "IndexError", lookup_error);
        let value_error = e(rt, "ValueError", exception);
        let runtime_error = e(rt, "RuntimeError", exception);
        let system_error = e(rt, "SystemError", exception);
        let import_error = e(rt, "ImportError", exception);
        let keyboard_interrupt = e(rt, "KeyboardInterrupt", base_exception);
        BuiltinTypes {
            object,
            type_,
            none,
            bool_,
            int,
            float,
            str_,
            tuple,
            list,
            dict,
            slice,
            cell,
            code,
            function,
            builtin,
            method,
            member_descriptor,
            property,
            module,
            iterator,
            generator,
            traceback,
            base_exception,
            exception,
            stop_iteration,
            type_error,
            name_error,
            unbound_local_error,
            attribute_error,
            zero_division_error,
            lookup_error,
            key_error,
            index_error,
            value_error,
            runtime_error,
            system_error,
            import_error,
            keyboard_interrupt,
        }
    }

    /// Every builtin exception type, for installation into the builtins dictionary.
    fn exceptions(&self) -> [ObjId; 16] {
        [
            self.base_exception,
            self.exception,
            self.stop_iteration,
            self.type_error,
            self.name_error,
            self.unbound_local_error,
            self.attribute_error,
            self.zero_division_error,
            self.lookup_error,
            self.key_error,
            self.index_error,
            self.value_error,
            self.runtime_error,
            self.system_error,
            self.import_error,
            self.keyboard_interrupt,
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_and_free() {
        let mut rt = Runtime::new();
        let before = rt.live_objects();
        let a = rt.new_int(1);
        let b = rt.new_int(2);
        let l = rt.new_list(vec![a, b]);
        assert_eq!(rt.live_objects(), before + 3);
        rt.decref(l);
        assert_eq!(rt.live_objects(), before);
    }

    #[test]
    fn slots_are_reused() {
        let mut rt = Runtime::new();
        let a = rt.new_int(1);
        rt.decref(a);
        let b = rt.new_int(2);
        assert_eq!(a, b);
        assert_eq!(rt.refcount(b), 1);
    }

    #[test]
    #[should_panic(expected = "dead object")]
    fn over_decref() {
        let mut rt = Runtime::new();
        let i = rt.new_int(42);
        rt.decref(i);
        rt.decref(i);
    }

    #[test]
    fn shared_children_survive() {
        let mut rt = Runtime::new();
        let s = rt.new_str("x");
        rt.incref(s);
        let t = rt.new_tuple(vec![s]);
        rt.decref(t);
        assert!(rt.is_live(s));
        assert_eq!(rt.refcount(s), 1);
        rt.decref(s);
        assert!(!rt.is_live(s));
    }

    #[test]
    fn raise_and_fetch() {
        let mut rt = Runtime::new();
        let before = rt.live_objects();
        let te = rt.types.type_error;
        rt.raise_new(te, "bad");
        assert!(rt.err_occurred());
        rt.traceback_here(7);
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.format_exception(&info), "TypeError: bad");
        assert_eq!(rt.traceback_lines(info.tb), vec![7]);
        rt.release_exc(info);
        assert!(!rt.err_occurred());
        assert_eq!(rt.live_objects(), before);
    }

    #[test]
    fn ticker_delivers_signal() {
        let mut rt = Runtime::new();
        rt.set_check_interval(2);
        assert_eq!(rt.decrement_ticker(), 1);
        assert!(rt.handle_pending_calls().is_ok());
        rt.signal_pending();
        assert_eq!(rt.handle_pending_calls(), Err(Raised));
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.format_exception(&info), "KeyboardInterrupt");
        rt.release_exc(info);
    }
}
