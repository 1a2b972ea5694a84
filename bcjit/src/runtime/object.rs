//! The object representations the runtime stores in its heap.

use super::ObjId;
use crate::{code::CodeDescriptor, frame::Frame};
use indexmap::IndexMap;
use std::rc::Rc;
use strum::{EnumIter, IntoStaticStr};

/// A heap object.
///
/// Every [ObjId] stored inside an object is an owned reference: freeing the object releases
/// each of them (see [Object::referents]).
#[derive(Debug)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ObjId>),
    List(Vec<ObjId>),
    Dict(Dict),
    Slice(SliceObj),
    Cell(Option<ObjId>),
    Code(Rc<CodeDescriptor>),
    Function(Function),
    Builtin(Builtin),
    Method(Method),
    Type(TypeObject),
    Instance(Instance),
    /// A member descriptor for the instance slot at `index`. Always a data descriptor.
    SlotDescr(SlotDescr),
    /// A read-only data descriptor calling `getter` with the instance.
    Property(ObjId),
    Module(ModuleObj),
    Iter(Iter),
    Generator(Generator),
    Traceback(Traceback),
}

impl Object {
    /// Push every reference this object owns onto `out`.
    pub(crate) fn referents(&self, out: &mut Vec<ObjId>) {
        match self {
            Object::None
            | Object::Bool(_)
            | Object::Int(_)
            | Object::Float(_)
            | Object::Str(_)
            | Object::Builtin(_)
            | Object::SlotDescr(_)
            | Object::Code(_) => (),
            Object::Tuple(xs) | Object::List(xs) => out.extend(xs.iter().copied()),
            Object::Dict(d) => d.referents(out),
            Object::Slice(s) => out.extend([s.start, s.stop, s.step]),
            Object::Cell(c) => out.extend(c.iter().copied()),
            Object::Function(f) => {
                out.push(f.code);
                out.push(f.globals);
                out.extend(f.defaults.iter().copied());
                out.extend(f.closure.iter().copied());
            }
            Object::Method(m) => out.extend([m.func, m.self_]),
            Object::Type(t) => {
                out.extend(t.base.iter().copied());
                t.dict.referents(out);
            }
            Object::Instance(i) => {
                out.push(i.ty);
                if let Some(d) = &i.dict {
                    d.referents(out);
                }
                out.extend(i.slots.iter().flatten().copied());
            }
            Object::Property(g) => out.push(*g),
            Object::Module(m) => out.push(m.dict),
            Object::Iter(it) => it.referents(out),
            Object::Generator(g) => {
                if let Some(f) = &g.frame {
                    f.referents(out);
                }
            }
            Object::Traceback(tb) => out.extend(tb.next.iter().copied()),
        }
    }
}

/// A dictionary key, computed from a hashable object.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(String),
    Tuple(Vec<HashKey>),
    /// Objects which hash by identity.
    Id(ObjId),
}

/// An insertion-ordered dictionary.
///
/// `version` is a runtime-wide unique stamp, refreshed on every mutation: two observations of
/// the same stamp imply the same, unmodified, dictionary.
#[derive(Debug, Default)]
pub struct Dict {
    pub(crate) entries: IndexMap<HashKey, (ObjId, ObjId)>,
    pub(crate) version: u64,
}

impl Dict {
    pub(crate) fn new(version: u64) -> Self {
        Self {
            entries: IndexMap::new(),
            version,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Look up a string key, returning a borrowed value.
    pub fn get_str(&self, key: &str) -> Option<ObjId> {
        self.entries
            .get(&HashKey::Str(key.to_owned()))
            .map(|(_, v)| *v)
    }

    pub(crate) fn get(&self, key: &HashKey) -> Option<ObjId> {
        self.entries.get(key).map(|(_, v)| *v)
    }

    fn referents(&self, out: &mut Vec<ObjId>) {
        for (k, v) in self.entries.values() {
            out.push(*k);
            out.push(*v);
        }
    }
}

#[derive(Debug)]
pub struct SliceObj {
    pub start: ObjId,
    pub stop: ObjId,
    pub step: ObjId,
}

#[derive(Debug)]
pub struct Function {
    /// A [Object::Code].
    pub code: ObjId,
    pub globals: ObjId,
    pub defaults: Vec<ObjId>,
    /// A tuple of cells.
    pub closure: Option<ObjId>,
}

#[derive(Debug)]
pub struct Method {
    pub func: ObjId,
    pub self_: ObjId,
}

/// What a type's instances look like.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TypeKind {
    /// A type whose instances are built into the runtime (e.g. `int`).
    Builtin,
    /// A user-defined class: instances are [Object::Instance].
    Class,
}

#[derive(Debug)]
pub struct TypeObject {
    pub name: String,
    pub base: Option<ObjId>,
    pub dict: Dict,
    pub kind: TypeKind,
    /// How many instance slots instances of this type carry (including inherited ones).
    pub nslots: usize,
    /// Do instances carry an attribute dictionary?
    pub has_dict: bool,
}

#[derive(Debug)]
pub struct Instance {
    pub ty: ObjId,
    pub dict: Option<Dict>,
    pub slots: Vec<Option<ObjId>>,
}

#[derive(Clone, Debug)]
pub struct SlotDescr {
    pub index: usize,
    pub name: String,
}

#[derive(Debug)]
pub struct ModuleObj {
    pub name: String,
    pub dict: ObjId,
}

#[derive(Debug)]
pub enum Iter {
    /// Iterates over a list, tuple or string.
    Seq { seq: ObjId, idx: usize },
    /// A snapshot of a dictionary's keys.
    Keys { keys: Vec<ObjId>, idx: usize },
}

impl Iter {
    fn referents(&self, out: &mut Vec<ObjId>) {
        match self {
            Iter::Seq { seq, .. } => out.push(*seq),
            Iter::Keys { keys, idx } => out.extend(keys[*idx..].iter().copied()),
        }
    }
}

#[derive(Debug)]
pub struct Generator {
    /// `None` while the generator is running or once it has finished.
    pub frame: Option<Box<Frame>>,
    pub running: bool,
}

#[derive(Debug)]
pub struct Traceback {
    pub lineno: i32,
    pub next: Option<ObjId>,
}

/// The functions built into the runtime.
///
/// The "free" builtins are installed in the builtins dictionary; the remainder are methods held
/// in builtin types' dictionaries.
#[derive(Clone, Copy, Debug, EnumIter, Eq, IntoStaticStr, PartialEq)]
pub enum Builtin {
    #[strum(serialize = "abs")]
    Abs,
    #[strum(serialize = "getattr")]
    Getattr,
    #[strum(serialize = "hasattr")]
    Hasattr,
    #[strum(serialize = "isinstance")]
    Isinstance,
    #[strum(serialize = "iter")]
    Iter,
    #[strum(serialize = "len")]
    Len,
    #[strum(serialize = "max")]
    Max,
    #[strum(serialize = "min")]
    Min,
    #[strum(serialize = "next")]
    Next,
    #[strum(serialize = "print")]
    Print,
    #[strum(serialize = "range")]
    Range,
    #[strum(serialize = "repr")]
    Repr,
    #[strum(serialize = "append")]
    ListAppend,
    #[strum(serialize = "pop")]
    ListPop,
    #[strum(serialize = "get")]
    DictGet,
    #[strum(serialize = "keys")]
    DictKeys,
    #[strum(serialize = "join")]
    StrJoin,
    #[strum(serialize = "upper")]
    StrUpper,
    #[strum(serialize = "send")]
    GenSend,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Is this builtin a method of a builtin type, rather than a free function?
    pub fn is_method(self) -> bool {
        matches!(
            self,
            Builtin::ListAppend
                | Builtin::ListPop
                | Builtin::DictGet
                | Builtin::DictKeys
                | Builtin::StrJoin
                | Builtin::StrUpper
                | Builtin::GenSend
        )
    }
}
