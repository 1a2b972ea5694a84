//! Object construction, attribute access and the operators.

use super::{
    Builtin, Dict, HashKey, Instance, Iter, Object, ObjId, RtResult, Runtime, SliceObj,
    SlotDescr, TypeKind, TypeObject,
};
use std::cmp::Ordering;
use strum::{Display, FromRepr, IntoEnumIterator};

/// A binary (or in-place) arithmetic operator.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryOp {
    Power,
    Multiply,
    /// Classic division: floor division for integers, true division otherwise.
    Divide,
    TrueDivide,
    FloorDivide,
    Modulo,
    Add,
    Subtract,
    LShift,
    RShift,
    And,
    Xor,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Power => "**",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide | BinaryOp::TrueDivide => "/",
            BinaryOp::FloorDivide => "//",
            BinaryOp::Modulo => "%",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::LShift => "<<",
            BinaryOp::RShift => ">>",
            BinaryOp::And => "&",
            BinaryOp::Xor => "^",
            BinaryOp::Or => "|",
        }
    }

    fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::LShift | BinaryOp::RShift | BinaryOp::And | BinaryOp::Xor | BinaryOp::Or
        )
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
    /// Backquote conversion: `repr`.
    Convert,
    Invert,
}

/// The `COMPARE_OP` operand.
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[repr(u8)]
pub enum CompareOp {
    #[strum(serialize = "<")]
    Lt = 0,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "not in")]
    NotIn,
    #[strum(serialize = "is")]
    Is,
    #[strum(serialize = "is not")]
    IsNot,
    #[strum(serialize = "exception match")]
    ExcMatch,
}

impl CompareOp {
    /// Is this one of the six rich comparisons?
    pub fn is_rich(self) -> bool {
        (self as u8) <= (CompareOp::Ge as u8)
    }
}

#[derive(Clone, Copy, Debug)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// The owned result of a sequence operator, before it is allocated.
enum Seq {
    Str(String),
    List(Vec<ObjId>),
    Tuple(Vec<ObjId>),
}

fn repeat<T: Clone>(xs: &[T], n: i64) -> Vec<T> {
    let n = usize::try_from(n).unwrap_or(0);
    let mut out = Vec::with_capacity(xs.len() * n);
    for _ in 0..n {
        out.extend_from_slice(xs);
    }
    out
}

fn floor_div(x: i64, y: i64) -> Option<i64> {
    let q = x.checked_div(y)?;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn py_mod(x: i64, y: i64) -> Option<i64> {
    let r = x.checked_rem(y)?;
    if r != 0 && ((r < 0) != (y < 0)) {
        Some(r + y)
    } else {
        Some(r)
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Clamp a start or stop index the way slicing with a unit step does.
fn clamp_index(i: i64, len: usize) -> usize {
    let len = len as i64;
    let i = if i < 0 { i + len } else { i };
    i.clamp(0, len) as usize
}

impl Runtime {
    // Construction.

    pub fn new_int(&mut self, i: i64) -> ObjId {
        self.alloc(Object::Int(i))
    }

    pub fn new_float(&mut self, f: f64) -> ObjId {
        self.alloc(Object::Float(f))
    }

    pub fn new_str(&mut self, s: &str) -> ObjId {
        self.alloc(Object::Str(s.to_owned()))
    }

    /// Create a tuple, stealing the references in `items`.
    pub fn new_tuple(&mut self, items: Vec<ObjId>) -> ObjId {
        self.alloc(Object::Tuple(items))
    }

    /// Create a list, stealing the references in `items`.
    pub fn new_list(&mut self, items: Vec<ObjId>) -> ObjId {
        self.alloc(Object::List(items))
    }

    pub fn new_dict(&mut self) -> ObjId {
        let version = self.next_version();
        self.alloc(Object::Dict(Dict::new(version)))
    }

    /// Create a new, empty, cell or one holding (a new reference to) `v`.
    pub fn new_cell(&mut self, v: Option<ObjId>) -> ObjId {
        if let Some(v) = v {
            self.incref(v);
        }
        self.alloc(Object::Cell(v))
    }

    pub fn build_slice(&mut self, start: ObjId, stop: ObjId, step: Option<ObjId>) -> ObjId {
        let step = step.unwrap_or(self.none);
        let s = SliceObj {
            start: self.new_ref(start),
            stop: self.new_ref(stop),
            step: self.new_ref(step),
        };
        self.alloc(Object::Slice(s))
    }

    /// A read-only property whose value is `getter(instance)`.
    pub fn new_property(&mut self, getter: ObjId) -> ObjId {
        self.incref(getter);
        self.alloc(Object::Property(getter))
    }

    pub(crate) fn new_builtin_type(&mut self, name: &str, base: Option<ObjId>) -> ObjId {
        if let Some(b) = base {
            self.incref(b);
        }
        let version = self.next_version();
        self.alloc(Object::Type(TypeObject {
            name: name.to_owned(),
            base,
            dict: Dict::new(version),
            kind: TypeKind::Builtin,
            nslots: 0,
            has_dict: false,
        }))
    }

    pub(crate) fn new_exception_type(&mut self, name: &str, base: ObjId) -> ObjId {
        self.incref(base);
        let version = self.next_version();
        self.alloc(Object::Type(TypeObject {
            name: name.to_owned(),
            base: Some(base),
            dict: Dict::new(version),
            kind: TypeKind::Class,
            nslots: 0,
            has_dict: true,
        }))
    }

    /// Create a class deriving from `base` (default `object`). Each name in `slots` becomes a
    /// slot descriptor in the class dictionary; instances carry an attribute dictionary if
    /// `has_dict` is set or the base's instances do.
    pub fn new_class(
        &mut self,
        name: &str,
        base: Option<ObjId>,
        slots: &[&str],
        has_dict: bool,
    ) -> ObjId {
        let base = base.unwrap_or(self.types.object);
        let (base_nslots, base_has_dict) = match self.get(base) {
            Object::Type(t) => (t.nslots, t.has_dict),
            _ => panic!("base of class {name} is not a type"),
        };
        self.incref(base);
        let version = self.next_version();
        let ty = self.alloc(Object::Type(TypeObject {
            name: name.to_owned(),
            base: Some(base),
            dict: Dict::new(version),
            kind: TypeKind::Class,
            nslots: base_nslots + slots.len(),
            has_dict: has_dict || base_has_dict,
        }));
        for (i, s) in slots.iter().enumerate() {
            let d = self.alloc(Object::SlotDescr(SlotDescr {
                index: base_nslots + i,
                name: (*s).to_owned(),
            }));
            self.dict_set_str(ty, s, d);
            self.decref(d);
        }
        ty
    }

    /// Create an instance of the class `ty` without running `__init__`.
    pub fn new_instance(&mut self, ty: ObjId) -> ObjId {
        let (nslots, has_dict) = match self.get(ty) {
            Object::Type(t) => (t.nslots, t.has_dict),
            _ => panic!("{ty} is not a type"),
        };
        self.incref(ty);
        let dict = has_dict.then(|| Dict::new(self.next_version()));
        self.alloc(Object::Instance(Instance {
            ty,
            dict,
            slots: vec![None; nslots],
        }))
    }

    /// Create an instance of the exception type `ty` whose `args` attribute is the tuple
    /// `args`. Steals `args`.
    pub(crate) fn new_exception(&mut self, ty: ObjId, args: ObjId) -> ObjId {
        let e = self.new_instance(ty);
        self.dict_set_str(e, "args", args);
        self.decref(args);
        e
    }

    pub(crate) fn install_builtins(&mut self) {
        for b in Builtin::iter() {
            let owner = match b {
                Builtin::ListAppend | Builtin::ListPop => self.types.list,
                Builtin::DictGet | Builtin::DictKeys => self.types.dict,
                Builtin::StrJoin | Builtin::StrUpper => self.types.str_,
                Builtin::GenSend => self.types.generator,
                _ => self.builtins,
            };
            let f = self.alloc(Object::Builtin(b));
            self.dict_set_str(owner, b.name(), f);
            self.decref(f);
        }
        let t = &self.types;
        let named = [
            ("object", t.object),
            ("type", t.type_),
            ("bool", t.bool_),
            ("int", t.int),
            ("float", t.float),
            ("str", t.str_),
            ("tuple", t.tuple),
            ("list", t.list),
            ("dict", t.dict),
            ("property", t.property),
            ("None", self.none),
            ("True", self.true_),
            ("False", self.false_),
        ];
        let builtins = self.builtins;
        for (name, v) in named {
            self.dict_set_str(builtins, name, v);
        }
        for e in self.types.exceptions() {
            let name = self.type_name(e);
            self.dict_set_str(builtins, &name, e);
        }
    }

    // Types.

    /// A borrowed reference to `id`'s type.
    pub fn type_of(&self, id: ObjId) -> ObjId {
        let t = &self.types;
        match self.get(id) {
            Object::None => t.none,
            Object::Bool(_) => t.bool_,
            Object::Int(_) => t.int,
            Object::Float(_) => t.float,
            Object::Str(_) => t.str_,
            Object::Tuple(_) => t.tuple,
            Object::List(_) => t.list,
            Object::Dict(_) => t.dict,
            Object::Slice(_) => t.slice,
            Object::Cell(_) => t.cell,
            Object::Code(_) => t.code,
            Object::Function(_) => t.function,
            Object::Builtin(_) => t.builtin,
            Object::Method(_) => t.method,
            Object::Type(_) => t.type_,
            Object::Instance(i) => i.ty,
            Object::SlotDescr(_) => t.member_descriptor,
            Object::Property(_) => t.property,
            Object::Module(_) => t.module,
            Object::Iter(_) => t.iterator,
            Object::Generator(_) => t.generator,
            Object::Traceback(_) => t.traceback,
        }
    }

    /// Is `ty` the type `base` or derived from it?
    pub fn is_subtype(&self, ty: ObjId, base: ObjId) -> bool {
        let mut t = Some(ty);
        while let Some(tid) = t {
            if tid == base {
                return true;
            }
            t = match self.get(tid) {
                Object::Type(to) => to.base,
                _ => None,
            };
        }
        false
    }

    pub fn is_instance(&self, obj: ObjId, ty: ObjId) -> bool {
        self.is_subtype(self.type_of(obj), ty)
    }

    pub fn type_name(&self, ty: ObjId) -> String {
        match self.get(ty) {
            Object::Type(t) => t.name.clone(),
            _ => "?".to_owned(),
        }
    }

    fn type_name_of(&self, obj: ObjId) -> String {
        self.type_name(self.type_of(obj))
    }

    /// Look `name` up along `ty`'s base chain, returning a borrowed reference.
    pub fn type_lookup(&self, ty: ObjId, name: &str) -> Option<ObjId> {
        let mut t = Some(ty);
        while let Some(tid) = t {
            let Object::Type(to) = self.get(tid) else {
                return None;
            };
            if let Some(v) = to.dict.get_str(name) {
                return Some(v);
            }
            t = to.base;
        }
        None
    }

    /// Does `descr`, found on a type, take precedence over the instance dictionary?
    pub fn is_data_descriptor(&self, descr: ObjId) -> bool {
        matches!(self.get(descr), Object::SlotDescr(_) | Object::Property(_))
    }

    // Dictionaries.

    fn dict_of(&self, owner: ObjId) -> &Dict {
        match self.get(owner) {
            Object::Dict(d) => d,
            Object::Type(t) => &t.dict,
            Object::Instance(Instance { dict: Some(d), .. }) => d,
            _ => panic!("{owner} has no dictionary"),
        }
    }

    fn dict_of_mut(&mut self, owner: ObjId) -> &mut Dict {
        match self.get_mut(owner) {
            Object::Dict(d) => d,
            Object::Type(t) => &mut t.dict,
            Object::Instance(Instance { dict: Some(d), .. }) => d,
            _ => panic!("{owner} has no dictionary"),
        }
    }

    /// Store `k: v` (both borrowed) in the dictionary held by `owner`.
    fn dict_store(&mut self, owner: ObjId, hk: HashKey, k: ObjId, v: ObjId) {
        self.incref(v);
        let version = self.next_version();
        let d = self.dict_of_mut(owner);
        d.version = version;
        let old = match d.entries.get_mut(&hk) {
            Some(e) => Some(std::mem::replace(&mut e.1, v)),
            None => {
                d.entries.insert(hk, (k, v));
                None
            }
        };
        match old {
            Some(old) => self.decref(old),
            None => self.incref(k),
        }
    }

    /// Remove `hk` from the dictionary held by `owner`, returning the owned key and value.
    fn dict_remove(&mut self, owner: ObjId, hk: &HashKey) -> Option<(ObjId, ObjId)> {
        let version = self.next_version();
        let d = self.dict_of_mut(owner);
        let r = d.entries.shift_remove(hk);
        if r.is_some() {
            d.version = version;
        }
        r
    }

    pub fn hash_key(&mut self, k: ObjId) -> RtResult<HashKey> {
        let items = match self.get(k) {
            Object::None => return Ok(HashKey::None),
            Object::Bool(b) => return Ok(HashKey::Int(i64::from(*b))),
            Object::Int(i) => return Ok(HashKey::Int(*i)),
            Object::Float(f) => {
                return Ok(if f.fract() == 0.0 && f.abs() < 9e18 {
                    HashKey::Int(*f as i64)
                } else {
                    HashKey::Float(f.to_bits())
                })
            }
            Object::Str(s) => return Ok(HashKey::Str(s.clone())),
            Object::Tuple(xs) => xs.clone(),
            Object::List(_) | Object::Dict(_) => {
                let te = self.types.type_error;
                let msg = format!("unhashable type: '{}'", self.type_name_of(k));
                return Err(self.raise_new(te, &msg));
            }
            _ => return Ok(HashKey::Id(k)),
        };
        let mut keys = Vec::with_capacity(items.len());
        for x in items {
            keys.push(self.hash_key(x)?);
        }
        Ok(HashKey::Tuple(keys))
    }

    /// Look up `k` in dictionary `d`, returning a borrowed reference.
    pub fn dict_get(&mut self, d: ObjId, k: ObjId) -> RtResult<Option<ObjId>> {
        let hk = self.hash_key(k)?;
        Ok(self.dict_of(d).get(&hk))
    }

    pub fn dict_set(&mut self, d: ObjId, k: ObjId, v: ObjId) -> RtResult<()> {
        let hk = self.hash_key(k)?;
        self.dict_store(d, hk, k, v);
        Ok(())
    }

    pub fn dict_del(&mut self, d: ObjId, k: ObjId) -> RtResult<()> {
        let hk = self.hash_key(k)?;
        match self.dict_remove(d, &hk) {
            Some((k, v)) => {
                self.decref(k);
                self.decref(v);
                Ok(())
            }
            None => Err(self.key_error(k)),
        }
    }

    /// Look up a string key in the dictionary held by `owner`, returning a borrowed reference.
    pub fn dict_get_str(&self, owner: ObjId, name: &str) -> Option<ObjId> {
        self.dict_of(owner).get_str(name)
    }

    /// Store `v` (borrowed) under a string key in the dictionary held by `owner`.
    pub fn dict_set_str(&mut self, owner: ObjId, name: &str, v: ObjId) {
        let k = self.new_str(name);
        self.dict_store(owner, HashKey::Str(name.to_owned()), k, v);
        self.decref(k);
    }

    /// Remove a string key from the dictionary held by `owner`, returning whether it was
    /// present.
    pub fn dict_del_str(&mut self, owner: ObjId, name: &str) -> bool {
        match self.dict_remove(owner, &HashKey::Str(name.to_owned())) {
            Some((k, v)) => {
                self.decref(k);
                self.decref(v);
                true
            }
            None => false,
        }
    }

    /// The version stamp of the dictionary held by `owner`.
    pub fn dict_version(&self, owner: ObjId) -> u64 {
        self.dict_of(owner).version()
    }

    fn key_error(&mut self, k: ObjId) -> super::Raised {
        let ke = self.types.key_error;
        let msg = self.repr(k);
        self.raise_new(ke, &msg)
    }

    // Attributes.

    /// The contents of the string object `s`, or a `TypeError`.
    pub(crate) fn expect_str(&mut self, s: ObjId, what: &str) -> RtResult<String> {
        match self.get(s) {
            Object::Str(x) => Ok(x.clone()),
            _ => {
                let te = self.types.type_error;
                let msg = format!("{what} must be string, not {}", self.type_name_of(s));
                Err(self.raise_new(te, &msg))
            }
        }
    }

    fn no_attribute(&mut self, obj: ObjId, name: &str) -> super::Raised {
        let ae = self.types.attribute_error;
        let msg = match self.get(obj) {
            Object::Type(t) => format!("type object '{}' has no attribute '{name}'", t.name),
            Object::Module(m) => format!("'module' object '{}' has no attribute '{name}'", m.name),
            _ => format!(
                "'{}' object has no attribute '{name}'",
                self.type_name_of(obj)
            ),
        };
        self.raise_new(ae, &msg)
    }

    pub fn getattr(&mut self, obj: ObjId, name: ObjId) -> RtResult<ObjId> {
        let name = self.expect_str(name, "attribute name")?;
        self.getattr_str(obj, &name)
    }

    pub fn getattr_str(&mut self, obj: ObjId, name: &str) -> RtResult<ObjId> {
        match self.get(obj) {
            Object::Type(_) => {
                return match self.type_lookup(obj, name) {
                    Some(v) => Ok(self.new_ref(v)),
                    None => Err(self.no_attribute(obj, name)),
                }
            }
            Object::Module(m) => {
                let d = m.dict;
                return match self.dict_get_str(d, name) {
                    Some(v) => Ok(self.new_ref(v)),
                    None => Err(self.no_attribute(obj, name)),
                };
            }
            _ => (),
        }
        let descr = self.type_lookup(self.type_of(obj), name);
        match descr {
            Some(d) if self.is_data_descriptor(d) => self.descr_get(d, obj, name),
            _ => self.getattr_with_descr(obj, name, descr),
        }
    }

    /// Finish an instance attribute lookup once the type-level lookup has produced `descr`,
    /// which is known not to be a data descriptor: the instance dictionary is consulted first,
    /// then `descr` is bound (functions) or returned as-is.
    pub fn getattr_with_descr(
        &mut self,
        obj: ObjId,
        name: &str,
        descr: Option<ObjId>,
    ) -> RtResult<ObjId> {
        if let Object::Instance(Instance { dict: Some(d), .. }) = self.get(obj) {
            if let Some(v) = d.get_str(name) {
                return Ok(self.new_ref(v));
            }
        }
        match descr {
            Some(d) => match self.get(d) {
                Object::Function(_) | Object::Builtin(_) => {
                    let m = super::Method {
                        func: self.new_ref(d),
                        self_: self.new_ref(obj),
                    };
                    Ok(self.alloc(Object::Method(m)))
                }
                _ => Ok(self.new_ref(d)),
            },
            None => Err(self.no_attribute(obj, name)),
        }
    }

    fn descr_get(&mut self, descr: ObjId, obj: ObjId, name: &str) -> RtResult<ObjId> {
        match self.get(descr) {
            Object::SlotDescr(s) => {
                let idx = s.index;
                self.slot_get(obj, idx, name)
            }
            Object::Property(g) => {
                let g = *g;
                self.call(g, &[obj], &[])
            }
            _ => unreachable!(),
        }
    }

    /// Read instance slot `idx` of `obj`.
    pub fn slot_get(&mut self, obj: ObjId, idx: usize, name: &str) -> RtResult<ObjId> {
        let v = match self.get(obj) {
            Object::Instance(i) => i.slots.get(idx).copied().flatten(),
            _ => None,
        };
        match v {
            Some(v) => Ok(self.new_ref(v)),
            None => Err(self.no_attribute(obj, name)),
        }
    }

    /// Write (`Some`) or clear (`None`) instance slot `idx` of `obj`. Clearing an empty slot
    /// raises `AttributeError`.
    pub fn slot_set(
        &mut self,
        obj: ObjId,
        idx: usize,
        v: Option<ObjId>,
        name: &str,
    ) -> RtResult<()> {
        if let Some(v) = v {
            self.incref(v);
        }
        let old = match self.get_mut(obj) {
            Object::Instance(i) if idx < i.slots.len() => std::mem::replace(&mut i.slots[idx], v),
            _ => panic!("{obj} has no slot {idx}"),
        };
        match (old, v) {
            (Some(old), _) => {
                self.decref(old);
                Ok(())
            }
            (None, Some(_)) => Ok(()),
            (None, None) => Err(self.no_attribute(obj, name)),
        }
    }

    pub fn setattr(&mut self, obj: ObjId, name: ObjId, v: ObjId) -> RtResult<()> {
        let name = self.expect_str(name, "attribute name")?;
        self.setattr_str(obj, &name, Some(v))
    }

    pub fn delattr(&mut self, obj: ObjId, name: ObjId) -> RtResult<()> {
        let name = self.expect_str(name, "attribute name")?;
        self.setattr_str(obj, &name, None)
    }

    /// Set (`Some`) or delete (`None`) attribute `name` of `obj`.
    pub fn setattr_str(&mut self, obj: ObjId, name: &str, v: Option<ObjId>) -> RtResult<()> {
        match self.get(obj) {
            Object::Type(t) => {
                if t.kind == TypeKind::Builtin {
                    let te = self.types.type_error;
                    let msg = format!("can't set attributes of built-in type '{}'", t.name);
                    return Err(self.raise_new(te, &msg));
                }
                match v {
                    Some(v) => self.dict_set_str(obj, name, v),
                    None => {
                        if !self.dict_del_str(obj, name) {
                            return Err(self.no_attribute(obj, name));
                        }
                    }
                }
                self.type_modified(obj);
                return Ok(());
            }
            Object::Module(m) => {
                let d = m.dict;
                return self.setattr_dict(d, obj, name, v);
            }
            _ => (),
        }
        let descr = self.type_lookup(self.type_of(obj), name);
        if let Some(d) = descr {
            match self.get(d) {
                Object::SlotDescr(s) => {
                    let idx = s.index;
                    return self.slot_set(obj, idx, v, name);
                }
                Object::Property(_) => {
                    let ae = self.types.attribute_error;
                    return Err(self.raise_new(ae, "can't set attribute"));
                }
                _ => (),
            }
        }
        self.setattr_instance_dict(obj, name, v)
    }

    /// Set or delete `name` in `obj`'s instance dictionary, bypassing the type.
    pub fn setattr_instance_dict(
        &mut self,
        obj: ObjId,
        name: &str,
        v: Option<ObjId>,
    ) -> RtResult<()> {
        match self.get(obj) {
            Object::Instance(Instance { dict: Some(_), .. }) => {
                self.setattr_dict(obj, obj, name, v)
            }
            _ => Err(self.no_attribute(obj, name)),
        }
    }

    fn setattr_dict(
        &mut self,
        owner: ObjId,
        obj: ObjId,
        name: &str,
        v: Option<ObjId>,
    ) -> RtResult<()> {
        match v {
            Some(v) => {
                self.dict_set_str(owner, name, v);
                Ok(())
            }
            None if self.dict_del_str(owner, name) => Ok(()),
            None => Err(self.no_attribute(obj, name)),
        }
    }

    // Truth, comparison and containment.

    pub fn is_true(&self, id: ObjId) -> bool {
        match self.get(id) {
            Object::None => false,
            Object::Bool(b) => *b,
            Object::Int(i) => *i != 0,
            Object::Float(f) => *f != 0.0,
            Object::Str(s) => !s.is_empty(),
            Object::Tuple(xs) | Object::List(xs) => !xs.is_empty(),
            Object::Dict(d) => !d.is_empty(),
            _ => true,
        }
    }

    fn num(&self, id: ObjId) -> Option<Num> {
        match self.get(id) {
            Object::Bool(b) => Some(Num::Int(i64::from(*b))),
            Object::Int(i) => Some(Num::Int(*i)),
            Object::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    /// Evaluate any `COMPARE_OP` operator, returning a new reference.
    pub fn compare_op(&mut self, op: CompareOp, a: ObjId, b: ObjId) -> RtResult<ObjId> {
        let r = match op {
            CompareOp::In => self.contains(b, a)?,
            CompareOp::NotIn => !self.contains(b, a)?,
            CompareOp::Is => a == b,
            CompareOp::IsNot => a != b,
            CompareOp::ExcMatch => self.exception_matches(a, b),
            _ => self.compare(op, a, b)?,
        };
        Ok(self.new_ref(self.bool_obj(r)))
    }

    /// Evaluate one of the six rich comparisons.
    pub fn compare(&mut self, op: CompareOp, a: ObjId, b: ObjId) -> RtResult<bool> {
        if matches!(op, CompareOp::Eq | CompareOp::Ne) {
            let e = self.equal(a, b)?;
            return Ok(e == (op == CompareOp::Eq));
        }
        let ord = self.order(a, b)?;
        Ok(match op {
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            _ => unreachable!(),
        })
    }

    pub fn equal(&mut self, a: ObjId, b: ObjId) -> RtResult<bool> {
        if a == b {
            return Ok(true);
        }
        if let (Some(x), Some(y)) = (self.num(a), self.num(b)) {
            return Ok(match (x, y) {
                (Num::Int(x), Num::Int(y)) => x == y,
                _ => x.as_f64() == y.as_f64(),
            });
        }
        let pairs = match (self.get(a), self.get(b)) {
            (Object::Str(x), Object::Str(y)) => return Ok(x == y),
            (Object::Tuple(x), Object::Tuple(y)) | (Object::List(x), Object::List(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                x.iter().copied().zip(y.iter().copied()).collect::<Vec<_>>()
            }
            (Object::Dict(x), Object::Dict(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                let mut pairs = Vec::with_capacity(x.len());
                for (hk, (_, v)) in &x.entries {
                    match y.entries.get(hk) {
                        Some((_, w)) => pairs.push((*v, *w)),
                        None => return Ok(false),
                    }
                }
                pairs
            }
            _ => return Ok(false),
        };
        for (x, y) in pairs {
            if !self.equal(x, y)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn order(&mut self, a: ObjId, b: ObjId) -> RtResult<Ordering> {
        if let (Some(x), Some(y)) = (self.num(a), self.num(b)) {
            return Ok(match (x, y) {
                (Num::Int(x), Num::Int(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            });
        }
        let (xs, ys) = match (self.get(a), self.get(b)) {
            (Object::Str(x), Object::Str(y)) => return Ok(x.cmp(y)),
            (Object::Tuple(x), Object::Tuple(y)) | (Object::List(x), Object::List(y)) => {
                (x.clone(), y.clone())
            }
            _ => {
                let te = self.types.type_error;
                let msg = format!(
                    "unorderable types: {}() and {}()",
                    self.type_name_of(a),
                    self.type_name_of(b)
                );
                return Err(self.raise_new(te, &msg));
            }
        };
        for (x, y) in xs.iter().zip(ys.iter()) {
            if !self.equal(*x, *y)? {
                return self.order(*x, *y);
            }
        }
        Ok(xs.len().cmp(&ys.len()))
    }

    /// Is `item` in `container`?
    pub fn contains(&mut self, container: ObjId, item: ObjId) -> RtResult<bool> {
        let xs = match self.get(container) {
            Object::Tuple(xs) | Object::List(xs) => xs.clone(),
            Object::Str(s) => {
                return match self.get(item) {
                    Object::Str(sub) => Ok(s.contains(sub.as_str())),
                    _ => {
                        let te = self.types.type_error;
                        Err(self.raise_new(te, "'in <string>' requires string as left operand"))
                    }
                }
            }
            Object::Dict(_) => return Ok(self.dict_get(container, item)?.is_some()),
            _ => {
                let te = self.types.type_error;
                let msg = format!(
                    "argument of type '{}' is not iterable",
                    self.type_name_of(container)
                );
                return Err(self.raise_new(te, &msg));
            }
        };
        for x in xs {
            if self.equal(x, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Does the exception `exc` (a type or an instance) match `spec` (a type or a tuple of
    /// types)?
    pub fn exception_matches(&self, exc: ObjId, spec: ObjId) -> bool {
        let exc_ty = match self.get(exc) {
            Object::Type(_) => exc,
            _ => self.type_of(exc),
        };
        match self.get(spec) {
            Object::Tuple(xs) => xs.iter().any(|s| self.exception_matches(exc_ty, *s)),
            Object::Type(_) => self.is_subtype(exc_ty, spec),
            _ => false,
        }
    }

    // Arithmetic.

    fn new_num(&mut self, n: Num) -> ObjId {
        match n {
            Num::Int(i) => self.new_int(i),
            Num::Float(f) => self.new_float(f),
        }
    }

    fn overflow(&mut self) -> super::Raised {
        let rte = self.types.runtime_error;
        self.raise_new(rte, "integer overflow")
    }

    fn unsupported(&mut self, op: BinaryOp, a: ObjId, b: ObjId) -> super::Raised {
        let te = self.types.type_error;
        let msg = format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            self.type_name_of(a),
            self.type_name_of(b)
        );
        self.raise_new(te, &msg)
    }

    pub fn binary_op(&mut self, op: BinaryOp, a: ObjId, b: ObjId) -> RtResult<ObjId> {
        if let Some(r) = self.sequence_op(op, a, b)? {
            return Ok(r);
        }
        let (Some(x), Some(y)) = (self.num(a), self.num(b)) else {
            return Err(self.unsupported(op, a, b));
        };
        if op.is_bitwise() {
            let (Num::Int(x), Num::Int(y)) = (x, y) else {
                return Err(self.unsupported(op, a, b));
            };
            let both_bool = matches!(
                (self.get(a), self.get(b)),
                (Object::Bool(_), Object::Bool(_))
            );
            let r = self.int_op(op, x, y)?;
            return Ok(match r {
                Num::Int(i) if both_bool && !matches!(op, BinaryOp::LShift | BinaryOp::RShift) => {
                    self.new_ref(self.bool_obj(i != 0))
                }
                r => self.new_num(r),
            });
        }
        let r = match (x, y) {
            (Num::Int(x), Num::Int(y)) => self.int_op(op, x, y)?,
            _ => self.float_op(op, x.as_f64(), y.as_f64())?,
        };
        Ok(self.new_num(r))
    }

    /// The in-place variant of `op`: lists are extended in place, everything else behaves as
    /// [Runtime::binary_op].
    pub fn inplace_op(&mut self, op: BinaryOp, a: ObjId, b: ObjId) -> RtResult<ObjId> {
        if op == BinaryOp::Add {
            if let (Object::List(_), Object::List(ys)) = (self.get(a), self.get(b)) {
                let ys = ys.clone();
                for y in &ys {
                    self.incref(*y);
                }
                if let Object::List(xs) = self.get_mut(a) {
                    xs.extend(ys);
                }
                return Ok(self.new_ref(a));
            }
        }
        self.binary_op(op, a, b)
    }

    fn int_op(&mut self, op: BinaryOp, x: i64, y: i64) -> RtResult<Num> {
        let r = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Subtract => x.checked_sub(y),
            BinaryOp::Multiply => x.checked_mul(y),
            BinaryOp::Divide | BinaryOp::FloorDivide | BinaryOp::Modulo => {
                if y == 0 {
                    let zde = self.types.zero_division_error;
                    return Err(self.raise_new(zde, "integer division or modulo by zero"));
                }
                if op == BinaryOp::Modulo {
                    py_mod(x, y)
                } else {
                    floor_div(x, y)
                }
            }
            BinaryOp::TrueDivide => return self.float_op(op, x as f64, y as f64),
            BinaryOp::Power => {
                if y < 0 {
                    return Ok(Num::Float((x as f64).powf(y as f64)));
                }
                u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
            }
            BinaryOp::LShift | BinaryOp::RShift => {
                if y < 0 {
                    let ve = self.types.value_error;
                    return Err(self.raise_new(ve, "negative shift count"));
                }
                if op == BinaryOp::RShift {
                    Some(if y >= 64 { x >> 63 } else { x >> y })
                } else if x == 0 {
                    Some(0)
                } else if y >= 63 {
                    None
                } else {
                    let r = x << y;
                    (r >> y == x).then_some(r)
                }
            }
            BinaryOp::And => Some(x & y),
            BinaryOp::Xor => Some(x ^ y),
            BinaryOp::Or => Some(x | y),
        };
        match r {
            Some(r) => Ok(Num::Int(r)),
            None => Err(self.overflow()),
        }
    }

    fn float_op(&mut self, op: BinaryOp, x: f64, y: f64) -> RtResult<Num> {
        let zero_div = |rt: &mut Self, what: &str| {
            let zde = rt.types.zero_division_error;
            rt.raise_new(zde, &format!("float {what} by zero"))
        };
        Ok(Num::Float(match op {
            BinaryOp::Add => x + y,
            BinaryOp::Subtract => x - y,
            BinaryOp::Multiply => x * y,
            BinaryOp::Divide | BinaryOp::TrueDivide => {
                if y == 0.0 {
                    return Err(zero_div(self, "division"));
                }
                x / y
            }
            BinaryOp::FloorDivide => {
                if y == 0.0 {
                    return Err(zero_div(self, "divmod()"));
                }
                (x / y).floor()
            }
            BinaryOp::Modulo => {
                if y == 0.0 {
                    return Err(zero_div(self, "modulo"));
                }
                let m = x % y;
                if m != 0.0 && ((m < 0.0) != (y < 0.0)) {
                    m + y
                } else {
                    m
                }
            }
            BinaryOp::Power => x.powf(y),
            BinaryOp::LShift
            | BinaryOp::RShift
            | BinaryOp::And
            | BinaryOp::Xor
            | BinaryOp::Or => unreachable!(),
        }))
    }

    /// Evaluate the operators strings, lists and tuples overload. Returns `Ok(None)` if
    /// `op` is not a sequence operation on `a` and `b`.
    fn sequence_op(&mut self, op: BinaryOp, a: ObjId, b: ObjId) -> RtResult<Option<ObjId>> {
        if op == BinaryOp::Modulo {
            if let Object::Str(fmt) = self.get(a) {
                let fmt = fmt.clone();
                let s = self.format_percent(&fmt, b)?;
                return Ok(Some(self.new_str(&s)));
            }
        }
        let r = match (op, self.get(a), self.get(b)) {
            (BinaryOp::Add, Object::Str(x), Object::Str(y)) => Seq::Str(format!("{x}{y}")),
            (BinaryOp::Add, Object::List(x), Object::List(y)) => {
                Seq::List(x.iter().chain(y).copied().collect())
            }
            (BinaryOp::Add, Object::Tuple(x), Object::Tuple(y)) => {
                Seq::Tuple(x.iter().chain(y).copied().collect())
            }
            (BinaryOp::Multiply, Object::Str(s), Object::Int(n))
            | (BinaryOp::Multiply, Object::Int(n), Object::Str(s)) => {
                Seq::Str(s.repeat(usize::try_from(*n).unwrap_or(0)))
            }
            (BinaryOp::Multiply, Object::List(xs), Object::Int(n))
            | (BinaryOp::Multiply, Object::Int(n), Object::List(xs)) => Seq::List(repeat(xs, *n)),
            (BinaryOp::Multiply, Object::Tuple(xs), Object::Int(n))
            | (BinaryOp::Multiply, Object::Int(n), Object::Tuple(xs)) => {
                Seq::Tuple(repeat(xs, *n))
            }
            _ => return Ok(None),
        };
        Ok(Some(match r {
            Seq::Str(s) => self.new_str(&s),
            Seq::List(xs) => {
                for x in &xs {
                    self.incref(*x);
                }
                self.new_list(xs)
            }
            Seq::Tuple(xs) => {
                for x in &xs {
                    self.incref(*x);
                }
                self.new_tuple(xs)
            }
        }))
    }

    /// `%`-formatting supporting the `%s`, `%r`, `%d` and `%%` conversions.
    fn format_percent(&mut self, fmt: &str, args: ObjId) -> RtResult<String> {
        let args = match self.get(args) {
            Object::Tuple(xs) => xs.clone(),
            _ => vec![args],
        };
        let mut args = args.into_iter();
        let mut out = String::new();
        let mut chars = fmt.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let conv = chars.next();
            if conv == Some('%') {
                out.push('%');
                continue;
            }
            let Some(arg) = args.next() else {
                let te = self.types.type_error;
                return Err(self.raise_new(te, "not enough arguments for format string"));
            };
            match conv {
                Some('s') => out.push_str(&self.str_of(arg)),
                Some('r') => out.push_str(&self.repr(arg)),
                Some('d') => match self.num(arg) {
                    Some(n) => out.push_str(&(n.as_f64().trunc() as i64).to_string()),
                    None => {
                        let te = self.types.type_error;
                        return Err(self.raise_new(te, "%d format: a number is required"));
                    }
                },
                _ => {
                    let ve = self.types.value_error;
                    return Err(self.raise_new(ve, "unsupported format character"));
                }
            }
        }
        if args.next().is_some() {
            let te = self.types.type_error;
            return Err(self.raise_new(
                te,
                "not all arguments converted during string formatting",
            ));
        }
        Ok(out)
    }

    pub fn unary_op(&mut self, op: UnaryOp, a: ObjId) -> RtResult<ObjId> {
        let n = self.num(a);
        let r = match (op, n) {
            (UnaryOp::Not, _) => return Ok(self.new_ref(self.bool_obj(!self.is_true(a)))),
            (UnaryOp::Convert, _) => {
                let s = self.repr(a);
                return Ok(self.new_str(&s));
            }
            (UnaryOp::Positive, Some(n)) => n,
            (UnaryOp::Negative, Some(Num::Int(i))) => match i.checked_neg() {
                Some(i) => Num::Int(i),
                None => return Err(self.overflow()),
            },
            (UnaryOp::Negative, Some(Num::Float(f))) => Num::Float(-f),
            (UnaryOp::Invert, Some(Num::Int(i))) => Num::Int(!i),
            _ => {
                let sym = match op {
                    UnaryOp::Positive => "+",
                    UnaryOp::Negative => "-",
                    _ => "~",
                };
                let te = self.types.type_error;
                let msg = format!("bad operand type for unary {sym}: '{}'", self.type_name_of(a));
                return Err(self.raise_new(te, &msg));
            }
        };
        Ok(self.new_num(r))
    }

    // Subscripts and slices.

    /// Normalise the index `k` into sequence `seq`, raising `IndexError` if out of range.
    fn seq_index(&mut self, seq: ObjId, k: ObjId) -> RtResult<usize> {
        let (len, kind) = match self.get(seq) {
            Object::List(xs) => (xs.len(), "list"),
            Object::Tuple(xs) => (xs.len(), "tuple"),
            Object::Str(s) => (s.chars().count(), "string"),
            _ => unreachable!(),
        };
        let i = match self.get(k) {
            Object::Int(i) => *i,
            Object::Bool(b) => i64::from(*b),
            _ => {
                let te = self.types.type_error;
                let msg = format!("{kind} indices must be integers, not {}", self.type_name_of(k));
                return Err(self.raise_new(te, &msg));
            }
        };
        let j = if i < 0 { i + len as i64 } else { i };
        if j < 0 || j >= len as i64 {
            let ie = self.types.index_error;
            return Err(self.raise_new(ie, &format!("{kind} index out of range")));
        }
        Ok(j as usize)
    }

    pub fn getitem(&mut self, c: ObjId, k: ObjId) -> RtResult<ObjId> {
        if let Object::Slice(s) = self.get(k) {
            let (start, stop, step) = (s.start, s.stop, s.step);
            return self.slice_get(c, Some(start), Some(stop), Some(step));
        }
        match self.get(c) {
            Object::List(_) | Object::Tuple(_) | Object::Str(_) => {
                let i = self.seq_index(c, k)?;
                match self.get(c) {
                    Object::List(xs) | Object::Tuple(xs) => {
                        let v = xs[i];
                        Ok(self.new_ref(v))
                    }
                    Object::Str(s) => {
                        let ch = s.chars().nth(i).map(String::from).unwrap_or_default();
                        Ok(self.new_str(&ch))
                    }
                    _ => unreachable!(),
                }
            }
            Object::Dict(_) => match self.dict_get(c, k)? {
                Some(v) => Ok(self.new_ref(v)),
                None => Err(self.key_error(k)),
            },
            _ => {
                let te = self.types.type_error;
                let msg = format!("'{}' object is not subscriptable", self.type_name_of(c));
                Err(self.raise_new(te, &msg))
            }
        }
    }

    pub fn setitem(&mut self, c: ObjId, k: ObjId, v: ObjId) -> RtResult<()> {
        match self.get(c) {
            Object::List(_) => {
                let i = self.seq_index(c, k)?;
                self.incref(v);
                let old = match self.get_mut(c) {
                    Object::List(xs) => std::mem::replace(&mut xs[i], v),
                    _ => unreachable!(),
                };
                self.decref(old);
                Ok(())
            }
            Object::Dict(_) => self.dict_set(c, k, v),
            _ => {
                let te = self.types.type_error;
                let msg = format!(
                    "'{}' object does not support item assignment",
                    self.type_name_of(c)
                );
                Err(self.raise_new(te, &msg))
            }
        }
    }

    pub fn delitem(&mut self, c: ObjId, k: ObjId) -> RtResult<()> {
        match self.get(c) {
            Object::List(_) => {
                let i = self.seq_index(c, k)?;
                let old = match self.get_mut(c) {
                    Object::List(xs) => xs.remove(i),
                    _ => unreachable!(),
                };
                self.decref(old);
                Ok(())
            }
            Object::Dict(_) => self.dict_del(c, k),
            _ => {
                let te = self.types.type_error;
                let msg = format!(
                    "'{}' object doesn't support item deletion",
                    self.type_name_of(c)
                );
                Err(self.raise_new(te, &msg))
            }
        }
    }

    /// Convert an optional slice bound into an integer, `None` meaning absent.
    fn slice_bound(&mut self, b: Option<ObjId>) -> RtResult<Option<i64>> {
        let Some(b) = b else {
            return Ok(None);
        };
        match self.get(b) {
            Object::None => Ok(None),
            Object::Int(i) => Ok(Some(*i)),
            Object::Bool(x) => Ok(Some(i64::from(*x))),
            _ => {
                let te = self.types.type_error;
                Err(self.raise_new(te, "slice indices must be integers or None"))
            }
        }
    }

    /// The indices selected by slicing a sequence of length `len`.
    fn slice_indices(
        &mut self,
        len: usize,
        start: Option<ObjId>,
        stop: Option<ObjId>,
        step: Option<ObjId>,
    ) -> RtResult<Vec<usize>> {
        let step = self.slice_bound(step)?.unwrap_or(1);
        let start = self.slice_bound(start)?;
        let stop = self.slice_bound(stop)?;
        if step == 0 {
            let ve = self.types.value_error;
            return Err(self.raise_new(ve, "slice step cannot be zero"));
        }
        let n = len as i64;
        if step > 0 {
            let lo = start.map(|i| clamp_index(i, len)).unwrap_or(0) as i64;
            let hi = stop.map(|i| clamp_index(i, len)).unwrap_or(len) as i64;
            Ok((lo..hi.max(lo))
                .step_by(step as usize)
                .map(|i| i as usize)
                .collect())
        } else {
            let adjust = |i: i64| {
                let i = if i < 0 { i + n } else { i };
                i.clamp(-1, n - 1)
            };
            let mut i = start.map(adjust).unwrap_or(n - 1);
            let hi = stop.map(adjust).unwrap_or(-1);
            let mut out = Vec::new();
            while i > hi {
                out.push(i as usize);
                i += step;
            }
            Ok(out)
        }
    }

    fn slice_get(
        &mut self,
        seq: ObjId,
        start: Option<ObjId>,
        stop: Option<ObjId>,
        step: Option<ObjId>,
    ) -> RtResult<ObjId> {
        let len = match self.get(seq) {
            Object::List(xs) | Object::Tuple(xs) => xs.len(),
            Object::Str(s) => s.chars().count(),
            _ => {
                let te = self.types.type_error;
                let msg = format!("'{}' object is unsliceable", self.type_name_of(seq));
                return Err(self.raise_new(te, &msg));
            }
        };
        let idxs = self.slice_indices(len, start, stop, step)?;
        match self.get(seq) {
            Object::Str(s) => {
                let chars = s.chars().collect::<Vec<_>>();
                let out = idxs.iter().map(|i| chars[*i]).collect::<String>();
                Ok(self.new_str(&out))
            }
            Object::List(xs) | Object::Tuple(xs) => {
                let is_list = matches!(self.get(seq), Object::List(_));
                let items = idxs.iter().map(|i| xs[*i]).collect::<Vec<_>>();
                for x in &items {
                    self.incref(*x);
                }
                Ok(if is_list {
                    self.new_list(items)
                } else {
                    self.new_tuple(items)
                })
            }
            _ => unreachable!(),
        }
    }

    /// `seq[start:stop]`, either bound optional.
    pub fn apply_slice(
        &mut self,
        seq: ObjId,
        start: Option<ObjId>,
        stop: Option<ObjId>,
    ) -> RtResult<ObjId> {
        self.slice_get(seq, start, stop, None)
    }

    /// `seq[start:stop] = v`, or `del seq[start:stop]` if `v` is `None`.
    pub fn assign_slice(
        &mut self,
        seq: ObjId,
        start: Option<ObjId>,
        stop: Option<ObjId>,
        v: Option<ObjId>,
    ) -> RtResult<()> {
        let len = match self.get(seq) {
            Object::List(xs) => xs.len(),
            _ => {
                let te = self.types.type_error;
                let msg = format!(
                    "'{}' object does not support slice assignment",
                    self.type_name_of(seq)
                );
                return Err(self.raise_new(te, &msg));
            }
        };
        let new = match v {
            None => Vec::new(),
            Some(v) => match self.get(v) {
                Object::List(xs) | Object::Tuple(xs) => xs.clone(),
                _ => {
                    let te = self.types.type_error;
                    return Err(self.raise_new(te, "can only assign an iterable"));
                }
            },
        };
        let lo = self.slice_bound(start)?.map(|i| clamp_index(i, len)).unwrap_or(0);
        let hi = self
            .slice_bound(stop)?
            .map(|i| clamp_index(i, len))
            .unwrap_or(len)
            .max(lo);
        for x in &new {
            self.incref(*x);
        }
        let removed = match self.get_mut(seq) {
            Object::List(xs) => xs.splice(lo..hi, new).collect::<Vec<_>>(),
            _ => unreachable!(),
        };
        for x in removed {
            self.decref(x);
        }
        Ok(())
    }

    // Iteration.

    pub fn get_iter(&mut self, o: ObjId) -> RtResult<ObjId> {
        let it = match self.get(o) {
            Object::List(_) | Object::Tuple(_) | Object::Str(_) => Iter::Seq { seq: o, idx: 0 },
            Object::Dict(d) => Iter::Keys {
                keys: d.entries.values().map(|(k, _)| *k).collect(),
                idx: 0,
            },
            Object::Iter(_) | Object::Generator(_) => return Ok(self.new_ref(o)),
            _ => {
                let te = self.types.type_error;
                let msg = format!("'{}' object is not iterable", self.type_name_of(o));
                return Err(self.raise_new(te, &msg));
            }
        };
        match &it {
            Iter::Seq { seq, .. } => self.incref(*seq),
            Iter::Keys { keys, .. } => {
                for k in keys {
                    self.incref(*k);
                }
            }
        }
        Ok(self.alloc(Object::Iter(it)))
    }

    /// Advance the iterator `it`. `Ok(None)` means the iterator is exhausted (no exception is
    /// set).
    pub fn iter_next(&mut self, it: ObjId) -> RtResult<Option<ObjId>> {
        match self.get_mut(it) {
            Object::Iter(Iter::Seq { seq, idx }) => {
                let (seq, i) = (*seq, *idx);
                *idx += 1;
                match self.get(seq) {
                    Object::List(xs) | Object::Tuple(xs) => match xs.get(i) {
                        Some(v) => {
                            let v = *v;
                            Ok(Some(self.new_ref(v)))
                        }
                        None => Ok(None),
                    },
                    Object::Str(s) => match s.chars().nth(i) {
                        Some(c) => Ok(Some(self.new_str(&String::from(c)))),
                        None => Ok(None),
                    },
                    _ => unreachable!(),
                }
            }
            Object::Iter(Iter::Keys { keys, idx }) => {
                // Ownership of each key moves out of the snapshot as it is yielded.
                let k = keys.get(*idx).copied();
                if k.is_some() {
                    *idx += 1;
                }
                Ok(k)
            }
            Object::Generator(_) => {
                let none = self.none;
                self.gen_send(it, none)
            }
            _ => {
                let te = self.types.type_error;
                let msg = format!("'{}' object is not an iterator", self.type_name_of(it));
                Err(self.raise_new(te, &msg))
            }
        }
    }

    /// Unpack `seq` into exactly `n` new references, in sequence order.
    pub fn unpack_sequence(&mut self, seq: ObjId, n: usize) -> RtResult<Vec<ObjId>> {
        let items = match self.get(seq) {
            Object::Tuple(xs) | Object::List(xs) => {
                let xs = xs.clone();
                for x in &xs {
                    self.incref(*x);
                }
                xs
            }
            _ => {
                let it = self.get_iter(seq)?;
                let mut items = Vec::new();
                loop {
                    match self.iter_next(it) {
                        Ok(Some(x)) => items.push(x),
                        Ok(None) => break,
                        Err(e) => {
                            for x in items {
                                self.decref(x);
                            }
                            self.decref(it);
                            return Err(e);
                        }
                    }
                }
                self.decref(it);
                items
            }
        };
        if items.len() == n {
            return Ok(items);
        }
        let msg = if items.len() > n {
            "too many values to unpack".to_owned()
        } else {
            format!("need more than {} values to unpack", items.len())
        };
        for x in items {
            self.decref(x);
        }
        let ve = self.types.value_error;
        Err(self.raise_new(ve, &msg))
    }

    // Conversion to text.

    pub fn repr(&self, id: ObjId) -> String {
        match self.get(id) {
            Object::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Object::Tuple(xs) if xs.len() == 1 => format!("({},)", self.repr(xs[0])),
            Object::Tuple(xs) => format!("({})", self.join_reprs(xs)),
            Object::List(xs) => format!("[{}]", self.join_reprs(xs)),
            Object::Dict(d) => {
                let items = d
                    .entries
                    .values()
                    .map(|(k, v)| format!("{}: {}", self.repr(*k), self.repr(*v)))
                    .collect::<Vec<_>>();
                format!("{{{}}}", items.join(", "))
            }
            Object::Instance(i) if self.is_subtype(i.ty, self.types.base_exception) => {
                let args = self.exception_args(id);
                let args = match args.len() {
                    1 => format!("{},", self.repr(args[0])),
                    _ => self.join_reprs(&args),
                };
                format!("{}({args})", self.type_name(i.ty))
            }
            _ => self.str_of(id),
        }
    }

    fn join_reprs(&self, xs: &[ObjId]) -> String {
        xs.iter()
            .map(|x| self.repr(*x))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The borrowed `args` of an exception instance.
    fn exception_args(&self, e: ObjId) -> Vec<ObjId> {
        match self.get(e) {
            Object::Instance(Instance { dict: Some(d), .. }) => match d.get_str("args") {
                Some(a) => match self.get(a) {
                    Object::Tuple(xs) => xs.clone(),
                    _ => vec![a],
                },
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// The informal string form of `id`, as `str()` or `print` produce it.
    pub fn str_of(&self, id: ObjId) -> String {
        match self.get(id) {
            Object::None => "None".to_owned(),
            Object::Bool(true) => "True".to_owned(),
            Object::Bool(false) => "False".to_owned(),
            Object::Int(i) => i.to_string(),
            Object::Float(f) => format_float(*f),
            Object::Str(s) => s.clone(),
            Object::Tuple(_) | Object::List(_) | Object::Dict(_) => self.repr(id),
            Object::Slice(s) => format!(
                "slice({}, {}, {})",
                self.repr(s.start),
                self.repr(s.stop),
                self.repr(s.step)
            ),
            Object::Cell(_) => "<cell>".to_owned(),
            Object::Code(c) => format!("<code object {}>", c.name),
            Object::Function(f) => match self.get(f.code) {
                Object::Code(c) => format!("<function {}>", c.name),
                _ => "<function>".to_owned(),
            },
            Object::Builtin(b) => format!("<built-in function {}>", b.name()),
            Object::Method(m) => format!("<bound method of {}>", self.repr(m.self_)),
            Object::Type(t) if t.kind == TypeKind::Builtin => format!("<type '{}'>", t.name),
            Object::Type(t) => format!("<class '{}'>", t.name),
            Object::Instance(i) if self.is_subtype(i.ty, self.types.base_exception) => {
                let args = self.exception_args(id);
                match args.len() {
                    0 => String::new(),
                    1 => self.str_of(args[0]),
                    _ => format!("({})", self.join_reprs(&args)),
                }
            }
            Object::Instance(i) => format!("<{} object>", self.type_name(i.ty)),
            Object::SlotDescr(s) => format!("<member '{}'>", s.name),
            Object::Property(_) => "<property>".to_owned(),
            Object::Module(m) => format!("<module '{}'>", m.name),
            Object::Iter(_) => "<iterator>".to_owned(),
            Object::Generator(_) => "<generator>".to_owned(),
            Object::Traceback(_) => "<traceback>".to_owned(),
        }
    }

    /// The integer value of `id`, if it is an `int` or `bool`.
    pub fn int_value(&self, id: ObjId) -> Option<i64> {
        match self.get(id) {
            Object::Int(i) => Some(*i),
            Object::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn int(rt: &Runtime, id: ObjId) -> i64 {
        rt.int_value(id).unwrap()
    }

    #[test]
    fn int_arithmetic() {
        let mut rt = Runtime::new();
        let a = rt.new_int(-7);
        let b = rt.new_int(2);
        for (op, exp) in [
            (BinaryOp::Add, -5),
            (BinaryOp::Subtract, -9),
            (BinaryOp::Multiply, -14),
            (BinaryOp::Divide, -4),
            (BinaryOp::FloorDivide, -4),
            (BinaryOp::Modulo, 1),
            (BinaryOp::Power, 49),
            (BinaryOp::LShift, -28),
            (BinaryOp::RShift, -2),
        ] {
            let r = rt.binary_op(op, a, b).unwrap();
            assert_eq!(int(&rt, r), exp, "{op}");
            rt.decref(r);
        }
        let r = rt.binary_op(BinaryOp::TrueDivide, a, b).unwrap();
        assert_eq!(rt.str_of(r), "-3.5");
        rt.decref(r);
    }

    #[test]
    fn zero_division() {
        let mut rt = Runtime::new();
        let a = rt.new_int(1);
        let z = rt.new_int(0);
        assert!(rt.binary_op(BinaryOp::Modulo, a, z).is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(
            rt.format_exception(&info),
            "ZeroDivisionError: integer division or modulo by zero"
        );
        rt.release_exc(info);
    }

    #[test]
    fn unsupported_operands() {
        let mut rt = Runtime::new();
        let a = rt.new_int(1);
        let s = rt.new_str("x");
        assert!(rt.binary_op(BinaryOp::Subtract, a, s).is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(
            rt.format_exception(&info),
            "TypeError: unsupported operand type(s) for -: 'int' and 'str'"
        );
        rt.release_exc(info);
    }

    #[test]
    fn sequences() {
        let mut rt = Runtime::new();
        let before = rt.live_objects();
        let x = rt.new_int(1);
        let l = rt.new_list(vec![x]);
        let three = rt.new_int(3);
        let r = rt.binary_op(BinaryOp::Multiply, l, three).unwrap();
        assert_eq!(rt.repr(r), "[1, 1, 1]");
        assert_eq!(rt.refcount(x), 4);
        let neg = rt.new_int(-1);
        let last = rt.getitem(r, neg).unwrap();
        assert_eq!(last, x);
        for o in [r, three, neg, last, l] {
            rt.decref(o);
        }
        assert_eq!(rt.live_objects(), before);
    }

    #[test]
    fn slicing() {
        let mut rt = Runtime::new();
        let items = (0..5).map(|i| rt.new_int(i)).collect::<Vec<_>>();
        let l = rt.new_list(items);
        let one = rt.new_int(1);
        let m1 = rt.new_int(-1);
        let s = rt.apply_slice(l, Some(one), Some(m1)).unwrap();
        assert_eq!(rt.repr(s), "[1, 2, 3]");
        let none = rt.none();
        let sl = rt.build_slice(none, none, Some(m1));
        let rev = rt.getitem(l, sl).unwrap();
        assert_eq!(rt.repr(rev), "[4, 3, 2, 1, 0]");
        rt.assign_slice(l, Some(one), None, None).unwrap();
        assert_eq!(rt.repr(l), "[0]");
        for o in [l, one, m1, s, sl, rev] {
            rt.decref(o);
        }
    }

    #[test]
    fn dict_versions_change_on_mutation() {
        let mut rt = Runtime::new();
        let d = rt.new_dict();
        let v0 = rt.dict_version(d);
        let one = rt.new_int(1);
        rt.dict_set_str(d, "a", one);
        let v1 = rt.dict_version(d);
        assert_ne!(v0, v1);
        assert_eq!(rt.dict_get_str(d, "a"), Some(one));
        assert!(rt.dict_del_str(d, "a"));
        assert_ne!(rt.dict_version(d), v1);
        let other = rt.new_dict();
        assert_ne!(rt.dict_version(other), rt.dict_version(d));
        for o in [d, one, other] {
            rt.decref(o);
        }
    }

    #[test]
    fn slot_and_dict_attributes() {
        let mut rt = Runtime::new();
        let c = rt.new_class("P", None, &["x"], true);
        let p = rt.new_instance(c);
        let v = rt.new_int(3);
        rt.setattr_str(p, "x", Some(v)).unwrap();
        rt.setattr_str(p, "y", Some(v)).unwrap();
        let x = rt.getattr_str(p, "x").unwrap();
        let y = rt.getattr_str(p, "y").unwrap();
        assert_eq!((x, y), (v, v));
        rt.setattr_str(p, "x", None).unwrap();
        assert!(rt.getattr_str(p, "x").is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(
            rt.format_exception(&info),
            "AttributeError: 'P' object has no attribute 'x'"
        );
        rt.release_exc(info);
        for o in [x, y, v, p, c] {
            rt.decref(o);
        }
    }

    #[test]
    fn builtin_types_are_immutable() {
        let mut rt = Runtime::new();
        let int = rt.types.int;
        let one = rt.new_int(1);
        assert!(rt.setattr_str(int, "x", Some(one)).is_err());
        rt.err_clear();
        rt.decref(one);
    }

    #[test]
    fn comparisons() {
        let mut rt = Runtime::new();
        let a = rt.new_int(1);
        let b = rt.new_float(1.0);
        assert!(rt.compare(CompareOp::Eq, a, b).unwrap());
        let items = vec![rt.new_ref(a), rt.new_ref(a)];
        let t1 = rt.new_tuple(items);
        let items = vec![rt.new_ref(a), rt.new_ref(b)];
        let t2 = rt.new_tuple(items);
        assert!(rt.equal(t1, t2).unwrap());
        let s = rt.new_str("s");
        assert!(rt.compare(CompareOp::Lt, a, s).is_err());
        rt.err_clear();
        assert!(rt.contains(t1, b).unwrap());
        let r = rt.compare_op(CompareOp::NotIn, s, t1).unwrap();
        assert_eq!(r, rt.bool_obj(true));
        for o in [a, b, t1, t2, s, r] {
            rt.decref(o);
        }
    }

    #[test]
    fn exception_matching() {
        let rt = Runtime::new();
        let t = &rt.types;
        assert!(rt.exception_matches(t.key_error, t.lookup_error));
        assert!(!rt.exception_matches(t.key_error, t.type_error));
    }

    #[test]
    fn unpack() {
        let mut rt = Runtime::new();
        let a = rt.new_int(1);
        let t = rt.new_tuple(vec![a]);
        assert!(rt.unpack_sequence(t, 2).is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(
            rt.format_exception(&info),
            "ValueError: need more than 1 values to unpack"
        );
        rt.release_exc(info);
        let xs = rt.unpack_sequence(t, 1).unwrap();
        assert_eq!(xs, vec![a]);
        assert_eq!(rt.refcount(a), 2);
        rt.decref(xs[0]);
        rt.decref(t);
    }

    #[test]
    fn percent_formatting() {
        let mut rt = Runtime::new();
        let f = rt.new_str("%s=%d%%");
        let k = rt.new_str("k");
        let v = rt.new_int(5);
        let args = rt.new_tuple(vec![k, v]);
        let r = rt.binary_op(BinaryOp::Modulo, f, args).unwrap();
        assert_eq!(rt.str_of(r), "k=5%");
        for o in [f, args, r] {
            rt.decref(o);
        }
    }
}
