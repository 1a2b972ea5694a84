//! Runtime feedback: observations the interpreter records while executing a function, which the
//! translator consults when deciding what to specialise.
//!
//! Feedback is keyed by instruction offset and, for instructions with more than one interesting
//! operand, an operand index. It is advisory: stale feedback may make translated code slower
//! (or bail more often) but never incorrect.

use crate::runtime::ObjId;
use std::collections::HashMap;

/// How many distinct types a [TypeFeedback] records before it gives up.
pub const MAX_TYPES: usize = 3;

/// The types observed for one operand.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TypeFeedback {
    types: Vec<ObjId>,
    /// Were more than [MAX_TYPES] distinct types observed?
    overflowed: bool,
}

impl TypeFeedback {
    fn record(&mut self, ty: ObjId) {
        if self.overflowed || self.types.contains(&ty) {
            return;
        }
        if self.types.len() == MAX_TYPES {
            self.overflowed = true;
            self.types.clear();
        } else {
            self.types.push(ty);
        }
    }

    /// If exactly one type has been observed, return it.
    pub fn monomorphic(&self) -> Option<ObjId> {
        match self.types[..] {
            [ty] if !self.overflowed => Some(ty),
            _ => None,
        }
    }

    pub fn types(&self) -> &[ObjId] {
        &self.types
    }

    pub fn is_megamorphic(&self) -> bool {
        self.overflowed
    }
}

/// The outcomes observed at a conditional branch. "Taken" means the jump was taken.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BranchFeedback {
    pub taken: u64,
    pub not_taken: u64,
}

impl BranchFeedback {
    pub fn total(&self) -> u64 {
        self.taken + self.not_taken
    }
}

/// The shape of the calls made at one call site.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallFeedback {
    /// Every call went to `callee` with the operand `oparg`.
    Monomorphic { callee: ObjId, oparg: u32 },
    /// More than one callee, or more than one operand, was seen.
    Polymorphic,
}

impl CallFeedback {
    fn record(&mut self, callee: ObjId, oparg: u32) {
        if *self != (CallFeedback::Monomorphic { callee, oparg }) {
            *self = CallFeedback::Polymorphic;
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Feedback {
    Types(TypeFeedback),
    Branch(BranchFeedback),
    Call(CallFeedback),
}

/// The feedback for one code descriptor.
#[derive(Clone, Debug, Default)]
pub struct FeedbackMap {
    records: HashMap<(usize, u8), Feedback>,
}

impl FeedbackMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record that operand `arg` of the instruction at `off` had type `ty`.
    pub fn record_type(&mut self, off: usize, arg: u8, ty: ObjId) {
        let e = self
            .records
            .entry((off, arg))
            .or_insert_with(|| Feedback::Types(TypeFeedback::default()));
        match e {
            Feedback::Types(t) => t.record(ty),
            _ => panic!("type feedback recorded at non-type site {off}"),
        }
    }

    /// Record whether the conditional branch at `off` jumped.
    pub fn record_branch(&mut self, off: usize, taken: bool) {
        let e = self
            .records
            .entry((off, 0))
            .or_insert_with(|| Feedback::Branch(BranchFeedback::default()));
        match e {
            Feedback::Branch(b) if taken => b.taken += 1,
            Feedback::Branch(b) => b.not_taken += 1,
            _ => panic!("branch feedback recorded at non-branch site {off}"),
        }
    }

    /// Record that the call at `off`, whose operand is `oparg`, called `callee`.
    pub fn record_call(&mut self, off: usize, callee: ObjId, oparg: u32) {
        let e = self
            .records
            .entry((off, 0))
            .or_insert(Feedback::Call(CallFeedback::Monomorphic { callee, oparg }));
        match e {
            Feedback::Call(c) => c.record(callee, oparg),
            _ => panic!("call feedback recorded at non-call site {off}"),
        }
    }

    pub fn types(&self, off: usize, arg: u8) -> Option<&TypeFeedback> {
        match self.records.get(&(off, arg)) {
            Some(Feedback::Types(t)) => Some(t),
            _ => None,
        }
    }

    pub fn branch(&self, off: usize) -> Option<BranchFeedback> {
        match self.records.get(&(off, 0)) {
            Some(Feedback::Branch(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn call(&self, off: usize) -> Option<CallFeedback> {
        match self.records.get(&(off, 0)) {
            Some(Feedback::Call(c)) => Some(*c),
            _ => None,
        }
    }

    /// Fold `other`'s observations into this map.
    pub fn merge(&mut self, other: FeedbackMap) {
        for (k, v) in other.records {
            match (self.records.get_mut(&k), v) {
                (None, v) => {
                    self.records.insert(k, v);
                }
                (Some(Feedback::Types(t)), Feedback::Types(o)) => {
                    if o.overflowed {
                        t.overflowed = true;
                        t.types.clear();
                    }
                    for ty in o.types {
                        t.record(ty);
                    }
                }
                (Some(Feedback::Branch(b)), Feedback::Branch(o)) => {
                    b.taken += o.taken;
                    b.not_taken += o.not_taken;
                }
                (Some(Feedback::Call(c)), Feedback::Call(o)) => match o {
                    CallFeedback::Monomorphic { callee, oparg } => c.record(callee, oparg),
                    CallFeedback::Polymorphic => *c = CallFeedback::Polymorphic,
                },
                (Some(_), _) => panic!("mismatched feedback kinds at offset {}", k.0),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn types_saturate() {
        let rt = Runtime::new();
        let t = &rt.types;
        let mut fb = FeedbackMap::new();
        fb.record_type(3, 0, t.int);
        fb.record_type(3, 0, t.int);
        assert_eq!(fb.types(3, 0).unwrap().monomorphic(), Some(t.int));
        fb.record_type(3, 0, t.str_);
        assert_eq!(fb.types(3, 0).unwrap().monomorphic(), None);
        assert_eq!(fb.types(3, 0).unwrap().types(), &[t.int, t.str_]);
        fb.record_type(3, 0, t.list);
        fb.record_type(3, 0, t.dict);
        assert!(fb.types(3, 0).unwrap().is_megamorphic());
        assert!(fb.types(3, 0).unwrap().types().is_empty());
        assert!(fb.types(3, 1).is_none());
    }

    #[test]
    fn branches_and_merge() {
        let mut a = FeedbackMap::new();
        a.record_branch(7, true);
        a.record_branch(7, false);
        a.record_branch(7, false);
        let mut b = FeedbackMap::new();
        b.record_branch(7, true);
        b.record_branch(9, false);
        a.merge(b);
        assert_eq!(
            a.branch(7),
            Some(BranchFeedback {
                taken: 2,
                not_taken: 2
            })
        );
        assert_eq!(a.branch(9).unwrap().total(), 1);
        assert!(a.types(7, 0).is_none());
    }

    #[test]
    fn call_shapes() {
        let rt = Runtime::new();
        let len = rt.dict_get_str(rt.builtins(), "len").unwrap();
        let abs = rt.dict_get_str(rt.builtins(), "abs").unwrap();
        let mut a = FeedbackMap::new();
        a.record_call(4, len, 1);
        a.record_call(4, len, 1);
        assert_eq!(
            a.call(4),
            Some(CallFeedback::Monomorphic {
                callee: len,
                oparg: 1
            })
        );
        // Same callee, different shape.
        a.record_call(6, len, 1);
        a.record_call(6, len, 2);
        assert_eq!(a.call(6), Some(CallFeedback::Polymorphic));
        assert!(a.branch(4).is_none());

        let mut b = FeedbackMap::new();
        b.record_call(4, abs, 1);
        b.record_call(8, abs, 1);
        a.merge(b);
        assert_eq!(a.call(4), Some(CallFeedback::Polymorphic));
        assert_eq!(
            a.call(8),
            Some(CallFeedback::Monomorphic {
                callee: abs,
                oparg: 1
            })
        );
    }
}
