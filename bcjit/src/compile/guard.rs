//! Guard dependencies: the type objects a translated function's speculative fast paths rely on.

use crate::runtime::{InvalidationListener, ObjId};
use std::cell::Cell;

/// The set of types a compiled function depends on, and whether they are all still as they were
/// when the function was translated. Once cleared, the validity flag is never set again:
/// recovery is by re-translation.
#[derive(Debug)]
pub struct GuardSet {
    types: Vec<ObjId>,
    valid: Cell<bool>,
}

impl GuardSet {
    pub(crate) fn new() -> Self {
        Self {
            types: Vec::new(),
            valid: Cell::new(true),
        }
    }

    /// Record a dependency on `ty`.
    pub(crate) fn depend_on(&mut self, ty: ObjId) {
        if !self.types.contains(&ty) {
            self.types.push(ty);
        }
    }

    pub fn types(&self) -> &[ObjId] {
        &self.types
    }

    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }
}

impl InvalidationListener for GuardSet {
    fn invalidate(&self, _ty: ObjId) {
        self.valid.set(false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::Runtime;
    use std::rc::{Rc, Weak};

    #[test]
    fn invalidated_by_type_mutation() {
        let mut rt = Runtime::new();
        let c = rt.new_class("C", None, &["x"], false);
        let d = rt.new_class("D", None, &[], true);
        let mut gs = GuardSet::new();
        gs.depend_on(c);
        gs.depend_on(c);
        assert_eq!(gs.types(), &[c]);
        let gs = Rc::new(gs);
        let l: Weak<dyn InvalidationListener> = Rc::downgrade(&gs) as _;
        rt.subscribe(c, l);
        // Unrelated types don't matter.
        rt.setattr_str(d, "y", Some(c)).unwrap();
        assert!(gs.is_valid());
        rt.setattr_str(c, "y", Some(d)).unwrap();
        assert!(!gs.is_valid());
        rt.decref(c);
        rt.decref(d);
    }
}
