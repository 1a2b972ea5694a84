//! The type registry: a publish/subscribe relation between type objects and the compiled code
//! whose speculative fast paths depend on them.

use super::ObjId;
use std::{collections::HashMap, rc::Weak};

/// Something that must be told when a type it depends on is modified or destroyed.
pub trait InvalidationListener {
    fn invalidate(&self, ty: ObjId);
}

#[derive(Default)]
pub struct TypeRegistry {
    subs: HashMap<ObjId, Vec<Weak<dyn InvalidationListener>>>,
}

impl TypeRegistry {
    pub(crate) fn subscribe(&mut self, ty: ObjId, listener: Weak<dyn InvalidationListener>) {
        let subs = self.subs.entry(ty).or_default();
        // Drop listeners whose owner has gone away.
        subs.retain(|l| l.strong_count() > 0);
        subs.push(listener);
    }

    /// Notify, and forget, every subscriber of `ty`. A listener is told at most once per
    /// subscription.
    pub(crate) fn notify(&mut self, ty: ObjId) {
        if let Some(subs) = self.subs.remove(&ty) {
            for l in subs.iter().filter_map(|l| l.upgrade()) {
                l.invalidate(ty);
            }
        }
    }

    pub(crate) fn subscribed_types(&self) -> Vec<ObjId> {
        self.subs.keys().copied().collect()
    }

    /// How many live subscribers does `ty` have?
    pub fn subscriber_count(&self, ty: ObjId) -> usize {
        self.subs
            .get(&ty)
            .map(|subs| subs.iter().filter(|l| l.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::Runtime;
    use std::{cell::Cell, rc::Rc};

    struct Flag(Cell<u32>);

    impl InvalidationListener for Flag {
        fn invalidate(&self, _: ObjId) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn modification_notifies_once() {
        let mut rt = Runtime::new();
        let c = rt.new_class("C", None, &[], true);
        let flag = Rc::new(Flag(Cell::new(0)));
        let l: Rc<dyn InvalidationListener> = flag.clone();
        rt.subscribe(c, Rc::downgrade(&l));
        assert_eq!(rt.registry.subscriber_count(c), 1);
        let one = rt.new_int(1);
        let name = rt.new_str("x");
        rt.setattr(c, name, one).unwrap();
        assert_eq!(flag.0.get(), 1);
        rt.setattr(c, name, one).unwrap();
        assert_eq!(flag.0.get(), 1);
        assert_eq!(rt.registry.subscriber_count(c), 0);
        rt.decref(one);
        rt.decref(name);
    }

    #[test]
    fn base_modification_notifies_subtypes() {
        let mut rt = Runtime::new();
        let base = rt.new_class("Base", None, &[], true);
        let sub = rt.new_class("Sub", Some(base), &[], true);
        let flag = Rc::new(Flag(Cell::new(0)));
        let l: Rc<dyn InvalidationListener> = flag.clone();
        rt.subscribe(sub, Rc::downgrade(&l));
        let name = rt.new_str("y");
        let v = rt.new_int(2);
        rt.setattr(base, name, v).unwrap();
        assert_eq!(flag.0.get(), 1);
        rt.decref(v);
        rt.decref(name);
    }

    #[test]
    fn destruction_notifies() {
        let mut rt = Runtime::new();
        let c = rt.new_class("Gone", None, &[], true);
        let flag = Rc::new(Flag(Cell::new(0)));
        let l: Rc<dyn InvalidationListener> = flag.clone();
        rt.subscribe(c, Rc::downgrade(&l));
        rt.decref(c);
        assert_eq!(flag.0.get(), 1);
    }

    #[test]
    fn dead_listeners_are_ignored() {
        let mut rt = Runtime::new();
        let c = rt.new_class("C", None, &[], true);
        {
            let flag = Rc::new(Flag(Cell::new(0)));
            let l: Rc<dyn InvalidationListener> = flag;
            rt.subscribe(c, Rc::downgrade(&l));
        }
        assert_eq!(rt.registry.subscriber_count(c), 0);
        rt.decref(c);
    }
}
