use crate::Value;

/// Receives every edge of an object graph walk.
pub trait Visitor {
    fn visit(&mut self, value: Value);
}

impl<F: FnMut(Value)> Visitor for F {
    #[inline]
    fn visit(&mut self, value: Value) {
        self(value)
    }
}

// Idea:
// visiting an object means we visit only its direct edges.
// the collector keeps its own worklist and calls back in for every newly
// marked object, so implementations never recurse.
pub trait Visitable {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        let _ = visitor;
    }
}

/// Anything that anchors values for the collector: a Vm stack, a scoped
/// [`crate::Rooted`] list, the global table.
///
/// Only called while every mutator is stopped, so providers may lock their
/// own state without contending with their owner.
pub trait RootProvider: Send + Sync {
    fn visit_roots(&self, visitor: &mut dyn Visitor);
}

impl Visitable for Value {
    #[inline]
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit(*self);
    }
}

impl<T: Visitable> Visitable for [T] {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.iter().for_each(|item| item.visit_edges(visitor));
    }
}

impl<T: Visitable> Visitable for Option<T> {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        if let Some(item) = self {
            item.visit_edges(visitor);
        }
    }
}
