//! Value: any runtime value, an immediate (nil/bool/int/float) or a reference
//!
//! Gc: copyable handle to a collector-managed cell. Not rooted by itself, the
//! holder is responsible for keeping it reachable (Vm stack, [`crate::Rooted`],
//! another reachable object).
use std::{
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

use bitflags::bitflags;

use crate::{Attribute, HeapObject, RuntimeError};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const MARK = 1 << 0;
        const IMMORTAL = 1 << 1;
    }
}

#[derive(Debug)]
pub struct Header(AtomicU8);

/// A heap cell: header followed by the object.
#[derive(Debug)]
pub struct GcBox {
    pub header: Header,
    pub object: HeapObject,
}

#[derive(Copy, Clone)]
pub struct Gc(NonNull<GcBox>);

// SAFETY: heap objects are Send + Sync, the handle is only a pointer to one
unsafe impl Send for Gc {}
// SAFETY: see above
unsafe impl Sync for Gc {}

#[derive(Debug, Copy, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Ref(Gc),
}

impl Header {
    pub fn new(flags: HeaderFlags) -> Self {
        Self(AtomicU8::new(flags.bits()))
    }

    #[inline]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags().contains(HeaderFlags::MARK)
    }

    #[inline]
    pub fn is_immortal(&self) -> bool {
        self.flags().contains(HeaderFlags::IMMORTAL)
    }

    /// Sets the mark bit, returns true if it was not set before.
    #[inline]
    pub fn mark(&self) -> bool {
        let prev = self.0.fetch_or(HeaderFlags::MARK.bits(), Ordering::AcqRel);
        prev & HeaderFlags::MARK.bits() == 0
    }

    #[inline]
    pub fn unmark(&self) {
        self.0.fetch_and(!HeaderFlags::MARK.bits(), Ordering::AcqRel);
    }
}

impl Gc {
    pub(crate) fn allocate(object: HeapObject, flags: HeaderFlags) -> Self {
        let cell = Box::new(GcBox {
            header: Header::new(flags),
            object,
        });
        Self(NonNull::from(Box::leak(cell)))
    }

    /// # Safety
    /// the cell must be unreachable and freed exactly once
    pub(crate) unsafe fn free(self) {
        // SAFETY: allocated through Box in `allocate`, by contract unreachable
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }

    #[inline]
    pub fn header(&self) -> &Header {
        // SAFETY: a live Gc points to a live cell
        unsafe { &self.0.as_ref().header }
    }

    #[inline]
    pub fn as_ptr(self) -> *const GcBox {
        self.0.as_ptr()
    }

    #[inline]
    pub fn ptr_eq(self, other: Gc) -> bool {
        self.0 == other.0
    }

    pub fn identity_hash(self) -> u64 {
        let mut hasher = ahash::AHasher::default();
        (self.as_ptr() as usize).hash(&mut hasher);
        hasher.finish()
    }
}

impl Deref for Gc {
    type Target = HeapObject;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: a live Gc points to a live cell
        unsafe { &self.0.as_ref().object }
    }
}

impl fmt::Debug for Gc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} at {:p}>", self.type_name(), self.as_ptr())
    }
}

impl PartialEq for Gc {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(*other)
    }
}

impl Eq for Gc {}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "Nil",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Ref(gc) => gc.type_name(),
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn as_gc(&self) -> Option<Gc> {
        match self {
            Value::Ref(gc) => Some(*gc),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Marks the referenced cell, immediates are never marked.
    /// Returns true if the object was newly marked.
    pub fn mark(&self) -> bool {
        match self {
            Value::Ref(gc) => gc.header().mark(),
            _ => false,
        }
    }

    pub fn unmark(&self) {
        if let Value::Ref(gc) = self {
            gc.header().unmark();
        }
    }

    pub fn is_marked(&self) -> bool {
        match self {
            Value::Ref(gc) => gc.header().is_marked(),
            _ => false,
        }
    }

    pub fn get_attribute(&self, name: &str) -> Option<Attribute> {
        match self {
            Value::Ref(gc) => gc.as_object().get_attribute(*gc, name),
            _ => None,
        }
    }

    pub fn set_attribute(
        &self,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match self {
            Value::Ref(gc) => gc.as_object().set_attribute(*gc, name, value),
            _ => Err(RuntimeError::attribute(self.type_name(), name)),
        }
    }

    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b))
            | (Value::Float(b), Value::Int(a)) => exact_int(*b) == Some(*a),
            (Value::Ref(gc), other) => gc.as_object().equal(*gc, other),
            _ => false,
        }
    }

    pub fn hash_code(&self) -> u64 {
        let mut hasher = ahash::AHasher::default();
        match self {
            Value::Nil => 0u8.hash(&mut hasher),
            Value::Bool(value) => value.hash(&mut hasher),
            Value::Int(value) => value.hash(&mut hasher),
            // floats equal to an Int hash like it
            Value::Float(value) => match exact_int(*value) {
                Some(int) => int.hash(&mut hasher),
                None => value.to_bits().hash(&mut hasher),
            },
            Value::Ref(gc) => return gc.as_object().hash(*gc),
        }
        hasher.finish()
    }
}

/// The Int `value` represents exactly, if any.
fn exact_int(value: f64) -> Option<i64> {
    // i64::MIN is exact, 2^63 is the first float past i64::MAX
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (value.fract() == 0.0 && (-LIMIT..LIMIT).contains(&value))
        .then_some(value as i64)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl From<Gc> for Value {
    fn from(value: Gc) -> Self {
        Value::Ref(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value:?}"),
            Value::Ref(gc) => f.write_str(&gc.as_object().str(*gc)),
        }
    }
}
