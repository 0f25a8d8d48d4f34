//! Liveness-guarded callback descriptors.
//!
//! Every callback handed to the dispatch machinery carries an optional weak
//! reference to the object that owns the receiving code. Delivery upgrades
//! the owner first, pins it for the duration of the call, and silently
//! skips owners that are already gone. This is the one pattern that makes
//! callback dispatch safe against concurrent teardown everywhere else in
//! the crate.

use crate::object::{ObjRef, ObjWeak};
use std::sync::Arc;

/// A shared callback payload plus the weak owner guarding its delivery.
///
/// `T` is whatever the subscriber registers: a struct of boxed closures
/// (a handler table), a bare `fn` pointer type, or a trait object.
pub struct Cb<T: ?Sized> {
    owner: Option<ObjWeak>,
    payload: Arc<T>,
}

impl<T: ?Sized> Cb<T> {
    /// Guarded descriptor. The owner is taken strong here, so a descriptor
    /// for a dead owner cannot be constructed.
    pub fn new(payload: Arc<T>, owner: &ObjRef) -> Self {
        Cb {
            owner: Some(owner.downgrade()),
            payload,
        }
    }

    /// Descriptor whose delivery is not gated on any object's liveness.
    pub fn unguarded(payload: Arc<T>) -> Self {
        Cb {
            owner: None,
            payload,
        }
    }

    /// Invokes `f` with the payload if the owner is still alive, holding a
    /// strong reference to it across the call.
    ///
    /// The pin is dropped before returning, so the call site must not hold
    /// any state mutex: releasing the pin can run the owner's teardown.
    pub fn call<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match &self.owner {
            Some(weak) => {
                let pin = weak.upgrade()?;
                let out = f(&self.payload);
                drop(pin);
                Some(out)
            }
            None => Some(f(&self.payload)),
        }
    }

    pub fn owner(&self) -> Option<&ObjWeak> {
        self.owner.as_ref()
    }

    pub fn payload(&self) -> &Arc<T> {
        &self.payload
    }
}

impl<T: ?Sized> Clone for Cb<T> {
    fn clone(&self) -> Self {
        Cb {
            owner: self.owner.clone(),
            payload: self.payload.clone(),
        }
    }
}
