//! Tether is the lifecycle and event-dispatch core for building network
//! servers out of callbacks that survive concurrent teardown. A tracked
//! object ([`Ref<T>`]) can be weakly referenced, observed for deletion, and
//! destroyed from any thread; every callback registered with the dispatch
//! machinery — informer subscriptions, deferred tasks, pollable
//! registrations — carries a weak reference to its owning object and is
//! silently skipped once that owner is gone.
//!
//! # Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::{Cb, Informer, PollGroup, Ref};
//!
//! struct Session { name: &'static str }
//!
//! let session = Ref::new(Session { name: "s1" });
//!
//! // Liveness-gated pub/sub: the subscription dies with `session`.
//! let informer: Informer<Box<dyn Fn(u32) + Send + Sync>> = Informer::new();
//! informer.subscribe(Cb::new(
//!     Arc::new(Box::new(|n| println!("got {n}")) as Box<dyn Fn(u32) + Send + Sync>),
//!     session.as_obj(),
//! ));
//! informer.inform_all(|subscriber| subscriber(7));
//!
//! // One poll group per event thread.
//! let group = PollGroup::open().unwrap();
//! loop {
//!     group.poll(None).unwrap();
//! }
//! ```
//!
//! # Teardown protocol
//!
//! Dropping the last strong handle races any number of weak upgrades; the
//! loser is decided under the shadow mutex, so an upgrade either pins a
//! fully live object or fails. Once teardown commits, deletion
//! subscriptions fire with their peers pinned, mutual subscriptions cancel
//! their mirror halves, and the destructor itself is parked on a
//! thread-local queue whenever the dropping thread still holds a
//! [`StateMutex`].

mod cb;
mod deferred;
mod error;
mod informer;
mod object;
mod poll;
mod receiver;
mod state;
mod stream;
mod sync;
mod tcp;

pub use cb::Cb;
pub use deferred::{DeferredProcessor, DeferredTask};
pub use error::{Error, Result};
pub use informer::{Informer, SubscriptionKey};
pub use object::{DeletionKey, ObjRef, ObjWeak, Ref, WeakRef};
pub use poll::{PollEvents, PollFeedback, PollGroup, Pollable, PollableKey};
pub use receiver::{ConnectionReceiver, ProcessInput, ReceiverFrontend};
pub use state::{StateMutex, StateMutexGuard};
pub use stream::{
    AsyncInputStream, AsyncIoResult, AsyncOutputStream, InputFrontend, OutputFrontend,
};
pub use tcp::{AcceptResult, ServerFrontend, TcpConnection, TcpServer};


#[cfg(all(test, not(loom)))]
mod deferred_tests;
#[cfg(all(test, not(loom)))]
mod object_tests;
#[cfg(all(test, not(loom)))]
mod poll_tests;
