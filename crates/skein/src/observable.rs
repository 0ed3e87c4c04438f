//! The reactive value cell.
//!
//! An [`Observable`] holds one [`Value`] and an ordered subscriber list.
//! Mutation goes through [`set`](Observable::set) alone, which notifies
//! every subscriber synchronously, in registration order, on the caller's
//! stack — updates are exactly ordered with the mutation causing them.
//! There is no automatic unsubscription and no scheduler.
//!
//! The engine is single-threaded by design (one call stack, no concurrent
//! writers), so observables are `Rc`-shared and carry no `Send`/`Sync`
//! bounds.
//!
//! # Example
//!
//! ```rust
//! use skein::{Observable, Value};
//!
//! let count = Observable::new(0);
//! let sub = count.subscribe(|old, new| {
//!     assert_eq!(old.render(), "0");
//!     assert_eq!(new.render(), "5");
//! });
//! count.set(5);
//! count.unsubscribe(sub);
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::value::Value;

/// Handle returned by [`Observable::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ListenerFn = Rc<RefCell<dyn FnMut(&Value, &Value)>>;

struct Listener {
    id: SubscriptionId,
    f: ListenerFn,
}

/// A reactive value cell with a listener registry.
pub struct Observable {
    value: RefCell<Value>,
    listeners: RefCell<Vec<Listener>>,
    next_id: Cell<u64>,
}

impl Observable {
    /// Creates a cell holding `initial`.
    pub fn new(initial: impl Into<Value>) -> Rc<Self> {
        Rc::new(Self {
            value: RefCell::new(initial.into()),
            listeners: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        })
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> Value {
        self.value.borrow().clone()
    }

    /// Stores `value` and notifies subscribers with `(old, new)`.
    ///
    /// Subscribers run only when the new value differs from the prior one
    /// under [`Value::shallow_eq`] — scalars by content, containers always
    /// count as changed. Delivery is synchronous and in registration
    /// order. The list is snapshotted before delivery, so a listener that
    /// subscribes or unsubscribes mid-delivery never mutates the in-flight
    /// iteration: newly-added listeners miss the current round, and a
    /// listener removed by an earlier one in the same round is skipped.
    pub fn set(&self, value: impl Into<Value>) {
        let new = value.into();
        let old = {
            let mut slot = self.value.borrow_mut();
            if slot.shallow_eq(&new) {
                return;
            }
            std::mem::replace(&mut *slot, new.clone())
        };

        let snapshot: Vec<(SubscriptionId, ListenerFn)> = self
            .listeners
            .borrow()
            .iter()
            .map(|l| (l.id, l.f.clone()))
            .collect();

        for (id, f) in snapshot {
            let still_subscribed = self.listeners.borrow().iter().any(|l| l.id == id);
            if !still_subscribed {
                continue;
            }
            match f.try_borrow_mut() {
                Ok(mut f) => f(&old, &new),
                Err(_) => {
                    // The listener is already running further up this
                    // stack; skipping it keeps delivery non-reentrant.
                    tracing::warn!(subscription = id.0, "skipped reentrant listener");
                }
            }
        }
    }

    /// Registers a listener; returns the handle for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, f: impl FnMut(&Value, &Value) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push(Listener {
            id,
            f: Rc::new(RefCell::new(f)),
        });
        id
    }

    /// Removes a listener. Unknown handles are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.borrow_mut().retain(|l| l.id != id);
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }
}

impl std::fmt::Debug for Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.value.borrow())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
