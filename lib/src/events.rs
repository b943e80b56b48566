// Copyright 2025 The Antler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Event dispatch without ownership cycles.
//!
//! Queries, repositories and the database facade observe each other, which
//! in the naive design forms reference cycles. Here every subscription is a
//! token owned by the subscriber; the emitter only holds weak handler
//! references and prunes dead ones during dispatch, so dropping the token
//! is unsubscription.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

type Handler<E> = dyn Fn(&E) + Send + Sync;

/// A handle keeping one subscription alive. Dropping it detaches the
/// handler.
#[must_use = "dropping a Subscription detaches its handler"]
pub struct Subscription {
    _handler: Box<dyn Any + Send + Sync>,
}

/// Dispatches events of type `E` to currently-subscribed handlers.
pub struct EventEmitter<E> {
    handlers: Mutex<Vec<Weak<Handler<E>>>>,
}

impl<E: 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(vec![]),
        }
    }

    /// Attaches `handler` and returns its subscription token.
    pub fn attach(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let handler: Arc<Handler<E>> = Arc::new(handler);
        self.handlers.lock().unwrap().push(Arc::downgrade(&handler));
        Subscription {
            _handler: Box::new(handler),
        }
    }

    /// Calls every live handler with `event`, pruning dropped ones.
    pub fn emit(&self, event: &E) {
        let live: Vec<Arc<Handler<E>>> = {
            let mut handlers = self.handlers.lock().unwrap();
            handlers.retain(|weak| weak.strong_count() > 0);
            handlers.iter().filter_map(Weak::upgrade).collect()
        };
        // Dispatch outside the lock so handlers may attach or emit.
        for handler in live {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.retain(|weak| weak.strong_count() > 0);
        handlers.len()
    }
}

impl<E: 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn test_emit_reaches_live_handlers() {
        let emitter = EventEmitter::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let seen = seen.clone();
            emitter.attach(move |event| {
                seen.fetch_add(*event as usize, Ordering::SeqCst);
            })
        };
        emitter.emit(&2);
        emitter.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_dropping_subscription_detaches() {
        let emitter = EventEmitter::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = {
            let seen = seen.clone();
            emitter.attach(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };
        emitter.emit(&0);
        drop(sub);
        emitter.emit(&0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.handler_count(), 0);
    }

    #[test]
    fn test_handler_may_reattach_during_dispatch() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let held: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(vec![]));
        let sub = {
            let emitter = emitter.clone();
            let held = held.clone();
            emitter.clone().attach(move |_| {
                let nested = emitter.attach(|_| {});
                held.lock().unwrap().push(nested);
            })
        };
        emitter.emit(&0);
        assert_eq!(emitter.handler_count(), 2);
        drop(sub);
    }
}
