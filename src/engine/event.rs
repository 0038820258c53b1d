//! Minimal synchronous observer channel.
//!
//! Hosts subscribe closures; the engine dispatches change notifications
//! after the owning transaction has committed and after its internal lock
//! has been released, so handlers may call back into the engine.

use parking_lot::Mutex;

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

pub struct Event<T> {
    handlers: Mutex<Vec<Handler<T>>>,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.handlers.lock().push(Box::new(handler));
    }

    pub fn dispatch(&self, payload: &T) {
        for handler in self.handlers.lock().iter() {
            handler(payload);
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}
