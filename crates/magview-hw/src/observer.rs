//! Ordered observer registry for "FFC reference ready" notifications.

use crate::frame::FfcReference;

/// Handle returned on subscription; pass to [`FfcObservers::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback = Box<dyn FnMut(&FfcReference) + Send>;

struct Entry {
    id: ObserverId,
    once: bool,
    callback: Callback,
}

/// Callbacks are invoked in registration order. One-shot entries are removed
/// right after their first invocation.
#[derive(Default)]
pub struct FfcObservers {
    next_id: u64,
    entries: Vec<Entry>,
}

impl FfcObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&FfcReference) + Send + 'static) -> ObserverId {
        self.push(false, Box::new(callback))
    }

    pub fn subscribe_once(
        &mut self,
        callback: impl FnOnce(&FfcReference) + Send + 'static,
    ) -> ObserverId {
        let mut callback = Some(callback);
        self.push(
            true,
            Box::new(move |reference| {
                if let Some(cb) = callback.take() {
                    cb(reference);
                }
            }),
        )
    }

    /// Returns false if the id was not registered (or already fired once).
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notify(&mut self, reference: &FfcReference) {
        for entry in self.entries.iter_mut() {
            (entry.callback)(reference);
        }
        self.entries.retain(|e| !e.once);
    }

    fn push(&mut self, once: bool, callback: Callback) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { id, once, callback });
        id
    }
}
