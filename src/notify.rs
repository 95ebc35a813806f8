//! Observer registry used by the cache coordinator, queue and connectivity oracle.

use std::sync::{Arc, Mutex, Weak};

/// A registered observer callback.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
  next_id: u64,
  callbacks: Vec<(u64, Callback<E>)>,
}

/// A set of callbacks notified with every emitted event.
pub struct Listeners<E> {
  registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Listeners<E> {
  pub fn new() -> Self {
    Self {
      registry: Arc::new(Mutex::new(Registry {
        next_id: 0,
        callbacks: Vec::new(),
      })),
    }
  }

  /// Register a callback. It stays attached until the returned handle is
  /// dropped or [`Subscription::unsubscribe`] is called.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    let id = {
      let mut registry = lock(&self.registry);
      let id = registry.next_id;
      registry.next_id += 1;
      registry.callbacks.push((id, Arc::new(callback)));
      id
    };

    let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
    Subscription {
      detach: Some(Box::new(move || {
        if let Some(registry) = weak.upgrade() {
          lock(&registry).callbacks.retain(|(cid, _)| *cid != id);
        }
      })),
    }
  }

  /// Deliver `event` to every registered callback.
  ///
  /// Callbacks run outside the registry lock, so they may subscribe or
  /// unsubscribe without deadlocking.
  pub fn emit(&self, event: &E) {
    let callbacks: Vec<Callback<E>> = lock(&self.registry)
      .callbacks
      .iter()
      .map(|(_, cb)| Arc::clone(cb))
      .collect();

    for callback in callbacks {
      callback(event);
    }
  }
}

impl<E: 'static> Default for Listeners<E> {
  fn default() -> Self {
    Self::new()
  }
}

// A panicking callback must not take the whole registry down with it.
fn lock<E>(registry: &Mutex<Registry<E>>) -> std::sync::MutexGuard<'_, Registry<E>> {
  registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by `subscribe`. Detaches the callback when dropped.
#[must_use = "dropping a Subscription immediately unsubscribes the callback"]
pub struct Subscription {
  detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  /// Detach the callback now.
  pub fn unsubscribe(mut self) {
    if let Some(detach) = self.detach.take() {
      detach();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(detach) = self.detach.take() {
      detach();
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("attached", &self.detach.is_some())
      .finish()
  }
}
