//! Single-assignment values that any number of tasks can await.
//!
//! An [`AsyncValue`] starts empty, is settled exactly once by a producer and
//! is read-only afterwards. Every waiter, whether it started waiting before or
//! after the value was settled, observes the same value. Waiting never
//! re-runs the producer.

use tokio::sync::{Notify, OnceCell};

use crate::common::error::AlreadyResolved;

#[derive(Debug)]
pub struct AsyncValue<T> {
    cell: OnceCell<T>,
    notify: Notify,
}

impl<T> AsyncValue<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    /// A value that is already settled.
    pub fn settled(value: T) -> Self {
        Self {
            cell: OnceCell::new_with(Some(value)),
            notify: Notify::new(),
        }
    }

    /// Store the terminal value and release every waiter.
    pub fn settle(&self, value: T) -> Result<(), AlreadyResolved> {
        self.cell.set(value).map_err(|_| AlreadyResolved)?;
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.initialized()
    }

    /// The value, if it has been settled.
    pub fn peek(&self) -> Option<&T> {
        self.cell.get()
    }

    /// Suspend until the value is settled.
    pub async fn wait(&self) -> &T {
        loop {
            // Register before checking so a settle in between is not missed.
            let notified = self.notify.notified();
            if let Some(value) = self.cell.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: Clone> AsyncValue<T> {
    pub async fn get(&self) -> T {
        self.wait().await.clone()
    }
}

impl<T, E> AsyncValue<Result<T, E>> {
    pub fn resolve(&self, value: T) -> Result<(), AlreadyResolved> {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: E) -> Result<(), AlreadyResolved> {
        self.settle(Err(error))
    }
}

impl<T> Default for AsyncValue<T> {
    fn default() -> Self {
        Self::new()
    }
}
