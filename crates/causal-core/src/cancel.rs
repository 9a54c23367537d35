//! Cooperative cancellation.
//!
//! Every store operation takes a [`Cancel`]. It is checked before each put,
//! between items of a batch and at every row of a range scan. A put that has
//! started writing its index batch is never interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::StoreError;

/// Cloneable cancellation flag shared between a caller and an operation.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
}

impl Cancel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every holder of this flag.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Cancelled`] once [`Cancel::cancel`] was called.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Cancel;

    #[test]
    fn clones_share_the_flag() {
        let cancel = Cancel::new();
        let other = cancel.clone();
        assert!(cancel.check().is_ok());
        other.cancel();
        assert!(cancel.is_cancelled());
        assert!(cancel.check().is_err());
    }
}
