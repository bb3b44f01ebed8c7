use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BackendError, BackendResult};

pub trait IdType: Sized + From<u64> + Into<u64> {}

macro_rules! define_id_type {
    ($name:ident) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl IdType for $name {}

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id_type!(ExecutorId);

/// Hands out strictly increasing ids without locking.
/// Ids start at one and are never reused within the process lifetime.
#[derive(Debug)]
pub struct AtomicIdGenerator<T: IdType> {
    next_value: AtomicU64,
    phantom: PhantomData<T>,
}

impl<T: IdType> AtomicIdGenerator<T> {
    pub fn new() -> Self {
        Self {
            next_value: AtomicU64::new(1),
            phantom: PhantomData,
        }
    }

    pub fn next(&self) -> BackendResult<T> {
        let value = self.next_value.fetch_add(1, Ordering::SeqCst);
        if value == u64::MAX {
            return Err(BackendError::InternalError("ID overflow".to_string()));
        }
        Ok(value.into())
    }
}

impl<T: IdType> Default for AtomicIdGenerator<T> {
    fn default() -> Self {
        Self::new()
    }
}
