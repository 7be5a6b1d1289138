pub mod json_store;

use std::sync::{Mutex, PoisonError};

use crate::common::Result;
use crate::core::descriptor::Descriptor;

pub use json_store::JsonFileStore;

/// Key under which the enrolled descriptor is kept.
pub const ENROLLMENT_KEY: &str = "face_descriptor";

/// Single-slot storage for the enrolled descriptor.
///
/// `put` overwrites; there is never more than one record and it is never
/// partially updated.
pub trait EnrollmentStore: Send + Sync {
    fn get(&self) -> Result<Option<Descriptor>>;

    fn put(&self, descriptor: &Descriptor) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn contains(&self) -> Result<bool> {
        Ok(self.get()?.is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: Mutex<Option<Descriptor>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptor(descriptor: Descriptor) -> Self {
        Self {
            slot: Mutex::new(Some(descriptor)),
        }
    }
}

impl EnrollmentStore for MemoryStore {
    fn get(&self) -> Result<Option<Descriptor>> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn put(&self, descriptor: &Descriptor) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(descriptor.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
