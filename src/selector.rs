//! Weighted instance selection
//!
//! Derives a weighted, rotating sequence of valid instances from a service
//! record and returns the next one per call. Weighting is approximated by
//! repetition: each valid instance with positive weight appears
//! `ceil(weight)` times in the expanded sequence, which a uniform rotation
//! then walks.
//!
//! The rotation cursor is kept per service name and persists across calls.
//! A fresh cursor is seeded with a uniformly random index rather than zero,
//! so many independent selector instances do not all hammer the first
//! instance.

use dashmap::DashMap;
use rand::Rng;

use crate::error::{RegistryError, RegistryResult};
use crate::record::{Instance, ServiceRecord};

/// Rotating weighted selector over service records
#[derive(Debug, Default)]
pub struct InstanceSelector {
    cursors: DashMap<String, usize>,
}

impl InstanceSelector {
    /// Create a selector with no cursors
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    /// Expand a record into its weighted repetition sequence
    ///
    /// Each instance with `valid` and `weight > 0` is repeated
    /// `ceil(weight)` times: weight 2.0 yields two copies, weight 0.4
    /// yields one.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoUsableInstances`] if the expansion is
    /// empty. A record with no usable instances is a caller error; the
    /// front end should have checked registration status first.
    pub fn expand(record: &ServiceRecord) -> RegistryResult<Vec<Instance>> {
        let mut expanded = Vec::new();

        for instance in &record.instances {
            if !instance.valid || instance.weight <= 0.0 {
                continue;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let copies = instance.weight.ceil() as usize;
            for _ in 0..copies {
                expanded.push(instance.clone());
            }
        }

        if expanded.is_empty() {
            return Err(RegistryError::NoUsableInstances {
                service: record.name.clone(),
            });
        }

        Ok(expanded)
    }

    /// Select the next instance for `service` from `record`
    ///
    /// Advances the per-service rotation cursor by one, wrapping modulo the
    /// expanded length; an absent cursor is seeded at a random offset.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoUsableInstances`] if the record expands
    /// to nothing.
    pub fn select_next(&self, service: &str, record: &ServiceRecord) -> RegistryResult<Instance> {
        let expanded = Self::expand(record)?;

        let mut cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| rand::thread_rng().gen_range(0..expanded.len()));

        let index = *cursor % expanded.len();
        *cursor = (index + 1) % expanded.len();

        Ok(expanded[index].clone())
    }
}
