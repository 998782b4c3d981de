use std::sync::Arc;

use crate::symbolic::{RegistryId, TensorId};
use crate::tensor::Tensor;
use crate::weak::WeakIdentityMap;

/// Hands out a stable small id per descriptor object.
///
/// Ids are per object, not per equivalence class: two descriptors that are
/// later merged keep their distinct ids. The counter only moves forward, so
/// an id is never handed out twice even after its descriptor is dropped.
/// Every id carries the owning registry, so ids from two registries never
/// compare equal.
pub struct TensorCounter {
    registry: RegistryId,
    next_id: u64,
    ids: WeakIdentityMap<Tensor, u64>,
}

impl TensorCounter {
    pub fn new(registry: RegistryId) -> Self {
        TensorCounter {
            registry,
            next_id: 0,
            ids: WeakIdentityMap::new(),
        }
    }

    pub fn get_id(&mut self, vec: &Arc<Tensor>) -> TensorId {
        let index = match self.ids.get(vec) {
            Some(index) => *index,
            None => {
                let index = self.next_id;
                self.next_id += 1;
                self.ids.insert(vec, index);
                index
            }
        };
        TensorId {
            registry: self.registry,
            index,
        }
    }

    /// Index previously assigned to `vec`, without assigning a new one.
    pub fn peek(&self, vec: &Arc<Tensor>) -> Option<u64> {
        self.ids.get(vec).copied()
    }

    pub fn contains(&self, vec: &Arc<Tensor>) -> bool {
        self.ids.contains(vec)
    }

    pub fn purge(&mut self) {
        self.ids.purge();
    }
}
