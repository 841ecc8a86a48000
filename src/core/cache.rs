//! Most recent pushed payload per characteristic.

use std::collections::HashMap;

use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ValueCache {
    values: HashMap<Uuid, Vec<u8>>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a callback payload. `None` clears the entry.
    pub fn store(&mut self, characteristic: Uuid, payload: Option<Vec<u8>>) {
        match payload {
            Some(data) => {
                self.values.insert(characteristic, data);
            }
            None => {
                self.values.remove(&characteristic);
            }
        }
    }

    pub fn get(&self, characteristic: Uuid) -> Option<&[u8]> {
        self.values.get(&characteristic).map(Vec::as_slice)
    }

    /// Removes and returns the entry; used when an operation claims it.
    pub fn take(&mut self, characteristic: Uuid) -> Option<Vec<u8>> {
        self.values.remove(&characteristic)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
