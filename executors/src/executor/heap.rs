use std::collections::HashMap;

use alloy::primitives::Address;
use serde::Serialize;

/// A signer account and the number of live jobs currently attributed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSlot {
    pub address: Address,
    pub job_count: u64,
}

/// Min-heap of executors keyed by job count, with a side index so any
/// executor can be found in O(1) and re-sifted in O(log n).
#[derive(Debug, Default)]
pub struct ExecutorHeap {
    slots: Vec<ExecutorSlot>,
    indices: HashMap<Address, usize>,
}

impl ExecutorHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the executor is already registered.
    pub fn add(&mut self, address: Address) -> bool {
        if self.indices.contains_key(&address) {
            return false;
        }

        self.slots.push(ExecutorSlot {
            address,
            job_count: 0,
        });
        let index = self.slots.len() - 1;
        self.indices.insert(address, index);
        self.sift_up(index);
        true
    }

    pub fn increment(&mut self, address: &Address) -> bool {
        let Some(&index) = self.indices.get(address) else {
            return false;
        };

        self.slots[index].job_count += 1;
        self.sift_down(index);
        true
    }

    pub fn decrement(&mut self, address: &Address) -> bool {
        let Some(&index) = self.indices.get(address) else {
            return false;
        };

        let slot = &mut self.slots[index];
        if slot.job_count == 0 {
            tracing::warn!(
                executor = %address,
                "Decrement on an executor with no jobs, keeping count at zero"
            );
            return true;
        }

        slot.job_count -= 1;
        self.sift_up(index);
        true
    }

    /// The least loaded executor.
    pub fn peek(&self) -> Option<&ExecutorSlot> {
        self.slots.first()
    }

    pub fn get(&self, address: &Address) -> Option<&ExecutorSlot> {
        self.indices.get(address).map(|&index| &self.slots[index])
    }

    /// Removes an executor from the pool, returning its slot.
    pub fn remove(&mut self, address: &Address) -> Option<ExecutorSlot> {
        let index = self.indices.remove(address)?;
        let last = self.slots.len() - 1;

        if index == last {
            return self.slots.pop();
        }

        self.slots.swap(index, last);
        let removed = self.slots.pop();
        let moved = self.slots[index].address;
        self.indices.insert(moved, index);

        // The moved slot may violate the heap property in either direction
        self.sift_up(index);
        let index = self.indices[&moved];
        self.sift_down(index);

        removed
    }

    /// Snapshot of the slots in heap order.
    pub fn values(&self) -> Vec<ExecutorSlot> {
        self.slots.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.indices.insert(self.slots[a].address, b);
        self.indices.insert(self.slots[b].address, a);
        self.slots.swap(a, b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.slots[index].job_count < self.slots[parent].job_count {
                self.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut smallest = index;

            if left < self.slots.len()
                && self.slots[left].job_count < self.slots[smallest].job_count
            {
                smallest = left;
            }
            if right < self.slots.len()
                && self.slots[right].job_count < self.slots[smallest].job_count
            {
                smallest = right;
            }

            if smallest == index {
                break;
            }

            self.swap(index, smallest);
            index = smallest;
        }
    }
}
