//! Fixed-size pool of worker slots.
//!
//! The number of slots bounds how many tasks run at once. The pool is plain
//! data: it is only ever touched inside the scheduler's critical section,
//! which is what makes claim/release race-free.

use tracing::debug;

use crate::task::TaskId;

#[derive(Debug)]
pub struct WorkerSlots {
    slots: Vec<Option<TaskId>>,
}

impl WorkerSlots {
    /// Create `capacity` empty slots. Zero is rejected by the scheduler
    /// before this is called, but is clamped to one here as well.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    /// Put `task` in the lowest free slot.
    pub fn claim_free(&mut self, task: TaskId) -> Option<usize> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(task);
        debug!(slot = index, %task, "Worker slot claimed");
        Some(index)
    }

    /// Free `slot`, returning the task that held it.
    pub fn release(&mut self, slot: usize) -> Option<TaskId> {
        let task = self.slots.get_mut(slot)?.take();
        if let Some(task) = task {
            debug!(slot, %task, "Worker slot released");
        }
        task
    }

    pub fn holder(&self, slot: usize) -> Option<TaskId> {
        self.slots.get(slot).copied().flatten()
    }

    pub fn has_free(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn claims_up_to_capacity() {
        let mut slots = WorkerSlots::new(2);
        assert_eq!(slots.capacity(), 2);
        assert_eq!(slots.claim_free(TaskId::new()), Some(0));
        assert_eq!(slots.claim_free(TaskId::new()), Some(1));
        assert_eq!(slots.claim_free(TaskId::new()), None);
        assert_eq!(slots.occupied(), 2);
        assert!(!slots.has_free());
    }

    #[test]
    fn release_frees_and_reuses_lowest_slot() {
        let mut slots = WorkerSlots::new(3);
        let a = TaskId::new();
        let b = TaskId::new();
        slots.claim_free(a).unwrap();
        slots.claim_free(b).unwrap();

        assert_eq!(slots.release(0), Some(a));
        assert_eq!(slots.release(0), None);
        assert_eq!(slots.holder(1), Some(b));

        let c = TaskId::new();
        assert_eq!(slots.claim_free(c), Some(0));
    }

    #[test]
    fn out_of_range_is_harmless() {
        let mut slots = WorkerSlots::new(1);
        assert_eq!(slots.release(5), None);
        assert_eq!(slots.holder(5), None);
    }

    #[test]
    fn zero_capacity_clamped() {
        assert_eq!(WorkerSlots::new(0).capacity(), 1);
    }
}
