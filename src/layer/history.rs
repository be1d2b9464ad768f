use std::collections::VecDeque;

/// Per-step records a layer keeps between its forward calls and the
/// matching backward calls.
///
/// `forward` pushes, `backward` moves the most recent record into the active
/// slot where the following `gradient` call finds it. With a capacity the
/// oldest records are evicted, which truncates back propagation at the
/// window boundary.
#[derive(Debug, Clone)]
pub(crate) struct StepHistory<T> {
    steps: VecDeque<T>,
    capacity: Option<usize>,
    active: Option<T>,
}

impl<T> Default for StepHistory<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> StepHistory<T> {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            steps: VecDeque::new(),
            capacity,
            active: None,
        }
    }

    pub(crate) fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if a record fell out of the window.
    pub(crate) fn push(&mut self, step: T) -> bool {
        self.steps.push_back(step);
        match self.capacity {
            Some(capacity) if self.steps.len() > capacity => {
                self.steps.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Most recently pushed record.
    pub(crate) fn latest(&self) -> Option<&T> {
        self.steps.back()
    }

    /// Moves the most recent record into the active slot.
    /// Leaves the slot empty once the window is exhausted.
    pub(crate) fn activate_latest(&mut self) -> Option<&T> {
        self.active = self.steps.pop_back();
        self.active.as_ref()
    }

    pub(crate) fn active(&self) -> Option<&T> {
        self.active.as_ref()
    }

    pub(crate) fn clear(&mut self) {
        self.steps.clear();
        self.active = None;
    }
}
