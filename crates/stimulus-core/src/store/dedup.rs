//! Two-step window rejecting repeated emissions of the same event.

use std::collections::HashSet;

use stimulus_types::{EventTypeId, IntVec3, WorldId};

/// Identity of an emission for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// World of the emission.
    pub world_id: WorldId,
    /// Event type.
    pub type_id: EventTypeId,
    /// Source block.
    pub position: IntVec3,
}

/// Keys seen during the current and the previous step.
#[derive(Debug, Default)]
pub struct DedupWindow {
    current: HashSet<DedupKey>,
    previous: HashSet<DedupKey>,
}

impl DedupWindow {
    /// Whether `key` was recorded in either step of the window.
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.current.contains(key) || self.previous.contains(key)
    }

    /// Record `key` for the current step.
    pub fn record(&mut self, key: DedupKey) {
        self.current.insert(key);
    }

    /// Advance one step: current becomes previous and a fresh current starts.
    pub fn rotate(&mut self) {
        std::mem::swap(&mut self.current, &mut self.previous);
        self.current.clear();
    }

    /// Number of keys in the window.
    pub fn len(&self) -> usize {
        self.current.len().saturating_add(self.previous.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(x: i32) -> DedupKey {
        DedupKey {
            world_id: WorldId::parse("w").unwrap(),
            type_id: EventTypeId::parse("t").unwrap(),
            position: IntVec3::new(x, 0, 0),
        }
    }

    #[test]
    fn key_survives_exactly_one_rotation() {
        let mut window = DedupWindow::default();
        window.record(key(1));
        assert!(window.contains(&key(1)));
        assert!(!window.contains(&key(2)));

        window.rotate();
        assert!(window.contains(&key(1)));

        window.rotate();
        assert!(!window.contains(&key(1)));
        assert_eq!(window.len(), 0);
    }
}
