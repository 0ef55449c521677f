//! Event storage behind the store's lock: flat map, grid, overflow, dedup.
//!
//! Every stored event lives in `events`. Events with a range up to the
//! large-range threshold are also indexed in exactly one grid cell (the one
//! containing their position); wider events are indexed in a per-world
//! overflow set instead.

use std::collections::{HashMap, HashSet};

use stimulus_types::{CellKey, EventId, IntVec3, StimulusEvent, WorldId};

use super::dedup::{DedupKey, DedupWindow};

/// Identity of a stored event: same world, block, and event id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// World of the event.
    pub world_id: WorldId,
    /// Source block.
    pub position: IntVec3,
    /// Event id.
    pub event_id: EventId,
}

impl EventKey {
    /// Key of `event`.
    pub fn of(event: &StimulusEvent) -> Self {
        Self {
            world_id: event.world_id.clone(),
            position: event.position,
            event_id: event.event_id.clone(),
        }
    }
}

/// Where an event is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Cell(CellKey),
    Overflow,
}

/// Mutable store state guarded by the store's read-write lock.
#[derive(Debug, Default)]
pub(crate) struct StoreIndex {
    pub(crate) step: u64,
    events: HashMap<EventKey, StimulusEvent>,
    grid: HashMap<WorldId, HashMap<CellKey, HashSet<EventKey>>>,
    overflow: HashMap<WorldId, HashSet<EventKey>>,
    pub(crate) dedup: DedupWindow,
}

impl StoreIndex {
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn get(&self, key: &EventKey) -> Option<&StimulusEvent> {
        self.events.get(key)
    }

    pub(crate) fn events(&self) -> impl Iterator<Item = &StimulusEvent> {
        self.events.values()
    }

    /// Insert or overwrite `event`, keeping the spatial index consistent.
    pub(crate) fn put(&mut self, event: StimulusEvent, large_range_threshold: f64) {
        let key = EventKey::of(&event);
        self.unindex(&key);
        let slot = if event.range > large_range_threshold {
            Slot::Overflow
        } else {
            Slot::Cell(event.position.cell())
        };
        match slot {
            Slot::Overflow => {
                self.overflow
                    .entry(key.world_id.clone())
                    .or_default()
                    .insert(key.clone());
            }
            Slot::Cell(cell) => {
                self.grid
                    .entry(key.world_id.clone())
                    .or_default()
                    .entry(cell)
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.events.insert(key, event);
    }

    /// Remove an event from the flat map and whichever index holds it.
    pub(crate) fn remove(&mut self, key: &EventKey) -> Option<StimulusEvent> {
        self.unindex(key);
        self.events.remove(key)
    }

    /// The stored event with the lowest capacity score.
    pub(crate) fn worst(&self) -> Option<(&EventKey, &StimulusEvent)> {
        self.events
            .iter()
            .min_by(|a, b| a.1.capacity_score().total_cmp(&b.1.capacity_score()))
    }

    /// Decrement every countdown and drop events that reach zero.
    ///
    /// Returns the number of expired events.
    pub(crate) fn decay(&mut self) -> usize {
        let expired: Vec<EventKey> = self
            .events
            .iter_mut()
            .filter_map(|(key, event)| {
                event.ticks_remaining = event.ticks_remaining.saturating_sub(1);
                (event.ticks_remaining <= 0).then(|| key.clone())
            })
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Clones of the events in the 3×3×3 cells around `cell` plus every
    /// large-range event in `world`.
    pub(crate) fn neighborhood(&self, world: &WorldId, cell: CellKey) -> Vec<StimulusEvent> {
        let mut out = Vec::new();
        if let Some(cells) = self.grid.get(world) {
            for near in cell.neighborhood() {
                if let Some(keys) = cells.get(&near) {
                    out.extend(keys.iter().filter_map(|k| self.events.get(k)).cloned());
                }
            }
        }
        if let Some(keys) = self.overflow.get(world) {
            out.extend(keys.iter().filter_map(|k| self.events.get(k)).cloned());
        }
        out
    }

    /// Rebuild the grid and overflow indexes under a new threshold.
    pub(crate) fn reindex(&mut self, large_range_threshold: f64) {
        let events: Vec<StimulusEvent> = self.events.drain().map(|(_, e)| e).collect();
        self.grid.clear();
        self.overflow.clear();
        for event in events {
            self.put(event, large_range_threshold);
        }
    }

    pub(crate) fn dedup_key(event: &StimulusEvent) -> DedupKey {
        DedupKey {
            world_id: event.world_id.clone(),
            type_id: event.type_id.clone(),
            position: event.position,
        }
    }

    /// Number of events indexed in grid cells and in overflow sets.
    #[cfg(test)]
    pub(crate) fn index_sizes(&self) -> (usize, usize) {
        let grid = self
            .grid
            .values()
            .flat_map(HashMap::values)
            .map(HashSet::len)
            .sum();
        let overflow = self.overflow.values().map(HashSet::len).sum();
        (grid, overflow)
    }

    fn unindex(&mut self, key: &EventKey) {
        let Some(existing) = self.events.get(key) else {
            return;
        };
        let cell = existing.position.cell();
        if let Some(cells) = self.grid.get_mut(&key.world_id) {
            if let Some(keys) = cells.get_mut(&cell) {
                keys.remove(key);
                if keys.is_empty() {
                    cells.remove(&cell);
                }
            }
            if cells.is_empty() {
                self.grid.remove(&key.world_id);
            }
        }
        if let Some(keys) = self.overflow.get_mut(&key.world_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.overflow.remove(&key.world_id);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stimulus_types::EventTypeId;

    fn event(x: i32, range: f64, weight: f64, life: i32) -> StimulusEvent {
        StimulusEvent {
            event_id: EventId::parse("e").unwrap(),
            type_id: EventTypeId::parse("t").unwrap(),
            position: IntVec3::new(x, 0, 0),
            world_id: WorldId::parse("w").unwrap(),
            range,
            weight,
            ticks_remaining: life,
            lifetime: life,
            occurred_at_step: 0,
            is_virtual: false,
            source_agent_id: None,
        }
    }

    #[test]
    fn large_events_go_to_overflow() {
        let mut index = StoreIndex::default();
        index.put(event(0, 8.0, 1.0, 5), 16.0);
        index.put(event(1, 40.0, 1.0, 5), 16.0);
        assert_eq!(index.index_sizes(), (1, 1));
    }

    #[test]
    fn overwrite_moves_between_indexes() {
        let mut index = StoreIndex::default();
        index.put(event(0, 8.0, 1.0, 5), 16.0);
        index.put(event(0, 40.0, 2.0, 5), 16.0);
        assert_eq!(index.len(), 1);
        assert_eq!(index.index_sizes(), (0, 1));
    }

    #[test]
    fn decay_removes_from_every_index() {
        let mut index = StoreIndex::default();
        index.put(event(0, 8.0, 1.0, 1), 16.0);
        index.put(event(1, 40.0, 1.0, 2), 16.0);

        assert_eq!(index.decay(), 1);
        assert_eq!(index.index_sizes(), (0, 1));
        assert_eq!(index.decay(), 1);
        assert_eq!(index.len(), 0);
        assert_eq!(index.index_sizes(), (0, 0));
    }

    #[test]
    fn neighborhood_spans_adjacent_cells_only() {
        let mut index = StoreIndex::default();
        index.put(event(20, 8.0, 1.0, 5), 16.0); // cell 1
        index.put(event(40, 8.0, 1.0, 5), 16.0); // cell 2
        index.put(event(500, 100.0, 1.0, 5), 16.0); // overflow
        let world = WorldId::parse("w").unwrap();

        let near = index.neighborhood(&world, IntVec3::new(0, 0, 0).cell());
        let xs: HashSet<i32> = near.iter().map(|e| e.position.x).collect();
        assert_eq!(xs, HashSet::from([20, 500]));
    }

    #[test]
    fn reindex_follows_new_threshold() {
        let mut index = StoreIndex::default();
        index.put(event(0, 12.0, 1.0, 5), 16.0);
        assert_eq!(index.index_sizes(), (1, 0));
        index.reindex(8.0);
        assert_eq!(index.index_sizes(), (0, 1));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn worst_is_lowest_capacity_score() {
        let mut index = StoreIndex::default();
        index.put(event(0, 8.0, 2.0, 5), 16.0);
        index.put(event(1, 8.0, 1.0, 5), 16.0);
        index.put(event(2, 900.0, 1.0, 5), 16.0);
        let (key, _) = index.worst().unwrap();
        assert_eq!(key.position, IntVec3::new(1, 0, 0));
    }
}
