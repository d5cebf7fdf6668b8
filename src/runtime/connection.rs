//! Fixed-size table of connection slots.
//!
//! Each accepted connection occupies one slot for its whole lifetime. The slot
//! index is stable and serves as the connection's identifier in diagnostics.
//! Slot storage is never deallocated; releasing a slot only clears its handle
//! so the entry can be reused by a later connection.

use crate::runtime::ConnId;
use std::collections::HashMap;

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Event-source time of the most recent read event.
    pub last_recv_time: u64,
    /// Payload bytes delivered to the output sink.
    pub bytes: u64,
    /// Non-empty buffers delivered to the output sink.
    pub buffers: u64,
}

/// One entry of the slot table.
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    connection: Option<ConnId>,
    pub stats: SlotStats,
    /// Buffers currently on loan to the connection.
    pub outstanding: usize,
}

impl ConnectionSlot {
    pub fn connection(&self) -> Option<ConnId> {
        self.connection
    }

    pub fn is_occupied(&self) -> bool {
        self.connection.is_some()
    }
}

/// Returned by [`SlotTable::allocate`] when every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolFull;

/// Bounded arena of connection slots with a handle → slot index.
pub struct SlotTable {
    slots: Vec<ConnectionSlot>,
    index: HashMap<ConnId, usize>,
}

impl SlotTable {
    /// Create a table with `max_connections` slots.
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: (0..max_connections).map(|_| ConnectionSlot::default()).collect(),
            index: HashMap::with_capacity(max_connections),
        }
    }

    /// Place `conn` in the first unoccupied slot.
    pub fn allocate(&mut self, conn: ConnId) -> Result<usize, PoolFull> {
        let idx = self
            .slots
            .iter()
            .position(|slot| !slot.is_occupied())
            .ok_or(PoolFull)?;

        self.slots[idx] = ConnectionSlot {
            connection: Some(conn),
            ..ConnectionSlot::default()
        };
        self.index.insert(conn, idx);
        Ok(idx)
    }

    /// Clear a slot, returning its final counters.
    pub fn release(&mut self, idx: usize) -> Option<SlotStats> {
        let slot = self.slots.get_mut(idx)?;
        let conn = slot.connection.take()?;
        self.index.remove(&conn);
        Some(slot.stats)
    }

    /// Clear the slot held by `conn`, returning its index and final counters.
    pub fn release_conn(&mut self, conn: ConnId) -> Option<(usize, SlotStats)> {
        let idx = self.slot_of(conn)?;
        self.release(idx).map(|stats| (idx, stats))
    }

    /// Slot index held by `conn`.
    pub fn slot_of(&self, conn: ConnId) -> Option<usize> {
        self.index.get(&conn).copied()
    }

    /// An occupied slot.
    pub fn get(&self, idx: usize) -> Option<&ConnectionSlot> {
        self.slots.get(idx).filter(|slot| slot.is_occupied())
    }

    /// An occupied slot, mutably.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ConnectionSlot> {
        self.slots.get_mut(idx).filter(|slot| slot.is_occupied())
    }

    /// Iterate occupied slots with their indices.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &ConnectionSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_occupied())
    }

    pub fn occupied_count(&self) -> usize {
        self.index.len()
    }

    /// Number of slots (the connection cap).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_until_full() {
        let mut table = SlotTable::new(2);

        assert_eq!(table.allocate(ConnId(10)), Ok(0));
        assert_eq!(table.allocate(ConnId(11)), Ok(1));
        assert_eq!(table.allocate(ConnId(12)), Err(PoolFull));

        assert_eq!(table.occupied_count(), 2);
        assert_eq!(table.capacity(), 2);
        assert_eq!(table.slot_of(ConnId(11)), Some(1));
        assert_eq!(table.slot_of(ConnId(12)), None);
    }

    #[test]
    fn test_release_reuses_first_free_slot() {
        let mut table = SlotTable::new(3);
        for id in 0..3 {
            table.allocate(ConnId(id)).unwrap();
        }

        table.get_mut(1).unwrap().stats.bytes = 42;
        let stats = table.release_conn(ConnId(1)).unwrap();
        assert_eq!(stats, (1, SlotStats { bytes: 42, ..SlotStats::default() }));
        assert!(table.get(1).is_none());
        assert_eq!(table.occupied_count(), 2);

        // Lowest free index is handed out again, with fresh counters
        assert_eq!(table.allocate(ConnId(9)), Ok(1));
        assert_eq!(table.get(1).unwrap().stats, SlotStats::default());
        assert_eq!(table.get(1).unwrap().connection(), Some(ConnId(9)));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut table = SlotTable::new(1);
        table.allocate(ConnId(5)).unwrap();

        assert!(table.release(0).is_some());
        assert!(table.release(0).is_none());
        assert!(table.release(7).is_none());
        assert!(table.release_conn(ConnId(5)).is_none());
        assert_eq!(table.occupied_count(), 0);
    }

    #[test]
    fn test_occupied_iteration() {
        let mut table = SlotTable::new(4);
        table.allocate(ConnId(1)).unwrap();
        table.allocate(ConnId(2)).unwrap();
        table.allocate(ConnId(3)).unwrap();
        table.release_conn(ConnId(2));

        let occupied: Vec<_> = table
            .occupied()
            .map(|(idx, slot)| (idx, slot.connection().unwrap()))
            .collect();
        assert_eq!(occupied, vec![(0, ConnId(1)), (2, ConnId(3))]);
    }
}
