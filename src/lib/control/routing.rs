use std::collections::BTreeMap;

use serde::Serialize;

/// Which capture slot each logical signal of the mix shows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoutingTable {
    routes: BTreeMap<usize, usize>,
}

impl RoutingTable {
    pub fn set(&mut self, signal: usize, slot: usize) -> Option<usize> {
        self.routes.insert(signal, slot)
    }

    pub fn remove(&mut self, signal: usize) -> Option<usize> {
        self.routes.remove(&signal)
    }

    pub fn slot_for(&self, signal: usize) -> Option<usize> {
        self.routes.get(&signal).copied()
    }

    pub fn signals_for(&self, slot: usize) -> Vec<usize> {
        self.routes
            .iter()
            .filter(|(_, routed)| **routed == slot)
            .map(|(signal, _)| *signal)
            .collect()
    }

    /// Drops every route pointing at `slot`, returning the affected signals.
    pub fn clear_slot(&mut self, slot: usize) -> Vec<usize> {
        let signals = self.signals_for(slot);
        for signal in &signals {
            self.routes.remove(signal);
        }
        signals
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearing_a_slot_keeps_other_routes() {
        let mut routing = RoutingTable::default();
        routing.set(0, 2);
        routing.set(1, 3);
        routing.set(4, 2);

        assert_eq!(routing.clear_slot(2), vec![0, 4]);
        assert_eq!(routing.slot_for(0), None);
        assert_eq!(routing.slot_for(1), Some(3));
        assert_eq!(routing.len(), 1);
        assert!(routing.clear_slot(2).is_empty());
    }

    #[test]
    fn rerouting_returns_the_previous_slot() {
        let mut routing = RoutingTable::default();
        assert_eq!(routing.set(0, 1), None);
        assert_eq!(routing.set(0, 5), Some(1));
        assert_eq!(routing.remove(0), Some(5));
        assert!(routing.is_empty());
    }
}
