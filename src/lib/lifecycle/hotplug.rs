use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::capture::CaptureBackend;

#[derive(Debug)]
pub enum HotplugEvent {
    /// A new backend showed up and wants a slot.
    Attached(CaptureBackend),
    /// The backend feeding `slot` went away. Events carrying an older
    /// generation than the slot's current one are stale and ignored.
    Detached { slot: usize, generation: u64 },
}

/// Notifications from detection threads and producers, applied by the
/// scheduler at the top of the next tick. Guarded by its own lock, never
/// taken together with a source queue lock.
#[derive(Debug, Clone, Default)]
pub struct HotplugQueue {
    events: Arc<Mutex<VecDeque<HotplugEvent>>>,
}

impl HotplugQueue {
    pub fn push(&self, event: HotplugEvent) {
        self.events.lock().push_back(event);
    }

    pub fn drain(&self) -> Vec<HotplugEvent> {
        self.events.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_come_out_in_order() {
        let queue = HotplugQueue::default();
        let producer_side = queue.clone();
        producer_side.push(HotplugEvent::Detached {
            slot: 1,
            generation: 4,
        });
        producer_side.push(HotplugEvent::Detached {
            slot: 2,
            generation: 7,
        });
        assert_eq!(queue.len(), 2);

        let slots: Vec<_> = queue
            .drain()
            .into_iter()
            .map(|event| match event {
                HotplugEvent::Detached { slot, .. } => slot,
                HotplugEvent::Attached(_) => unreachable!(),
            })
            .collect();
        assert_eq!(slots, vec![1, 2]);
        assert!(queue.is_empty());
    }
}
