use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::QueueError;
use crate::event::{Priority, QueuedEvent};

/// Number of queued events per priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }

    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

#[derive(Default)]
struct Lanes {
    lanes: [VecDeque<QueuedEvent>; 4],
    len: usize,
}

/// Four FIFO queues, one per priority, sharing a single capacity ceiling.
///
/// Once the sum of all queue lengths reaches the ceiling new events are refused with
/// `QueueError::QueueFull`. Producers are never blocked: the refused event is gone, and it is
/// up to the caller to count it as dropped.
pub struct PriorityQueueManager {
    capacity: usize,
    lanes: Mutex<Lanes>,
}

impl PriorityQueueManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lanes: Mutex::new(Lanes::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event to the queue matching its priority.
    pub fn enqueue(&self, event: QueuedEvent) -> Result<(), QueueError> {
        let mut lanes = self.lock();
        if lanes.len >= self.capacity {
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }

        lanes.lanes[event.priority().index()].push_back(event);
        lanes.len += 1;
        Ok(())
    }

    /// Remove up to `max` events, exhausting more urgent queues before less urgent ones.
    /// The events are returned in drain order.
    pub fn drain(&self, max: usize) -> Vec<QueuedEvent> {
        let mut lanes = self.lock();
        let mut drained = Vec::with_capacity(max.min(lanes.len));

        for priority in Priority::ALL {
            let wanted = max - drained.len();
            if wanted == 0 {
                break;
            }
            let lane = &mut lanes.lanes[priority.index()];
            let take = wanted.min(lane.len());
            drained.extend(lane.drain(..take));
        }

        lanes.len -= drained.len();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depths(&self) -> QueueDepths {
        let lanes = self.lock();
        let depth = |priority: Priority| lanes.lanes[priority.index()].len();
        QueueDepths {
            critical: depth(Priority::Critical),
            high: depth(Priority::High),
            medium: depth(Priority::Medium),
            low: depth(Priority::Low),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ValidatedEvent;
    use chrono::Utc;
    use serde_json::Map;

    fn queued(id: &str, priority: Priority) -> QueuedEvent {
        let now = Utc::now();
        QueuedEvent::new(
            ValidatedEvent {
                processing_id: id.to_owned(),
                event_type: "test".to_owned(),
                timestamp: now,
                session_id: "s1".to_owned(),
                user_id: None,
                data: Map::new(),
                priority,
                validated_at: now,
            },
            now,
        )
    }

    fn ids(events: &[QueuedEvent]) -> Vec<&str> {
        events.iter().map(QueuedEvent::processing_id).collect()
    }

    #[test]
    fn test_drain_in_priority_order() {
        let queues = PriorityQueueManager::new(100);
        queues.enqueue(queued("low", Priority::Low)).unwrap();
        queues.enqueue(queued("medium", Priority::Medium)).unwrap();
        queues.enqueue(queued("high", Priority::High)).unwrap();
        queues.enqueue(queued("critical", Priority::Critical)).unwrap();

        let drained = queues.drain(4);

        assert_eq!(ids(&drained), vec!["critical", "high", "medium", "low"]);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_drain_is_fifo_within_a_priority() {
        let queues = PriorityQueueManager::new(100);
        for id in ["a", "b", "c"] {
            queues.enqueue(queued(id, Priority::Medium)).unwrap();
        }
        queues.enqueue(queued("urgent", Priority::High)).unwrap();

        let first = queues.drain(2);
        assert_eq!(ids(&first), vec!["urgent", "a"]);

        let rest = queues.drain(10);
        assert_eq!(ids(&rest), vec!["b", "c"]);
        assert_eq!(queues.len(), 0);
    }

    #[test]
    fn test_capacity_is_shared_across_priorities() {
        let queues = PriorityQueueManager::new(2);
        queues.enqueue(queued("one", Priority::Low)).unwrap();
        queues.enqueue(queued("two", Priority::Critical)).unwrap();

        let result = queues.enqueue(queued("three", Priority::Critical));

        assert_eq!(result, Err(QueueError::QueueFull { capacity: 2 }));
        assert_eq!(result.unwrap_err().reason(), "queue_full");
        assert_eq!(queues.len(), 2);
    }

    #[test]
    fn test_depths() {
        let queues = PriorityQueueManager::new(10);
        queues.enqueue(queued("a", Priority::Low)).unwrap();
        queues.enqueue(queued("b", Priority::Low)).unwrap();
        queues.enqueue(queued("c", Priority::High)).unwrap();

        let depths = queues.depths();
        assert_eq!(
            depths,
            QueueDepths {
                critical: 0,
                high: 1,
                medium: 0,
                low: 2
            }
        );
        assert_eq!(depths.total(), 3);
        assert_eq!(depths.get(Priority::Low), 2);
    }

    #[test]
    fn test_drain_zero_and_empty() {
        let queues = PriorityQueueManager::new(10);
        assert!(queues.drain(5).is_empty());

        queues.enqueue(queued("a", Priority::Low)).unwrap();
        assert!(queues.drain(0).is_empty());
        assert_eq!(queues.len(), 1);
    }
}
