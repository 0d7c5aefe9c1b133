use crate::MAX_QUEUES_PER_CONTEXT;
use crate::config::ConfigError;
use std::fmt::{Display, Formatter};

pub type QueueId = u16;

/// The queues of one interface that a forwarding context reads from or writes to, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSet {
    queues: Vec<QueueId>,
}

impl QueueSet {
    pub fn new(queues: Vec<QueueId>) -> Result<Self, ConfigError> {
        if queues.is_empty() || queues.len() > MAX_QUEUES_PER_CONTEXT {
            return Err(ConfigError::QueueCount {
                count: queues.len(),
                max: MAX_QUEUES_PER_CONTEXT,
            });
        }

        Ok(Self { queues })
    }

    pub fn single(queue: QueueId) -> Self {
        Self {
            queues: vec![queue],
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<QueueId> {
        self.queues.get(index).copied()
    }
}

impl Display for QueueSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let queues: Vec<_> = self.queues.iter().map(|q| q.to_string()).collect();
        write!(f, "[{}]", queues.join(","))
    }
}

/// Walks a [`QueueSet`] in order, wrapping around at the end
#[derive(Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_queue(&mut self, queues: &QueueSet) -> QueueId {
        let queue = queues.queues[self.next % queues.len()];
        self.next = (self.next + 1) % queues.len();
        queue
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_queue_set_bounds() {
        assert!(QueueSet::new(vec![]).is_err());
        assert!(QueueSet::new(vec![0, 1, 2, 3]).is_err());
        assert_eq!(QueueSet::new(vec![4, 5]).unwrap().to_string(), "[4,5]");
    }

    #[test]
    fn test_round_robin_visits_each_queue_once_per_period() {
        let queues = QueueSet::new(vec![7, 3, 5]).unwrap();
        let mut rr = RoundRobin::new();
        let picked: Vec<_> = (0..7).map(|_| rr.next_queue(&queues)).collect();
        assert_eq!(picked, vec![7, 3, 5, 7, 3, 5, 7]);
    }
}
