//! Per-scheduler run queues, one FIFO per priority.
//!
//! `max` is strictly preferred and never stolen from; among the remaining
//! queues, `high` goes before `normal`/`low`, and every eighth pick
//! prefers `low` so a saturated `normal` queue cannot starve it.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::process::{Priority, Process};

/// How often the low queue wins the low/normal toss.
const LOW_PICK_INTERVAL: u8 = 8;

#[derive(Default)]
pub struct RunQueues {
    max: VecDeque<Arc<Process>>,
    high: VecDeque<Arc<Process>>,
    normal: VecDeque<Arc<Process>>,
    low: VecDeque<Arc<Process>>,
    bias: u8,
}

impl RunQueues {
    pub fn push(&mut self, process: Arc<Process>) {
        match process.priority() {
            Priority::Max => self.max.push_back(process),
            Priority::High => self.high.push_back(process),
            Priority::Normal => self.normal.push_back(process),
            Priority::Low => self.low.push_back(process),
        }
    }

    pub fn pop(&mut self) -> Option<Arc<Process>> {
        if let Some(p) = self.max.pop_front() {
            return Some(p);
        }
        if let Some(p) = self.high.pop_front() {
            return Some(p);
        }
        self.bias = self.bias.wrapping_add(1);
        if self.bias % LOW_PICK_INTERVAL == 0 {
            self.low.pop_front().or_else(|| self.normal.pop_front())
        } else {
            self.normal.pop_front().or_else(|| self.low.pop_front())
        }
    }

    /// Takes work from the back of the busiest non-max queue; peers never
    /// steal max-priority work.
    pub fn steal(&mut self) -> Option<Arc<Process>> {
        let queue = [&mut self.high, &mut self.normal, &mut self.low]
            .into_iter()
            .max_by_key(|q| q.len())?;
        queue.pop_back()
    }

    pub fn len(&self) -> usize {
        self.max.len() + self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, priority: Priority) -> usize {
        match priority {
            Priority::Max => self.max.len(),
            Priority::High => self.high.len(),
            Priority::Normal => self.normal.len(),
            Priority::Low => self.low.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::DEFAULT_HEAP_WORDS;
    use crate::process::ProcessId;
    use crate::term::atoms;

    fn process_with(priority: Priority, number: u32) -> Arc<Process> {
        Arc::new(Process::new(
            ProcessId::new(number, 0),
            None,
            priority,
            DEFAULT_HEAP_WORDS,
            65535,
            ProcessId::new(number, 0),
            (atoms::UNDEFINED, atoms::UNDEFINED, 0),
        ))
    }

    #[test]
    fn max_always_wins() {
        let mut q = RunQueues::default();
        q.push(process_with(Priority::Normal, 1));
        q.push(process_with(Priority::Max, 2));
        q.push(process_with(Priority::High, 3));
        assert_eq!(q.pop().unwrap().priority(), Priority::Max);
        assert_eq!(q.pop().unwrap().priority(), Priority::High);
        assert_eq!(q.pop().unwrap().priority(), Priority::Normal);
        assert!(q.pop().is_none());
    }

    #[test]
    fn low_gets_its_turn() {
        let mut q = RunQueues::default();
        for i in 0..32 {
            q.push(process_with(Priority::Normal, i));
        }
        q.push(process_with(Priority::Low, 100));

        let mut popped_low_at = None;
        for i in 0..33 {
            let p = q.pop().unwrap();
            if p.priority() == Priority::Low {
                popped_low_at = Some(i);
                break;
            }
        }
        // The 1-in-8 bias must surface the low process well before the
        // normal backlog drains
        assert!(popped_low_at.unwrap() < 16);
    }

    #[test]
    fn stealing_skips_max() {
        let mut q = RunQueues::default();
        q.push(process_with(Priority::Max, 1));
        assert!(q.steal().is_none());
        q.push(process_with(Priority::Normal, 2));
        assert_eq!(q.steal().unwrap().priority(), Priority::Normal);
    }
}
