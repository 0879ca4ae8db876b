use crate::BoxError;
use log::warn;
use std::collections::VecDeque;

/// Out-of-band errors reported by channel users, oldest first.
///
/// Holds at most `capacity` errors; reporting into a full sideband discards the oldest one.
#[derive(Debug)]
pub(crate) struct Sideband {
    errors: VecDeque<BoxError>,
    capacity: usize,
    dropped: u64,
}

impl Sideband {
    pub(crate) fn new(capacity: usize) -> Sideband {
        assert!(capacity > 0, "Sideband::new bad capacity");

        Sideband {
            errors: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, error: BoxError) {
        if self.errors.len() >= self.capacity {
            if let Some(oldest) = self.errors.pop_front() {
                self.dropped += 1;
                warn!(
                    "channel error sideband full ({} unread); discarding oldest error: {}",
                    self.capacity, oldest
                );
            }
        }
        self.errors.push_back(error);
    }

    pub(crate) fn pop(&mut self) -> Option<BoxError> {
        self.errors.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.errors.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discards_oldest_when_full() {
        let mut sideband = Sideband::new(2);

        sideband.push("one".into());
        sideband.push("two".into());
        sideband.push("three".into());

        assert_eq!(sideband.len(), 2);
        assert_eq!(sideband.dropped(), 1);
        assert_eq!(sideband.pop().unwrap().to_string(), "two");
        assert_eq!(sideband.pop().unwrap().to_string(), "three");
        assert!(sideband.pop().is_none());
    }
}
