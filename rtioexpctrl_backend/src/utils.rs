use std::cmp::min;

use parking_lot::{Condvar, Mutex};

/// Marches over `[0, end_pos)` in steps of `interval`, wrapping back to 0 after the last
/// step so the same counter can be reused for the next repetition.
pub struct StreamCounter {
    pos: usize,
    end_pos: usize,
    interval: usize,
}

impl StreamCounter {
    pub fn new(end_pos: usize, interval: usize) -> Self {
        Self {
            pos: 0,
            end_pos,
            interval: interval.max(1),
        }
    }

    pub fn next_pos(&self) -> usize {
        min(self.pos + self.interval, self.end_pos)
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn end_pos(&self) -> usize {
        self.end_pos
    }

    pub fn tick_next(&mut self) -> (usize, usize) {
        let result = (self.pos(), self.next_pos());
        self.pos = self.next_pos();
        if self.pos == self.end_pos {
            self.pos = 0
        }
        result
    }
}

/// Counting semaphore used to start the primary device after every secondary.
pub struct Semaphore {
    count: Mutex<i64>,
    condition: Condvar,
}

impl Semaphore {
    pub fn new(init_count: i64) -> Self {
        Semaphore {
            count: Mutex::new(init_count),
            condition: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count < 1 {
            self.condition.wait(&mut count);
        }
        *count -= 1;
    }

    pub fn release(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.condition.notify_one();
    }

    pub fn count(&self) -> i64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counter_wraps_after_last_chunk() {
        let mut counter = StreamCounter::new(10, 4);
        assert_eq!(counter.tick_next(), (0, 4));
        assert_eq!(counter.tick_next(), (4, 8));
        assert_eq!(counter.tick_next(), (8, 10));
        assert_eq!(counter.pos(), 0);
        assert_eq!(counter.tick_next(), (0, 4));
    }

    #[test]
    fn zero_interval_still_advances() {
        let mut counter = StreamCounter::new(2, 0);
        assert_eq!(counter.tick_next(), (0, 1));
        assert_eq!(counter.tick_next(), (1, 2));
    }

    #[test]
    fn semaphore_blocks_until_released() {
        let sem = Arc::new(Semaphore::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.release())
            })
            .collect();
        for _ in 0..3 {
            sem.acquire();
        }
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(sem.count(), 0);
    }
}
