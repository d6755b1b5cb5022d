//! Bounded FIFO queues of buffer handles.

use core::convert::Infallible;
use generic_array::{ArrayLength, GenericArray};

/// The queue is full; the element was not enqueued.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

/// A fixed-capacity ring of handles.
///
/// One queue instance carries the outgoing CAN frames and another the
/// incoming OpenLCB messages; both are drained one element per state
/// machine iteration.
pub struct Fifo<T: Copy, N: ArrayLength<Option<T>>> {
    ring: GenericArray<Option<T>, N>,
    head: usize,
    len: usize,
}

impl<T: Copy, N: ArrayLength<Option<T>>> Default for Fifo<T, N> {
    fn default() -> Self {
        Self {
            ring: GenericArray::default(),
            head: 0,
            len: 0,
        }
    }
}

impl<T: Copy, N: ArrayLength<Option<T>>> Fifo<T, N> {
    /// Appends an element. Fails when the queue is full.
    pub fn push(&mut self, value: T) -> Result<(), QueueFull> {
        if self.len == self.ring.len() {
            return Err(QueueFull);
        }
        let tail = (self.head + self.len) % self.ring.len();
        self.ring[tail] = Some(value);
        self.len += 1;
        Ok(())
    }

    /// Removes the oldest element. Blocks (in the [`nb`] sense) when empty.
    pub fn pop(&mut self) -> nb::Result<T, Infallible> {
        if self.len == 0 {
            return Err(nb::Error::WouldBlock);
        }
        let value = self.ring[self.head].take();
        self.head = (self.head + 1) % self.ring.len();
        self.len -= 1;
        // the slot was filled by push
        Ok(value.unwrap())
    }

    /// True when no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of elements the queue can hold.
    pub fn capacity(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use generic_array::typenum::consts::U4;

    #[test]
    fn push_pop_is_fifo() {
        let mut fifo: Fifo<u16, U4> = Fifo::default();
        assert!(fifo.is_empty());
        fifo.push(1).unwrap();
        fifo.push(2).unwrap();
        fifo.push(3).unwrap();
        assert_eq!(fifo.len(), 3);
        assert_eq!(fifo.pop(), Ok(1));
        assert_eq!(fifo.pop(), Ok(2));
        fifo.push(4).unwrap();
        assert_eq!(fifo.pop(), Ok(3));
        assert_eq!(fifo.pop(), Ok(4));
        assert_eq!(fifo.pop(), Err(nb::Error::WouldBlock));
    }

    #[test]
    fn full_queue_rejects_push() {
        let mut fifo: Fifo<u16, U4> = Fifo::default();
        for i in 0..4 {
            fifo.push(i).unwrap();
        }
        assert_eq!(fifo.push(99), Err(QueueFull));
        assert_eq!(fifo.len(), 4);
        assert_eq!(fifo.pop(), Ok(0));
        fifo.push(99).unwrap();
    }

    #[test]
    fn count_law_over_wraparound() {
        let mut fifo: Fifo<u16, U4> = Fifo::default();
        let mut pushed = 0u16;
        let mut popped = 0u16;
        for _ in 0..3 {
            for _ in 0..4 {
                fifo.push(pushed).unwrap();
                pushed += 1;
            }
            for _ in 0..4 {
                assert_eq!(fifo.pop(), Ok(popped));
                popped += 1;
            }
        }
        assert_eq!(usize::from(pushed - popped), fifo.len());
    }
}
