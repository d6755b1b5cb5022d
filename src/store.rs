//! Fixed pools of CAN frames and OpenLCB message buffers.
//!
//! Pools hand out 16-bit handles rather than references so buffers can sit
//! in queues, on nodes and in handlers at the same time without fighting
//! the borrow checker. Message buffers are reference counted: allocation
//! starts the count at one, every additional holder increments it, and the
//! slot is returned to the pool when the count reaches zero.

use crate::config::Capacities;
use crate::frame::{CanFrame, FrameSlot};
use crate::message::{Message, MessageHandle, SizeClass};
use generic_array::typenum::consts::{U253, U72, U8};
use generic_array::{ArrayLength, GenericArray};

/// The pool has no free slot of the requested class.
#[derive(Debug, PartialEq, Eq)]
pub struct PoolExhausted;

/// Handle to a frame buffer inside a [`FrameStore`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHandle(pub(crate) u16);

/// Pool of CAN frame buffers.
pub struct FrameStore<C: Capacities> {
    slots: GenericArray<FrameSlot, C::CanFrames>,
    allocated: u16,
    max_allocated: u16,
}

impl<C: Capacities> Default for FrameStore<C> {
    fn default() -> Self {
        Self {
            slots: GenericArray::default(),
            allocated: 0,
            max_allocated: 0,
        }
    }
}

impl<C: Capacities> FrameStore<C> {
    /// Claims a cleared frame buffer. Fails when the pool is exhausted.
    pub fn allocate(&mut self) -> Result<FrameHandle, PoolExhausted> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.allocated {
                slot.frame = CanFrame::default();
                slot.allocated = true;
                self.allocated += 1;
                self.max_allocated = self.max_allocated.max(self.allocated);
                return Ok(FrameHandle(index as u16));
            }
        }
        Err(PoolExhausted)
    }

    /// Returns a frame buffer to the pool.
    pub fn free(&mut self, handle: FrameHandle) {
        let slot = &mut self.slots[usize::from(handle.0)];
        assert!(slot.allocated, "free of an unallocated frame buffer");
        slot.allocated = false;
        self.allocated -= 1;
    }

    /// Access to an allocated frame.
    pub fn frame(&self, handle: FrameHandle) -> &CanFrame {
        let slot = &self.slots[usize::from(handle.0)];
        debug_assert!(slot.allocated);
        &slot.frame
    }

    /// Mutable access to an allocated frame.
    pub fn frame_mut(&mut self, handle: FrameHandle) -> &mut CanFrame {
        let slot = &mut self.slots[usize::from(handle.0)];
        debug_assert!(slot.allocated);
        &mut slot.frame
    }

    /// Number of buffers currently handed out.
    pub fn allocated(&self) -> u16 {
        self.allocated
    }

    /// High-water mark of simultaneous allocations.
    pub fn max_allocated(&self) -> u16 {
        self.max_allocated
    }

    /// Resets the high-water mark to the live count.
    pub fn clear_max_allocated(&mut self) {
        self.max_allocated = self.allocated;
    }
}

/// One slot of a message sub-pool: header, payload storage and the
/// reference count.
pub struct Slot<P: ArrayLength<u8>> {
    message: Message,
    payload: GenericArray<u8, P>,
    reference_count: u16,
    allocated: bool,
}

impl<P: ArrayLength<u8>> Default for Slot<P> {
    fn default() -> Self {
        Self {
            message: Message::default(),
            payload: GenericArray::default(),
            reference_count: 0,
            allocated: false,
        }
    }
}

struct Pool<P: ArrayLength<u8>, N: ArrayLength<Slot<P>>> {
    slots: GenericArray<Slot<P>, N>,
    allocated: u16,
    max_allocated: u16,
}

impl<P: ArrayLength<u8>, N: ArrayLength<Slot<P>>> Default for Pool<P, N> {
    fn default() -> Self {
        Self {
            slots: GenericArray::default(),
            allocated: 0,
            max_allocated: 0,
        }
    }
}

impl<P: ArrayLength<u8>, N: ArrayLength<Slot<P>>> Pool<P, N> {
    fn allocate(&mut self) -> Option<usize> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.allocated {
                slot.message = Message::default();
                slot.payload.iter_mut().for_each(|b| *b = 0);
                slot.reference_count = 1;
                slot.allocated = true;
                self.allocated += 1;
                self.max_allocated = self.max_allocated.max(self.allocated);
                return Some(index);
            }
        }
        None
    }

    fn free(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        assert!(
            slot.allocated && slot.reference_count > 0,
            "reference count underflow"
        );
        slot.reference_count -= 1;
        if slot.reference_count == 0 {
            slot.allocated = false;
            self.allocated -= 1;
        }
    }

    fn inc_reference_count(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        assert!(slot.allocated, "reference to an unallocated buffer");
        slot.reference_count += 1;
    }
}

/// Pool of OpenLCB message buffers, segregated by payload size class.
pub struct MessageStore<C: Capacities> {
    basic: Pool<U8, C::BasicMessages>,
    datagram: Pool<U72, C::DatagramMessages>,
    snip: Pool<U253, C::SnipMessages>,
    stream: Pool<C::StreamPayload, C::StreamMessages>,
}

impl<C: Capacities> Default for MessageStore<C> {
    fn default() -> Self {
        Self {
            basic: Pool::default(),
            datagram: Pool::default(),
            snip: Pool::default(),
            stream: Pool::default(),
        }
    }
}

impl<C: Capacities> MessageStore<C> {
    /// Claims a cleared message buffer of the given class with a reference
    /// count of one.
    pub fn allocate(&mut self, class: SizeClass) -> Result<MessageHandle, PoolExhausted> {
        let index = match class {
            SizeClass::Basic => self.basic.allocate(),
            SizeClass::Datagram => self.datagram.allocate(),
            SizeClass::Snip => self.snip.allocate(),
            SizeClass::Stream => self.stream.allocate(),
        };
        index
            .map(|index| MessageHandle::new(class, index))
            .ok_or(PoolExhausted)
    }

    /// Drops one reference; releases the slot when the count reaches zero.
    ///
    /// Panics on reference-count underflow, which always indicates an
    /// engine bug.
    pub fn free(&mut self, handle: MessageHandle) {
        match handle.class() {
            SizeClass::Basic => self.basic.free(handle.index()),
            SizeClass::Datagram => self.datagram.free(handle.index()),
            SizeClass::Snip => self.snip.free(handle.index()),
            SizeClass::Stream => self.stream.free(handle.index()),
        }
    }

    /// Registers an additional holder of the buffer.
    pub fn inc_reference_count(&mut self, handle: MessageHandle) {
        match handle.class() {
            SizeClass::Basic => self.basic.inc_reference_count(handle.index()),
            SizeClass::Datagram => self.datagram.inc_reference_count(handle.index()),
            SizeClass::Snip => self.snip.inc_reference_count(handle.index()),
            SizeClass::Stream => self.stream.inc_reference_count(handle.index()),
        }
    }

    /// The message header.
    pub fn message(&self, handle: MessageHandle) -> &Message {
        match handle.class() {
            SizeClass::Basic => &self.basic.slots[handle.index()].message,
            SizeClass::Datagram => &self.datagram.slots[handle.index()].message,
            SizeClass::Snip => &self.snip.slots[handle.index()].message,
            SizeClass::Stream => &self.stream.slots[handle.index()].message,
        }
    }

    /// Mutable access to the message header.
    pub fn message_mut(&mut self, handle: MessageHandle) -> &mut Message {
        match handle.class() {
            SizeClass::Basic => &mut self.basic.slots[handle.index()].message,
            SizeClass::Datagram => &mut self.datagram.slots[handle.index()].message,
            SizeClass::Snip => &mut self.snip.slots[handle.index()].message,
            SizeClass::Stream => &mut self.stream.slots[handle.index()].message,
        }
    }

    /// The valid payload bytes (`payload_count` of them).
    pub fn payload(&self, handle: MessageHandle) -> &[u8] {
        let (message, payload) = self.parts(handle);
        &payload[..usize::from(message.payload_count).min(payload.len())]
    }

    /// The message header and the full payload storage, borrowed together.
    pub fn parts(&self, handle: MessageHandle) -> (&Message, &[u8]) {
        match handle.class() {
            SizeClass::Basic => {
                let slot = &self.basic.slots[handle.index()];
                (&slot.message, &slot.payload)
            }
            SizeClass::Datagram => {
                let slot = &self.datagram.slots[handle.index()];
                (&slot.message, &slot.payload)
            }
            SizeClass::Snip => {
                let slot = &self.snip.slots[handle.index()];
                (&slot.message, &slot.payload)
            }
            SizeClass::Stream => {
                let slot = &self.stream.slots[handle.index()];
                (&slot.message, &slot.payload)
            }
        }
    }

    /// Mutable access to the header and the full payload storage.
    pub fn parts_mut(&mut self, handle: MessageHandle) -> (&mut Message, &mut [u8]) {
        match handle.class() {
            SizeClass::Basic => {
                let slot = &mut self.basic.slots[handle.index()];
                (&mut slot.message, &mut slot.payload)
            }
            SizeClass::Datagram => {
                let slot = &mut self.datagram.slots[handle.index()];
                (&mut slot.message, &mut slot.payload)
            }
            SizeClass::Snip => {
                let slot = &mut self.snip.slots[handle.index()];
                (&mut slot.message, &mut slot.payload)
            }
            SizeClass::Stream => {
                let slot = &mut self.stream.slots[handle.index()];
                (&mut slot.message, &mut slot.payload)
            }
        }
    }

    /// Appends bytes to the payload, advancing `payload_count`. Bytes past
    /// the class capacity are discarded.
    pub fn append_payload(&mut self, handle: MessageHandle, data: &[u8]) {
        let (message, payload) = self.parts_mut(handle);
        let offset = usize::from(message.payload_count);
        let room = payload.len().saturating_sub(offset);
        let take = data.len().min(room);
        payload[offset..offset + take].copy_from_slice(&data[..take]);
        message.payload_count += take as u16;
    }

    /// Number of live buffers in a sub-pool.
    pub fn allocated(&self, class: SizeClass) -> u16 {
        match class {
            SizeClass::Basic => self.basic.allocated,
            SizeClass::Datagram => self.datagram.allocated,
            SizeClass::Snip => self.snip.allocated,
            SizeClass::Stream => self.stream.allocated,
        }
    }

    /// High-water mark of a sub-pool.
    pub fn max_allocated(&self, class: SizeClass) -> u16 {
        match class {
            SizeClass::Basic => self.basic.max_allocated,
            SizeClass::Datagram => self.datagram.max_allocated,
            SizeClass::Snip => self.snip.max_allocated,
            SizeClass::Stream => self.stream.max_allocated,
        }
    }

    /// Resets every sub-pool's high-water mark to its live count.
    pub fn clear_max_allocated(&mut self) {
        self.basic.max_allocated = self.basic.allocated;
        self.datagram.max_allocated = self.datagram.allocated;
        self.snip.max_allocated = self.snip.allocated;
        self.stream.max_allocated = self.stream.allocated;
    }
}
