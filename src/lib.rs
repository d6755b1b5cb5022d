#![no_std]
#![warn(missing_docs)]
//! # OpenLCB
//!
//! ## Overview
//! This crate provides a platform-agnostic OpenLCB/LCC (NMRA S-9.7) node
//! stack core for CAN networks.
//!
//! It provides the following features:
//!
//! - the CAN adaptation layer: alias allocation (node login), 29-bit
//!   identifier classification and multi-frame reassembly, and outgoing
//!   message fragmentation
//! - the OpenLCB protocol engine: Message Network, Event Transport,
//!   Datagram, Memory Configuration, SNIP, Stream, Traction and Broadcast
//!   Time handlers driven by a cooperative dispatcher
//! - statically-sized, reference-counted buffer pools segregated by payload
//!   size, handle-based FIFOs and a bounded alias⇄node-id mapping table
//! - a node registry with independent enumeration cursors so unrelated
//!   state machines can walk the node list concurrently
//!
//! The stack is deliberately free of any hardware or OS knowledge. The
//! physical CAN driver, the non-volatile configuration store, the timer
//! source and the application callbacks are all supplied through the traits
//! in [`interface`]; the engine itself never blocks, never allocates and
//! never logs.
//!
//! ## Capacities
//!
//! All storage is sized at compile time through an implementation of
//! [`config::Capacities`]:
//!
//! ```no_run
//! use openlcb::generic_array::typenum::consts::*;
//! use openlcb::config::Capacities;
//!
//! struct Small;
//! impl Capacities for Small {
//!     type CanFrames = U8;
//!     type BasicMessages = U8;
//!     type DatagramMessages = U4;
//!     type SnipMessages = U2;
//!     type StreamPayload = U512;
//!     type StreamMessages = U1;
//!     type MessageFifo = U16;
//!     type AliasMappings = U16;
//!     type Nodes = U2;
//!     type ConsumerEvents = U16;
//!     type ProducerEvents = U16;
//!     type ConsumerRanges = U4;
//!     type ProducerRanges = U4;
//!     type Inflight = U4;
//!     type Clocks = U2;
//! }
//! ```
//!
//! ## General usage example
//!
//! A stack is created from the capacities, a set of dependencies and one or
//! more virtual nodes, then driven from a main loop and a 100 ms tick:
//!
//! ```no_run
//! # use openlcb::generic_array::typenum::consts::*;
//! # use openlcb::config::Capacities;
//! # struct Small;
//! # impl Capacities for Small {
//! #     type CanFrames = U8;
//! #     type BasicMessages = U8;
//! #     type DatagramMessages = U4;
//! #     type SnipMessages = U2;
//! #     type StreamPayload = U512;
//! #     type StreamMessages = U1;
//! #     type MessageFifo = U16;
//! #     type AliasMappings = U16;
//! #     type Nodes = U2;
//! #     type ConsumerEvents = U16;
//! #     type ProducerEvents = U16;
//! #     type ConsumerRanges = U4;
//! #     type ProducerRanges = U4;
//! #     type Inflight = U4;
//! #     type Clocks = U2;
//! # }
//! use openlcb::node::NodeParameters;
//! use openlcb::stack::Stack;
//!
//! # #[derive(Default)]
//! # struct Board;
//! # impl openlcb::interface::CanDevice for Board {
//! #     fn transmit(&mut self, _: &openlcb::frame::CanFrame) -> nb::Result<(), core::convert::Infallible> { Ok(()) }
//! # }
//! # impl openlcb::interface::Platform for Board {}
//! # impl openlcb::interface::Application for Board {}
//! # impl openlcb::interface::ClockObserver for Board {}
//! static PARAMS: NodeParameters = NodeParameters::const_default();
//!
//! let mut stack: Stack<Small, Board> = Stack::new(Board::default());
//! stack.add_node(0x0203_0405_0607, &PARAMS).unwrap();
//!
//! loop {
//!     // Feed frames received by the driver with `stack.incoming_frame(..)`
//!     // (usually from the receive interrupt) and call `stack.tick_100ms()`
//!     // from a 100 ms timer. The main loop just keeps stepping:
//!     let _outcome = stack.step();
//! # break;
//! }
//! ```

pub mod alias;
pub mod application;
pub mod can;
pub mod config;
pub mod events;
pub mod fifo;
pub mod frame;
pub mod identifier;
pub mod interface;
pub mod message;
pub mod mti;
pub mod node;
pub mod protocol;
pub mod stack;
pub mod store;
pub mod utilities;

pub use embedded_can;
pub use generic_array;
