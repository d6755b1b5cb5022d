//! The CAN adaptation layer: login/alias allocation, frame-to-message
//! reassembly, message-to-frame fragmentation and the top-level
//! cooperative dispatcher.

pub mod login;
pub mod main;
pub mod rx;
pub mod tx;
