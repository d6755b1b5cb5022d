//! Fragmentation of whole OpenLCB messages into CAN frames.
//!
//! Each `*_frame` function emits exactly one frame per call and advances
//! `offset` only when the driver accepted it, so a full transmit buffer
//! stalls the message in place and the caller retries the same frame on
//! its next iteration.

use crate::frame::CanFrame;
use crate::identifier::{
    CanIdentifier, FrameType, MULTIFRAME_FINAL, MULTIFRAME_FIRST, MULTIFRAME_MIDDLE,
    MULTIFRAME_ONLY,
};
use crate::interface::{Application, CanDevice};
use crate::message::{Alias, Message};
use crate::mti;
use core::convert::Infallible;

/// Payload bytes per addressed frame after the two destination bytes.
const ADDRESSED_CHUNK: usize = 6;
/// Payload bytes per datagram or stream frame.
const FULL_CHUNK: usize = 8;

fn transmit<D: CanDevice + Application>(
    frame: &CanFrame,
    deps: &mut D,
) -> nb::Result<(), Infallible> {
    deps.transmit(frame)?;
    deps.on_transmit(frame);
    Ok(())
}

/// Emits the single frame of an unaddressed (global) message. The payload
/// must fit one frame; longer payloads are clipped to eight bytes.
pub fn unaddressed_frame<D: CanDevice + Application>(
    message: &Message,
    payload: &[u8],
    offset: &mut u16,
    deps: &mut D,
) -> nb::Result<(), Infallible> {
    let identifier = CanIdentifier::openlcb_message(
        FrameType::Standard,
        message.mti & 0x0FFF,
        message.source_alias,
    );
    let take = payload.len().min(FULL_CHUNK);
    let mut frame = CanFrame::empty(identifier);
    frame.payload[..take].copy_from_slice(&payload[..take]);
    frame.payload_count = take as u8;
    transmit(&frame, deps)?;
    *offset += take as u16;
    Ok(())
}

/// Emits the next frame of an addressed message. The destination alias
/// rides in the first two payload bytes with the multi-frame marker in the
/// top nibble; up to six data bytes follow.
pub fn addressed_frame<D: CanDevice + Application>(
    message: &Message,
    payload: &[u8],
    offset: &mut u16,
    deps: &mut D,
) -> nb::Result<(), Infallible> {
    let identifier = CanIdentifier::openlcb_message(
        FrameType::Standard,
        message.mti & 0x0FFF,
        message.source_alias,
    );
    let start = usize::from(*offset);
    let remaining = payload.len().saturating_sub(start);
    let take = remaining.min(ADDRESSED_CHUNK);

    let marker = if start == 0 && remaining <= ADDRESSED_CHUNK {
        MULTIFRAME_ONLY
    } else if start == 0 {
        MULTIFRAME_FIRST
    } else if remaining <= ADDRESSED_CHUNK {
        MULTIFRAME_FINAL
    } else {
        MULTIFRAME_MIDDLE
    };

    let mut frame = CanFrame::empty(identifier);
    frame.payload[0] = marker | ((message.dest_alias >> 8) as u8 & 0x0F);
    frame.payload[1] = message.dest_alias as u8;
    frame.payload[2..2 + take].copy_from_slice(&payload[start..start + take]);
    frame.payload_count = (2 + take) as u8;
    transmit(&frame, deps)?;
    *offset += take as u16;
    Ok(())
}

/// Emits the next frame of a datagram. The frame type encodes the frame's
/// position and the destination alias rides in the identifier's variable
/// field; all eight payload bytes carry data.
pub fn datagram_frame<D: CanDevice + Application>(
    message: &Message,
    payload: &[u8],
    offset: &mut u16,
    deps: &mut D,
) -> nb::Result<(), Infallible> {
    let start = usize::from(*offset);
    let remaining = payload.len().saturating_sub(start);
    let take = remaining.min(FULL_CHUNK);

    let frame_type = if start == 0 && remaining <= FULL_CHUNK {
        FrameType::DatagramOnly
    } else if start == 0 {
        FrameType::DatagramFirst
    } else if remaining <= FULL_CHUNK {
        FrameType::DatagramFinal
    } else {
        FrameType::DatagramMiddle
    };

    let identifier =
        CanIdentifier::openlcb_message(frame_type, message.dest_alias, message.source_alias);
    let mut frame = CanFrame::empty(identifier);
    frame.payload[..take].copy_from_slice(&payload[start..start + take]);
    frame.payload_count = take as u8;
    transmit(&frame, deps)?;
    *offset += take as u16;
    Ok(())
}

/// Emits the next frame of a stream transfer: a stream-type frame with the
/// destination alias in the variable field and eight data bytes.
pub fn stream_frame<D: CanDevice + Application>(
    message: &Message,
    payload: &[u8],
    offset: &mut u16,
    deps: &mut D,
) -> nb::Result<(), Infallible> {
    let start = usize::from(*offset);
    let take = payload.len().saturating_sub(start).min(FULL_CHUNK);

    let identifier =
        CanIdentifier::openlcb_message(FrameType::Stream, message.dest_alias, message.source_alias);
    let mut frame = CanFrame::empty(identifier);
    frame.payload[..take].copy_from_slice(&payload[start..start + take]);
    frame.payload_count = take as u8;
    transmit(&frame, deps)?;
    *offset += take as u16;
    Ok(())
}

/// Drives a whole message out the driver, choosing the framing path from
/// the MTI. Progress survives a [`nb::Error::WouldBlock`] in `offset`;
/// call again with the same arguments to resume. `Ok` means the message
/// has been fully handed to the driver.
pub fn send_message<D: CanDevice + Application>(
    message: &Message,
    payload: &[u8],
    offset: &mut u16,
    deps: &mut D,
) -> nb::Result<(), Infallible> {
    loop {
        if message.mti == mti::DATAGRAM {
            datagram_frame(message, payload, offset, deps)?;
        } else if message.mti == mti::STREAM_SEND {
            stream_frame(message, payload, offset, deps)?;
        } else if mti::is_addressed(message.mti) {
            addressed_frame(message, payload, offset, deps)?;
        } else {
            unaddressed_frame(message, payload, offset, deps)?;
        }
        if usize::from(*offset) >= payload.len() {
            return Ok(());
        }
    }
}

/// Builds the single frame of a short addressed reply (rejections and
/// acknowledgements) without touching the driver. The payload must leave
/// room for the two destination bytes.
pub fn addressed_reply_frame(
    mti: u16,
    source_alias: Alias,
    dest_alias: Alias,
    payload: &[u8],
) -> CanFrame {
    let identifier = CanIdentifier::openlcb_message(FrameType::Standard, mti & 0x0FFF, source_alias);
    let take = payload.len().min(ADDRESSED_CHUNK);
    let mut frame = CanFrame::empty(identifier);
    frame.payload[0] = MULTIFRAME_ONLY | ((dest_alias >> 8) as u8 & 0x0F);
    frame.payload[1] = dest_alias as u8;
    frame.payload[2..2 + take].copy_from_slice(&payload[..take]);
    frame.payload_count = (2 + take) as u8;
    frame
}
