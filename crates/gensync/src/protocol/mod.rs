// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire messages exchanged by event and barrier state machines.
//!
//! Four event messages and three barrier messages, encoded little-endian
//! with fixed-width fields. The sender node id is not part of the header;
//! the transport delivers it out of band. Variable-length data (poison
//! lists, reduction values) travels as a separate payload.
//!
//! | Message | Direction | Payload |
//! |---|---|---|
//! | `EventSubscribe` | non-owner -> owner | - |
//! | `EventTrigger` | trigger node -> owner | - |
//! | `EventUpdate` | owner -> subscribers | poisoned generations |
//! | `BarrierAdjust` | non-owner -> owner | reduction value |
//! | `BarrierSubscribe` | non-owner -> owner | - |
//! | `BarrierTrigger` | owner -> subscribers | reduction values |

use std::fmt;

use crate::api::{Barrier, Event};
use crate::core::Id;

// ============================================================================
// Message kinds
// ============================================================================

const KIND_EVENT_SUBSCRIBE: u8 = 1;
const KIND_EVENT_TRIGGER: u8 = 2;
const KIND_EVENT_UPDATE: u8 = 3;
const KIND_BARRIER_ADJUST: u8 = 4;
const KIND_BARRIER_SUBSCRIBE: u8 = 5;
const KIND_BARRIER_TRIGGER: u8 = 6;

/// A protocol message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Ask an event owner for an update once `event.gen` triggers.
    /// `previous_subscribe_gen` is the highest generation the sender had
    /// already subscribed to, so the owner can skip redundant replies.
    EventSubscribe {
        event: Event,
        previous_subscribe_gen: u64,
    },
    /// Tell an event owner that `event.gen` was triggered remotely.
    EventTrigger { event: Event, poisoned: bool },
    /// Owner broadcast: `event.gen` is now the latest triggered generation.
    /// Payload: the full poisoned-generation list as little-endian `u64`s.
    EventUpdate { event: Event },
    /// Forwarded barrier arrival or arrival-count adjustment.
    /// Payload: optional reduction value.
    BarrierAdjust {
        barrier: Barrier,
        delta: i64,
        wait_on: Event,
    },
    /// Ask a barrier owner for a trigger notice at `subscribe_gen`.
    BarrierSubscribe { barrier_id: Id, subscribe_gen: u64 },
    /// Owner notice: generations `(previous_gen, trigger_gen]` triggered.
    /// Payload: reduction values for that range, `sizeof_lhs` bytes each.
    BarrierTrigger {
        barrier_id: Id,
        trigger_gen: u64,
        previous_gen: u64,
        first_generation: u64,
        redop_id: u32,
    },
}

// ============================================================================
// Encoding
// ============================================================================

impl Message {
    /// Encode to the little-endian wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49);
        match *self {
            Message::EventSubscribe {
                event,
                previous_subscribe_gen,
            } => {
                buf.push(KIND_EVENT_SUBSCRIBE);
                put_event(&mut buf, event);
                buf.extend_from_slice(&previous_subscribe_gen.to_le_bytes());
            }
            Message::EventTrigger { event, poisoned } => {
                buf.push(KIND_EVENT_TRIGGER);
                put_event(&mut buf, event);
                buf.push(u8::from(poisoned));
            }
            Message::EventUpdate { event } => {
                buf.push(KIND_EVENT_UPDATE);
                put_event(&mut buf, event);
            }
            Message::BarrierAdjust {
                barrier,
                delta,
                wait_on,
            } => {
                buf.push(KIND_BARRIER_ADJUST);
                buf.extend_from_slice(&barrier.id.raw().to_le_bytes());
                buf.extend_from_slice(&barrier.gen.to_le_bytes());
                buf.extend_from_slice(&barrier.timestamp.to_le_bytes());
                buf.extend_from_slice(&delta.to_le_bytes());
                put_event(&mut buf, wait_on);
            }
            Message::BarrierSubscribe {
                barrier_id,
                subscribe_gen,
            } => {
                buf.push(KIND_BARRIER_SUBSCRIBE);
                buf.extend_from_slice(&barrier_id.raw().to_le_bytes());
                buf.extend_from_slice(&subscribe_gen.to_le_bytes());
            }
            Message::BarrierTrigger {
                barrier_id,
                trigger_gen,
                previous_gen,
                first_generation,
                redop_id,
            } => {
                buf.push(KIND_BARRIER_TRIGGER);
                buf.extend_from_slice(&barrier_id.raw().to_le_bytes());
                buf.extend_from_slice(&trigger_gen.to_le_bytes());
                buf.extend_from_slice(&previous_gen.to_le_bytes());
                buf.extend_from_slice(&first_generation.to_le_bytes());
                buf.extend_from_slice(&redop_id.to_le_bytes());
            }
        }
        buf
    }

    /// Decode from the little-endian wire form.
    pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
        let mut cur = Cursor::new(buf);
        let kind = cur.u8()?;
        let msg = match kind {
            KIND_EVENT_SUBSCRIBE => Message::EventSubscribe {
                event: cur.event()?,
                previous_subscribe_gen: cur.u64()?,
            },
            KIND_EVENT_TRIGGER => Message::EventTrigger {
                event: cur.event()?,
                poisoned: cur.u8()? != 0,
            },
            KIND_EVENT_UPDATE => Message::EventUpdate {
                event: cur.event()?,
            },
            KIND_BARRIER_ADJUST => Message::BarrierAdjust {
                barrier: Barrier {
                    id: Id::from_raw(cur.u64()?),
                    gen: cur.u64()?,
                    timestamp: cur.u64()?,
                },
                delta: cur.u64()? as i64,
                wait_on: cur.event()?,
            },
            KIND_BARRIER_SUBSCRIBE => Message::BarrierSubscribe {
                barrier_id: Id::from_raw(cur.u64()?),
                subscribe_gen: cur.u64()?,
            },
            KIND_BARRIER_TRIGGER => Message::BarrierTrigger {
                barrier_id: Id::from_raw(cur.u64()?),
                trigger_gen: cur.u64()?,
                previous_gen: cur.u64()?,
                first_generation: cur.u64()?,
                redop_id: cur.u32()?,
            },
            other => return Err(DecodeError::UnknownKind(other)),
        };
        cur.finish()?;
        Ok(msg)
    }
}

fn put_event(buf: &mut Vec<u8>, event: Event) {
    buf.extend_from_slice(&event.id.raw().to_le_bytes());
    buf.extend_from_slice(&event.gen.to_le_bytes());
}

// ============================================================================
// Payload codecs
// ============================================================================

/// Encode a poisoned-generation list for an `EventUpdate` payload.
#[must_use]
pub fn encode_gen_list(gens: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(gens.len() * 8);
    for g in gens {
        buf.extend_from_slice(&g.to_le_bytes());
    }
    buf
}

/// Decode an `EventUpdate` poison payload. The length must be a whole
/// number of `u64`s; anything else means a framing bug upstream.
pub fn decode_gen_list(buf: &[u8]) -> Result<Vec<u64>, DecodeError> {
    if buf.len() % 8 != 0 {
        return Err(DecodeError::BadPayloadLength(buf.len()));
    }
    Ok(buf
        .chunks_exact(8)
        .map(|c| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(c);
            u64::from_le_bytes(bytes)
        })
        .collect())
}

// ============================================================================
// Errors
// ============================================================================

/// Wire decoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Message ended before a field could be read.
    Truncated { needed: usize, have: usize },
    /// Unrecognized message kind byte.
    UnknownKind(u8),
    /// Bytes left over after the last field.
    TrailingBytes(usize),
    /// Payload length does not divide into whole elements.
    BadPayloadLength(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { needed, have } => {
                write!(f, "truncated message: needed {needed} bytes, have {have}")
            }
            DecodeError::UnknownKind(kind) => write!(f, "unknown message kind {kind}"),
            DecodeError::TrailingBytes(extra) => {
                write!(f, "{extra} trailing bytes after message")
            }
            DecodeError::BadPayloadLength(len) => {
                write!(f, "payload length {len} is not a whole element count")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Decode cursor
// ============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.off + n > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: self.off + n,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn event(&mut self) -> Result<Event, DecodeError> {
        Ok(Event {
            id: Id::from_raw(self.u64()?),
            gen: self.u64()?,
        })
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.off != self.buf.len() {
            return Err(DecodeError::TrailingBytes(self.buf.len() - self.off));
        }
        Ok(())
    }
}
