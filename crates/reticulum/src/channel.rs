use std::collections::HashMap;

use crate::crypt::compress::{bz2_compress, bz2_decompress};
use crate::error::RnsError;
use crate::slots::SlotArray;

pub const ENVELOPE_HEADER_SIZE: usize = 6;
pub const MAX_MSG_TYPE: u16 = 0x3FFF;
pub const WINDOW_SIZE: usize = 16;

/// Framed channel message: 2-byte type, 2-byte sequence, 2-byte length,
/// payload. Types above 16383 are reserved for the stream layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, RnsError> {
        if raw.len() < ENVELOPE_HEADER_SIZE {
            return Err(RnsError::Truncated);
        }
        let msg_type = u16::from_be_bytes([raw[0], raw[1]]);
        if msg_type > MAX_MSG_TYPE {
            return Err(RnsError::MalformedPacket);
        }
        let sequence = u16::from_be_bytes([raw[2], raw[3]]);
        let len = u16::from_be_bytes([raw[4], raw[5]]) as usize;
        if raw.len() < ENVELOPE_HEADER_SIZE + len {
            return Err(RnsError::Truncated);
        }
        Ok(Self {
            msg_type,
            sequence,
            payload: raw[ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + len].to_vec(),
        })
    }
}

pub type Handler = Box<dyn FnMut(&Envelope) + Send>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TxState {
    Sent,
    Delivered,
}

struct TxEntry {
    envelope: Envelope,
    state: TxState,
}

/// Reliable in-order multiplexer over a link. Outbound envelopes occupy TX
/// ring slots until acknowledged; inbound envelopes are delivered in
/// sequence order, with out-of-order arrivals parked in the RX ring.
pub struct Channel {
    mdu: usize,
    next_sequence: u16,
    rx_next_sequence: u16,
    handlers: HashMap<u16, Handler>,
    tx_ring: SlotArray<TxEntry, WINDOW_SIZE>,
    rx_ring: SlotArray<Envelope, WINDOW_SIZE>,
}

impl Channel {
    pub fn new(mdu: usize) -> Self {
        Self {
            mdu,
            next_sequence: 0,
            rx_next_sequence: 0,
            handlers: HashMap::new(),
            tx_ring: SlotArray::new(),
            rx_ring: SlotArray::new(),
        }
    }

    pub fn register_handler<F>(&mut self, msg_type: u16, handler: F) -> Result<(), RnsError>
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        if msg_type > MAX_MSG_TYPE {
            return Err(RnsError::InvalidArgument);
        }
        self.handlers.insert(msg_type, Box::new(handler));
        Ok(())
    }

    /// Frames and queues an envelope. `PoolExhausted` on a full TX ring
    /// means backpressure: retry after acknowledgements free a slot.
    pub fn send(&mut self, msg_type: u16, payload: Vec<u8>) -> Result<(u16, Vec<u8>), RnsError> {
        if msg_type > MAX_MSG_TYPE {
            return Err(RnsError::InvalidArgument);
        }
        if payload.len() + ENVELOPE_HEADER_SIZE > self.mdu {
            return Err(RnsError::OutOfMemory);
        }
        if self.tx_ring.is_full() {
            return Err(RnsError::PoolExhausted);
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let envelope = Envelope { msg_type, sequence, payload };
        let raw = envelope.pack();
        self.tx_ring.allocate(TxEntry { envelope, state: TxState::Sent });
        Ok((sequence, raw))
    }

    pub fn resend(&mut self, sequence: u16) -> Result<Vec<u8>, RnsError> {
        let index = self
            .tx_ring
            .find(|entry| entry.envelope.sequence == sequence)
            .ok_or(RnsError::InvalidArgument)?;
        let entry = self.tx_ring.get(index).ok_or(RnsError::InvalidArgument)?;
        Ok(entry.envelope.pack())
    }

    /// Acknowledgement for a sent envelope; frees its TX slot.
    pub fn mark_delivered(&mut self, sequence: u16) {
        if let Some(index) = self.tx_ring.find(|entry| entry.envelope.sequence == sequence) {
            if let Some(entry) = self.tx_ring.get_mut(index) {
                entry.state = TxState::Delivered;
            }
            self.tx_ring.release(index);
        }
    }

    pub fn pending_tx(&self) -> usize {
        self.tx_ring.len()
    }

    /// Ingests a raw frame and delivers every in-order envelope to its
    /// registered handler. Out-of-order sequences wait in the RX ring; a
    /// full ring drops the frame.
    pub fn receive(&mut self, raw: &[u8]) -> Result<(), RnsError> {
        let envelope = Envelope::unpack(raw)?;

        if envelope.sequence == self.rx_next_sequence {
            self.deliver(envelope);
            self.flush_rx_ring();
            Ok(())
        } else if sequence_ahead(envelope.sequence, self.rx_next_sequence) {
            if self.rx_ring.find(|parked| parked.sequence == envelope.sequence).is_some() {
                return Ok(());
            }
            match self.rx_ring.allocate(envelope) {
                Some(_) => Ok(()),
                None => {
                    log::warn!("channel: rx ring full, dropping out-of-order frame");
                    Err(RnsError::PoolExhausted)
                }
            }
        } else {
            // Stale retransmission of an already delivered sequence.
            Ok(())
        }
    }

    fn flush_rx_ring(&mut self) {
        loop {
            let next = self.rx_next_sequence;
            match self.rx_ring.find(|envelope| envelope.sequence == next) {
                Some(index) => {
                    if let Some(envelope) = self.rx_ring.release(index) {
                        self.deliver(envelope);
                    }
                }
                None => break,
            }
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        self.rx_next_sequence = envelope.sequence.wrapping_add(1);
        if let Some(handler) = self.handlers.get_mut(&envelope.msg_type) {
            handler(&envelope);
        } else {
            log::debug!("channel: no handler for msg_type {}", envelope.msg_type);
        }
    }
}

fn sequence_ahead(sequence: u16, next: u16) -> bool {
    sequence.wrapping_sub(next) < u16::MAX / 2
}

pub const STREAM_HEADER_SIZE: usize = 2;
pub const MAX_STREAM_ID: u16 = 0x3FFF;

const STREAM_EOF_FLAG: u16 = 0x8000;
const STREAM_COMPRESSED_FLAG: u16 = 0x4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub stream_id: u16,
    pub eof: bool,
    pub data: Vec<u8>,
}

/// Stream chunk framing: a 2-byte header carrying the EOF flag (bit 15),
/// the compressed flag (bit 14) and a 14-bit stream id. Chunks are
/// compressed only when that makes them smaller.
pub fn pack_stream_chunk(stream_id: u16, data: &[u8], eof: bool) -> Result<Vec<u8>, RnsError> {
    if stream_id > MAX_STREAM_ID {
        return Err(RnsError::InvalidArgument);
    }

    let mut header = stream_id;
    if eof {
        header |= STREAM_EOF_FLAG;
    }

    let compressed = bz2_compress(data)?;
    let body = if compressed.len() < data.len() {
        header |= STREAM_COMPRESSED_FLAG;
        compressed
    } else {
        data.to_vec()
    };

    let mut out = Vec::with_capacity(STREAM_HEADER_SIZE + body.len());
    out.extend_from_slice(&header.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn unpack_stream_chunk(raw: &[u8]) -> Result<StreamChunk, RnsError> {
    if raw.len() < STREAM_HEADER_SIZE {
        return Err(RnsError::Truncated);
    }

    let header = u16::from_be_bytes([raw[0], raw[1]]);
    let eof = header & STREAM_EOF_FLAG != 0;
    let compressed = header & STREAM_COMPRESSED_FLAG != 0;
    let stream_id = header & MAX_STREAM_ID;

    let body = &raw[STREAM_HEADER_SIZE..];
    let data = if compressed { bz2_decompress(body)? } else { body.to_vec() };

    Ok(StreamChunk { stream_id, eof, data })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{
        pack_stream_chunk, unpack_stream_chunk, Channel, Envelope, MAX_MSG_TYPE, WINDOW_SIZE,
    };
    use crate::error::RnsError;

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope { msg_type: 0x1234, sequence: 7, payload: b"payload".to_vec() };
        let restored = Envelope::unpack(&envelope.pack()).expect("parsed");
        assert_eq!(restored, envelope);
    }

    #[test]
    fn envelope_rejects_reserved_types() {
        let envelope =
            Envelope { msg_type: MAX_MSG_TYPE + 1, sequence: 0, payload: Vec::new() };
        assert!(Envelope::unpack(&envelope.pack()).is_err());
    }

    #[test]
    fn out_of_order_frames_are_reordered() {
        let mut sender = Channel::new(256);
        let mut receiver = Channel::new(256);

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        receiver
            .register_handler(1, move |envelope: &Envelope| {
                sink.lock().expect("lock").push(envelope.payload.clone());
            })
            .expect("handler registered");

        let frames: Vec<Vec<u8>> = (0..3u8)
            .map(|index| {
                sender.send(1, vec![index]).expect("send").1
            })
            .collect();

        receiver.receive(&frames[2]).expect("parked");
        receiver.receive(&frames[0]).expect("delivered");
        receiver.receive(&frames[1]).expect("delivered and flushed");

        assert_eq!(*delivered.lock().expect("lock"), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn duplicate_frames_deliver_once() {
        let mut sender = Channel::new(256);
        let mut receiver = Channel::new(256);

        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        receiver
            .register_handler(1, move |_: &Envelope| {
                sink.fetch_add(1, Ordering::SeqCst);
            })
            .expect("handler registered");

        let (_, frame) = sender.send(1, b"once".to_vec()).expect("send");
        receiver.receive(&frame).expect("delivered");
        receiver.receive(&frame).expect("stale duplicate ignored");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_tx_ring_applies_backpressure() {
        let mut channel = Channel::new(256);
        for index in 0..WINDOW_SIZE as u16 {
            channel.send(1, vec![index as u8]).expect("send");
        }

        assert_eq!(channel.send(1, b"overflow".to_vec()), Err(RnsError::PoolExhausted));

        channel.mark_delivered(0);
        assert!(channel.send(1, b"freed".to_vec()).is_ok());
    }

    #[test]
    fn stream_chunk_roundtrip() {
        let data = b"stream data ".repeat(64);
        let packed = pack_stream_chunk(0x1fff, &data, true).expect("packed");
        let chunk = unpack_stream_chunk(&packed).expect("parsed");
        assert_eq!(chunk.stream_id, 0x1fff);
        assert!(chunk.eof);
        assert_eq!(chunk.data, data);
    }

    #[test]
    fn incompressible_chunk_is_stored_raw() {
        let data = [0xA7u8; 4];
        let packed = pack_stream_chunk(5, &data, false).expect("packed");
        let chunk = unpack_stream_chunk(&packed).expect("parsed");
        assert!(!chunk.eof);
        assert_eq!(chunk.data, data);
    }
}
