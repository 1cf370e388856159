//! Message framing between the daemon and its clients
//!
//! Every message is `magic, id: u16, len: u16, payload` with little-endian integers. Raw DMA data
//! is sent on the same stream without framing, the measurement records it contains carry their own
//! headers.

use crate::{
    codec::Encode,
    error::{
        Error,
        Result,
    },
};
use nom::{
    bytes::streaming::{
        tag,
        take,
    },
    number::streaming::le_u16,
    sequence::tuple,
    IResult,
};
use num_derive::{
    FromPrimitive,
    ToPrimitive,
};
use std::io::Write;
use tracing::{
    debug,
    warn,
};

/// Start of every framed message, `\xFFZB\x02`
pub const MSG_MAGIC: [u8; 4] = [0xFF, 0x5A, 0x42, 0x02];
/// Size of the magic, id and length fields
pub const MSG_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum MessageId {
    Discovery = 1,
    Hello,
    ProgramPl,
    RunStart,
    RunStop,
    SetProperty,
    GetProperty,
    UserMessage,
    Measurement = 0x8000,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum PropertyId {
    Enable = 1,
    EnableLog,
    EnableBurst,
    EnableScript,
    EnableBroadcast,
    TimerMode,
    TimerTime,
    TimerLimit,
    FrameSize,
    FrameGap,
    FramePadding,
    FrameTemplate,
    FrameScript,
    FrameScriptName,
    BurstTimeOn,
    BurstTimeOff,
    PrngSeed,
    MacAddr,
    IpAddr,
    Timeout,
    OverflowCount,
    SamplePeriod,
    Ports,
    PhyAddr,
    ClockFreq,
    MaxTemplateSize,
    FeatureBits,
    NumScripts,
    MaxScriptSize,
    FifoSize,
}

/// Kind tag of a core, as announced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CoreKind {
    AxiDma = 1,
    SimpleTimer,
    FrameDetector,
    StatsCollector,
    LatencyMeasurer,
    TrafficGenerator,
    AxiMdio,
    PrController,
}

/// Frame `payload` as a message with the given id
/// # Errors
/// Returns an error if the payload doesn't fit in the 16-bit length field
pub fn encode_message(id: MessageId, payload: &[u8]) -> Result<Vec<u8>> {
    let len =
        u16::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(MSG_HEADER_SIZE + payload.len());
    MSG_MAGIC.encode(&mut out);
    (id as u16).encode(&mut out);
    len.encode(&mut out);
    payload.encode(&mut out);
    Ok(out)
}

fn frame(input: &[u8]) -> IResult<&[u8], (u16, &[u8])> {
    let (input, (_, id, len)) = tuple((tag(MSG_MAGIC.as_slice()), le_u16, le_u16))(input)?;
    let (input, payload) = take(len)(input)?;
    Ok((input, (id, payload)))
}

/// Reassembles framed messages out of a byte stream, skipping garbage between frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// The next complete message as a raw id and its payload
    pub fn next_frame(&mut self) -> Option<(u16, Vec<u8>)> {
        loop {
            match frame(&self.buffer) {
                Ok((rest, (id, payload))) => {
                    let msg = (id, payload.to_vec());
                    let consumed = self.buffer.len() - rest.len();
                    self.buffer.drain(..consumed);
                    return Some(msg);
                }
                Err(nom::Err::Incomplete(_)) => return None,
                Err(_) => {
                    // Drop everything up to the next candidate magic
                    let skip = self.buffer[1..]
                        .iter()
                        .position(|&b| b == MSG_MAGIC[0])
                        .map_or(self.buffer.len(), |p| p + 1);
                    debug!(skipped = skip, "Resynchronising message stream");
                    self.buffer.drain(..skip);
                }
            }
        }
    }
}

/// Where outgoing messages and DMA data go. Implemented by the network layer.
pub trait MessageSink {
    /// Whether a client is attached and listening
    fn client_available(&self) -> bool;
    /// Send raw, unframed bytes
    fn send_bytes(&mut self, data: &[u8]);
    /// Send a framed message, oversized ones are dropped
    fn send_message(&mut self, id: MessageId, payload: &[u8]) {
        match encode_message(id, payload) {
            Ok(msg) => self.send_bytes(&msg),
            Err(e) => warn!(?id, error = %e, "Dropping message"),
        }
    }
}

/// A [`MessageSink`] over any writer. A failed write detaches the client.
#[derive(Debug)]
pub struct FramedSink<W: Write> {
    writer: Option<W>,
}

impl<W: Write> Default for FramedSink<W> {
    fn default() -> Self {
        Self { writer: None }
    }
}

impl<W: Write> FramedSink<W> {
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    pub fn attach(&mut self, writer: W) {
        self.writer = Some(writer);
    }

    pub fn detach(&mut self) -> Option<W> {
        self.writer.take()
    }
}

impl<W: Write> MessageSink for FramedSink<W> {
    fn client_available(&self) -> bool {
        self.writer.is_some()
    }

    fn send_bytes(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(writer) = &mut self.writer {
            if let Err(e) = writer.write_all(data) {
                warn!(error = %e, "Failed to write to client, detaching");
                self.writer = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_encode_message() {
        let msg = encode_message(MessageId::SetProperty, &[1, 2, 3]).unwrap();
        assert_eq!(msg, [0xFF, 0x5A, 0x42, 0x02, 6, 0, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_decode_split() {
        let msg = encode_message(MessageId::Hello, b"hi").unwrap();
        let mut dec = FrameDecoder::new();
        dec.push(&msg[..5]);
        assert_eq!(dec.next_frame(), None);
        dec.push(&msg[5..]);
        assert_eq!(dec.next_frame(), Some((2, b"hi".to_vec())));
        assert_eq!(dec.next_frame(), None);
    }

    #[test]
    fn test_decode_resync() {
        let mut stream = vec![0x00, 0xFF, 0x13, 0xFF, 0x5A];
        stream.extend(encode_message(MessageId::RunStart, &[]).unwrap());
        stream.extend(encode_message(MessageId::RunStop, &[9]).unwrap());
        let mut dec = FrameDecoder::new();
        dec.push(&stream);
        assert_eq!(dec.next_frame(), Some((4, vec![])));
        assert_eq!(dec.next_frame(), Some((5, vec![9])));
        assert_eq!(dec.next_frame(), None);
    }

    #[test]
    fn test_ids() {
        assert_eq!(MessageId::from_u16(0x8000), Some(MessageId::Measurement));
        assert_eq!(MessageId::from_u16(7), Some(MessageId::GetProperty));
        assert_eq!(PropertyId::from_u16(21), Some(PropertyId::OverflowCount));
        assert_eq!(PropertyId::from_u16(30), Some(PropertyId::FifoSize));
        assert_eq!(PropertyId::from_u16(31), None);
        assert_eq!(CoreKind::from_u8(8), Some(CoreKind::PrController));
    }

    #[test]
    fn test_framed_sink() {
        let mut sink = FramedSink::new(Vec::new());
        assert!(sink.client_available());
        sink.send_message(MessageId::RunStop, &[]);
        sink.send_bytes(&[1, 2]);
        let out = sink.detach().unwrap();
        assert_eq!(out, [0xFF, 0x5A, 0x42, 0x02, 5, 0, 0, 0, 1, 2]);
        assert!(!sink.client_available());
    }

    #[test]
    fn test_oversized_payload() {
        let payload = vec![0; usize::from(u16::MAX) + 1];
        assert!(matches!(
            encode_message(MessageId::GetProperty, &payload),
            Err(Error::PayloadTooLarge(65536))
        ));
        assert!(encode_message(MessageId::GetProperty, &payload[1..]).is_ok());

        let mut sink = FramedSink::new(Vec::new());
        sink.send_message(MessageId::GetProperty, &payload);
        sink.send_message(MessageId::RunStop, &[]);
        assert_eq!(sink.detach().unwrap(), [0xFF, 0x5A, 0x42, 0x02, 5, 0, 0, 0]);
    }
}
