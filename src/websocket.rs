/*
 * Copyright (C) 2024-2025 the seqwire authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::buffer::{trim_for_display, write_vectored_offset, RefRead};
use std::ascii;
use std::fmt;
use std::io;
use std::io::Write;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// 1 byte flags + 9 bytes payload size + 4 bytes mask
pub const HEADER_SIZE_MAX: usize = 14;

const LOG_CONTENT_MAX: usize = 1_000;

const PSIZE_3BYTE: usize = 126;
const PSIZE_9BYTE: usize = 65536;

pub const OPCODE_CONTINUATION: u8 = 0;
pub const OPCODE_TEXT: u8 = 1;
pub const OPCODE_BINARY: u8 = 2;
pub const OPCODE_CLOSE: u8 = 8;
pub const OPCODE_PING: u8 = 9;
pub const OPCODE_PONG: u8 = 10;

pub const CONTROL_FRAME_PAYLOAD_MAX: usize = 125;

// close status codes, RFC 6455 section 7.4
pub mod codes {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;

    // reserved. never sent on the wire
    pub const ABNORMAL: u16 = 1006;

    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("fragmented control frame")]
    FragmentedControlFrame,

    #[error("oversized control frame")]
    OversizedControlFrame,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("data frame while a fragmented message is in progress")]
    MessageInProgress,

    #[error("reserved bit set without a negotiated extension")]
    BadRsvBit,

    #[error("invalid close reason payload")]
    InvalidCloseReason,

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooBig { size: usize, max: usize },
}

impl Error {
    // the close code a peer should see when this fault kills the session
    pub fn close_code(&self) -> u16 {
        match self {
            Self::FrameTooBig { .. } => codes::TOO_BIG,
            _ => codes::PROTOCOL_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RsvBits {
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
}

impl RsvBits {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    pub fn intersects(&self, other: RsvBits) -> bool {
        (self.rsv1 && other.rsv1) || (self.rsv2 && other.rsv2) || (self.rsv3 && other.rsv3)
    }

    pub fn union(&self, other: RsvBits) -> RsvBits {
        RsvBits {
            rsv1: self.rsv1 || other.rsv1,
            rsv2: self.rsv2 || other.rsv2,
            rsv3: self.rsv3 || other.rsv3,
        }
    }

    // true if every bit set in self is also set in allowed
    pub fn within(&self, allowed: RsvBits) -> bool {
        (!self.rsv1 || allowed.rsv1) && (!self.rsv2 || allowed.rsv2) && (!self.rsv3 || allowed.rsv3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl FrameType {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Text => OPCODE_TEXT,
            Self::Binary => OPCODE_BINARY,
            Self::Close => OPCODE_CLOSE,
            Self::Ping => OPCODE_PING,
            Self::Pong => OPCODE_PONG,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    // continuation (0) is a wire artifact, not a frame type
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            OPCODE_TEXT => Some(Self::Text),
            OPCODE_BINARY => Some(Self::Binary),
            OPCODE_CLOSE => Some(Self::Close),
            OPCODE_PING => Some(Self::Ping),
            OPCODE_PONG => Some(Self::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub message: String,
}

impl CloseReason {
    pub fn new(code: u16, message: &str) -> Self {
        Self {
            code,
            message: message.to_owned(),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.message.len());

        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(self.message.as_bytes());

        out
    }

    // an empty payload is a close with no stated reason
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, Error> {
        if payload.is_empty() {
            return Ok(None);
        }

        if payload.len() < 2 {
            return Err(Error::InvalidCloseReason);
        }

        let mut arr = [0; 2];
        arr.copy_from_slice(&payload[..2]);
        let code = u16::from_be_bytes(arr);

        let message = match std::str::from_utf8(&payload[2..]) {
            Ok(s) => s.to_owned(),
            Err(_) => return Err(Error::InvalidCloseReason),
        };

        Ok(Some(Self { code, message }))
    }
}

// owned protocol unit. handing a frame to a channel transfers ownership;
// the payload buffer is reclaimed on drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub fin: bool,
    pub rsv: RsvBits,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn text(data: &str) -> Self {
        Self {
            frame_type: FrameType::Text,
            fin: true,
            rsv: RsvBits::none(),
            data: data.as_bytes().to_vec(),
        }
    }

    pub fn binary(data: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Binary,
            fin: true,
            rsv: RsvBits::none(),
            data,
        }
    }

    pub fn ping(data: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Ping,
            fin: true,
            rsv: RsvBits::none(),
            data,
        }
    }

    pub fn pong(data: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Pong,
            fin: true,
            rsv: RsvBits::none(),
            data,
        }
    }

    pub fn close(reason: Option<CloseReason>) -> Self {
        let data = match &reason {
            Some(reason) => reason.to_payload(),
            None => Vec::new(),
        };

        Self {
            frame_type: FrameType::Close,
            fin: true,
            rsv: RsvBits::none(),
            data,
        }
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;

        self
    }

    pub fn is_control(&self) -> bool {
        self.frame_type.is_control()
    }

    pub fn close_reason(&self) -> Result<Option<CloseReason>, Error> {
        assert_eq!(self.frame_type, FrameType::Close);

        CloseReason::parse(&self.data)
    }
}

pub(crate) struct PayloadDisplay<'a>(pub &'a [u8]);

impl fmt::Display for PayloadDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use fmt::Write;

        let mut s = String::new();

        write!(&mut s, "\"")?;

        for &b in self.0.iter().take(LOG_CONTENT_MAX + 1) {
            write!(&mut s, "{}", ascii::escape_default(b))?;
        }

        write!(&mut s, "\"")?;

        write!(f, "{}", trim_for_display(&s, LOG_CONTENT_MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub fin: bool,
    pub rsv: RsvBits,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_offset: usize,
    pub payload_size: usize,
}

pub fn header_size(payload_size: usize, masked: bool) -> usize {
    let size = if payload_size < PSIZE_3BYTE {
        1 + 1
    } else if payload_size < PSIZE_9BYTE {
        1 + 3
    } else {
        1 + 9
    };

    if masked {
        size + 4
    } else {
        size
    }
}

// returns None when more bytes are needed
pub fn read_header(buf: &[u8]) -> Option<FrameInfo> {
    if buf.len() < 2 {
        return None;
    }

    let b1 = buf[1] & 0x7f;

    let (mut hsize, psize) = if b1 < (PSIZE_3BYTE as u8) {
        (2, b1 as usize)
    } else if b1 == (PSIZE_3BYTE as u8) {
        if buf.len() < 2 + 2 {
            return None;
        }

        let mut arr = [0; 2];
        arr.copy_from_slice(&buf[2..4]);
        (4, u16::from_be_bytes(arr) as usize)
    } else {
        if buf.len() < 2 + 8 {
            return None;
        }

        let mut arr = [0; 8];
        arr.copy_from_slice(&buf[2..10]);
        (10, u64::from_be_bytes(arr) as usize)
    };

    let mask = if buf[1] & 0x80 != 0 {
        if buf.len() < hsize + 4 {
            return None;
        }

        let mut mask = [0; 4];
        mask.copy_from_slice(&buf[hsize..hsize + 4]);
        hsize += 4;

        Some(mask)
    } else {
        None
    };

    Some(FrameInfo {
        fin: buf[0] & 0x80 != 0,
        rsv: RsvBits {
            rsv1: buf[0] & 0x40 != 0,
            rsv2: buf[0] & 0x20 != 0,
            rsv3: buf[0] & 0x10 != 0,
        },
        opcode: buf[0] & 0x0f,
        mask,
        payload_offset: hsize,
        payload_size: psize,
    })
}

// return payload offset
pub fn write_header(
    fin: bool,
    rsv: RsvBits,
    opcode: u8,
    payload_size: usize,
    mask: Option<[u8; 4]>,
    buf: &mut [u8],
) -> Result<usize, io::Error> {
    let hsize = header_size(payload_size, mask.is_some());
    if buf.len() < hsize {
        return Err(io::Error::from(io::ErrorKind::WriteZero));
    }

    let mut b0 = 0;
    if fin {
        b0 |= 0x80;
    }
    if rsv.rsv1 {
        b0 |= 0x40;
    }
    if rsv.rsv2 {
        b0 |= 0x20;
    }
    if rsv.rsv3 {
        b0 |= 0x10;
    }
    b0 |= opcode & 0x0f;

    buf[0] = b0;

    let hsize = if payload_size < PSIZE_3BYTE {
        buf[1] = payload_size as u8;
        2
    } else if payload_size < PSIZE_9BYTE {
        buf[1] = PSIZE_3BYTE as u8;
        let arr = (payload_size as u16).to_be_bytes();
        buf[2..4].copy_from_slice(&arr);
        4
    } else {
        buf[1] = 0x7f;
        let arr = (payload_size as u64).to_be_bytes();
        buf[2..10].copy_from_slice(&arr);
        10
    };

    if let Some(mask) = mask {
        buf[1] |= 0x80;
        buf[hsize..hsize + 4].copy_from_slice(&mask);
        Ok(hsize + 4)
    } else {
        Ok(hsize)
    }
}

pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, c) in buf.iter_mut().enumerate() {
        *c ^= mask[(offset + i) % 4];
    }
}

// serialize one frame. the payload is masked in place when a mask is given
pub fn write_frame<W: Write>(
    writer: &mut W,
    opcode: u8,
    fin: bool,
    rsv: RsvBits,
    data: &mut [u8],
    mask: Option<[u8; 4]>,
) -> Result<(), io::Error> {
    let mut h = [0; HEADER_SIZE_MAX];

    let hsize = write_header(fin, rsv, opcode, data.len(), mask, &mut h[..])?;

    if let Some(mask) = mask {
        apply_mask(data, mask, 0);
    }

    let bufs = [&h[..hsize], &*data];
    let total = hsize + data.len();

    let mut sent = 0;

    while sent < total {
        let size = match write_vectored_offset(writer, &bufs, sent) {
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if size == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        sent += size;
    }

    Ok(())
}

// a decoded wire unit, before fragment reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub opcode: u8,
    pub fin: bool,
    pub rsv: RsvBits,
    pub data: Vec<u8>,
}

// incremental frame decoder over a consuming byte source. enforces the
// per-frame rules: known opcode, unfragmented control frames, bounded
// payload size, reserved bits within the negotiated set
pub struct FrameDecoder {
    max_frame_size: usize,
    allowed_rsv: RsvBits,
    pending: Option<FrameInfo>,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize, allowed_rsv: RsvBits) -> Self {
        Self {
            max_frame_size,
            allowed_rsv,
            pending: None,
        }
    }

    // returns Ok(None) when more bytes are needed
    pub fn decode<R: RefRead>(&mut self, rbuf: &mut R) -> Result<Option<WireFrame>, Error> {
        if self.pending.is_none() {
            let fi = match read_header(rbuf.get_ref()) {
                Some(fi) => fi,
                None => return Ok(None),
            };

            let known = fi.opcode == OPCODE_CONTINUATION || FrameType::from_opcode(fi.opcode).is_some();
            if !known {
                return Err(Error::UnknownOpcode(fi.opcode));
            }

            if fi.opcode & 0x08 != 0 {
                if !fi.fin {
                    return Err(Error::FragmentedControlFrame);
                }

                if fi.payload_size > CONTROL_FRAME_PAYLOAD_MAX {
                    return Err(Error::OversizedControlFrame);
                }

                if fi.rsv.any() {
                    return Err(Error::BadRsvBit);
                }
            }

            if !fi.rsv.within(self.allowed_rsv) {
                return Err(Error::BadRsvBit);
            }

            if fi.payload_size > self.max_frame_size {
                return Err(Error::FrameTooBig {
                    size: fi.payload_size,
                    max: self.max_frame_size,
                });
            }

            rbuf.consume(fi.payload_offset);

            self.pending = Some(fi);
        }

        let fi = self.pending.unwrap();

        if rbuf.len() < fi.payload_size {
            return Ok(None);
        }

        let buf = rbuf.get_mut();
        let payload = &mut buf[..fi.payload_size];

        if let Some(mask) = fi.mask {
            apply_mask(payload, mask, 0);
        }

        let data = payload.to_vec();

        rbuf.consume(fi.payload_size);

        self.pending = None;

        Ok(Some(WireFrame {
            opcode: fi.opcode,
            fin: fi.fin,
            rsv: fi.rsv,
            data,
        }))
    }
}

// reassembles fragmented data messages. control frames pass through even
// while a fragmented message is in progress. the accumulated message is
// bounded by the same limit as a single frame
pub struct MessageAssembler {
    max_message_size: usize,
    in_progress: Option<(FrameType, RsvBits, Vec<u8>)>,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            in_progress: None,
        }
    }

    pub fn is_assembling(&self) -> bool {
        self.in_progress.is_some()
    }

    // returns Ok(None) while a fragmented message is incomplete
    pub fn add(&mut self, frame: WireFrame) -> Result<Option<Frame>, Error> {
        if frame.opcode & 0x08 != 0 {
            // control frames are never fragmented and never buffered
            let frame_type = match FrameType::from_opcode(frame.opcode) {
                Some(t) => t,
                None => return Err(Error::UnknownOpcode(frame.opcode)),
            };

            return Ok(Some(Frame {
                frame_type,
                fin: true,
                rsv: frame.rsv,
                data: frame.data,
            }));
        }

        if frame.opcode == OPCODE_CONTINUATION {
            let (frame_type, rsv, mut data) = match self.in_progress.take() {
                Some(m) => m,
                None => return Err(Error::UnexpectedContinuation),
            };

            // reserved bits belong to the first frame only
            if frame.rsv.any() {
                return Err(Error::BadRsvBit);
            }

            let total = data.len() + frame.data.len();

            if total > self.max_message_size {
                return Err(Error::FrameTooBig {
                    size: total,
                    max: self.max_message_size,
                });
            }

            data.extend_from_slice(&frame.data);

            if frame.fin {
                return Ok(Some(Frame {
                    frame_type,
                    fin: true,
                    rsv,
                    data,
                }));
            }

            self.in_progress = Some((frame_type, rsv, data));

            return Ok(None);
        }

        // a new data frame
        if self.in_progress.is_some() {
            return Err(Error::MessageInProgress);
        }

        let frame_type = match FrameType::from_opcode(frame.opcode) {
            Some(t) => t,
            None => return Err(Error::UnknownOpcode(frame.opcode)),
        };

        if frame.fin {
            return Ok(Some(Frame {
                frame_type,
                fin: true,
                rsv: frame.rsv,
                data: frame.data,
            }));
        }

        self.in_progress = Some((frame_type, frame.rsv, frame.data));

        Ok(None)
    }
}

pub mod testutil {
    use super::*;

    // serialize a frame the way a peer would put it on the wire
    pub fn encode_frame(
        opcode: u8,
        fin: bool,
        rsv: RsvBits,
        data: &[u8],
        mask: Option<[u8; 4]>,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        let mut data = data.to_vec();

        write_frame(&mut out, opcode, fin, rsv, &mut data, mask).unwrap();

        out
    }

    pub fn decode_one(input: &mut Vec<u8>, max_frame_size: usize) -> Result<Option<WireFrame>, Error> {
        let mut decoder = FrameDecoder::new(max_frame_size, RsvBits::none());
        let mut rbuf = io::Cursor::new(&mut input[..]);

        let frame = decoder.decode(&mut rbuf)?;

        let pos = rbuf.position() as usize;
        input.drain(..pos);

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(header_size(0, false), 2);
        assert_eq!(header_size(125, false), 2);
        assert_eq!(header_size(125, true), 6);

        assert_eq!(header_size(126, false), 4);
        assert_eq!(header_size(65535, false), 4);
        assert_eq!(header_size(65535, true), 8);

        assert_eq!(header_size(65536, false), 10);
        assert_eq!(header_size(65536, true), HEADER_SIZE_MAX);
    }

    #[test]
    fn test_read_write_header() {
        let mut buf = [
            0x81, 0x85, 0x01, 0x02, 0x03, 0x04, 0x69, 0x67, 0x6f, 0x68, 0x6e,
        ];

        let fi = read_header(&buf).unwrap();
        assert_eq!(fi.fin, true);
        assert_eq!(fi.opcode, OPCODE_TEXT);
        assert_eq!(fi.mask, Some([0x01, 0x02, 0x03, 0x04]));
        assert_eq!(fi.payload_offset, 6);
        assert_eq!(fi.payload_size, 5);

        let end = fi.payload_offset + fi.payload_size;
        let payload = &mut buf[fi.payload_offset..end];
        apply_mask(payload, fi.mask.unwrap(), 0);
        assert_eq!(payload, b"hello");

        let payload = b"hello";
        let mut buf2 = vec![0; header_size(payload.len(), true) + payload.len()];
        let offset = write_header(
            true,
            RsvBits::none(),
            OPCODE_TEXT,
            payload.len(),
            Some([0x01, 0x02, 0x03, 0x04]),
            &mut buf2,
        )
        .unwrap();

        assert_eq!(offset, 6);
        buf2[offset..offset + payload.len()].copy_from_slice(payload);
        assert_eq!(buf2, buf);
    }

    #[test]
    fn test_read_header_partial() {
        // masked 16-bit length header cut short
        assert!(read_header(&[0x81]).is_none());
        assert!(read_header(&[0x81, 0xfe, 0x01]).is_none());
        assert!(read_header(&[0x81, 0xfe, 0x01, 0x00, 0x01, 0x02]).is_none());
    }

    #[test]
    fn test_apply_mask() {
        let mut buf = [b'a', b'b', b'c', b'd', b'e'];
        apply_mask(&mut buf, [0x01, 0x02, 0x03, 0x04], 0);
        assert_eq!(buf, [0x60, 0x60, 0x60, 0x60, 0x64]);
    }

    #[test]
    fn test_frame_round_trip() {
        // payload sizes spanning every length-encoding class
        let sizes = [0, 1, 125, 126, 65535, 65536];

        for &size in sizes.iter() {
            for &masked in [false, true].iter() {
                for &fin in [false, true].iter() {
                    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

                    let mask = if masked {
                        Some([0x0a, 0x0b, 0x0c, 0x0d])
                    } else {
                        None
                    };

                    let mut wire =
                        encode_frame(OPCODE_BINARY, fin, RsvBits::none(), &data, mask);

                    let frame = decode_one(&mut wire, 65536).unwrap().unwrap();

                    assert_eq!(frame.opcode, OPCODE_BINARY);
                    assert_eq!(frame.fin, fin);
                    assert_eq!(frame.data, data);
                    assert!(wire.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_decode_needs_more() {
        let wire = encode_frame(OPCODE_TEXT, true, RsvBits::none(), b"hello", None);

        let mut decoder = FrameDecoder::new(1024, RsvBits::none());

        // header only
        let mut partial = wire[..2].to_vec();
        let mut rbuf = io::Cursor::new(&mut partial[..]);
        assert_eq!(decoder.decode(&mut rbuf).unwrap(), None);

        // header plus part of the payload
        let mut partial = wire[..4].to_vec();
        let mut rbuf = io::Cursor::new(&mut partial[..]);
        assert_eq!(decoder.decode(&mut rbuf).unwrap(), None);

        let mut full = wire.clone();
        let mut rbuf = io::Cursor::new(&mut full[..]);
        let frame = decoder.decode(&mut rbuf).unwrap().unwrap();
        assert_eq!(frame.data, b"hello");
    }

    #[test]
    fn test_fragmented_control_rejected() {
        for &opcode in [OPCODE_PING, OPCODE_CLOSE, OPCODE_PONG].iter() {
            let mut wire = encode_frame(opcode, false, RsvBits::none(), b"x", None);

            let r = decode_one(&mut wire, 1024);
            assert_eq!(r, Err(Error::FragmentedControlFrame));
        }
    }

    #[test]
    fn test_oversized_control_rejected() {
        let data = vec![0; CONTROL_FRAME_PAYLOAD_MAX + 1];
        let mut wire = encode_frame(OPCODE_PING, true, RsvBits::none(), &data, None);

        let r = decode_one(&mut wire, 1024);
        assert_eq!(r, Err(Error::OversizedControlFrame));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut wire = encode_frame(3, true, RsvBits::none(), b"", None);

        let r = decode_one(&mut wire, 1024);
        assert_eq!(r, Err(Error::UnknownOpcode(3)));
    }

    #[test]
    fn test_unexpected_rsv_rejected() {
        let rsv = RsvBits {
            rsv1: true,
            rsv2: false,
            rsv3: false,
        };

        let mut wire = encode_frame(OPCODE_TEXT, true, rsv, b"x", None);

        let r = decode_one(&mut wire, 1024);
        assert_eq!(r, Err(Error::BadRsvBit));

        // allowed when negotiated
        let mut decoder = FrameDecoder::new(1024, rsv);
        let mut wire = encode_frame(OPCODE_TEXT, true, rsv, b"x", None);
        let mut rbuf = io::Cursor::new(&mut wire[..]);
        let frame = decoder.decode(&mut rbuf).unwrap().unwrap();
        assert_eq!(frame.rsv, rsv);
    }

    #[test]
    fn test_frame_too_big() {
        let data = vec![0; 1024];
        let mut wire = encode_frame(OPCODE_BINARY, true, RsvBits::none(), &data, None);

        let mut decoder = FrameDecoder::new(1023, RsvBits::none());
        let mut rbuf = io::Cursor::new(&mut wire[..]);

        let r = decoder.decode(&mut rbuf);
        assert_eq!(
            r,
            Err(Error::FrameTooBig {
                size: 1024,
                max: 1023
            })
        );
        assert_eq!(Error::FrameTooBig { size: 1024, max: 1023 }.close_code(), codes::TOO_BIG);
    }

    #[test]
    fn test_reassembly() {
        let mut asm = MessageAssembler::new(1024);

        let first = WireFrame {
            opcode: OPCODE_TEXT,
            fin: false,
            rsv: RsvBits::none(),
            data: b"Hello".to_vec(),
        };

        assert_eq!(asm.add(first).unwrap(), None);
        assert!(asm.is_assembling());

        for data in [&b""[..], &b"12"[..]].iter() {
            let cont = WireFrame {
                opcode: OPCODE_CONTINUATION,
                fin: false,
                rsv: RsvBits::none(),
                data: data.to_vec(),
            };

            assert_eq!(asm.add(cont).unwrap(), None);
        }

        let last = WireFrame {
            opcode: OPCODE_CONTINUATION,
            fin: true,
            rsv: RsvBits::none(),
            data: b"3".to_vec(),
        };

        let msg = asm.add(last).unwrap().unwrap();

        assert_eq!(msg.frame_type, FrameType::Text);
        assert_eq!(msg.fin, true);
        assert_eq!(msg.data, b"Hello123");
        assert!(!asm.is_assembling());
    }

    #[test]
    fn test_reassembly_size_bound() {
        let mut asm = MessageAssembler::new(8);

        let first = WireFrame {
            opcode: OPCODE_BINARY,
            fin: false,
            rsv: RsvBits::none(),
            data: vec![0; 6],
        };

        assert_eq!(asm.add(first).unwrap(), None);

        let cont = WireFrame {
            opcode: OPCODE_CONTINUATION,
            fin: true,
            rsv: RsvBits::none(),
            data: vec![0; 3],
        };

        let r = asm.add(cont);
        assert_eq!(r, Err(Error::FrameTooBig { size: 9, max: 8 }));
    }

    #[test]
    fn test_reassembly_sequencing() {
        let mut asm = MessageAssembler::new(1024);

        // continuation with nothing in progress
        let cont = WireFrame {
            opcode: OPCODE_CONTINUATION,
            fin: true,
            rsv: RsvBits::none(),
            data: Vec::new(),
        };

        assert_eq!(asm.add(cont), Err(Error::UnexpectedContinuation));

        // new data frame while assembling
        let first = WireFrame {
            opcode: OPCODE_TEXT,
            fin: false,
            rsv: RsvBits::none(),
            data: b"a".to_vec(),
        };

        assert_eq!(asm.add(first).unwrap(), None);

        let second = WireFrame {
            opcode: OPCODE_TEXT,
            fin: true,
            rsv: RsvBits::none(),
            data: b"b".to_vec(),
        };

        assert_eq!(asm.add(second), Err(Error::MessageInProgress));

        // control frames pass through mid-message
        let mut asm = MessageAssembler::new(1024);

        let first = WireFrame {
            opcode: OPCODE_TEXT,
            fin: false,
            rsv: RsvBits::none(),
            data: b"a".to_vec(),
        };

        assert_eq!(asm.add(first).unwrap(), None);

        let ping = WireFrame {
            opcode: OPCODE_PING,
            fin: true,
            rsv: RsvBits::none(),
            data: b"hi".to_vec(),
        };

        let frame = asm.add(ping).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);
        assert!(asm.is_assembling());
    }

    #[test]
    fn test_close_reason() {
        let reason = CloseReason::new(codes::NORMAL, "bye");
        let payload = reason.to_payload();
        assert_eq!(payload, b"\x03\xe8bye");

        let parsed = CloseReason::parse(&payload).unwrap().unwrap();
        assert_eq!(parsed, reason);

        assert_eq!(CloseReason::parse(b"").unwrap(), None);
        assert_eq!(CloseReason::parse(b"\x03"), Err(Error::InvalidCloseReason));
        assert_eq!(
            CloseReason::parse(b"\x03\xe8\xff\xfe"),
            Err(Error::InvalidCloseReason)
        );
    }

    #[test]
    fn test_close_frame_reason() {
        let frame = Frame::close(Some(CloseReason::new(codes::GOING_AWAY, "moving")));

        let reason = frame.close_reason().unwrap().unwrap();
        assert_eq!(reason.code, codes::GOING_AWAY);
        assert_eq!(reason.message, "moving");

        let frame = Frame::close(None);
        assert_eq!(frame.close_reason().unwrap(), None);
    }
}
