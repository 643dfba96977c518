// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;

use crate::codec;
use crate::codec::Decoder;
use crate::codec::Encoder;
use crate::error::Error;
use crate::Result;

/// The maximum size of a stream: 2^62 - 1
const MAX_STREAM_SIZE: u64 = 1 << 62;

/// Stream id of the dedicated control stream. Control data bypasses the
/// application scheduler and is always sent first.
pub const CONTROL_STREAM_ID: u64 = 0;

/// Frames carried by transmission buffer items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// STREAM frame implicitly creates a stream and carry stream data.
    Stream {
        stream_id: u64,
        offset: u64,
        length: usize,
        fin: bool,
        data: Bytes,
    },
}

impl Frame {
    /// Build a stream frame for the given chunk of stream data.
    pub fn new_stream(stream_id: u64, offset: u64, fin: bool, data: Bytes) -> Frame {
        Frame::Stream {
            stream_id,
            offset,
            length: data.len(),
            fin,
            data,
        }
    }

    pub fn from_bytes(buf: &Bytes) -> Result<(Frame, usize)> {
        let mut b = buf.as_ref();

        let first = b.read_u8()?;
        if first & 0b11111000 != 0b00001000 {
            return Err(Error::FrameEncodingError);
        }

        let stream_id = b.read_varint()?;
        let offset = if first & 0x04 != 0 { b.read_varint()? } else { 0 };
        let length = if first & 0x02 != 0 {
            b.read_varint()? as usize
        } else {
            b.len()
        };
        if offset + length as u64 >= MAX_STREAM_SIZE {
            return Err(Error::FrameEncodingError);
        }
        let fin = first & 0x01 != 0;
        if length > b.len() {
            return Err(Error::BufferTooShort);
        }
        let start = buf.len() - b.len();
        let data = buf.slice(start..(start + length));

        let frame = Frame::Stream {
            stream_id,
            offset,
            length,
            fin,
            data,
        };
        Ok((frame, start + length))
    }

    pub fn to_bytes(&self, mut b: &mut [u8]) -> Result<usize> {
        let len = b.len();

        match self {
            Frame::Stream {
                stream_id,
                offset,
                length,
                fin,
                data,
            } => {
                let written = encode_stream_header(*stream_id, *offset, *length as u64, *fin, b)?;
                b = &mut b[written..];
                b.write(data.as_ref())?;
            }
        }

        Ok(len - b.len())
    }

    /// Serialized size of the frame header alone. The scheduler charges
    /// this against its byte budget when assembling segments.
    pub fn header_len(&self) -> usize {
        match self {
            Frame::Stream {
                stream_id,
                offset,
                length,
                ..
            } => {
                1 + codec::encode_varint_len(*stream_id)
                    + codec::encode_varint_len(*offset)
                    + codec::encode_varint_len(*length as u64)
            }
        }
    }

    /// Total serialized size, header plus payload.
    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Stream { length, .. } => self.header_len() + length,
        }
    }

    pub fn stream_id(&self) -> u64 {
        match self {
            Frame::Stream { stream_id, .. } => *stream_id,
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            Frame::Stream { offset, .. } => *offset,
        }
    }

    /// Payload size in bytes.
    pub fn data_len(&self) -> usize {
        match self {
            Frame::Stream { length, .. } => *length,
        }
    }
}

pub fn encode_stream_header(
    stream_id: u64,
    offset: u64,
    length: u64,
    fin: bool,
    mut b: &mut [u8],
) -> Result<usize> {
    let len = b.len();

    let mut frame_type: u8 = 0b00001110; // Always encode offset and length.
    if fin {
        frame_type |= 0x01;
    }
    b.write_varint(u64::from(frame_type))?;
    b.write_varint(stream_id)?;
    b.write_varint(offset)?;
    b.write_varint(length)?;

    Ok(len - b.len())
}
