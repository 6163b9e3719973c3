//! Length-delimited JSON frames: a 4-byte big-endian body length followed by
//! the JSON body.
use std::{io, marker::PhantomData};

use bytes::{Buf, BufMut, BytesMut};
use monoio_codec::{Decoded, Decoder, Encoder};
use serde::{de::DeserializeOwned, Serialize};

use crate::wire::{RequestFrame, ResponseFrame};

pub const HEADER_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
}

/// Decodes `D` frames and encodes `E` frames.
pub struct FrameCodec<D, E> {
    _marker: PhantomData<fn(E) -> D>,
}

impl<D, E> Default for FrameCodec<D, E> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<D, E> FrameCodec<D, E> {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Server side: reads requests, writes responses.
pub type ServerCodec = FrameCodec<RequestFrame, ResponseFrame>;
/// Client side: reads responses, writes requests.
pub type ClientCodec = FrameCodec<ResponseFrame, RequestFrame>;

impl<D: DeserializeOwned, E> Decoder for FrameCodec<D, E> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(Decoded::InsufficientAtLeast(HEADER_LEN));
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        if src.len() < HEADER_LEN + len {
            return Ok(Decoded::InsufficientAtLeast(HEADER_LEN + len));
        }
        src.advance(HEADER_LEN);
        let body = src.split_to(len);
        Ok(Decoded::Some(serde_json::from_slice(&body)?))
    }
}

impl<D, E: Serialize> Encoder<E> for FrameCodec<D, E> {
    type Error = CodecError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
