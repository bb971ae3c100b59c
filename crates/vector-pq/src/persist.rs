//! Binary codebook format.
//!
//! ```text
//! magic      4 bytes  "VPQ1"
//! version    u16
//! dimensions u32
//! segments   u32
//! centroids  u32
//! data_size  u64      number of f32 values that follow the name
//! name_len   u8
//! name       name_len bytes, distance provider name
//! data       data_size * f32 bit patterns, little endian
//! ```
//!
//! Floats are written as raw bit patterns so NaN payloads survive a round
//! trip unchanged.

use bytes::{Buf, BufMut, BytesMut};
use vector_types::DistanceKind;

use crate::error::PqError;
use crate::quantizer::{ProductQuantizer, MAX_CENTROIDS};

const MAGIC: &[u8; 4] = b"VPQ1";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 4 + 4 + 8 + 1;

impl ProductQuantizer {
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.distance_kind().as_str().as_bytes();
        let data_size = self.segments() * self.centroids() * self.segment_len();

        let mut buf = BytesMut::with_capacity(HEADER_LEN + name.len() + data_size * 4);
        buf.put_slice(MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_u32_le(self.dimensions() as u32);
        buf.put_u32_le(self.segments() as u32);
        buf.put_u32_le(self.centroids() as u32);
        buf.put_u64_le(data_size as u64);
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
        for s in 0..self.segments() {
            for &x in self.codebook(s).centers() {
                buf.put_u32_le(x.to_bits());
            }
        }
        buf.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PqError> {
        let corrupt = |msg: String| PqError::CorruptState(msg);

        if data.len() < HEADER_LEN {
            return Err(corrupt(format!("blob too short: {} bytes", data.len())));
        }
        let mut buf = data;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let dimensions = buf.get_u32_le() as usize;
        let segments = buf.get_u32_le() as usize;
        let centroids = buf.get_u32_le() as usize;
        let data_size = buf.get_u64_le() as usize;
        let name_len = buf.get_u8() as usize;

        if buf.remaining() < name_len {
            return Err(corrupt("truncated distance name".to_string()));
        }
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| corrupt("distance name is not utf-8".to_string()))?;
        let kind = DistanceKind::parse(name)
            .ok_or_else(|| corrupt(format!("unknown distance '{name}'")))?;
        buf.advance(name_len);

        if segments == 0 || dimensions == 0 || dimensions % segments != 0 {
            return Err(corrupt(format!(
                "{dimensions} dimensions do not split into {segments} segments"
            )));
        }
        if centroids == 0 || centroids > MAX_CENTROIDS {
            return Err(corrupt(format!("invalid centroid count {centroids}")));
        }
        let segment_len = dimensions / segments;
        if data_size != segments * centroids * segment_len {
            return Err(corrupt(format!(
                "data size {data_size} does not match {segments}x{centroids}x{segment_len}"
            )));
        }
        if buf.remaining() != data_size * 4 {
            return Err(corrupt(format!(
                "expected {} data bytes, found {}",
                data_size * 4,
                buf.remaining()
            )));
        }

        let per_segment = centroids * segment_len;
        let centers = (0..segments)
            .map(|_| (0..per_segment).map(|_| f32::from_bits(buf.get_u32_le())).collect())
            .collect();

        Ok(Self::from_parts(
            dimensions,
            segments,
            centroids,
            kind.provider(),
            centers,
        ))
    }
}
