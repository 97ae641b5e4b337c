use anyhow::anyhow;
use bytes::{Buf, Bytes, BytesMut};

use crate::codec::FRAME_LEN_PREFIX_SIZE;

/// Reassembles length-prefixed frames from a byte stream that arrives in arbitrary chunks.
///
/// Frame bodies are returned without their length prefix, i.e. starting with the frame kind.
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}
impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete frame body, or `None` if more data is required.
    ///
    /// A frame announcing a length above the configured maximum is an error: the stream can not be
    ///  resynchronized after that.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.buf.len() < FRAME_LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if body_len > self.max_frame_len {
            return Err(anyhow!("frame length {} exceeds the maximum of {}", body_len, self.max_frame_len));
        }
        if body_len == 0 {
            return Err(anyhow!("empty frame"));
        }

        if self.buf.len() < FRAME_LEN_PREFIX_SIZE + body_len {
            self.buf.reserve(FRAME_LEN_PREFIX_SIZE + body_len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(FRAME_LEN_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(body_len).freeze()))
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_single_frame() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&[0,0,0,2, 0x47, 0]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), &[0x47, 0]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&[0,0,0,1, 0x47, 0,0,0,2, 0x42, 1, 0,0]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), &[0x47]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), &[0x42, 1]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered_len(), 2);
    }

    #[rstest]
    #[case::split_in_prefix(2)]
    #[case::split_after_prefix(4)]
    #[case::split_in_body(6)]
    fn test_frame_split_across_chunks(#[case] split_at: usize) {
        let raw = [0u8,0,0,3, 0x46, 9, 8];
        let mut decoder = FrameDecoder::new(1024);

        decoder.extend(&raw[..split_at]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&raw[split_at..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), &[0x46, 9, 8]);
    }

    #[test]
    fn test_frame_too_long() {
        let mut decoder = FrameDecoder::new(16);
        decoder.extend(&[0,0,0,17]);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_empty_frame() {
        let mut decoder = FrameDecoder::new(16);
        decoder.extend(&[0,0,0,0]);
        assert!(decoder.next_frame().is_err());
    }
}
