//! Stream framing for the data channel: a greeting carrying the sender's
//! identity, then multi-frame messages. Each frame is
//! `flags[1] | length[4 LE] | payload`; flag bit 0 marks "more frames follow".

use crate::identity::NodeId;
use crate::protocol::Frame;

/// Greeting written once by the connecting side.
pub const GREETING_VERSION: u8 = 1;
pub const GREETING_SIZE: usize = 1 + 16; // version + node_id

const FLAGS_SIZE: usize = 1;
const LEN_SIZE: usize = 4;
const HEADER_SIZE: usize = FLAGS_SIZE + LEN_SIZE;
const FLAG_MORE: u8 = 0x01;
/// Largest frame accepted on a stream.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

pub fn encode_greeting(id: &NodeId) -> [u8; GREETING_SIZE] {
    let mut out = [0u8; GREETING_SIZE];
    out[0] = GREETING_VERSION;
    out[1..].copy_from_slice(id.as_bytes());
    out
}

pub fn decode_greeting(bytes: &[u8; GREETING_SIZE]) -> Result<NodeId, FrameDecodeError> {
    if bytes[0] != GREETING_VERSION {
        return Err(FrameDecodeError::Greeting(bytes[0]));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[1..]);
    Ok(NodeId::from_bytes(id))
}

/// Encode all frames of one message back to back; every frame but the last carries MORE.
pub fn encode_message(frames: &[Frame]) -> Result<Vec<u8>, FrameEncodeError> {
    if frames.is_empty() {
        return Err(FrameEncodeError::Empty);
    }
    let total: usize = frames.iter().map(|f| HEADER_SIZE + f.len()).sum();
    let mut out = Vec::with_capacity(total);
    for (i, frame) in frames.iter().enumerate() {
        let len = u32::try_from(frame.len()).map_err(|_| FrameEncodeError::TooLarge)?;
        if len > MAX_FRAME_LEN {
            return Err(FrameEncodeError::TooLarge);
        }
        let flags = if i + 1 < frames.len() { FLAG_MORE } else { 0 };
        out.push(flags);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(frame);
    }
    Ok(out)
}

/// Error encoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("message has no frames")]
    Empty,
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the payload, whether more
/// frames follow, and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until the whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, bool, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let flags = bytes[0];
    let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let payload = bytes[HEADER_SIZE..HEADER_SIZE + len].to_vec();
    Ok((payload, flags & FLAG_MORE != 0, HEADER_SIZE + len))
}

/// Collects frames until a message is complete.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    pending: Vec<Frame>,
}

impl MessageAssembler {
    /// Feed as many whole frames as `buf` holds. Returns completed messages and
    /// the number of bytes consumed; leftover bytes belong to a partial frame.
    pub fn feed(&mut self, buf: &[u8]) -> Result<(Vec<Vec<Frame>>, usize), FrameDecodeError> {
        let mut consumed = 0;
        let mut done = Vec::new();
        loop {
            match decode_frame(&buf[consumed..]) {
                Ok((frame, more, n)) => {
                    consumed += n;
                    self.pending.push(frame);
                    if !more {
                        done.push(std::mem::take(&mut self.pending));
                    }
                }
                Err(FrameDecodeError::NeedMore) => return Ok((done, consumed)),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Error decoding frames (need more bytes, too large, or bad greeting).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("unsupported greeting version {0}")]
    Greeting(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_roundtrip() {
        let id = NodeId::generate();
        let g = encode_greeting(&id);
        assert_eq!(decode_greeting(&g).unwrap(), id);
        let mut bad = g;
        bad[0] = 9;
        assert!(matches!(
            decode_greeting(&bad),
            Err(FrameDecodeError::Greeting(9))
        ));
    }

    #[test]
    fn more_flag_marks_all_but_last() {
        let bytes = encode_message(&[b"head".to_vec(), b"body".to_vec()]).unwrap();
        let (f1, more1, n1) = decode_frame(&bytes).unwrap();
        assert_eq!(f1, b"head");
        assert!(more1);
        let (f2, more2, n2) = decode_frame(&bytes[n1..]).unwrap();
        assert_eq!(f2, b"body");
        assert!(!more2);
        assert_eq!(n1 + n2, bytes.len());
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_message(&[vec![7u8; 10]]).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..HEADER_SIZE + 3]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn empty_message_rejected() {
        assert!(matches!(encode_message(&[]), Err(FrameEncodeError::Empty)));
    }

    #[test]
    fn assembler_handles_split_input() {
        let mut stream = encode_message(&[b"a".to_vec(), b"bb".to_vec()]).unwrap();
        stream.extend(encode_message(&[b"ccc".to_vec()]).unwrap());

        let mut asm = MessageAssembler::default();
        let split = 8;
        let (first, used) = asm.feed(&stream[..split]).unwrap();
        assert!(first.is_empty());
        let mut rest = stream[used..].to_vec();
        let (msgs, used2) = asm.feed(&rest).unwrap();
        rest.drain(..used2);
        assert!(rest.is_empty());
        assert_eq!(
            msgs,
            vec![
                vec![b"a".to_vec(), b"bb".to_vec()],
                vec![b"ccc".to_vec()]
            ]
        );
    }
}
