use crate::net::buffer::Buffer;
use crate::net::codec::{CodecStatus, Decoded, Frame};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use photon::shared::ErrorType;
use photon::{StepSeq, WorkerIndex};
use std::io::Write;

const RELAY_MAGIC: u16 = 0x7a17;
const HEADER_SIZE: usize = 15;
const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Frame categories on a worker-to-worker relay channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RelayCategory {
    /// First frame after connect: identifies the connecting worker.
    Handshake = 0,
    Request = 1,
    Response = 2,
    /// Keep-alive probe.
    Beat = 3,
}

impl RelayCategory {
    fn from_u8(raw: u8) -> Option<RelayCategory> {
        match raw {
            0 => Some(RelayCategory::Handshake),
            1 => Some(RelayCategory::Request),
            2 => Some(RelayCategory::Response),
            3 => Some(RelayCategory::Beat),
            _ => None,
        }
    }
}

/// One message on a relay channel. The body is opaque to this layer; the
/// header carries the originating worker and the step sequence used for
/// correlation on the far side.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelayFrame {
    pub category: RelayCategory,
    pub worker: WorkerIndex,
    pub step_seq: StepSeq,
    pub body: Vec<u8>,
}

impl RelayFrame {
    pub fn handshake(worker: WorkerIndex) -> RelayFrame {
        RelayFrame {
            category: RelayCategory::Handshake,
            worker,
            step_seq: 0,
            body: Vec::new(),
        }
    }

    pub fn beat(worker: WorkerIndex) -> RelayFrame {
        RelayFrame {
            category: RelayCategory::Beat,
            worker,
            step_seq: 0,
            body: Vec::new(),
        }
    }

    pub fn request(worker: WorkerIndex, step_seq: StepSeq, body: Vec<u8>) -> RelayFrame {
        RelayFrame {
            category: RelayCategory::Request,
            worker,
            step_seq,
            body,
        }
    }

    pub fn response(worker: WorkerIndex, step_seq: StepSeq, body: Vec<u8>) -> RelayFrame {
        RelayFrame {
            category: RelayCategory::Response,
            worker,
            step_seq,
            body,
        }
    }
}

/// Internal RPC framer: fixed big-endian header (magic, category, worker,
/// step sequence, body length) followed by the body.
pub struct RelayCodec;

impl RelayCodec {
    pub fn new() -> RelayCodec {
        RelayCodec
    }

    pub fn decode(&mut self, input: &mut Buffer) -> Decoded {
        if input.is_empty() {
            return Decoded::Pause;
        }
        if input.len() < HEADER_SIZE {
            return Decoded::PartOk;
        }

        let mut header = input.read_slice();
        let magic = header.read_u16::<BigEndian>().expect("Header size checked");
        if magic != RELAY_MAGIC {
            return Decoded::Fault(ErrorType::ProtocolFault);
        }

        let category_raw = header.read_u8().expect("Header size checked");
        let worker = header.read_u32::<BigEndian>().expect("Header size checked");
        let step_seq = header.read_u32::<BigEndian>().expect("Header size checked");
        let body_len = header.read_u32::<BigEndian>().expect("Header size checked");

        let category = match RelayCategory::from_u8(category_raw) {
            Some(category) => category,
            None => return Decoded::Fault(ErrorType::ProtocolFault),
        };
        if body_len > MAX_BODY_SIZE {
            return Decoded::Fault(ErrorType::PayloadTooLarge);
        }

        let total = HEADER_SIZE + body_len as usize;
        if input.len() < total {
            return Decoded::PartOk;
        }

        let body = input.read_slice()[HEADER_SIZE..total].to_vec();
        input.move_head(total);

        Decoded::Frame(Frame::Relay(RelayFrame {
            category,
            worker,
            step_seq,
            body,
        }))
    }

    pub fn encode(&mut self, frame: &RelayFrame, output: &mut Buffer) -> CodecStatus {
        let total = HEADER_SIZE + frame.body.len();
        output.ensure_capacity(total);

        {
            let mut stream = output.write_slice();
            stream
                .write_u16::<BigEndian>(RELAY_MAGIC)
                .expect("Capacity reserved");
            stream
                .write_u8(frame.category as u8)
                .expect("Capacity reserved");
            stream
                .write_u32::<BigEndian>(frame.worker)
                .expect("Capacity reserved");
            stream
                .write_u32::<BigEndian>(frame.step_seq)
                .expect("Capacity reserved");
            stream
                .write_u32::<BigEndian>(frame.body.len() as u32)
                .expect("Capacity reserved");
            stream.write_all(&frame.body).expect("Capacity reserved");
        }
        output.move_tail(total);

        CodecStatus::WantWrite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut codec = RelayCodec::new();
        let frame = RelayFrame::request(4, 901, b"payload bytes".to_vec());

        let mut wire = Buffer::new();
        assert_eq!(codec.encode(&frame, &mut wire), CodecStatus::WantWrite);

        match codec.decode(&mut wire) {
            Decoded::Frame(Frame::Relay(decoded)) => assert_eq!(decoded, frame),
            other => panic!("Unexpected decode result {:?}", other),
        }
        assert!(wire.is_empty());
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = RelayCodec::new();
        let mut wire = Buffer::new();
        wire.put(&[0x7a, 0x17, 0x01]);

        assert_eq!(codec.decode(&mut wire), Decoded::PartOk);
        assert_eq!(wire.len(), 3);
    }

    #[test]
    fn test_partial_body_waits() {
        let mut codec = RelayCodec::new();
        let frame = RelayFrame::response(2, 55, vec![9; 64]);

        let mut wire = Buffer::new();
        codec.encode(&frame, &mut wire);
        let full = wire.read_slice().to_vec();

        let mut partial = Buffer::new();
        partial.put(&full[..full.len() - 1]);

        assert_eq!(codec.decode(&mut partial), Decoded::PartOk);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut codec = RelayCodec::new();
        let mut wire = Buffer::new();
        wire.put(&[0u8; HEADER_SIZE]);

        assert_eq!(
            codec.decode(&mut wire),
            Decoded::Fault(ErrorType::ProtocolFault)
        );
    }

    #[test]
    fn test_handshake_frame_shape() {
        let frame = RelayFrame::handshake(7);

        assert_eq!(frame.category, RelayCategory::Handshake);
        assert_eq!(frame.worker, 7);
        assert_eq!(frame.step_seq, 0);
        assert!(frame.body.is_empty());
    }
}
