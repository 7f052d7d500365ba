use crate::net::buffer::Buffer;
use crate::net::codec::{CodecStatus, Decoded, Frame};

/// Pass-through codec: no framing, no handshake, no keep-alive probe. Every
/// readable byte run is surfaced as one frame.
pub struct RawCodec;

impl RawCodec {
    pub fn new() -> RawCodec {
        RawCodec
    }

    pub fn decode(&mut self, input: &mut Buffer) -> Decoded {
        if input.is_empty() {
            return Decoded::Pause;
        }

        let bytes = input.read_slice().to_vec();
        input.move_head(bytes.len());

        Decoded::Frame(Frame::Raw(bytes))
    }

    pub fn encode(&mut self, bytes: &[u8], output: &mut Buffer) -> CodecStatus {
        output.put(bytes);
        CodecStatus::WantWrite
    }
}
