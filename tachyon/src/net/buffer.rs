use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Buffers grow in whole increments so the ring allocation stays page aligned.
const BUF_SIZE_INCREMENT: usize = 65536;

/// A dynamically sized buffered FIFO byte queue. Data is appended at the tail
/// and consumed from the head. Unlike a fixed transfer window, protocol
/// frames here (a `CLUSTER SLOTS` reply, a large `MGET`) have no intrinsic
/// size cap, so the queue grows on demand by whole increments.
pub struct Buffer {
    data: ByteDeque,
}

/// Outcome of draining a readable descriptor into the buffer.
#[derive(Debug, Eq, PartialEq)]
pub struct Ingress {
    pub received: usize,
    /// The peer closed its write side; no more data will ever arrive.
    pub eof: bool,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(BUF_SIZE_INCREMENT);
        Buffer { data }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity before the next growth step.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    /// Makes room for at least `count` more bytes, rounding the allocation
    /// up to a whole increment.
    #[inline]
    pub fn ensure_capacity(&mut self, count: usize) {
        if self.free_capacity() < count {
            let rounded = (count + BUF_SIZE_INCREMENT - 1) / BUF_SIZE_INCREMENT * BUF_SIZE_INCREMENT;
            self.data.reserve(rounded);
        }
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Commit `count` bytes written at the tail.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        unsafe { self.data.move_head(len as isize) };
    }

    /// Slice of free capacity to be written and committed with `move_tail`.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    /// Appends a full byte run, growing as needed.
    #[inline]
    pub fn put(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        self.write_slice()[..bytes.len()].copy_from_slice(bytes);
        self.move_tail(bytes.len());
    }

    /// Write the buffer contents to the supplied writer, advancing the head
    /// past whatever was accepted. A zero-length write is an error so a stuck
    /// peer cannot spin the reactor.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Read from the supplied reader until it would block or reports end of
    /// stream, growing the buffer whenever a read fills the current tail.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<Ingress> {
        let mut received = 0;

        loop {
            if self.free_capacity() == 0 {
                self.ensure_capacity(BUF_SIZE_INCREMENT);
            }

            let read_count = match reader.read(self.write_slice()) {
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock && received > 0 => {
                    return Ok(Ingress { received, eof: false });
                }
                Err(err) => return Err(err),
            };

            if read_count == 0 {
                return Ok(Ingress {
                    received,
                    eof: true,
                });
            }

            self.move_tail(read_count);
            received += read_count;
        }
    }

    /// Mutable slice containing data.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockStream {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
        closed: bool,
    }

    impl MockStream {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockStream {
            MockStream {
                data,
                cursor: 0,
                chunk,
                max_size,
                closed: false,
            }
        }

        fn drained(chunk: usize, max_size: usize) -> MockStream {
            MockStream::new(Vec::new(), chunk, max_size)
        }
    }

    impl io::Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                if self.closed {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT / 2).map(|item| item as u8).collect();
        let mut stream = MockStream::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new();

        let ingress = buffer.ingress(&mut stream).unwrap();

        assert_eq!(ingress, Ingress { received: mock_data.len(), eof: false });
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        let mut sink = MockStream::drained(500, mock_data.len());
        let count = buffer.egress(&mut sink).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(sink.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_grows_past_one_increment() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT * 2 + 17).map(|item| item as u8).collect();
        let mut stream = MockStream::new(mock_data.clone(), 4096, 0);

        let mut buffer = Buffer::new();

        let ingress = buffer.ingress(&mut stream).unwrap();

        assert_eq!(ingress.received, mock_data.len());
        assert!(!ingress.eof);
        assert_eq!(buffer.read_slice(), &mock_data[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut stream = MockStream::new(vec![1, 2, 3], 16, 0);
        stream.closed = true;

        let mut buffer = Buffer::new();

        let ingress = buffer.ingress(&mut stream).unwrap();

        assert_eq!(ingress, Ingress { received: 3, eof: true });
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_empty_would_block() {
        let mut stream = MockStream::drained(16, 0);

        let mut buffer = Buffer::new();

        let result = buffer.ingress(&mut stream);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_sink = vec![];

        let mut buffer = Buffer::new();
        buffer.put(&[1]);

        let result = buffer.egress(&mut zero_sink[..]);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_egress_partial_write_keeps_rest() {
        let mut buffer = Buffer::new();
        buffer.put(&[7; 100]);

        let mut sink = MockStream::drained(10, 30);

        let result = buffer.egress(&mut sink);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(sink.data.len(), 30);
        assert_eq!(buffer.len(), 70);
    }

    #[test]
    fn test_put_and_clear() {
        let mut buffer = Buffer::new();
        buffer.put(b"hello");

        assert_eq!(buffer.read_slice(), b"hello");

        buffer.clear();

        assert!(buffer.is_empty());
    }
}
