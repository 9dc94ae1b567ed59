//! Turns a byte stream into a sequence of complete frame bodies.

/// Callback invoked with each completed frame body (delimiter excluded).
pub type FrameCallback = Box<dyn FnMut(Vec<u8>) + Send>;

/// Stateful single-delimiter scanner bound to a completion callback.
///
/// Socket reads rarely align to frame boundaries, so the accumulator
/// persists across `feed` calls for the lifetime of one connection. The
/// delimiter byte is never included in emitted data nor carried into the
/// next frame.
pub struct FrameAssembler {
    delimiter: u8,
    buffer: Vec<u8>,
    on_frame: FrameCallback,
}

impl FrameAssembler {
    pub fn new(delimiter: u8, on_frame: FrameCallback) -> Self {
        Self {
            delimiter,
            buffer: Vec::new(),
            on_frame,
        }
    }

    /// Append bytes; invokes the callback once per delimiter encountered.
    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            if b != self.delimiter {
                self.buffer.push(b);
            } else {
                let frame = std::mem::take(&mut self.buffer);
                (self.on_frame)(frame);
            }
        }
    }

    /// Bytes accumulated toward the next (incomplete) frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_assembler(delimiter: u8) -> (FrameAssembler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let assembler = FrameAssembler::new(
            delimiter,
            Box::new(move |frame| sink.lock().unwrap().push(frame)),
        );
        (assembler, seen)
    }

    #[test]
    fn test_fragmented_frames() {
        let (mut asm, seen) = collecting_assembler(b'\n');

        asm.feed(b"abc");
        assert!(seen.lock().unwrap().is_empty());
        asm.feed(b"def\n");
        asm.feed(b"hij\n");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], b"abcdef");
        assert_eq!(seen[1], b"hij");
    }

    #[test]
    fn test_byte_at_a_time_matches_whole() {
        let stream = b"first\x04second\x04tail";

        let (mut whole, whole_seen) = collecting_assembler(0x04);
        whole.feed(stream);

        let (mut split, split_seen) = collecting_assembler(0x04);
        for b in stream {
            split.feed(&[*b]);
        }

        assert_eq!(*whole_seen.lock().unwrap(), *split_seen.lock().unwrap());
        assert_eq!(whole.pending(), split.pending());
        assert_eq!(whole.pending(), 4);
    }

    #[test]
    fn test_delimiter_never_emitted() {
        let (mut asm, seen) = collecting_assembler(0x04);
        asm.feed(b"a\x04b\x04");
        for frame in seen.lock().unwrap().iter() {
            assert!(!frame.contains(&0x04));
        }
    }

    #[test]
    fn test_back_to_back_delimiters_emit_empty_frames() {
        let (mut asm, seen) = collecting_assembler(0x04);
        asm.feed(b"\x04\x04");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_empty() && seen[1].is_empty());
    }

    #[test]
    fn test_repeated_feed_is_stable() {
        let (mut asm, seen) = collecting_assembler(b'\n');
        for _ in 0..1000 {
            asm.feed(b"abc\n");
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1000);
        assert!(seen.iter().all(|f| f == b"abc"));
    }
}
