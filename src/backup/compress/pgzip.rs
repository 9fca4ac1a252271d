use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use std::io;
use std::io::Write;

/// Uncompressed bytes per gzip member
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Compresses fixed-size blocks as independent gzip members on the rayon pool
/// and writes them in input order, giving an ordinary multi-member gzip stream.
pub struct ParallelGzEncoder<W: Write> {
    inner: W,
    level: Compression,
    block_size: usize,
    batch_blocks: usize,
    pending: Vec<u8>,
    members_written: usize,
}

impl<W: Write> ParallelGzEncoder<W> {
    pub fn new(inner: W, level: Compression) -> Self {
        Self::with_block_size(inner, level, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(inner: W, level: Compression, block_size: usize) -> Self {
        let batch_blocks = rayon::current_num_threads().max(1);
        tracing::debug!(
            "Creating parallel gzip encoder with block_size={}, batch={}",
            block_size,
            batch_blocks
        );
        Self {
            inner,
            level,
            block_size: block_size.max(1),
            batch_blocks,
            pending: Vec::new(),
            members_written: 0,
        }
    }

    fn compress_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let level = self.level;
        let members: Vec<io::Result<Vec<u8>>> = self
            .pending
            .par_chunks(self.block_size)
            .map(|block| {
                let mut encoder = GzEncoder::new(Vec::with_capacity(block.len() / 2), level);
                encoder.write_all(block)?;
                encoder.finish()
            })
            .collect();

        for member in members {
            self.inner.write_all(&member?)?;
            self.members_written += 1;
        }
        self.pending.clear();
        Ok(())
    }

    /// Compresses whatever is still buffered and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.compress_pending()?;
        if self.members_written == 0 {
            let empty = GzEncoder::new(Vec::new(), self.level).finish()?;
            self.inner.write_all(&empty)?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ParallelGzEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= self.block_size * self.batch_blocks {
            self.compress_pending()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.compress_pending()?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    fn decode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        MultiGzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_multi_member_output_decodes_in_order() {
        let input: Vec<u8> = (0..50_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut encoder = ParallelGzEncoder::with_block_size(Vec::new(), Compression::fast(), 4096);
        for chunk in input.chunks(777) {
            encoder.write_all(chunk).unwrap();
        }
        let out = encoder.finish().unwrap();

        assert!(out.len() > 2 * 18, "expected several gzip members");
        assert_eq!(decode(&out), input);
    }

    #[test]
    fn test_empty_input_is_valid_gzip() {
        let out = ParallelGzEncoder::new(Vec::new(), Compression::default())
            .finish()
            .unwrap();
        assert_eq!(&out[..2], &[0x1f, 0x8b]);
        assert!(decode(&out).is_empty());
    }

    #[test]
    fn test_flush_emits_pending_block() {
        let mut encoder = ParallelGzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"first").unwrap();
        encoder.flush().unwrap();
        assert_eq!(encoder.members_written, 1);
        encoder.write_all(b" second").unwrap();
        let out = encoder.finish().unwrap();
        assert_eq!(decode(&out), b"first second");
    }
}
