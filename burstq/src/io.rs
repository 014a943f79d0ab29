//! Per-queue payload sinks and sources.
//!
//! Receive workers append raw payload bytes to one sink per queue; nothing
//! frames the packets. Transmit workers pull packet payloads from a
//! [`PacketSource`]: either a reader cut into fixed-size chunks or a
//! synthetic pattern.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

/// Offset of the byte set in every pattern packet, the low byte of the
/// Ethernet type field (IPv4).
pub const PATTERN_MARKER_OFFSET: usize = 13;

/// Value written at [`PATTERN_MARKER_OFFSET`].
pub const PATTERN_MARKER: u8 = 0x08;

/// A per-queue file could not be opened.
#[derive(Debug, thiserror::Error)]
#[error("failed to open {path}: {source}")]
pub struct OpenError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Path of queue `index`'s data file: `<dir>/<prefix><index>.dat`.
#[must_use]
pub fn queue_file(dir: &Path, prefix: &str, index: usize) -> PathBuf {
    dir.join(format!("{prefix}{index}.dat"))
}

/// Creates (truncating) one buffered output file per queue.
///
/// # Errors
///
/// Returns the first file that cannot be created. Files created before it
/// are closed again.
pub fn create_sinks(
    dir: &Path,
    prefix: &str,
    count: usize,
) -> Result<Vec<BufWriter<File>>, OpenError> {
    (0..count)
        .map(|index| {
            let path = queue_file(dir, prefix, index);
            File::create(&path)
                .map(BufWriter::new)
                .map_err(|source| OpenError { path, source })
        })
        .collect()
}

/// Opens one chunked input file per queue.
///
/// # Errors
///
/// Returns the first file that cannot be opened.
pub fn open_sources(
    dir: &Path,
    prefix: &str,
    count: usize,
    packet_len: usize,
) -> Result<Vec<ReaderSource<BufReader<File>>>, OpenError> {
    (0..count)
        .map(|index| {
            let path = queue_file(dir, prefix, index);
            File::open(&path)
                .map(|file| ReaderSource::new(BufReader::new(file), packet_len))
                .map_err(|source| OpenError { path, source })
        })
        .collect()
}

/// Supplies transmit payloads.
pub trait PacketSource: Send {
    /// Writes the next packet into `buf` and returns its length, or `None`
    /// once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates read failures of the underlying medium.
    fn next_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn next_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        (**self).next_packet(buf)
    }
}

/// Endless zero-filled packets of a fixed length, marked as IPv4 frames.
#[derive(Debug, Clone)]
pub struct PatternSource {
    packet_len: usize,
    /// Packets left, `None` for unbounded.
    remaining: Option<u64>,
}

impl PatternSource {
    #[must_use]
    pub fn new(packet_len: usize) -> Self {
        Self {
            packet_len,
            remaining: None,
        }
    }

    /// Stops after `packets` packets.
    #[must_use]
    pub fn limited(packet_len: usize, packets: u64) -> Self {
        Self {
            packet_len,
            remaining: Some(packets),
        }
    }
}

impl PacketSource for PatternSource {
    fn next_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        let len = self.packet_len.min(buf.len());
        buf[..len].fill(0);
        if let Some(marker) = buf[..len].get_mut(PATTERN_MARKER_OFFSET) {
            *marker = PATTERN_MARKER;
        }
        Ok(Some(len))
    }
}

/// Cuts a byte stream into packets of `packet_len` bytes; the last packet
/// may be shorter.
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    packet_len: usize,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R, packet_len: usize) -> Self {
        Self { reader, packet_len }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Send> PacketSource for ReaderSource<R> {
    fn next_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let want = self.packet_len.min(buf.len());
        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok((filled > 0).then_some(filled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn pattern_marks_ipv4() {
        let mut source = PatternSource::new(64);
        let mut buf = [0xffu8; 128];
        assert_eq!(source.next_packet(&mut buf).unwrap(), Some(64));
        assert_eq!(buf[PATTERN_MARKER_OFFSET], PATTERN_MARKER);
        assert_eq!(buf[..64].iter().filter(|&&b| b != 0).count(), 1);
        assert_eq!(buf[64], 0xff);
    }

    #[test]
    fn pattern_shorter_than_marker_is_all_zero() {
        let mut source = PatternSource::new(8);
        let mut buf = [1u8; 8];
        assert_eq!(source.next_packet(&mut buf).unwrap(), Some(8));
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn limited_pattern_runs_dry() {
        let mut source = PatternSource::limited(4, 2);
        let mut buf = [0u8; 4];
        assert!(source.next_packet(&mut buf).unwrap().is_some());
        assert!(source.next_packet(&mut buf).unwrap().is_some());
        assert_eq!(source.next_packet(&mut buf).unwrap(), None);
    }

    #[test]
    fn reader_source_chunks_input() {
        let mut source = ReaderSource::new(Cursor::new(b"abcdefghij".to_vec()), 4);
        let mut buf = [0u8; 16];

        assert_eq!(source.next_packet(&mut buf).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"abcd");
        assert_eq!(source.next_packet(&mut buf).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"efgh");
        assert_eq!(source.next_packet(&mut buf).unwrap(), Some(2));
        assert_eq!(&buf[..2], b"ij");
        assert_eq!(source.next_packet(&mut buf).unwrap(), None);
    }

    #[test]
    fn reader_source_respects_slot_size() {
        let mut source = ReaderSource::new(Cursor::new(vec![7u8; 10]), 64);
        let mut buf = [0u8; 6];
        assert_eq!(source.next_packet(&mut buf).unwrap(), Some(6));
        assert_eq!(source.next_packet(&mut buf).unwrap(), Some(4));
    }

    #[test]
    fn sinks_and_sources_use_queue_file_names() {
        let dir = std::env::temp_dir().join(format!("burstq-io-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut sinks = create_sinks(&dir, "dma_data_", 2).unwrap();
        sinks[1].write_all(b"xyz").unwrap();
        drop(sinks);

        assert_eq!(queue_file(&dir, "dma_data_", 1), dir.join("dma_data_1.dat"));
        assert_eq!(std::fs::read(dir.join("dma_data_0.dat")).unwrap(), b"");
        assert_eq!(std::fs::read(dir.join("dma_data_1.dat")).unwrap(), b"xyz");

        let mut sources = open_sources(&dir, "dma_data_", 2, 2).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(sources[1].next_packet(&mut buf).unwrap(), Some(2));
        assert_eq!(sources[0].next_packet(&mut buf).unwrap(), None);

        let err = open_sources(&dir, "missing_", 1, 2).unwrap_err();
        assert_eq!(err.path, dir.join("missing_0.dat"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
