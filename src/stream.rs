//! Stream abstraction (spec.md §4.C).
//!
//! A stream is polymorphic over `{read, write, seek, size, truncate,
//! flush}`. Concrete stream kinds (`FileBackedObject`, `ZipFileSegment`,
//! `ImageStream`, `MapStream`, symbolic streams) all implement [`Aff4Stream`]
//! on top of `std::io::{Read, Write, Seek}`.

use std::io::{self, Read, Seek, Write};

use crate::error::{Aff4Error, Aff4Result};

/// A library-wide cap on a single `Read` call, matching the C++ library's
/// 100 MiB guard against runaway allocations (spec.md §4.C).
pub const MAX_READ_LEN: usize = 100 * 1024 * 1024;

/// The default bulk-copy buffer size (spec.md §4.C: "32 KiB or larger").
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Capability flags a stream exposes about itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamProperties {
    pub seekable: bool,
    pub sizeable: bool,
    pub writable: bool,
}

/// Callback invoked between bulk-copy iterations; returning `false` aborts
/// the operation with [`Aff4Error::Aborted`].
pub trait ProgressContext {
    fn report(&mut self, readptr: u64) -> bool {
        let _ = readptr;
        true
    }
}

/// A progress context that never aborts and does not report.
pub struct EmptyProgress;
impl ProgressContext for EmptyProgress {}

/// Common contract every AFF4 byte stream implements, layered over
/// `std::io::{Read, Write, Seek}`.
pub trait Aff4Stream: Read + Write + Seek {
    fn properties(&self) -> StreamProperties;

    /// Total number of bytes used in the stream, if known.
    fn size(&self) -> Aff4Result<u64>;

    /// Reset content and read pointer to 0; fails if not seekable.
    fn truncate(&mut self) -> Aff4Result<()>;

    /// A stream may rebind its backing volume only at a consistent
    /// checkpoint (spec.md §4.C, §5). Default: never switchable.
    fn can_switch_volume(&self) -> bool {
        false
    }
}

/// Copies up to `length` bytes from `src` (at its current position) into
/// `dst`, reporting progress every [`COPY_BUFFER_SIZE`]-ish chunk.
pub fn copy_to_stream<R: Read, W: Write>(
    src: &mut R,
    dst: &mut W,
    length: u64,
    progress: &mut dyn ProgressContext,
) -> Aff4Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut remaining = length;
    let mut total = 0u64;
    while remaining > 0 {
        let want = std::cmp::min(remaining, buf.len() as u64) as usize;
        let n = src.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
        remaining -= n as u64;
        if !progress.report(total) {
            return Err(Aff4Error::Aborted);
        }
    }
    Ok(total)
}

/// Copies the entirety of `src` into `dst`, from `src`'s current position
/// to EOF (the opposite of [`copy_to_stream`]).
pub fn write_stream<R: Read, W: Write>(
    src: &mut R,
    dst: &mut W,
    progress: &mut dyn ProgressContext,
) -> Aff4Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
        if !progress.report(total) {
            return Err(Aff4Error::Aborted);
        }
    }
    Ok(total)
}

/// Translate a `SeekFrom`-style request, clamping negative absolute
/// offsets to 0 per spec.md §4.C.
pub fn clamp_seek(new_pos: i64) -> u64 {
    if new_pos < 0 {
        0
    } else {
        new_pos as u64
    }
}

pub(crate) fn invalid_input(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct CountingProgress {
        calls: u32,
        abort_after: Option<u32>,
    }
    impl ProgressContext for CountingProgress {
        fn report(&mut self, _readptr: u64) -> bool {
            self.calls += 1;
            match self.abort_after {
                Some(n) if self.calls >= n => false,
                _ => true,
            }
        }
    }

    #[test]
    fn copy_to_stream_moves_bytes() {
        let mut src = Cursor::new(vec![1u8; 100]);
        let mut dst = Vec::new();
        let mut progress = EmptyProgress;
        let n = copy_to_stream(&mut src, &mut dst, 100, &mut progress).unwrap();
        assert_eq!(n, 100);
        assert_eq!(dst.len(), 100);
    }

    #[test]
    fn copy_to_stream_aborts_on_false_report() {
        let mut src = Cursor::new(vec![1u8; COPY_BUFFER_SIZE * 4]);
        let mut dst = Vec::new();
        let mut progress = CountingProgress {
            calls: 0,
            abort_after: Some(2),
        };
        let result = copy_to_stream(
            &mut src,
            &mut dst,
            (COPY_BUFFER_SIZE * 4) as u64,
            &mut progress,
        );
        assert!(matches!(result, Err(Aff4Error::Aborted)));
    }

    #[test]
    fn clamp_seek_floors_at_zero() {
        assert_eq!(clamp_seek(-5), 0);
        assert_eq!(clamp_seek(5), 5);
    }
}
