use super::*;
use bytes::Bytes;
use memmap::Mmap;
use std::{fs::File, io::SeekFrom, path::Path};

/// Lets a read-only memory map back a [[Bytes]] buffer without copying it.
struct MappedFile(Mmap);

impl AsRef<[u8]> for MappedFile {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A seekable, length-bounded reader over an immutable byte buffer.
///
/// The cursor never buffers anything on its own, so the result of every read is fully determined
/// by the current position and the requested length.
/// Reads never return short: asking for more than [[ByteCursor::remaining]] fails with
/// [[FormatError::TruncatedInput]] and leaves the position where it was.
#[derive(Clone, Debug)]
pub struct ByteCursor {
    data: Bytes,
    position: u64,
}

impl ByteCursor {
    /// Memory map the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).context(IoSnafu)?;
        let length = file.metadata().context(IoSnafu)?.len();
        if length == 0 {
            // Mapping an empty file is an error on some platforms.
            return Ok(Self::from_bytes(Bytes::new()));
        }
        let mmap = unsafe { Mmap::map(&file) }.context(IoSnafu)?;
        Ok(Self::from_bytes(Bytes::from_owner(MappedFile(mmap))))
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.len() - self.position
    }

    /// Move to an absolute or relative position.
    ///
    /// Targets outside `[0, len]` are rejected and the position is unchanged.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let length = self.len();
        let target: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => length as i128 + delta as i128,
        };
        ensure!(
            (0..=length as i128).contains(&target),
            SeekOutOfBoundsSnafu { target, length }
        );
        self.position = target as u64;
        Ok(self.position)
    }

    /// Look at the next `n` bytes without moving.
    pub fn peek(&self, n: usize) -> Result<&[u8]> {
        self.ensure_available(self.position, n as u64)?;
        let start = self.position as usize;
        Ok(&self.data[start..start + n])
    }

    /// Take the next `n` bytes as a zero-copy window and advance past them.
    pub fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        let window = self.slice_at(self.position, n)?;
        self.position += n as u64;
        Ok(window)
    }

    /// A window of `n` bytes at an absolute `offset`, regardless of the current position.
    pub fn slice_at(&self, offset: u64, n: usize) -> Result<Bytes> {
        self.ensure_available(offset, n as u64)?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + n))
    }

    fn ensure_available(&self, offset: u64, needed: u64) -> Result<()> {
        let remaining = self.len().saturating_sub(offset);
        ensure!(
            needed <= remaining,
            TruncatedInputSnafu {
                needed,
                remaining,
                position: offset,
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_are_exact_or_fail() {
        let mut cursor = ByteCursor::from_bytes(vec![1u8, 2, 3, 4, 5]);
        assert_eq!(cursor.read_exact(2).unwrap().as_ref(), &[1, 2]);
        assert_eq!(cursor.tell(), 2);
        let err = cursor.read_exact(4).unwrap_err();
        assert!(matches!(
            err,
            FormatError::TruncatedInput {
                needed: 4,
                remaining: 3,
                position: 2,
                ..
            }
        ));
        // A failed read does not move the cursor.
        assert_eq!(cursor.tell(), 2);
        assert_eq!(cursor.read_exact(3).unwrap().as_ref(), &[3, 4, 5]);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn seek_stays_in_bounds() {
        let mut cursor = ByteCursor::from_bytes(vec![0u8; 10]);
        assert_eq!(cursor.seek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(cursor.seek(SeekFrom::Current(3)).unwrap(), 7);
        assert_eq!(cursor.seek(SeekFrom::Current(-7)).unwrap(), 0);
        assert_eq!(cursor.seek(SeekFrom::End(0)).unwrap(), 10);
        assert!(cursor.seek(SeekFrom::Current(1)).is_err());
        assert!(cursor.seek(SeekFrom::End(-11)).is_err());
        assert_eq!(cursor.tell(), 10);
    }

    #[test]
    fn peek_does_not_advance() {
        let cursor = ByteCursor::from_bytes(vec![9u8, 8, 7]);
        assert_eq!(cursor.peek(2).unwrap(), &[9, 8]);
        assert_eq!(cursor.tell(), 0);
        assert!(cursor.peek(4).is_err());
    }

    #[test]
    fn maps_files_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"survey").unwrap();
        file.flush().unwrap();
        let mut cursor = ByteCursor::open(file.path()).unwrap();
        assert_eq!(cursor.len(), 6);
        assert_eq!(cursor.read_exact(6).unwrap().as_ref(), b"survey");

        let empty = tempfile::NamedTempFile::new().unwrap();
        let cursor = ByteCursor::open(empty.path()).unwrap();
        assert!(cursor.is_empty());
    }
}
