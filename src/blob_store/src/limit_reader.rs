use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Take};
use std::path::Path;

/// A reader that stops after a fixed number of bytes.
///
/// Wraps `Read::take()` so ranged blob reads hand out a single boxed type.
pub struct LimitReader {
    inner: Take<Box<dyn Read + Send>>,
}

impl LimitReader {
    pub fn from_reader(reader: Box<dyn Read + Send>, size: u64) -> Self {
        Self {
            inner: reader.take(size),
        }
    }

    /// Open a segment of a file: seek to `start`, then read at most `size` bytes.
    pub fn from_file<P: AsRef<Path>>(path: P, start: u64, size: u64) -> std::io::Result<Self> {
        let file = open_file_segment(path, start, size)?;
        Ok(Self::from_reader(Box::new(file), size))
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit()
    }

    pub fn into_inner(self) -> Take<Box<dyn Read + Send>> {
        self.inner
    }
}

pub fn open_file_segment<P: AsRef<Path>>(path: P, start: u64, size: u64) -> std::io::Result<Take<File>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    Ok(file.take(size))
}

impl Read for LimitReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_limit_reader_from_reader() {
        let cursor = std::io::Cursor::new(b"hello-world".to_vec());
        let mut reader = LimitReader::from_reader(Box::new(cursor), 5);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello".to_vec());
    }

    #[test]
    fn test_open_file_segment() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("segment.bin");
        std::fs::write(&file_path, b"0123456789").unwrap();

        let mut reader = LimitReader::from_file(&file_path, 3, 4).unwrap();
        assert_eq!(reader.limit(), 4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"3456".to_vec());
    }
}
