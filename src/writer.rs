//! Output sink contract (`spec.md` §6 "Writer contract").
//!
//! `write` returns `Ok(())` or an [`std::io::Error`]; the first write
//! failure is propagated by the [`crate::processor::Processor`] as FATAL and
//! aborts the render (`spec.md` §5: "Writers are owned by the caller... the
//! Processor propagates the first write error as FATAL"). Two concrete sinks
//! are provided as always-available collaborators (grounded on
//! `original_source/src/tengwriter.h`'s `StringWriter_t`/`FileWriter_t`), but
//! the trait itself is the actual Non-goal-scoped contract — hosts are free
//! to implement their own.

use std::fs::File;
use std::io::{self, Write as IoWrite};

/// Sink for rendered bytes. `write` may be called many times per render with
/// no buffering guarantee; implementations that want buffering should wrap
/// an `io::BufWriter` themselves.
pub trait Writer {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Accumulates rendered output in memory.
#[derive(Debug, Default)]
pub struct StringWriter {
    buf: String,
}

impl StringWriter {
    pub fn new() -> Self {
        StringWriter::default()
    }

    pub fn into_string(self) -> String {
        self.buf
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }
}

impl Writer for StringWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                self.buf.push_str(s);
                Ok(())
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes rendered output directly to an open file.
pub struct FileWriter {
    file: File,
}

impl FileWriter {
    pub fn new(file: File) -> Self {
        FileWriter { file }
    }

    pub fn create(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(FileWriter { file: File::create(path)? })
    }
}

impl Writer for FileWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_writer_accumulates() {
        let mut w = StringWriter::new();
        w.write(b"hello ").unwrap();
        w.write(b"world").unwrap();
        assert_eq!(w.into_string(), "hello world");
    }

    #[test]
    fn file_writer_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        {
            let mut w = FileWriter::create(&path).unwrap();
            w.write(b"content").unwrap();
            w.flush().unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "content");
    }
}
