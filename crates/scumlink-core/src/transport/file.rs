//! File backed link
//!
//! Stands in for a serial port during development: bytes the device sends
//! are appended to the inbound file, bytes we send are appended to the
//! outbound file. Whatever was in the inbound file before opening is
//! skipped.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CommunicationChannel, Link};
use crate::protocol::ProtocolError;

/// Paths of the two files making up a file link
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSettings {
    /// Read side (device → host)
    pub inbound: PathBuf,
    /// Write side (host → device)
    pub outbound: PathBuf,
}

/// Channel over an inbound/outbound file pair
pub struct FileChannel {
    inbound: File,
    outbound: File,
}

impl Read for FileChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inbound.read(buf)
    }
}

impl Write for FileChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.outbound.flush()
    }
}

impl CommunicationChannel for FileChannel {
    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.inbound.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(FileChannel {
            inbound: self.inbound.try_clone()?,
            outbound: self.outbound.try_clone()?,
        }))
    }
}

/// [`Link`] over a pair of files
pub struct FileLink {
    settings: FileSettings,
}

impl FileLink {
    /// Link over the files named in `settings`
    pub fn new(settings: FileSettings) -> Self {
        Self { settings }
    }

    /// Paths in use
    pub fn settings(&self) -> &FileSettings {
        &self.settings
    }

    fn open_channel(&self) -> io::Result<FileChannel> {
        let mut inbound = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.settings.inbound)?;
        inbound.seek(SeekFrom::End(0))?;

        let outbound = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.settings.outbound)?;

        Ok(FileChannel { inbound, outbound })
    }
}

impl Link for FileLink {
    fn open(&self) -> Result<Box<dyn CommunicationChannel>, ProtocolError> {
        let channel = self.open_channel().map_err(|e| {
            ProtocolError::ConnectionFailed(format!("{}: {}", self.describe(), e))
        })?;
        debug!("opened file link {}", self.describe());
        Ok(Box::new(channel))
    }

    fn describe(&self) -> String {
        format!(
            "{} <-> {}",
            self.settings.inbound.display(),
            self.settings.outbound.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn settings(dir: &tempfile::TempDir) -> FileSettings {
        FileSettings {
            inbound: dir.path().join("rx.bin"),
            outbound: dir.path().join("tx.bin"),
        }
    }

    #[test]
    fn test_open_creates_missing_files() {
        let dir = tempdir().unwrap();
        let s = settings(&dir);
        FileLink::new(s.clone()).open().unwrap();
        assert!(s.inbound.exists());
        assert!(s.outbound.exists());
    }

    #[test]
    fn test_existing_inbound_content_is_skipped() {
        let dir = tempdir().unwrap();
        let s = settings(&dir);
        fs::write(&s.inbound, b"0,stale;").unwrap();

        let mut channel = FileLink::new(s.clone()).open().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(channel.read(&mut buf).unwrap(), 0);

        let mut writer = OpenOptions::new().append(true).open(&s.inbound).unwrap();
        writer.write_all(b"1;").unwrap();
        let n = channel.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"1;");
    }

    #[test]
    fn test_writes_append_to_outbound() {
        let dir = tempdir().unwrap();
        let s = settings(&dir);
        fs::write(&s.outbound, b"old;").unwrap();

        let mut channel = FileLink::new(s.clone()).open().unwrap();
        channel.write_all(b"0;").unwrap();
        channel.flush().unwrap();
        assert_eq!(fs::read(&s.outbound).unwrap(), b"old;0;".to_vec());
    }

    #[test]
    fn test_open_in_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let link = FileLink::new(FileSettings {
            inbound: dir.path().join("nope/rx.bin"),
            outbound: dir.path().join("nope/tx.bin"),
        });
        assert!(matches!(link.open(), Err(ProtocolError::ConnectionFailed(_))));
    }
}
