use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one event as `[len][bincode][crc32]`.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Frame {
    /// A decoded event and the number of bytes its frame occupied.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Partial or corrupt entry; everything from here on is dropped.
    Torn(&'static str),
}

fn read_u32(reader: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let Some(len) = read_u32(reader)? else {
        return Ok(Frame::End);
    };

    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Frame::Torn("truncated payload")),
        Err(e) => return Err(e),
    }

    let Some(stored_crc) = read_u32(reader)? else {
        return Ok(Frame::Torn("truncated checksum"));
    };
    if stored_crc != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }

    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, 8 + u64::from(len))),
        Err(_) => Ok(Frame::Torn("undecodable payload")),
    }
}

/// Append-only write-ahead log of room, user and booking events.
///
/// Entry format: `[u32: len][bincode: Event][u32: crc32]`, little-endian.
/// `len` counts payload bytes only. A torn tail from a crash is detected by
/// the length prefix or checksum and cut off on replay, so later appends
/// land directly after the last intact entry.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. Production goes through the group-commit
    /// writer (`append_buffered` + `flush_sync`).
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event. A missing file is an empty log. A torn tail
    /// is truncated away before returning.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact = 0u64;

        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, size) => {
                    events.push(event);
                    intact += size;
                }
                Frame::End => break,
                Frame::Torn(why) => {
                    tracing::warn!(
                        path = %path.display(),
                        recovered = events.len(),
                        offset = intact,
                        "discarding WAL tail: {why}"
                    );
                    drop(reader);
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(intact)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        Ok(events)
    }
}
