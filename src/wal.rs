use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::model::{Event, Ms};

/// Leading bytes of every ledger log.
const MAGIC: &[u8; 8] = b"CSLWAL01";

/// Anything longer is treated as a corrupt length prefix.
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

/// A logged event with its sequence number and commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub seq: u64,
    pub at: Ms,
    pub event: Event,
}

fn encode_record(writer: &mut impl Write, record: &Record) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Result of reading a log from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<Record>,
    /// Byte offset just past the last valid record.
    pub valid_len: u64,
    /// True when bytes after `valid_len` were discarded (torn or corrupt tail).
    pub torn_tail: bool,
}

impl Replay {
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.records.iter().map(|r| &r.event)
    }
}

/// Append-only ledger log.
///
/// File layout: `MAGIC` followed by entries `[u32: len][bincode: Record][u32: crc32]`.
/// A torn or corrupt tail is cut off when the log is opened, so new appends
/// always follow the last good record.
///
/// Appends are all-or-nothing per batch: a failed write is truncated back to
/// the last synced length. If even that fails the log is poisoned and refuses
/// further appends until the next compaction rewrites it.
pub struct Wal {
    file: File,
    path: PathBuf,
    next_seq: u64,
    /// File length after the last successful sync.
    committed_len: u64,
    appends_since_compact: u64,
    poisoned: bool,
}

impl Wal {
    /// Open (or create) the log at `path`, returning it with its replayed contents.
    pub fn open(path: &Path) -> io::Result<(Self, Replay)> {
        let replay = Self::replay(path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if replay.valid_len == 0 {
            file.set_len(0)?;
            file.write_all(MAGIC)?;
            file.sync_all()?;
        } else if replay.torn_tail {
            tracing::warn!(
                "{}: discarding torn tail after byte {}",
                path.display(),
                replay.valid_len
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let committed_len = file.seek(SeekFrom::End(0))?;

        let next_seq = replay.records.last().map_or(1, |r| r.seq + 1);
        Ok((
            Self {
                file,
                path: path.to_path_buf(),
                next_seq,
                committed_len,
                appends_since_compact: 0,
                poisoned: false,
            },
            replay,
        ))
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event, at: Ms) -> io::Result<()> {
        self.append_batch(std::iter::once(event), at).map(|_| ())
    }

    /// Append `events` with one write and one fsync. Either every event is
    /// durable or the file is left exactly as it was. Returns the count written.
    pub fn append_batch<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a Event>,
        at: Ms,
    ) -> io::Result<u64> {
        if self.poisoned {
            return Err(io::Error::other(format!(
                "{}: log poisoned by an earlier failed rollback",
                self.path.display()
            )));
        }

        let mut buf = Vec::new();
        let mut seq = self.next_seq;
        for event in events {
            let record = Record {
                seq,
                at,
                event: event.clone(),
            };
            encode_record(&mut buf, &record)?;
            seq += 1;
        }

        if let Err(e) = self.write_synced(&buf) {
            self.rollback();
            return Err(e);
        }
        let count = seq - self.next_seq;
        self.committed_len += buf.len() as u64;
        self.next_seq = seq;
        self.appends_since_compact += count;
        Ok(count)
    }

    fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.committed_len))?;
        self.file.write_all(buf)?;
        self.file.sync_all()
    }

    /// Cut anything past the last synced record.
    fn rollback(&mut self) {
        let result = self
            .file
            .set_len(self.committed_len)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = result {
            error!(
                "{}: rollback to byte {} failed, refusing further appends: {e}",
                self.path.display(),
                self.committed_len
            );
            self.poisoned = true;
        }
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as `events` (a minimal rebuild of current state) and reopen it.
    /// Sequence numbers restart at 1.
    pub fn compact(&mut self, events: &[Event], at: Ms) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(MAGIC)?;
            for (i, event) in events.iter().enumerate() {
                let record = Record {
                    seq: i as u64 + 1,
                    at,
                    event: event.clone(),
                };
                encode_record(&mut writer, &record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.committed_len = file.seek(SeekFrom::End(0))?;
        self.file = file;
        self.next_seq = events.len() as u64 + 1;
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Read every valid record. Stops at the first truncated or corrupt entry.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        match reader.read_exact(&mut magic) {
            Ok(()) if &magic == MAGIC => {}
            Ok(()) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: not a ledger log", path.display()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Replay {
                    torn_tail: file_len > 0,
                    ..Replay::default()
                });
            }
            Err(e) => return Err(e),
        }

        let mut replay = Replay {
            valid_len: MAGIC.len() as u64,
            ..Replay::default()
        };
        while let Some((record, size)) = read_record(&mut reader)? {
            replay.records.push(record);
            replay.valid_len += size;
        }
        replay.torn_tail = replay.valid_len < file_len;
        Ok(replay)
    }
}

/// `Ok(None)` on clean EOF, truncation, bad CRC or undecodable payload.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Record, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Record>(&payload) {
        Ok(record) => Ok(Some((record, 8 + u64::from(len)))),
        Err(_) => Ok(None),
    }
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
