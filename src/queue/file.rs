//! File-backed durable queue.
//!
//! Layout: one directory per backend holding an append-only `records.log`
//! and a `records.pos` cursor. The log starts with an 8-byte file type
//! identifier followed by framed records, each `[crc32][len][payload]` with
//! the two integers big-endian. Appends are fsync'd before they are
//! acknowledged. The cursor file persists the byte offset of the current
//! head; it is rewritten and fsync'd on every dequeue. A crash between a
//! delivery and the cursor write re-delivers the head record (at-least-once).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

use super::{DurableQueue, QueueError, Result};

/// The first bytes written into a queue log to identify it and its version.
const FILE_TYPE_IDENTIFIER: &[u8] = b"chrq.001";
const HEADER_LEN: u64 = 8;
/// crc32 + payload length, both u32 big-endian.
const FRAME_HEADER_LEN: u64 = 8;

const LOG_FILE: &str = "records.log";
const CURSOR_FILE: &str = "records.pos";

pub struct FileQueue {
    dir: PathBuf,
    inner: Mutex<Inner>,
    length: AtomicU64,
}

struct Inner {
    log: File,
    read_offset: u64,
    write_offset: u64,
    count: u64,
    next_position: u64,
}

impl FileQueue {
    /// Open (or create) the queue rooted at `dir`, scanning forward from the
    /// persisted cursor to restore the record count. A torn or corrupt tail
    /// is truncated away.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        // fsync the directory so a crash cannot lose the files created in it
        File::open(&dir)?.sync_all()?;

        let log_path = dir.join(LOG_FILE);
        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        let log_len = log.metadata()?.len();
        if log_len < HEADER_LEN {
            // Empty, or a crash landed mid-header: start the log fresh.
            log.set_len(0)?;
            log.seek(SeekFrom::Start(0))?;
            log.write_all(FILE_TYPE_IDENTIFIER)?;
            log.sync_all()?;
        } else {
            let mut identifier = [0u8; HEADER_LEN as usize];
            log.seek(SeekFrom::Start(0))?;
            log.read_exact(&mut identifier)?;
            if identifier != FILE_TYPE_IDENTIFIER {
                return Err(QueueError::InvalidFile {
                    path: log_path,
                    reason: format!("expected file type identifier {:?}", FILE_TYPE_IDENTIFIER),
                });
            }
        }
        let log_len = log.metadata()?.len();

        let read_offset = read_cursor(&dir.join(CURSOR_FILE))
            .unwrap_or(HEADER_LEN)
            .clamp(HEADER_LEN, log_len);

        // Scan from the cursor to the end, counting records and dropping any
        // torn tail left by a crash mid-append.
        let mut count = 0u64;
        let mut offset = read_offset;
        loop {
            match read_frame(&mut log, offset) {
                Ok(Some((_, frame_len))) => {
                    count += 1;
                    offset += frame_len;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        path = %log_path.display(),
                        offset,
                        error = %e,
                        "truncating queue log at corrupt record"
                    );
                    log.set_len(offset)?;
                    log.sync_all()?;
                    break;
                }
            }
        }

        let queue = Self {
            dir,
            length: AtomicU64::new(count),
            inner: Mutex::new(Inner {
                log,
                read_offset,
                write_offset: offset,
                count,
                next_position: count,
            }),
        };
        Ok(queue)
    }

    fn persist_cursor(&self, offset: u64) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.dir.join(CURSOR_FILE))?;
        f.write_u64::<BigEndian>(offset)?;
        f.sync_all()?;
        Ok(())
    }
}

impl DurableQueue for FileQueue {
    fn enqueue(&self, record: &[u8]) -> Result<u64> {
        let len = u32::try_from(record.len())
            .map_err(|_| QueueError::RecordTooLarge { size: record.len() })?;

        let mut hasher = Hasher::new();
        hasher.update(record);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + record.len());
        frame
            .write_u32::<BigEndian>(checksum)
            .expect("cannot fail to write to buffer");
        frame
            .write_u32::<BigEndian>(len)
            .expect("cannot fail to write to buffer");
        frame.extend_from_slice(record);

        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let write_offset = inner.write_offset;
        inner.log.seek(SeekFrom::Start(write_offset))?;
        inner.log.write_all(&frame)?;
        inner.log.sync_all()?;

        inner.write_offset += frame.len() as u64;
        inner.count += 1;
        let position = inner.next_position;
        inner.next_position += 1;
        self.length.store(inner.count, Ordering::Release);
        Ok(position)
    }

    fn peek(&self) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.count == 0 {
            return Ok(None);
        }

        let offset = inner.read_offset;
        match read_frame(&mut inner.log, offset)? {
            Some((payload, _)) => Ok(Some(Bytes::from(payload))),
            None => Err(QueueError::CorruptRecord {
                offset,
                reason: "head record missing from log".to_string(),
            }),
        }
    }

    fn dequeue(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.count == 0 {
            return Ok(());
        }

        let offset = inner.read_offset;
        inner.log.seek(SeekFrom::Start(offset))?;
        let _checksum = inner.log.read_u32::<BigEndian>()?;
        let len = inner.log.read_u32::<BigEndian>()?;

        inner.read_offset = offset + FRAME_HEADER_LEN + u64::from(len);
        inner.count -= 1;

        if inner.count == 0 {
            // Drained: shrink the log back to its header so the file does
            // not grow without bound.
            inner.log.set_len(HEADER_LEN)?;
            inner.log.sync_all()?;
            inner.read_offset = HEADER_LEN;
            inner.write_offset = HEADER_LEN;
        }

        self.persist_cursor(inner.read_offset)?;
        self.length.store(inner.count, Ordering::Release);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }
}

/// Read one frame at `offset`. `Ok(None)` means a clean end of log;
/// corruption and partial frames are errors.
fn read_frame(log: &mut File, offset: u64) -> Result<Option<(Vec<u8>, u64)>> {
    log.seek(SeekFrom::Start(offset))?;

    let expected_checksum = match log.read_u32::<BigEndian>() {
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        other => other?,
    };
    let len = match log.read_u32::<BigEndian>() {
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(QueueError::CorruptRecord {
                offset,
                reason: "frame header cut short".to_string(),
            })
        }
        other => other?,
    };

    let mut payload = vec![0u8; len as usize];
    if let Err(e) = log.read_exact(&mut payload) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(QueueError::CorruptRecord {
                offset,
                reason: format!("payload cut short, expected {} bytes", len),
            });
        }
        return Err(e.into());
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let actual_checksum = hasher.finalize();
    if actual_checksum != expected_checksum {
        return Err(QueueError::CorruptRecord {
            offset,
            reason: format!(
                "checksum mismatch: expected {}, got {}",
                expected_checksum, actual_checksum
            ),
        });
    }

    Ok(Some((payload, FRAME_HEADER_LEN + u64::from(len))))
}

fn read_cursor(path: &Path) -> Option<u64> {
    let mut f = File::open(path).ok()?;
    f.read_u64::<BigEndian>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();

        assert_eq!(queue.enqueue(b"first").unwrap(), 0);
        assert_eq!(queue.enqueue(b"second").unwrap(), 1);
        assert_eq!(queue.len(), 2);

        assert_eq!(&queue.peek().unwrap().unwrap()[..], b"first");
        // peek does not consume
        assert_eq!(&queue.peek().unwrap().unwrap()[..], b"first");

        queue.dequeue().unwrap();
        assert_eq!(&queue.peek().unwrap().unwrap()[..], b"second");
        queue.dequeue().unwrap();
        assert_eq!(queue.len(), 0);
        assert!(queue.peek().unwrap().is_none());
    }

    #[test]
    fn dequeue_on_empty_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        queue.dequeue().unwrap();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let queue = FileQueue::open(dir.path()).unwrap();
            queue.enqueue(b"one").unwrap();
            queue.enqueue(b"two").unwrap();
            queue.enqueue(b"three").unwrap();
            queue.dequeue().unwrap();
        }

        let queue = FileQueue::open(dir.path()).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(&queue.peek().unwrap().unwrap()[..], b"two");
        queue.dequeue().unwrap();
        assert_eq!(&queue.peek().unwrap().unwrap()[..], b"three");
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();

        {
            let queue = FileQueue::open(dir.path()).unwrap();
            queue.enqueue(b"intact").unwrap();
        }

        // Simulate a crash mid-append: a frame header with no payload.
        let log_path = dir.path().join(LOG_FILE);
        let mut log = OpenOptions::new().append(true).open(&log_path).unwrap();
        log.write_all(&[0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00, 0x00, 0x10])
            .unwrap();
        drop(log);

        let queue = FileQueue::open(dir.path()).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(&queue.peek().unwrap().unwrap()[..], b"intact");

        // The log is usable for appends again.
        queue.enqueue(b"after").unwrap();
        queue.dequeue().unwrap();
        assert_eq!(&queue.peek().unwrap().unwrap()[..], b"after");
    }

    #[test]
    fn draining_shrinks_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();

        queue.enqueue(&vec![7u8; 4096]).unwrap();
        queue.dequeue().unwrap();

        let log_len = fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();
        assert_eq!(log_len, HEADER_LEN);

        queue.enqueue(b"fresh").unwrap();
        assert_eq!(&queue.peek().unwrap().unwrap()[..], b"fresh");
    }

    #[test]
    fn rejects_foreign_log_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE), b"not a queue log").unwrap();
        assert!(matches!(
            FileQueue::open(dir.path()),
            Err(QueueError::InvalidFile { .. })
        ));
    }

    #[test]
    fn opaque_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();

        let record: Vec<u8> = (0..=255).collect();
        queue.enqueue(&record).unwrap();
        assert_eq!(&queue.peek().unwrap().unwrap()[..], &record[..]);
    }
}
