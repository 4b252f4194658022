//! Streaming bucket file iterators.
//!
//! Bucket files are XDR record streams (RFC 5531 record marking: each
//! record is preceded by a 4-byte big-endian mark whose high bit flags
//! the last fragment and whose low 31 bits carry the record length).
//! The content hash of a bucket is the SHA-256 of this framed stream,
//! so both iterators hash incrementally as they go.
//!
//! [`BucketInputIterator`] reads entries in stored order, swallowing and
//! exposing the leading META record. Reopening the file restarts the
//! stream, which is what makes merges resumable from scratch.
//!
//! [`BucketOutputIterator`] writes entries in ascending key order
//! through a single-entry buffer: putting an entry with the same key as
//! the buffered one replaces it (last writer wins), which is counted as
//! a buffer update without an actual write.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use stellar_xdr::curr::{BucketMetadata, BucketMetadataExt};

use hayashi_common::Hash256;

use crate::counters::MergeCounters;
use crate::entry::{compare_entries, BucketEntry};
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};

/// Read one framed record. Returns `None` at a clean EOF.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut mark = [0u8; 4];
    match reader.read_exact(&mut mark) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BucketError::Io(e)),
    }
    let len = (u32::from_be_bytes(mark) & 0x7fff_ffff) as usize;
    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .map_err(|e| BucketError::BucketCorrupt(format!("truncated record: {e}")))?;
    Ok(Some(data))
}

/// Frame and write one record, returning the bytes consumed on disk.
fn write_record<W: Write>(writer: &mut W, data: &[u8]) -> Result<usize> {
    let mark = data.len() as u32 | 0x8000_0000;
    writer.write_all(&mark.to_be_bytes())?;
    writer.write_all(data)?;
    Ok(4 + data.len())
}

/// Streaming reader over a bucket file.
pub struct BucketInputIterator {
    reader: Option<BufReader<File>>,
    path: Option<PathBuf>,
    current: Option<BucketEntry>,
    metadata: Option<BucketMetadata>,
    seen_non_meta: bool,
    hasher: Sha256,
    entries_read: usize,
}

impl BucketInputIterator {
    /// Open a bucket file and position the iterator at the first
    /// non-META entry. The META record, if present, must come first and
    /// appear exactly once.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut iter = Self {
            reader: Some(BufReader::new(file)),
            path: Some(path),
            current: None,
            metadata: None,
            seen_non_meta: false,
            hasher: Sha256::new(),
            entries_read: 0,
        };
        iter.load_next()?;
        Ok(iter)
    }

    /// An iterator over the empty bucket.
    pub fn empty() -> Self {
        Self {
            reader: None,
            path: None,
            current: None,
            metadata: None,
            seen_non_meta: false,
            hasher: Sha256::new(),
            entries_read: 0,
        }
    }

    fn load_next(&mut self) -> Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            self.current = None;
            return Ok(());
        };
        loop {
            match read_record(reader)? {
                None => {
                    self.current = None;
                    return Ok(());
                }
                Some(data) => {
                    self.hasher
                        .update((data.len() as u32 | 0x8000_0000).to_be_bytes());
                    self.hasher.update(&data);

                    let entry = BucketEntry::from_xdr(&data)?;
                    if let BucketEntry::Metadata(meta) = entry {
                        if self.metadata.is_some() {
                            return Err(BucketError::BucketCorrupt(
                                "more than one META record".into(),
                            ));
                        }
                        if self.seen_non_meta {
                            return Err(BucketError::BucketCorrupt(
                                "META record not first".into(),
                            ));
                        }
                        self.metadata = Some(meta);
                        continue;
                    }
                    self.seen_non_meta = true;
                    self.entries_read += 1;
                    self.current = Some(entry);
                    return Ok(());
                }
            }
        }
    }

    /// The entry under the cursor, without advancing.
    pub fn peek(&self) -> Option<&BucketEntry> {
        self.current.as_ref()
    }

    pub fn has_next(&self) -> bool {
        self.current.is_some()
    }

    /// Take the current entry and advance.
    pub fn next_entry(&mut self) -> Result<Option<BucketEntry>> {
        let current = self.current.take();
        if current.is_some() {
            self.load_next()?;
        }
        Ok(current)
    }

    /// Advance, discarding the current entry.
    pub fn advance(&mut self) -> Result<()> {
        self.next_entry()?;
        Ok(())
    }

    /// The bucket's META record, if one was present.
    pub fn metadata(&self) -> Option<&BucketMetadata> {
        self.metadata.as_ref()
    }

    /// The protocol version the bucket was written at. Buckets without a
    /// META record report 0 (pre-INIT/META format).
    pub fn protocol_version(&self) -> u32 {
        self.metadata.as_ref().map_or(0, |m| m.ledger_version)
    }

    pub fn entries_read(&self) -> usize {
        self.entries_read
    }

    /// Drain the stream and return the hash of everything read,
    /// including the META record. Used to verify a file against its
    /// content-addressed name.
    pub fn drain_and_hash(mut self) -> Result<(Hash256, usize)> {
        while self.next_entry()?.is_some() {}
        let count = self.entries_read + usize::from(self.metadata.is_some());
        Ok((Hash256::from_bytes(self.hasher.finalize().into()), count))
    }

    /// Collect the remaining entries. Test and survey helper; the merge
    /// path never materializes a whole bucket.
    pub fn collect_remaining(mut self) -> Result<Vec<BucketEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl std::fmt::Debug for BucketInputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketInputIterator")
            .field("path", &self.path)
            .field("entries_read", &self.entries_read)
            .field("has_current", &self.current.is_some())
            .finish()
    }
}

/// Streaming writer producing a new bucket file.
pub struct BucketOutputIterator {
    writer: BufWriter<File>,
    path: PathBuf,
    buffer: Option<BucketEntry>,
    keep_tombstones: bool,
    wrote_metadata: bool,
    hasher: Sha256,
    records_written: usize,
}

impl BucketOutputIterator {
    /// Start writing a bucket at `path`. When `protocol` is at or after
    /// the INIT/META gate, a META record carrying `protocol` is written
    /// up front.
    pub fn new(path: impl AsRef<Path>, protocol: u32, keep_tombstones: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut out = Self {
            writer: BufWriter::new(file),
            path,
            buffer: None,
            keep_tombstones,
            wrote_metadata: false,
            hasher: Sha256::new(),
            records_written: 0,
        };
        if protocol >= FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY {
            let meta = BucketEntry::Metadata(BucketMetadata {
                ledger_version: protocol,
                ext: BucketMetadataExt::V0,
            });
            out.write_raw(&meta)?;
            out.wrote_metadata = true;
        }
        Ok(out)
    }

    fn write_raw(&mut self, entry: &BucketEntry) -> Result<()> {
        let data = entry.to_xdr()?;
        self.hasher
            .update((data.len() as u32 | 0x8000_0000).to_be_bytes());
        self.hasher.update(&data);
        write_record(&mut self.writer, &data)?;
        self.records_written += 1;
        Ok(())
    }

    fn flush_buffer(&mut self, mc: &mut MergeCounters) -> Result<()> {
        if let Some(entry) = self.buffer.take() {
            mc.output_iterator_actual_writes += 1;
            self.write_raw(&entry)?;
        }
        Ok(())
    }

    /// Stage an entry for writing. Entries must arrive in ascending key
    /// order; an entry equal in key to the staged one replaces it.
    pub fn put(&mut self, entry: BucketEntry, mc: &mut MergeCounters) -> Result<()> {
        if entry.is_dead() && !self.keep_tombstones {
            mc.output_iterator_tombstone_elisions += 1;
            return Ok(());
        }
        if let Some(buffered) = &self.buffer {
            match compare_entries(buffered, &entry) {
                std::cmp::Ordering::Less => {
                    self.flush_buffer(mc)?;
                }
                std::cmp::Ordering::Equal => {
                    // Replacement: fall through to overwrite the buffer.
                }
                std::cmp::Ordering::Greater => {
                    return Err(BucketError::Serialization(
                        "entries put out of order".into(),
                    ));
                }
            }
        }
        mc.output_iterator_buffer_updates += 1;
        self.buffer = Some(entry);
        Ok(())
    }

    /// Flush, close the file, and return `(path, content hash, record
    /// count)`. A count of zero means nothing at all was written and the
    /// caller should discard the file in favor of the empty bucket.
    pub fn finish(mut self, mc: &mut MergeCounters) -> Result<(PathBuf, Hash256, usize)> {
        self.flush_buffer(mc)?;
        self.writer.flush()?;
        let hash = Hash256::from_bytes(self.hasher.finalize().into());
        Ok((self.path, hash, self.records_written))
    }

    pub fn wrote_metadata(&self) -> bool {
        self.wrote_metadata
    }
}
