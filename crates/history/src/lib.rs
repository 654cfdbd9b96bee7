//! The history database: message-ID hash → storage token, plus the
//! duplicate-suppression verdict cache.
//!
//! On disk this is a single append-only text file, one record per line:
//!
//! ```text
//! [HEX-HASH]\t<arrived>~<expires|->~<posted>\t<token>\n
//! ```
//!
//! Remembered entries (trash, cancels for articles we never saw) omit the
//! token field. Offsets into the text file stay stable forever, so the
//! lookup index can be rebuilt from a single sequential read at open; the
//! in-memory map here stands in for the memory-mapped hashed index of the
//! traditional layout.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use msgid::MsgidHash;
use storage::Token;

const CACHE_SLOTS: usize = 16 * 1024;
const STATS_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed history record at offset {0}")]
    BadRecord(u64),
    #[error(transparent)]
    BadToken(#[from] storage::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One parsed history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub hash: MsgidHash,
    pub arrived: i64,
    /// Absent is the `-` sentinel on disk, never zero.
    pub expires: Option<i64>,
    pub posted: i64,
    /// `None` for remembered entries.
    pub token: Option<Token>,
}

// Direct-mapped verdict cache. A slot remembers whether the hash it last
// saw was present in the index, avoiding an index probe per CHECK.
#[derive(Clone, Copy, Default)]
struct CacheSlot {
    tag: u64,
    found: bool,
    valid: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Cache said present, saving an index probe.
    pub hitpos: u64,
    /// Cache said absent, saving an index probe.
    pub hitneg: u64,
    /// Cache missed; the index had it.
    pub missed: u64,
    /// Cache missed; nobody had it.
    pub dne: u64,
}

pub struct History {
    path: PathBuf,
    writer: BufWriter<File>,
    reader: File,
    end: u64,
    index: HashMap<MsgidHash, u64>,
    cache: Vec<CacheSlot>,
    stats: CacheStats,
    dirty: u32,
    sync_count: u32,
    last_stats_log: u64,
}

impl History {
    /// Open (creating if needed) and index the history file.
    pub fn open(path: impl Into<PathBuf>, sync_count: u32) -> Result<History, Error> {
        let path = path.into();
        let mut writer = OpenOptions::new().create(true).append(true).open(&path)?;
        let end = writer.seek(SeekFrom::End(0))?;
        let reader = File::open(&path)?;

        let mut his = History {
            path,
            writer: BufWriter::new(writer),
            reader,
            end,
            index: HashMap::new(),
            cache: vec![CacheSlot::default(); CACHE_SLOTS],
            stats: CacheStats::default(),
            dirty: 0,
            sync_count: sync_count.max(1),
            last_stats_log: now_secs(),
        };
        his.load_index()?;
        Ok(his)
    }

    fn load_index(&mut self) -> Result<(), Error> {
        let mut text = Vec::with_capacity(self.end as usize);
        let mut f = File::open(&self.path)?;
        f.read_to_end(&mut text)?;
        let mut start = 0usize;
        for nl in memchr::memchr_iter(b'\n', &text) {
            let entry = parse_record(&text[start..nl], start as u64)?;
            self.index.insert(entry.hash, start as u64);
            start = nl + 1;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Has this ID been seen? Consults the verdict cache first; logs the
    /// cache statistics once an hour.
    pub fn have(&mut self, hash: MsgidHash) -> bool {
        let now = now_secs();
        if now.saturating_sub(self.last_stats_log) >= STATS_INTERVAL_SECS {
            let s = self.stats;
            tracing::info!(
                hitpos = s.hitpos,
                hitneg = s.hitneg,
                missed = s.missed,
                dne = s.dne,
                "history cache stats"
            );
            self.stats = CacheStats::default();
            self.last_stats_log = now;
        }

        let tag = hash.bucket();
        let slot = (tag as usize) % CACHE_SLOTS;
        let cached = self.cache[slot];
        if cached.valid && cached.tag == tag {
            if cached.found {
                self.stats.hitpos += 1;
            } else {
                self.stats.hitneg += 1;
            }
            return cached.found;
        }

        let found = self.index.contains_key(&hash);
        self.cache[slot] = CacheSlot { tag, found, valid: true };
        if found {
            self.stats.missed += 1;
        } else {
            self.stats.dne += 1;
        }
        found
    }

    /// Fetch the full record for a hash. `Ok(None)` when the ID is unknown.
    pub fn get(&mut self, hash: MsgidHash) -> Result<Option<HistoryEntry>, Error> {
        let Some(&offset) = self.index.get(&hash) else {
            return Ok(None);
        };
        // The record may still be sitting in the write buffer.
        self.writer.flush()?;
        let line = self.read_line_at(offset)?;
        Ok(Some(parse_record(&line, offset)?))
    }

    /// Fetch just the token. `None` for unknown IDs and remembered entries.
    pub fn token_for(&mut self, hash: MsgidHash) -> Result<Option<Token>, Error> {
        Ok(self.get(hash)?.and_then(|e| e.token))
    }

    fn read_line_at(&self, offset: u64) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        let mut pos = offset;
        loop {
            let n = self.reader.read_at(&mut buf, pos)?;
            if n == 0 {
                return Err(Error::BadRecord(offset));
            }
            if let Some(nl) = memchr::memchr(b'\n', &buf[..n]) {
                out.extend_from_slice(&buf[..nl]);
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
            pos += n as u64;
        }
    }

    /// Append a full entry. The caller has already decided this is not a
    /// duplicate; a second write for the same hash simply supersedes the
    /// index slot.
    pub fn write(
        &mut self,
        hash: MsgidHash,
        arrived: i64,
        posted: i64,
        expires: Option<i64>,
        token: Token,
    ) -> Result<(), Error> {
        self.append_record(hash, arrived, posted, expires, Some(token))
    }

    /// Record an ID with no stored article so later offers are refused.
    pub fn remember(&mut self, hash: MsgidHash, arrived: i64) -> Result<(), Error> {
        self.append_record(hash, arrived, arrived, None, None)
    }

    fn append_record(
        &mut self,
        hash: MsgidHash,
        arrived: i64,
        posted: i64,
        expires: Option<i64>,
        token: Option<Token>,
    ) -> Result<(), Error> {
        let offset = self.end;
        let mut line = format!("[{}]\t{}~", hash.to_hex(), arrived);
        match expires {
            Some(e) => line.push_str(&e.to_string()),
            None => line.push('-'),
        }
        line.push('~');
        line.push_str(&posted.to_string());
        if let Some(token) = token {
            line.push('\t');
            line.push_str(&token.to_text());
        }
        line.push('\n');

        self.writer.write_all(line.as_bytes())?;
        self.end += line.len() as u64;
        self.index.insert(hash, offset);

        let tag = hash.bucket();
        self.cache[(tag as usize) % CACHE_SLOTS] = CacheSlot { tag, found: true, valid: true };

        self.dirty += 1;
        if self.dirty >= self.sync_count {
            self.sync()?;
        }
        Ok(())
    }

    /// Flush buffered records to disk.
    pub fn sync(&mut self) -> Result<(), Error> {
        if self.dirty > 0 {
            self.writer.flush()?;
            self.writer.get_ref().sync_data()?;
            self.dirty = 0;
        }
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.stats
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.sync()
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn parse_record(line: &[u8], offset: u64) -> Result<HistoryEntry, Error> {
    let bad = || Error::BadRecord(offset);
    let text = std::str::from_utf8(line).map_err(|_| bad())?;
    let mut fields = text.split('\t');

    let hash_field = fields.next().ok_or_else(bad)?;
    let hash_hex = hash_field
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .ok_or_else(bad)?;
    let hash = MsgidHash::from_hex(hash_hex).map_err(|_| bad())?;

    let times = fields.next().ok_or_else(bad)?;
    let mut parts = times.split('~');
    let arrived = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let expires = match parts.next().ok_or_else(bad)? {
        "-" => None,
        s => Some(s.parse().map_err(|_| bad())?),
    };
    let posted = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;

    let token = match fields.next() {
        None | Some("") => None,
        Some(text) => Some(Token::from_text(text)?),
    };

    Ok(HistoryEntry { hash, arrived, expires, posted, token })
}

#[cfg(test)]
mod test {
    use super::*;

    fn hash(id: &str) -> MsgidHash {
        MsgidHash::of(id)
    }

    #[test]
    fn write_then_have_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        let mut his = History::open(&path, 100).unwrap();

        let h = hash("<a@b>");
        assert!(!his.have(h));

        let token = Token::new(1, 7, 0);
        his.write(h, 1000, 900, Some(2000), token).unwrap();
        assert!(his.have(h));

        let entry = his.get(h).unwrap().unwrap();
        assert_eq!(entry.arrived, 1000);
        assert_eq!(entry.posted, 900);
        assert_eq!(entry.expires, Some(2000));
        assert_eq!(entry.token, Some(token));
        assert_eq!(his.token_for(h).unwrap(), Some(token));
    }

    #[test]
    fn remembered_entries_have_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut his = History::open(dir.path().join("history"), 100).unwrap();

        let h = hash("<trash@example>");
        his.remember(h, 1234).unwrap();
        assert!(his.have(h));

        let entry = his.get(h).unwrap().unwrap();
        assert_eq!(entry.token, None);
        assert_eq!(entry.expires, None);
        assert_eq!(entry.arrived, 1234);
    }

    #[test]
    fn index_rebuilds_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        let token = Token::new(1, 3, 0);
        {
            let mut his = History::open(&path, 1).unwrap();
            his.write(hash("<a@b>"), 10, 9, None, token).unwrap();
            his.remember(hash("<c@d>"), 11).unwrap();
            his.close().unwrap();
        }
        let mut his = History::open(&path, 1).unwrap();
        assert_eq!(his.len(), 2);
        assert!(his.have(hash("<a@b>")));
        assert!(his.have(hash("<c@d>")));
        assert!(!his.have(hash("<e@f>")));
        assert_eq!(his.token_for(hash("<a@b>")).unwrap(), Some(token));
    }

    #[test]
    fn cache_tracks_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut his = History::open(dir.path().join("history"), 100).unwrap();

        let h = hash("<a@b>");
        assert!(!his.have(h));
        assert!(!his.have(h));
        let stats = his.cache_stats();
        assert_eq!(stats.dne, 1);
        assert_eq!(stats.hitneg, 1);

        his.write(h, 1, 1, None, Token::new(1, 0, 0)).unwrap();
        assert!(his.have(h));
        assert_eq!(his.cache_stats().hitpos, 1);
    }
}
