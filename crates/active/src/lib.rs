//! The active file: the server-wide registry of newsgroups and their
//! high/low water marks.
//!
//! The file is held in memory as a byte image. Water marks are fixed-width
//! decimal fields rewritten in place inside the image, so the hot path
//! (accepting an article) never moves a byte of any other line; the image
//! is flushed to disk by temp-file-and-rename whenever it is dirty.
//! Structural edits (newgroup, rmgroup, flag changes) rebuild the image
//! and flush immediately.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Width of a water-mark field in lines this crate generates.
pub const MARK_WIDTH: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed active line: {0:?}")]
    BadLine(String),
    #[error("no such newsgroup {0:?}")]
    NoGroup(String),
    #[error("newsgroup {0:?} already exists")]
    GroupExists(String),
    #[error("article number {0} too wide for {1}'s field")]
    MarkTooWide(u64, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Posting disposition parsed from the flag field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupFlag {
    /// `y` — local postings allowed.
    Posting,
    /// `n` — no local postings.
    NoPosting,
    /// `m` — moderated; unapproved articles are rejected.
    Moderated,
    /// `j` — articles are fed to sites but filed into junk.
    Junked,
    /// `x` — no filing at all.
    Excluded,
    /// `=target` — articles are filed in the target group instead.
    Alias(String),
}

impl GroupFlag {
    fn parse(text: &str) -> GroupFlag {
        match text.as_bytes().first() {
            Some(&b'n') => GroupFlag::NoPosting,
            Some(&b'm') => GroupFlag::Moderated,
            Some(&b'j') => GroupFlag::Junked,
            Some(&b'x') => GroupFlag::Excluded,
            Some(&b'=') => GroupFlag::Alias(text[1..].to_string()),
            _ => GroupFlag::Posting,
        }
    }
}

impl fmt::Display for GroupFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupFlag::Posting => f.write_str("y"),
            GroupFlag::NoPosting => f.write_str("n"),
            GroupFlag::Moderated => f.write_str("m"),
            GroupFlag::Junked => f.write_str("j"),
            GroupFlag::Excluded => f.write_str("x"),
            GroupFlag::Alias(t) => write!(f, "={t}"),
        }
    }
}

/// One newsgroup's in-core state.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub last: u64,
    pub low: u64,
    pub flag: GroupFlag,
    /// Scratch flag: has the article being processed already been filed
    /// here (through an alias)?
    pub post_count: u32,
    // Image offsets of the water-mark fields for in-place rewrite.
    last_off: usize,
    last_width: usize,
    low_off: usize,
    low_width: usize,
}

pub struct Active {
    path: PathBuf,
    image: Vec<u8>,
    groups: Vec<Group>,
    by_name: HashMap<String, usize>,
    dirty: u32,
}

impl Active {
    pub fn open(path: impl Into<PathBuf>) -> Result<Active, Error> {
        let path = path.into();
        let image = fs::read(&path)?;
        let (groups, by_name) = parse_image(&image)?;
        Ok(Active { path, image, groups, by_name, dirty: 0 })
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn group(&self, idx: usize) -> &Group {
        &self.groups[idx]
    }

    pub fn group_mut(&mut self, idx: usize) -> &mut Group {
        &mut self.groups[idx]
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Follow a single alias level. Aliases pointing at aliases are a
    /// configuration error and stop at one hop.
    pub fn resolve_alias(&self, idx: usize) -> usize {
        if let GroupFlag::Alias(target) = &self.groups[idx].flag {
            if let Some(t) = self.find(target) {
                return t;
            }
        }
        idx
    }

    /// The raw active image, for LIST.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn dirty(&self) -> bool {
        self.dirty > 0
    }

    /// Assign the next article number in a group, rewriting the high-water
    /// field inside the image.
    pub fn bump_last(&mut self, idx: usize) -> Result<u64, Error> {
        let next = self.groups[idx].last + 1;
        self.set_last(idx, next)?;
        Ok(next)
    }

    /// Adopt a peer-assigned article number: the high mark only ever moves
    /// forward.
    pub fn adopt_last(&mut self, idx: usize, artnum: u64) -> Result<(), Error> {
        if artnum > self.groups[idx].last {
            self.set_last(idx, artnum)?;
        }
        Ok(())
    }

    fn set_last(&mut self, idx: usize, value: u64) -> Result<(), Error> {
        let (off, width, name) = {
            let g = &self.groups[idx];
            (g.last_off, g.last_width, g.name.clone())
        };
        write_mark(&mut self.image[off..off + width], value)
            .ok_or(Error::MarkTooWide(value, name))?;
        self.groups[idx].last = value;
        self.dirty += 1;
        Ok(())
    }

    pub fn set_low(&mut self, idx: usize, value: u64) -> Result<(), Error> {
        let (off, width, name) = {
            let g = &self.groups[idx];
            (g.low_off, g.low_width, g.name.clone())
        };
        write_mark(&mut self.image[off..off + width], value)
            .ok_or(Error::MarkTooWide(value, name))?;
        self.groups[idx].low = value;
        self.dirty += 1;
        Ok(())
    }

    /// Bring a group's marks in line with what overview actually holds.
    /// The high mark never decreases.
    pub fn renumber(
        &mut self,
        idx: usize,
        stats: Option<(u64, u64, usize)>,
    ) -> Result<(), Error> {
        let (cur_last, cur_low, name) = {
            let g = &self.groups[idx];
            (g.last, g.low, g.name.clone())
        };
        let (lo, hi) = match stats {
            Some((lo, hi, count)) if count > 0 => (lo, hi),
            // Empty group: low becomes high + 1.
            _ => (cur_last + 1, cur_last),
        };
        if hi > cur_last {
            tracing::info!(group = %name, from = cur_last, to = hi, "renumber hi");
            self.set_last(idx, hi)?;
        }
        if lo != cur_low {
            tracing::info!(group = %name, from = cur_low, to = lo, "renumber lo");
            self.set_low(idx, lo)?;
        }
        Ok(())
    }

    /// Create a newsgroup. Structural: rebuilds the image and flushes.
    pub fn newgroup(&mut self, name: &str, flag: GroupFlag) -> Result<(), Error> {
        if self.by_name.contains_key(name) {
            return Err(Error::GroupExists(name.to_string()));
        }
        self.groups.push(Group {
            name: name.to_string(),
            last: 0,
            low: 1,
            flag,
            post_count: 0,
            last_off: 0,
            last_width: 0,
            low_off: 0,
            low_width: 0,
        });
        self.rebuild_and_flush()
    }

    pub fn rmgroup(&mut self, name: &str) -> Result<(), Error> {
        let idx = self.find(name).ok_or_else(|| Error::NoGroup(name.to_string()))?;
        self.groups.remove(idx);
        self.rebuild_and_flush()
    }

    pub fn changegroup(&mut self, name: &str, flag: GroupFlag) -> Result<(), Error> {
        let idx = self.find(name).ok_or_else(|| Error::NoGroup(name.to_string()))?;
        self.groups[idx].flag = flag;
        self.rebuild_and_flush()
    }

    fn rebuild_and_flush(&mut self) -> Result<(), Error> {
        let mut image = Vec::with_capacity(self.image.len() + 64);
        for g in &self.groups {
            image.extend_from_slice(
                format!(
                    "{} {:0w$} {:0w$} {}\n",
                    g.name,
                    g.last,
                    g.low,
                    g.flag,
                    w = MARK_WIDTH
                )
                .as_bytes(),
            );
        }
        let (groups, by_name) = parse_image(&image)?;
        self.image = image;
        self.groups = groups;
        self.by_name = by_name;
        self.dirty += 1;
        self.flush()
    }

    /// Write the image out: back up the old file, write a temp file in the
    /// same directory, rename it into place.
    pub fn flush(&mut self) -> Result<(), Error> {
        if let Ok(old) = fs::read(&self.path) {
            let _ = fs::write(self.path.with_extension("old"), old);
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&self.image)?;
            f.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.dirty = 0;
        Ok(())
    }
}

// Right-justified zero-padded decimal into a fixed-width field.
fn write_mark(field: &mut [u8], value: u64) -> Option<()> {
    let text = value.to_string();
    if text.len() > field.len() {
        return None;
    }
    let pad = field.len() - text.len();
    field[..pad].fill(b'0');
    field[pad..].copy_from_slice(text.as_bytes());
    Some(())
}

fn parse_image(image: &[u8]) -> Result<(Vec<Group>, HashMap<String, usize>), Error> {
    let mut groups = Vec::new();
    let mut by_name = HashMap::new();
    let mut start = 0usize;
    for nl in memchr::memchr_iter(b'\n', image) {
        let line_off = start;
        let line = &image[start..nl];
        start = nl + 1;
        if line.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(line)
            .map_err(|_| Error::BadLine(String::from_utf8_lossy(line).into_owned()))?;
        let bad = || Error::BadLine(text.to_string());

        let mut fields = text.split(' ');
        let name = fields.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
        let last_text = fields.next().ok_or_else(bad)?;
        let low_text = fields.next().ok_or_else(bad)?;
        let flag_text = fields.next().ok_or_else(bad)?;
        let last: u64 = last_text.parse().map_err(|_| bad())?;
        let low: u64 = low_text.parse().map_err(|_| bad())?;

        let last_off = line_off + name.len() + 1;
        let low_off = last_off + last_text.len() + 1;

        if by_name.insert(name.to_string(), groups.len()).is_some() {
            tracing::error!(group = name, "duplicate group in active file");
            return Err(bad());
        }
        groups.push(Group {
            name: name.to_string(),
            last,
            low,
            flag: GroupFlag::parse(flag_text),
            post_count: 0,
            last_off,
            last_width: last_text.len(),
            low_off,
            low_width: low_text.len(),
        });
    }
    Ok((groups, by_name))
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_active(lines: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active");
        fs::write(&path, lines).unwrap();
        (dir, path)
    }

    #[test]
    fn parse_and_find() {
        let (_dir, path) = write_active(
            "misc.test 0000000042 0000000007 y\n\
             control 0000000000 0000000001 n\n\
             old.name 0000000003 0000000001 =new.name\n",
        );
        let active = Active::open(&path).unwrap();
        assert_eq!(active.len(), 3);
        let idx = active.find("misc.test").unwrap();
        assert_eq!(active.group(idx).last, 42);
        assert_eq!(active.group(idx).low, 7);
        assert_eq!(active.group(idx).flag, GroupFlag::Posting);
        assert_eq!(
            active.group(active.find("old.name").unwrap()).flag,
            GroupFlag::Alias("new.name".into())
        );
        assert!(active.find("none.such").is_none());
    }

    #[test]
    fn bump_rewrites_in_place() {
        let (_dir, path) = write_active("misc.test 0000000042 0000000007 y\n");
        let mut active = Active::open(&path).unwrap();
        let idx = active.find("misc.test").unwrap();

        assert_eq!(active.bump_last(idx).unwrap(), 43);
        assert_eq!(active.bump_last(idx).unwrap(), 44);
        // The image length must not change and the field stays fixed-width.
        assert_eq!(
            active.image(),
            b"misc.test 0000000044 0000000007 y\n".as_slice()
        );

        active.flush().unwrap();
        let reread = Active::open(&path).unwrap();
        assert_eq!(reread.group(reread.find("misc.test").unwrap()).last, 44);
    }

    #[test]
    fn adopt_last_is_monotone() {
        let (_dir, path) = write_active("a.b 0000000010 0000000001 y\n");
        let mut active = Active::open(&path).unwrap();
        let idx = active.find("a.b").unwrap();
        active.adopt_last(idx, 42).unwrap();
        assert_eq!(active.group(idx).last, 42);
        active.adopt_last(idx, 12).unwrap();
        assert_eq!(active.group(idx).last, 42);
    }

    #[test]
    fn mark_too_wide_is_an_error() {
        let (_dir, path) = write_active("a.b 99 1 y\n");
        let mut active = Active::open(&path).unwrap();
        let idx = active.find("a.b").unwrap();
        assert!(matches!(active.bump_last(idx), Err(Error::MarkTooWide(100, _))));
    }

    #[test]
    fn structural_edits_rebuild_and_persist() {
        let (_dir, path) = write_active("misc.test 0000000001 0000000001 y\n");
        let mut active = Active::open(&path).unwrap();

        active.newgroup("comp.lang.rust", GroupFlag::Moderated).unwrap();
        assert!(matches!(
            active.newgroup("comp.lang.rust", GroupFlag::Posting),
            Err(Error::GroupExists(_))
        ));
        active.changegroup("misc.test", GroupFlag::NoPosting).unwrap();

        let reread = Active::open(&path).unwrap();
        let idx = reread.find("comp.lang.rust").unwrap();
        assert_eq!(reread.group(idx).flag, GroupFlag::Moderated);
        assert_eq!(reread.group(idx).last, 0);
        assert_eq!(
            reread.group(reread.find("misc.test").unwrap()).flag,
            GroupFlag::NoPosting
        );

        active.rmgroup("misc.test").unwrap();
        assert!(Active::open(&path).unwrap().find("misc.test").is_none());
    }

    #[test]
    fn renumber_from_overview_stats() {
        let (_dir, path) = write_active("g.h 0000000005 0000000002 y\n");
        let mut active = Active::open(&path).unwrap();
        let idx = active.find("g.h").unwrap();

        active.renumber(idx, Some((4, 9, 6))).unwrap();
        assert_eq!(active.group(idx).last, 9);
        assert_eq!(active.group(idx).low, 4);

        // Empty group: low = high + 1, high unchanged.
        active.renumber(idx, None).unwrap();
        assert_eq!(active.group(idx).last, 9);
        assert_eq!(active.group(idx).low, 10);
    }
}
