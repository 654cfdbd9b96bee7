//! The overview store: per-group article metadata for the reader side.
//!
//! Each group owns a directory (dots become slashes) holding two files:
//! `.overview`, one schema-ordered tab-separated line per article, and
//! `.overview.index`, an append-only array of packed records
//! `{be32 artnum, 16-byte message-ID hash}`. The two files grow in
//! lockstep, so the n-th index record describes the n-th text line.
//! Compaction is the expiry tool's business and happens by atomic rename.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use msgid::MsgidHash;
use storage::Token;

/// Bytes per packed index record.
pub const INDEX_RECORD_SIZE: usize = 4 + 16;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("overview schema: {0}")]
    BadSchema(String),
    #[error("overview line has no usable Xref field")]
    NoXref,
    #[error("no overview data for group {0:?}")]
    NoGroup(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One schema field: a header name, and whether the overview line carries
/// the `Name: ` prefix for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub full: bool,
}

/// The overview schema, read once at startup. Order defines the line
/// layout; `Xref:full` is mandatory since filing is keyed on it.
#[derive(Debug, Clone)]
pub struct Schema {
    pub fields: Vec<SchemaField>,
    xref: usize,
    msgid: Option<usize>,
}

impl Schema {
    pub fn parse(text: &str) -> Result<Schema, Error> {
        let mut fields = Vec::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (name, full) = match line.split_once(':') {
                Some((name, modifier)) => (name, modifier.trim() == "full"),
                None => (line, false),
            };
            fields.push(SchemaField { name: name.trim().to_string(), full });
        }
        let xref = fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case("Xref") && f.full)
            .ok_or_else(|| Error::BadSchema("schema must include Xref:full".into()))?;
        let msgid = fields.iter().position(|f| f.name.eq_ignore_ascii_case("Message-ID"));
        Ok(Schema { fields, xref, msgid })
    }

    pub fn load(path: &Path) -> Result<Schema, Error> {
        Schema::parse(&fs::read_to_string(path)?)
    }

    /// The stock schema used when no schema file is configured.
    pub fn default_schema() -> Schema {
        Schema::parse(
            "Subject\nFrom\nDate\nMessage-ID\nReferences\nBytes\nLines\nXref:full\n",
        )
        .unwrap()
    }

    fn field_value<'l>(&self, line: &'l str, index: usize) -> Option<&'l str> {
        let field = self.fields.get(index)?;
        let raw = line.split('\t').nth(index)?;
        if field.full {
            raw.strip_prefix(&format!("{}: ", field.name)).or(Some(raw))
        } else {
            Some(raw)
        }
    }
}

/// A `(group, artnum)` pair parsed out of an Xref field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrefEntry {
    pub group: String,
    pub artnum: u32,
}

/// Parse the locations list of an Xref value: `host grp:n [grp:n …]`.
pub fn parse_xref(value: &str) -> Vec<XrefEntry> {
    value
        .split_ascii_whitespace()
        .skip(1)
        .filter_map(|loc| {
            let (group, num) = loc.split_once(':')?;
            Some(XrefEntry { group: group.to_string(), artnum: num.parse().ok()? })
        })
        .collect()
}

pub struct Overview {
    root: PathBuf,
    schema: Schema,
    // Token resolution for articles filed during this run; restart-scope
    // retrieval goes through scan().
    tokens: HashMap<Token, XrefEntry>,
}

impl Overview {
    pub fn open(root: impl Into<PathBuf>, schema: Schema) -> Result<Overview, Error> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Overview { root, schema, tokens: HashMap::new() })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        self.root.join(group.replace('.', "/"))
    }

    /// File one article's overview line into every group its stored Xref
    /// names. The message-ID hash comes from the line itself when the
    /// schema carries Message-ID; the index entry pairs it with the
    /// per-group article number.
    pub fn add(&mut self, token: Token, line: &str) -> Result<(), Error> {
        let xref_value = self
            .schema
            .field_value(line, self.schema.xref)
            .ok_or(Error::NoXref)?;
        let entries = parse_xref(xref_value);
        if entries.is_empty() {
            return Err(Error::NoXref);
        }

        let hash = self
            .schema
            .msgid
            .and_then(|i| self.schema.field_value(line, i))
            .map(MsgidHash::of)
            .unwrap_or_default();

        for entry in &entries {
            let dir = self.group_dir(&entry.group);
            fs::create_dir_all(&dir)?;

            let mut text = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(".overview"))?;
            text.write_all(line.as_bytes())?;
            text.write_all(b"\n")?;

            let mut record = [0u8; INDEX_RECORD_SIZE];
            BigEndian::write_u32(&mut record[..4], entry.artnum);
            record[4..].copy_from_slice(&hash.0);
            let mut index = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(".overview.index"))?;
            index.write_all(&record)?;
        }

        self.tokens.insert(token, entries[0].clone());
        Ok(())
    }

    /// The overview line for an article filed this run.
    pub fn retrieve(&self, token: Token) -> Result<Option<String>, Error> {
        let Some(entry) = self.tokens.get(&token) else {
            return Ok(None);
        };
        let mut found = None;
        self.scan(&entry.group, entry.artnum, entry.artnum, |_n, line| {
            found = Some(line.to_string());
        })?;
        Ok(found)
    }

    /// Walk `[lo, hi]` of a group in stored order, yielding each
    /// `(artnum, line)` to the callback.
    pub fn scan(
        &self,
        group: &str,
        lo: u32,
        hi: u32,
        mut f: impl FnMut(u32, &str),
    ) -> Result<(), Error> {
        let dir = self.group_dir(group);
        let index = match fs::read(dir.join(".overview.index")) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoGroup(group.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut text = String::new();
        File::open(dir.join(".overview"))?.read_to_string(&mut text)?;

        let mut lines = text.lines();
        for record in index.chunks_exact(INDEX_RECORD_SIZE) {
            let Some(line) = lines.next() else { break };
            let artnum = BigEndian::read_u32(&record[..4]);
            if artnum >= lo && artnum <= hi {
                f(artnum, line);
            }
        }
        Ok(())
    }

    /// Low mark, high mark, and record count for a group's index, for
    /// renumbering. `None` when the group has no overview data yet.
    pub fn group_stats(&self, group: &str) -> Result<Option<(u32, u32, usize)>, Error> {
        let dir = self.group_dir(group);
        let index = match fs::read(dir.join(".overview.index")) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut lo = u32::MAX;
        let mut hi = 0u32;
        let mut count = 0usize;
        for record in index.chunks_exact(INDEX_RECORD_SIZE) {
            let artnum = BigEndian::read_u32(&record[..4]);
            lo = lo.min(artnum);
            hi = hi.max(artnum);
            count += 1;
        }
        Ok(if count == 0 { None } else { Some((lo, hi, count)) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn line(subject: &str, id: &str, xref: &str) -> String {
        format!("{subject}\tposter@example\tdate\t{id}\t\t100\t5\tXref: {xref}")
    }

    #[test]
    fn schema_requires_xref_full() {
        assert!(Schema::parse("Subject\nFrom\n").is_err());
        assert!(Schema::parse("Subject\nXref\n").is_err());
        let schema = Schema::parse("# comment\nSubject\n\nXref:full\n").unwrap();
        assert_eq!(schema.fields.len(), 2);
        assert!(schema.fields[1].full);
    }

    #[test]
    fn xref_parse() {
        let entries = parse_xref("news.example misc.test:4 comp.lang.c:99");
        assert_eq!(
            entries,
            vec![
                XrefEntry { group: "misc.test".into(), artnum: 4 },
                XrefEntry { group: "comp.lang.c".into(), artnum: 99 },
            ]
        );
        assert!(parse_xref("news.example").is_empty());
    }

    #[test]
    fn add_files_into_each_crossposted_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut ov = Overview::open(dir.path(), Schema::default_schema()).unwrap();

        let token = Token::new(1, 1, 0);
        ov.add(token, &line("hi", "<a@b>", "me misc.test:1 rec.arts:7")).unwrap();

        let stats = ov.group_stats("misc.test").unwrap().unwrap();
        assert_eq!(stats, (1, 1, 1));
        let stats = ov.group_stats("rec.arts").unwrap().unwrap();
        assert_eq!(stats, (7, 7, 1));

        let mut seen = Vec::new();
        ov.scan("rec.arts", 0, u32::MAX, |n, l| seen.push((n, l.to_string()))).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 7);
        assert!(seen[0].1.starts_with("hi\t"));
    }

    #[test]
    fn artnums_strictly_increase_within_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut ov = Overview::open(dir.path(), Schema::default_schema()).unwrap();

        for n in 1..=5u32 {
            let token = Token::new(1, n, 0);
            ov.add(token, &line("s", &format!("<m{n}@x>"), &format!("me misc.test:{n}")))
                .unwrap();
        }
        let mut nums = Vec::new();
        ov.scan("misc.test", 0, u32::MAX, |n, _| nums.push(n)).unwrap();
        assert_eq!(nums, vec![1, 2, 3, 4, 5]);
        assert!(nums.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn retrieve_by_token_within_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut ov = Overview::open(dir.path(), Schema::default_schema()).unwrap();

        let token = Token::new(1, 9, 0);
        ov.add(token, &line("subject", "<r@s>", "me misc.test:3")).unwrap();
        let got = ov.retrieve(token).unwrap().unwrap();
        assert!(got.contains("<r@s>"));
        assert!(ov.retrieve(Token::new(1, 999, 0)).unwrap().is_none());
    }

    #[test]
    fn scan_range_filters() {
        let dir = tempfile::tempdir().unwrap();
        let mut ov = Overview::open(dir.path(), Schema::default_schema()).unwrap();
        for n in 1..=10u32 {
            ov.add(Token::new(1, n, 0), &line("s", &format!("<m{n}@x>"), &format!("me g.h:{n}")))
                .unwrap();
        }
        let mut nums = Vec::new();
        ov.scan("g.h", 4, 6, |n, _| nums.push(n)).unwrap();
        assert_eq!(nums, vec![4, 5, 6]);

        assert!(matches!(ov.scan("none.such", 0, 1, |_, _| ()), Err(Error::NoGroup(_))));
    }
}
