//! The article blob store behind the server.
//!
//! The server never touches article files directly; it hands a wire-format
//! buffer to a [`Spool`] and gets back an opaque [`Token`], which is what
//! history and overview record. [`DirSpool`] is the bundled implementation;
//! anything satisfying the trait can stand in for it.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No storage class matched the article. The server treats this as a
    /// global fault and throttles.
    #[error("no storage class matches article")]
    NoMatch,
    #[error("article not present in spool")]
    NotFound,
    #[error("bad token text {0:?}")]
    BadTokenText(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Opaque storage handle: class, per-class index, sub-offset, and a
/// cancelled bit. Printable as `@…@` for history and feed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub class: u8,
    pub index: u32,
    pub offset: u32,
    pub cancelled: bool,
}

impl Token {
    pub fn new(class: u8, index: u32, offset: u32) -> Token {
        Token { class, index, offset, cancelled: false }
    }

    pub fn to_text(&self) -> String {
        format!(
            "@{:02X}{:08X}{:08X}{:02X}@",
            self.class,
            self.index,
            self.offset,
            u8::from(self.cancelled)
        )
    }

    pub fn from_text(text: &str) -> Result<Token, Error> {
        let bad = || Error::BadTokenText(text.to_string());
        let inner = text
            .strip_prefix('@')
            .and_then(|t| t.strip_suffix('@'))
            .ok_or_else(bad)?;
        if inner.len() != 20 || !inner.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(bad());
        }
        let class = u8::from_str_radix(&inner[0..2], 16).map_err(|_| bad())?;
        let index = u32::from_str_radix(&inner[2..10], 16).map_err(|_| bad())?;
        let offset = u32::from_str_radix(&inner[10..18], 16).map_err(|_| bad())?;
        let flags = u8::from_str_radix(&inner[18..20], 16).map_err(|_| bad())?;
        Ok(Token { class, index, offset, cancelled: flags & 1 != 0 })
    }

    /// Does this text look like a token (as opposed to a spool path)?
    pub fn is_token_text(text: &str) -> bool {
        text.len() == 22 && text.starts_with('@') && text.ends_with('@')
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// How much of the article a retrieval needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieve {
    /// Existence check only.
    Stat,
    /// Headers through the blank separator line.
    Head,
    /// The whole wire-format article.
    All,
}

pub trait Spool {
    fn store(&mut self, article: &[u8]) -> Result<Token, Error>;
    fn retrieve(&self, token: Token, what: Retrieve) -> Result<Vec<u8>, Error>;
    fn cancel(&mut self, token: Token) -> Result<(), Error>;
}

/// Directory-backed spool: one file per article, named by class and index.
pub struct DirSpool {
    root: PathBuf,
    class: u8,
    next_index: u32,
}

impl DirSpool {
    pub fn open(root: impl Into<PathBuf>) -> Result<DirSpool, Error> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        // Resume numbering past whatever is already on disk.
        let mut next_index = 0u32;
        for entry in fs::read_dir(&root)? {
            let name = entry?.file_name();
            if let Some(n) = name.to_str().and_then(|s| u32::from_str_radix(s, 16).ok()) {
                next_index = next_index.max(n + 1);
            }
        }
        Ok(DirSpool { root, class: 1, next_index })
    }

    fn path_for(&self, token: Token) -> PathBuf {
        self.root.join(format!("{:08x}", token.index))
    }
}

impl Spool for DirSpool {
    fn store(&mut self, article: &[u8]) -> Result<Token, Error> {
        let token = Token::new(self.class, self.next_index, 0);
        let path = self.path_for(token);
        let mut f = fs::File::create(&path)?;
        f.write_all(article)?;
        self.next_index += 1;
        Ok(token)
    }

    fn retrieve(&self, token: Token, what: Retrieve) -> Result<Vec<u8>, Error> {
        let path = self.path_for(token);
        if what == Retrieve::Stat {
            return if path.exists() { Ok(Vec::new()) } else { Err(Error::NotFound) };
        }
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };
        match what {
            Retrieve::Head => {
                let end = find_header_end(&data).unwrap_or(data.len());
                Ok(data[..end].to_vec())
            }
            _ => Ok(data),
        }
    }

    fn cancel(&mut self, token: Token) -> Result<(), Error> {
        match fs::remove_file(self.path_for(token)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

// Offset of the end of the header block (exclusive of the blank line).
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 2)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_text_round_trip() {
        let t = Token::new(3, 0xDEAD, 0x42);
        let text = t.to_text();
        assert_eq!(text.len(), 22);
        assert!(Token::is_token_text(&text));
        assert_eq!(Token::from_text(&text).unwrap(), t);

        let mut c = t;
        c.cancelled = true;
        assert_eq!(Token::from_text(&c.to_text()).unwrap(), c);

        assert!(Token::from_text("@short@").is_err());
        assert!(Token::from_text("plainly not a token").is_err());
    }

    #[test]
    fn store_retrieve_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = DirSpool::open(dir.path()).unwrap();

        let art = b"Path: x!y\r\nMessage-ID: <a@b>\r\n\r\nbody\r\n";
        let token = spool.store(art).unwrap();

        assert_eq!(spool.retrieve(token, Retrieve::All).unwrap(), art);
        let head = spool.retrieve(token, Retrieve::Head).unwrap();
        assert!(head.ends_with(b"<a@b>\r\n"));
        spool.retrieve(token, Retrieve::Stat).unwrap();

        spool.cancel(token).unwrap();
        assert!(matches!(spool.retrieve(token, Retrieve::All), Err(Error::NotFound)));
    }

    #[test]
    fn index_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let t1 = {
            let mut spool = DirSpool::open(dir.path()).unwrap();
            spool.store(b"one").unwrap()
        };
        let mut spool = DirSpool::open(dir.path()).unwrap();
        let t2 = spool.store(b"two").unwrap();
        assert!(t2.index > t1.index);
    }
}
