//! Message-ID identity: the strict wire grammar for article IDs, and the
//! 128-bit digest of the canonicalised ID that every other subsystem keys on.

use std::fmt;

/// Longest message-ID we accept on the wire, in octets.
pub const MAX_MSGID_LEN: usize = 250;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hash text is not 32 hex digits: {0:?}")]
    BadHashText(String),
}

/// 128-bit digest of a canonicalised message-ID.
///
/// Equality of hashes stands in for equality of IDs everywhere past the
/// receiving channel; the textual ID is never a lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgidHash(pub [u8; 16]);

impl MsgidHash {
    /// Hash a message-ID, canonicalising case first: the domain part is
    /// case-insensitive and folds to lowercase, the local part is
    /// case-sensitive, and a `postmaster` local part makes the whole ID
    /// case-insensitive.
    pub fn of(msgid: &str) -> MsgidHash {
        let canonical = canonicalize(msgid);
        MsgidHash(md5::compute(canonical.as_bytes()).0)
    }

    /// Hash raw bytes without canonicalisation.
    pub fn of_raw(data: &[u8]) -> MsgidHash {
        MsgidHash(md5::compute(data).0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn clear(&mut self) {
        self.0 = [0u8; 16];
    }

    /// A bucket index derived from the leading bytes, for the small
    /// fixed-size tables (WIP, history verdict cache).
    pub fn bucket(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().unwrap())
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0 {
            s.push_str(&format!("{b:02X}"));
        }
        s
    }

    pub fn from_hex(text: &str) -> Result<MsgidHash, Error> {
        let text = text.trim();
        if text.len() != 32 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::BadHashText(text.to_string()));
        }
        let mut out = [0u8; 16];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).unwrap() as u8;
            let lo = (chunk[1] as char).to_digit(16).unwrap() as u8;
            out[i] = (hi << 4) | lo;
        }
        Ok(MsgidHash(out))
    }
}

impl fmt::Display for MsgidHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Fold the case-insensitive span of a message-ID to lowercase.
///
/// Full RFC 822 fidelity would require tracking quoting through the local
/// part; quoted case-sensitive spans in the domain don't occur in real
/// news, so the split point is simply the `@`.
fn canonicalize(msgid: &str) -> String {
    let Some(at) = msgid.find('@') else {
        // No local/domain split; treat the whole ID as case-sensitive.
        return msgid.to_string();
    };
    let local = &msgid[..at];
    if local
        .strip_prefix('<')
        .map(|rest| rest.eq_ignore_ascii_case("postmaster"))
        .unwrap_or(false)
    {
        return msgid.to_ascii_lowercase();
    }
    let mut out = String::with_capacity(msgid.len());
    out.push_str(local);
    out.push_str(&msgid[at..].to_ascii_lowercase());
    out
}

// Character classes from the RFC 822 grammar, restricted per RFC 1036:
// whitespace, non-printing characters, and '>' never appear inside an ID.
fn is_atom_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-/=?^_`{|}~".contains(&c)
}

fn is_norm_char(c: u8) -> bool {
    is_atom_char(c) || b"\"(),.:;<@[\\]".contains(&c)
}

/// Check a message-ID against the grammar:
/// `< local-part @ domain >` where local-part is dot-separated atoms or
/// quoted strings and domain is dot-separated atoms or a `[literal]`.
pub fn id_ok(msgid: &str) -> bool {
    if msgid.len() > MAX_MSGID_LEN {
        return false;
    }
    let b = msgid.as_bytes();
    let mut i = 0usize;

    if b.first() != Some(&b'<') {
        return false;
    }
    i += 1;

    // Local part: "atom|quoted [ . atom|quoted ]*"
    loop {
        if i < b.len() && is_atom_char(b[i]) {
            while i < b.len() && is_atom_char(b[i]) {
                i += 1;
            }
        } else {
            if b.get(i) != Some(&b'"') {
                return false;
            }
            i += 1;
            loop {
                let Some(&c) = b.get(i) else { return false };
                i += 1;
                match c {
                    b'"' => break,
                    b'\\' => {
                        let Some(&esc) = b.get(i) else { return false };
                        i += 1;
                        if !is_norm_char(esc) {
                            return false;
                        }
                    }
                    _ if is_norm_char(c) => {}
                    _ => return false,
                }
            }
        }
        if b.get(i) != Some(&b'.') {
            break;
        }
        i += 1;
    }

    if b.get(i) != Some(&b'@') {
        return false;
    }
    i += 1;

    // Domain part: "atom|[literal] [ . atom|[literal] ]*"
    loop {
        if i < b.len() && is_atom_char(b[i]) {
            while i < b.len() && is_atom_char(b[i]) {
                i += 1;
            }
        } else {
            if b.get(i) != Some(&b'[') {
                return false;
            }
            i += 1;
            loop {
                let Some(&c) = b.get(i) else { return false };
                i += 1;
                match c {
                    b']' => break,
                    b'[' => return false,
                    b'\\' => {
                        let Some(&esc) = b.get(i) else { return false };
                        i += 1;
                        if !is_norm_char(esc) {
                            return false;
                        }
                    }
                    _ if is_norm_char(c) => {}
                    _ => return false,
                }
            }
        }
        if b.get(i) != Some(&b'.') {
            break;
        }
        i += 1;
    }

    b.get(i) == Some(&b'>') && i + 1 == b.len()
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    #[test]
    fn grammar_accepts_plain_ids() {
        for id in [
            "<a@b>",
            "<a.b.c@example.com>",
            "<87iu6xq2million@dollar.signs>",
            "<\"quoted.local\"@example.com>",
            "<a@[127.0.0.1]>",
            "<a!b#c@x-y_z.example>",
        ] {
            assert!(id_ok(id), "{id} should be valid");
        }
    }

    #[test]
    fn grammar_rejects_malformed_ids() {
        for id in [
            "",
            "<>",
            "<a>",
            "a@b",
            "<a@b",
            "<a@b> ",
            "<a b@c>",
            "<a@b>c",
            "<a@>",
            "<@b>",
            "<a@b..c>",
            "<a@[x[y]>",
            "<a@b>\n",
        ] {
            assert!(!id_ok(id), "{id:?} should be invalid");
        }
        let long = format!("<{}@b>", "x".repeat(MAX_MSGID_LEN));
        assert!(!id_ok(&long));
    }

    #[test]
    fn hash_folds_domain_case_only() {
        assert_eq!(MsgidHash::of("<Local@Example.COM>"), MsgidHash::of("<Local@example.com>"));
        assert_ne!(MsgidHash::of("<local@example.com>"), MsgidHash::of("<LOCAL@example.com>"));
    }

    #[test]
    fn postmaster_is_case_insensitive() {
        assert_eq!(
            MsgidHash::of("<PostMaster@Example.Com>"),
            MsgidHash::of("<postmaster@example.com>")
        );
    }

    #[test]
    fn hex_round_trip() {
        let h = MsgidHash::of("<a@b>");
        let text = h.to_hex();
        assert_eq!(text.len(), 32);
        assert_eq!(MsgidHash::from_hex(&text).unwrap(), h);
        assert!(MsgidHash::from_hex("not hex").is_err());
    }

    #[test]
    fn empty_hash_sentinel() {
        let mut h = MsgidHash::of("<a@b>");
        assert!(!h.is_empty());
        h.clear();
        assert!(h.is_empty());
    }

    // A generated, always-valid message-ID for the grammar property.
    #[derive(Debug, Clone)]
    struct ValidId(String);

    impl Arbitrary for ValidId {
        fn arbitrary(g: &mut Gen) -> ValidId {
            let atom = |g: &mut Gen| -> String {
                let chars = b"abcXYZ0189!#$%&'*+-/=?^_`{|}~";
                let len = 1 + usize::arbitrary(g) % 8;
                (0..len)
                    .map(|_| *g.choose(chars).unwrap() as char)
                    .collect()
            };
            let words = 1 + usize::arbitrary(g) % 3;
            let local: Vec<String> = (0..words).map(|_| atom(g)).collect();
            let domain: Vec<String> = (0..words).map(|_| atom(g)).collect();
            ValidId(format!("<{}@{}>", local.join("."), domain.join(".")))
        }
    }

    quickcheck::quickcheck! {
        fn generated_ids_pass_grammar(id: ValidId) -> bool {
            id_ok(&id.0)
        }

        fn hash_hex_round_trips(id: ValidId) -> bool {
            let h = MsgidHash::of(&id.0);
            MsgidHash::from_hex(&h.to_hex()).unwrap() == h
        }
    }
}
