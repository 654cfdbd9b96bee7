//! The known-header table and header canonicalisation.
//!
//! Headers are parsed once on arrival: continuation lines fold into their
//! predecessor, known names are rewritten to canonical case, obsolete
//! headers are dropped, the saved `Xref` is removed from the stored copy
//! but kept for rewriting, and required headers are checked for presence
//! and duplication.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Ordinary header, recorded when present.
    Std,
    /// Required; a missing or duplicated one fails the article.
    Req,
    /// Obsolete; stripped from the stored article.
    Obs,
    /// Saved: stripped from the stored copy but retained for rewriting.
    Sav,
}

macro_rules! known_headers {
    ($(($variant:ident, $name:literal, $kind:ident)),+ $(,)?) => {
        /// Every header the server knows by name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Header {
            $($variant),+
        }

        const ALL: &[Header] = &[$(Header::$variant),+];

        impl Header {
            pub const COUNT: usize = ALL.len();

            pub fn name(self) -> &'static str {
                match self {
                    $(Header::$variant => $name),+
                }
            }

            pub fn kind(self) -> HeaderKind {
                match self {
                    $(Header::$variant => HeaderKind::$kind),+
                }
            }

            /// Case-insensitive lookup keyed on the lowercased name.
            pub fn lookup(name: &str) -> Option<Header> {
                let lower = name.to_ascii_lowercase();
                match lower.as_str() {
                    $(_ if lower.eq_ignore_ascii_case($name) => Some(Header::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

known_headers! {
    (Approved, "Approved", Std),
    (Control, "Control", Std),
    (Date, "Date", Req),
    (Distribution, "Distribution", Std),
    (Expires, "Expires", Std),
    (From, "From", Req),
    (Lines, "Lines", Std),
    (MessageId, "Message-ID", Req),
    (Newsgroups, "Newsgroups", Req),
    (Path, "Path", Req),
    (ReplyTo, "Reply-To", Std),
    (Sender, "Sender", Std),
    (Subject, "Subject", Req),
    (Supersedes, "Supersedes", Std),
    (Bytes, "Bytes", Std),
    (AlsoControl, "Also-Control", Std),
    (References, "References", Std),
    (Xref, "Xref", Sav),
    (Keywords, "Keywords", Std),
    (XTrace, "X-Trace", Std),
    (DateReceived, "Date-Received", Obs),
    (Posted, "Posted", Obs),
    (PostingVersion, "Posting-Version", Obs),
    (Received, "Received", Obs),
    (RelayVersion, "Relay-Version", Obs),
    (NntpPostingHost, "NNTP-Posting-Host", Std),
    (FollowupTo, "Followup-To", Std),
    (Organization, "Organization", Std),
    (ContentType, "Content-Type", Std),
    (ContentBase, "Content-Base", Std),
    (ContentDisposition, "Content-Disposition", Std),
    (XNewsreader, "X-Newsreader", Std),
    (XMailer, "X-Mailer", Std),
    (XNewsposter, "X-Newsposter", Std),
    (XCancelledBy, "X-Cancelled-By", Std),
    (XCanceledBy, "X-Canceled-By", Std),
    (CancelKey, "Cancel-Key", Std),
}

impl Header {
    fn index(self) -> usize {
        ALL.iter().position(|h| *h == self).unwrap()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The canonicalised article, ready for policy checks and storage.
#[derive(Debug, Default)]
pub struct CleanedArticle {
    /// Canonical `(name, value)` pairs in arrival order, minus obsolete,
    /// saved, `Bytes`, and empty-valued headers.
    pub header_lines: Vec<(String, String)>,
    known: Vec<Option<String>>,
    known_counts: Vec<u32>,
    /// Body with CRLF endings and no dot-stuffing, including the final
    /// line ending.
    pub body: Vec<u8>,
    pub lines: usize,
    pub cr_without_lf: usize,
    pub lf_without_cr: usize,
}

impl CleanedArticle {
    pub fn get(&self, h: Header) -> Option<&str> {
        self.known[h.index()].as_deref()
    }

    pub fn get_or_empty(&self, h: Header) -> &str {
        self.get(h).unwrap_or("")
    }

    fn record(&mut self, h: Header, value: String) {
        let i = h.index();
        self.known_counts[i] += 1;
        if self.known[i].is_none() {
            self.known[i] = Some(value);
        }
    }
}

// One logical header line: `text[start..]` up to a line ending not
// followed by whitespace. Returns (name, value, next_offset), with the
// folded continuation lines joined by single spaces.
fn take_header(text: &[u8], start: usize) -> Result<(String, String, usize), String> {
    let mut lines: Vec<&[u8]> = Vec::new();
    let mut at = start;
    loop {
        let nl = memchr::memchr(b'\n', &text[at..]).map(|i| at + i);
        let (line_end, next) = match nl {
            Some(nl) => {
                let end = if nl > at && text[nl - 1] == b'\r' { nl - 1 } else { nl };
                (end, nl + 1)
            }
            None => (text.len(), text.len()),
        };
        lines.push(&text[at..line_end]);
        at = next;
        // Continuation?
        match text.get(at) {
            Some(&b' ') | Some(&b'\t') if nl.is_some() => continue,
            _ => break,
        }
    }

    let first = lines[0];
    let colon = memchr::memchr(b':', first).ok_or_else(|| {
        format!("No colon-space in {:?} header", String::from_utf8_lossy(first))
    })?;
    if colon == 0 {
        return Err("Field without name in header".to_string());
    }
    let name = &first[..colon];
    if name.iter().any(|b| b.is_ascii_whitespace()) {
        return Err(format!(
            "Space before colon in {:?} header",
            String::from_utf8_lossy(name)
        ));
    }
    match first.get(colon + 1) {
        Some(&b' ') | Some(&b'\t') | None => {}
        Some(_) => {
            return Err(format!(
                "No colon-space in {:?} header",
                String::from_utf8_lossy(name)
            ))
        }
    }

    let mut value = String::new();
    let tail = &first[colon + 1..];
    value.push_str(String::from_utf8_lossy(tail).trim());
    for cont in &lines[1..] {
        let cont = String::from_utf8_lossy(cont);
        let cont = cont.trim();
        if !cont.is_empty() {
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(cont);
        }
    }

    Ok((String::from_utf8_lossy(name).into_owned(), value, at))
}

/// Canonicalise a wire-format article (CRLF endings, dot-stuffing already
/// undone, no trailing `.\r\n`). Returns the reject reason on failure.
pub fn clean(wire: &[u8]) -> Result<CleanedArticle, String> {
    let mut art = CleanedArticle {
        known: vec![None; Header::COUNT],
        known_counts: vec![0; Header::COUNT],
        ..CleanedArticle::default()
    };

    // Headers.
    let mut at = 0usize;
    loop {
        if at >= wire.len() {
            return Err("No body".to_string());
        }
        // Blank line ends the headers.
        if wire[at] == b'\n' {
            at += 1;
            break;
        }
        if wire[at] == b'\r' && wire.get(at + 1) == Some(&b'\n') {
            at += 2;
            break;
        }
        let (name, value, next) = take_header(wire, at)?;
        at = next;

        match Header::lookup(&name) {
            Some(h) => {
                match h.kind() {
                    HeaderKind::Obs => continue,
                    _ if h == Header::Bytes => continue,
                    _ => {}
                }
                if value.is_empty() {
                    continue;
                }
                art.record(h, value.clone());
                if h.kind() != HeaderKind::Sav {
                    art.header_lines.push((h.name().to_string(), value));
                }
            }
            None => {
                if value.is_empty() {
                    continue;
                }
                art.header_lines.push((name, value));
            }
        }
    }

    // Message-ID shape first so errors can name the article.
    match art.get(Header::MessageId) {
        Some(id) if msgid::id_ok(id) => {}
        _ => return Err("Bad \"Message-ID\" header".to_string()),
    }

    // Required headers present exactly once.
    for &h in ALL {
        if h.kind() != HeaderKind::Req {
            continue;
        }
        match art.known_counts[h.index()] {
            0 => return Err(format!("Missing \"{}\" header", h.name())),
            1 => {}
            _ => return Err(format!("Duplicate \"{}\" header", h.name())),
        }
    }

    // Body: count lines, watch line-ending hygiene, reject NULs.
    let body = &wire[at..];
    if body.is_empty() {
        return Err("No body".to_string());
    }
    let mut lines = 0usize;
    let mut i = 0usize;
    while i < body.len() {
        match body[i] {
            0 => return Err(format!("Line {} includes null character", lines + 1)),
            b'\r' => {
                if body.get(i + 1) != Some(&b'\n') {
                    art.cr_without_lf += 1;
                }
            }
            b'\n' => {
                lines += 1;
                if i == 0 || body[i - 1] != b'\r' {
                    art.lf_without_cr += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    art.lines = lines;
    art.body = body.to_vec();
    Ok(art)
}

#[cfg(test)]
mod test {
    use super::*;

    fn wire(headers: &str, body: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for line in headers.lines() {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        for line in body.lines() {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    const BASIC_HDRS: &str = "Path: peer!not-for-mail\n\
                              From: alice@example.com\n\
                              Newsgroups: misc.test\n\
                              Subject: hello\n\
                              Message-ID: <a@b>\n\
                              Date: 1 Jan 2024 00:00:00 GMT";

    #[test]
    fn clean_accepts_basic_article() {
        let art = clean(&wire(BASIC_HDRS, "hi\nthere")).unwrap();
        assert_eq!(art.get(Header::MessageId), Some("<a@b>"));
        assert_eq!(art.get(Header::Newsgroups), Some("misc.test"));
        assert_eq!(art.lines, 2);
        assert_eq!(art.body, b"hi\r\nthere\r\n");
        assert_eq!(art.cr_without_lf, 0);
        assert_eq!(art.lf_without_cr, 0);
    }

    #[test]
    fn canonical_case_rewrite_and_folding() {
        let hdrs = "path: peer!x\n\
                    from: a@b.c\n\
                    newsgroups: misc.test\n\
                    subject: folded\n\
                    \theader value\n\
                    MESSAGE-ID: <f@g>\n\
                    date: 1 Jan 2024 00:00:00 GMT";
        let art = clean(&wire(hdrs, "b")).unwrap();
        let subject = art
            .header_lines
            .iter()
            .find(|(n, _)| n == "Subject")
            .unwrap();
        assert_eq!(subject.1, "folded header value");
        // Canonical names, not the peer's casing.
        assert!(art.header_lines.iter().any(|(n, _)| n == "Path"));
        assert!(art.header_lines.iter().any(|(n, _)| n == "Message-ID"));
    }

    #[test]
    fn obsolete_and_saved_headers_stripped() {
        let hdrs = format!(
            "{BASIC_HDRS}\nPosted: whenever\nXref: old.example misc.test:3\nBytes: 99"
        );
        let art = clean(&wire(&hdrs, "b")).unwrap();
        assert!(!art.header_lines.iter().any(|(n, _)| n == "Posted"));
        assert!(!art.header_lines.iter().any(|(n, _)| n == "Xref"));
        assert!(!art.header_lines.iter().any(|(n, _)| n == "Bytes"));
        // Saved value still available for the slave path.
        assert_eq!(art.get(Header::Xref), Some("old.example misc.test:3"));
    }

    #[test]
    fn required_header_rules() {
        let missing = "Path: p!x\nFrom: a@b\nNewsgroups: misc.test\n\
                       Subject: s\nDate: 1 Jan 2024 00:00:00 GMT";
        let err = clean(&wire(missing, "b")).unwrap_err();
        assert!(err.contains("Message-ID"), "{err}");

        let dup = format!("{BASIC_HDRS}\nSubject: again");
        let err = clean(&wire(&dup, "b")).unwrap_err();
        assert!(err.contains("Duplicate \"Subject\""), "{err}");
    }

    #[test]
    fn malformed_headers_fail() {
        let bad = format!("Bad Header: x\n{BASIC_HDRS}");
        assert!(clean(&wire(&bad, "b")).is_err());
        let nocolon = format!("JustSomeText\n{BASIC_HDRS}");
        assert!(clean(&wire(&nocolon, "b")).is_err());
    }

    #[test]
    fn nul_in_body_fails() {
        let mut w = wire(BASIC_HDRS, "line");
        w.push(0);
        w.extend_from_slice(b"\r\n");
        let err = clean(&w).unwrap_err();
        assert!(err.contains("null"), "{err}");
    }

    #[test]
    fn empty_valued_headers_dropped() {
        let hdrs = format!("{BASIC_HDRS}\nOrganization:   ");
        let art = clean(&wire(&hdrs, "b")).unwrap();
        assert!(!art.header_lines.iter().any(|(n, _)| n == "Organization"));
        assert_eq!(art.get(Header::Organization), None);
    }
}
