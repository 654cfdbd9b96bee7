//! The incoming-peer table (`hosts.nntp` and `hosts.nntp.nolimit`).
//!
//! Entry format, one per line:
//!
//! ```text
//! host[,host…]:password[:pattern,pattern…]
//! ```
//!
//! A `/s` suffix on the host field marks the peer streaming-capable; the
//! moment any entry carries it, streaming is off for everyone else.

use crate::Error;

pub const NO_PASSWORD: &str = "";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub names: Vec<String>,
    pub password: String,
    /// Newsgroup patterns this peer may feed us; `None` means everything.
    pub patterns: Option<Vec<String>>,
    pub streaming: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HostTable {
    pub hosts: Vec<RemoteHost>,
    /// True when some entry carried `/s`: only marked peers may stream.
    pub streaming_restricted: bool,
}

impl HostTable {
    pub fn parse(text: &str) -> Result<HostTable, Error> {
        let mut table = HostTable::default();
        for raw in text.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(3, ':');
            let mut host_field = fields.next().unwrap_or("").to_string();
            let password = fields.next().unwrap_or(NO_PASSWORD).to_string();
            let patterns = fields.next().filter(|p| !p.is_empty()).map(|p| {
                p.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            });

            let mut streaming = false;
            if let Some(stripped) = host_field.strip_suffix("/s") {
                streaming = true;
                table.streaming_restricted = true;
                host_field = stripped.to_string();
            }
            let names: Vec<String> = host_field
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if names.is_empty() {
                return Err(Error::BadHostEntry(raw.to_string()));
            }
            table.hosts.push(RemoteHost { names, password, patterns, streaming });
        }
        Ok(table)
    }

    /// Find the entry for a peer by hostname or address text.
    pub fn find(&self, host: &str) -> Option<&RemoteHost> {
        self.hosts
            .iter()
            .find(|h| h.names.iter().any(|n| n.eq_ignore_ascii_case(host)))
    }

    /// May this peer use CHECK/TAKETHIS?
    pub fn may_stream(&self, host: &str) -> bool {
        match self.find(host) {
            Some(h) => !self.streaming_restricted || h.streaming,
            None => !self.streaming_restricted,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_entries() {
        let table = HostTable::parse(
            "# peers\n\
             news.example.com,10.0.0.2:secret\n\
             feeder.example.net/s::comp.*,!comp.binaries.*\n\
             open.example.org:\n",
        )
        .unwrap();
        assert_eq!(table.hosts.len(), 3);

        let h = table.find("NEWS.example.COM").unwrap();
        assert_eq!(h.password, "secret");
        assert!(h.patterns.is_none());
        assert!(!h.streaming);

        let h = table.find("10.0.0.2").unwrap();
        assert_eq!(h.password, "secret");

        let h = table.find("feeder.example.net").unwrap();
        assert!(h.streaming);
        assert_eq!(
            h.patterns.as_deref().unwrap(),
            ["comp.*".to_string(), "!comp.binaries.*".to_string()]
        );
        assert!(table.find("stranger.example").is_none());
    }

    #[test]
    fn streaming_restriction() {
        let open = HostTable::parse("a.example:\nb.example:\n").unwrap();
        assert!(open.may_stream("a.example"));
        assert!(open.may_stream("unknown.example"));

        let restricted = HostTable::parse("a.example/s:\nb.example:\n").unwrap();
        assert!(restricted.may_stream("a.example"));
        assert!(!restricted.may_stream("b.example"));
        assert!(!restricted.may_stream("unknown.example"));
    }

    #[test]
    fn bad_entry() {
        assert!(HostTable::parse(":password\n").is_err());
    }
}
