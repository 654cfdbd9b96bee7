//! The outgoing-feed configuration: the `newsfeeds` file, the incoming
//! peer table, and the newsgroup pattern matcher.
//!
//! A `newsfeeds` entry is one logical block of four colon-delimited
//! fields — `name[/exclusion,…]`, `patterns[/distribution,…]`, `flags`,
//! `parameter` — where physical lines continue with a trailing backslash.
//! `$name=value` lines define macros expanded into later blocks. Exactly
//! one `ME` block sets server-wide defaults. Funnels and masters are
//! resolved to integer site indexes at parse time; a funnel chain is a
//! fatal configuration error.

mod hosts;
mod wildmat;

pub use hosts::{HostTable, RemoteHost};
pub use wildmat::wildmat;

use std::collections::HashMap;

/// Default flush point for buffered file feeds, in bytes.
pub const SITE_BUFFER_SIZE: usize = 16 * 1024;

const SUB_NEGATE: char = '!';
const SUB_POISON: char = '@';

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad newsfeeds entry {name:?}: {reason}")]
    BadEntry { name: String, reason: String },
    #[error("newsfeeds must have exactly one ME entry")]
    MissingMe,
    #[error("site {0:?} funnels into funnel {1:?}")]
    FunnelCycle(String, String),
    #[error("site {0:?} funnels into unknown site {1:?}")]
    FunnelTarget(String, String),
    #[error("bad hosts.nntp entry {0:?}")]
    BadHostEntry(String),
}

/// How a site gets told about new articles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedKind {
    /// `Tf` — append a record to a file.
    #[default]
    File,
    /// `Tc` — write records down a pipe to a long-lived child.
    Channel,
    /// `Tx` — like Channel, but the child also accepts control lines.
    Exploder,
    /// `Tm` — redirect records into another site.
    Funnel,
    /// `Tl` — log only.
    LogOnly,
    /// `Tp` — spawn a program per article.
    Program,
}

/// One `W` flag: which datum goes into the site's per-article record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedItem {
    Bytesize,      // b
    FullName,      // f
    Hash,          // h
    DistHeader,    // D
    GroupsHeader,  // G
    Headers,       // H
    Overview,      // O
    Path,          // P
    Replic,        // R
    StoredGroup,   // g
    TimeReceived,  // t
    TimePosted,    // p
    TimeExpired,   // e
    MessageId,     // m
    FunnelNames,   // *
    Name,          // n
    Newsgroup,     // N
    Site,          // s
}

impl FeedItem {
    pub fn from_char(c: char) -> Option<FeedItem> {
        Some(match c {
            'b' => FeedItem::Bytesize,
            'f' => FeedItem::FullName,
            'h' => FeedItem::Hash,
            'D' => FeedItem::DistHeader,
            'G' => FeedItem::GroupsHeader,
            'H' => FeedItem::Headers,
            'O' => FeedItem::Overview,
            'P' => FeedItem::Path,
            'R' => FeedItem::Replic,
            'g' => FeedItem::StoredGroup,
            't' => FeedItem::TimeReceived,
            'p' => FeedItem::TimePosted,
            'e' => FeedItem::TimeExpired,
            'm' => FeedItem::MessageId,
            '*' => FeedItem::FunnelNames,
            'n' => FeedItem::Name,
            'N' => FeedItem::Newsgroup,
            's' => FeedItem::Site,
            _ => return None,
        })
    }
}

/// A parsed feed entry.
#[derive(Debug, Clone, Default)]
pub struct Site {
    pub name: String,
    pub entry: String,
    pub exclusions: Vec<String>,
    pub patterns: Vec<String>,
    pub distributions: Vec<String>,
    pub kind: FeedKind,
    pub param: String,

    // A-flags.
    pub ignore_control: bool,
    pub control_only: bool,
    pub dist_required: bool,
    pub dont_want_non_exist: bool,
    pub drop_filtered: bool,
    pub need_overview_creation: bool,
    pub feed_without_originator: bool,
    pub ignore_path: bool,

    pub max_size: u64,
    pub min_size: u64,
    pub hops: u32,
    pub group_count: u32,
    pub follow_count: u32,
    pub cross_count: u32,
    pub start_writing: usize,
    pub stop_writing: usize,
    pub start_spooling: usize,
    pub flush_point: usize,
    pub nice: i32,
    pub spool_file: Option<String>,
    pub file_flags: Vec<FeedItem>,
    pub fnl_wants_names: bool,
    pub just_moderated: bool,
    pub just_unmoderated: bool,
    pub originators: Vec<String>,

    /// Index of the site this one funnels into.
    pub funnel: Option<usize>,
    /// Index of the master for a duplicate-named entry.
    pub master: Option<usize>,
    pub is_master: bool,
}

impl Site {
    /// Does this site subscribe to a group? ME patterns set the default,
    /// the site's own patterns refine it, last match wins.
    pub fn wants_group(&self, me: Option<&Site>, group: &str) -> bool {
        let mut matched = false;
        let lists = me
            .map(|m| m.patterns.as_slice())
            .into_iter()
            .chain(std::iter::once(self.patterns.as_slice()));
        for patterns in lists {
            for pat in patterns {
                let (subvalue, pat) = match pat.chars().next() {
                    Some(SUB_NEGATE) | Some(SUB_POISON) => (false, &pat[1..]),
                    _ => (true, pat.as_str()),
                };
                if pat.is_empty() {
                    continue;
                }
                if matched != subvalue && wildmat(group, pat) {
                    matched = subvalue;
                }
            }
        }
        matched
    }

    /// Is this group poison for the site (`@pattern`): never send, even
    /// when crossposted to a wanted group?
    pub fn poisons_group(&self, me: Option<&Site>, group: &str) -> bool {
        let mut matched = false;
        let lists = me
            .map(|m| m.patterns.as_slice())
            .into_iter()
            .chain(std::iter::once(self.patterns.as_slice()));
        for patterns in lists {
            for pat in patterns {
                let poisonvalue = pat.starts_with(SUB_POISON);
                let stripped = pat.trim_start_matches([SUB_NEGATE, SUB_POISON]);
                if stripped.is_empty() {
                    continue;
                }
                if wildmat(group, stripped) {
                    matched = poisonvalue;
                }
            }
        }
        matched
    }

    pub fn has_poison_patterns(&self) -> bool {
        self.patterns.iter().any(|p| p.starts_with(SUB_POISON))
    }
}

/// The parsed newsfeeds file: the ME defaults plus the ordinary sites.
#[derive(Debug, Clone)]
pub struct Newsfeeds {
    pub me: Site,
    pub sites: Vec<Site>,
}

impl Newsfeeds {
    pub fn parse(text: &str) -> Result<Newsfeeds, Error> {
        let entries = read_entries(text);

        let mut me: Option<Site> = None;
        let mut sites: Vec<Site> = Vec::new();
        for entry in entries {
            let site = parse_entry(&entry)?;
            if site.name == "ME" {
                if me.is_some() {
                    return Err(Error::MissingMe);
                }
                me = Some(site);
            } else {
                sites.push(site);
            }
        }
        let me = me.ok_or(Error::MissingMe)?;

        let mut feeds = Newsfeeds { me, sites };
        feeds.patch_masters();
        feeds.patch_funnels()?;
        Ok(feeds)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.sites.iter().position(|s| s.name.eq_ignore_ascii_case(name))
    }

    // Duplicate-named entries form a master/slave family: the first one
    // is the master, the rest point at it, and an article offered to the
    // family is sent at most once.
    fn patch_masters(&mut self) {
        for i in 0..self.sites.len() {
            let name = self.sites[i].name.clone();
            let first = self
                .sites
                .iter()
                .position(|s| s.name.eq_ignore_ascii_case(&name))
                .unwrap();
            if first != i {
                self.sites[i].master = Some(first);
                self.sites[first].is_master = true;
            }
        }
    }

    fn patch_funnels(&mut self) -> Result<(), Error> {
        for i in 0..self.sites.len() {
            if self.sites[i].kind != FeedKind::Funnel {
                continue;
            }
            let name = self.sites[i].name.clone();
            let target_name = self.sites[i].param.clone();
            let target = self
                .find(&target_name)
                .ok_or_else(|| Error::FunnelTarget(name.clone(), target_name.clone()))?;
            if self.sites[target].kind == FeedKind::Funnel {
                return Err(Error::FunnelCycle(name, target_name));
            }
            self.sites[i].funnel = Some(target);
        }
        Ok(())
    }
}

// Split the file into logical entries: strip comments, join backslash
// continuations, collect `$var=` macros and expand them into the entries
// that follow their definition.
fn read_entries(text: &str) -> Vec<String> {
    let mut vars: HashMap<String, String> = HashMap::new();
    let mut entries: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut continuing = false;

    for raw in text.lines() {
        let line = if !continuing && raw.trim_start().starts_with('#') { "" } else { raw };
        let line = if continuing { line.trim_start() } else { line };
        let (body, continues) = match line.trim_end().strip_suffix('\\') {
            Some(body) => (body, true),
            None => (line.trim_end(), false),
        };
        current.push_str(body);
        continuing = continues;
        if continues {
            continue;
        }

        let entry = std::mem::take(&mut current);
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.starts_with('$') && !entry.contains(':') {
            match parse_macro(entry) {
                Some((name, value)) => {
                    vars.insert(name, value);
                }
                None => tracing::warn!(line = entry, "unusable macro definition"),
            }
            continue;
        }
        entries.push(expand_variables(entry, &vars));
    }
    if !current.trim().is_empty() {
        entries.push(expand_variables(current.trim(), &vars));
    }
    entries
}

fn parse_macro(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix('$')?;
    let eq = rest.find('=')?;
    let name = &rest[..eq];
    if name.is_empty() || name.len() > 32 || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    // Whitespace inside the value is dropped.
    let value: String = rest[eq + 1..].chars().filter(|c| !c.is_whitespace()).collect();
    if value.is_empty() {
        return None;
    }
    Some((name.to_string(), value))
}

// Expand `$name` references. A `!` or `@` modifier directly before a
// reference distributes over each comma-separated element of the value.
fn expand_variables(entry: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(entry.len());
    let mut chars = entry.chars().peekable();
    let mut modifier: Option<char> = None;

    while let Some(c) = chars.next() {
        if c == '$' {
            let mut name = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_alphanumeric() {
                    name.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            match vars.get(&name) {
                Some(value) => {
                    let modifier = modifier.take();
                    for (i, element) in value.split(',').enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        if let Some(m) = modifier {
                            out.push(m);
                        }
                        out.push_str(element);
                    }
                }
                None => {
                    if let Some(m) = modifier.take() {
                        out.push(m);
                    }
                    out.push('$');
                    out.push_str(&name);
                }
            }
        } else if c == SUB_NEGATE || c == SUB_POISON {
            if let Some(m) = modifier.replace(c) {
                out.push(m);
            }
        } else {
            if let Some(m) = modifier.take() {
                out.push(m);
            }
            out.push(c);
        }
    }
    if let Some(m) = modifier {
        out.push(m);
    }
    out
}

fn comma_split(text: &str) -> Vec<String> {
    text.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_entry(entry: &str) -> Result<Site, Error> {
    let err = |name: &str, reason: &str| Error::BadEntry {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut site = Site { entry: entry.to_string(), ..Site::default() };

    let (name_field, rest) = entry.split_once(':').ok_or_else(|| err(entry, "missing field 2"))?;
    let (patterns_field, rest) = rest.split_once(':').ok_or_else(|| err(name_field, "missing field 3"))?;
    let (flags_field, param) = rest.split_once(':').ok_or_else(|| err(name_field, "missing field 4"))?;

    // Field 1: name, with optional /exclusion list.
    match name_field.split_once('/') {
        Some((name, exclusions)) => {
            site.name = name.to_string();
            site.exclusions = comma_split(exclusions);
        }
        None => site.name = name_field.to_string(),
    }
    if site.name.is_empty() {
        return Err(err(entry, "empty site name"));
    }

    // Field 2: patterns, with optional /distribution list.
    match patterns_field.split_once('/') {
        Some((patterns, dists)) => {
            site.patterns = comma_split(patterns);
            site.distributions = comma_split(dists);
        }
        None => site.patterns = comma_split(patterns_field),
    }

    // Field 3: flags.
    for flag in flags_field.split(',') {
        let flag = flag.trim();
        if flag.is_empty() {
            continue;
        }
        let mut chars = flag.chars();
        let key = chars.next().unwrap();
        let arg = chars.as_str();
        match key {
            '<' => site.max_size = arg.parse().unwrap_or(0),
            '>' => site.min_size = arg.parse().unwrap_or(0),
            'A' => {
                for c in arg.chars() {
                    match c {
                        'c' => {
                            site.ignore_control = true;
                            site.control_only = false;
                        }
                        'C' => {
                            site.control_only = true;
                            site.ignore_control = false;
                        }
                        'd' => site.dist_required = true,
                        'e' => site.dont_want_non_exist = true,
                        'f' => site.drop_filtered = true,
                        'o' => site.need_overview_creation = true,
                        'O' => site.feed_without_originator = true,
                        'p' => site.ignore_path = true,
                        _ => return Err(err(&site.name, "unknown A param in field 3")),
                    }
                }
            }
            'B' => {
                let (start, stop) = match arg.split_once('/') {
                    Some((a, b)) => (a, b),
                    None => (arg, ""),
                };
                site.start_writing = start.parse().unwrap_or(0);
                site.stop_writing = stop.parse().unwrap_or(0);
            }
            'C' => site.cross_count = arg.parse().unwrap_or(1),
            'F' => {
                if arg.is_empty() {
                    return Err(err(&site.name, "missing file name for F param"));
                }
                site.spool_file = Some(arg.to_string());
            }
            'G' => site.group_count = arg.parse().unwrap_or(1),
            'H' => site.hops = arg.parse().unwrap_or(1),
            'I' => site.flush_point = arg.parse().unwrap_or(0),
            'N' => {
                for c in arg.chars() {
                    match c {
                        'm' => site.just_moderated = true,
                        'u' => site.just_unmoderated = true,
                        _ => return Err(err(&site.name, "unknown N param in field 3")),
                    }
                }
            }
            'O' => {
                if arg.is_empty() {
                    return Err(err(&site.name, "missing originator for O param"));
                }
                site.originators = arg.split('/').map(str::to_string).collect();
            }
            'P' => site.nice = arg.parse().unwrap_or(0),
            'S' => site.start_spooling = arg.parse().unwrap_or(0),
            'T' => {
                site.kind = match arg.chars().next() {
                    Some('f') => FeedKind::File,
                    Some('c') => FeedKind::Channel,
                    Some('x') => FeedKind::Exploder,
                    Some('m') => FeedKind::Funnel,
                    Some('l') => FeedKind::LogOnly,
                    Some('p') => FeedKind::Program,
                    _ => return Err(err(&site.name, "unknown T param in field 3")),
                }
            }
            'U' => site.follow_count = arg.parse().unwrap_or(1),
            'W' => {
                for c in arg.chars() {
                    let item = FeedItem::from_char(c)
                        .ok_or_else(|| err(&site.name, "unknown W param in field 3"))?;
                    if item == FeedItem::FunnelNames {
                        site.fnl_wants_names = true;
                    }
                    site.file_flags.push(item);
                }
            }
            _ => return Err(err(&site.name, "unknown field 3 flag")),
        }
    }

    if site.file_flags.is_empty() {
        site.file_flags.push(FeedItem::Name);
    }
    if site.flush_point != 0 && site.kind != FeedKind::File {
        return Err(err(&site.name, "I param with non-file feed"));
    }
    if site.flush_point == 0 && site.kind == FeedKind::File {
        site.flush_point = SITE_BUFFER_SIZE;
    }

    site.param = param.to_string();
    if site.param.is_empty()
        && site.name != "ME"
        && !matches!(site.kind, FeedKind::File | FeedKind::LogOnly)
    {
        return Err(err(&site.name, "empty field 4"));
    }

    // Program parameters take the token through one %s; a funnel-name
    // substitution is exactly one *.
    if site.kind == FeedKind::Program {
        let mut percent = 0;
        let mut rest = site.param.as_str();
        while let Some(i) = rest.find('%') {
            match rest.as_bytes().get(i + 1) {
                Some(&b'%') => rest = &rest[i + 2..],
                Some(&b's') => {
                    percent += 1;
                    rest = &rest[i + 2..];
                }
                _ => return Err(err(&site.name, "bad sprintf format for field 4")),
            }
        }
        if percent > 1 {
            return Err(err(&site.name, "bad (extra) sprintf format for field 4"));
        }
        if site.fnl_wants_names && site.param.matches('*').count() != 1 {
            return Err(err(&site.name, "multiple or no *'s in field 4"));
        }
    }

    Ok(site)
}

#[cfg(test)]
mod test {
    use super::*;

    const BASIC: &str = "\
# feeds
ME:*,!junk,!control::

full:*:Tf,Wnm:
channel!:*,@alt.binaries.*:Tc,W*,H2:/usr/bin/feeder
funnel-a/peer.example:comp.*:Tm:channel!
log:*:Tl:
";

    #[test]
    fn parse_basic_file() {
        let feeds = Newsfeeds::parse(BASIC).unwrap();
        assert_eq!(feeds.me.patterns, vec!["*", "!junk", "!control"]);
        assert_eq!(feeds.sites.len(), 4);

        let full = &feeds.sites[feeds.find("full").unwrap()];
        assert_eq!(full.kind, FeedKind::File);
        assert_eq!(full.file_flags, vec![FeedItem::Name, FeedItem::MessageId]);
        assert_eq!(full.flush_point, SITE_BUFFER_SIZE);

        let chan = &feeds.sites[feeds.find("channel!").unwrap()];
        assert_eq!(chan.kind, FeedKind::Channel);
        assert_eq!(chan.hops, 2);
        assert!(chan.fnl_wants_names);
        assert_eq!(chan.param, "/usr/bin/feeder");

        let funnel = &feeds.sites[feeds.find("funnel-a").unwrap()];
        assert_eq!(funnel.kind, FeedKind::Funnel);
        assert_eq!(funnel.funnel, feeds.find("channel!"));
        assert_eq!(funnel.exclusions, vec!["peer.example"]);
    }

    #[test]
    fn exactly_one_me_required() {
        assert!(matches!(Newsfeeds::parse("site:*:Tf:\n"), Err(Error::MissingMe)));
        let double = "ME:*::\n\nME:*::\n\nsite:*:Tf:\n";
        assert!(matches!(Newsfeeds::parse(double), Err(Error::MissingMe)));
    }

    #[test]
    fn funnel_to_funnel_is_fatal() {
        let text = "ME:*::\n\na:*:Tm:b\nb:*:Tm:a\n";
        assert!(matches!(Newsfeeds::parse(text), Err(Error::FunnelCycle(_, _))));
        let text = "ME:*::\n\na:*:Tm:nowhere\n";
        assert!(matches!(Newsfeeds::parse(text), Err(Error::FunnelTarget(_, _))));
    }

    #[test]
    fn masters_patched_for_duplicate_names() {
        let text = "ME:*::\n\ndup:comp.*:Tf:\ndup:rec.*:Tf:\n";
        let feeds = Newsfeeds::parse(text).unwrap();
        assert!(feeds.sites[0].is_master);
        assert_eq!(feeds.sites[1].master, Some(0));
    }

    #[test]
    fn macros_expand_with_modifiers() {
        let text = "$JUNK=junk,control,control.*\n\
                    ME:*::\n\n\
                    peer:*,!$JUNK:Tf:\n";
        let feeds = Newsfeeds::parse(text).unwrap();
        let peer = &feeds.sites[0];
        assert_eq!(peer.patterns, vec!["*", "!junk", "!control", "!control.*"]);
    }

    #[test]
    fn continuation_lines_join() {
        let text = "ME:*::\n\npeer\\\n  :comp.*\\\n  :Tf:\n";
        let feeds = Newsfeeds::parse(text).unwrap();
        assert_eq!(feeds.sites[0].name, "peer");
        assert_eq!(feeds.sites[0].patterns, vec!["comp.*"]);
    }

    #[test]
    fn subscription_last_match_wins() {
        let feeds = Newsfeeds::parse(
            "ME:*,!control,!control.*::\n\npeer:comp.*,!comp.binaries.*,@alt.sex.*:Tf:\n",
        )
        .unwrap();
        let peer = &feeds.sites[0];
        let me = Some(&feeds.me);

        assert!(peer.wants_group(me, "comp.lang.c"));
        assert!(!peer.wants_group(me, "comp.binaries.pictures"));
        assert!(!peer.wants_group(me, "control.cancel"));
        assert!(!peer.wants_group(me, "alt.sex.stories"));
        assert!(peer.poisons_group(me, "alt.sex.stories"));
        assert!(!peer.poisons_group(me, "comp.lang.c"));
    }

    #[test]
    fn program_format_validation() {
        assert!(Newsfeeds::parse("ME:*::\n\np:*:Tp:/bin/prog %s\n").is_ok());
        assert!(Newsfeeds::parse("ME:*::\n\np:*:Tp:/bin/prog %s %s\n").is_err());
        assert!(Newsfeeds::parse("ME:*::\n\np:*:Tp:/bin/prog %d\n").is_err());
    }

    #[test]
    fn hosts_reexport() {
        let table = HostTable::parse("peer.example:pw\n").unwrap();
        assert_eq!(table.find("peer.example").unwrap().password, "pw");
    }
}
