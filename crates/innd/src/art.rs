//! Article processing: canonicalise the headers, run the policy gauntlet,
//! assign numbers, store, file history and overview, and hand the article
//! to every interested site. All rejections funnel through one path that
//! writes the reply, bumps the right counter, and logs one disposition
//! line per article.

use msgid::MsgidHash;
use newsfeeds::wildmat;
use storage::{Retrieve, Spool};

use crate::chan::Channel;
use crate::headers::{self, CleanedArticle, Header};
use crate::server::{Mode, Server};
use crate::site::FeedData;

/// Articles posted further in the future than this are rejected.
const DATE_FUZZ: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reject {
    Duplicate,
    Site,
    Filter,
    Distrib,
    Group,
    Unapproved,
    Other,
}

impl Server {
    /// Process one complete article from a channel. Returns the NNTP
    /// reply line.
    pub fn art_post(&mut self, ch: &mut Channel, wire: &[u8]) -> String {
        let art = match headers::clean(wire) {
            Ok(art) => art,
            Err(reason) => {
                // The headers never came together; still try to remember
                // the ID so it is not offered again.
                let hash = find_header(wire, "Message-ID")
                    .filter(|id| msgid::id_ok(id))
                    .map(|id| MsgidHash::of(&id));
                let feedsite = ch.hostname.clone();
                return self.art_reject(
                    ch,
                    Reject::Other,
                    &feedsite,
                    "(null)",
                    hash,
                    &reason,
                    wire.len(),
                );
            }
        };

        let msgid_text = art.get(Header::MessageId).unwrap_or("(null)").to_string();
        let hash = MsgidHash::of(&msgid_text);
        let path_value = art.get_or_empty(Header::Path).to_string();
        let hops = parse_path(&path_value);
        let feedsite = hops.first().cloned().unwrap_or_else(|| ch.hostname.clone());
        let size_on_wire = wire.len();

        let reject = |server: &mut Server, ch: &mut Channel, kind, reason: &str| {
            server.art_reject(ch, kind, &feedsite, &msgid_text, Some(hash), reason, size_on_wire)
        };

        // Duplicate suppression is the first gate.
        if self.history.have(hash) {
            ch.duplicate_size += size_on_wire as u64;
            return self.art_reject(
                ch,
                Reject::Duplicate,
                &feedsite,
                &msgid_text,
                None,
                "Duplicate article",
                size_on_wire,
            );
        }

        // Newsgroups header hygiene.
        let newsgroups_value = art.get_or_empty(Header::Newsgroups).to_string();
        if newsgroups_value.contains(':') {
            return reject(self, ch, Reject::Other, "Colon in \"Newsgroups\" header");
        }
        if newsgroups_value.chars().any(char::is_whitespace) {
            return reject(self, ch, Reject::Other, "Whitespace in \"Newsgroups\" header");
        }

        // Date policy.
        let posted = match parse_date(art.get_or_empty(Header::Date)) {
            Some(t) => t,
            None => return reject(self, ch, Reject::Other, "Bad \"Date\" header"),
        };
        let cutoff = self.cfg.art_cutoff.as_secs() as i64;
        if cutoff > 0 && posted < self.now - cutoff {
            return reject(self, ch, Reject::Other, "Too old");
        }
        if posted > self.now + DATE_FUZZ {
            return reject(self, ch, Reject::Other, "Article posted in the future");
        }
        let expires = art.get(Header::Expires).and_then(parse_date);

        if self.cfg.linecount_fuzz > 0 {
            if let Some(claimed) = art.get(Header::Lines).and_then(|v| v.parse::<i64>().ok()) {
                let delta = art.lines as i64 - claimed;
                if delta.abs() > self.cfg.linecount_fuzz {
                    let reason = format!("Linecount {} != {}", claimed, art.lines);
                    return reject(self, ch, Reject::Other, &reason);
                }
            }
        }

        // Unwanted sites in the Path.
        for exclusion in &self.me.exclusions.clone() {
            if hops.iter().any(|h| h.eq_ignore_ascii_case(exclusion)) {
                let reason = format!("Unwanted site {exclusion} in path");
                return reject(self, ch, Reject::Site, &reason);
            }
        }

        // Registered filter hooks.
        let veto = self.filters.iter().find_map(|f| f.filter(&art));
        if let Some(reason) = veto {
            return reject(self, ch, Reject::Filter, &reason);
        }

        // Distribution policy.
        let distributions: Option<Vec<String>> = match art.get(Header::Distribution) {
            Some(value) => {
                let list: Vec<String> = value
                    .split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect();
                if list.is_empty() {
                    return reject(self, ch, Reject::Distrib, "Bogus distribution");
                }
                Some(list)
            }
            None => None,
        };
        if let Some(dists) = &distributions {
            if !self.me.distributions.is_empty()
                && !dist_want_any(&self.me.distributions, dists)
            {
                let reason = format!("Unwanted distribution \"{}\"", dists[0]);
                return reject(self, ch, Reject::Distrib, &reason);
            }
        }

        // Per-article site scratch.
        for s in &mut self.sites {
            s.reset_scratch();
        }

        // Control messages: `cancel`, `newgroup`, handler words. Groups
        // named `foo.ctl` count as `foo`.
        let control_value = art.get_or_empty(Header::Control).to_string();
        let is_control = !control_value.is_empty();
        let control_word = control_value
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        let like_newgroup = control_word == "newgroup" || control_word == "rmgroup";
        let approved = art.get(Header::Approved).is_some();

        let mut groups: Vec<String> = newsgroups_value
            .split(',')
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();
        if is_control {
            for g in &mut groups {
                if let Some(base) = g.strip_suffix(".ctl") {
                    *g = base.to_string();
                }
            }
        }
        let group_count = groups.len();
        let follow_count = {
            let f = art
                .get_or_empty(Header::FollowupTo)
                .split(',')
                .filter(|g| !g.trim().is_empty())
                .count();
            if f == 0 {
                group_count
            } else {
                f
            }
        };

        // Walk the newsgroups: decide filing and mark interested sites.
        let peer_patterns = self
            .hosts
            .find(&ch.hostname)
            .and_then(|h| h.patterns.clone());
        let mut filed: Vec<usize> = Vec::new();
        let mut accepted = false;
        let mut group_missing = false;
        let mut non_exist = false;
        let mut no_history_update = false;

        for name in &groups {
            let Some(gi) = self.active.find(name) else {
                group_missing = true;
                if like_newgroup && approved {
                    // A newgroup/rmgroup for a group we don't carry still
                    // goes to every site that would want that group.
                    let control_gi = self.active.find("control");
                    for i in 0..self.sites.len() {
                        if self.sites[i].config.wants_group(Some(&self.me), name) {
                            self.site_mark(i, control_gi);
                        }
                    }
                    accepted = true;
                } else {
                    non_exist = true;
                }
                for i in 0..self.sites.len() {
                    if (self.sites[i].config.has_poison_patterns()
                        || self.me.has_poison_patterns())
                        && self.sites[i].config.poisons_group(Some(&self.me), name)
                    {
                        self.sites[i].poison = true;
                    }
                }
                continue;
            };

            self.active.group_mut(gi).post_count = 0;
            let flag = self.active.group(gi).flag.clone();

            if flag == active::GroupFlag::Excluded {
                for si in self.group_poison[gi].clone() {
                    self.sites[si].poison = true;
                }
                continue;
            }
            if flag == active::GroupFlag::Moderated && !approved {
                let reason = format!("Unapproved for \"{name}\"");
                return reject(self, ch, Reject::Unapproved, &reason);
            }

            for si in self.group_poison[gi].clone() {
                self.sites[si].poison = true;
            }

            // May this peer feed this group at all?
            match can_post(peer_patterns.as_deref(), name) {
                0 if peer_patterns.is_some() => {
                    no_history_update = true;
                    continue;
                }
                -1 => {
                    let reason = format!("Won't accept posts in \"{name}\"");
                    ch.unwanted_group += 1;
                    self.art_log('-', &feedsite, &msgid_text, Some(&reason));
                    return format!("437 {reason}");
                }
                _ => {}
            }

            accepted = true;
            for si in self.group_feeds[gi].clone() {
                if !self.sites[si].poison {
                    self.site_mark(si, Some(gi));
                }
            }

            if flag == active::GroupFlag::Junked {
                // Fed to sites but never filed here.
                continue;
            }
            // Crossposts into aliased groups can name the same target
            // twice; the numbering pass skips the repeats by post_count.
            let fi = self.active.resolve_alias(gi);
            self.active.group_mut(fi).post_count = 0;
            filed.push(fi);
        }

        // Undo marks for poisoned and filtered-out sites.
        for s in &mut self.sites {
            if s.poison
                || (s.config.control_only && !is_control)
                || (s.config.dont_want_non_exist && non_exist)
            {
                s.sendit = false;
            }
        }

        // Control messages are filed in control.<word> (or control), not
        // in the groups they were posted to.
        let mut control_store = false;
        if is_control && accepted {
            filed.clear();
            let specific = format!("control.{control_word}");
            if let Some(gi) = self
                .active
                .find(&specific)
                .or_else(|| self.active.find("control"))
            {
                control_store = true;
                self.active.group_mut(gi).post_count = 0;
                filed.push(gi);
                for si in self.group_feeds[gi].clone() {
                    if !self.sites[si].poison {
                        self.site_mark(si, Some(gi));
                    }
                }
            }
        }

        // Nothing real accepted the article: trash policy, then junk.
        let mut junked = false;
        if !accepted || filed.is_empty() {
            if !accepted {
                let reason = if no_history_update {
                    format!("Can't post to \"{}\"", truncate(&newsgroups_value))
                } else {
                    format!("Unwanted newsgroup \"{}\"", truncate(&newsgroups_value))
                };
                // Without want-trash (or when every group was an `x`
                // entry) the article is dropped here.
                if !self.cfg.want_trash || !group_missing {
                    let remember = if no_history_update { None } else { Some(hash) };
                    return self.art_reject(
                        ch,
                        Reject::Group,
                        &feedsite,
                        &msgid_text,
                        remember,
                        &reason,
                        size_on_wire,
                    );
                }
                junked = true;
            }
            match self.active.find("junk") {
                Some(gi) => {
                    self.active.group_mut(gi).post_count = 0;
                    filed.push(gi);
                    for si in self.group_feeds[gi].clone() {
                        let s = &self.sites[si];
                        if !s.poison && !(s.config.control_only && !is_control) {
                            self.site_mark(si, Some(gi));
                        }
                    }
                }
                None => {
                    if filed.is_empty() {
                        return reject(self, ch, Reject::Group, "Unwanted newsgroup");
                    }
                }
            }
        }

        // Article numbering: ours, or the upstream's in slave mode.
        let xref_value;
        let replic;
        if self.cfg.xrefslave {
            let Some(peer_xref) = art.get(Header::Xref).map(str::to_string) else {
                return reject(
                    self,
                    ch,
                    Reject::Other,
                    "Xref header required in xrefslave mode",
                );
            };
            filed.clear();
            let mut parts: Vec<String> = Vec::new();
            for entry in overview::parse_xref(&peer_xref) {
                let Some(gi) = self.active.find(&entry.group) else {
                    tracing::error!(group = %entry.group, "bad_newsgroup in Xref");
                    continue;
                };
                if self.active.group(gi).post_count > 0 {
                    continue;
                }
                if let Err(e) = self.active.adopt_last(gi, entry.artnum as u64) {
                    tracing::error!(group = %entry.group, error = %e, "cant update_active");
                    continue;
                }
                self.active.group_mut(gi).post_count += 1;
                filed.push(gi);
                parts.push(format!("{}:{}", entry.group, entry.artnum));
            }
            if filed.is_empty() {
                return reject(
                    self,
                    ch,
                    Reject::Other,
                    "Xref header invalid in xrefslave mode",
                );
            }
            let host = peer_xref.split_whitespace().next().unwrap_or("");
            replic = parts.join(" ");
            xref_value = format!("{host} {replic}");
        } else {
            let mut parts: Vec<String> = Vec::new();
            for &gi in &filed {
                // Already filed here through an alias.
                if self.active.group(gi).post_count > 0 {
                    continue;
                }
                self.active.group_mut(gi).post_count += 1;
                match self.active.bump_last(gi) {
                    Ok(n) => parts.push(format!("{}:{}", self.active.group(gi).name, n)),
                    Err(e) => {
                        tracing::error!(error = %e, "cant update_active");
                    }
                }
            }
            replic = parts.join(" ");
            xref_value = format!("{} {replic}", self.cfg.pathhost);
        }
        // Numbering consumed the scratch flags; clear them for the next
        // article.
        for &gi in &filed {
            self.active.group_mut(gi).post_count = 0;
        }
        let stored_group = replic.split(':').next().unwrap_or("").to_string();

        // Rebuild the article for storage: rewritten Path, synthesized
        // Lines, reconstructed Xref.
        let new_path_value = rewrite_path(
            &self.cfg.pathhost,
            self.cfg.pathalias.as_deref(),
            &path_value,
        );
        let mut headers_text = String::new();
        for (name, value) in &art.header_lines {
            if name == "Path" {
                headers_text.push_str(&format!("Path: {new_path_value}\r\n"));
            } else {
                headers_text.push_str(&format!("{name}: {value}\r\n"));
            }
        }
        if art.get(Header::Lines).is_none() {
            headers_text.push_str(&format!("Lines: {}\r\n", art.lines));
        }
        headers_text.push_str(&format!("Xref: {xref_value}\r\n"));

        let mut stored = Vec::with_capacity(headers_text.len() + 2 + art.body.len());
        stored.extend_from_slice(headers_text.as_bytes());
        stored.extend_from_slice(b"\r\n");
        stored.extend_from_slice(&art.body);
        let size = stored.len() as u64;

        let token = match self.spool.store(&stored) {
            Ok(token) => token,
            Err(storage::Error::NoMatch) => {
                self.throttle("no matching storage class");
                ch.unwanted_other += 1;
                self.art_log('-', &feedsite, &msgid_text, Some("cant store article"));
                return "436 cant store article".to_string();
            }
            Err(e) => {
                let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
                self.io_error("storing article", &io);
                ch.unwanted_other += 1;
                self.art_log('-', &feedsite, &msgid_text, Some("cant store article"));
                return "436 cant store article".to_string();
            }
        };
        let token_text = token.to_text();

        // History is the authority; a failed write bounces the article.
        if !self.running() {
            let reason = match &self.mode {
                Mode::Paused(r) | Mode::Throttled(r) => r.clone(),
                Mode::Running => String::new(),
            };
            return format!("436 {reason}");
        }
        if let Err(e) = self.history.write(hash, self.now, posted, expires, token) {
            tracing::error!(error = %e, msgid = %msgid_text, "cant write history");
            let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
            self.io_error("writing history", &io);
            self.art_log('-', &feedsite, &msgid_text, Some("cant write history"));
            return "436 cant write history".to_string();
        }

        // Overview.
        let overview_line = self.build_overview_line(&art, size, &xref_value, &newsgroups_value);
        let overview_ok = match self.overview.add(token, &overview_line) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, token = %token_text, "cant store overview");
                false
            }
        };

        if art.cr_without_lf > 0 || art.lf_without_cr > 0 {
            tracing::info!(
                cr_without_lf = art.cr_without_lf,
                lf_without_cr = art.lf_without_cr,
                msgid = %msgid_text,
                "line ending mismatches"
            );
        }
        ch.size += size;

        // Propagate.
        self.art_propagate(
            &art,
            &hops,
            distributions.as_deref(),
            control_store,
            overview_ok,
            group_count,
            follow_count,
            size,
        );

        let all_names: String = self
            .sites
            .iter()
            .filter(|s| s.sendit)
            .map(|s| s.config.name.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        self.art_log(
            if junked { 'j' } else { '+' },
            &feedsite,
            &msgid_text,
            if all_names.is_empty() { None } else { Some(&all_names) },
        );

        let hash_text = hash.to_hex();
        let dist_text = distributions
            .as_ref()
            .map(|d| d.join(","))
            .unwrap_or_else(|| "?".to_string());
        let data = FeedData {
            token_text: &token_text,
            hash_text: &hash_text,
            size,
            msgid: &msgid_text,
            newsgroups: &newsgroups_value,
            distribution: &dist_text,
            headers: Some(&headers_text),
            overview: Some(&overview_line),
            path_value: &new_path_value,
            replic: &replic,
            stored_group: &stored_group,
            time_received: self.now,
            posted,
            expires: expires.unwrap_or(0),
            feedsite: &feedsite,
            all_names: &all_names,
        };
        for i in 0..self.sites.len() {
            if self.sites[i].sendit {
                self.site_send(i, &data);
            }
        }

        // Control execution happens after the article is safely down.
        let poster = art
            .get(Header::Sender)
            .or_else(|| art.get(Header::From))
            .unwrap_or("")
            .to_string();
        if accepted {
            if is_control {
                let reply_to = art
                    .get(Header::ReplyTo)
                    .or_else(|| art.get(Header::From))
                    .unwrap_or("")
                    .to_string();
                self.art_control(&control_value, &poster, &reply_to, &token_text, &feedsite);
            }
            if let Some(sup) = art.get(Header::Supersedes).map(str::to_string) {
                if msgid::id_ok(&sup) {
                    self.art_cancel(&sup, &poster, &feedsite, false);
                }
            }
        }

        "235 Article transferred ok".to_string()
    }

    // One reject path: counter, disposition log, optional trash memory.
    #[allow(clippy::too_many_arguments)]
    fn art_reject(
        &mut self,
        ch: &mut Channel,
        kind: Reject,
        feedsite: &str,
        msgid_text: &str,
        hash: Option<MsgidHash>,
        reason: &str,
        _size: usize,
    ) -> String {
        match kind {
            Reject::Duplicate => ch.duplicate += 1,
            Reject::Site => ch.unwanted_site += 1,
            Reject::Filter => ch.unwanted_filter += 1,
            Reject::Distrib => ch.unwanted_dist += 1,
            Reject::Group => ch.unwanted_group += 1,
            Reject::Unapproved => ch.unwanted_unapproved += 1,
            Reject::Other => ch.unwanted_other += 1,
        }
        self.art_log('-', feedsite, msgid_text, Some(reason));
        if let Some(hash) = hash {
            if self.cfg.remember_trash && self.running() && !self.history.have(hash) {
                if let Err(e) = self.history.remember(hash, self.now) {
                    tracing::error!(error = %e, "cant write history");
                }
            }
        }
        format!("437 {reason}")
    }

    /// One line per article in the disposition log: `+` accepted,
    /// `j` junked, `-` rejected, `c` cancelled.
    fn art_log(&self, code: char, feedsite: &str, msgid_text: &str, text: Option<&str>) {
        match text {
            Some(text) => {
                tracing::info!(target: "art", "{code} {feedsite} {msgid_text} {text}")
            }
            None => tracing::info!(target: "art", "{code} {feedsite} {msgid_text}"),
        }
    }

    fn build_overview_line(
        &mut self,
        art: &CleanedArticle,
        size: u64,
        xref_value: &str,
        newsgroups_value: &str,
    ) -> String {
        let schema = self.overview.schema().clone();
        let mut fields: Vec<String> = Vec::with_capacity(schema.fields.len());
        for f in &schema.fields {
            let raw: String = if f.name.eq_ignore_ascii_case("Bytes") {
                size.to_string()
            } else if f.name.eq_ignore_ascii_case("Lines") {
                art.get(Header::Lines)
                    .map(str::to_string)
                    .unwrap_or_else(|| art.lines.to_string())
            } else if f.name.eq_ignore_ascii_case("Xref") {
                xref_value.to_string()
            } else if f.name.eq_ignore_ascii_case("Newsgroups") {
                newsgroups_value.to_string()
            } else {
                match Header::lookup(&f.name) {
                    Some(h) => art.get_or_empty(h).to_string(),
                    None => art
                        .header_lines
                        .iter()
                        .find(|(n, _)| n.eq_ignore_ascii_case(&f.name))
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default(),
                }
            };
            let clean: String = raw
                .chars()
                .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
                .collect();
            if f.full && !clean.is_empty() {
                fields.push(format!("{}: {}", f.name, clean));
            } else {
                fields.push(clean);
            }
        }
        fields.join("\t")
    }

    // Decide, site by site, who really gets the article.
    #[allow(clippy::too_many_arguments)]
    fn art_propagate(
        &mut self,
        art: &CleanedArticle,
        hops: &[String],
        distributions: Option<&[String]>,
        control_store: bool,
        overview_ok: bool,
        group_count: usize,
        follow_count: usize,
        size: u64,
    ) {
        let cross_count = group_count + follow_count * follow_count;
        let xtrace_host = art
            .get_or_empty(Header::XTrace)
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();

        for i in 0..self.sites.len() {
            {
                let s = &mut self.sites[i];
                if (s.config.ignore_control && control_store)
                    || (s.config.need_overview_creation && !overview_ok)
                {
                    s.sendit = false;
                }
                if s.seenit || !s.sendit {
                    continue;
                }
                s.sendit = false;
            }
            let c = self.sites[i].config.clone();

            if !c.originators.is_empty() {
                if xtrace_host.is_empty() {
                    if !c.feed_without_originator {
                        continue;
                    }
                } else {
                    let mut sendit = false;
                    for pat in &c.originators {
                        if let Some(neg) = pat.strip_prefix('@') {
                            if wildmat(&xtrace_host, neg) {
                                sendit = false;
                                break;
                            }
                        } else if wildmat(&xtrace_host, pat) {
                            sendit = true;
                        }
                    }
                    if !sendit {
                        continue;
                    }
                }
            }

            if let Some(m) = c.master {
                if self.sites[m].seenit {
                    continue;
                }
            }
            if c.max_size > 0 && size > c.max_size {
                continue;
            }
            if c.min_size > 0 && size < c.min_size {
                continue;
            }

            if c.hops > 0 && hops.len() as u32 > c.hops {
                continue;
            }
            if !c.ignore_path && hops.iter().any(|h| h.eq_ignore_ascii_case(&c.name)) {
                continue;
            }
            if c.group_count > 0 && group_count as u32 > c.group_count {
                continue;
            }
            if c.follow_count > 0 && follow_count as u32 > c.follow_count {
                continue;
            }
            if c.cross_count > 0 && cross_count as u32 > c.cross_count {
                continue;
            }

            match distributions {
                Some(dists) => {
                    if !c.distributions.is_empty() && !dist_want_any(&c.distributions, dists) {
                        continue;
                    }
                }
                None => {
                    if c.dist_required {
                        continue;
                    }
                }
            }

            if c
                .exclusions
                .iter()
                .any(|e| hops.iter().any(|h| h.eq_ignore_ascii_case(e)))
            {
                continue;
            }

            self.sites[i].sendit = true;
            self.sites[i].seenit = true;
            if let Some(m) = c.master {
                self.sites[m].seenit = true;
            }
        }

        // Funnels: redirect the send into the target, collecting names.
        for i in 0..self.sites.len() {
            if !self.sites[i].sendit {
                continue;
            }
            let Some(f) = self.sites[i].config.funnel else { continue };
            self.sites[i].sendit = false;
            let name = self.sites[i].config.name.clone();
            let target = &mut self.sites[f];
            target.sendit = true;
            if target.config.fnl_wants_names {
                if !target.fnl_names.is_empty() {
                    target.fnl_names.push(' ');
                }
                target.fnl_names.push_str(&name);
            }
        }
    }

    // ---- control messages & cancels ---------------------------------------

    fn art_control(
        &mut self,
        control_value: &str,
        poster: &str,
        reply_to: &str,
        token_text: &str,
        feedsite: &str,
    ) {
        let mut words = control_value.split_whitespace();
        let word = words.next().unwrap_or("").to_ascii_lowercase();
        let rest = words.next().unwrap_or("");

        if word == "cancel" {
            if msgid::id_ok(rest) {
                self.art_cancel(rest, poster, feedsite, false);
            }
            return;
        }

        if word == "ihave" || word == "sendme" {
            if rest.is_empty() {
                tracing::info!(word = %word, "malformed control: no site");
                return;
            }
            if rest == self.cfg.pathhost {
                tracing::info!(feedsite, word = %word, "control from our own replicant");
                return;
            }
            if !self.sites.iter().any(|s| s.config.name.eq_ignore_ascii_case(rest)) {
                tracing::error!(feedsite, word = %word, site = rest, "control names unknown site");
                return;
            }
        }

        // Every other word runs the matching handler program; anything
        // unsafe or missing runs the fallback handler.
        let safe = !word.is_empty() && !word.contains('/') && !word.contains("..");
        let mut handler = self.cfg.control_dir.join(if safe { word.as_str() } else { "default" });
        if !is_executable(&handler) {
            handler = self.cfg.control_dir.join("default");
            if !is_executable(&handler) {
                tracing::info!(word = %word, "no control handler");
                return;
            }
        }
        let poster = clean_from(poster);
        let reply_to = clean_from(reply_to);
        match std::process::Command::new(&handler)
            .arg(&poster)
            .arg(&reply_to)
            .arg(token_text)
            .arg(feedsite)
            .stdin(std::process::Stdio::null())
            .spawn()
        {
            Ok(child) => self.procs.watch(child, None, self.now),
            Err(e) => {
                tracing::error!(handler = %handler.display(), error = %e, "cant spawn control handler")
            }
        }
    }

    /// Cancel by message-ID, on behalf of `poster`. Trusted callers
    /// (ctlinnd, MODE CANCEL) skip the poster match.
    pub fn art_cancel(&mut self, id: &str, poster: &str, feedsite: &str, trusted: bool) {
        if !msgid::id_ok(id) {
            tracing::info!(feedsite, id = %id, "bad cancel Message-ID");
            return;
        }
        let hash = MsgidHash::of(id);

        if !self.history.have(hash) {
            // Never saw the target: remember the cancel so the article is
            // refused if it shows up later.
            if self.cfg.verify_cancels && !trusted {
                return;
            }
            if let Err(e) = self.history.remember(hash, self.now) {
                tracing::error!(error = %e, "cant write history");
            }
            self.art_log('c', feedsite, id, Some("Cancelling"));
            return;
        }

        let token = if self.cfg.verify_cancels && !trusted {
            self.art_cancel_verify(poster, id, hash, feedsite)
        } else {
            self.history.token_for(hash).ok().flatten()
        };
        let Some(token) = token else { return };

        if let Err(e) = self.spool.cancel(token) {
            if !matches!(e, storage::Error::NotFound) {
                tracing::error!(token = %token.to_text(), error = %e, "cant cancel");
            }
        }
        self.art_log('c', feedsite, id, Some("Cancelling"));
    }

    /// Trusted entry point for the control channel and MODE CANCEL.
    pub fn art_cancel_by_id(
        &mut self,
        id: &str,
        feedsite: &str,
        trusted: bool,
    ) -> Result<(), String> {
        if !msgid::id_ok(id) {
            return Err("bad message-id".to_string());
        }
        self.art_cancel(id, "", feedsite, trusted);
        Ok(())
    }

    // The canceller must match the stored article's Sender (or From).
    fn art_cancel_verify(
        &mut self,
        poster: &str,
        id: &str,
        hash: MsgidHash,
        feedsite: &str,
    ) -> Option<storage::Token> {
        let token = self.history.token_for(hash).ok().flatten()?;
        let head = self.spool.retrieve(token, Retrieve::Head).ok()?;
        let stored_poster =
            find_header(&head, "Sender").or_else(|| find_header(&head, "From"))?;
        let canceller = clean_from(poster);
        let original = clean_from(&stored_poster);
        if canceller != original {
            let reason = format!("\"{canceller}\" wants to cancel {id} by \"{original}\"");
            self.art_log('-', feedsite, id, Some(&reason));
            return None;
        }
        Some(token)
    }
}

/// Split a Path header into its hop list. Host names are letters,
/// digits, dots, dashes, and underscores; anything else separates.
pub fn parse_path(value: &str) -> Vec<String> {
    value
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'))
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Prepend our pathhost (and alias) unless the article already came
/// through us. Idempotent by construction.
pub fn rewrite_path(pathhost: &str, alias: Option<&str>, path_value: &str) -> String {
    let hops = parse_path(path_value);
    let has_same_path = hops.first().map(|h| h == pathhost).unwrap_or(false);
    let add_alias = match alias {
        Some(a) => !hops.iter().any(|h| h == a),
        None => false,
    };
    let alias_part = alias
        .filter(|_| add_alias)
        .map(|a| format!("{a}!"))
        .unwrap_or_default();
    let prefix = format!("{pathhost}!");

    if !has_same_path {
        format!("{prefix}{alias_part}{path_value}")
    } else if add_alias && path_value.starts_with(&prefix) {
        format!("{prefix}{alias_part}{}", &path_value[prefix.len()..])
    } else {
        path_value.to_string()
    }
}

// Last-match-wins check of a peer's group patterns: 1 allowed, 0 no
// match, -1 explicitly forbidden.
fn can_post(patterns: Option<&[String]>, group: &str) -> i32 {
    let Some(patterns) = patterns else { return 1 };
    let mut result = 0;
    for pat in patterns {
        let (value, pat) = match pat.strip_prefix('!') {
            Some(p) => (-1, p),
            None => (1, pat.as_str()),
        };
        if wildmat(group, pat) {
            result = value;
        }
    }
    result
}

/// Does the article's distribution list satisfy a site's wants? A `!`
/// entry is a negation; a list of only negations admits everything it
/// doesn't name.
fn dist_wanted(site_list: &[String], dist: &str) -> bool {
    let mut saw_negation = false;
    for entry in site_list {
        match entry.strip_prefix('!') {
            Some(neg) => {
                saw_negation = true;
                if neg == dist {
                    return false;
                }
            }
            None => {
                if entry == dist {
                    return true;
                }
            }
        }
    }
    saw_negation
}

fn dist_want_any(site_list: &[String], dists: &[String]) -> bool {
    dists.iter().any(|d| dist_wanted(site_list, d))
}

/// Find a header value inside a raw wire-format block, the cheap way:
/// used before full parsing and on retrieved article heads.
pub fn find_header(data: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if let Some((n, v)) = line.split_once(':') {
            if n.eq_ignore_ascii_case(name) {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// Reduce a From/Sender value to the bare address for comparison:
/// comments stripped, `<...>` honoured, whitespace trimmed.
pub fn clean_from(value: &str) -> String {
    // Angle-bracket route address wins outright.
    if let (Some(open), Some(close)) = (value.find('<'), value.rfind('>')) {
        if open < close {
            return value[open + 1..close].trim().to_string();
        }
    }
    // Otherwise drop (comments) and keep the rest.
    let mut out = String::with_capacity(value.len());
    let mut depth = 0usize;
    for c in value.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Parse an article Date header: RFC 2822 with a couple of lenient
/// fallbacks seen in old news software.
pub fn parse_date(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(text) {
        return Some(dt.timestamp());
    }
    for format in ["%d %b %Y %H:%M:%S", "%a, %d %b %Y %H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(
            text.trim_end_matches(" GMT").trim_end_matches(" UTC"),
            format,
        ) {
            return Some(naive.and_utc().timestamp());
        }
    }
    None
}

fn truncate(text: &str) -> String {
    text.chars().take(80).collect()
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_parsing() {
        assert_eq!(
            parse_path("news.example.com!peer!not-for-mail"),
            vec!["news.example.com", "peer", "not-for-mail"]
        );
        assert_eq!(parse_path(""), Vec::<String>::new());
    }

    #[test]
    fn path_rewrite_is_idempotent() {
        let once = rewrite_path("me", None, "peer!poster");
        assert_eq!(once, "me!peer!poster");
        let twice = rewrite_path("me", None, &once);
        assert_eq!(twice, once);

        let with_alias = rewrite_path("me", Some("alias"), "peer!poster");
        assert_eq!(with_alias, "me!alias!peer!poster");
        assert_eq!(rewrite_path("me", Some("alias"), &with_alias), with_alias);
    }

    #[test]
    fn distribution_negation() {
        let wants = vec!["world".to_string(), "!local".to_string()];
        assert!(dist_wanted(&wants, "world"));
        assert!(!dist_wanted(&wants, "local"));
        assert!(!dist_wanted(&wants, "usa"));

        let negs = vec!["!local".to_string()];
        assert!(dist_wanted(&negs, "world"));
        assert!(!dist_wanted(&negs, "local"));
    }

    #[test]
    fn peer_group_patterns() {
        let pats = vec!["comp.*".to_string(), "!comp.binaries.*".to_string()];
        assert_eq!(can_post(Some(pats.as_slice()), "comp.lang.c"), 1);
        assert_eq!(can_post(Some(pats.as_slice()), "comp.binaries.pictures"), -1);
        assert_eq!(can_post(Some(pats.as_slice()), "rec.arts"), 0);
        assert_eq!(can_post(None, "anything"), 1);
    }

    #[test]
    fn from_cleaning() {
        assert_eq!(clean_from("Alice Q. <alice@x.example>"), "alice@x.example");
        assert_eq!(clean_from("alice@x.example (Alice Q.)"), "alice@x.example");
        assert_eq!(clean_from("  alice@x.example  "), "alice@x.example");
    }

    #[test]
    fn date_formats() {
        assert!(parse_date("Mon, 1 Jan 2024 00:00:00 +0000").is_some());
        assert!(parse_date("1 Jan 2024 00:00:00 GMT").is_some());
        assert!(parse_date("not a date").is_none());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn header_find() {
        let wire = b"Path: a!b\r\nMessage-ID: <x@y>\r\n\r\nbody: not a header\r\n";
        assert_eq!(find_header(wire, "message-id").as_deref(), Some("<x@y>"));
        assert_eq!(find_header(wire, "body"), None);
    }
}
