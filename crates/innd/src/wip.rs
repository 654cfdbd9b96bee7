//! Work-in-progress table: which message-IDs are mid-transfer on which
//! channel, so two peers offering the same article at once don't both
//! send it. Claims age out passively after the hold window.

use msgid::MsgidHash;

const WIP_TABLE_SIZE: usize = 1024;

#[derive(Debug, Clone)]
struct WipEntry {
    hash: MsgidHash,
    chan_fd: i32,
    timestamp: i64,
}

pub struct WipTable {
    buckets: Vec<Vec<WipEntry>>,
    hold_secs: i64,
}

impl WipTable {
    pub fn new(hold_secs: i64) -> WipTable {
        WipTable { buckets: vec![Vec::new(); WIP_TABLE_SIZE], hold_secs }
    }

    fn bucket(hash: MsgidHash) -> usize {
        (hash.bucket() as usize) % WIP_TABLE_SIZE
    }

    /// Is this ID being transferred by some other channel inside the hold
    /// window? With `add`, also claim it for `chan_fd` when free.
    pub fn in_progress(&mut self, hash: MsgidHash, chan_fd: i32, add: bool, now: i64) -> bool {
        let bucket = Self::bucket(hash);
        if let Some(entry) = self.buckets[bucket].iter().find(|e| e.hash == hash) {
            if now - entry.timestamp < self.hold_secs {
                return true;
            }
            if entry.chan_fd == chan_fd {
                return true;
            }
        }
        if add {
            self.claim(hash, chan_fd, now);
        }
        false
    }

    /// Claim an ID for a channel, replacing any stale claim.
    pub fn claim(&mut self, hash: MsgidHash, chan_fd: i32, now: i64) {
        let bucket = Self::bucket(hash);
        self.buckets[bucket].retain(|e| e.hash != hash);
        self.buckets[bucket].push(WipEntry { hash, chan_fd, timestamp: now });
    }

    /// Drop a claim, if present.
    pub fn free(&mut self, hash: MsgidHash) {
        if hash.is_empty() {
            return;
        }
        self.buckets[Self::bucket(hash)].retain(|e| e.hash != hash);
    }

    pub fn holder(&self, hash: MsgidHash) -> Option<i32> {
        self.buckets[Self::bucket(hash)]
            .iter()
            .find(|e| e.hash == hash)
            .map(|e| e.chan_fd)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn h(id: &str) -> MsgidHash {
        MsgidHash::of(id)
    }

    #[test]
    fn second_channel_blocked_inside_window() {
        let mut wip = WipTable::new(5);
        assert!(!wip.in_progress(h("<a@b>"), 3, true, 100));
        assert!(wip.in_progress(h("<a@b>"), 4, false, 102));
        // Same channel may re-claim its own ID.
        assert!(wip.in_progress(h("<a@b>"), 3, false, 102));
    }

    #[test]
    fn claims_age_out() {
        let mut wip = WipTable::new(5);
        assert!(!wip.in_progress(h("<a@b>"), 3, true, 100));
        // Window expired and the asker is a different channel.
        assert!(!wip.in_progress(h("<a@b>"), 4, true, 106));
        assert_eq!(wip.holder(h("<a@b>")), Some(4));
    }

    #[test]
    fn free_clears_claim() {
        let mut wip = WipTable::new(5);
        wip.claim(h("<a@b>"), 7, 50);
        assert_eq!(wip.holder(h("<a@b>")), Some(7));
        wip.free(h("<a@b>"));
        assert_eq!(wip.holder(h("<a@b>")), None);
        assert!(!wip.in_progress(h("<a@b>"), 9, false, 51));
    }
}
