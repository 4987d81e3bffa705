//! Misbehaviour scoring for header peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

#[derive(Default)]
pub struct PeerBook {
    scores: Mutex<HashMap<SocketAddr, i32>>,
    banned: Mutex<HashMap<SocketAddr, SystemTime>>,
}

impl PeerBook {
    pub fn record_success(&self, addr: SocketAddr) {
        if let Ok(mut scores) = self.scores.lock() {
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_add(3);
        }
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        if let Ok(mut scores) = self.scores.lock() {
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_sub(1);
        }
    }

    /// Invalid or non-linking headers: demote and ban for a while.
    pub fn record_bad_chain(&self, addr: SocketAddr, ban_secs: u64) {
        self.record_failure(addr);
        self.ban_for(addr, ban_secs);
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = SystemTime::now();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        if let Some(until) = banned.get(&addr).copied() {
            if until > now {
                return true;
            }
            banned.remove(&addr);
        }
        false
    }

    pub fn ban_for(&self, addr: SocketAddr, secs: u64) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(addr, SystemTime::now() + Duration::from_secs(secs));
        }
    }

    /// Highest-scored peers worth reconnecting to first.
    pub fn preferred(&self, limit: usize) -> Vec<SocketAddr> {
        if limit == 0 {
            return Vec::new();
        }
        let scores = match self.scores.lock() {
            Ok(scores) => scores,
            Err(_) => return Vec::new(),
        };
        let mut entries: Vec<(SocketAddr, i32)> = scores
            .iter()
            .filter(|(addr, score)| **score > 0 && !self.is_banned(**addr))
            .map(|(addr, score)| (*addr, *score))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(limit);
        entries.into_iter().map(|(addr, _)| addr).collect()
    }
}
