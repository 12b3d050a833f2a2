//! Admission filter store
//!
//! Three line-oriented cache files gate incoming connections: a ban list and
//! an allow list keyed by peer IP, and a deny list keyed by User-Agent. Each
//! file splits into literal entries (kept in an ordered map) and glob
//! patterns (kept in a scan list); lines containing `*`, `?` or `[` become
//! globs. A file is re-parsed whenever a lookup notices its mtime changed,
//! so operators can edit the files under a running server.
//!
//! Ban entries additionally carry an expiry (0 = permanent). Lookups never
//! match an expired entry, evict at most one stale entry they come across,
//! and push the expiry of an active abuser forward so that reconnecting does
//! not outlast the ban.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, warn};

use crate::config::IcemuxConfig;
use crate::patterns::{glob_match, is_pattern};

/// A matched ban whose expiry lies within this many seconds of now is
/// extended to now + BAN_EXTEND_SECS, keeping active abusers banned.
pub const BAN_EXTEND_SECS: i64 = 300;

/// Entries expired for longer than this are eligible for opportunistic
/// eviction during an unrelated lookup.
pub const BAN_STALE_SECS: i64 = 60;

/// A reloadable set of literal entries and glob patterns.
pub struct CacheFile {
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
    literals: BTreeSet<String>,
    globs: Vec<String>,
}

impl CacheFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        let mut cache =
            Self { path, mtime: None, literals: BTreeSet::new(), globs: Vec::new() };
        cache.recheck();
        cache
    }

    /// True when a backing file is configured.
    pub fn is_configured(&self) -> bool {
        self.path.is_some()
    }

    /// Reload the backing file if its mtime changed since the last parse.
    fn recheck(&mut self) {
        let Some(path) = self.path.clone() else { return };
        let Some(mtime) = file_mtime(&path) else { return };
        if self.mtime == Some(mtime) {
            return;
        }
        self.mtime = Some(mtime);
        self.literals.clear();
        self.globs.clear();
        for line in read_entries(&path) {
            if is_pattern(&line) {
                debug!("Adding wildcard entry \"{:.30}\"", line);
                self.globs.push(line);
            } else {
                debug!("Adding literal entry \"{:.30}\"", line);
                self.literals.insert(line);
            }
        }
    }

    /// Look `key` up, reloading first when the file changed.
    ///
    /// Returns `None` when no file is configured or it was never readable,
    /// otherwise whether the key matched a glob (checked first) or a literal
    /// entry.
    pub fn lookup(&mut self, key: &str) -> Option<bool> {
        self.path.as_ref()?;
        self.recheck();
        self.mtime?;
        if self.globs.iter().any(|g| glob_match(g, key)) {
            return Some(true);
        }
        Some(self.literals.contains(key))
    }

    pub fn clear(&mut self) {
        self.mtime = None;
        self.literals.clear();
        self.globs.clear();
    }
}

/// The ban list: literal IPs with an expiry, plus glob patterns.
pub struct BanList {
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
    /// literal IP -> expiry in epoch seconds; 0 = permanent
    literals: BTreeMap<String, i64>,
    globs: Vec<String>,
}

/// Outcome of walking the literal entries for one lookup: whether the key
/// matched, plus at most one stale entry noticed along the way.
struct BanWalk {
    matched: bool,
    stale: Option<String>,
}

impl BanList {
    pub fn new(path: Option<PathBuf>) -> Self {
        let mut bans =
            Self { path, mtime: None, literals: BTreeMap::new(), globs: Vec::new() };
        bans.recheck();
        bans
    }

    fn recheck(&mut self) {
        let Some(path) = self.path.clone() else { return };
        let Some(mtime) = file_mtime(&path) else { return };
        if self.mtime == Some(mtime) {
            return;
        }
        self.mtime = Some(mtime);
        self.literals.clear();
        self.globs.clear();
        for line in read_entries(&path) {
            self.insert(&line, 0);
        }
    }

    fn insert(&mut self, ip: &str, expiry: i64) {
        if is_pattern(ip) {
            debug!("Adding wildcard entry \"{:.30}\"", ip);
            if !self.globs.iter().any(|g| g == ip) {
                self.globs.push(ip.to_string());
            }
        } else {
            debug!("Adding literal entry \"{:.30}\"", ip);
            self.literals.insert(ip.to_string(), expiry);
        }
    }

    /// Add a ban at runtime. `duration` of 0 makes it permanent.
    pub fn add(&mut self, ip: &str, duration: i64, now: i64) {
        let expiry = if duration > 0 { now + duration } else { 0 };
        self.insert(ip, expiry);
    }

    /// Remove a literal ban.
    pub fn release(&mut self, ip: &str) {
        self.literals.remove(ip);
    }

    /// Number of literal entries currently held.
    pub fn len(&self) -> usize {
        self.literals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    /// Check `ip` against the ban list.
    ///
    /// Globs are scanned first. A literal match is only reported while the
    /// entry is unexpired; a match close to its expiry is pushed forward to
    /// `now + BAN_EXTEND_SECS`. When the lookup does not produce a valid
    /// match, one stale entry observed during the walk is evicted.
    pub fn lookup(&mut self, ip: &str, now: i64) -> bool {
        self.recheck();
        if self.globs.iter().any(|g| glob_match(g, ip)) {
            return true;
        }

        let walk = self.walk(ip, now);
        if walk.matched {
            return true;
        }
        // we may have seen another one to remove
        if let Some(stale) = walk.stale {
            info!("removing {} from ban list for now", stale);
            self.literals.remove(&stale);
        }
        false
    }

    fn walk(&mut self, ip: &str, now: i64) -> BanWalk {
        let mut expired_self = false;
        if let Some(expiry) = self.literals.get_mut(ip) {
            if *expiry == 0 || *expiry > now {
                if *expiry != 0 && now + BAN_EXTEND_SECS > *expiry {
                    *expiry = now + BAN_EXTEND_SECS;
                }
                return BanWalk { matched: true, stale: None };
            }
            expired_self = true;
        }
        if expired_self {
            self.literals.remove(ip);
        }
        let stale = self
            .literals
            .iter()
            .find(|(key, &expiry)| {
                expiry != 0 && expiry < now - BAN_STALE_SECS && key.as_str() != ip
            })
            .map(|(key, _)| key.clone());
        BanWalk { matched: false, stale }
    }

    pub fn clear(&mut self) {
        self.mtime = None;
        self.literals.clear();
        self.globs.clear();
    }
}

/// The three admission filters, guarded by one lock at the server level.
pub struct FilterStore {
    pub banned: BanList,
    pub allowed: CacheFile,
    pub agents: CacheFile,
}

impl FilterStore {
    pub fn from_config(config: &IcemuxConfig) -> Self {
        Self {
            banned: BanList::new(config.ban_file.clone()),
            allowed: CacheFile::new(config.allow_file.clone()),
            agents: CacheFile::new(config.agent_file.clone()),
        }
    }

    /// Re-point the filters at the paths of a freshly loaded config.
    pub fn update_paths(&mut self, config: &IcemuxConfig) {
        *self = Self::from_config(config);
    }

    /// Admission check for a peer IP: banned entries refuse, and when an
    /// allow list is configured only listed peers get in.
    pub fn accept_ip(&mut self, ip: &str, now: i64) -> bool {
        if self.banned.lookup(ip, now) {
            debug!("{} banned", ip);
            return false;
        }
        if self.allowed.lookup(ip) == Some(false) {
            debug!("{} is not allowed", ip);
            return false;
        }
        true
    }

    /// True when the User-Agent deny list matches.
    pub fn agent_denied(&mut self, agent: &str) -> bool {
        self.agents.lookup(agent) == Some(true)
    }

    pub fn clear(&mut self) {
        self.banned.clear();
        self.allowed.clear();
        self.agents.clear();
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    match fs::metadata(path) {
        Ok(meta) => meta.modified().ok(),
        Err(e) => {
            warn!("failed to stat \"{}\" ({})", path.display(), e);
            None
        }
    }
}

fn read_entries(path: &Path) -> Vec<String> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to read \"{}\" ({})", path.display(), e);
            return Vec::new();
        }
    };
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_cache_file_literal_and_glob() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "agents", "BadBot/1.0\n*curl*\n# comment\n");
        let mut cache = CacheFile::new(Some(path));
        assert_eq!(cache.lookup("BadBot/1.0"), Some(true));
        assert_eq!(cache.lookup("libcurl/7.1"), Some(true));
        assert_eq!(cache.lookup("GoodPlayer/2.0"), Some(false));
    }

    #[test]
    fn test_cache_file_unconfigured() {
        let mut cache = CacheFile::new(None);
        assert_eq!(cache.lookup("anything"), None);
    }

    #[test]
    fn test_cache_file_reload_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "allow", "10.0.0.1\n");
        let mut cache = CacheFile::new(Some(path.clone()));
        assert_eq!(cache.lookup("10.0.0.2"), Some(false));

        // Rewrite with a clearly different mtime
        let mut f = fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        writeln!(f, "10.0.0.1").unwrap();
        writeln!(f, "10.0.0.2").unwrap();
        f.set_modified(SystemTime::now() + std::time::Duration::from_secs(5)).unwrap();
        drop(f);

        assert_eq!(cache.lookup("10.0.0.2"), Some(true));
    }

    #[test]
    fn test_ban_permanent_and_expiring() {
        let mut bans = BanList::new(None);
        let now = 1_000_000;
        bans.add("1.2.3.4", 0, now);
        bans.add("5.6.7.8", 200, now);
        assert!(bans.lookup("1.2.3.4", now + 1_000_000));
        assert!(bans.lookup("5.6.7.8", now + 50));
        assert!(!bans.lookup("5.6.7.8", now + 1000));
        // the expired entry was removed by the failing lookup
        assert_eq!(bans.len(), 1);
    }

    #[test]
    fn test_ban_expiry_extension() {
        let mut bans = BanList::new(None);
        let now = 1_000_000;
        // expiry at now+200, within 300s of now: a match extends it to now+350
        bans.add("1.2.3.4", 200, now);
        assert!(bans.lookup("1.2.3.4", now + 50));
        // original expiry has passed but the extension keeps it banned
        assert!(bans.lookup("1.2.3.4", now + 300));
    }

    #[test]
    fn test_ban_opportunistic_eviction() {
        let mut bans = BanList::new(None);
        let now = 1_000_000;
        bans.add("9.9.9.9", 10, now - 100); // stale: expired over 60s ago
        bans.add("8.8.8.8", 0, now);
        assert_eq!(bans.len(), 2);
        // unrelated miss evicts the stale sibling
        assert!(!bans.lookup("7.7.7.7", now));
        assert_eq!(bans.len(), 1);
        assert!(bans.lookup("8.8.8.8", now));
    }

    #[test]
    fn test_ban_glob() {
        let mut bans = BanList::new(None);
        bans.add("10.1.*", 0, 0);
        assert!(bans.lookup("10.1.2.3", 100));
        assert!(!bans.lookup("10.2.2.3", 100));
    }

    #[test]
    fn test_ban_release() {
        let mut bans = BanList::new(None);
        bans.add("1.2.3.4", 0, 0);
        bans.release("1.2.3.4");
        assert!(!bans.lookup("1.2.3.4", 100));
    }

    #[test]
    fn test_accept_ip_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let allow = write_file(&dir, "allow", "10.0.0.1\n192.168.*\n");
        let mut filters = FilterStore {
            banned: BanList::new(None),
            allowed: CacheFile::new(Some(allow)),
            agents: CacheFile::new(None),
        };
        let now = 1000;
        assert!(filters.accept_ip("10.0.0.1", now));
        assert!(filters.accept_ip("192.168.3.4", now));
        assert!(!filters.accept_ip("172.16.0.1", now));
    }

    #[test]
    fn test_accept_ip_ban_beats_allow() {
        let dir = tempfile::tempdir().unwrap();
        let allow = write_file(&dir, "allow", "10.0.0.1\n");
        let mut filters = FilterStore {
            banned: BanList::new(None),
            allowed: CacheFile::new(Some(allow)),
            agents: CacheFile::new(None),
        };
        filters.banned.add("10.0.0.1", 0, 0);
        assert!(!filters.accept_ip("10.0.0.1", 100));
    }
}
