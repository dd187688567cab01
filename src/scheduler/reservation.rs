//! Crash-safe bot reservations backed by lease marker files.
//!
//! Workers that share a bot directory also share a lease directory. Each
//! reserved bot has one marker file, `<hex(bot)>.lease`, hard-linked into
//! place so that existence of the file is the lock. Markers
//! carry an expiry: a holder refreshes it while its game runs, and a marker
//! past its expiry belongs to a crashed process and may be reclaimed.
//!
//! Acquisition is all-or-nothing and never waits on a holder. On conflict
//! every marker taken by the attempt is removed again and the caller is
//! expected to requeue the job. Deleting or rewriting an existing marker
//! (reclaim, refresh, release) happens under a short-lived per-bot guard
//! file, so two processes never act on the same marker at once.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ReservationError;

/// Default lease duration. Holders refresh well before it lapses.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Contents of a lease marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMarker {
    pub bot: String,
    /// Human-readable owner (worker and job).
    pub holder: String,
    /// Unique token of the reservation that wrote the marker.
    pub token: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseMarker {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A directory of named leases shared by every worker process.
#[derive(Debug, Clone)]
pub struct LeaseArena {
    dir: PathBuf,
    ttl: Duration,
}

impl LeaseArena {
    /// Opens (and creates if needed) a lease directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ReservationError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ttl: DEFAULT_LEASE_TTL,
        })
    }

    /// Sets the lease duration.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Marker path for a bot. Bot names may contain spaces or slashes, so
    /// the file name is the hex of the name.
    pub fn lease_path(&self, bot: &str) -> PathBuf {
        self.dir.join(format!("{}.lease", hex::encode(bot.as_bytes())))
    }

    /// Reserves every bot or none of them.
    ///
    /// # Errors
    ///
    /// `ReservationError::Conflict` when any bot is held by a live lease.
    pub fn try_acquire_all(
        &self,
        bots: &[String],
        holder: &str,
    ) -> Result<Reservation, ReservationError> {
        let mut reservation = Reservation {
            arena: self.clone(),
            token: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            bots: Vec::with_capacity(bots.len()),
        };

        for bot in bots {
            // On error the partial reservation is dropped and releases what it took.
            self.acquire_one(bot, &reservation.token, holder)?;
            reservation.bots.push(bot.clone());
        }

        debug!(holder = %holder, bots = ?reservation.bots, "Reserved bots");
        Ok(reservation)
    }

    /// Returns the live marker for a bot, if any.
    pub fn holder_of(&self, bot: &str) -> Result<Option<LeaseMarker>, ReservationError> {
        match read_marker(&self.lease_path(bot))? {
            Some(marker) if !marker.is_expired(Utc::now()) => Ok(Some(marker)),
            _ => Ok(None),
        }
    }

    fn marker(&self, bot: &str, token: &str, holder: &str) -> LeaseMarker {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(60));
        LeaseMarker {
            bot: bot.to_string(),
            holder: holder.to_string(),
            token: token.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    fn acquire_one(&self, bot: &str, token: &str, holder: &str) -> Result<(), ReservationError> {
        let path = self.lease_path(bot);
        let marker = self.marker(bot, token, holder);

        if create_marker(&path, &marker)? {
            return Ok(());
        }

        let existing = read_marker(&path)?;
        match existing {
            Some(current) if !current.is_expired(Utc::now()) => Err(ReservationError::Conflict {
                bot: bot.to_string(),
                holder: current.holder,
            }),
            _ => {
                if self.reclaim_stale(&path)? && create_marker(&path, &marker)? {
                    return Ok(());
                }
                let holder = read_marker(&path)?
                    .map(|m| m.holder)
                    .unwrap_or_else(|| "unknown".to_string());
                Err(ReservationError::Conflict {
                    bot: bot.to_string(),
                    holder,
                })
            }
        }
    }

    /// Removes an expired marker while holding the bot's reclaim guard.
    ///
    /// The marker is read again under the guard and only deleted if it is
    /// still expired, so a lease renewed or retaken after the caller saw it
    /// expire survives.
    fn reclaim_stale(&self, path: &Path) -> Result<bool, ReservationError> {
        let reclaimed = with_guard(path, || match read_marker(path)? {
            None => Ok(true),
            Some(current) if !current.is_expired(Utc::now()) => {
                debug!(bot = %current.bot, "Lease was renewed before reclaim");
                Ok(false)
            }
            Some(current) => {
                remove_if_present(path)?;
                warn!(
                    path = %path.display(),
                    holder = %current.holder,
                    "Reclaimed stale bot lease"
                );
                Ok(true)
            }
        })?;
        Ok(reclaimed.unwrap_or(false))
    }
}

/// A scoped hold on a set of bots. Released on drop.
#[derive(Debug)]
pub struct Reservation {
    arena: LeaseArena,
    token: String,
    holder: String,
    bots: Vec<String>,
}

impl Reservation {
    pub fn bots(&self) -> &[String] {
        &self.bots
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Extends every lease by the arena TTL.
    ///
    /// # Errors
    ///
    /// `ReservationError::Lost` when a marker no longer carries this
    /// reservation's token: the lease expired and another holder took it.
    pub fn refresh(&self) -> Result<(), ReservationError> {
        for bot in &self.bots {
            let path = self.arena.lease_path(bot);
            let refreshed = with_guard(&path, || match read_marker(&path)? {
                Some(current) if current.token == self.token => {
                    let mut marker = self.arena.marker(bot, &self.token, &self.holder);
                    marker.acquired_at = current.acquired_at;
                    replace_marker(&path, &marker)?;
                    Ok(true)
                }
                _ => Ok(false),
            })?;

            match refreshed {
                Some(true) => {}
                Some(false) => {
                    return Err(ReservationError::Lost {
                        bot: bot.clone(),
                        holder: self.holder.clone(),
                    })
                }
                // Guard busy; the next pump retries well before expiry.
                None => debug!(bot = %bot, "Lease guard busy, skipping refresh"),
            }
        }
        Ok(())
    }

    /// Releases every lease now.
    pub fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        for bot in self.bots.drain(..) {
            let path = self.arena.lease_path(&bot);
            let released = with_guard(&path, || match read_marker(&path)? {
                Some(marker) if marker.token == self.token => {
                    remove_if_present(&path)?;
                    Ok(())
                }
                _ => Ok(()),
            });
            match released {
                Ok(Some(())) => {}
                Ok(None) => warn!(bot = %bot, "Lease guard busy, lease left to expire"),
                Err(e) => warn!(bot = %bot, error = %e, "Failed to release bot lease"),
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Attempts to take a reclaim guard before giving up.
const GUARD_ATTEMPTS: u32 = 5;

/// Pause between guard attempts.
const GUARD_RETRY: Duration = Duration::from_millis(2);

/// Guards older than this belong to a process that died inside `with_guard`.
const GUARD_STALE_AFTER: Duration = Duration::from_secs(10);

/// Exclusive `<marker>.reclaim` file. Every operation that deletes or
/// rewrites an existing marker runs under it.
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn try_acquire(marker: &Path) -> Result<Option<Self>, ReservationError> {
        let path = marker.with_extension("lease.reclaim");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if guard_is_stale(&path) {
                    warn!(path = %path.display(), "Removing abandoned lease guard");
                    remove_if_present(&path)?;
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove lease guard");
        }
    }
}

fn guard_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > GUARD_STALE_AFTER)
}

/// Runs `f` under the marker's reclaim guard. Returns `None` when the guard
/// stayed busy.
fn with_guard<T>(
    marker: &Path,
    f: impl FnOnce() -> Result<T, ReservationError>,
) -> Result<Option<T>, ReservationError> {
    for attempt in 0..GUARD_ATTEMPTS {
        if let Some(_guard) = ReclaimGuard::try_acquire(marker)? {
            return f().map(Some);
        }
        if attempt + 1 < GUARD_ATTEMPTS {
            std::thread::sleep(GUARD_RETRY);
        }
    }
    Ok(None)
}

fn remove_if_present(path: &Path) -> Result<(), ReservationError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Creates a marker exclusively. Returns `false` if the path exists.
///
/// The marker is written in full to a private file and linked into place,
/// so a reader never sees a half-written lease.
fn create_marker(path: &Path, marker: &LeaseMarker) -> Result<bool, ReservationError> {
    let tmp = write_tmp(path, marker)?;
    let linked = fs::hard_link(&tmp, path);
    if let Err(e) = fs::remove_file(&tmp) {
        warn!(path = %tmp.display(), error = %e, "Failed to remove staging lease");
    }

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn write_tmp(path: &Path, marker: &LeaseMarker) -> Result<PathBuf, ReservationError> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    let data = serde_json::to_vec(marker)?;
    let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    Ok(tmp)
}

/// Atomically overwrites a marker via rename.
fn replace_marker(path: &Path, marker: &LeaseMarker) -> Result<(), ReservationError> {
    let tmp = write_tmp(path, marker)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a marker. A half-written or corrupt marker reads as an expired
/// lease so it can be reclaimed.
fn read_marker(path: &Path) -> Result<Option<LeaseMarker>, ReservationError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<LeaseMarker>(&data) {
        Ok(marker) => Ok(Some(marker)),
        Err(_) => Ok(Some(LeaseMarker {
            bot: String::new(),
            holder: "corrupt marker".to_string(),
            token: String::new(),
            pid: 0,
            acquired_at: DateTime::<Utc>::MIN_UTC,
            expires_at: DateTime::<Utc>::MIN_UTC,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bots(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn arena() -> (TempDir, LeaseArena) {
        let dir = TempDir::new().unwrap();
        let arena = LeaseArena::open(dir.path().join("leases")).unwrap();
        (dir, arena)
    }

    #[test]
    fn test_acquire_and_release_on_drop() {
        let (_dir, arena) = arena();

        {
            let reservation = arena.try_acquire_all(&bots(&["A", "B"]), "worker-0").unwrap();
            assert_eq!(reservation.bots(), &["A".to_string(), "B".to_string()]);
            assert!(arena.lease_path("A").exists());
            assert_eq!(arena.holder_of("B").unwrap().unwrap().holder, "worker-0");
        }

        assert!(!arena.lease_path("A").exists());
        assert!(!arena.lease_path("B").exists());
    }

    #[test]
    fn test_conflict_is_all_or_nothing() {
        let (_dir, arena) = arena();
        let _held = arena.try_acquire_all(&bots(&["B", "C"]), "worker-0").unwrap();

        let err = arena
            .try_acquire_all(&bots(&["A", "B"]), "worker-1")
            .unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Conflict { ref bot, ref holder } if bot == "B" && holder == "worker-0"
        ));

        // "A" was taken before "B" conflicted and must have been released.
        assert!(!arena.lease_path("A").exists());
        assert!(arena.try_acquire_all(&bots(&["A"]), "worker-1").is_ok());
    }

    #[test]
    fn test_stale_lease_is_reclaimed() {
        let (_dir, arena) = arena();
        let short = arena.clone().with_ttl(Duration::from_millis(1));

        let crashed = short.try_acquire_all(&bots(&["A"]), "crashed-worker").unwrap();
        // A crashed process never runs its destructor.
        std::mem::forget(crashed);
        std::thread::sleep(Duration::from_millis(20));

        let reservation = arena.try_acquire_all(&bots(&["A"]), "worker-1").unwrap();
        assert_eq!(arena.holder_of("A").unwrap().unwrap().holder, "worker-1");
        drop(reservation);
        assert!(!arena.lease_path("A").exists());
    }

    #[test]
    fn test_corrupt_marker_is_reclaimed() {
        let (_dir, arena) = arena();
        fs::write(arena.lease_path("A"), b"{half-writ").unwrap();

        assert!(arena.holder_of("A").unwrap().is_none());
        assert!(arena.try_acquire_all(&bots(&["A"]), "worker-0").is_ok());
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let (_dir, arena) = arena();
        let arena = arena.with_ttl(Duration::from_millis(200));
        let reservation = arena.try_acquire_all(&bots(&["A"]), "worker-0").unwrap();
        let before = arena.holder_of("A").unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        reservation.refresh().unwrap();
        let after = arena.holder_of("A").unwrap().unwrap();

        assert!(after.expires_at > before.expires_at);
        assert_eq!(after.acquired_at, before.acquired_at);
        assert_eq!(after.token, before.token);
    }

    #[test]
    fn test_release_ignores_foreign_marker() {
        let (_dir, arena) = arena();
        let short = arena.clone().with_ttl(Duration::from_millis(1));
        let stale = short.try_acquire_all(&bots(&["A"]), "slow-worker").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let fresh = arena.try_acquire_all(&bots(&["A"]), "worker-1").unwrap();
        // The slow holder waking up must not delete the new owner's lease.
        stale.release();
        assert_eq!(arena.holder_of("A").unwrap().unwrap().holder, "worker-1");
        drop(fresh);
    }

    #[test]
    fn test_reclaim_keeps_live_marker() {
        let (_dir, arena) = arena();
        let held = arena.try_acquire_all(&bots(&["A"]), "worker-0").unwrap();
        let path = arena.lease_path("A");

        // A caller that saw the marker expired a moment ago must not delete
        // the lease that replaced it.
        assert!(!arena.reclaim_stale(&path).unwrap());
        assert!(path.exists());
        assert_eq!(arena.holder_of("A").unwrap().unwrap().holder, "worker-0");
        drop(held);
    }

    #[test]
    fn test_refresh_after_takeover_reports_lost() {
        let (_dir, arena) = arena();
        let short = arena.clone().with_ttl(Duration::from_millis(1));
        let stale = short.try_acquire_all(&bots(&["A"]), "slow-worker").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let fresh = arena.try_acquire_all(&bots(&["A"]), "worker-1").unwrap();

        let err = stale.refresh().unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Lost { ref bot, ref holder } if bot == "A" && holder == "slow-worker"
        ));
        // The failed refresh left the new owner's marker alone.
        let marker = arena.holder_of("A").unwrap().unwrap();
        assert_eq!(marker.holder, "worker-1");

        drop(stale);
        assert!(arena.lease_path("A").exists());
        drop(fresh);
    }

    #[test]
    fn test_busy_guard_blocks_reclaim() {
        let (_dir, arena) = arena();
        let short = arena.clone().with_ttl(Duration::from_millis(1));
        std::mem::forget(short.try_acquire_all(&bots(&["A"]), "crashed-worker").unwrap());
        std::thread::sleep(Duration::from_millis(20));

        let guard = arena.lease_path("A").with_extension("lease.reclaim");
        fs::write(&guard, b"").unwrap();

        let err = arena.try_acquire_all(&bots(&["A"]), "worker-1").unwrap_err();
        assert!(matches!(err, ReservationError::Conflict { ref bot, .. } if bot == "A"));
        assert!(arena.lease_path("A").exists());

        fs::remove_file(&guard).unwrap();
        let reservation = arena.try_acquire_all(&bots(&["A"]), "worker-1").unwrap();
        assert_eq!(arena.holder_of("A").unwrap().unwrap().holder, "worker-1");
        drop(reservation);
    }

    #[test]
    fn test_abandoned_guard_is_cleared() {
        let (_dir, arena) = arena();
        let short = arena.clone().with_ttl(Duration::from_millis(1));
        std::mem::forget(short.try_acquire_all(&bots(&["A"]), "crashed-worker").unwrap());
        std::thread::sleep(Duration::from_millis(20));

        let guard = arena.lease_path("A").with_extension("lease.reclaim");
        let file = fs::File::create(&guard).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        drop(file);

        let reservation = arena.try_acquire_all(&bots(&["A"]), "worker-1").unwrap();
        assert_eq!(arena.holder_of("A").unwrap().unwrap().holder, "worker-1");
        assert!(!guard.exists());
        drop(reservation);
    }

    #[test]
    fn test_concurrent_reclaim_has_one_winner() {
        use std::sync::{Arc, Barrier};

        let (_dir, arena) = arena();
        let short = arena.clone().with_ttl(Duration::from_millis(1));
        const CONTENDERS: usize = 4;

        for round in 0..20 {
            std::mem::forget(short.try_acquire_all(&bots(&["A"]), "crashed-worker").unwrap());
            std::thread::sleep(Duration::from_millis(5));

            let barrier = Arc::new(Barrier::new(CONTENDERS));
            let handles: Vec<_> = (0..CONTENDERS)
                .map(|i| {
                    let arena = arena.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        arena.try_acquire_all(&bots(&["A"]), &format!("worker-{}", i))
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1, "round {} had {} winners", round, winners.len());

            let marker = arena.holder_of("A").unwrap().unwrap();
            assert_eq!(marker.holder, winners[0].holder());

            drop(results);
            assert!(!arena.lease_path("A").exists());
        }
    }

    #[test]
    fn test_lease_path_is_filesystem_safe() {
        let (_dir, arena) = arena();
        let path = arena.lease_path("Marian Devecka/../x");
        assert_eq!(path.parent().unwrap(), arena.dir());
        assert!(path.to_string_lossy().ends_with(".lease"));
    }
}
