//! IP-keyed sliding-window rate limiter plus blacklist, for the boundary in
//! front of the (out-of-scope) RPC surface, per spec.md §4.9.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// How long a blacklisted IP stays blocked.
const BLACKLIST_DURATION_SECS: i64 = 60 * 60;
/// How often the sweeper purges empty windows and expired blacklist entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Injectable wall clock, so tests can drive `allow` with arbitrary
/// timestamps instead of real time.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

struct Window {
    timestamps: Vec<i64>,
}

#[derive(Default)]
struct Inner {
    windows: HashMap<IpAddr, Window>,
    blacklist: HashMap<IpAddr, i64>,
}

/// Sliding-window limiter: at most `limit` admitted events per `window` per
/// IP, backed by one lock. A separate blacklist map overrides the window
/// entirely for [`BLACKLIST_DURATION_SECS`].
pub struct Limiter {
    limit: usize,
    window: Duration,
    clock: Box<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Limiter {
    pub fn new(limit: usize, window: Duration) -> Limiter {
        Limiter::with_clock(limit, window, Box::new(SystemClock))
    }

    pub fn with_clock(limit: usize, window: Duration, clock: Box<dyn Clock>) -> Limiter {
        Limiter {
            limit,
            window,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Evicts timestamps older than `window`, then admits iff the IP is not
    /// blacklisted and the remaining count is below `limit`.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if let Some(&expiry) = inner.blacklist.get(&ip) {
            if expiry > now {
                log::warn!(target: "ratelimit", "rejected blacklisted ip {ip}");
                return false;
            }
            inner.blacklist.remove(&ip);
        }

        let window_secs = self.window.as_secs() as i64;
        let entry = inner.windows.entry(ip).or_insert_with(|| Window { timestamps: Vec::new() });
        entry.timestamps.retain(|&t| now - t < window_secs);

        if entry.timestamps.len() >= self.limit {
            log::warn!(target: "ratelimit", "rate limit exceeded for ip {ip}");
            return false;
        }

        entry.timestamps.push(now);
        true
    }

    /// Blacklists `ip` for one hour, overriding its sliding window entirely
    /// until the sweeper (or a future `allow` call) clears the entry.
    pub fn blacklist(&self, ip: IpAddr) {
        log::warn!(target: "ratelimit", "blacklisting ip {ip}");
        let expiry = self.clock.now() + BLACKLIST_DURATION_SECS;
        self.inner.lock().blacklist.insert(ip, expiry);
    }

    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        self.inner
            .lock()
            .blacklist
            .get(&ip)
            .map(|&expiry| expiry > now)
            .unwrap_or(false)
    }

    /// Purges windows with no remaining timestamps and blacklist entries
    /// that have expired. Called by [`Limiter::spawn_sweeper`] on a 60 s
    /// tick; exposed directly so tests can drive it without a real clock.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let window_secs = self.window.as_secs() as i64;
        let mut inner = self.inner.lock();

        inner.windows.retain(|_, w| {
            w.timestamps.retain(|&t| now - t < window_secs);
            !w.timestamps.is_empty()
        });
        inner.blacklist.retain(|_, &mut expiry| expiry > now);
    }
}

/// Spawns the periodic sweeper as a `tokio` task, per spec.md §4.9 and the
/// task inventory of spec.md §5. Exits on `cancel`.
pub fn spawn_sweeper(limiter: std::sync::Arc<Limiter>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!(target: "ratelimit", "sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    limiter.sweep();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    struct FakeClock(AtomicI64);

    impl Clock for Arc<FakeClock> {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn limiter_at(limit: usize, window_secs: u64, start: i64) -> (Limiter, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock(AtomicI64::new(start)));
        let limiter = Limiter::with_clock(limit, Duration::from_secs(window_secs), Box::new(clock.clone()));
        (limiter, clock)
    }

    fn ip(n: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, n])
    }

    #[test]
    fn admits_up_to_the_limit_then_rejects() {
        let (limiter, _clock) = limiter_at(3, 60, 1000);
        let addr = ip(1);
        assert!(limiter.allow(addr));
        assert!(limiter.allow(addr));
        assert!(limiter.allow(addr));
        assert!(!limiter.allow(addr));
    }

    #[test]
    fn window_slides_and_admits_again_after_expiry() {
        let (limiter, clock) = limiter_at(1, 60, 1000);
        let addr = ip(2);
        assert!(limiter.allow(addr));
        assert!(!limiter.allow(addr));

        clock.0.store(1061, Ordering::SeqCst);
        assert!(limiter.allow(addr));
    }

    #[test]
    fn blacklisted_ip_is_rejected_regardless_of_window_state() {
        let (limiter, _clock) = limiter_at(100, 60, 1000);
        let addr = ip(3);
        limiter.blacklist(addr);
        assert!(!limiter.allow(addr));
        assert!(limiter.is_blacklisted(addr));
    }

    #[test]
    fn blacklist_expires_after_one_hour() {
        let (limiter, clock) = limiter_at(100, 60, 1000);
        let addr = ip(4);
        limiter.blacklist(addr);
        clock.0.store(1000 + BLACKLIST_DURATION_SECS + 1, Ordering::SeqCst);
        assert!(limiter.allow(addr));
    }

    #[test]
    fn sweep_purges_empty_windows_and_expired_blacklist_entries() {
        let (limiter, clock) = limiter_at(1, 60, 1000);
        let addr = ip(5);
        limiter.allow(addr);
        limiter.blacklist(ip(6));

        clock.0.store(1000 + BLACKLIST_DURATION_SECS + 1, Ordering::SeqCst);
        limiter.sweep();

        assert_eq!(limiter.inner.lock().windows.len(), 0);
        assert_eq!(limiter.inner.lock().blacklist.len(), 0);
    }
}
