//! Periodic re-resolution of load balancer host names.
//!
//! The DNS reconciler registers every host name a traffic object's targets point at. Each
//! registered host gets its own polling task that re-resolves it every half TTL and calls the
//! change callback, usually a requeue of the owning object, when its address set changes.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    net::{HostAddress, HostResolver},
    workqueue::RateLimiter,
};

/// The shortest interval a host is re-resolved at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Retry delays of a host that fails to resolve, doubling from [`MIN_POLL_INTERVAL`].
pub const LOOKUP_BACKOFF: RateLimiter = RateLimiter {
    base_delay: MIN_POLL_INTERVAL,
    max_delay: Duration::from_secs(300),
};

/// Called with the owner key whenever one of its watched hosts changes.
pub type OnChange = Arc<dyn Fn(&str) + Send + Sync>;

/// Computes the poll interval from the lowest TTL of the current records.
pub type IntervalFn = fn(Duration) -> Duration;

/// Default poll interval: half the TTL, at least [`MIN_POLL_INTERVAL`].
pub fn half_ttl(ttl: Duration) -> Duration {
    (ttl / 2).max(MIN_POLL_INTERVAL)
}

/// A single watched host, as reported by [`HostWatcher::list_host_record_watchers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub key: String,
    pub host: String,
    pub records: Vec<HostAddress>,
}

impl WatchEntry {
    /// Lowest TTL among the current records.
    pub fn ttl(&self) -> Option<Duration> {
        self.records.iter().map(|record| record.ttl).min()
    }
}

struct RecordWatcher {
    cancel: CancellationToken,
    records: Arc<Mutex<Vec<HostAddress>>>,
}

type Watchers = HashMap<String, BTreeMap<String, RecordWatcher>>;

/// Watches host names on behalf of owner keys.
pub struct HostWatcher {
    resolver: Arc<dyn HostResolver>,
    on_change: OnChange,
    interval: IntervalFn,
    watchers: Mutex<Watchers>,
    shutdown: CancellationToken,
}

impl HostWatcher {
    pub fn new(resolver: Arc<dyn HostResolver>, on_change: OnChange) -> Self {
        Self {
            resolver,
            on_change,
            interval: half_ttl,
            watchers: Mutex::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_interval(mut self, interval: IntervalFn) -> Self {
        self.interval = interval;
        self
    }

    /// The resolver the watcher polls with.
    pub fn resolver(&self) -> &Arc<dyn HostResolver> {
        &self.resolver
    }

    fn watchers(&self) -> MutexGuard<'_, Watchers> {
        self.watchers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Starts watching `host` for `key`. Returns `false` if it was already being watched.
    ///
    /// The first lookup only records the current addresses, it never fires the callback.
    pub fn start_watching(&self, key: &str, host: &str) -> bool {
        let mut watchers = self.watchers();
        let hosts = watchers.entry(key.to_owned()).or_default();
        if hosts.contains_key(host) {
            return false;
        }

        let cancel = self.shutdown.child_token();
        let records = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(poll(PollTask {
            key: key.to_owned(),
            host: host.to_owned(),
            resolver: Arc::clone(&self.resolver),
            on_change: Arc::clone(&self.on_change),
            interval: self.interval,
            cancel: cancel.clone(),
            records: Arc::clone(&records),
        }));

        tracing::debug!(key, host, "started watching host");
        hosts.insert(host.to_owned(), RecordWatcher { cancel, records });
        true
    }

    /// Stops watching `host` for `key`. An empty `host` stops all watches of `key`.
    pub fn stop_watching(&self, key: &str, host: &str) {
        let mut watchers = self.watchers();
        let Some(hosts) = watchers.get_mut(key) else {
            return;
        };

        if host.is_empty() {
            for (host, watcher) in std::mem::take(hosts) {
                watcher.cancel.cancel();
                tracing::debug!(key, %host, "stopped watching host");
            }
        } else if let Some(watcher) = hosts.remove(host) {
            watcher.cancel.cancel();
            tracing::debug!(key, host, "stopped watching host");
        }

        if hosts.is_empty() {
            watchers.remove(key);
        }
    }

    /// All hosts currently watched for `key`, ordered by host name.
    pub fn list_host_record_watchers(&self, key: &str) -> Vec<WatchEntry> {
        self.watchers()
            .get(key)
            .into_iter()
            .flatten()
            .map(|(host, watcher)| WatchEntry {
                key: key.to_owned(),
                host: host.clone(),
                records: watcher
                    .records
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone(),
            })
            .collect()
    }

    /// Stops all polling tasks.
    pub fn shut_down(&self) {
        self.shutdown.cancel();
        self.watchers().clear();
    }
}

impl Drop for HostWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct PollTask {
    key: String,
    host: String,
    resolver: Arc<dyn HostResolver>,
    on_change: OnChange,
    interval: IntervalFn,
    cancel: CancellationToken,
    records: Arc<Mutex<Vec<HostAddress>>>,
}

async fn poll(task: PollTask) {
    let mut initialized = false;
    let mut failures = 0;
    loop {
        let next = match task.resolver.lookup_ip_addr(&task.host).await {
            Ok(addresses) => {
                failures = 0;
                let (changed, ttl) = {
                    let mut records = task
                        .records
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let changed = update_records(&mut records, addresses);
                    let ttl = records.iter().map(|record| record.ttl).min();
                    (changed, ttl)
                };

                if changed && initialized && !task.cancel.is_cancelled() {
                    tracing::info!(key = %task.key, host = %task.host, "watched host changed");
                    (task.on_change)(&task.key);
                }
                initialized = true;
                (task.interval)(ttl.unwrap_or_default())
            }
            Err(err) => {
                tracing::warn!(
                    key = %task.key,
                    host = %task.host,
                    error = &err as &dyn std::error::Error,
                    failures,
                    "failed to resolve watched host"
                );
                let delay = LOOKUP_BACKOFF.delay(failures);
                failures = failures.saturating_add(1);
                delay
            }
        };

        tokio::select! {
            () = task.cancel.cancelled() => return,
            () = tokio::time::sleep(next) => {}
        }
    }
}

/// Replaces `current` with `new` if the address set differs.
///
/// Order is ignored. If the address set is unchanged, TTLs that grew are taken over but the
/// update does not count as a change.
pub fn update_records(current: &mut Vec<HostAddress>, new: Vec<HostAddress>) -> bool {
    let mut current_ips: Vec<_> = current.iter().map(|record| record.ip).collect();
    let mut new_ips: Vec<_> = new.iter().map(|record| record.ip).collect();
    current_ips.sort_unstable();
    current_ips.dedup();
    new_ips.sort_unstable();
    new_ips.dedup();

    if current_ips != new_ips {
        *current = new;
        return true;
    }

    for record in current.iter_mut() {
        if let Some(ttl) = new
            .iter()
            .filter(|candidate| candidate.ip == record.ip)
            .map(|candidate| candidate.ttl)
            .max()
        {
            if ttl > record.ttl {
                record.ttl = ttl;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use rstest::rstest;

    use super::*;
    use crate::net::StaticResolver;

    fn addr(last: u8, ttl: u64) -> HostAddress {
        HostAddress::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            Duration::from_secs(ttl),
        )
    }

    #[rstest]
    #[case::first_population(vec![], vec![addr(1, 60)], true)]
    #[case::same_set(vec![addr(1, 60)], vec![addr(1, 60)], false)]
    #[case::reordered(vec![addr(1, 60), addr(2, 60)], vec![addr(2, 60), addr(1, 60)], false)]
    #[case::added(vec![addr(1, 60)], vec![addr(1, 60), addr(2, 60)], true)]
    #[case::removed(vec![addr(1, 60), addr(2, 60)], vec![addr(2, 60)], true)]
    #[case::replaced(vec![addr(1, 60)], vec![addr(2, 60)], true)]
    #[case::ttl_only(vec![addr(1, 30)], vec![addr(1, 300)], false)]
    fn update_records_detects_address_changes(
        #[case] mut current: Vec<HostAddress>,
        #[case] new: Vec<HostAddress>,
        #[case] changed: bool,
    ) {
        assert_eq!(update_records(&mut current, new), changed);
    }

    #[test]
    fn update_records_only_grows_ttl() {
        let mut current = vec![addr(1, 60)];
        update_records(&mut current, vec![addr(1, 300)]);
        assert_eq!(current, vec![addr(1, 300)]);

        update_records(&mut current, vec![addr(1, 10)]);
        assert_eq!(current, vec![addr(1, 300)]);
    }

    #[rstest]
    #[case::zero(Duration::ZERO, MIN_POLL_INTERVAL)]
    #[case::short(Duration::from_secs(1), MIN_POLL_INTERVAL)]
    #[case::regular(Duration::from_secs(60), Duration::from_secs(30))]
    fn half_ttl_is_clamped(#[case] ttl: Duration, #[case] expected: Duration) {
        assert_eq!(half_ttl(ttl), expected);
    }

    #[rstest]
    #[case::first(0, Duration::from_secs(1))]
    #[case::third(2, Duration::from_secs(4))]
    #[case::capped(9, Duration::from_secs(300))]
    #[case::saturated(u32::MAX, Duration::from_secs(300))]
    fn failed_lookups_back_off(#[case] failures: u32, #[case] expected: Duration) {
        assert_eq!(LOOKUP_BACKOFF.delay(failures), expected);
    }

    fn watcher(resolver: Arc<StaticResolver>) -> (HostWatcher, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watcher = HostWatcher::new(
            resolver,
            Arc::new(move |_key| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (watcher, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_only_when_addresses_change() {
        let resolver = Arc::new(StaticResolver::default());
        resolver.set("lb.example.com", vec![Ipv4Addr::new(10, 0, 0, 1).into()]);
        let (watcher, fired) = watcher(Arc::clone(&resolver));

        assert!(watcher.start_watching("key", "lb.example.com"));
        assert!(!watcher.start_watching("key", "lb.example.com"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "first lookup must not fire");
        assert_eq!(watcher.list_host_record_watchers("key")[0].records.len(), 1);

        resolver.set("lb.example.com", vec![
            Ipv4Addr::new(10, 0, 0, 1).into(),
            Ipv4Addr::new(10, 0, 0, 2).into(),
        ]);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.list_host_record_watchers("key")[0].records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_watching_cancels_polling() {
        let resolver = Arc::new(StaticResolver::default());
        resolver.set("a.example.com", vec![Ipv4Addr::new(10, 0, 0, 1).into()]);
        resolver.set("b.example.com", vec![Ipv4Addr::new(10, 0, 0, 1).into()]);
        let (watcher, fired) = watcher(Arc::clone(&resolver));

        watcher.start_watching("key", "a.example.com");
        watcher.start_watching("key", "b.example.com");
        tokio::time::sleep(Duration::from_secs(1)).await;

        watcher.stop_watching("key", "a.example.com");
        let hosts: Vec<_> = watcher
            .list_host_record_watchers("key")
            .into_iter()
            .map(|entry| entry.host)
            .collect();
        assert_eq!(hosts, vec!["b.example.com"]);

        watcher.stop_watching("key", "");
        assert!(watcher.list_host_record_watchers("key").is_empty());

        resolver.set("a.example.com", vec![Ipv4Addr::new(10, 0, 0, 9).into()]);
        resolver.set("b.example.com", vec![Ipv4Addr::new(10, 0, 0, 9).into()]);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_errors_keep_polling() {
        let resolver = Arc::new(StaticResolver::default());
        let (watcher, fired) = watcher(Arc::clone(&resolver));

        // Lookups fail at 0s, 1s and 3s, the next one is due at 7s
        watcher.start_watching("key", "late.example.com");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(watcher.list_host_record_watchers("key")[0].records.is_empty());

        resolver.set("late.example.com", vec![Ipv4Addr::new(10, 0, 0, 1).into()]);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(watcher.list_host_record_watchers("key")[0].records.is_empty());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(watcher.list_host_record_watchers("key")[0].records.len(), 1);
        // The initial lookup failed, the first successful one only populates
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
