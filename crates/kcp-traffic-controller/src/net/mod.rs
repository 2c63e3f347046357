//! Host name resolution.
//!
//! The reconcilers never talk to DNS directly, they go through a [`HostResolver`]. Production
//! code uses [`DnsResolver`], tests and air-gapped setups use a [`StaticResolver`] fed from a
//! ConfigMap.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    str::FromStr,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    error::{ResolveError, ResolveErrorKind},
};
use k8s_openapi::api::core::v1::ConfigMap;
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;

pub mod watcher;

/// TTL reported for hosts resolved by a [`StaticResolver`].
pub const STATIC_RECORD_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("no such host {host:?}"))]
    NoSuchHost { host: String },

    #[snafu(display("failed to look up host {host:?}"))]
    Lookup { source: ResolveError, host: String },

    #[snafu(display("invalid address {address:?} configured for host {host:?}"))]
    InvalidStaticAddress {
        source: std::net::AddrParseError,
        host: String,
        address: String,
    },
}

impl Error {
    /// True when the host definitively has no address records.
    pub fn is_no_such_host(&self) -> bool {
        matches!(self, Self::NoSuchHost { .. })
    }
}

/// A resolved address together with the TTL it may be cached for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAddress {
    pub ip: IpAddr,
    pub ttl: Duration,
}

impl HostAddress {
    pub fn new(ip: IpAddr, ttl: Duration) -> Self {
        Self { ip, ttl }
    }
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolves `host` to its current set of addresses.
    ///
    /// Fails with [`Error::NoSuchHost`] if the name has no address records.
    async fn lookup_ip_addr(&self, host: &str) -> Result<Vec<HostAddress>, Error>;
}

#[async_trait]
impl<R> HostResolver for Arc<R>
where
    R: HostResolver + ?Sized,
{
    async fn lookup_ip_addr(&self, host: &str) -> Result<Vec<HostAddress>, Error> {
        (**self).lookup_ip_addr(host).await
    }
}

/// Resolves hosts using the system DNS configuration.
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    /// Builds a resolver from `/etc/resolv.conf` (or the platform equivalent).
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup_ip_addr(&self, host: &str) -> Result<Vec<HostAddress>, Error> {
        let lookup = match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup,
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return NoSuchHostSnafu { host }.fail();
            }
            Err(err) => return Err(err).context(LookupSnafu { host }),
        };

        let addresses: Vec<HostAddress> = lookup
            .as_lookup()
            .record_iter()
            .filter_map(|record| {
                let ip = record.data()?.ip_addr()?;
                Some(HostAddress::new(
                    ip,
                    Duration::from_secs(u64::from(record.ttl())),
                ))
            })
            .collect();

        if addresses.is_empty() {
            return NoSuchHostSnafu { host }.fail();
        }
        Ok(addresses)
    }
}

/// Resolves hosts from a fixed table.
///
/// The table can be replaced at runtime, which is how ConfigMap updates are applied.
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: RwLock<BTreeMap<String, Vec<IpAddr>>>,
}

impl StaticResolver {
    pub fn new(hosts: BTreeMap<String, Vec<IpAddr>>) -> Self {
        Self {
            hosts: RwLock::new(hosts),
        }
    }

    /// Parses a ConfigMap whose keys are host names and whose values are comma separated
    /// addresses.
    pub fn from_config_map(config_map: &ConfigMap) -> Result<Self, Error> {
        Ok(Self::new(parse_host_table(config_map)?))
    }

    /// Replaces the addresses of `host`. An empty list removes the host.
    pub fn set(&self, host: &str, addresses: Vec<IpAddr>) {
        let mut hosts = self
            .hosts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if addresses.is_empty() {
            hosts.remove(host);
        } else {
            hosts.insert(host.to_owned(), addresses);
        }
    }

    /// Replaces the whole table with the content of `config_map`.
    pub fn reload(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let table = parse_host_table(config_map)?;
        *self
            .hosts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = table;
        Ok(())
    }
}

fn parse_host_table(config_map: &ConfigMap) -> Result<BTreeMap<String, Vec<IpAddr>>, Error> {
    let mut table = BTreeMap::new();
    for (host, addresses) in config_map.data.iter().flatten() {
        let addresses = addresses
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(|address| {
                IpAddr::from_str(address).context(InvalidStaticAddressSnafu { host, address })
            })
            .collect::<Result<Vec<_>, _>>()?;
        table.insert(host.clone(), addresses);
    }
    Ok(table)
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn lookup_ip_addr(&self, host: &str) -> Result<Vec<HostAddress>, Error> {
        let hosts = self
            .hosts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match hosts.get(host) {
            Some(addresses) if !addresses.is_empty() => Ok(addresses
                .iter()
                .map(|ip| HostAddress::new(*ip, STATIC_RECORD_TTL))
                .collect()),
            _ => NoSuchHostSnafu { host }.fail(),
        }
    }
}

/// Serializes all lookups of the wrapped resolver.
///
/// Resolvers backed by a single upstream connection are not safe for concurrent use.
pub struct SerializedResolver<R> {
    inner: Mutex<R>,
}

impl<R> SerializedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

#[async_trait]
impl<R> HostResolver for SerializedResolver<R>
where
    R: HostResolver,
{
    async fn lookup_ip_addr(&self, host: &str) -> Result<Vec<HostAddress>, Error> {
        let inner = self.inner.lock().await;
        inner.lookup_ip_addr(host).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;

    use super::*;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta::default(),
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            ),
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn static_resolver_reads_config_map() {
        let resolver = StaticResolver::from_config_map(&config_map(&[(
            "lb.example.com",
            "10.0.0.1, 10.0.0.2",
        )]))
        .expect("valid table");

        let addresses = resolver
            .lookup_ip_addr("lb.example.com")
            .await
            .expect("resolves");
        assert_eq!(addresses, vec![
            HostAddress::new(Ipv4Addr::new(10, 0, 0, 1).into(), STATIC_RECORD_TTL),
            HostAddress::new(Ipv4Addr::new(10, 0, 0, 2).into(), STATIC_RECORD_TTL),
        ]);
    }

    #[rstest]
    #[case::unknown_host("other.example.com")]
    #[case::empty_entry("empty.example.com")]
    #[tokio::test]
    async fn static_resolver_reports_no_such_host(#[case] host: &str) {
        let resolver =
            StaticResolver::from_config_map(&config_map(&[("empty.example.com", "")]))
                .expect("valid table");

        let err = resolver.lookup_ip_addr(host).await.expect_err("unknown");
        assert!(err.is_no_such_host());
    }

    #[test]
    fn static_resolver_rejects_invalid_addresses() {
        let err = StaticResolver::from_config_map(&config_map(&[("lb.example.com", "not-an-ip")]))
            .expect_err("invalid");
        assert!(matches!(err, Error::InvalidStaticAddress { .. }));
    }

    #[tokio::test]
    async fn static_resolver_set_and_reload() {
        let resolver = StaticResolver::default();
        resolver.set("lb.example.com", vec![Ipv4Addr::new(10, 0, 0, 3).into()]);
        assert_eq!(
            resolver
                .lookup_ip_addr("lb.example.com")
                .await
                .expect("resolves")
                .len(),
            1
        );

        resolver
            .reload(&config_map(&[("other.example.com", "10.0.0.4")]))
            .expect("valid table");
        assert!(resolver.lookup_ip_addr("lb.example.com").await.is_err());
    }

    #[tokio::test]
    async fn serialized_resolver_delegates() {
        let inner = StaticResolver::default();
        inner.set("lb.example.com", vec![Ipv4Addr::LOCALHOST.into()]);
        let resolver = SerializedResolver::new(inner);

        assert_eq!(
            resolver
                .lookup_ip_addr("lb.example.com")
                .await
                .expect("resolves")[0]
                .ip,
            IpAddr::from(Ipv4Addr::LOCALHOST)
        );
    }
}
