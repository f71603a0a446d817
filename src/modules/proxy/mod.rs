//! Proxy inventory with health tracking and sticky per-task leases.
//!
//! Proxies live in named groups of a single kind. Selection is uniformly
//! random among healthy, unleased entries; a task that leases a proxy keeps it
//! until it releases it or the proxy turns unhealthy.

use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use http::Method;
use url::Url;

use crate::request::transport::{HttpTransport, TransportRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Residential,
    Datacenter,
    Isp,
    Mobile,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyKind::Residential => "residential",
            ProxyKind::Datacenter => "datacenter",
            ProxyKind::Isp => "isp",
            ProxyKind::Mobile => "mobile",
        };
        f.write_str(name)
    }
}

impl FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "residential" => Ok(ProxyKind::Residential),
            "datacenter" => Ok(ProxyKind::Datacenter),
            "isp" => Ok(ProxyKind::Isp),
            "mobile" => Ok(ProxyKind::Mobile),
            other => Err(format!("unknown proxy kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub failure_threshold: u32,
    pub default_group: String,
    pub default_kind: ProxyKind,
    #[serde(with = "crate::config::millis")]
    pub probe_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            default_group: "default".into(),
            default_kind: ProxyKind::Datacenter,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub address: String,
    pub kind: ProxyKind,
    pub consecutive_failures: u32,
    pub healthy: bool,
    pub leased: bool,
}

impl Proxy {
    fn new(address: String, kind: ProxyKind) -> Self {
        Self {
            address,
            kind,
            consecutive_failures: 0,
            healthy: true,
            leased: false,
        }
    }

    fn is_available(&self) -> bool {
        self.healthy && !self.leased
    }

    pub fn masked_address(&self) -> String {
        mask_address(&self.address)
    }
}

/// Hides credentials embedded in a proxy URL.
pub fn mask_address(address: &str) -> String {
    match address.rsplit_once('@') {
        Some((_, host)) => format!("***@{host}"),
        None => address.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ProxyGroup {
    pub name: String,
    pub kind: ProxyKind,
    pub proxies: Vec<Proxy>,
}

impl ProxyGroup {
    fn new(name: String, kind: ProxyKind) -> Self {
        Self {
            name,
            kind,
            proxies: Vec::new(),
        }
    }

    fn add(&mut self, address: impl Into<String>) {
        self.proxies.push(Proxy::new(address.into(), self.kind));
    }

    fn random_available(&self) -> Option<usize> {
        let candidates: Vec<usize> = self
            .proxies
            .iter()
            .enumerate()
            .filter(|(_, proxy)| proxy.is_available())
            .map(|(idx, _)| idx)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub total: usize,
    pub healthy: usize,
    pub leased: usize,
    pub available: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Lease {
    group: String,
    index: usize,
}

#[derive(Debug, Default)]
struct PoolInner {
    groups: HashMap<String, ProxyGroup>,
    sticky: HashMap<String, Lease>,
}

impl PoolInner {
    fn proxy_mut(&mut self, lease: &Lease) -> Option<&mut Proxy> {
        self.groups
            .get_mut(&lease.group)
            .and_then(|group| group.proxies.get_mut(lease.index))
    }

    fn find_mut(&mut self, address: &str) -> Option<&mut Proxy> {
        self.groups
            .values_mut()
            .flat_map(|group| group.proxies.iter_mut())
            .find(|proxy| proxy.address == address)
    }

    fn release(&mut self, task_id: &str) -> Option<String> {
        let lease = self.sticky.remove(task_id)?;
        let proxy = self.proxy_mut(&lease)?;
        proxy.leased = false;
        Some(proxy.address.clone())
    }
}

/// Thread-safe proxy pool shared by every task of a run.
#[derive(Debug)]
pub struct ProxyPool {
    config: ProxyConfig,
    inner: Mutex<PoolInner>,
}

impl ProxyPool {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // Every critical section leaves the pool consistent, so a poisoned
        // lock still holds usable state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates an empty group of the given kind. An existing group is kept
    /// as is, together with its proxies and leases.
    pub fn create_group(&self, name: impl Into<String>, kind: ProxyKind) -> bool {
        let name = name.into();
        let mut inner = self.lock();
        if let Some(existing) = inner.groups.get(&name) {
            if existing.kind != kind {
                log::warn!(
                    "group '{name}' already exists as {}, ignoring {kind}",
                    existing.kind
                );
            }
            return false;
        }
        inner.groups.insert(name.clone(), ProxyGroup::new(name, kind));
        true
    }

    /// Appends every usable line as a healthy proxy of the group's kind.
    ///
    /// Blank lines and lines starting with `#` are skipped. Entries are not
    /// deduplicated. Returns the number of proxies added.
    pub fn load<I, S>(&self, lines: I, group_name: &str) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.lock();
        let default_kind = self.config.default_kind;
        let group = inner
            .groups
            .entry(group_name.to_string())
            .or_insert_with(|| ProxyGroup::new(group_name.to_string(), default_kind));

        let mut added = 0;
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            group.add(line);
            added += 1;
        }

        log::info!("loaded {added} proxies into group '{group_name}'");
        added
    }

    /// Convenience wrapper around [`ProxyPool::load`] for newline separated text.
    pub fn load_str(&self, text: &str, group_name: &str) -> usize {
        self.load(text.lines(), group_name)
    }

    /// Random healthy, unleased proxy from the group. Does not lease it.
    pub fn acquire(&self, group_name: &str) -> Option<String> {
        let inner = self.lock();
        let group = inner.groups.get(group_name)?;
        let index = group.random_available()?;
        Some(group.proxies[index].address.clone())
    }

    /// Returns the proxy pinned to `task_id`, leasing one if needed.
    pub fn acquire_sticky(&self, task_id: &str, group_name: &str) -> Option<String> {
        let mut inner = self.lock();

        if let Some(lease) = inner.sticky.get(task_id).cloned() {
            if let Some(proxy) = inner.proxy_mut(&lease)
                && proxy.healthy
            {
                return Some(proxy.address.clone());
            }
            if let Some(address) = inner.release(task_id) {
                log::warn!(
                    "[{task_id}] sticky proxy {} became unhealthy, re-leasing",
                    mask_address(&address)
                );
            }
        }

        let group = inner.groups.get_mut(group_name)?;
        let index = group.random_available()?;
        let proxy = &mut group.proxies[index];
        proxy.leased = true;
        let address = proxy.address.clone();
        inner.sticky.insert(
            task_id.to_string(),
            Lease {
                group: group_name.to_string(),
                index,
            },
        );
        Some(address)
    }

    /// Drops the task's lease, if any.
    pub fn release(&self, task_id: &str) {
        let mut inner = self.lock();
        inner.release(task_id);
    }

    /// Address currently pinned to `task_id`.
    pub fn leased_by(&self, task_id: &str) -> Option<String> {
        let mut inner = self.lock();
        let lease = inner.sticky.get(task_id).cloned()?;
        inner.proxy_mut(&lease).map(|proxy| proxy.address.clone())
    }

    pub fn report_failure(&self, address: &str) {
        let threshold = self.config.failure_threshold.max(1);
        let mut inner = self.lock();
        if let Some(proxy) = inner.find_mut(address) {
            proxy.consecutive_failures = proxy.consecutive_failures.saturating_add(1);
            if proxy.healthy && proxy.consecutive_failures >= threshold {
                proxy.healthy = false;
                log::warn!("disabled proxy {}", proxy.masked_address());
            }
        }
    }

    /// Resets the failure counter. Health is only restored by [`ProxyPool::reset_all`].
    pub fn report_success(&self, address: &str) {
        let mut inner = self.lock();
        if let Some(proxy) = inner.find_mut(address) {
            proxy.consecutive_failures = 0;
        }
    }

    /// Between runs only: clears failures, health and every lease.
    pub fn reset_all(&self) {
        let mut inner = self.lock();
        for proxy in inner
            .groups
            .values_mut()
            .flat_map(|group| group.proxies.iter_mut())
        {
            proxy.consecutive_failures = 0;
            proxy.healthy = true;
            proxy.leased = false;
        }
        inner.sticky.clear();
        log::info!("all proxies reset");
    }

    pub fn stats(&self) -> BTreeMap<String, GroupStats> {
        let inner = self.lock();
        inner
            .groups
            .iter()
            .map(|(name, group)| {
                let mut stats = GroupStats {
                    total: group.proxies.len(),
                    ..Default::default()
                };
                for proxy in &group.proxies {
                    stats.healthy += usize::from(proxy.healthy);
                    stats.leased += usize::from(proxy.leased);
                    stats.available += usize::from(proxy.is_available());
                }
                (name.clone(), stats)
            })
            .collect()
    }

    /// Snapshot of a single proxy, looked up by address.
    pub fn proxy(&self, address: &str) -> Option<Proxy> {
        let inner = self.lock();
        inner
            .groups
            .values()
            .flat_map(|group| group.proxies.iter())
            .find(|proxy| proxy.address == address)
            .cloned()
    }

    /// Sends one request through every proxy and records the result.
    ///
    /// A 2xx answer restores the proxy; anything else marks it unhealthy.
    /// Returns the number of working proxies. Pre-run warm-up only.
    pub async fn probe_all(&self, transport: Arc<dyn HttpTransport>, probe_url: &Url) -> usize {
        let addresses: Vec<String> = {
            let inner = self.lock();
            inner
                .groups
                .values()
                .flat_map(|group| group.proxies.iter().map(|proxy| proxy.address.clone()))
                .collect()
        };

        let mut working = 0;
        for address in &addresses {
            let request = TransportRequest::new(Method::GET, probe_url.clone(), self.config.probe_timeout)
                .with_proxy(Some(address.clone()));
            let ok = match transport.execute(request).await {
                Ok(response) => (200..300).contains(&response.status),
                Err(err) => {
                    log::debug!("probe via {} failed: {err}", mask_address(address));
                    false
                }
            };

            let mut inner = self.lock();
            if let Some(proxy) = inner.find_mut(address) {
                proxy.healthy = ok;
                if ok {
                    proxy.consecutive_failures = 0;
                }
            }
            working += usize::from(ok);
        }

        log::info!(
            "probed {} proxies, {} failed",
            addresses.len(),
            addresses.len() - working
        );
        working
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}
