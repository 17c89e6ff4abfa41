//! Per-site address/data store.
//!
//! Holds data words keyed by address on each site, typically collected before patching and
//! then handed to an overlay with [`SiteDataStore::overlay_data`].

use std::collections::{BTreeMap, BTreeSet};

use crate::overlay::OverlayData;
use crate::sites::{Site, SiteSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteDataStore {
    cells: BTreeMap<Site, BTreeMap<u64, u64>>,
}

impl SiteDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.values().all(BTreeMap::is_empty)
    }

    /// Sets `addr` to `data` on every active site.
    pub fn set_data(&mut self, sites: &SiteSet, addr: u64, data: u64) {
        for &site in sites.active() {
            self.set_data_on_site(site, addr, data);
        }
    }

    pub fn set_data_on_site(&mut self, site: Site, addr: u64, data: u64) {
        self.cells.entry(site).or_default().insert(addr, data);
    }

    pub fn addr_is_set(&self, site: Site, addr: u64) -> bool {
        self.data_on_site(site, addr).is_some()
    }

    pub fn addr_is_set_any_site(&self, addr: u64) -> bool {
        self.cells.values().any(|cells| cells.contains_key(&addr))
    }

    pub fn data_on_site(&self, site: Site, addr: u64) -> Option<u64> {
        self.cells.get(&site)?.get(&addr).copied()
    }

    /// Active sites holding a value for `addr`.
    pub fn sites_on_addr(&self, sites: &SiteSet, addr: u64) -> Vec<Site> {
        sites
            .active()
            .iter()
            .copied()
            .filter(|&site| self.addr_is_set(site, addr))
            .collect()
    }

    /// True when every active site holds the same value for `addr`.
    pub fn all_sites_the_same(&self, sites: &SiteSet, addr: u64) -> bool {
        let mut values = sites.active().iter().map(|&site| self.data_on_site(site, addr));
        match values.next() {
            Some(Some(first)) => values.all(|value| value == Some(first)),
            _ => false,
        }
    }

    /// The value shared by every site that holds `addr`, if they agree.
    pub fn data_common(&self, addr: u64) -> Option<u64> {
        let distinct: BTreeSet<u64> = self
            .cells
            .values()
            .filter_map(|cells| cells.get(&addr).copied())
            .collect();
        match distinct.len() {
            1 => distinct.into_iter().next(),
            _ => None,
        }
    }

    /// Every address set on any site, highest first.
    pub fn unique_addresses(&self) -> Vec<u64> {
        let unique: BTreeSet<u64> = self
            .cells
            .values()
            .flat_map(|cells| cells.keys().copied())
            .collect();
        unique.into_iter().rev().collect()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Overlay data for `addr` across the active sites; `None` when no active site holds it.
    pub fn overlay_data(&self, sites: &SiteSet, addr: u64) -> Option<OverlayData> {
        if self.all_sites_the_same(sites, addr) {
            let first = sites.active().first()?;
            return self.data_on_site(*first, addr).map(OverlayData::Scalar);
        }
        let per_site: BTreeMap<Site, u64> = sites
            .active()
            .iter()
            .filter_map(|&site| self.data_on_site(site, addr).map(|data| (site, data)))
            .collect();
        if per_site.is_empty() {
            None
        } else {
            Some(OverlayData::PerSite(per_site))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites() -> SiteSet {
        SiteSet::new([1, 2, 4], 4).unwrap()
    }

    #[test]
    fn common_and_per_site_values() {
        let mut store = SiteDataStore::new();
        assert!(store.is_empty());
        store.set_data(&sites(), 10, 0x55);
        store.set_data(&sites(), 12, 0x55);
        assert!(store.all_sites_the_same(&sites(), 10));
        assert_eq!(store.data_common(10), Some(0x55));

        store.set_data_on_site(1, 10, 11);
        assert!(!store.all_sites_the_same(&sites(), 10));
        assert_eq!(store.data_common(10), None);
        assert_eq!(store.data_on_site(1, 10), Some(11));
        assert_eq!(store.data_on_site(2, 10), Some(0x55));
    }

    #[test]
    fn address_queries() {
        let mut store = SiteDataStore::new();
        store.set_data_on_site(4, 100, 44);
        store.set_data_on_site(4, 300, 44);
        store.set_data_on_site(2, 200, 7);
        store.set_data(&sites(), 60, 60);

        assert!(store.addr_is_set(4, 100));
        assert!(!store.addr_is_set(1, 100));
        assert!(store.addr_is_set_any_site(200));
        assert!(!store.addr_is_set_any_site(201));
        assert_eq!(store.unique_addresses(), vec![300, 200, 100, 60]);
        assert_eq!(store.sites_on_addr(&sites(), 100), vec![4]);
        assert!(!store.all_sites_the_same(&sites(), 100));

        store.clear();
        assert!(store.is_empty());
        assert!(store.unique_addresses().is_empty());
    }

    #[test]
    fn converts_to_overlay_data() {
        let mut store = SiteDataStore::new();
        store.set_data(&sites(), 0x20, 0xAB);
        assert_eq!(store.overlay_data(&sites(), 0x20), Some(OverlayData::Scalar(0xAB)));

        store.set_data_on_site(2, 0x20, 0xCD);
        let expected: BTreeMap<Site, u64> = [(1, 0xAB), (2, 0xCD), (4, 0xAB)].into_iter().collect();
        assert_eq!(store.overlay_data(&sites(), 0x20), Some(OverlayData::PerSite(expected)));

        assert_eq!(store.overlay_data(&sites(), 0x99), None);
    }
}
