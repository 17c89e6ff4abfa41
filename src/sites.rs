//! Active and configured DUT sites, and storage indexed directly by site number.

use crate::error::SiteError;

/// 1-based identifier of one DUT position on the tester.
pub type Site = usize;

/// The sites under test for the current invocation together with the configured superset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSet {
    active: Vec<Site>,
    configured: usize,
}

impl SiteSet {
    /// Builds a site set, keeping the active sites in the order given.
    pub fn new(
        active: impl IntoIterator<Item = Site>,
        configured: usize,
    ) -> Result<Self, SiteError> {
        if configured == 0 {
            return Err(SiteError::NoConfiguredSites);
        }
        let mut sites: Vec<Site> = Vec::new();
        for site in active {
            if site == 0 {
                return Err(SiteError::ZeroSite);
            }
            if site > configured {
                return Err(SiteError::NotConfigured { site, configured });
            }
            if sites.contains(&site) {
                return Err(SiteError::Duplicate(site));
            }
            sites.push(site);
        }
        Ok(Self {
            active: sites,
            configured,
        })
    }

    /// Every configured site is active.
    pub fn all(configured: usize) -> Result<Self, SiteError> {
        Self::new(1..=configured, configured)
    }

    pub fn active(&self) -> &[Site] {
        &self.active
    }

    pub fn configured_count(&self) -> usize {
        self.configured
    }

    pub fn is_active(&self, site: Site) -> bool {
        self.active.contains(&site)
    }

    /// Length of per-site storage: one slot per configured site plus the unused slot 0.
    pub fn storage_len(&self) -> usize {
        self.configured + 1
    }
}

/// A value per physical site, addressed by site number without translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteValues<T> {
    slots: Vec<T>,
}

impl<T: Clone> SiteValues<T> {
    pub fn new(sites: &SiteSet, fill: T) -> Self {
        Self {
            slots: vec![fill; sites.storage_len()],
        }
    }
}

impl<T> SiteValues<T> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, site: Site) -> Option<&T> {
        if site == 0 {
            return None;
        }
        self.slots.get(site)
    }

    /// Stores `value` for `site`, returning `false` if the site has no slot.
    pub fn set(&mut self, site: Site, value: T) -> bool {
        match self.slots.get_mut(site) {
            Some(slot) if site != 0 => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.slots
    }
}

impl<T> std::ops::Index<Site> for SiteValues<T> {
    type Output = T;

    fn index(&self, site: Site) -> &T {
        &self.slots[site]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_active_order() {
        let sites = SiteSet::new([3, 1], 4).unwrap();
        assert_eq!(sites.active(), &[3, 1]);
        assert_eq!(sites.configured_count(), 4);
        assert_eq!(sites.storage_len(), 5);
        assert!(sites.is_active(1));
        assert!(!sites.is_active(2));
    }

    #[test]
    fn rejects_invalid_sites() {
        assert_eq!(SiteSet::new([1], 0).unwrap_err(), SiteError::NoConfiguredSites);
        assert_eq!(SiteSet::new([0, 1], 4).unwrap_err(), SiteError::ZeroSite);
        assert_eq!(
            SiteSet::new([5], 4).unwrap_err(),
            SiteError::NotConfigured { site: 5, configured: 4 }
        );
        assert_eq!(SiteSet::new([2, 2], 4).unwrap_err(), SiteError::Duplicate(2));
    }

    #[test]
    fn empty_active_set_is_allowed() {
        let sites = SiteSet::new([], 2).unwrap();
        assert!(sites.active().is_empty());
        assert_eq!(sites.storage_len(), 3);
    }

    #[test]
    fn site_values_index_by_site_number() {
        let sites = SiteSet::new([1, 3], 4).unwrap();
        let mut values = SiteValues::new(&sites, 0.0);
        assert_eq!(values.len(), 5);
        assert!(values.set(3, 1.5));
        assert!(!values.set(0, 9.0));
        assert!(!values.set(5, 9.0));
        assert_eq!(values[3], 1.5);
        assert_eq!(values.get(0), None);
        assert_eq!(values.get(4), Some(&0.0));
        assert_eq!(values.get(7), None);
    }
}
