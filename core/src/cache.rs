use crate::{PortMap, PublicPort};
use std::num::NonZeroU16;

/// An engine instance's authoritative view of the public ports materialised
/// in the cluster, keyed by port number.
///
/// The cache is owned by a single reconciler task and is rebuilt from the
/// live proxy Deployment at startup, so it never needs to be persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PortCache {
    ports: PortMap<PublicPort>,
}

impl PortCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.ports.clear();
    }

    pub fn get(&self, port: NonZeroU16) -> Option<&PublicPort> {
        self.ports.get(&port)
    }

    /// Inserts or replaces the entry for the port's own number, returning the
    /// previous entry if there was one.
    pub fn insert(&mut self, pp: PublicPort) -> Option<PublicPort> {
        self.ports.insert(pp.port, pp)
    }

    pub fn remove(&mut self, port: NonZeroU16) -> Option<PublicPort> {
        self.ports.remove(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublicPort> {
        self.ports.values()
    }

    pub fn ports(&self) -> impl Iterator<Item = NonZeroU16> + '_ {
        self.ports.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl Extend<PublicPort> for PortCache {
    fn extend<I: IntoIterator<Item = PublicPort>>(&mut self, iter: I) {
        for pp in iter {
            self.insert(pp);
        }
    }
}

impl FromIterator<PublicPort> for PortCache {
    fn from_iter<I: IntoIterator<Item = PublicPort>>(iter: I) -> Self {
        let mut cache = Self::new();
        cache.extend(iter);
        cache
    }
}
