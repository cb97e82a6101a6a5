use std::num::NonZeroU16;

/// A `HashMap` keyed by port number.
///
/// Ports are single `NonZeroU16` values, so there is nothing to hash; the
/// port is the hash.
pub type PortMap<V> =
    std::collections::HashMap<NonZeroU16, V, std::hash::BuildHasherDefault<PortHasher>>;

/// A hasher that uses a port's value directly.
#[derive(Debug, Default)]
pub struct PortHasher(u16);

impl std::hash::Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}
