/// Single-slot cache with explicit, key-driven invalidation.
///
/// Expensive kernels (the Fresnel propagator array, the evaluated contrast
/// transfer function) depend on a handful of parameters that rarely change
/// between consecutive calls. The cache retains only the most recent entry;
/// a key change replaces it. Owners invalidate explicitly whenever a
/// dependency mutates outside the key.
#[derive(Debug)]
pub struct KernelCache<K: PartialEq, V> {
    slot: Option<(K, V)>,
    builds: usize,
}

impl<K: PartialEq, V> Default for KernelCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq, V> KernelCache<K, V> {
    pub fn new() -> Self {
        Self {
            slot: None,
            builds: 0,
        }
    }

    /// Number of times the build closure has run; lets callers observe
    /// cache effectiveness.
    pub fn builds(&self) -> usize {
        self.builds
    }

    pub fn invalidate(&mut self) {
        self.slot = None;
    }

    pub fn get_or_insert_with<F>(&mut self, key: K, build: F) -> &V
    where
        F: FnOnce() -> V,
    {
        let hit = matches!(&self.slot, Some((cached, _)) if *cached == key);
        if !hit {
            self.builds += 1;
            self.slot = Some((key, build()));
        }
        match &self.slot {
            Some((_, value)) => value,
            None => unreachable!("slot populated above"),
        }
    }

    pub fn try_get_or_insert_with<F, E>(&mut self, key: K, build: F) -> Result<&V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let hit = matches!(&self.slot, Some((cached, _)) if *cached == key);
        if !hit {
            let value = build()?;
            self.builds += 1;
            self.slot = Some((key, value));
        }
        match &self.slot {
            Some((_, value)) => Ok(value),
            None => unreachable!("slot populated above"),
        }
    }
}

/// Bit-exact representation of an `f64` usable in cache keys.
#[inline]
pub fn key_bits(value: f64) -> u64 {
    value.to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_key_reuses_the_cached_value() {
        let mut cache: KernelCache<u64, Vec<f64>> = KernelCache::new();
        let first = cache.get_or_insert_with(1, || vec![1.0, 2.0]).clone();
        let second = cache.get_or_insert_with(1, || panic!("must not rebuild")).clone();
        assert_eq!(first, second);
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn key_change_rebuilds_and_evicts() {
        let mut cache: KernelCache<u64, u64> = KernelCache::new();
        cache.get_or_insert_with(1, || 10);
        cache.get_or_insert_with(2, || 20);
        assert_eq!(cache.builds(), 2);
        // Returning to the first key rebuilds; capacity is one.
        let value = *cache.get_or_insert_with(1, || 11);
        assert_eq!(value, 11);
        assert_eq!(cache.builds(), 3);
    }

    #[test]
    fn invalidate_forces_a_rebuild() {
        let mut cache: KernelCache<u64, u64> = KernelCache::new();
        cache.get_or_insert_with(1, || 10);
        cache.invalidate();
        cache.get_or_insert_with(1, || 10);
        assert_eq!(cache.builds(), 2);
    }

    #[test]
    fn failed_build_leaves_the_cache_empty() {
        let mut cache: KernelCache<u64, u64> = KernelCache::new();
        let result: Result<&u64, &str> = cache.try_get_or_insert_with(1, || Err("boom"));
        assert!(result.is_err());
        assert_eq!(cache.builds(), 0);
        let value = cache.try_get_or_insert_with::<_, &str>(1, || Ok(7)).unwrap();
        assert_eq!(*value, 7);
    }
}
