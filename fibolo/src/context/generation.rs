use std::collections::HashMap;
use std::os::fd::RawFd;

/// Generation counter per raw descriptor number.
///
/// Descriptors below the fast table size, the overwhelming majority, index a
/// flat array; larger ones fall back to a hash map. A raw descriptor that was
/// never unregistered is at generation 0.
#[derive(Debug)]
pub(crate) struct Generations {
    fast: Box<[u32]>,
    slow: HashMap<RawFd, u32>,
}

impl Generations {
    pub(crate) fn new(fast_size: usize) -> Self {
        Self {
            fast: vec![0; fast_size].into_boxed_slice(),
            slow: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, fd: RawFd) -> u32 {
        debug_assert!(fd >= 0);
        match self.fast.get(fd as usize) {
            Some(generation) => *generation,
            None => self.slow.get(&fd).copied().unwrap_or(0),
        }
    }

    /// Invalidates every handle minted for `fd` so far.
    pub(crate) fn bump(&mut self, fd: RawFd) {
        debug_assert!(fd >= 0);
        match self.fast.get_mut(fd as usize) {
            Some(generation) => *generation = generation.wrapping_add(1),
            None => {
                let generation = self.slow.entry(fd).or_insert(0);
                *generation = generation.wrapping_add(1);
            }
        }
    }
}
