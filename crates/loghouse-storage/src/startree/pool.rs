//! Bounded pool of star-tree builders.
//!
//! Builders hold large arenas, so the number alive at once is capped. A
//! checked-out builder goes back to the pool when its [`PooledBuilder`]
//! guard drops.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use super::builder::StarTreeBuilder;

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<StarTreeBuilder>,
    in_use: usize,
}

#[derive(Debug)]
pub struct StarTreePool {
    state: Mutex<PoolState>,
    max_concurrent: usize,
}

impl StarTreePool {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState::default()),
            max_concurrent,
        })
    }

    /// Check out a builder, `None` when every slot is taken.
    pub fn try_get(self: &Arc<Self>) -> Option<PooledBuilder> {
        let mut state = self.state.lock();
        if state.in_use >= self.max_concurrent {
            return None;
        }
        state.in_use += 1;
        let builder = state.idle.pop().unwrap_or_default();
        Some(PooledBuilder {
            builder: Some(builder),
            pool: Arc::clone(self),
        })
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    fn release(&self, builder: StarTreeBuilder) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        state.idle.push(builder);
    }
}

/// A builder checked out of a [`StarTreePool`].
#[derive(Debug)]
pub struct PooledBuilder {
    builder: Option<StarTreeBuilder>,
    pool: Arc<StarTreePool>,
}

impl Deref for PooledBuilder {
    type Target = StarTreeBuilder;

    fn deref(&self) -> &StarTreeBuilder {
        self.builder
            .as_ref()
            .unwrap_or_else(|| unreachable!("builder taken before drop"))
    }
}

impl DerefMut for PooledBuilder {
    fn deref_mut(&mut self) -> &mut StarTreeBuilder {
        self.builder
            .as_mut()
            .unwrap_or_else(|| unreachable!("builder taken before drop"))
    }
}

impl Drop for PooledBuilder {
    fn drop(&mut self) {
        if let Some(builder) = self.builder.take() {
            self.pool.release(builder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_caps_concurrent_builders() {
        let pool = StarTreePool::new(2);
        let a = pool.try_get().unwrap();
        let _b = pool.try_get().unwrap();
        assert!(pool.try_get().is_none());
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_get().is_some());
    }

    #[test]
    fn test_released_builder_is_reused() {
        let pool = StarTreePool::new(1);
        {
            let mut stb = pool.try_get().unwrap();
            stb.reset_seg_tree(vec!["host".into()], vec![], 10);
        }
        let stb = pool.try_get().unwrap();
        assert_eq!(stb.group_by_keys(), &["host".to_string()]);
    }
}
