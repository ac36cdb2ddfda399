use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use super::{GpuContext, GpuError};
use crate::loom::shape::TexShape;

/// Creates and destroys device textures and counts the ones in use.
///
/// Every acquisition is a fresh allocation; released textures are destroyed, not pooled.
#[derive(Debug)]
pub struct TextureManager<C> {
    context: Arc<C>,
    used: AtomicUsize,
}

impl<C: GpuContext> TextureManager<C> {
    pub fn new(context: Arc<C>) -> Self {
        let used = AtomicUsize::new(0);
        Self { context, used }
    }

    pub fn acquire(&self, shape: TexShape) -> Result<C::Texture, GpuError> {
        let texture = self.context.create_texture(shape)?;
        let used = self.used.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("acquire texture {shape}, {used} in use");
        Ok(texture)
    }

    pub fn release(&self, texture: C::Texture, shape: TexShape) {
        self.context.delete_texture(texture);
        let used = self.used.fetch_sub(1, Ordering::AcqRel) - 1;
        log::trace!("release texture {shape}, {used} in use");
    }

    /// Number of textures acquired and not yet released.
    #[inline]
    pub fn num_used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Releases every texture in `textures`.
    pub fn dispose_all(&self, textures: impl IntoIterator<Item = (C::Texture, TexShape)>) {
        for (texture, shape) in textures {
            self.release(texture, shape);
        }
        if self.num_used() > 0 {
            log::warn!("{} textures still in use after disposal", self.num_used());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use super::TextureManager;
    use crate::loom::{device::gpu::mock::MockContext, shape::TexShape};

    #[test]
    fn test_counting() -> Result<(), Box<dyn Error>> {
        let context = Arc::new(MockContext::default());
        let manager = TextureManager::new(context.clone());

        let shape = TexShape([3, 1]);
        let a = manager.acquire(shape)?;
        let b = manager.acquire(shape)?;
        assert_eq!(manager.num_used(), 2);

        manager.release(a, shape);
        assert_eq!(manager.num_used(), 1);
        let c = manager.acquire(TexShape([2, 2]))?;
        assert_eq!(manager.num_used(), 2);
        // no reuse: three textures were created in total
        assert_eq!(context.num_created(), 3);

        manager.dispose_all([(b, shape), (c, TexShape([2, 2]))]);
        assert_eq!(manager.num_used(), 0);
        assert_eq!(context.num_deleted(), 3);
        Ok(())
    }
}
