//! Typed resource handles
//!
//! Every resource kind gets its own generational key. A key stays valid from
//! the creation call until the object is released; after that the slot's
//! generation moves on and the old key never resolves again, even when the
//! slot itself is reused by a later allocation.

use slotmap::new_key_type;

new_key_type! {
    /// Handle to an immutable vertex stream
    pub struct VertexBufferHandle;
    /// Handle to an index buffer
    pub struct IndexBufferHandle;
    /// Handle to a CPU-writable constant buffer
    pub struct ConstantBufferHandle;
    /// Handle to a sampled 2D texture (texture, view, sampler)
    pub struct Texture2DHandle;
    /// Handle to an offscreen render target (texture, render view, shader view)
    pub struct RenderTargetHandle;
    /// Handle to a standalone sampler
    pub struct SamplerHandle;
    /// Handle to a vertex/pixel shader pair with its input layout
    pub struct ShaderHandle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::{Key, SlotMap};

    #[test]
    fn test_default_handle_is_null() {
        assert!(VertexBufferHandle::default().is_null());
        assert!(Texture2DHandle::null().is_null());
    }

    #[test]
    fn test_cleared_handles_never_resolve() {
        let mut pool: SlotMap<RenderTargetHandle, u32> = SlotMap::with_key();
        let first = pool.insert(1);
        pool.clear();
        let second = pool.insert(2);

        assert_ne!(first, second);
        assert!(pool.get(first).is_none());
        assert_eq!(pool.get(second), Some(&2));
    }
}
