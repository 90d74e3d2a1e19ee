//! Path-keyed texture cache

use crate::backend::traits::RenderDevice;
use crate::error::{RhiError, RhiResult};
use crate::handle::Texture2DHandle;
use crate::resources::CpuTexture;
use crate::rhi::Rhi;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Loads each texture file once and hands out the same handle afterwards.
#[derive(Debug, Default)]
pub struct TextureMap {
    entries: HashMap<PathBuf, Texture2DHandle>,
}

impl TextureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handle for the texture at `path`, loading and uploading it on first use.
    ///
    /// A cached handle whose texture has since been released is reloaded.
    pub fn get_texture_2d_from_path<D: RenderDevice>(
        &mut self,
        rhi: &mut Rhi<D>,
        path: impl AsRef<Path>,
    ) -> RhiResult<Texture2DHandle> {
        let key = absolute(path.as_ref())?;

        if let Some(&handle) = self.entries.get(&key) {
            if rhi.contains_texture_2d(handle) {
                log::trace!("TextureMap hit: {}", key.display());
                return Ok(handle);
            }
            log::debug!("TextureMap entry for {} was released; reloading", key.display());
        }

        let texture = load(&key).inspect_err(|e| log::error!("{}", e))?;
        let handle = rhi.create_texture_2d(&texture)?;
        log::info!(
            "Loaded texture {} ({}x{})",
            key.display(),
            texture.width,
            texture.height
        );

        self.entries.insert(key, handle);
        Ok(handle)
    }

    /// Forget every entry. The textures stay alive in the RHI.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn absolute(path: &Path) -> RhiResult<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| RhiError::TextureDecode(format!("{}: {}", path.display(), e)))
}

fn load(path: &Path) -> RhiResult<CpuTexture> {
    let is_tga = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("tga"));

    if is_tga {
        CpuTexture::load_tga(path)
    } else {
        CpuTexture::from_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;
    use crate::resources::encode_tga;
    use crate::window::Window;
    use crate::RhiConfig;

    fn temp_tga(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("rndr-{}-{}.tga", name, std::process::id()));
        let pixels = [0u8, 0, 255, 255].repeat(4);
        std::fs::write(&path, encode_tga(2, 2, 32, &pixels)).unwrap();
        path
    }

    #[test]
    fn test_second_lookup_is_a_cache_hit() {
        let path = temp_tga("cache-hit");
        let mut rhi: Rhi<RecordingDevice> =
            Rhi::init(&Window::headless(32, 32), RhiConfig::default()).unwrap();
        let mut map = TextureMap::new();

        let first = map.get_texture_2d_from_path(&mut rhi, &path).unwrap();
        let objects = rhi.live_object_count();
        let second = map.get_texture_2d_from_path(&mut rhi, &path).unwrap();

        assert_eq!(first, second);
        assert_eq!(rhi.live_object_count(), objects);
        assert_eq!(map.len(), 1);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_released_entry_is_reloaded() {
        let path = temp_tga("reload");
        let mut rhi: Rhi<RecordingDevice> =
            Rhi::init(&Window::headless(32, 32), RhiConfig::default()).unwrap();
        let mut map = TextureMap::new();

        let first = map.get_texture_2d_from_path(&mut rhi, &path).unwrap();
        rhi.release_texture_2d(first).unwrap();
        let second = map.get_texture_2d_from_path(&mut rhi, &path).unwrap();

        assert_ne!(first, second);
        assert!(rhi.contains_texture_2d(second));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file_is_a_decode_error() {
        let mut rhi: Rhi<RecordingDevice> =
            Rhi::init(&Window::headless(32, 32), RhiConfig::default()).unwrap();
        let mut map = TextureMap::new();

        let result = map.get_texture_2d_from_path(&mut rhi, "does/not/exist.tga");
        assert!(matches!(result, Err(RhiError::TextureDecode(_))));
        assert!(map.is_empty());
    }
}
