//! CPU-side textures: TGA and image-crate loading, mip generation

use crate::backend::types::TextureFormat;
use crate::error::{RhiError, RhiResult};
use image::{DynamicImage, GenericImageView};
use std::path::Path;

const TGA_HEADER_LEN: usize = 18;
const TGA_UNCOMPRESSED_TRUE_COLOR: u8 = 2;

/// Tightly packed 8-bit, four channel image in system memory
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTexture {
    pub width: u32,
    pub height: u32,
    /// `Rgba8Unorm` or `Bgra8Unorm`
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl CpuTexture {
    /// Wrap raw pixels, checking the buffer covers `width` x `height`
    pub fn new(
        width: u32,
        height: u32,
        format: TextureFormat,
        data: Vec<u8>,
        name: &str,
    ) -> RhiResult<Self> {
        if !matches!(format, TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm) {
            return Err(RhiError::TextureDecode(format!(
                "{}: unsupported CPU texture format {:?}",
                name, format
            )));
        }
        if width == 0 || height == 0 {
            return Err(RhiError::TextureDecode(format!("{}: image is empty", name)));
        }
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(RhiError::TextureDecode(format!(
                "{}: {} bytes of pixel data for {}x{} (expected {})",
                name,
                data.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            name: name.to_string(),
        })
    }

    /// Load an uncompressed 24 or 32 bit TGA file
    pub fn load_tga<P: AsRef<Path>>(path: P) -> RhiResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| RhiError::TextureDecode(format!("{}: {}", path.display(), e)))?;
        Self::decode_tga(&bytes, &file_name(path))
    }

    /// Decode an uncompressed true-color TGA image.
    ///
    /// Pixels stay in file order (BGR(A), rows as stored). 24-bit images get
    /// an opaque alpha channel.
    pub fn decode_tga(bytes: &[u8], name: &str) -> RhiResult<Self> {
        if bytes.len() < TGA_HEADER_LEN {
            return Err(RhiError::TextureDecode(format!(
                "{}: truncated TGA header",
                name
            )));
        }
        if bytes[2] != TGA_UNCOMPRESSED_TRUE_COLOR {
            return Err(RhiError::TextureDecode(format!(
                "{}: TGA image type {} is not uncompressed true-color",
                name, bytes[2]
            )));
        }

        let id_length = bytes[0] as usize;
        let width = u16::from_le_bytes([bytes[12], bytes[13]]) as u32;
        let height = u16::from_le_bytes([bytes[14], bytes[15]]) as u32;
        let channels = match bytes[16] {
            24 => 3,
            32 => 4,
            bpp => {
                return Err(RhiError::TextureDecode(format!(
                    "{}: unsupported TGA depth of {} bits",
                    name, bpp
                )))
            }
        };

        let start = TGA_HEADER_LEN + id_length;
        let len = width as usize * height as usize * channels;
        let pixels = bytes.get(start..start + len).ok_or_else(|| {
            RhiError::TextureDecode(format!(
                "{}: pixel data truncated ({} of {} bytes)",
                name,
                bytes.len().saturating_sub(start),
                len
            ))
        })?;

        let data = if channels == 4 {
            pixels.to_vec()
        } else {
            pixels
                .chunks_exact(3)
                .flat_map(|bgr| [bgr[0], bgr[1], bgr[2], 255])
                .collect()
        };

        Self::new(width, height, TextureFormat::Bgra8Unorm, data, name)
    }

    /// Load any format the image crate understands
    pub fn from_file<P: AsRef<Path>>(path: P) -> RhiResult<Self> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|e| RhiError::TextureDecode(format!("{}: {}", path.display(), e)))?;
        Self::from_image(img, &file_name(path))
    }

    /// Decode an in-memory image with the image crate
    pub fn from_bytes(bytes: &[u8], name: &str) -> RhiResult<Self> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| RhiError::TextureDecode(format!("{}: {}", name, e)))?;
        Self::from_image(img, name)
    }

    fn from_image(img: DynamicImage, name: &str) -> RhiResult<Self> {
        let (width, height) = img.dimensions();
        let data = img.to_rgba8().into_raw();
        Self::new(width, height, TextureFormat::Rgba8Unorm, data, name)
    }

    /// Create a solid color texture
    pub fn solid_color(width: u32, height: u32, color: [u8; 4], name: &str) -> Self {
        Self {
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            data: color.repeat(width as usize * height as usize),
            name: name.to_string(),
        }
    }

    /// 2x2 magenta stand-in for missing textures
    pub fn debug() -> Self {
        Self::solid_color(2, 2, [255, 0, 255, 255], "debug")
    }

    /// Create a checkerboard texture with 8 pixel squares
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                data.extend_from_slice(if is_even { &color1 } else { &color2 });
            }
        }

        Self {
            width: size,
            height: size,
            format: TextureFormat::Rgba8Unorm,
            data,
            name: "checkerboard".to_string(),
        }
    }

    /// Number of levels in a full mip chain down to 1x1
    pub fn mip_level_count(&self) -> u32 {
        mip_level_count(self.width, self.height)
    }

    /// Full mip chain, level 0 first, each level box-filtered from the previous
    pub fn mip_chain(&self) -> Vec<Vec<u8>> {
        let levels = self.mip_level_count();
        let mut chain = Vec::with_capacity(levels as usize);
        chain.push(self.data.clone());

        let (mut width, mut height) = (self.width, self.height);
        for _ in 1..levels {
            let (next_width, next_height) = ((width / 2).max(1), (height / 2).max(1));
            let next = downsample(&chain[chain.len() - 1], width, height, next_width, next_height);
            chain.push(next);
            width = next_width;
            height = next_height;
        }

        chain
    }
}

/// `1 + floor(log2(max(width, height)))`
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// 2x2 box filter; odd edges reuse the last texel
fn downsample(src: &[u8], width: u32, height: u32, dst_width: u32, dst_height: u32) -> Vec<u8> {
    let texel = |x: u32, y: u32, c: usize| -> u32 {
        let x = x.min(width - 1) as usize;
        let y = y.min(height - 1) as usize;
        src[(y * width as usize + x) * 4 + c] as u32
    };

    let mut dst = Vec::with_capacity((dst_width * dst_height * 4) as usize);
    for y in 0..dst_height {
        for x in 0..dst_width {
            let (sx, sy) = (x * 2, y * 2);
            for c in 0..4 {
                let sum = texel(sx, sy, c)
                    + texel(sx + 1, sy, c)
                    + texel(sx, sy + 1, c)
                    + texel(sx + 1, sy + 1, c);
                dst.push(((sum + 2) / 4) as u8);
            }
        }
    }
    dst
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Encode pixels as an uncompressed TGA; used to produce fixtures
pub fn encode_tga(width: u16, height: u16, bits_per_pixel: u8, pixels: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; TGA_HEADER_LEN];
    bytes[2] = TGA_UNCOMPRESSED_TRUE_COLOR;
    bytes[12..14].copy_from_slice(&width.to_le_bytes());
    bytes[14..16].copy_from_slice(&height.to_le_bytes());
    bytes[16] = bits_per_pixel;
    bytes.extend_from_slice(pixels);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 2), 2);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(300, 20), 9);
        assert_eq!(mip_level_count(1024, 512), 11);
    }

    #[test]
    fn test_mip_chain_halves_down_to_one_texel() {
        let texture = CpuTexture::checkerboard(16, [255; 4], [0, 0, 0, 255]);
        let chain = texture.mip_chain();

        assert_eq!(chain.len(), 5);
        let sizes: Vec<usize> = chain.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![16 * 16 * 4, 8 * 8 * 4, 4 * 4 * 4, 2 * 2 * 4, 4]);
        // 8 pixel squares average to mid grey by the last level
        assert_eq!(chain[4], vec![128, 128, 128, 255]);
    }

    #[test]
    fn test_mip_chain_non_square() {
        let texture = CpuTexture::solid_color(4, 1, [10, 20, 30, 40], "strip");
        let chain = texture.mip_chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[1], [10, 20, 30, 40].repeat(2));
        assert_eq!(chain[2], vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_decode_32bit_tga_keeps_bgra() {
        let pixels = [1, 2, 3, 4, 5, 6, 7, 8];
        let texture = CpuTexture::decode_tga(&encode_tga(2, 1, 32, &pixels), "two").unwrap();
        assert_eq!((texture.width, texture.height), (2, 1));
        assert_eq!(texture.format, TextureFormat::Bgra8Unorm);
        assert_eq!(texture.data, pixels);
    }

    #[test]
    fn test_decode_24bit_tga_adds_alpha() {
        let pixels = [10, 20, 30, 40, 50, 60];
        let texture = CpuTexture::decode_tga(&encode_tga(1, 2, 24, &pixels), "rgb").unwrap();
        assert_eq!(texture.data, vec![10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn test_decode_rejects_compressed_and_odd_depths() {
        let mut rle = encode_tga(1, 1, 32, &[0; 4]);
        rle[2] = 10;
        assert!(matches!(
            CpuTexture::decode_tga(&rle, "rle"),
            Err(RhiError::TextureDecode(_))
        ));
        assert!(CpuTexture::decode_tga(&encode_tga(1, 1, 16, &[0; 2]), "16").is_err());
        assert!(CpuTexture::decode_tga(&encode_tga(4, 4, 32, &[0; 8]), "short").is_err());
        assert!(CpuTexture::decode_tga(&[0; 4], "header").is_err());
    }

    #[test]
    fn test_new_validates_length() {
        assert!(CpuTexture::new(2, 2, TextureFormat::Rgba8Unorm, vec![0; 15], "bad").is_err());
        assert!(CpuTexture::new(2, 2, TextureFormat::Rgba16Float, vec![0; 32], "bad").is_err());
        assert!(CpuTexture::new(2, 2, TextureFormat::Rgba8Unorm, vec![0; 16], "ok").is_ok());
    }

    #[test]
    fn test_debug_texture_is_magenta() {
        let texture = CpuTexture::debug();
        assert_eq!((texture.width, texture.height), (2, 2));
        assert_eq!(texture.data, [255, 0, 255, 255].repeat(4));
        assert_eq!(texture.mip_level_count(), 2);
    }
}
