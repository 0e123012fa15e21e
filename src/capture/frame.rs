use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::pool::PlaneLayout;

/// Frame metadata delivered with every completed capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bytes_used: usize,
    pub timestamp: Duration, // Device clock
}

/// Pixel formats we can share between capture and scanout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Xrgb8888,
    Rgb565,
    Yuyv,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    /// DRM fourcc, `None` for formats a plane can never scan out.
    pub fn drm_fourcc(self) -> Option<u32> {
        match self {
            Self::Xrgb8888 => Some(fourcc(b"XR24")),
            Self::Rgb565 => Some(fourcc(b"RG16")),
            Self::Yuyv => Some(fourcc(b"YUYV")),
            Self::Nv12 => Some(fourcc(b"NV12")),
            Self::Mjpeg => None,
        }
    }

    pub fn v4l2_fourcc(self) -> [u8; 4] {
        match self {
            // V4L2 "XR24" is B,G,R,X in memory, same as DRM XRGB8888 little endian
            Self::Xrgb8888 => *b"XR24",
            Self::Rgb565 => *b"RGBP",
            Self::Yuyv => *b"YUYV",
            Self::Nv12 => *b"NV12",
            Self::Mjpeg => *b"MJPG",
        }
    }

    pub fn from_v4l2_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"XR24" => Some(Self::Xrgb8888),
            b"RGBP" => Some(Self::Rgb565),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Mjpeg)
    }

    /// Tightly packed plane layout and total size, or `None` for compressed formats.
    pub fn layout(self, width: u32, height: u32) -> Option<(Vec<PlaneLayout>, usize)> {
        let packed = |bpp: u32| {
            let stride = width * bpp;
            (
                vec![PlaneLayout { offset: 0, stride }],
                stride as usize * height as usize,
            )
        };

        match self {
            Self::Xrgb8888 => Some(packed(4)),
            Self::Rgb565 | Self::Yuyv => Some(packed(2)),
            Self::Nv12 => {
                let luma = width * height;
                let planes = vec![
                    PlaneLayout {
                        offset: 0,
                        stride: width,
                    },
                    PlaneLayout {
                        offset: luma,
                        stride: width,
                    },
                ];
                Some((planes, luma as usize * 3 / 2))
            }
            Self::Mjpeg => None,
        }
    }
}

pub fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Printable fourcc, cut at the first padding space.
pub fn fourcc_to_string(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .take_while(|b| !b.is_ascii_whitespace() && **b != 0)
        .map(|&b| b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_strings_trim_padding() {
        assert_eq!(fourcc_to_string(fourcc(b"XR24")), "XR24");
        assert_eq!(fourcc_to_string(fourcc(b"Y16 ")), "Y16");
    }

    #[test]
    fn nv12_layout_places_chroma_after_luma() {
        let (planes, len) = PixelFormat::Nv12.layout(640, 480).unwrap();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[1].offset, 640 * 480);
        assert_eq!(len, 640 * 480 * 3 / 2);
    }

    #[test]
    fn mjpeg_has_no_scanout_representation() {
        assert!(PixelFormat::Mjpeg.drm_fourcc().is_none());
        assert!(PixelFormat::Mjpeg.layout(640, 480).is_none());
        assert_eq!(
            PixelFormat::from_v4l2_fourcc(&PixelFormat::Yuyv.v4l2_fourcc()),
            Some(PixelFormat::Yuyv)
        );
    }
}
