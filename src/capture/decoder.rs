use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use crate::error::DecodeError;

/// Packed RGB24 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Decodes a baseline or progressive JPEG into RGB24. Any fatal codec
/// condition comes back as [`DecodeError`].
pub fn decode_jpeg(data: &[u8]) -> Result<DecodedImage, DecodeError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder.info().ok_or(DecodeError::MissingInfo)?;

    let rgb = match info.pixel_format {
        JpegPixelFormat::RGB24 => pixels,
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => return Err(DecodeError::UnsupportedPixelFormat(other)),
    };

    Ok(DecodedImage {
        width: info.width as u32,
        height: info.height as u32,
        rgb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_a_codec_error() {
        let err = decode_jpeg(b"definitely not a jpeg").unwrap_err();
        assert!(matches!(err, DecodeError::Codec(_)));
    }

    #[test]
    fn truncated_stream_is_a_codec_error() {
        // SOI marker followed by nothing
        let err = decode_jpeg(&[0xFF, 0xD8]).unwrap_err();
        assert!(matches!(err, DecodeError::Codec(_)));
    }
}
