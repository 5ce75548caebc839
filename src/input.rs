use crate::error::CaptionError;
use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
use std::path::Path;

/// Interleaved 8-bit RGB image, the pixel array handed to the model.
pub type RgbImage = Image<u8, 3, CpuAllocator>;

/// An image as it arrives from a caller.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// An encoded file (PNG, JPEG) as uploaded through the form.
    Encoded(Vec<u8>),
    /// Raw interleaved RGB pixels, row-major.
    Pixels {
        /// Width in pixels.
        width: usize,
        /// Height in pixels.
        height: usize,
        /// `width * height * 3` bytes.
        data: Vec<u8>,
    },
}

impl ImageInput {
    /// Number of payload bytes, used for request telemetry.
    pub fn byte_len(&self) -> usize {
        match self {
            ImageInput::Encoded(bytes) => bytes.len(),
            ImageInput::Pixels { data, .. } => data.len(),
        }
    }
}

/// Converts an [`ImageInput`] into an RGB image.
///
/// Encoded images of any color type are converted to RGB. Raw arrays must be
/// non-empty and hold exactly three bytes per pixel.
pub fn decode_image(input: ImageInput) -> Result<RgbImage, CaptionError> {
    match input {
        ImageInput::Encoded(bytes) => {
            let decoded = image::load_from_memory(&bytes)
                .map_err(|e| CaptionError::InvalidImage(e.to_string()))?
                .to_rgb8();
            let (width, height) = decoded.dimensions();
            from_pixels(width as usize, height as usize, decoded.into_raw())
        }
        ImageInput::Pixels {
            width,
            height,
            data,
        } => from_pixels(width, height, data),
    }
}

fn from_pixels(width: usize, height: usize, data: Vec<u8>) -> Result<RgbImage, CaptionError> {
    if width == 0 || height == 0 {
        return Err(CaptionError::InvalidImage(format!(
            "image has no pixels ({width}x{height})"
        )));
    }
    let expected = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(3))
        .ok_or_else(|| {
            CaptionError::InvalidImage(format!("image dimensions {width}x{height} are too large"))
        })?;
    if data.len() != expected {
        return Err(CaptionError::InvalidImage(format!(
            "expected {expected} bytes for a {width}x{height} RGB image, got {}",
            data.len()
        )));
    }
    Image::new(ImageSize { width, height }, data, CpuAllocator)
        .map_err(|e| CaptionError::InvalidImage(e.to_string()))
}

/// Writes the image as PNG, replacing any existing file.
pub fn write_png(path: &Path, image: &RgbImage) -> Result<(), CaptionError> {
    kornia_io::png::write_image_png_rgb8(path, image)
        .map_err(|e| CaptionError::io(path, std::io::Error::other(e.to_string())))
}

/// Copies the pixels into an `image` buffer for resampling.
pub(crate) fn to_rgb_buffer(image: &RgbImage) -> Result<image::RgbImage, CaptionError> {
    image::RgbImage::from_raw(
        image.width() as u32,
        image.height() as u32,
        image.as_slice().to_vec(),
    )
    .ok_or_else(|| CaptionError::InvalidImage("pixel buffer does not match size".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 10) as u8, (y * 10) as u8, 128])
        });
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn decodes_encoded_png() {
        let img = decode_image(ImageInput::Encoded(encode_png(4, 3))).unwrap();
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 3);
        assert_eq!(&img.as_slice()[..3], &[0, 0, 128]);
    }

    #[test]
    fn decodes_grayscale_as_rgb() {
        let gray = image::GrayImage::from_pixel(2, 2, image::Luma([77]));
        let mut bytes = Vec::new();
        gray.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let img = decode_image(ImageInput::Encoded(bytes)).unwrap();
        assert_eq!(img.as_slice().len(), 2 * 2 * 3);
        assert!(img.as_slice().iter().all(|&v| v == 77));
    }

    #[test]
    fn rejects_garbage_bytes() {
        let err = decode_image(ImageInput::Encoded(b"not an image".to_vec())).err().unwrap();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
    }

    #[test]
    fn rejects_mismatched_pixel_array() {
        let err = decode_image(ImageInput::Pixels {
            width: 224,
            height: 224,
            data: vec![0; 10],
        })
        .err().unwrap();
        assert!(err.to_string().contains("expected 150528 bytes"));
    }

    #[test]
    fn rejects_overflowing_dimensions() {
        let err = decode_image(ImageInput::Pixels {
            width: usize::MAX,
            height: 2,
            data: vec![],
        })
        .err().unwrap();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn rejects_empty_pixel_array() {
        let err = decode_image(ImageInput::Pixels {
            width: 0,
            height: 5,
            data: vec![],
        })
        .err().unwrap();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
    }

    #[test]
    fn round_trips_through_rgb_buffer() {
        let img = decode_image(ImageInput::Pixels {
            width: 2,
            height: 1,
            data: vec![1, 2, 3, 4, 5, 6],
        })
        .unwrap();
        let buf = to_rgb_buffer(&img).unwrap();
        assert_eq!(buf.get_pixel(1, 0).0, [4, 5, 6]);
    }
}
