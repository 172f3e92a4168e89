//! Derived-artifact generation: decoding, format detection and thumbnails.
//!
//! Everything in here is synchronous and CPU-bound. The pipeline calls these
//! functions from `spawn_blocking` so the async workers stay free.

mod exif;

pub use self::exif::{ExifMap, ExifValue, read_exif};

use crate::record::{ImageMetadata, ThumbnailSize};
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use std::{io::Cursor, path::Path};
use thiserror::Error;

/// Result of decoding an upload.
#[derive(Debug)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Size of the encoded input in bytes.
    pub file_size: u64,
}

impl DecodedImage {
    pub fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            width: self.width,
            height: self.height,
            format: format_to_string(self.format),
            size_bytes: self.file_size,
        }
    }
}

/// Decodes raw bytes, detecting the format from the content.
///
/// # Errors
/// - `ArtifactError::UnknownFormat` if the content matches no known format.
/// - `ArtifactError::Decode` if the data is corrupt.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, ArtifactError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let format = reader.format().ok_or(ArtifactError::UnknownFormat)?;
    let image = reader.decode().map_err(ArtifactError::Decode)?;
    let (width, height) = image.dimensions();

    Ok(DecodedImage {
        image,
        format,
        width,
        height,
        file_size: bytes.len() as u64,
    })
}

/// Decodes raw bytes and converts the result to 8-bit RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<DynamicImage, ArtifactError> {
    let decoded = decode(bytes)?;
    Ok(DynamicImage::ImageRgb8(decoded.image.to_rgb8()))
}

/// Scales `image` proportionally so it fits inside `bound`.
///
/// Images already inside the box are returned unchanged; nothing is ever
/// enlarged.
pub fn fit_within(image: &DynamicImage, bound: (u32, u32)) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= bound.0 && height <= bound.1 {
        return image.clone();
    }
    image.thumbnail(bound.0, bound.1)
}

/// Renders the thumbnail for `size` and writes it to `dest` in `format`.
pub fn write_thumbnail(
    image: &DynamicImage,
    size: ThumbnailSize,
    format: ImageFormat,
    dest: &Path,
) -> Result<(), ArtifactError> {
    let thumbnail = fit_within(image, size.bound());

    // The JPEG encoder rejects alpha and 16-bit buffers.
    let thumbnail = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(thumbnail.to_rgb8()),
        _ => thumbnail,
    };

    thumbnail
        .save_with_format(dest, format)
        .map_err(ArtifactError::Encode)
}

/// Convert an ImageFormat to its lowercase name.
pub fn format_to_string(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "jpeg".to_string(),
        ImageFormat::Png => "png".to_string(),
        ImageFormat::WebP => "webp".to_string(),
        ImageFormat::Gif => "gif".to_string(),
        ImageFormat::Tiff => "tiff".to_string(),
        ImageFormat::Bmp => "bmp".to_string(),
        ImageFormat::Ico => "ico".to_string(),
        ImageFormat::Pnm => "pnm".to_string(),
        ImageFormat::Tga => "tga".to_string(),
        ImageFormat::Qoi => "qoi".to_string(),
        ImageFormat::Avif => "avif".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// Errors raised while decoding or encoding images.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("unrecognized image format")]
    UnknownFormat,

    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage, RgbaImage};
    use tempfile::TempDir;

    /// Encodes a gradient test image of the given size.
    pub(crate) fn encoded_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, format)
            .unwrap();
        buffer.into_inner()
    }

    /// Inserts an APP1 `Exif` segment carrying `tiff` right after the JPEG SOI marker.
    pub(crate) fn with_exif_segment(jpeg: &[u8], tiff: &[u8]) -> Vec<u8> {
        assert_eq!(&[0xff, 0xd8], &jpeg[..2]);

        let len = (2 + 6 + tiff.len()) as u16;
        let mut out = Vec::with_capacity(jpeg.len() + len as usize + 2);
        out.extend_from_slice(&jpeg[..2]);
        out.extend_from_slice(&[0xff, 0xe1]);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(b"Exif\0\0");
        out.extend_from_slice(tiff);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    fn ifd_entry(out: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: u32) {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }

    /// Little-endian TIFF block: IFD0 holds `Make=Canon` and `Orientation=6`,
    /// IFD1 (the thumbnail IFD) holds `Compression=6`.
    pub(crate) fn camera_tiff() -> Vec<u8> {
        const IFD0: u32 = 8;
        const MAKE: u32 = IFD0 + 2 + 2 * 12 + 4;
        const IFD1: u32 = MAKE + 6;

        let mut tiff = b"II\x2a\x00".to_vec();
        tiff.extend_from_slice(&IFD0.to_le_bytes());

        tiff.extend_from_slice(&2u16.to_le_bytes());
        ifd_entry(&mut tiff, 0x010f, 2, 6, MAKE);
        ifd_entry(&mut tiff, 0x0112, 3, 1, 6);
        tiff.extend_from_slice(&IFD1.to_le_bytes());
        tiff.extend_from_slice(b"Canon\0");

        tiff.extend_from_slice(&1u16.to_le_bytes());
        ifd_entry(&mut tiff, 0x0103, 3, 1, 6);
        tiff.extend_from_slice(&0u32.to_le_bytes());

        tiff
    }

    /// TIFF header whose IFD0 offset points far past the end of the block.
    pub(crate) fn truncated_tiff() -> Vec<u8> {
        let mut tiff = b"II\x2a\x00".to_vec();
        tiff.extend_from_slice(&0x00ff_0000u32.to_le_bytes());
        tiff
    }

    #[test]
    fn test_jpeg_with_exif_still_decodes() {
        let bytes = with_exif_segment(&encoded_image(24, 16, ImageFormat::Jpeg), &camera_tiff());
        let decoded = decode(&bytes).unwrap();
        assert_eq!((24, 16), (decoded.width, decoded.height));
        assert_eq!(ImageFormat::Jpeg, decoded.format);
    }

    #[test]
    fn test_format_to_string() {
        assert_eq!(format_to_string(ImageFormat::Jpeg), "jpeg");
        assert_eq!(format_to_string(ImageFormat::Png), "png");
        assert_eq!(format_to_string(ImageFormat::WebP), "webp");
    }

    #[test]
    fn test_decode_jpeg() {
        let bytes = encoded_image(800, 600, ImageFormat::Jpeg);
        let decoded = decode(&bytes).unwrap();

        assert_eq!(
            ImageMetadata {
                width: 800,
                height: 600,
                format: "jpeg".to_string(),
                size_bytes: bytes.len() as u64,
            },
            decoded.metadata()
        );
    }

    #[test]
    fn test_decode_detects_format_by_content() {
        let bytes = encoded_image(10, 10, ImageFormat::Png);
        assert_eq!(ImageFormat::Png, decode(&bytes).unwrap().format);
    }

    #[test]
    fn test_decode_garbage() {
        let bytes = [0x13u8, 0x37, 0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        assert!(matches!(decode(&bytes), Err(ArtifactError::UnknownFormat)));
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = encoded_image(64, 64, ImageFormat::Png);
        assert!(matches!(
            decode(&bytes[..bytes.len() / 2]),
            Err(ArtifactError::Decode(_))
        ));
    }

    #[test]
    fn test_fit_within_keeps_aspect_ratio() {
        let img = DynamicImage::new_rgb8(800, 600);

        let small = fit_within(&img, ThumbnailSize::Small.bound());
        assert_eq!((128, 96), small.dimensions());

        let medium = fit_within(&img, ThumbnailSize::Medium.bound());
        assert_eq!((512, 384), medium.dimensions());
    }

    #[test]
    fn test_fit_within_never_enlarges() {
        let img = DynamicImage::new_rgb8(50, 20);
        assert_eq!((50, 20), fit_within(&img, (128, 128)).dimensions());
    }

    #[test]
    fn test_write_thumbnail_jpeg_with_alpha() {
        let tmp_dir = TempDir::new().unwrap();
        let dest = tmp_dir.path().join("thumb.jpg");
        let img = DynamicImage::ImageRgba8(RgbaImage::new(300, 1000));

        write_thumbnail(&img, ThumbnailSize::Small, ImageFormat::Jpeg, &dest).unwrap();

        let written = image::open(&dest).unwrap();
        assert!(written.width() <= 128 && written.height() <= 128);
        assert_eq!(128, written.height());
    }

    #[test]
    fn test_write_thumbnail_into_missing_dir() {
        let tmp_dir = TempDir::new().unwrap();
        let dest = tmp_dir.path().join("missing/thumb.png");
        let img = DynamicImage::new_rgb8(10, 10);

        let result = write_thumbnail(&img, ThumbnailSize::Small, ImageFormat::Png, &dest);
        assert!(matches!(result, Err(ArtifactError::Encode(_))));
    }
}
