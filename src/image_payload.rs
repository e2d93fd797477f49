//! Preparing image bytes for an OCR request.
//!
//! JPEGs are sent exactly as they are on disk. Most generative AI endpoints
//! refuse TIFF, so TIFF scans are decoded, flattened to RGB and re-encoded as
//! high-quality JPEG first. Multi-page TIFFs contribute their first page.

use std::io::Cursor;

use image::{ImageFormat, codecs::jpeg::JpegEncoder};

use crate::{
    async_utils::spawn_blocking_propagating_panics, cpu_limit::with_cpu_semaphore,
    data_url::data_url, prelude::*, walk::ImageFile,
};

/// JPEG quality used when converting TIFF scans.
const JPEG_QUALITY: u8 = 95;

/// MIME type for JPEG.
pub const JPEG_MIME_TYPE: &str = "image/jpeg";

/// MIME type for TIFF.
const TIFF_MIME_TYPE: &str = "image/tiff";

/// The image data we actually send to the model.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// The MIME type of `data`. Always [`JPEG_MIME_TYPE`] at the moment.
    pub mime_type: String,

    /// Encoded image bytes.
    pub data: Vec<u8>,
}

impl ImagePayload {
    /// Convert to a data URL.
    pub fn to_data_url(&self) -> String {
        data_url(&self.mime_type, &self.data)
    }
}

/// Read `image` from disk and turn it into an [`ImagePayload`].
///
/// We trust the file's magic bytes over its extension, so a JPEG that was
/// saved as `.tif` still works, and a PDF renamed to `.jpg` fails cleanly here
/// instead of at the API.
#[instrument(level = "debug", skip_all, fields(path = %image.path.display()))]
pub async fn load_image_payload(image: &ImageFile) -> Result<ImagePayload> {
    let data = tokio::fs::read(&image.path)
        .await
        .with_context(|| format!("Failed to read image {:?}", image.path))?;
    let mime_type = infer::get(&data).map(|kind| kind.mime_type());
    trace!(?mime_type, bytes = data.len(), "Sniffed image type");
    if mime_type == Some(JPEG_MIME_TYPE) && image.is_tiff()
        || mime_type == Some(TIFF_MIME_TYPE) && !image.is_tiff()
    {
        debug!(?mime_type, extension = %image.extension, "Extension does not match content");
    }
    match mime_type {
        Some(JPEG_MIME_TYPE) => Ok(ImagePayload {
            mime_type: JPEG_MIME_TYPE.to_owned(),
            data,
        }),
        Some(TIFF_MIME_TYPE) => {
            let path = image.path.clone();
            let data = with_cpu_semaphore(|| {
                spawn_blocking_propagating_panics(move || tiff_to_jpeg(&data))
            })
            .await
            .with_context(|| format!("Failed to convert TIFF {:?} to JPEG", path))?;
            Ok(ImagePayload {
                mime_type: JPEG_MIME_TYPE.to_owned(),
                data,
            })
        }
        other => Err(anyhow!(
            "Unsupported image content in {:?}: expected JPEG or TIFF, found {}",
            image.path,
            other.unwrap_or("unknown data"),
        )),
    }
}

/// Decode a TIFF and re-encode its first page as an RGB JPEG.
fn tiff_to_jpeg(data: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory_with_format(data, ImageFormat::Tiff)
        .context("Failed to decode TIFF")?;
    // CMYK, 16-bit and alpha scans all need flattening before JPEG.
    let rgb = decoded.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .context("Failed to encode JPEG")?;
    Ok(jpeg)
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    use super::*;

    /// Encode a small test image in `format`.
    pub(crate) fn encoded_test_image(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(16, 8, |x, _| Rgb([(x * 16) as u8, 40, 200]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        bytes
    }

    async fn load(dir: &Path, name: &str, bytes: &[u8]) -> Result<ImagePayload> {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        let image = ImageFile::from_path(path).unwrap();
        load_image_payload(&image).await
    }

    #[tokio::test]
    async fn jpeg_is_passed_through_unchanged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let jpeg = encoded_test_image(ImageFormat::Jpeg);
        let payload = load(dir.path(), "photo.jpg", &jpeg).await?;
        assert_eq!(payload.mime_type, "image/jpeg");
        assert_eq!(payload.data, jpeg);
        assert!(payload.to_data_url().starts_with("data:image/jpeg;base64,/9j/"));
        Ok(())
    }

    #[tokio::test]
    async fn tiff_is_converted_to_jpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tiff = encoded_test_image(ImageFormat::Tiff);
        let payload = load(dir.path(), "scan.tif", &tiff).await?;
        assert_eq!(payload.mime_type, "image/jpeg");
        assert_eq!(&payload.data[..3], &[0xFF, 0xD8, 0xFF]);

        let decoded = image::load_from_memory_with_format(&payload.data, ImageFormat::Jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
        Ok(())
    }

    #[tokio::test]
    async fn tiff_with_alpha_is_flattened() -> Result<()> {
        let img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 128]));
        let mut tiff = Vec::new();
        img.write_to(&mut Cursor::new(&mut tiff), ImageFormat::Tiff)?;

        let dir = tempfile::tempdir()?;
        let payload = load(dir.path(), "alpha.tiff", &tiff).await?;
        assert_eq!(payload.mime_type, "image/jpeg");
        Ok(())
    }

    #[tokio::test]
    async fn extension_mismatch_uses_real_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let jpeg = encoded_test_image(ImageFormat::Jpeg);
        let payload = load(dir.path(), "actually_jpeg.tif", &jpeg).await?;
        assert_eq!(payload.data, jpeg);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let png = encoded_test_image(ImageFormat::Png);
        let err = load(dir.path(), "really_png.jpg", &png).await.unwrap_err();
        assert!(err.to_string().contains("found image/png"), "{err}");

        let err = load(dir.path(), "garbage.tif", b"not an image")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown data"), "{err}");
    }

    #[tokio::test]
    async fn truncated_tiff_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut tiff = encoded_test_image(ImageFormat::Tiff);
        tiff.truncate(16);
        assert!(load(dir.path(), "broken.tif", &tiff).await.is_err());
    }
}
