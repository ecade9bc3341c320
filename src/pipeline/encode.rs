//! Image encoding: `RgbImage` → base64 PNG wrapped in `ImageData`, plus
//! orientation-aware decoding of uploads.
//!
//! PNG keeps thermal-print glyphs crisp; JPEG ringing around small digits
//! is enough to turn an `8` into a `B`. Phone photos are downscaled to a
//! longest edge of `max_pixels` first, since model tile budgets cap the useful
//! resolution anyway and a 12 MP PNG is a 20 MB request body.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{imageops::FilterType, DynamicImage, ImageDecoder, ImageReader, RgbImage};
use std::io::Cursor;
use tracing::debug;

/// Encode a receipt image as a base64 PNG ready for a vision model.
///
/// Images whose longest edge exceeds `max_pixels` are resized (aspect ratio
/// preserved). `detail: "high"` lets GPT-4-class models use the full tile
/// budget instead of a single 512 px overview.
pub fn encode_receipt(img: &RgbImage, max_pixels: u32) -> Result<ImageData, image::ImageError> {
    let dynamic = DynamicImage::ImageRgb8(img.clone());
    let longest = img.width().max(img.height());
    let dynamic = if longest > max_pixels {
        debug!(
            "Downscaling {}x{} to fit {}px",
            img.width(),
            img.height(),
            max_pixels
        );
        dynamic.resize(max_pixels, max_pixels, FilterType::Triangle)
    } else {
        dynamic
    };

    let mut buf = Vec::new();
    dynamic.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Encode an image as raw PNG bytes (crop-only output, mask uploads).
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Decode an uploaded photo and turn it upright per its EXIF orientation.
///
/// Phone cameras store portrait shots as landscape pixels plus an
/// orientation tag; mask services return masks for the upright scene.
pub fn decode_upright(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

#[cfg(test)]
/// JPEG with an APP1 segment carrying only an orientation tag.
pub(crate) fn jpeg_with_orientation(img: &RgbImage, orientation: u8) -> Vec<u8> {
    let mut jpeg = Vec::new();
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
        .unwrap();
    let mut app1 = vec![0xFF, 0xE1, 0x00, 0x22];
    app1.extend_from_slice(b"Exif\0\0");
    app1.extend_from_slice(b"MM\0\x2A\0\0\0\x08");
    app1.extend_from_slice(&[0x00, 0x01]);
    app1.extend_from_slice(&[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
    app1.extend_from_slice(&[0x00, orientation, 0x00, 0x00]);
    app1.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    assert_eq!(app1.len(), 2 + 0x22);
    let mut out = jpeg[..2].to_vec();
    out.extend_from_slice(&app1);
    out.extend_from_slice(&jpeg[2..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn encode_small_image() {
        let img = RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]));
        let data = encode_receipt(&img, 2000).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        let round = image::load_from_memory(&decoded).unwrap();
        assert_eq!((round.width(), round.height()), (10, 10));
    }

    #[test]
    fn large_images_are_downscaled_preserving_aspect() {
        let img = RgbImage::from_pixel(400, 800, Rgb([255, 255, 255]));
        let data = encode_receipt(&img, 200).unwrap();
        let decoded = STANDARD.decode(&data.data).unwrap();
        let round = image::load_from_memory(&decoded).unwrap();
        assert_eq!((round.width(), round.height()), (100, 200));
    }

    #[test]
    fn decode_upright_applies_exif_rotation() {
        let img = RgbImage::from_pixel(40, 20, Rgb([200, 200, 200]));
        let rotated = decode_upright(&jpeg_with_orientation(&img, 6)).unwrap();
        assert_eq!((rotated.width(), rotated.height()), (20, 40));

        let upright = decode_upright(&jpeg_with_orientation(&img, 1)).unwrap();
        assert_eq!((upright.width(), upright.height()), (40, 20));
    }

    #[test]
    fn decode_upright_reads_png_and_rejects_garbage() {
        let bytes = png_bytes(&DynamicImage::ImageLuma8(image::GrayImage::new(3, 7))).unwrap();
        let img = decode_upright(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (3, 7));
        assert!(decode_upright(b"not an image").is_err());
    }

    #[test]
    fn png_bytes_have_png_magic() {
        let img = DynamicImage::ImageLuma8(image::GrayImage::new(4, 4));
        let bytes = png_bytes(&img).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
    }
}
