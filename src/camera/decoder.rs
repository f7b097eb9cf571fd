//! Raw capture buffer to packed RGB

use super::config::FourCc;
use crate::error::{Result, SyncError};

/// Decode one raw V4L2 buffer into `height * width * 3` RGB bytes.
pub fn decode_frame(data: &[u8], format: FourCc, width: u32, height: u32) -> Result<Vec<u8>> {
    let expected = width as usize * height as usize * 3;
    let pixels = match &format.0 {
        b"MJPG" => {
            let mut decoder = zune_jpeg::JpegDecoder::new(data);
            let pixels = decoder.decode().map_err(|e| decode_error(format, e))?;
            // Grayscale JPEGs come back single channel
            if pixels.len() * 3 == expected {
                pixels.iter().flat_map(|&l| [l, l, l]).collect()
            } else {
                pixels
            }
        }
        b"YUYV" => yuyv_to_rgb(data, width, height)?,
        b"RGB3" => data.to_vec(),
        _ => return Err(decode_error(format, "unsupported capture format")),
    };

    if pixels.len() != expected {
        return Err(decode_error(
            format,
            format!("decoded {} bytes, expected {expected} for {width}x{height}", pixels.len()),
        ));
    }
    Ok(pixels)
}

fn decode_error(format: FourCc, reason: impl ToString) -> SyncError {
    SyncError::Decode {
        format: format.to_string(),
        reason: reason.to_string(),
    }
}

/// BT.601 limited range, two pixels per 4-byte macropixel (Y0 U Y1 V).
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    if data.len() < pixels * 2 {
        return Err(decode_error(
            FourCc::YUYV,
            format!("buffer of {} bytes is too short for {width}x{height}", data.len()),
        ));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_grey_levels() {
        // Black and white macropixels with neutral chroma
        let data = [16, 128, 16, 128, 235, 128, 235, 128];
        let rgb = yuyv_to_rgb(&data, 4, 1).unwrap();
        assert_eq!(&rgb[..6], &[0, 0, 0, 0, 0, 0]);
        assert_eq!(&rgb[6..], &[255, 255, 255, 255, 255, 255]);
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        assert!(yuyv_to_rgb(&[0; 6], 2, 2).is_err());
        assert!(decode_frame(&[0; 5], FourCc::YUYV, 2, 2).is_err());
        assert!(decode_frame(&[0; 4], FourCc(*b"NV12"), 1, 1).is_err());
    }

    #[test]
    fn test_mjpeg_decodes_to_rgb() {
        let mut jpeg = Vec::new();
        let pixels = vec![200u8; 8 * 8 * 3];
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode(&pixels, 8, 8, image::ExtendedColorType::Rgb8)
            .unwrap();

        let rgb = decode_frame(&jpeg, FourCc::MJPG, 8, 8).unwrap();
        assert_eq!(rgb.len(), 8 * 8 * 3);
        assert!(rgb.iter().all(|&p| p.abs_diff(200) < 8));
    }
}
