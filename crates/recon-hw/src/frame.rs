//! Raw V4L2 buffers to interleaved RGB: YUYV, RGB3 and MJPEG.

use recon_core::Frame;

/// Pixel formats the camera is negotiated into, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG; each buffer is a standalone JPEG image.
    Mjpeg,
    /// Packed 24-bit RGB.
    Rgb3,
}

impl PixelFormat {
    pub const PREFERRED: [PixelFormat; 3] = [PixelFormat::Yuyv, PixelFormat::Mjpeg, PixelFormat::Rgb3];

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Rgb3 => *b"RGB3",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        Self::PREFERRED.into_iter().find(|f| &f.fourcc() == code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg decode failed: {0}")]
    Decode(String),
}

/// Decode one captured buffer into an RGB frame.
pub fn decode(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
    sequence: u32,
) -> Result<Frame, FrameError> {
    let mut frame = match format {
        PixelFormat::Yuyv => Frame::new(yuyv_to_rgb(buf, width, height)?, width, height),
        PixelFormat::Rgb3 => {
            let expected = width as usize * height as usize * 3;
            check_len(buf, expected)?;
            Frame::new(buf[..expected].to_vec(), width, height)
        }
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory(buf)
                .map_err(|e| FrameError::Decode(e.to_string()))?
                .into_rgb8();
            Frame::from_rgb_image(image)
        }
    };
    frame.sequence = sequence;
    Ok(frame)
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    check_len(yuyv, expected)?;

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
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
    fn test_yuyv_gray_levels() {
        // Neutral chroma: black (Y=16) and white (Y=235).
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_red_dominant() {
        // Roughly pure red in BT.601: Y=81, U=90, V=240.
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        assert!(rgb[0] > 240, "r = {}", rgb[0]);
        assert!(rgb[1] < 15 && rgb[2] < 15, "{rgb:?}");
        assert_eq!(&rgb[..3], &rgb[3..]);
    }

    #[test]
    fn test_yuyv_4x2_length() {
        let yuyv = vec![128u8; 16];
        assert_eq!(yuyv_to_rgb(&yuyv, 4, 2).unwrap().len(), 4 * 2 * 3);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let result = yuyv_to_rgb(&[100, 128], 2, 1);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_rgb3_passthrough_trims_padding() {
        let mut buf: Vec<u8> = (0..12).collect();
        buf.extend_from_slice(&[0xAA; 8]); // driver padding
        let frame = decode(PixelFormat::Rgb3, &buf, 2, 2, 9).unwrap();
        assert_eq!(frame.data, (0..12).collect::<Vec<u8>>());
        assert_eq!(frame.sequence, 9);
    }

    #[test]
    fn test_mjpeg_decode() {
        let image = image::RgbImage::from_pixel(8, 4, image::Rgb([200, 40, 40]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let frame = decode(PixelFormat::Mjpeg, &jpeg, 8, 4, 1).unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        assert!(frame.data[0] > 150 && frame.data[1] < 100);
    }

    #[test]
    fn test_mjpeg_garbage_rejected() {
        let result = decode(PixelFormat::Mjpeg, &[0, 1, 2, 3], 2, 2, 0);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_fourcc_roundtrip() {
        for format in PixelFormat::PREFERRED {
            assert_eq!(PixelFormat::from_fourcc(&format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"GREY"), None);
    }
}
