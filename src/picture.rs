//! Copying delivered frames into native pictures

use crate::engine::Picture;
use crate::error::{Error, Result};
use crate::types::{Frame, Plane};

/// Copy `height` rows of `row_bytes` bytes between buffers with independent strides
pub fn bitblt(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    row_bytes: usize,
    height: usize,
) {
    if height == 0 || row_bytes == 0 {
        return;
    }
    if src_stride == row_bytes && dst_stride == row_bytes {
        let len = row_bytes * height;
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    for (d, s) in dst
        .chunks_mut(dst_stride)
        .zip(src.chunks(src_stride))
        .take(height)
    {
        d[..row_bytes].copy_from_slice(&s[..row_bytes]);
    }
}

/// Copy one delivered plane into a native plane
pub fn copy_plane(dst: &mut Plane, src: &Plane, bytes_per_sample: usize) -> Result<()> {
    let row_bytes = src.width as usize * bytes_per_sample;
    if src.width > dst.width || src.height > dst.height || row_bytes > src.stride {
        return Err(Error::Allocation(format!(
            "picture plane {}x{} too small for frame plane {}x{}",
            dst.width, dst.height, src.width, src.height
        )));
    }
    bitblt(
        &mut dst.data,
        dst.stride,
        &src.data,
        src.stride,
        row_bytes,
        src.height as usize,
    );
    Ok(())
}

/// Fill `picture` from `frame`. Only luma is copied unless `chroma` is set.
/// Returns the number of planes copied.
pub fn fill_picture(picture: &mut Picture, frame: &Frame, chroma: bool) -> Result<usize> {
    let bps = frame.format.bytes_per_sample();
    let mut copied = 0;
    for (plane, src) in frame.planes.iter().enumerate() {
        if plane > 0 && !chroma {
            break;
        }
        if plane >= picture.planes.len() {
            break;
        }
        copy_plane(&mut picture.planes[plane], src, bps)?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PixelFormat, VideoFormat};

    #[test]
    fn test_bitblt_strided() {
        let src = [1u8, 2, 3, 0xff, 4, 5, 6, 0xff];
        let mut dst = [0u8; 10];
        bitblt(&mut dst, 5, &src, 4, 3, 2);
        assert_eq!(dst, [1, 2, 3, 0, 0, 4, 5, 6, 0, 0]);
    }

    #[test]
    fn test_bitblt_contiguous() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        bitblt(&mut dst, 2, &src, 2, 2, 2);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_fill_picture_luma_only() {
        let frame = Frame::filled(VideoFormat::YUV420P8, 16, 8, [50, 60, 70]);
        let mut pic = Picture::alloc(PixelFormat::Yuv420p, 8, 16, 8).unwrap();
        assert_eq!(fill_picture(&mut pic, &frame, false).unwrap(), 1);
        assert_eq!(pic.planes[0].row(7)[15], 50);
        assert!(pic.planes[1].data.iter().all(|&b| b == 0));
        assert!(pic.planes[2].data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_picture_with_chroma_16bit() {
        let frame = Frame::filled(VideoFormat::YUV444P16, 5, 3, [1, 2, 40000]);
        let mut pic = Picture::alloc(PixelFormat::Yuv444p, 16, 5, 3).unwrap();
        assert_eq!(fill_picture(&mut pic, &frame, true).unwrap(), 3);
        assert_eq!(&pic.planes[2].row(2)[8..10], &40000u16.to_le_bytes());
        assert_eq!(pic.packed_plane(1).len(), 5 * 3 * 2);
    }

    #[test]
    fn test_copy_plane_rejects_oversized_source() {
        let frame = Frame::new(VideoFormat::YUV444P8, 32, 32);
        let mut pic = Picture::alloc(PixelFormat::Yuv444p, 8, 16, 16).unwrap();
        assert!(fill_picture(&mut pic, &frame, false).is_err());
    }
}
