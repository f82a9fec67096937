//! Common types used throughout vmafbridge

use serde::{Deserialize, Serialize};

/// Color family of a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorFamily {
    Gray,
    Rgb,
    Yuv,
}

/// Sample type of a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    Integer,
    Float,
}

/// Per-clip video format (without dimensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    pub color_family: ColorFamily,
    pub sample_type: SampleType,
    pub bits_per_sample: u32,
    /// log2 horizontal chroma subsampling
    pub sub_sampling_w: u32,
    /// log2 vertical chroma subsampling
    pub sub_sampling_h: u32,
}

impl VideoFormat {
    pub const fn yuv(bits_per_sample: u32, sub_sampling_w: u32, sub_sampling_h: u32) -> Self {
        Self {
            color_family: ColorFamily::Yuv,
            sample_type: SampleType::Integer,
            bits_per_sample,
            sub_sampling_w,
            sub_sampling_h,
        }
    }

    // Common formats
    pub const YUV420P8: Self = Self::yuv(8, 1, 1);
    pub const YUV422P8: Self = Self::yuv(8, 1, 0);
    pub const YUV444P8: Self = Self::yuv(8, 0, 0);
    pub const YUV420P10: Self = Self::yuv(10, 1, 1);
    pub const YUV444P16: Self = Self::yuv(16, 0, 0);

    pub fn num_planes(&self) -> usize {
        match self.color_family {
            ColorFamily::Gray => 1,
            ColorFamily::Rgb | ColorFamily::Yuv => 3,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample.div_ceil(8) as usize
    }

    /// Dimensions of `plane` for a frame of `width` x `height`.
    /// Chroma rounds up, so odd sizes keep their last column and row.
    pub fn plane_dimensions(&self, plane: usize, width: u32, height: u32) -> (u32, u32) {
        if plane == 0 {
            (width, height)
        } else {
            (
                width.div_ceil(1 << self.sub_sampling_w),
                height.div_ceil(1 << self.sub_sampling_h),
            )
        }
    }
}

/// Clip description reported by a frame source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// `None` when the format varies between frames
    pub format: Option<VideoFormat>,
    /// 0 when the width varies between frames
    pub width: u32,
    /// 0 when the height varies between frames
    pub height: u32,
    pub num_frames: u32,
}

impl VideoInfo {
    pub fn new(format: VideoFormat, width: u32, height: u32, num_frames: u32) -> Self {
        Self {
            format: Some(format),
            width,
            height,
            num_frames,
        }
    }

    /// Constant, fully specified format and dimensions
    pub fn is_constant(&self) -> bool {
        self.format.is_some() && self.width > 0 && self.height > 0
    }

    /// Same format and dimensions (frame count is not compared)
    pub fn same_format(&self, other: &VideoInfo) -> bool {
        self.format == other.format && self.width == other.width && self.height == other.height
    }
}

impl std::fmt::Display for VideoInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.format {
            Some(fmt) => write!(
                f,
                "{}x{} {:?} {}-bit ss{}{} ({} frames)",
                self.width,
                self.height,
                fmt.color_family,
                fmt.bits_per_sample,
                fmt.sub_sampling_w,
                fmt.sub_sampling_h,
                self.num_frames
            ),
            None => write!(f, "variable format ({} frames)", self.num_frames),
        }
    }
}

/// Engine-native planar YUV layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuv420p,
    Yuv422p,
    Yuv444p,
}

impl PixelFormat {
    /// Map log2 subsampling to a native layout
    pub fn from_subsampling(sub_sampling_w: u32, sub_sampling_h: u32) -> Option<Self> {
        match (sub_sampling_w, sub_sampling_h) {
            (1, 1) => Some(PixelFormat::Yuv420p),
            (1, 0) => Some(PixelFormat::Yuv422p),
            (0, 0) => Some(PixelFormat::Yuv444p),
            _ => None,
        }
    }

    /// log2 chroma subsampling (horizontal, vertical)
    pub fn chroma_shift(&self) -> (u32, u32) {
        match self {
            PixelFormat::Yuv420p => (1, 1),
            PixelFormat::Yuv422p => (1, 0),
            PixelFormat::Yuv444p => (0, 0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv444p => "yuv444p",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One plane of a delivered frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Row stride in bytes
    pub stride: usize,
    /// Width in samples
    pub width: u32,
    /// Height in rows
    pub height: u32,
}

impl Plane {
    /// Allocate a zeroed plane with rows padded to `align` bytes
    pub fn new(width: u32, height: u32, bytes_per_sample: usize, align: usize) -> Self {
        let row = width as usize * bytes_per_sample;
        let stride = row.div_ceil(align.max(1)) * align.max(1);
        Self {
            data: vec![0u8; stride * height as usize],
            stride,
            width,
            height,
        }
    }

    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.stride]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.stride;
        &mut self.data[start..start + self.stride]
    }
}

/// A video frame delivered by a frame source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
}

impl Frame {
    /// Stride alignment used for frames allocated here
    pub const ALIGNMENT: usize = 32;

    /// Create a new zeroed frame
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Self {
        let planes = (0..format.num_planes())
            .map(|p| {
                let (w, h) = format.plane_dimensions(p, width, height);
                Plane::new(w, h, format.bytes_per_sample(), Self::ALIGNMENT)
            })
            .collect();
        Self {
            format,
            width,
            height,
            planes,
        }
    }

    /// Create a frame where every sample of plane `p` is `values[p]`
    pub fn filled(format: VideoFormat, width: u32, height: u32, values: [u16; 3]) -> Self {
        let mut frame = Self::new(format, width, height);
        let bps = format.bytes_per_sample();
        for (p, plane) in frame.planes.iter_mut().enumerate() {
            let value = values[p.min(2)];
            let row_bytes = plane.width as usize * bps;
            for y in 0..plane.height as usize {
                let row = &mut plane.row_mut(y)[..row_bytes];
                if bps == 1 {
                    row.fill(value as u8);
                } else {
                    for px in row.chunks_exact_mut(2) {
                        px.copy_from_slice(&value.to_le_bytes());
                    }
                }
            }
        }
        frame
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> &Plane {
        &self.planes[index]
    }

    pub fn stride(&self, index: usize) -> usize {
        self.planes[index].stride
    }

    /// Calculate frame size in bytes
    pub fn size_bytes(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}

/// Statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Frames requested from the filter
    pub frames_requested: u64,
    /// Frame pairs accepted by the engine
    pub frames_submitted: u64,
    /// Luma planes copied into native pictures (both sides)
    pub luma_planes_copied: u64,
    /// Chroma planes copied into native pictures (both sides)
    pub chroma_planes_copied: u64,
}
