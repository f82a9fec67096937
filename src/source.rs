//! Frame sources
//!
//! The upstream runtime that hands out readable frames by index:
//! - `MemorySource`: frames held in memory
//! - `Y4mSource`: frames decoded from a YUV4MPEG2 file

use crate::error::{Error, Result};
use crate::types::{ColorFamily, Frame, SampleType, VideoFormat, VideoInfo};

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Trait for frame sources
#[async_trait::async_trait]
pub trait FrameSource: Send + Sync {
    /// Clip description
    fn info(&self) -> VideoInfo;

    /// Deliver frame `n`. May complete in any order relative to other requests.
    async fn get_frame(&self, n: u32) -> Result<Frame>;
}

#[async_trait::async_trait]
impl<S: FrameSource + ?Sized> FrameSource for Arc<S> {
    fn info(&self) -> VideoInfo {
        (**self).info()
    }

    async fn get_frame(&self, n: u32) -> Result<Frame> {
        (**self).get_frame(n).await
    }
}

/// Clip held in memory
#[derive(Debug, Clone)]
pub struct MemorySource {
    info: VideoInfo,
    frames: Arc<Vec<Frame>>,
}

impl MemorySource {
    /// Build a clip from frames; format and dimensions come from the first frame
    pub fn new(frames: Vec<Frame>) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| Error::Source("clip has no frames".into()))?;
        let mut info = VideoInfo::new(first.format, first.width, first.height, 0);
        if frames
            .iter()
            .any(|f| f.format != first.format || f.width != first.width || f.height != first.height)
        {
            info.format = None;
            info.width = 0;
            info.height = 0;
        }
        info.num_frames = frames.len() as u32;
        Ok(Self {
            info,
            frames: Arc::new(frames),
        })
    }

    /// Build a clip with explicit clip info
    pub fn with_info(info: VideoInfo, frames: Vec<Frame>) -> Self {
        Self {
            info,
            frames: Arc::new(frames),
        }
    }

    /// `count` identical frames
    pub fn repeat(frame: Frame, count: u32) -> Self {
        let info = VideoInfo::new(frame.format, frame.width, frame.height, count);
        Self {
            info,
            frames: Arc::new(vec![frame; count as usize]),
        }
    }
}

#[async_trait::async_trait]
impl FrameSource for MemorySource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    async fn get_frame(&self, n: u32) -> Result<Frame> {
        self.frames
            .get(n as usize)
            .cloned()
            .ok_or_else(|| Error::Source(format!("frame {} out of range", n)))
    }
}

/// Clip backed by a `.y4m` file
///
/// Opening indexes the frame positions; pixel data is read on demand, so
/// frames can be requested in any order without holding the clip in memory.
#[derive(Debug, Clone)]
pub struct Y4mSource {
    inner: Arc<Y4mIndex>,
}

#[derive(Debug)]
struct Y4mIndex {
    path: PathBuf,
    info: VideoInfo,
    format: VideoFormat,
    /// Packed bytes per plane
    plane_sizes: [usize; 3],
    /// File offset of each frame's pixel data
    offsets: Vec<u64>,
    file: Mutex<File>,
}

impl Y4mSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source_err = |what: String| Error::Source(format!("{}: {}", path.display(), what));

        // Stream header and the first frame give the layout
        let mut decoder = y4m::decode(BufReader::new(File::open(path)?))
            .map_err(|e| source_err(format!("{:?}", e)))?;
        let width = decoder.get_width() as u32;
        let height = decoder.get_height() as u32;
        let format = format_for(decoder.get_colorspace()).ok_or_else(|| {
            source_err(format!("unsupported colorspace {:?}", decoder.get_colorspace()))
        })?;
        let plane_sizes = match decoder.read_frame() {
            Ok(frame) => [
                frame.get_y_plane().len(),
                frame.get_u_plane().len(),
                frame.get_v_plane().len(),
            ],
            Err(y4m::Error::EOF) => [0; 3],
            Err(e) => return Err(source_err(format!("frame 0: {:?}", e))),
        };
        drop(decoder);

        let offsets = if plane_sizes == [0; 3] {
            Vec::new()
        } else {
            index_frames(path, plane_sizes.iter().sum::<usize>() as u64)?
        };
        tracing::debug!("Indexed {} frames in {}", offsets.len(), path.display());

        let info = VideoInfo::new(format, width, height, offsets.len() as u32);
        Ok(Self {
            inner: Arc::new(Y4mIndex {
                path: path.to_path_buf(),
                info,
                format,
                plane_sizes,
                offsets,
                file: Mutex::new(File::open(path)?),
            }),
        })
    }
}

/// Offsets of every frame's pixel data. Frame headers are `FRAME` lines
/// followed by exactly `frame_bytes` of planar data.
fn index_frames(path: &Path, frame_bytes: u64) -> Result<Vec<u64>> {
    let len = std::fs::metadata(path)?.len();
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();

    // Stream header
    let mut pos = reader.read_until(b'\n', &mut line)? as u64;
    let mut offsets = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if !line.starts_with(b"FRAME") {
            return Err(Error::Source(format!(
                "{}: frame {}: missing FRAME header",
                path.display(),
                offsets.len()
            )));
        }
        pos += n as u64;
        if pos + frame_bytes > len {
            return Err(Error::Source(format!(
                "{}: frame {}: truncated",
                path.display(),
                offsets.len()
            )));
        }
        offsets.push(pos);
        reader.seek_relative(frame_bytes as i64)?;
        pos += frame_bytes;
    }
    Ok(offsets)
}

impl Y4mIndex {
    fn read_frame(&self, n: u32) -> Result<Frame> {
        let offset = *self.offsets.get(n as usize).ok_or_else(|| {
            Error::Source(format!("frame {} out of range", n))
        })?;
        let mut data = vec![0u8; self.plane_sizes.iter().sum()];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut data).map_err(|e| {
                Error::Source(format!("{}: frame {}: {}", self.path.display(), n, e))
            })?;
        }

        let (y, rest) = data.split_at(self.plane_sizes[0]);
        let (u, v) = rest.split_at(self.plane_sizes[1]);
        Ok(frame_from_packed(
            self.format,
            self.info.width,
            self.info.height,
            [y, u, v],
        ))
    }
}

#[async_trait::async_trait]
impl FrameSource for Y4mSource {
    fn info(&self) -> VideoInfo {
        self.inner.info
    }

    async fn get_frame(&self, n: u32) -> Result<Frame> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.read_frame(n))
            .await
            .map_err(|e| Error::Source(format!("frame {} read task failed: {}", n, e)))?
    }
}

fn format_for(colorspace: y4m::Colorspace) -> Option<VideoFormat> {
    use y4m::Colorspace as C;
    let format = match colorspace {
        C::C420 | C::C420jpeg | C::C420paldv | C::C420mpeg2 => VideoFormat::yuv(8, 1, 1),
        C::C422 => VideoFormat::yuv(8, 1, 0),
        C::C444 => VideoFormat::yuv(8, 0, 0),
        C::C420p10 => VideoFormat::yuv(10, 1, 1),
        C::C422p10 => VideoFormat::yuv(10, 1, 0),
        C::C444p10 => VideoFormat::yuv(10, 0, 0),
        C::C420p12 => VideoFormat::yuv(12, 1, 1),
        C::C422p12 => VideoFormat::yuv(12, 1, 0),
        C::C444p12 => VideoFormat::yuv(12, 0, 0),
        C::Cmono => VideoFormat {
            color_family: ColorFamily::Gray,
            sample_type: SampleType::Integer,
            bits_per_sample: 8,
            sub_sampling_w: 0,
            sub_sampling_h: 0,
        },
        _ => return None,
    };
    Some(format)
}

/// Copy tightly packed planes into a strided frame
fn frame_from_packed(format: VideoFormat, width: u32, height: u32, packed: [&[u8]; 3]) -> Frame {
    let mut frame = Frame::new(format, width, height);
    let bps = format.bytes_per_sample();
    for (plane, src) in frame.planes.iter_mut().zip(packed) {
        let row_bytes = plane.width as usize * bps;
        for (y, src_row) in src.chunks_exact(row_bytes).take(plane.height as usize).enumerate() {
            plane.row_mut(y)[..row_bytes].copy_from_slice(src_row);
        }
    }
    frame
}
