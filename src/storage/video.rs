use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{HermesError, Result};

use super::container::VideoIndexRow;

/// Append-only side-car file for one camera stream. Frames are written
/// back to back; the parallel index dataset in the container records
/// `(frame_no, reference_ts_ns, device_pts)` plus the byte range, so the
/// codec choice stays outside the core.
pub struct SidecarWriter {
    path: PathBuf,
    file: File,
    next_frame_no: u64,
    byte_offset: u64,
}

impl SidecarWriter {
    pub async fn create(dir: &Path, stream_id: &str, codec: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| HermesError::Runtime(format!("cannot create {}: {}", dir.display(), e)))?;
        let path = dir.join(format!("{}.{}", stream_id, codec));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| HermesError::Runtime(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            file,
            next_frame_no: 0,
            byte_offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one frame and returns its index row.
    pub async fn append(
        &mut self,
        frame: &[u8],
        reference_ts_ns: i64,
        device_pts_ns: Option<i64>,
    ) -> Result<VideoIndexRow> {
        self.file
            .write_all(frame)
            .await
            .map_err(|e| HermesError::Runtime(format!("video append: {}", e)))?;
        let row = VideoIndexRow {
            frame_no: self.next_frame_no,
            reference_ts_ns,
            device_pts_ns,
            byte_offset: self.byte_offset,
            byte_len: frame.len() as u64,
        };
        self.next_frame_no += 1;
        self.byte_offset += frame.len() as u64;
        Ok(row)
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| HermesError::Runtime(format!("video flush: {}", e)))
    }
}
