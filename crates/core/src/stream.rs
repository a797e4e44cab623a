use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::cloud::{Aabb, Cloud};
use crate::error::CloudError;
use crate::ply::{PlyReader, PlyWriter};
use crate::trajectory::Trajectory;

/// Rays per chunk when the caller has no preference.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000_000;

fn open_reader(path: &Path) -> Result<PlyReader<BufReader<File>>, CloudError> {
    let file = File::open(path).map_err(|err| CloudError::load(path, err))?;
    PlyReader::new(BufReader::new(file)).map_err(|err| err.in_file(path))
}

/// Reads only the header of `path` and returns its ray count.
pub fn cloud_header(path: impl AsRef<Path>) -> Result<usize, CloudError> {
    Ok(open_reader(path.as_ref())?.vertex_count())
}

/// Streams the rays of `path` through `apply` in chunks of at most
/// `chunk_size` rays. One chunk buffer is reused for the whole file and the
/// callback may modify it freely. Returns the number of rays read.
pub fn read_chunks<F>(path: impl AsRef<Path>, chunk_size: usize, mut apply: F) -> Result<usize, CloudError>
where
    F: FnMut(&mut Cloud) -> Result<(), CloudError>,
{
    let path = path.as_ref();
    let mut reader = open_reader(path)?;
    let mut chunk = Cloud::with_capacity(chunk_size.min(reader.vertex_count()).max(1));
    let mut total = 0;
    loop {
        let read = reader
            .read_chunk(&mut chunk, chunk_size)
            .map_err(|err| err.in_file(path))?;
        if read == 0 {
            break;
        }
        total += read;
        apply(&mut chunk)?;
    }
    Ok(total)
}

pub fn load_cloud(path: impl AsRef<Path>) -> Result<Cloud, CloudError> {
    let path = path.as_ref();
    tracing::info!("loading {}", path.display());
    let mut cloud = Cloud::new();
    read_chunks(path, DEFAULT_CHUNK_SIZE, |chunk| {
        cloud.extend_from(chunk);
        Ok(())
    })?;
    tracing::debug!("loaded {} rays", cloud.len());
    Ok(cloud)
}

/// Loads end points and times from `path` and derives the ray starts from
/// the sensor trajectory.
pub fn load_cloud_with_trajectory(
    path: impl AsRef<Path>,
    trajectory_path: impl AsRef<Path>,
) -> Result<Cloud, CloudError> {
    let trajectory = Trajectory::load(trajectory_path.as_ref())?;
    let mut cloud = load_cloud(path)?;
    cloud
        .calculate_starts(&trajectory)
        .map_err(|err| err.in_file(trajectory_path.as_ref()))?;
    Ok(cloud)
}

/// Output stream of ray chunks. The header is finalized by [`end`], or on
/// drop if an error path skipped it.
///
/// [`end`]: CloudWriter::end
pub struct CloudWriter {
    path: PathBuf,
    writer: Option<PlyWriter<BufWriter<File>>>,
}

impl CloudWriter {
    pub fn begin(path: impl AsRef<Path>) -> Result<Self, CloudError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|err| CloudError::write(path, err))?;
        let writer = PlyWriter::new(BufWriter::new(file)).map_err(|err| CloudError::write(path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
        })
    }

    pub fn num_rays(&self) -> usize {
        self.writer.as_ref().map_or(0, PlyWriter::count)
    }

    pub fn write_chunk(&mut self, chunk: &Cloud) -> Result<(), CloudError> {
        chunk.validate()?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CloudError::write(&self.path, "writer already finished"))?;
        writer
            .write_cloud(chunk)
            .map_err(|err| CloudError::write(&self.path, err))
    }

    /// Finalizes the file and returns the number of rays written.
    pub fn end(mut self) -> Result<usize, CloudError> {
        let Some(writer) = self.writer.take() else {
            return Ok(0);
        };
        let count = writer.count();
        writer
            .finish()
            .map_err(|err| CloudError::write(&self.path, err))?;
        tracing::info!("wrote {count} rays to {}", self.path.display());
        Ok(count)
    }
}

impl Drop for CloudWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(err) = writer.finish() {
                tracing::warn!("failed to finalize {}: {err}", self.path.display());
            }
        }
    }
}

/// Writes `cloud` to `path` in chunks of `chunk_size` rays.
pub fn write_cloud(path: impl AsRef<Path>, cloud: &Cloud, chunk_size: usize) -> Result<usize, CloudError> {
    cloud.validate()?;
    let mut writer = CloudWriter::begin(path)?;
    let chunk_size = chunk_size.max(1);
    let mut chunk = Cloud::with_capacity(chunk_size.min(cloud.len()));
    let mut start = 0;
    while start < cloud.len() {
        let end = (start + chunk_size).min(cloud.len());
        chunk.clear();
        for idx in start..end {
            chunk.push_from(cloud, idx);
        }
        writer.write_chunk(&chunk)?;
        start = end;
    }
    writer.end()
}

pub fn save_cloud(path: impl AsRef<Path>, cloud: &Cloud) -> Result<usize, CloudError> {
    write_cloud(path, cloud, DEFAULT_CHUNK_SIZE)
}

/// Summary of a ray cloud file, gathered in one streaming pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloudInfo {
    pub num_rays: usize,
    pub num_bounded: usize,
    pub num_unbounded: usize,
    /// Over every ray start and end.
    pub ray_bounds: Option<Aabb>,
    /// Over bounded end points only.
    pub end_bounds: Option<Aabb>,
    pub time_range: Option<(f64, f64)>,
}

impl CloudInfo {
    fn add_chunk(&mut self, chunk: &Cloud) {
        self.num_rays += chunk.len();
        let bounded = chunk.num_bounded();
        self.num_bounded += bounded;
        self.num_unbounded += chunk.len() - bounded;
        if let Some(bounds) = chunk.bounds() {
            self.ray_bounds = Some(self.ray_bounds.map_or(bounds, |b| b.union(bounds)));
        }
        for idx in (0..chunk.len()).filter(|&idx| chunk.ray_bounded(idx)) {
            let point = Aabb::from_point(chunk.ends[idx]);
            self.end_bounds = Some(self.end_bounds.map_or(point, |b| b.union(point)));
        }
        if let Some((min, max)) = chunk.time_range() {
            self.time_range = Some(match self.time_range {
                Some((lo, hi)) => (lo.min(min), hi.max(max)),
                None => (min, max),
            });
        }
    }
}

/// Bounds and counts of a cloud file without holding it in memory.
pub fn cloud_info(path: impl AsRef<Path>) -> Result<CloudInfo, CloudError> {
    let mut info = CloudInfo::default();
    read_chunks(path, DEFAULT_CHUNK_SIZE, |chunk| {
        info.add_chunk(chunk);
        Ok(())
    })?;
    Ok(info)
}
