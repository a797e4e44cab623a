//! File to file operations. Every input is read before any output is
//! created, so a load failure never leaves partial files behind.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use glam::{DVec3, IVec3};

use crate::cloud::{Aabb, Cloud, Rgba};
use crate::error::CloudError;
use crate::settings::MergeSettings;
use crate::stream::{
    cloud_header, cloud_info, load_cloud, load_cloud_with_trajectory, read_chunks, write_cloud,
    CloudWriter,
};
use crate::voxel::{voxel_subsample, LengthVoxels};

/// Most cells [`split_grid_file`] may write, each one a file.
pub const MAX_GRID_CELLS: usize = 1_000_000;

/// Ray counts written by [`find_transients_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransientCounts {
    pub transient: usize,
    pub fixed: usize,
}

pub fn find_transients_file(
    input: impl AsRef<Path>,
    transient_output: impl AsRef<Path>,
    fixed_output: impl AsRef<Path>,
    settings: &MergeSettings,
) -> Result<TransientCounts, CloudError> {
    settings.validate()?;
    let cloud = load_cloud(input)?;
    let split = settings
        .engine()
        .find_transients(&cloud, settings.colour_cloud);
    drop(cloud);
    Ok(TransientCounts {
        transient: write_cloud(transient_output, &split.transient, settings.chunk_size)?,
        fixed: write_cloud(fixed_output, &split.fixed, settings.chunk_size)?,
    })
}

pub fn three_way_merge_files(
    base: impl AsRef<Path>,
    first: impl AsRef<Path>,
    second: impl AsRef<Path>,
    output: impl AsRef<Path>,
    settings: &MergeSettings,
) -> Result<usize, CloudError> {
    settings.validate()?;
    let base = load_cloud(base)?;
    let mut first = load_cloud(first)?;
    let mut second = load_cloud(second)?;
    let merged = settings
        .engine()
        .three_way_merge(&base, &mut first, &mut second);
    write_cloud(output, &merged, settings.chunk_size)
}

/// Builds a ray cloud from end points and a sensor trajectory: each ray
/// starts where the sensor was at the ray's time. Returns the number of
/// rays written.
pub fn import_file(
    points: impl AsRef<Path>,
    trajectory: impl AsRef<Path>,
    output: impl AsRef<Path>,
    chunk_size: usize,
) -> Result<usize, CloudError> {
    let cloud = load_cloud_with_trajectory(points, trajectory)?;
    write_cloud(output, &cloud, chunk_size)
}

/// Ray counts written by [`combine_files`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CombineCounts {
    pub merged: usize,
    pub differences: usize,
}

pub fn combine_files<P: AsRef<Path>>(
    inputs: &[P],
    merged_output: impl AsRef<Path>,
    differences_output: impl AsRef<Path>,
    settings: &MergeSettings,
) -> Result<CombineCounts, CloudError> {
    settings.validate()?;
    let clouds = inputs
        .iter()
        .map(|path| load_cloud(path))
        .collect::<Result<Vec<Cloud>, _>>()?;
    let combined = settings.engine().combine(&clouds);
    drop(clouds);
    Ok(CombineCounts {
        merged: write_cloud(merged_output, &combined.merged, settings.chunk_size)?,
        differences: write_cloud(differences_output, &combined.differences, settings.chunk_size)?,
    })
}

/// How [`decimate_file`] thins a cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decimation {
    /// Keep the first ray ending in each voxel of this width, in metres.
    Spatial { voxel_width: f64 },
    /// Keep every nth ray.
    EveryNth { num_rays: usize },
    /// Keep end points roughly `spacing_per_length` metres apart per metre
    /// of ray length, preferring shorter rays. Reads the input twice.
    PerLength { spacing_per_length: f64 },
}

/// Streams `input` to `output`, dropping rays according to `decimation`.
/// Returns the number of rays written.
pub fn decimate_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    decimation: Decimation,
    chunk_size: usize,
) -> Result<usize, CloudError> {
    match decimation {
        Decimation::Spatial { voxel_width } if !(voxel_width.is_finite() && voxel_width > 0.0) => {
            return Err(CloudError::Settings(format!(
                "voxel width must be positive, got {voxel_width}"
            )));
        }
        Decimation::EveryNth { num_rays: 0 } => {
            return Err(CloudError::Settings("num_rays must be positive".to_string()));
        }
        Decimation::PerLength { spacing_per_length }
            if !(spacing_per_length.is_finite() && spacing_per_length > 0.0) =>
        {
            return Err(CloudError::Settings(format!(
                "spacing per length must be positive, got {spacing_per_length}"
            )));
        }
        _ => {}
    }
    let input = input.as_ref();
    // reads the input before creating the output
    let mut length_voxels = match decimation {
        Decimation::PerLength { spacing_per_length } => {
            let mut voxels = LengthVoxels::new(spacing_per_length);
            read_chunks(input, chunk_size, |chunk| {
                for idx in 0..chunk.len() {
                    voxels.observe(chunk.starts[idx], chunk.ends[idx]);
                }
                Ok(())
            })?;
            Some(voxels)
        }
        _ => {
            cloud_header(input)?;
            None
        }
    };

    let mut writer = CloudWriter::begin(output)?;
    let mut subsample = Vec::new();
    // spans every chunk, sized by the decimated cloud rather than the input
    let mut voxel_set = HashSet::new();
    let mut index = 0usize;
    read_chunks(input, chunk_size, |chunk| {
        match decimation {
            Decimation::Spatial { voxel_width } => {
                voxel_subsample(&chunk.ends, voxel_width, &mut subsample, &mut voxel_set);
            }
            Decimation::EveryNth { num_rays } => {
                subsample.clear();
                subsample.extend((0..chunk.len()).filter(|idx| (index + idx) % num_rays == 0));
                index += chunk.len();
            }
            Decimation::PerLength { .. } => {
                subsample.clear();
                if let Some(voxels) = length_voxels.as_mut() {
                    subsample.extend(
                        (0..chunk.len()).filter(|&idx| voxels.keep(chunk.starts[idx], chunk.ends[idx])),
                    );
                }
            }
        }
        chunk.retain_indices(&subsample);
        writer.write_chunk(chunk)
    })?;
    writer.end()
}

/// Ray counts written by [`split_plane_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitCounts {
    pub inside: usize,
    pub outside: usize,
}

/// Splits rays around the plane through `plane` perpendicular to it; the
/// side holding the origin is inside. Rays that cross the plane are cut in
/// two at the crossing and the part before it is made unbounded.
pub fn split_plane_file(
    input: impl AsRef<Path>,
    inside_output: impl AsRef<Path>,
    outside_output: impl AsRef<Path>,
    plane: DVec3,
    chunk_size: usize,
) -> Result<SplitCounts, CloudError> {
    let plane_sqr = plane.length_squared();
    if !(plane_sqr.is_finite() && plane_sqr > 0.0) {
        return Err(CloudError::Settings(format!(
            "split plane must be a non-zero point, got {plane}"
        )));
    }
    let input = input.as_ref();
    cloud_header(input)?;

    let plane_vec = plane / plane_sqr;
    let mut inside_writer = CloudWriter::begin(inside_output)?;
    let mut outside_writer = CloudWriter::begin(outside_output)?;
    let mut inside = Cloud::new();
    let mut outside = Cloud::new();
    read_chunks(input, chunk_size, |chunk| {
        inside.clear();
        outside.clear();
        for idx in 0..chunk.len() {
            let ray = chunk.ray(idx);
            let d1 = ray.start.dot(plane_vec) - 1.0;
            let d2 = ray.end.dot(plane_vec) - 1.0;
            if d1 * d2 > 0.0 || d1 == d2 {
                let side = if d1 > 0.0 { &mut outside } else { &mut inside };
                side.add_ray(ray.start, ray.end, ray.time, ray.colour);
                continue;
            }
            let mid = ray.start + (ray.end - ray.start) * (d1 / (d1 - d2));
            let (first, second) = if d1 > 0.0 {
                (&mut outside, &mut inside)
            } else {
                (&mut inside, &mut outside)
            };
            first.add_ray(ray.start, mid, ray.time, Rgba::unbounded());
            second.add_ray(mid, ray.end, ray.time, ray.colour);
        }
        inside_writer.write_chunk(&inside)?;
        outside_writer.write_chunk(&outside)
    })?;
    Ok(SplitCounts {
        inside: inside_writer.end()?,
        outside: outside_writer.end()?,
    })
}

/// Splits rays around the box `centre ± extents`. The part of a ray inside
/// the box goes to the inside cloud, unbounded if the ray ends outside it.
/// The parts before and after the box go to the outside cloud, the part
/// before it unbounded.
pub fn split_box_file(
    input: impl AsRef<Path>,
    inside_output: impl AsRef<Path>,
    outside_output: impl AsRef<Path>,
    centre: DVec3,
    extents: DVec3,
    chunk_size: usize,
) -> Result<SplitCounts, CloudError> {
    if !(centre.is_finite() && extents.is_finite() && extents.cmpge(DVec3::ZERO).all()) {
        return Err(CloudError::Settings(format!(
            "split box needs a finite centre and non-negative extents, got {centre} and {extents}"
        )));
    }
    let input = input.as_ref();
    cloud_header(input)?;

    let cuboid = Aabb {
        min: centre - extents,
        max: centre + extents,
    };
    let mut inside_writer = CloudWriter::begin(inside_output)?;
    let mut outside_writer = CloudWriter::begin(outside_output)?;
    let mut inside = Cloud::new();
    let mut outside = Cloud::new();
    read_chunks(input, chunk_size, |chunk| {
        inside.clear();
        outside.clear();
        for idx in 0..chunk.len() {
            let ray = chunk.ray(idx);
            let Some((start, end)) = cuboid.clip_segment(ray.start, ray.end) else {
                outside.add_ray(ray.start, ray.end, ray.time, ray.colour);
                continue;
            };
            let colour = if cuboid.contains(ray.end) {
                ray.colour
            } else {
                Rgba::unbounded()
            };
            inside.add_ray(start, end, ray.time, colour);
            if start != ray.start {
                outside.add_ray(ray.start, start, ray.time, Rgba::unbounded());
            }
            if end != ray.end {
                outside.add_ray(end, ray.end, ray.time, ray.colour);
            }
        }
        inside_writer.write_chunk(&inside)?;
        outside_writer.write_chunk(&outside)
    })?;
    Ok(SplitCounts {
        inside: inside_writer.end()?,
        outside: outside_writer.end()?,
    })
}

/// One output of [`split_grid_file`].
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub index: IVec3,
    pub path: PathBuf,
    pub rays: usize,
}

fn grid_cell_path(stub: &Path, index: IVec3) -> PathBuf {
    let mut name = stub.as_os_str().to_owned();
    name.push(format!("_{}_{}_{}.ply", index.x, index.y, index.z));
    PathBuf::from(name)
}

/// Splits `input` into one cloud per grid cell. Cell `i` spans
/// `(i ± 0.5) * cell_width`; each ray is clipped to every cell it crosses
/// and a clipped piece that ends outside its cell is unbounded. Cells that
/// receive rays are written to `<stub>_<x>_<y>_<z>.ply`. Returns the cells
/// written, ordered by index.
pub fn split_grid_file(
    input: impl AsRef<Path>,
    output_stub: impl AsRef<Path>,
    cell_width: DVec3,
    chunk_size: usize,
) -> Result<Vec<GridCell>, CloudError> {
    if !(cell_width.is_finite() && cell_width.cmpgt(DVec3::ZERO).all()) {
        return Err(CloudError::Settings(format!(
            "grid cell width must be positive, got {cell_width}"
        )));
    }
    let input = input.as_ref();
    let stub = output_stub.as_ref();
    let info = cloud_info(input)?;
    let Some(bounds) = info.ray_bounds else {
        return Ok(Vec::new());
    };
    let lowest = (bounds.min / cell_width + 0.5).floor();
    let highest = (bounds.max / cell_width + 0.5).ceil();
    let dims = highest - lowest;
    let num_cells = dims.x * dims.y * dims.z;
    if num_cells > MAX_GRID_CELLS as f64 {
        return Err(CloudError::Settings(format!(
            "grid of {num_cells} cells exceeds the limit of {MAX_GRID_CELLS}, use wider cells"
        )));
    }
    tracing::debug!("splitting into a grid of {dims} cells");

    let mut writers: HashMap<IVec3, CloudWriter> = HashMap::new();
    let mut chunks: HashMap<IVec3, Cloud> = HashMap::new();
    read_chunks(input, chunk_size, |chunk| {
        for idx in 0..chunk.len() {
            let ray = chunk.ray(idx);
            let from = ray.start / cell_width + 0.5;
            let to = ray.end / cell_width + 0.5;
            let lo = from.min(to).floor().as_ivec3();
            let hi = from.max(to).ceil().as_ivec3();
            for x in lo.x..hi.x {
                for y in lo.y..hi.y {
                    for z in lo.z..hi.z {
                        let index = IVec3::new(x, y, z);
                        let min = (index.as_dvec3() - 0.5) * cell_width;
                        let cell = Aabb {
                            min,
                            max: min + cell_width,
                        };
                        let Some((start, end)) = cell.clip_segment(ray.start, ray.end) else {
                            continue;
                        };
                        let colour = if cell.contains(ray.end) {
                            ray.colour
                        } else {
                            Rgba::unbounded()
                        };
                        chunks.entry(index).or_default().add_ray(start, end, ray.time, colour);
                    }
                }
            }
        }
        for (index, cell_chunk) in chunks.iter_mut().filter(|(_, c)| !c.is_empty()) {
            let writer = match writers.entry(*index) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(CloudWriter::begin(grid_cell_path(stub, *index))?),
            };
            writer.write_chunk(cell_chunk)?;
            cell_chunk.clear();
        }
        Ok(())
    })?;

    let mut writers: Vec<(IVec3, CloudWriter)> = writers.into_iter().collect();
    writers.sort_by_key(|(index, _)| index.to_array());
    let cells = writers
        .into_iter()
        .map(|(index, writer)| {
            Ok(GridCell {
                index,
                path: grid_cell_path(stub, index),
                rays: writer.end()?,
            })
        })
        .collect::<Result<Vec<_>, CloudError>>()?;
    tracing::info!("split into {} grid cells", cells.len());
    Ok(cells)
}
