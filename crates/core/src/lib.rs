mod classify;
mod cloud;
mod ellipsoid;
mod error;
mod grid;
mod math;
mod merge;
mod neighbors;
mod parallel;
mod pipeline;
mod ply;
mod progress;
mod settings;
mod stream;
mod trajectory;
mod transient;
mod voxel;

pub use classify::{classify, candidate_rays, intersect, Classification, RayOutcome, PASS_DISTANCE};
pub use cloud::{Aabb, Cloud, Ray, Rgba};
pub use ellipsoid::{
    generate_ellipsoids, generate_ellipsoids_with_radius, Ellipsoid, DEFAULT_NEIGHBOUR_RADIUS,
    MIN_NEIGHBOURS, NEIGHBOUR_SEARCH_SIZE,
};
pub use error::CloudError;
pub use grid::RayGrid;
pub use merge::{
    combine, diagnostic_colour, find_transients, three_way_merge, Combined, MergeEngine,
    TransientSplit,
};
pub use pipeline::{
    combine_files, decimate_file, find_transients_file, import_file, split_box_file,
    split_grid_file, split_plane_file, three_way_merge_files, CombineCounts, Decimation, GridCell,
    SplitCounts, TransientCounts, MAX_GRID_CELLS,
};
pub use ply::{PlyReader, PlyWriter};
pub use progress::{
    report_progress, report_stage, set_progress_sink, MergeStage, ProgressEvent, ProgressGuard,
    ProgressSink,
};
pub use settings::MergeSettings;
pub use stream::{
    cloud_header, cloud_info, load_cloud, load_cloud_with_trajectory, read_chunks, save_cloud,
    write_cloud, CloudInfo, CloudWriter, DEFAULT_CHUNK_SIZE,
};
pub use trajectory::{Trajectory, TrajectoryNode};
pub use transient::{decide, DecisionParams, MergeType, OpacityAccumulator};
pub use voxel::{voxel_key, voxel_subsample, LengthVoxels, RayKey, RayLookup, RAY_MATCH_WIDTH};
