use std::path::PathBuf;
use std::process;

use glam::DVec3;
use raymerge_core::{
    cloud_info, combine_files, decimate_file, find_transients_file, import_file, split_box_file,
    split_grid_file, split_plane_file, three_way_merge_files, Decimation, MergeSettings, MergeType,
};

const USAGE: &str = "\
usage: raymerge <command> [options]

commands:
  transients <cloud.ply> <transient.ply> <fixed.ply>
  merge <base.ply> <first.ply> <second.ply> <merged.ply>
  combine <merged.ply> <differences.ply> <cloud.ply> <cloud.ply> [<cloud.ply> ...]
  decimate <cloud.ply> <decimated.ply> (--voxel <metres> | --every <n> | --per-length <cm/m>)
  split <cloud.ply> <inside.ply> <outside.ply> --plane <x,y,z>
  split <cloud.ply> <inside.ply> <outside.ply> --box <x,y,z> --extents <x,y,z>
  split <cloud.ply> <stub> --grid <width | x,y,z>
  import <points.ply> <cloud.ply> --trajectory <trajectory.txt>
  info <cloud.ply>

options:
  --settings <path>      merge settings as JSON
  --merge-type <type>    oldest | newest | min | max | all
  --num-rays <n>         pass-throughs needed to call a surface transient
  --colour               colour the fixed cloud by surface statistics
  --chunk-size <n>       rays per streamed chunk
  --per-length <cm/m>    end point spacing per metre of ray length
  --trajectory <path>    sensor trajectory giving the ray starts
  -v, --verbose          debug logging
  -q, --quiet            warnings only";

#[derive(Debug, Default)]
struct CommandArgs {
    positional: Vec<String>,
    settings_path: Option<PathBuf>,
    merge_type: Option<MergeType>,
    num_rays: Option<f64>,
    colour: bool,
    chunk_size: Option<usize>,
    voxel: Option<f64>,
    every: Option<usize>,
    per_length: Option<f64>,
    plane: Option<DVec3>,
    box_centre: Option<DVec3>,
    extents: Option<DVec3>,
    grid: Option<DVec3>,
    trajectory: Option<PathBuf>,
}

impl CommandArgs {
    /// Settings file values overridden by command line values.
    fn settings(&self) -> Result<MergeSettings, String> {
        let mut settings = match &self.settings_path {
            Some(path) => MergeSettings::load(path).map_err(|err| err.to_string())?,
            None => MergeSettings::default(),
        };
        if let Some(merge_type) = self.merge_type {
            settings.merge_type = merge_type;
        }
        if let Some(num_rays) = self.num_rays {
            settings.num_rays = num_rays;
        }
        if self.colour {
            settings.colour_cloud = true;
        }
        if let Some(chunk_size) = self.chunk_size {
            settings.chunk_size = chunk_size;
        }
        settings.validate().map_err(|err| err.to_string())?;
        Ok(settings)
    }

    fn expect_positional(&self, command: &str, count: usize) -> Result<(), String> {
        if self.positional.len() != count {
            return Err(format!(
                "{command} takes {count} paths, got {}\n\n{USAGE}",
                self.positional.len()
            ));
        }
        Ok(())
    }
}

pub fn run(args: &[String]) -> Result<(), String> {
    let Some(command) = args.get(1) else {
        return Err(USAGE.to_string());
    };
    if command == "--help" || command == "-h" || command == "help" {
        println!("{USAGE}");
        return Ok(());
    }
    let parsed = parse_args(&args[2..])?;
    match command.as_str() {
        "transients" => run_transients(&parsed),
        "merge" => run_merge(&parsed),
        "combine" => run_combine(&parsed),
        "decimate" => run_decimate(&parsed),
        "split" => run_split(&parsed),
        "import" => run_import(&parsed),
        "info" => run_info(&parsed),
        other => Err(format!("unknown command {other}\n\n{USAGE}")),
    }
}

fn parse_args(args: &[String]) -> Result<CommandArgs, String> {
    let mut parsed = CommandArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--settings" => parsed.settings_path = Some(PathBuf::from(value("--settings")?)),
            "--merge-type" => {
                let text = value("--merge-type")?;
                parsed.merge_type = Some(text.parse().map_err(|err| format!("{err}"))?);
            }
            "--num-rays" => parsed.num_rays = Some(parse_number(value("--num-rays")?)?),
            "--colour" | "--color" => parsed.colour = true,
            "--chunk-size" => parsed.chunk_size = Some(parse_number(value("--chunk-size")?)?),
            "--voxel" => parsed.voxel = Some(parse_number(value("--voxel")?)?),
            "--every" => parsed.every = Some(parse_number(value("--every")?)?),
            "--per-length" => parsed.per_length = Some(parse_number(value("--per-length")?)?),
            "--plane" => parsed.plane = Some(parse_vector(value("--plane")?)?),
            "--box" => parsed.box_centre = Some(parse_vector(value("--box")?)?),
            "--extents" => parsed.extents = Some(parse_vector(value("--extents")?)?),
            "--grid" => parsed.grid = Some(parse_width(value("--grid")?)?),
            "--trajectory" => parsed.trajectory = Some(PathBuf::from(value("--trajectory")?)),
            "-v" | "--verbose" | "-q" | "--quiet" => {}
            "--help" | "-h" => {
                println!("{USAGE}");
                process::exit(0);
            }
            flag if flag.starts_with("--") => return Err(format!("unknown option {flag}")),
            path => parsed.positional.push(path.to_string()),
        }
    }
    Ok(parsed)
}

fn parse_number<T: std::str::FromStr>(text: &str) -> Result<T, String> {
    text.parse()
        .map_err(|_| format!("expected a number, got {text}"))
}

fn parse_vector(text: &str) -> Result<DVec3, String> {
    let values = text
        .split(',')
        .map(|part| parse_number::<f64>(part.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    match values.as_slice() {
        [x, y, z] => Ok(DVec3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got {text}")),
    }
}

/// A single width for all axes, or one per axis.
fn parse_width(text: &str) -> Result<DVec3, String> {
    if text.contains(',') {
        parse_vector(text)
    } else {
        parse_number(text).map(DVec3::splat)
    }
}

fn run_transients(args: &CommandArgs) -> Result<(), String> {
    args.expect_positional("transients", 3)?;
    let settings = args.settings()?;
    let [input, transient, fixed] = [0, 1, 2].map(|idx| &args.positional[idx]);
    let counts = find_transients_file(input, transient, fixed, &settings)
        .map_err(|err| err.to_string())?;
    tracing::info!(
        "{} transient rays, {} fixed rays",
        counts.transient,
        counts.fixed
    );
    Ok(())
}

fn run_merge(args: &CommandArgs) -> Result<(), String> {
    args.expect_positional("merge", 4)?;
    let settings = args.settings()?;
    let [base, first, second, output] = [0, 1, 2, 3].map(|idx| &args.positional[idx]);
    let written = three_way_merge_files(base, first, second, output, &settings)
        .map_err(|err| err.to_string())?;
    tracing::info!("merged cloud has {written} rays");
    Ok(())
}

fn run_combine(args: &CommandArgs) -> Result<(), String> {
    if args.positional.len() < 4 {
        return Err(format!("combine needs two outputs and at least two clouds\n\n{USAGE}"));
    }
    let settings = args.settings()?;
    let (outputs, inputs) = args.positional.split_at(2);
    let counts = combine_files(inputs, &outputs[0], &outputs[1], &settings)
        .map_err(|err| err.to_string())?;
    tracing::info!(
        "{} merged rays, {} differences",
        counts.merged,
        counts.differences
    );
    Ok(())
}

fn run_decimate(args: &CommandArgs) -> Result<(), String> {
    args.expect_positional("decimate", 2)?;
    let decimation = match (args.voxel, args.every, args.per_length) {
        (Some(voxel_width), None, None) => Decimation::Spatial { voxel_width },
        (None, Some(num_rays), None) => Decimation::EveryNth { num_rays },
        (None, None, Some(cm_per_metre)) => Decimation::PerLength {
            spacing_per_length: cm_per_metre * 0.01,
        },
        _ => {
            return Err("decimate takes exactly one of --voxel, --every or --per-length".to_string())
        }
    };
    let chunk_size = args.settings()?.chunk_size;
    let written = decimate_file(&args.positional[0], &args.positional[1], decimation, chunk_size)
        .map_err(|err| err.to_string())?;
    tracing::info!("decimated cloud has {written} rays");
    Ok(())
}

fn run_split(args: &CommandArgs) -> Result<(), String> {
    let chunk_size = args.settings()?.chunk_size;
    match (args.plane, args.box_centre, args.grid) {
        (Some(plane), None, None) => {
            args.expect_positional("split", 3)?;
            let [input, inside, outside] = [0, 1, 2].map(|idx| &args.positional[idx]);
            let counts = split_plane_file(input, inside, outside, plane, chunk_size)
                .map_err(|err| err.to_string())?;
            tracing::info!("{} rays inside, {} rays outside", counts.inside, counts.outside);
        }
        (None, Some(centre), None) => {
            args.expect_positional("split", 3)?;
            let extents = args
                .extents
                .ok_or_else(|| "split --box requires --extents x,y,z".to_string())?;
            let [input, inside, outside] = [0, 1, 2].map(|idx| &args.positional[idx]);
            let counts = split_box_file(input, inside, outside, centre, extents, chunk_size)
                .map_err(|err| err.to_string())?;
            tracing::info!("{} rays inside, {} rays outside", counts.inside, counts.outside);
        }
        (None, None, Some(cell_width)) => {
            args.expect_positional("split", 2)?;
            let cells = split_grid_file(&args.positional[0], &args.positional[1], cell_width, chunk_size)
                .map_err(|err| err.to_string())?;
            for cell in &cells {
                tracing::debug!("{} rays in {}", cell.rays, cell.path.display());
            }
            tracing::info!("wrote {} grid cells", cells.len());
        }
        _ => return Err("split takes exactly one of --plane, --box or --grid".to_string()),
    }
    Ok(())
}

fn run_import(args: &CommandArgs) -> Result<(), String> {
    args.expect_positional("import", 2)?;
    let trajectory = args
        .trajectory
        .as_ref()
        .ok_or_else(|| "import requires --trajectory <path>".to_string())?;
    let chunk_size = args.settings()?.chunk_size;
    let written = import_file(&args.positional[0], trajectory, &args.positional[1], chunk_size)
        .map_err(|err| err.to_string())?;
    tracing::info!("imported {written} rays");
    Ok(())
}

fn run_info(args: &CommandArgs) -> Result<(), String> {
    args.expect_positional("info", 1)?;
    let info = cloud_info(&args.positional[0]).map_err(|err| err.to_string())?;
    let json = serde_json::to_string_pretty(&info).map_err(|err| err.to_string())?;
    println!("{json}");
    Ok(())
}
