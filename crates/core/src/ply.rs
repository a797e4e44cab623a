use std::io::{BufRead, Read, Seek, SeekFrom, Write};

use glam::DVec3;

use crate::cloud::{Cloud, Rgba};
use crate::error::CloudError;

/// Digits reserved for the vertex count so it can be patched in place.
const COUNT_WIDTH: usize = 10;
/// Bytes per vertex written by [`PlyWriter`].
const RECORD_SIZE: usize = 4 * 8 + 3 * 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlyFormat {
    Ascii,
    BinaryLittle,
    BinaryBig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlyScalarType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl PlyScalarType {
    fn size(self) -> usize {
        match self {
            PlyScalarType::Int8 | PlyScalarType::Uint8 => 1,
            PlyScalarType::Int16 | PlyScalarType::Uint16 => 2,
            PlyScalarType::Int32 | PlyScalarType::Uint32 | PlyScalarType::Float32 => 4,
            PlyScalarType::Float64 => 8,
        }
    }
}

#[derive(Debug)]
struct PlyProperty {
    name: String,
    data_type: PlyScalarType,
}

#[derive(Debug)]
struct PlyHeader {
    format: PlyFormat,
    vertex_count: usize,
    vertex_properties: Vec<PlyProperty>,
}

/// Where each ray field lives in a vertex record.
#[derive(Debug, Default)]
struct RayPropertyIndices {
    end: [Option<usize>; 3],
    normal: [Option<usize>; 3],
    time: Option<usize>,
    colour: [Option<usize>; 4],
}

impl RayPropertyIndices {
    fn from_properties(properties: &[PlyProperty]) -> Result<Self, CloudError> {
        let mut indices = RayPropertyIndices::default();
        for (idx, prop) in properties.iter().enumerate() {
            match prop.name.as_str() {
                "x" => indices.end[0] = Some(idx),
                "y" => indices.end[1] = Some(idx),
                "z" => indices.end[2] = Some(idx),
                "nx" => indices.normal[0] = Some(idx),
                "ny" => indices.normal[1] = Some(idx),
                "nz" => indices.normal[2] = Some(idx),
                "time" | "timestamp" => indices.time = Some(idx),
                "red" | "r" => indices.colour[0] = Some(idx),
                "green" | "g" => indices.colour[1] = Some(idx),
                "blue" | "b" => indices.colour[2] = Some(idx),
                "alpha" | "a" => indices.colour[3] = Some(idx),
                _ => {}
            }
        }
        if indices.end.iter().any(Option::is_none) {
            return Err(CloudError::Format(
                "PLY is missing position properties (x, y, z)".to_string(),
            ));
        }
        if indices.time.is_none() {
            return Err(CloudError::Format(
                "PLY is missing the per-point time property".to_string(),
            ));
        }
        Ok(indices)
    }

    fn push_ray(&self, cloud: &mut Cloud, values: &[f64]) {
        let vector = |fields: &[Option<usize>]| {
            DVec3::new(
                fields[0].map_or(0.0, |i| values[i]),
                fields[1].map_or(0.0, |i| values[i]),
                fields[2].map_or(0.0, |i| values[i]),
            )
        };
        let end = vector(&self.end);
        let start = end + vector(&self.normal);
        let time = self.time.map_or(0.0, |i| values[i]);
        let channel = |field: Option<usize>| field.map_or(255, |i| values[i].clamp(0.0, 255.0) as u8);
        let colour = Rgba::new(
            channel(self.colour[0]),
            channel(self.colour[1]),
            channel(self.colour[2]),
            channel(self.colour[3]),
        );
        cloud.add_ray(start, end, time, colour);
    }
}

/// Incremental reader for ray cloud PLY files. Vertices are decoded in
/// caller-sized chunks so a file never has to fit in memory.
pub struct PlyReader<R> {
    reader: R,
    header: PlyHeader,
    indices: RayPropertyIndices,
    remaining: usize,
    values: Vec<f64>,
    record: Vec<u8>,
    line: String,
}

impl<R: BufRead> PlyReader<R> {
    pub fn new(mut reader: R) -> Result<Self, CloudError> {
        let header = read_header(&mut reader)?;
        let indices = RayPropertyIndices::from_properties(&header.vertex_properties)?;
        let stride = header
            .vertex_properties
            .iter()
            .map(|prop| prop.data_type.size())
            .sum();
        Ok(Self {
            reader,
            remaining: header.vertex_count,
            values: vec![0.0; header.vertex_properties.len()],
            record: vec![0; stride],
            line: String::new(),
            header,
            indices,
        })
    }

    pub fn vertex_count(&self) -> usize {
        self.header.vertex_count
    }

    /// Clears `chunk` and fills it with up to `max_rays` rays. Returns the
    /// number read; zero once the file is exhausted.
    pub fn read_chunk(&mut self, chunk: &mut Cloud, max_rays: usize) -> Result<usize, CloudError> {
        chunk.clear();
        let count = self.remaining.min(max_rays.max(1));
        for _ in 0..count {
            match self.header.format {
                PlyFormat::Ascii => self.read_ascii_vertex()?,
                PlyFormat::BinaryLittle => self.read_binary_vertex(true)?,
                PlyFormat::BinaryBig => self.read_binary_vertex(false)?,
            }
            self.indices.push_ray(chunk, &self.values);
            self.remaining -= 1;
        }
        Ok(count)
    }

    fn read_ascii_vertex(&mut self) -> Result<(), CloudError> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .map_err(|err| CloudError::Format(err.to_string()))?;
            if read == 0 {
                return Err(CloudError::Format(
                    "Unexpected end of PLY vertex data".to_string(),
                ));
            }
            if !self.line.trim().is_empty() {
                break;
            }
        }
        let mut tokens = self.line.split_whitespace();
        for value in self.values.iter_mut() {
            let token = tokens.next().ok_or_else(|| {
                CloudError::Format("PLY vertex row has too few values".to_string())
            })?;
            *value = token
                .parse::<f64>()
                .map_err(|_| CloudError::Format(format!("Invalid PLY value '{token}'")))?;
        }
        Ok(())
    }

    fn read_binary_vertex(&mut self, little_endian: bool) -> Result<(), CloudError> {
        self.reader.read_exact(&mut self.record).map_err(|_| {
            CloudError::Format("Unexpected end of binary PLY data".to_string())
        })?;
        let mut cursor = 0usize;
        for (value, prop) in self.values.iter_mut().zip(&self.header.vertex_properties) {
            let end = cursor + prop.data_type.size();
            *value = read_scalar(&self.record[cursor..end], prop.data_type, little_endian);
            cursor = end;
        }
        Ok(())
    }
}

fn read_header<R: BufRead>(reader: &mut R) -> Result<PlyHeader, CloudError> {
    let mut lines = Vec::new();
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let read = reader
            .read_until(b'\n', &mut buffer)
            .map_err(|err| CloudError::Format(err.to_string()))?;
        if read == 0 {
            return Err(CloudError::Format(
                "PLY header is missing end_header".to_string(),
            ));
        }
        let line = std::str::from_utf8(&buffer)
            .map_err(|_| CloudError::Format("PLY header is not ASCII".to_string()))?
            .trim()
            .to_string();
        let done = line == "end_header";
        lines.push(line);
        if done {
            break;
        }
    }
    parse_header(lines.iter().map(String::as_str))
}

fn parse_header<'a, I>(mut lines: I) -> Result<PlyHeader, CloudError>
where
    I: Iterator<Item = &'a str>,
{
    let first = lines
        .next()
        .ok_or_else(|| CloudError::Format("PLY header is missing".to_string()))?;
    if first.trim() != "ply" {
        return Err(CloudError::Format("Not a PLY file".to_string()));
    }

    let mut format = None;
    let mut vertex_count = None;
    let mut vertex_properties = Vec::new();
    let mut in_vertex = false;

    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with("comment") || line.starts_with("obj_info") {
            continue;
        }
        if line == "end_header" {
            break;
        }

        let mut parts = line.split_whitespace();
        let Some(tag) = parts.next() else {
            continue;
        };
        match tag {
            "format" => {
                let fmt = parts.next().unwrap_or("");
                format = Some(match fmt {
                    "ascii" => PlyFormat::Ascii,
                    "binary_little_endian" => PlyFormat::BinaryLittle,
                    "binary_big_endian" => PlyFormat::BinaryBig,
                    _ => return Err(CloudError::Format(format!("Unknown PLY format '{fmt}'"))),
                });
            }
            "element" => {
                let name = parts.next().unwrap_or("");
                let count = parts
                    .next()
                    .ok_or_else(|| CloudError::Format("Malformed PLY element".to_string()))?
                    .parse::<usize>()
                    .map_err(|_| CloudError::Format("Malformed PLY element count".to_string()))?;
                in_vertex = name == "vertex";
                if in_vertex {
                    vertex_count = Some(count);
                } else if count > 0 {
                    return Err(CloudError::Format(format!(
                        "PLY element '{name}' is not supported in a ray cloud"
                    )));
                }
            }
            "property" if in_vertex => {
                let prop_type = parts.next().unwrap_or("");
                if prop_type == "list" {
                    return Err(CloudError::Format(
                        "PLY vertex list properties are not supported".to_string(),
                    ));
                }
                let data_type = parse_scalar_type(prop_type)?;
                let name = parts.next().unwrap_or("").to_string();
                if name.is_empty() {
                    return Err(CloudError::Format("PLY property missing name".to_string()));
                }
                vertex_properties.push(PlyProperty { name, data_type });
            }
            _ => {}
        }
    }

    let format = format.ok_or_else(|| CloudError::Format("PLY format not specified".to_string()))?;
    let vertex_count =
        vertex_count.ok_or_else(|| CloudError::Format("PLY has no vertex element".to_string()))?;
    Ok(PlyHeader {
        format,
        vertex_count,
        vertex_properties,
    })
}

fn parse_scalar_type(value: &str) -> Result<PlyScalarType, CloudError> {
    match value {
        "char" | "int8" => Ok(PlyScalarType::Int8),
        "uchar" | "uint8" => Ok(PlyScalarType::Uint8),
        "short" | "int16" => Ok(PlyScalarType::Int16),
        "ushort" | "uint16" => Ok(PlyScalarType::Uint16),
        "int" | "int32" => Ok(PlyScalarType::Int32),
        "uint" | "uint32" => Ok(PlyScalarType::Uint32),
        "float" | "float32" => Ok(PlyScalarType::Float32),
        "double" | "float64" => Ok(PlyScalarType::Float64),
        _ => Err(CloudError::Format(format!(
            "Unsupported PLY property type '{value}'"
        ))),
    }
}

/// Decodes one scalar; `data` is exactly `data_type.size()` bytes long.
fn read_scalar(data: &[u8], data_type: PlyScalarType, little_endian: bool) -> f64 {
    fn bytes<const N: usize>(data: &[u8], little_endian: bool) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&data[..N]);
        if !little_endian {
            bytes.reverse();
        }
        bytes
    }
    match data_type {
        PlyScalarType::Int8 => data[0] as i8 as f64,
        PlyScalarType::Uint8 => data[0] as f64,
        PlyScalarType::Int16 => i16::from_le_bytes(bytes(data, little_endian)) as f64,
        PlyScalarType::Uint16 => u16::from_le_bytes(bytes(data, little_endian)) as f64,
        PlyScalarType::Int32 => i32::from_le_bytes(bytes(data, little_endian)) as f64,
        PlyScalarType::Uint32 => u32::from_le_bytes(bytes(data, little_endian)) as f64,
        PlyScalarType::Float32 => f32::from_le_bytes(bytes(data, little_endian)) as f64,
        PlyScalarType::Float64 => f64::from_le_bytes(bytes(data, little_endian)),
    }
}

/// Binary little-endian ray cloud writer. The vertex count in the header is
/// a fixed-width placeholder until [`PlyWriter::finish`] patches it.
pub struct PlyWriter<W: Write + Seek> {
    writer: W,
    count_offset: u64,
    count: usize,
    record: Vec<u8>,
}

impl<W: Write + Seek> PlyWriter<W> {
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        let start = writer.stream_position()?;
        let preamble = "ply\nformat binary_little_endian 1.0\ncomment raymerge ray cloud\nelement vertex ";
        writer.write_all(preamble.as_bytes())?;
        writer.write_all(format!("{:0width$}\n", 0, width = COUNT_WIDTH).as_bytes())?;
        for line in [
            "property double x",
            "property double y",
            "property double z",
            "property double time",
            "property float nx",
            "property float ny",
            "property float nz",
            "property uchar red",
            "property uchar green",
            "property uchar blue",
            "property uchar alpha",
            "end_header",
        ] {
            writeln!(writer, "{line}")?;
        }
        Ok(Self {
            writer,
            count_offset: start + preamble.len() as u64,
            count: 0,
            record: Vec::with_capacity(RECORD_SIZE),
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn write_cloud(&mut self, cloud: &Cloud) -> std::io::Result<()> {
        for idx in 0..cloud.len() {
            let end = cloud.ends[idx];
            let normal = (cloud.starts[idx] - end).as_vec3();
            let colour = cloud.colours[idx];
            self.record.clear();
            for value in [end.x, end.y, end.z, cloud.times[idx]] {
                self.record.extend_from_slice(&value.to_le_bytes());
            }
            for value in [normal.x, normal.y, normal.z] {
                self.record.extend_from_slice(&value.to_le_bytes());
            }
            self.record
                .extend_from_slice(&[colour.red, colour.green, colour.blue, colour.alpha]);
            self.writer.write_all(&self.record)?;
        }
        self.count += cloud.len();
        Ok(())
    }

    /// Patches the vertex count, flushes and hands back the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        let count = format!("{:0width$}", self.count, width = COUNT_WIDTH);
        if count.len() != COUNT_WIDTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "too many rays for the PLY vertex count field",
            ));
        }
        let end = self.writer.stream_position()?;
        self.writer.seek(SeekFrom::Start(self.count_offset))?;
        self.writer.write_all(count.as_bytes())?;
        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use glam::DVec3;

    use crate::cloud::{Cloud, Rgba};

    use super::{PlyReader, PlyWriter};

    fn read_all(data: &[u8]) -> Cloud {
        let mut reader = PlyReader::new(Cursor::new(data)).unwrap();
        let mut cloud = Cloud::new();
        let mut chunk = Cloud::new();
        while reader.read_chunk(&mut chunk, 2).unwrap() > 0 {
            cloud.extend_from(&chunk);
        }
        cloud
    }

    #[test]
    fn parse_ascii_rays() {
        let data = "\
ply
format ascii 1.0
comment from a scanner
element vertex 3
property float x
property float y
property float z
property double time
property float nx
property float ny
property float nz
property uchar red
property uchar green
property uchar blue
property uchar alpha
end_header
1 2 3 0.5 -1 0 0 10 20 30 255
4 5 6 0.75 0 -1 0 40 50 60 0

7 8 9 1.0 0 0 -2 70 80 90 255
";
        let cloud = read_all(data.as_bytes());
        assert_eq!(cloud.len(), 3);
        assert_eq!(cloud.ends[0], DVec3::new(1.0, 2.0, 3.0));
        assert_eq!(cloud.starts[0], DVec3::new(0.0, 2.0, 3.0));
        assert_eq!(cloud.starts[2], DVec3::new(7.0, 8.0, 7.0));
        assert_eq!(cloud.times[1], 0.75);
        assert_eq!(cloud.colours[1], Rgba::new(40, 50, 60, 0));
        assert!(!cloud.ray_bounded(1));
    }

    #[test]
    fn parse_big_endian_without_colour_or_normals() {
        let header = "\
ply
format binary_big_endian 1.0
element vertex 1
property double x
property double y
property double z
property float time
end_header
";
        let mut data = Vec::from(header.as_bytes());
        for value in [1.5f64, -2.0, 3.25] {
            data.extend_from_slice(&value.to_be_bytes());
        }
        data.extend_from_slice(&4.0f32.to_be_bytes());
        let cloud = read_all(&data);
        assert_eq!(cloud.ends[0], DVec3::new(1.5, -2.0, 3.25));
        assert_eq!(cloud.starts[0], cloud.ends[0]);
        assert_eq!(cloud.times[0], 4.0);
        assert_eq!(cloud.colours[0], Rgba::grey(255));
    }

    #[test]
    fn rejects_missing_time_and_truncated_data() {
        let no_time = "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n";
        assert!(PlyReader::new(Cursor::new(no_time.as_bytes())).is_err());

        let truncated = "ply\nformat binary_little_endian 1.0\nelement vertex 2\nproperty double x\nproperty double y\nproperty double z\nproperty double time\nend_header\n";
        let mut reader = PlyReader::new(Cursor::new(truncated.as_bytes())).unwrap();
        assert!(reader.read_chunk(&mut Cloud::new(), 10).is_err());

        assert!(PlyReader::new(Cursor::new(b"solid mesh\n".as_slice())).is_err());
    }

    #[test]
    fn writer_patches_vertex_count() {
        let mut cloud = Cloud::new();
        cloud.add_ray(DVec3::ZERO, DVec3::new(1.0, 2.0, 3.0), 10.5, Rgba::new(1, 2, 3, 255));
        cloud.add_ray(DVec3::ONE, DVec3::new(-1.0, 0.5, 2.0), 11.0, Rgba::unbounded());

        let mut writer = PlyWriter::new(Cursor::new(Vec::new())).unwrap();
        writer.write_cloud(&cloud).unwrap();
        writer.write_cloud(&cloud).unwrap();
        assert_eq!(writer.count(), 4);
        let data = writer.finish().unwrap().into_inner();

        let text = String::from_utf8_lossy(&data);
        assert!(text.contains("element vertex 0000000004\n"));
        let loaded = read_all(&data);
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.ends[3], cloud.ends[1]);
        assert_eq!(loaded.starts[3], cloud.starts[1]);
        assert_eq!(loaded.times[2], 10.5);
        assert_eq!(loaded.colours[0], cloud.colours[0]);
        assert_eq!(loaded.colours[3], Rgba::unbounded());
    }
}
