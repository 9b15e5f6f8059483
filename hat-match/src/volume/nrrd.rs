//! NRRD volume reader
//!
//! Supports attached-header files with `raw` encoding and the sample types
//! registered template images come in. NRRD lists axes fastest first
//! (`x y z`); everything here is flipped to `[z, y, x]` on the way in.

use super::{GridGeometry, PixelType};
use crate::error::{MatchError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use tracing::debug;

/// Decoded volume
#[derive(Debug, Clone)]
pub struct NrrdVolume {
    pub geometry: GridGeometry,
    pub pixel_type: PixelType,
    /// Samples in `[z, y, x]` order, x fastest
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Endian {
    Little,
    Big,
}

/// Read a NRRD file from disk
pub fn read_nrrd(path: &Path) -> Result<NrrdVolume> {
    let file = File::open(path)
        .map_err(|e| MatchError::Image(format!("Failed to open {}: {}", path.display(), e)))?;
    let volume = decode_nrrd(BufReader::new(file))
        .map_err(|e| MatchError::Image(format!("{}: {}", path.display(), e)))?;
    debug!(
        path = %path.display(),
        dims = ?volume.geometry.dims,
        spacing = ?volume.geometry.spacing,
        pixel_type = ?volume.pixel_type,
        "Loaded NRRD volume"
    );
    Ok(volume)
}

/// Decode a NRRD stream (header followed by raw samples)
pub fn decode_nrrd<R: BufRead>(mut reader: R) -> std::result::Result<NrrdVolume, String> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| format!("Failed to read header: {}", e))?;
    if !line.starts_with("NRRD000") {
        return Err("Not a NRRD file (missing magic)".to_string());
    }

    let mut fields: HashMap<String, String> = HashMap::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| format!("Failed to read header: {}", e))?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if n == 0 || trimmed.is_empty() {
            break;
        }
        if trimmed.starts_with('#') || trimmed.contains(":=") {
            // Comments and key/value pairs carry nothing we need
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(": ") {
            fields.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let field = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| format!("Missing required field '{}'", name))
    };

    if fields.contains_key("data file") || fields.contains_key("datafile") {
        return Err("Detached data files are not supported".to_string());
    }

    let dimension: usize = field("dimension")?
        .parse()
        .map_err(|_| "Invalid dimension".to_string())?;
    if dimension != 3 {
        return Err(format!("Expected a 3-D volume, got dimension {}", dimension));
    }

    let pixel_type = parse_type(field("type")?)?;

    let encoding = field("encoding")?.to_lowercase();
    if encoding != "raw" {
        return Err(format!("Unsupported encoding '{}'", encoding));
    }

    let endian = match fields.get("endian").map(|e| e.to_lowercase()) {
        Some(e) if e == "big" => Endian::Big,
        _ => Endian::Little,
    };

    let sizes_xyz = parse_numbers::<usize>(field("sizes")?, "sizes")?;
    if sizes_xyz.len() != 3 {
        return Err(format!("Expected 3 sizes, got {}", sizes_xyz.len()));
    }

    let spacing_xyz = parse_spacing(&fields)?;
    let origin_xyz = match fields.get("space origin") {
        Some(value) => {
            let v = parse_vector(value)?;
            if v.len() != 3 {
                return Err("space origin must have 3 components".to_string());
            }
            [v[0], v[1], v[2]]
        }
        None => [0.0; 3],
    };

    let geometry = GridGeometry::new(
        [sizes_xyz[2], sizes_xyz[1], sizes_xyz[0]],
        [spacing_xyz[2], spacing_xyz[1], spacing_xyz[0]],
    )
    .with_origin([origin_xyz[2], origin_xyz[1], origin_xyz[0]]);
    geometry.validate().map_err(|e| e.to_string())?;

    let sample_bytes = match pixel_type {
        PixelType::U8 => 1,
        PixelType::U16 | PixelType::I16 => 2,
        PixelType::F32 => 4,
    };
    let mut raw = vec![0u8; geometry.len() * sample_bytes];
    reader
        .read_exact(&mut raw)
        .map_err(|e| format!("Truncated sample data: {}", e))?;

    let data = decode_samples(&raw, pixel_type, endian);
    Ok(NrrdVolume {
        geometry,
        pixel_type,
        data,
    })
}

/// Write a raw little-endian NRRD file
pub fn write_nrrd(path: &Path, geometry: &GridGeometry, pixel_type: PixelType, data: &[f32]) -> Result<()> {
    geometry.validate()?;
    if data.len() != geometry.len() {
        return Err(MatchError::InvalidInput(format!(
            "expected {} samples, got {}",
            geometry.len(),
            data.len()
        )));
    }
    let type_name = match pixel_type {
        PixelType::U8 => "uint8",
        PixelType::U16 => "uint16",
        PixelType::I16 => "int16",
        PixelType::F32 => "float",
    };
    let [nz, ny, nx] = geometry.dims;
    let [sz, sy, sx] = geometry.spacing;
    let [oz, oy, ox] = geometry.origin;

    let mut out = Vec::with_capacity(256 + data.len() * 4);
    write!(
        out,
        "NRRD0004\ntype: {}\ndimension: 3\nspace: left-posterior-superior\nsizes: {} {} {}\n\
         space directions: ({:?},0,0) (0,{:?},0) (0,0,{:?})\nspace origin: ({:?},{:?},{:?})\n\
         endian: little\nencoding: raw\n\n",
        type_name, nx, ny, nz, sx, sy, sz, ox, oy, oz
    )?;
    for &v in data {
        match pixel_type {
            PixelType::U8 => out.push(v as u8),
            PixelType::U16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
            PixelType::I16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
            PixelType::F32 => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn parse_type(value: &str) -> std::result::Result<PixelType, String> {
    match value.to_lowercase().as_str() {
        "uchar" | "unsigned char" | "uint8" | "uint8_t" => Ok(PixelType::U8),
        "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => {
            Ok(PixelType::U16)
        }
        "short" | "short int" | "signed short" | "signed short int" | "int16" | "int16_t" => {
            Ok(PixelType::I16)
        }
        "float" => Ok(PixelType::F32),
        other => Err(format!("Unsupported sample type '{}'", other)),
    }
}

fn parse_numbers<T: std::str::FromStr>(value: &str, what: &str) -> std::result::Result<Vec<T>, String> {
    value
        .split_whitespace()
        .map(|s| s.parse::<T>().map_err(|_| format!("Invalid {} entry '{}'", what, s)))
        .collect()
}

/// `(a,b,c)`
fn parse_vector(value: &str) -> std::result::Result<Vec<f64>, String> {
    let inner = value
        .trim()
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| format!("Invalid vector '{}'", value))?;
    inner
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .map_err(|_| format!("Invalid vector component '{}'", s))
        })
        .collect()
}

/// Per-axis spacing in file order, from `spacings` or diagonal `space directions`
fn parse_spacing(fields: &HashMap<String, String>) -> std::result::Result<[f64; 3], String> {
    if let Some(value) = fields.get("space directions") {
        let vectors = value
            .split_inclusive(')')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(parse_vector)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if vectors.len() != 3 || vectors.iter().any(|v| v.len() != 3) {
            return Err("space directions must hold three 3-vectors".to_string());
        }
        let mut spacing = [0.0; 3];
        for (axis, v) in vectors.iter().enumerate() {
            let off_diagonal = (0..3).filter(|&i| i != axis).any(|i| v[i].abs() > 1e-9);
            if off_diagonal {
                return Err("Oblique space directions are not supported".to_string());
            }
            spacing[axis] = v[axis].abs();
        }
        return Ok(spacing);
    }
    if let Some(value) = fields.get("spacings") {
        let v = parse_numbers::<f64>(value, "spacings")?;
        if v.len() != 3 {
            return Err(format!("Expected 3 spacings, got {}", v.len()));
        }
        return Ok([v[0], v[1], v[2]]);
    }
    Ok([1.0; 3])
}

fn decode_samples(raw: &[u8], pixel_type: PixelType, endian: Endian) -> Vec<f32> {
    match pixel_type {
        PixelType::U8 => raw.iter().map(|&b| b as f32).collect(),
        PixelType::U16 => raw
            .chunks_exact(2)
            .map(|c| {
                let v = match endian {
                    Endian::Little => u16::from_le_bytes([c[0], c[1]]),
                    Endian::Big => u16::from_be_bytes([c[0], c[1]]),
                };
                v as f32
            })
            .collect(),
        PixelType::I16 => raw
            .chunks_exact(2)
            .map(|c| {
                let v = match endian {
                    Endian::Little => i16::from_le_bytes([c[0], c[1]]),
                    Endian::Big => i16::from_be_bytes([c[0], c[1]]),
                };
                v as f32
            })
            .collect(),
        PixelType::F32 => raw
            .chunks_exact(4)
            .map(|c| match endian {
                Endian::Little => f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                Endian::Big => f32::from_be_bytes([c[0], c[1], c[2], c[3]]),
            })
            .collect(),
    }
}
