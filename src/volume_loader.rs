use crate::enums::Endianness;
use crate::volume::Volume;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use ndarray::Array3;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("Missing MetaImage header field {0}")]
    MissingField(&'static str),

    #[error("Invalid MetaImage header field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("Unsupported element type {0}")]
    UnsupportedElementType(String),

    #[error("Expected {expected} bytes of voxel data, found {found}")]
    InconsistentSize { expected: usize, found: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the voxels of a loaded volume were stored on disk. The solver
/// reads the same file, so this is carried into the run configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub bit_depth: u8,
    pub endianness: Endianness,
    pub header_length: usize,
}

pub struct LoadedVolume {
    pub volume: Volume<u16>,
    pub info: VolumeInfo,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a MetaImage volume, either a single `.mha` file or an `.mhd`
    /// header next to its raw data file.
    ///
    /// # Errors
    ///
    /// Returns error if the header is incomplete, the element type is not an
    /// 8 or 16 bit integer or the payload has the wrong size
    pub fn load_metaimage(path: impl AsRef<Path>) -> Result<LoadedVolume, VolumeLoaderError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let (fields, header_length) = Self::parse_header(&bytes)?;

        let dimensions = Self::parse_triple::<usize>(&fields, "DimSize")?;
        let spacing = match fields.get("ElementSpacing") {
            Some(_) => Self::parse_triple::<f64>(&fields, "ElementSpacing")?,
            None => [1.0; 3],
        };
        let origin = ["Offset", "Origin", "Position"]
            .into_iter()
            .find(|key| fields.contains_key(*key))
            .map(|key| Self::parse_triple::<f64>(&fields, key))
            .transpose()?
            .unwrap_or([0.0; 3]);

        let element_type = fields
            .get("ElementType")
            .ok_or(VolumeLoaderError::MissingField("ElementType"))?;
        let bit_depth = match element_type.as_str() {
            "MET_UCHAR" | "MET_CHAR" => 8,
            "MET_USHORT" | "MET_SHORT" => 16,
            other => return Err(VolumeLoaderError::UnsupportedElementType(other.to_string())),
        };
        let endianness = match fields
            .get("BinaryDataByteOrderMSB")
            .or_else(|| fields.get("ElementByteOrderMSB"))
        {
            Some(value) if value.eq_ignore_ascii_case("true") => Endianness::Big,
            _ => Endianness::Little,
        };
        let compressed = fields
            .get("CompressedData")
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));

        let data_file = fields
            .get("ElementDataFile")
            .ok_or(VolumeLoaderError::MissingField("ElementDataFile"))?;
        let (payload, payload_offset) = if data_file == "LOCAL" {
            (bytes[header_length..].to_vec(), header_length)
        } else {
            let data_path = path
                .parent()
                .map_or_else(|| PathBuf::from(data_file), |dir| dir.join(data_file));
            (fs::read(data_path)?, 0)
        };
        let payload = if compressed {
            let mut decoded = Vec::new();
            ZlibDecoder::new(payload.as_slice()).read_to_end(&mut decoded)?;
            decoded
        } else {
            payload
        };

        let info = VolumeInfo {
            bit_depth,
            endianness,
            header_length: if compressed { 0 } else { payload_offset },
        };
        let data = Self::build_volume_array(&payload, dimensions, &info)?;
        Ok(LoadedVolume {
            volume: Volume::new(data, spacing, origin),
            info,
        })
    }

    /// Load a headerless (or fixed-length header) raw volume as consumed by
    /// the solver.
    pub fn load_raw(
        path: impl AsRef<Path>,
        dimensions: [usize; 3],
        info: VolumeInfo,
    ) -> Result<LoadedVolume, VolumeLoaderError> {
        let bytes = fs::read(path.as_ref())?;
        if bytes.len() < info.header_length {
            return Err(VolumeLoaderError::InconsistentSize {
                expected: info.header_length,
                found: bytes.len(),
            });
        }
        let data = Self::build_volume_array(&bytes[info.header_length..], dimensions, &info)?;
        Ok(LoadedVolume {
            volume: Volume::new(data, [1.0; 3], [0.0; 3]),
            info,
        })
    }

    /// Write an 8-bit mask as a single `.mha` file with a zlib-compressed payload.
    pub fn save_mask(mask: &Volume<u8>, path: impl AsRef<Path>) -> Result<(), VolumeLoaderError> {
        let raw: Vec<u8> = mask.data.iter().copied().collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;

        let geometry = mask.geometry();
        let [dx, dy, dz] = geometry.dimensions;
        let [sx, sy, sz] = geometry.spacing;
        let [ox, oy, oz] = geometry.origin;
        let header = format!(
            "ObjectType = Image\n\
             NDims = 3\n\
             BinaryData = True\n\
             BinaryDataByteOrderMSB = False\n\
             CompressedData = True\n\
             CompressedDataSize = {}\n\
             Offset = {ox} {oy} {oz}\n\
             ElementSpacing = {sx} {sy} {sz}\n\
             DimSize = {dx} {dy} {dz}\n\
             ElementType = MET_UCHAR\n\
             ElementDataFile = LOCAL\n",
            compressed.len()
        );

        let mut file = fs::File::create(path.as_ref())?;
        file.write_all(header.as_bytes())?;
        file.write_all(&compressed)?;
        Ok(())
    }

    /// Header lines up to and including `ElementDataFile`, which always comes last.
    fn parse_header(bytes: &[u8]) -> Result<(HashMap<String, String>, usize), VolumeLoaderError> {
        let mut fields = HashMap::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let end = bytes[offset..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |pos| offset + pos + 1);
            let line = String::from_utf8_lossy(&bytes[offset..end]);
            offset = end;
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_string();
                let done = key == "ElementDataFile";
                fields.insert(key, value.trim().to_string());
                if done {
                    return Ok((fields, offset));
                }
            }
        }
        Err(VolumeLoaderError::MissingField("ElementDataFile"))
    }

    fn parse_triple<T: std::str::FromStr + Copy + Default>(
        fields: &HashMap<String, String>,
        field: &'static str,
    ) -> Result<[T; 3], VolumeLoaderError> {
        let value = fields.get(field).ok_or(VolumeLoaderError::MissingField(field))?;
        let invalid = || VolumeLoaderError::InvalidField {
            field,
            value: value.clone(),
        };
        let parsed: Vec<T> = value
            .split_whitespace()
            .map(|token| token.parse::<T>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        match parsed.as_slice() {
            [a, b, c] => Ok([*a, *b, *c]),
            _ => Err(invalid()),
        }
    }

    fn build_volume_array(
        payload: &[u8],
        [width, height, depth]: [usize; 3],
        info: &VolumeInfo,
    ) -> Result<Array3<u16>, VolumeLoaderError> {
        let voxels = width * height * depth;
        let bytes_per_voxel = if info.bit_depth == 8 { 1 } else { 2 };
        let expected = voxels * bytes_per_voxel;
        if payload.len() < expected {
            return Err(VolumeLoaderError::InconsistentSize {
                expected,
                found: payload.len(),
            });
        }

        let values: Vec<u16> = match (bytes_per_voxel, info.endianness) {
            (1, _) => payload[..expected].iter().map(|&b| b as u16).collect(),
            (_, Endianness::Little) => payload[..expected]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
            (_, Endianness::Big) => payload[..expected]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        };

        Array3::from_shape_vec((depth, height, width), values).map_err(|_| {
            VolumeLoaderError::InconsistentSize {
                expected,
                found: payload.len(),
            }
        })
    }
}
