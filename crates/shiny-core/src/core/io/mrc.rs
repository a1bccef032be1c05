//! Minimal MRC2014 reader and writer for particle stacks and volumes.
//!
//! Reading supports the common data modes 0 (int8), 1 (int16), 2 (float32) and
//! 6 (uint16) in little-endian files. Writing always produces mode 2.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use ndarray::{Array2, Array3};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

const HEADER_BYTES: u64 = 1024;

#[derive(Debug, Error)]
pub enum MrcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported MRC data mode {0}")]
    UnsupportedMode(i32),
    #[error("invalid MRC header: {0}")]
    InvalidHeader(String),
    #[error("slice {index} is out of range for a stack of {count}")]
    SliceOutOfRange { index: usize, count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrcHeader {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub mode: i32,
    pub extended_bytes: usize,
}

impl MrcHeader {
    /// Reads the fixed 1024-byte header. The reader is left at the end of the header.
    pub fn read_from(reader: &mut impl Read) -> Result<Self, MrcError> {
        let mut raw = [0u8; HEADER_BYTES as usize];
        reader.read_exact(&mut raw)?;
        let mut words = &raw[..];
        let nx = words.read_i32::<LE>()?;
        let ny = words.read_i32::<LE>()?;
        let nz = words.read_i32::<LE>()?;
        let mode = words.read_i32::<LE>()?;
        let mut nsymbt = &raw[92..96];
        let nsymbt = nsymbt.read_i32::<LE>()?;

        if nx <= 0 || ny <= 0 || nz <= 0 {
            return Err(MrcError::InvalidHeader(format!("dimensions {nx} x {ny} x {nz}")));
        }
        if nsymbt < 0 {
            return Err(MrcError::InvalidHeader(format!("negative extended header size {nsymbt}")));
        }
        let header = Self {
            nx: nx as usize,
            ny: ny as usize,
            nz: nz as usize,
            mode,
            extended_bytes: nsymbt as usize,
        };
        header.bytes_per_voxel()?;
        Ok(header)
    }

    fn bytes_per_voxel(&self) -> Result<usize, MrcError> {
        match self.mode {
            0 => Ok(1),
            1 | 6 => Ok(2),
            2 => Ok(4),
            other => Err(MrcError::UnsupportedMode(other)),
        }
    }

    fn data_offset(&self) -> u64 {
        HEADER_BYTES + self.extended_bytes as u64
    }

    pub fn slice_len(&self) -> usize {
        self.nx * self.ny
    }
}

fn read_values(reader: &mut impl Read, mode: i32, count: usize) -> Result<Vec<f64>, MrcError> {
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let v = match mode {
            0 => reader.read_i8()? as f64,
            1 => reader.read_i16::<LE>()? as f64,
            2 => reader.read_f32::<LE>()? as f64,
            6 => reader.read_u16::<LE>()? as f64,
            other => return Err(MrcError::UnsupportedMode(other)),
        };
        values.push(v);
    }
    Ok(values)
}

/// Reads section `index` of a stack as a `(ny, nx)` image.
pub fn read_slice_from<R: Read + Seek>(reader: &mut R, header: &MrcHeader, index: usize) -> Result<Array2<f64>, MrcError> {
    if index >= header.nz {
        return Err(MrcError::SliceOutOfRange { index, count: header.nz });
    }
    let slice_bytes = (header.slice_len() * header.bytes_per_voxel()?) as u64;
    reader.seek(SeekFrom::Start(header.data_offset() + index as u64 * slice_bytes))?;
    let values = read_values(reader, header.mode, header.slice_len())?;
    Array2::from_shape_vec((header.ny, header.nx), values).map_err(|e| MrcError::InvalidHeader(e.to_string()))
}

pub fn read_header(path: &Path) -> Result<MrcHeader, MrcError> {
    let mut reader = BufReader::new(File::open(path)?);
    MrcHeader::read_from(&mut reader)
}

pub fn read_slice(path: &Path, index: usize) -> Result<Array2<f64>, MrcError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = MrcHeader::read_from(&mut reader)?;
    read_slice_from(&mut reader, &header, index)
}

/// Reads a whole file as a `(nz, ny, nx)` volume.
pub fn read_volume(path: &Path) -> Result<Array3<f64>, MrcError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = MrcHeader::read_from(&mut reader)?;
    reader.seek(SeekFrom::Start(header.data_offset()))?;
    let values = read_values(&mut reader, header.mode, header.slice_len() * header.nz)?;
    Array3::from_shape_vec((header.nz, header.ny, header.nx), values).map_err(|e| MrcError::InvalidHeader(e.to_string()))
}

struct Stats {
    min: f32,
    max: f32,
    mean: f32,
    rms: f32,
}

fn stats<'a>(values: impl Iterator<Item = &'a f64>) -> Stats {
    let (mut min, mut max, mut sum, mut sum_sq, mut n) = (f64::INFINITY, f64::NEG_INFINITY, 0.0, 0.0, 0usize);
    for &v in values {
        min = min.min(v);
        max = max.max(v);
        sum += v;
        sum_sq += v * v;
        n += 1;
    }
    if n == 0 {
        return Stats { min: 0.0, max: 0.0, mean: 0.0, rms: 0.0 };
    }
    let mean = sum / n as f64;
    let rms = (sum_sq / n as f64 - mean * mean).max(0.0).sqrt();
    Stats {
        min: min as f32,
        max: max as f32,
        mean: mean as f32,
        rms: rms as f32,
    }
}

fn write_header(writer: &mut impl Write, dims: [usize; 3], angpix: f64, is_volume: bool, stats: &Stats) -> io::Result<()> {
    let [nx, ny, nz] = dims;
    // words 1-4: dimensions and mode
    for d in dims {
        writer.write_i32::<LE>(d as i32)?;
    }
    writer.write_i32::<LE>(2)?;
    // words 5-7: start indices
    writer.write_all(&[0u8; 12])?;
    // words 8-10: sampling; a stack is a series of 2-D sections
    writer.write_i32::<LE>(nx as i32)?;
    writer.write_i32::<LE>(ny as i32)?;
    writer.write_i32::<LE>(if is_volume { nz as i32 } else { 1 })?;
    // words 11-16: cell dimensions and angles
    writer.write_f32::<LE>((nx as f64 * angpix) as f32)?;
    writer.write_f32::<LE>((ny as f64 * angpix) as f32)?;
    writer.write_f32::<LE>(if is_volume { (nz as f64 * angpix) as f32 } else { angpix as f32 })?;
    for _ in 0..3 {
        writer.write_f32::<LE>(90.0)?;
    }
    // words 17-19: axis mapping
    for axis in 1..=3 {
        writer.write_i32::<LE>(axis)?;
    }
    // words 20-22: density statistics
    writer.write_f32::<LE>(stats.min)?;
    writer.write_f32::<LE>(stats.max)?;
    writer.write_f32::<LE>(stats.mean)?;
    // words 23-24: space group and extended header size
    writer.write_i32::<LE>(if is_volume { 1 } else { 0 })?;
    writer.write_i32::<LE>(0)?;
    // words 25-49: extra, with the format version in word 28
    writer.write_all(&[0u8; 12])?;
    writer.write_i32::<LE>(20140)?;
    writer.write_all(&[0u8; 4 * (49 - 28)])?;
    // words 50-52: origin
    writer.write_all(&[0u8; 12])?;
    // words 53-56: map id, machine stamp, rms, label count
    writer.write_all(b"MAP ")?;
    writer.write_all(&[0x44, 0x44, 0x00, 0x00])?;
    writer.write_f32::<LE>(stats.rms)?;
    writer.write_i32::<LE>(0)?;
    // words 57-256: labels
    writer.write_all(&[0u8; 800])?;
    Ok(())
}

/// Writes images of identical shape as a mode-2 stack.
pub fn write_stack_to(writer: &mut impl Write, images: &[Array2<f64>], angpix: f64) -> Result<(), MrcError> {
    let (ny, nx) = images.first().map_or((0, 0), |im| im.dim());
    if images.iter().any(|im| im.dim() != (ny, nx)) {
        return Err(MrcError::InvalidHeader("stack images differ in shape".to_string()));
    }
    let stats = stats(images.iter().flat_map(|im| im.iter()));
    write_header(writer, [nx, ny, images.len()], angpix, false, &stats)?;
    for image in images {
        for &v in image.iter() {
            writer.write_f32::<LE>(v as f32)?;
        }
    }
    Ok(())
}

pub fn write_stack(path: &Path, images: &[Array2<f64>], angpix: f64) -> Result<(), MrcError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_stack_to(&mut writer, images, angpix)?;
    writer.flush()?;
    Ok(())
}

pub fn write_volume(path: &Path, volume: &Array3<f64>, angpix: f64) -> Result<(), MrcError> {
    let (nz, ny, nx) = volume.dim();
    let mut writer = BufWriter::new(File::create(path)?);
    write_header(&mut writer, [nx, ny, nz], angpix, true, &stats(volume.iter()))?;
    for &v in volume.iter() {
        writer.write_f32::<LE>(v as f32)?;
    }
    writer.flush()?;
    Ok(())
}
