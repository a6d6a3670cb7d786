// Checkpoint — Save and load the flat parameter buffer
//
// Binary parameter file (.dexe):
//
//   magic:   [u8; 4]  = b"DEXE"
//   version: u32 LE   = 1
//   dtype:   u8       (0=F32, 1=F64)
//   count:   u64 LE   = number of scalars
//   data:    [F LE; count]
//
// Only parameters are stored: no gradients, no activations, no graph. The
// file is loaded into a network built with the same add_* calls; the count
// is checked against the live network before anything is copied, so a
// failed load leaves the network exactly as it was.
//
// Usage:
//   checkpoint::save("model.dexe", &net)?;
//   checkpoint::load("model.dexe", &mut net)?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use dexe_core::{DType, Error, Result, Scalar};

use crate::network::Network;

const MAGIC: &[u8; 4] = b"DEXE";
const VERSION: u32 = 1;

// Low-level IO helpers

fn write_u8(w: &mut impl Write, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

// Write

/// Write a network's parameters to `writer`.
pub fn write_params<F: Scalar>(writer: &mut impl Write, network: &Network<F>) -> Result<()> {
    if !network.is_finished() {
        return Err(Error::NotFinished);
    }
    let params = network.param_vec();
    write_params_raw(writer, &params)
}

/// Write a bare parameter vector in the file format.
pub fn write_params_raw<F: Scalar>(writer: &mut impl Write, params: &[F]) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;
    write_u8(writer, F::DTYPE.tag())?;
    write_u64(writer, params.len() as u64)?;

    let mut data = Vec::with_capacity(params.len() * F::DTYPE.size_in_bytes());
    for &v in params {
        v.write_le(&mut data);
    }
    writer.write_all(&data)?;
    Ok(())
}

// Read

/// Read and validate a parameter vector of `expected` scalars.
///
/// Fails with `ParamCountMismatch` before reading the data if the stored
/// count differs.
pub fn read_params_raw<F: Scalar>(reader: &mut impl Read, expected: usize) -> Result<Vec<F>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Checkpoint(format!(
            "expected magic {:?}, got {:?}",
            MAGIC, magic
        )));
    }

    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::Checkpoint(format!(
            "unsupported version {version} (expected {VERSION})"
        )));
    }

    let tag = read_u8(reader)?;
    let dtype = DType::from_tag(tag)
        .ok_or_else(|| Error::Checkpoint(format!("unknown dtype tag {tag}")))?;
    if dtype != F::DTYPE {
        return Err(Error::Checkpoint(format!(
            "file holds {dtype} parameters, network is {}",
            F::DTYPE
        )));
    }

    let count = read_u64(reader)?;
    let got = usize::try_from(count)
        .map_err(|_| Error::Checkpoint(format!("parameter count {count} too large")))?;
    if got != expected {
        return Err(Error::ParamCountMismatch { expected, got });
    }

    let width = dtype.size_in_bytes();
    let mut bytes = vec![0u8; got * width];
    reader.read_exact(&mut bytes)?;
    Ok(bytes.chunks_exact(width).map(F::read_le).collect())
}

/// Read parameters from `reader` into `network`.
pub fn read_params<F: Scalar>(reader: &mut impl Read, network: &mut Network<F>) -> Result<()> {
    if !network.is_finished() {
        return Err(Error::NotFinished);
    }
    let params = read_params_raw::<F>(reader, network.n_params())?;
    network.set_param_vec(&params)
}

// High-level API

/// Save a network's parameters to a file.
pub fn save<F: Scalar>(path: impl AsRef<Path>, network: &Network<F>) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_params(&mut writer, network)?;
    writer.flush()?;
    tracing::debug!(path = %path.as_ref().display(), params = network.n_params(), "saved parameters");
    Ok(())
}

/// Load a network's parameters from a file.
pub fn load<F: Scalar>(path: impl AsRef<Path>, network: &mut Network<F>) -> Result<()> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_params(&mut reader, network)?;
    tracing::debug!(path = %path.as_ref().display(), params = network.n_params(), "loaded parameters");
    Ok(())
}

/// Serialize a network's parameters to bytes.
pub fn to_bytes<F: Scalar>(network: &Network<F>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_params(&mut buf, network)?;
    Ok(buf)
}

/// Load a network's parameters from bytes.
pub fn from_bytes<F: Scalar>(bytes: &[u8], network: &mut Network<F>) -> Result<()> {
    let mut cursor = std::io::Cursor::new(bytes);
    read_params(&mut cursor, network)
}
