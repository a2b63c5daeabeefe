use ndarray::ArrayD;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding failure: {0}")]
    Encode(#[from] bincode::Error),
}

/// Persisted wavefunction container.
///
/// The three records are written and read as a unit; reading reconstructs a
/// wave function with the sampling re-derived from `extent / gpts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavefunctionFile {
    pub array: ArrayD<Complex64>,
    pub energy: f64,
    pub extent: [f64; 2],
}

impl WavefunctionFile {
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), PersistError> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, PersistError> {
        Ok(bincode::deserialize_from(reader)?)
    }

    pub fn write_path<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistError> {
        self.write_to(BufWriter::new(File::create(path)?))
    }

    pub fn read_path<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn roundtrips_through_a_file() {
        let file = WavefunctionFile {
            array: ArrayD::from_shape_fn(IxDyn(&[1, 4, 4]), |idx| {
                Complex64::new(idx[1] as f64, idx[2] as f64)
            }),
            energy: 80e3,
            extent: [6.4, 6.4],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waves.bin");
        file.write_path(&path).unwrap();
        let restored = WavefunctionFile::read_path(&path).unwrap();
        assert_eq!(restored, file);
    }
}
