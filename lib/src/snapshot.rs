//! Persisted style features.
//!
//! A snapshot file starts with a little endian `u32` magic whose high half
//! identifies the format and whose low half is the format version, followed
//! by a bincode encoded list of layers.

use crate::{
    extractor::FeatureMaps,
    utils::{persist, tensor_values},
    Error,
};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, BufReader, Read, Write},
    path::Path,
};

const SNAPSHOT_MAGIC: u32 = 0x5354_0001;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct LayerRecord {
    dims: [usize; 4],
    values: Vec<f32>,
}

/// The feature maps of a style image, extracted once and reused by any
/// number of stylization sessions
#[derive(Clone, Debug, PartialEq)]
pub struct StyleSnapshot {
    layers: Vec<LayerRecord>,
}

impl StyleSnapshot {
    /// Copies the values of a set of feature maps
    pub fn from_features<B: Backend>(features: &[Tensor<B, 4>]) -> Result<Self, Error> {
        if features.is_empty() {
            return Err(Error::InvalidSnapshot(
                "a snapshot must contain at least 1 layer".to_owned(),
            ));
        }

        let layers = features
            .iter()
            .map(|map| {
                Ok(LayerRecord {
                    dims: map.dims(),
                    values: tensor_values(map.clone())?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { layers })
    }

    /// Materializes the stored feature maps on `device`. The returned tensors
    /// are constants, they never track gradients.
    pub fn to_features<B: Backend>(&self, device: &B::Device) -> FeatureMaps<B> {
        self.layers
            .iter()
            .map(|layer| {
                Tensor::from_data(TensorData::new(layer.values.clone(), layer.dims), device)
            })
            .collect()
    }

    /// The number of layers in this snapshot
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The `[batch, channels, height, width]` dims of each layer, in order
    pub fn layer_dims(&self) -> impl Iterator<Item = [usize; 4]> + '_ {
        self.layers.iter().map(|layer| layer.dims)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&SNAPSHOT_MAGIC.to_le_bytes())?;
        bincode::serialize_into(w, &self.layers)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::InvalidSnapshot("file is too short".to_owned()),
            _ => Error::Io(err),
        })?;

        let magic = u32::from_le_bytes(magic);
        if magic >> 16 != SNAPSHOT_MAGIC >> 16 {
            return Err(Error::InvalidSnapshot("invalid magic".to_owned()));
        }

        let layers: Vec<LayerRecord> = match magic & 0x0000_ffff {
            0x1 => bincode::deserialize_from(r)?,
            version => {
                return Err(Error::InvalidSnapshot(format!(
                    "unsupported version {}",
                    version
                )))
            }
        };

        if layers.is_empty() {
            return Err(Error::InvalidSnapshot("snapshot has no layers".to_owned()));
        }

        for (i, layer) in layers.iter().enumerate() {
            let expected = layer
                .dims
                .iter()
                .try_fold(1usize, |acc, d| acc.checked_mul(*d))
                .filter(|count| *count > 0)
                .ok_or_else(|| {
                    Error::InvalidSnapshot(format!(
                        "layer {} has unusable dims {:?}",
                        i, layer.dims
                    ))
                })?;
            if expected != layer.values.len() {
                return Err(Error::InvalidSnapshot(format!(
                    "layer {} has dims {:?} but {} values",
                    i,
                    layer.dims,
                    layer.values.len()
                )));
            }
        }

        Ok(Self { layers })
    }

    /// Saves the snapshot to the specified path. If writing fails part way
    /// the file is removed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        persist(path.as_ref(), |w| self.write(w))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut reader = BufReader::new(fs::File::open(path)?);
        Self::read(&mut reader)
    }
}
