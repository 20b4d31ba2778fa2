use std::path::{Path, PathBuf};

use candle_core::{safetensors, DType, Device, Tensor};
use rand::{rngs::StdRng, Rng};

use crate::{
    dataset::{Dataset, Sample},
    error::{DataError, Result},
};

/// Tensor holding imagery, `(samples, height, width, bands)`.
pub const IMAGE_KEY: &str = "sat_img";
/// Tensor holding per-pixel labels, `(samples, height, width)`.
pub const LABEL_KEY: &str = "map_img";

/// Segmentation samples stored in a single safetensors file.
#[derive(Debug)]
pub struct SegmentationArchive {
    path: PathBuf,
    sat_img: Tensor,
    map_img: Tensor,
    scale: f64,
    len: usize,
    augment: bool,
}

impl SegmentationArchive {
    /// Opens `path`, keeping the first `limit` samples when a count is requested.
    pub fn open(path: &Path, limit: Option<usize>, augment: bool) -> Result<Self> {
        let invalid = |reason: String| DataError::InvalidArchive {
            path: path.to_path_buf(),
            reason,
        };
        if !path.is_file() {
            let mut message = format!(
                "sample archive not found; expected a safetensors file holding '{IMAGE_KEY}' and '{LABEL_KEY}'"
            );
            let hdf5 = path.with_extension("hdf5");
            if hdf5.is_file() {
                message.push_str(&format!(
                    " ({} is HDF5 and must be converted to safetensors first)",
                    hdf5.display()
                ));
            }
            return Err(DataError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, message),
            ));
        }

        let mut tensors = safetensors::load(path, &Device::Cpu).map_err(|err| {
            invalid(format!(
                "not a safetensors archive ({err}); HDF5 sample files must be converted first"
            ))
        })?;
        let sat_img = tensors
            .remove(IMAGE_KEY)
            .ok_or_else(|| invalid(format!("missing '{IMAGE_KEY}' tensor")))?;
        let map_img = tensors
            .remove(LABEL_KEY)
            .ok_or_else(|| invalid(format!("missing '{LABEL_KEY}' tensor")))?;

        let (samples, height, width, _) = sat_img
            .dims4()
            .map_err(|_| invalid(format!("'{IMAGE_KEY}' must be rank 4, got {:?}", sat_img.dims())))?;
        let (label_samples, label_height, label_width) = map_img
            .dims3()
            .map_err(|_| invalid(format!("'{LABEL_KEY}' must be rank 3, got {:?}", map_img.dims())))?;
        if (samples, height, width) != (label_samples, label_height, label_width) {
            return Err(invalid(format!(
                "image tensor {:?} does not line up with label tensor {:?}",
                sat_img.dims(),
                map_img.dims()
            )));
        }

        let len = match limit {
            Some(requested) if requested > samples => {
                return Err(DataError::SampleCountExceeded {
                    path: path.to_path_buf(),
                    requested,
                    available: samples,
                })
            }
            Some(requested) => requested,
            None => samples,
        };

        let scale = if sat_img.dtype() == DType::U8 {
            1.0 / 255.0
        } else {
            1.0
        };

        Ok(Self {
            path: path.to_path_buf(),
            sat_img,
            map_img,
            scale,
            len,
            augment,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of samples stored in the file, regardless of the requested count.
    pub fn available(&self) -> usize {
        self.sat_img.dims()[0]
    }

    pub fn bands(&self) -> usize {
        self.sat_img.dims()[3]
    }
}

impl Dataset for SegmentationArchive {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        if index >= self.len {
            return Err(DataError::Config(format!(
                "sample index {index} out of range for {} sample(s)",
                self.len
            )));
        }
        let mut sat_img = self
            .sat_img
            .get(index)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(self.scale, 0.0)?;
        let mut map_img = self.map_img.get(index)?.to_dtype(DType::U32)?;

        if self.augment && rng.gen_bool(0.5) {
            sat_img = flip_last_dim(&sat_img)?;
            map_img = flip_last_dim(&map_img)?;
        }

        Ok(Sample::Segmentation {
            sat_img: sat_img.contiguous()?,
            map_img: map_img.contiguous()?,
        })
    }
}

fn flip_last_dim(tensor: &Tensor) -> Result<Tensor> {
    let width = tensor.dims().last().copied().unwrap_or(0);
    let reversed: Vec<u32> = (0..width as u32).rev().collect();
    let indices = Tensor::from_vec(reversed, width, tensor.device())?;
    Ok(tensor.index_select(&indices, tensor.rank() - 1)?)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::SeedableRng;

    use super::*;

    fn write_archive(path: &Path, samples: usize) {
        let pixels: Vec<u8> = (0..samples * 2 * 3 * 3).map(|v| (v % 256) as u8).collect();
        let sat = Tensor::from_vec(pixels, (samples, 2, 3, 3), &Device::Cpu).unwrap();
        let labels: Vec<u8> = (0..samples * 2 * 3).map(|v| (v % 3) as u8).collect();
        let map = Tensor::from_vec(labels, (samples, 2, 3), &Device::Cpu).unwrap();
        let tensors = HashMap::from([
            (IMAGE_KEY.to_string(), sat),
            (LABEL_KEY.to_string(), map),
        ]);
        safetensors::save(&tensors, path).unwrap();
    }

    #[test]
    fn honours_requested_sample_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trn_samples.safetensors");
        write_archive(&path, 5);

        let archive = SegmentationArchive::open(&path, Some(3), false).unwrap();
        assert_eq!(archive.len(), 3);
        assert_eq!(archive.available(), 5);

        let mut rng = StdRng::seed_from_u64(1);
        match archive.get(2, &mut rng).unwrap() {
            Sample::Segmentation { sat_img, map_img } => {
                assert_eq!(sat_img.dims(), &[3, 2, 3]);
                assert_eq!(map_img.dims(), &[2, 3]);
                assert_eq!(map_img.dtype(), DType::U32);
            }
            other => panic!("unexpected sample {other:?}"),
        }
        assert!(archive.get(3, &mut rng).is_err());
    }

    #[test]
    fn rejects_counts_beyond_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("val_samples.safetensors");
        write_archive(&path, 2);

        let err = SegmentationArchive::open(&path, Some(4), false).unwrap_err();
        assert!(matches!(
            err,
            DataError::SampleCountExceeded {
                requested: 4,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn missing_archive_points_at_hdf5_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trn_samples.safetensors");
        std::fs::write(dir.path().join("trn_samples.hdf5"), b"\x89HDF\r\n").unwrap();

        let message = SegmentationArchive::open(&path, None, false)
            .unwrap_err()
            .to_string();
        assert!(message.contains("safetensors"), "{message}");
        assert!(message.contains("trn_samples.hdf5"), "{message}");

        std::fs::write(&path, b"\x89HDF\r\n\x1a\n").unwrap();
        let err = SegmentationArchive::open(&path, None, false).unwrap_err();
        assert!(matches!(err, DataError::InvalidArchive { .. }), "{err}");
        assert!(err.to_string().contains("HDF5"));
    }

    #[test]
    fn flip_reverses_columns() {
        let tensor = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let flipped = flip_last_dim(&tensor).unwrap();
        assert_eq!(
            flipped.to_vec2::<u32>().unwrap(),
            vec![vec![3, 2, 1], vec![6, 5, 4]]
        );
    }
}
