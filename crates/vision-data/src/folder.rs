use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use rand::{rngs::StdRng, Rng};

use crate::{
    dataset::{Dataset, Sample},
    error::{DataError, Result},
};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif"];

/// Sorted names of the sub-directories of `root`.
pub fn discover_classes(root: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(root).map_err(|err| DataError::io(root, err))?;
    let mut classes = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| DataError::io(root, err))?;
        let file_type = entry
            .file_type()
            .map_err(|err| DataError::io(entry.path(), err))?;
        if file_type.is_dir() {
            classes.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    classes.sort();
    Ok(classes)
}

#[derive(Debug, Clone, Copy)]
pub struct ImageFolderOptions {
    /// Edge length every image is resized to.
    pub image_size: usize,
    pub bands: usize,
    /// Random quarter-turn rotation and horizontal flip.
    pub augment: bool,
}

impl Default for ImageFolderOptions {
    fn default() -> Self {
        Self {
            image_size: 299,
            bands: 3,
            augment: false,
        }
    }
}

/// Classification dataset laid out as `<root>/<class>/<image>`.
#[derive(Debug)]
pub struct ImageFolder {
    root: PathBuf,
    entries: Vec<(PathBuf, u32)>,
    options: ImageFolderOptions,
}

impl ImageFolder {
    /// Indexes every image under `root` for the given classes; label `i` is `classes[i]`.
    pub fn open(root: &Path, classes: &[String], options: ImageFolderOptions) -> Result<Self> {
        if options.image_size == 0 {
            return Err(DataError::Config("image_size must be greater than 0".into()));
        }
        if options.bands != 1 && options.bands != 3 {
            return Err(DataError::UnsupportedBands(options.bands));
        }

        let mut entries = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let class_dir = root.join(class);
            if !class_dir.is_dir() {
                return Err(DataError::MissingClassFolder(class_dir));
            }
            let mut files = Vec::new();
            for entry in fs::read_dir(&class_dir).map_err(|err| DataError::io(&class_dir, err))? {
                let path = entry.map_err(|err| DataError::io(&class_dir, err))?.path();
                if path.is_file() && has_image_extension(&path) {
                    files.push(path);
                }
            }
            files.sort();
            entries.extend(files.into_iter().map(|path| (path, label as u32)));
        }

        log::debug!(
            "indexed {} image(s) across {} class(es) under {}",
            entries.len(),
            classes.len(),
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            entries,
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load_image(&self, path: &Path, rng: &mut StdRng) -> Result<Tensor> {
        let mut image = image::open(path).map_err(|source| DataError::Image {
            path: path.to_path_buf(),
            source,
        })?;

        if self.options.augment {
            image = match rng.gen_range(0..4) {
                1 => image.rotate90(),
                2 => image.rotate180(),
                3 => image.rotate270(),
                _ => image,
            };
            if rng.gen_bool(0.5) {
                image = image.fliph();
            }
        }

        let size = self.options.image_size as u32;
        let image = image.resize_exact(size, size, FilterType::Triangle);
        image_to_tensor(&image, self.options.bands)
    }
}

impl Dataset for ImageFolder {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        let (path, label) = self.entries.get(index).ok_or_else(|| {
            DataError::Config(format!(
                "sample index {index} out of range for {} image(s)",
                self.entries.len()
            ))
        })?;
        let image = self.load_image(path, rng)?;
        Ok(Sample::Classification {
            image,
            label: *label,
        })
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Converts to a `(bands, height, width)` f32 tensor scaled to `[0, 1]`.
fn image_to_tensor(image: &DynamicImage, bands: usize) -> Result<Tensor> {
    let (width, height, raw) = match bands {
        1 => {
            let gray = image.to_luma8();
            (gray.width(), gray.height(), gray.into_raw())
        }
        3 => {
            let rgb = image.to_rgb8();
            (rgb.width(), rgb.height(), rgb.into_raw())
        }
        other => return Err(DataError::UnsupportedBands(other)),
    };
    let tensor = Tensor::from_vec(raw, (height as usize, width as usize, bands), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn write_image(path: &Path, width: u32, height: u32, value: u8) {
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([value, value / 2, 0]));
        image.save(path).unwrap();
    }

    #[test]
    fn discovers_sorted_class_folders() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zebra", "ant", "moth"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let classes = discover_classes(dir.path()).unwrap();
        assert_eq!(classes, vec!["ant", "moth", "zebra"]);
    }

    #[test]
    fn loads_resized_normalized_images() {
        let dir = tempfile::tempdir().unwrap();
        let classes = vec!["a".to_string(), "b".to_string()];
        for class in &classes {
            fs::create_dir_all(dir.path().join(class)).unwrap();
        }
        write_image(&dir.path().join("a/0.png"), 10, 6, 255);
        write_image(&dir.path().join("b/0.png"), 4, 4, 0);
        write_image(&dir.path().join("b/1.png"), 4, 4, 0);
        fs::write(dir.path().join("b/readme.md"), "skip").unwrap();

        let options = ImageFolderOptions {
            image_size: 8,
            bands: 3,
            augment: false,
        };
        let folder = ImageFolder::open(dir.path(), &classes, options).unwrap();
        assert_eq!(folder.len(), 3);

        let mut rng = StdRng::seed_from_u64(0);
        match folder.get(0, &mut rng).unwrap() {
            Sample::Classification { image, label } => {
                assert_eq!(label, 0);
                assert_eq!(image.dims(), &[3, 8, 8]);
                let max = image.max_all().unwrap().to_scalar::<f32>().unwrap();
                assert!((max - 1.0).abs() < 1e-6);
            }
            other => panic!("unexpected sample {other:?}"),
        }
        match folder.get(2, &mut rng).unwrap() {
            Sample::Classification { label, .. } => assert_eq!(label, 1),
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[test]
    fn missing_class_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        let classes = vec!["a".to_string(), "b".to_string()];

        let err = ImageFolder::open(dir.path(), &classes, ImageFolderOptions::default())
            .unwrap_err();
        assert!(matches!(err, DataError::MissingClassFolder(_)));
    }
}
