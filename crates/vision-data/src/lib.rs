//! Vision dataset handling crate

pub mod archive;
pub mod dataset;
pub mod error;
pub mod folder;
pub mod loader;

pub use archive::{SegmentationArchive, IMAGE_KEY, LABEL_KEY};
pub use dataset::{Batch, Dataset, Sample, Split};
pub use error::DataError;
pub use folder::{discover_classes, ImageFolder, ImageFolderOptions};
pub use loader::{BatchLoader, EpochBatches};
