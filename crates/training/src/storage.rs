use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::TrainingError;

/// Object store keyed by `/`-separated object names.
pub trait RemoteStore: Send {
    /// Immediate "directories" below `prefix`, sorted, without the prefix.
    fn list_subfolders(&self, prefix: &str) -> Result<Vec<String>, TrainingError>;
    /// Every object key under `prefix`, sorted.
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, TrainingError>;
    fn download(&self, key: &str, destination: &Path) -> Result<(), TrainingError>;
    fn upload(&self, source: &Path, key: &str) -> Result<(), TrainingError>;
}

/// Joins key segments with `/`, ignoring empty segments and stray separators.
pub fn join_key<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Bucket backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<bucket_root>/<bucket_name>`.
    pub fn open(bucket_root: &Path, bucket_name: &str) -> Result<Self, TrainingError> {
        let root = bucket_root.join(bucket_name);
        if !root.is_dir() {
            return Err(TrainingError::initialization(format!(
                "bucket '{bucket_name}' not found under {}",
                bucket_root.display()
            )));
        }
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|segment| !segment.is_empty()) {
            path.push(segment);
        }
        path
    }
}

impl RemoteStore for LocalBucket {
    fn list_subfolders(&self, prefix: &str) -> Result<Vec<String>, TrainingError> {
        let dir = self.object_path(prefix);
        let entries = fs::read_dir(&dir).map_err(|err| {
            TrainingError::runtime(format!("failed to list bucket prefix '{prefix}': {err}"))
        })?;
        let mut folders = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                TrainingError::runtime(format!("failed to list bucket prefix '{prefix}': {err}"))
            })?;
            if entry.path().is_dir() {
                folders.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        folders.sort();
        Ok(folders)
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, TrainingError> {
        let base = join_key([prefix]);
        let mut keys = Vec::new();
        let mut pending = vec![self.object_path(prefix)];
        while let Some(dir) = pending.pop() {
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir).map_err(|err| {
                TrainingError::runtime(format!("failed to list {}: {err}", dir.display()))
            })? {
                let path = entry
                    .map_err(|err| {
                        TrainingError::runtime(format!("failed to list {}: {err}", dir.display()))
                    })?
                    .path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(&base) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn download(&self, key: &str, destination: &Path) -> Result<(), TrainingError> {
        let source = self.object_path(key);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, destination).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to download '{key}' to {}: {err}",
                destination.display()
            ))
        })?;
        Ok(())
    }

    fn upload(&self, source: &Path, key: &str) -> Result<(), TrainingError> {
        let destination = self.object_path(key);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &destination).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to upload {} to '{key}': {err}",
                source.display()
            ))
        })?;
        Ok(())
    }
}

/// Where a bucket run reads data from and writes artifacts to.
pub struct BucketSync {
    store: Box<dyn RemoteStore>,
    data_prefix: String,
    output_prefix: String,
    run_stamp: String,
}

impl BucketSync {
    pub fn new(
        store: Box<dyn RemoteStore>,
        data_prefix: &Path,
        output_prefix: &Path,
        run_stamp: impl Into<String>,
    ) -> Self {
        Self {
            store,
            data_prefix: join_key([&*data_prefix.to_string_lossy()]),
            output_prefix: join_key([&*output_prefix.to_string_lossy()]),
            run_stamp: run_stamp.into(),
        }
    }

    pub fn store(&self) -> &dyn RemoteStore {
        self.store.as_ref()
    }

    pub fn data_prefix(&self) -> &str {
        &self.data_prefix
    }

    pub fn output_key(&self, name: &str) -> String {
        join_key([self.output_prefix.as_str(), name])
    }

    /// Uploads `file` to `<output_prefix>/<name>`.
    pub fn upload_output(&self, file: &Path, name: &str) -> Result<(), TrainingError> {
        let key = self.output_key(name);
        log::info!("uploading {} to '{key}'", file.display());
        self.store.upload(file, &key)
    }

    /// Uploads each log under `<output_prefix>/Logs/<run stamp>_<file name>`.
    pub fn upload_logs(&self, files: &[PathBuf]) -> Result<(), TrainingError> {
        for file in files {
            let Some(name) = file.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let stamped = format!("{}_{}", self.run_stamp, name);
            let key = join_key([self.output_prefix.as_str(), "Logs", stamped.as_str()]);
            self.store.upload(file, &key)?;
        }
        Ok(())
    }
}
