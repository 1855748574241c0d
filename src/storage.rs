//! Where assembled images end up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::config::PeripheralId;
use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to store image: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink for completed images. One call per peripheral per session.
pub trait Storage {
    fn save(
        &mut self,
        peripheral: PeripheralId,
        session: SessionId,
        image: &[u8],
    ) -> Result<PathBuf, StorageError>;
}

/// Writes images into a directory, one file per peripheral per session.
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Storage for DirStorage {
    fn save(
        &mut self,
        peripheral: PeripheralId,
        session: SessionId,
        image: &[u8],
    ) -> Result<PathBuf, StorageError> {
        std::fs::create_dir_all(&self.root)?;
        let path = self
            .root
            .join(format!("session_{session}_camera_{}.jpg", peripheral.0));
        std::fs::write(&path, image)?;
        info!(
            peripheral = peripheral.0,
            bytes = image.len(),
            path = %path.display(),
            "image stored"
        );
        Ok(path)
    }
}

/// Keeps images in memory, keyed by (peripheral, session). Test double.
#[derive(Default)]
pub struct MemoryStorage {
    images: HashMap<(u8, SessionId), Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peripheral: PeripheralId, session: SessionId) -> Option<&Vec<u8>> {
        self.images.get(&(peripheral.0, session))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn save(
        &mut self,
        peripheral: PeripheralId,
        session: SessionId,
        image: &[u8],
    ) -> Result<PathBuf, StorageError> {
        self.images.insert((peripheral.0, session), image.to_vec());
        Ok(PathBuf::from(format!(
            "mem://session_{session}_camera_{}",
            peripheral.0
        )))
    }
}
