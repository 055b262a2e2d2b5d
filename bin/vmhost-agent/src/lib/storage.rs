// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-VM blob storage: volumes, user data, backups and snapshots.
//!
//! [`VolumeStore`] is the seam between the agent and whatever actually holds
//! VM data. [`DirectoryStore`] keeps each VM's blobs as plain files in a
//! directory named after the VM's address.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Blob {
    /// A volume by its position in the VM's volume list. Volume 0 is the
    /// root image.
    Volume(usize),
    UserData,
    /// The root image as it was before the last replace or patch.
    RootBackup,
    UserDataBackup,
    /// A temporary root image booted in place of the real one.
    DebugImage,
    Snapshot { index: usize, name: String },
}

impl Blob {
    fn file_name(&self) -> String {
        match self {
            Blob::Volume(i) => format!("volume-{i}"),
            Blob::UserData => "user-data".to_string(),
            Blob::RootBackup => "root.old".to_string(),
            Blob::UserDataBackup => "user-data.old".to_string(),
            Blob::DebugImage => "debug-root".to_string(),
            Blob::Snapshot { index, name } => {
                format!("volume-{index}.snapshot-{name}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("need {needed} bytes but only {free} are free")]
    InsufficientSpace { needed: u64, free: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreCapacity {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl StoreCapacity {
    /// Fails unless `needed` bytes can be written while leaving
    /// `minimum_free` untouched.
    pub fn check(
        &self,
        needed: u64,
        minimum_free: u64,
    ) -> Result<(), StorageError> {
        if self.free_bytes < needed.saturating_add(minimum_free) {
            return Err(StorageError::InsufficientSpace {
                needed: needed.saturating_add(minimum_free),
                free: self.free_bytes,
            });
        }
        Ok(())
    }
}

pub type BlobWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn capacity(&self) -> Result<StoreCapacity, StorageError>;

    /// Opens `blob` for writing, truncating any existing contents.
    async fn create(
        &self,
        vm: IpAddr,
        blob: &Blob,
    ) -> Result<BlobWriter, StorageError>;

    async fn open(
        &self,
        vm: IpAddr,
        blob: &Blob,
    ) -> Result<BlobReader, StorageError>;

    async fn size(&self, vm: IpAddr, blob: &Blob) -> Result<u64, StorageError>;

    async fn exists(&self, vm: IpAddr, blob: &Blob) -> bool {
        self.size(vm, blob).await.is_ok()
    }

    async fn set_size(
        &self,
        vm: IpAddr,
        blob: &Blob,
        size: u64,
    ) -> Result<(), StorageError>;

    /// Moves `from` over `to`, replacing it.
    async fn rename(
        &self,
        vm: IpAddr,
        from: &Blob,
        to: &Blob,
    ) -> Result<(), StorageError>;

    async fn copy(
        &self,
        vm: IpAddr,
        from: &Blob,
        to: &Blob,
    ) -> Result<(), StorageError>;

    /// Removes `blob`. Removing a missing blob succeeds.
    async fn remove(&self, vm: IpAddr, blob: &Blob) -> Result<(), StorageError>;

    /// Removes every blob belonging to `vm`.
    async fn remove_all(&self, vm: IpAddr) -> Result<(), StorageError>;

    /// Rearranges volumes (with their snapshots) so that new volume `i` is
    /// old volume `order[i]`.
    async fn reorder_volumes(
        &self,
        vm: IpAddr,
        order: &[usize],
    ) -> Result<(), StorageError>;

    /// Deletes a volume and its snapshots, shifting later volumes down.
    async fn delete_volume(
        &self,
        vm: IpAddr,
        index: usize,
    ) -> Result<(), StorageError>;

    /// Takes ownership of a file outside the store, returning its size.
    async fn adopt(
        &self,
        vm: IpAddr,
        blob: &Blob,
        path: &Path,
    ) -> Result<u64, StorageError>;

    /// Where `blob` lives, for handing to a local consumer.
    fn location(&self, vm: IpAddr, blob: &Blob) -> PathBuf;

    /// The directory holding every blob of `vm`.
    fn directory(&self, vm: IpAddr) -> PathBuf;

    async fn move_vm(
        &self,
        from: IpAddr,
        to: IpAddr,
    ) -> Result<(), StorageError>;
}

/// Splits "volume-3.snapshot-x" into (3, ".snapshot-x").
fn volume_index(name: &str) -> Option<(usize, &str)> {
    let rest = name.strip_prefix("volume-")?;
    let split = rest.find('.').unwrap_or(rest.len());
    let (num, suffix) = rest.split_at(split);
    Some((num.parse().ok()?, suffix))
}

fn not_found(e: io::Error, what: impl FnOnce() -> String) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(what())
    } else {
        StorageError::Io(e)
    }
}

pub struct DirectoryStore {
    root: PathBuf,
    total_bytes: u64,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>, total_bytes: u64) -> Self {
        Self { root: root.into(), total_bytes }
    }

    fn path(&self, vm: IpAddr, blob: &Blob) -> PathBuf {
        self.directory(vm).join(blob.file_name())
    }

    async fn volume_files(
        &self,
        vm: IpAddr,
    ) -> Result<Vec<(usize, String)>, StorageError> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.directory(vm)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(ent) = dir.next_entry().await? {
            let name = ent.file_name().to_string_lossy().into_owned();
            if let Some((idx, _)) = volume_index(&name) {
                out.push((idx, name));
            }
        }
        out.sort();
        Ok(out)
    }

    async fn used_bytes(&self) -> Result<u64, StorageError> {
        let mut used = 0;
        let mut vms = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(vm) = vms.next_entry().await? {
            if !vm.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(vm.path()).await?;
            while let Some(f) = files.next_entry().await? {
                used += f.metadata().await?.len();
            }
        }
        Ok(used)
    }
}

#[async_trait]
impl VolumeStore for DirectoryStore {
    async fn capacity(&self) -> Result<StoreCapacity, StorageError> {
        let used = self.used_bytes().await?;
        Ok(StoreCapacity {
            total_bytes: self.total_bytes,
            free_bytes: self.total_bytes.saturating_sub(used),
        })
    }

    async fn create(
        &self,
        vm: IpAddr,
        blob: &Blob,
    ) -> Result<BlobWriter, StorageError> {
        tokio::fs::create_dir_all(self.directory(vm)).await?;
        let f = tokio::fs::File::create(self.path(vm, blob)).await?;
        Ok(Box::new(f))
    }

    async fn open(
        &self,
        vm: IpAddr,
        blob: &Blob,
    ) -> Result<BlobReader, StorageError> {
        let f = tokio::fs::File::open(self.path(vm, blob))
            .await
            .map_err(|e| not_found(e, || blob.file_name()))?;
        Ok(Box::new(f))
    }

    async fn size(&self, vm: IpAddr, blob: &Blob) -> Result<u64, StorageError> {
        let md = tokio::fs::metadata(self.path(vm, blob))
            .await
            .map_err(|e| not_found(e, || blob.file_name()))?;
        Ok(md.len())
    }

    async fn set_size(
        &self,
        vm: IpAddr,
        blob: &Blob,
        size: u64,
    ) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.directory(vm)).await?;
        let f = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(vm, blob))
            .await?;
        f.set_len(size).await?;
        Ok(())
    }

    async fn rename(
        &self,
        vm: IpAddr,
        from: &Blob,
        to: &Blob,
    ) -> Result<(), StorageError> {
        tokio::fs::rename(self.path(vm, from), self.path(vm, to))
            .await
            .map_err(|e| not_found(e, || from.file_name()))
    }

    async fn copy(
        &self,
        vm: IpAddr,
        from: &Blob,
        to: &Blob,
    ) -> Result<(), StorageError> {
        tokio::fs::copy(self.path(vm, from), self.path(vm, to))
            .await
            .map_err(|e| not_found(e, || from.file_name()))?;
        Ok(())
    }

    async fn remove(
        &self,
        vm: IpAddr,
        blob: &Blob,
    ) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path(vm, blob)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn remove_all(&self, vm: IpAddr) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(self.directory(vm)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn reorder_volumes(
        &self,
        vm: IpAddr,
        order: &[usize],
    ) -> Result<(), StorageError> {
        let dir = self.directory(vm);
        let files = self.volume_files(vm).await?;
        let mut staged = Vec::new();
        for (new, old) in order.iter().enumerate() {
            for (idx, name) in files.iter().filter(|(i, _)| i == old) {
                let suffix = &name[format!("volume-{idx}").len()..];
                let tmp = format!(".reorder-{new}{suffix}");
                tokio::fs::rename(dir.join(name), dir.join(&tmp)).await?;
                staged.push((tmp, format!("volume-{new}{suffix}")));
            }
        }
        for (tmp, name) in staged {
            tokio::fs::rename(dir.join(tmp), dir.join(name)).await?;
        }
        Ok(())
    }

    async fn delete_volume(
        &self,
        vm: IpAddr,
        index: usize,
    ) -> Result<(), StorageError> {
        let dir = self.directory(vm);
        for (idx, name) in self.volume_files(vm).await? {
            if idx == index {
                tokio::fs::remove_file(dir.join(&name)).await?;
            } else if idx > index {
                let suffix = &name[format!("volume-{idx}").len()..];
                let shifted = format!("volume-{}{suffix}", idx - 1);
                tokio::fs::rename(dir.join(&name), dir.join(shifted)).await?;
            }
        }
        Ok(())
    }

    async fn adopt(
        &self,
        vm: IpAddr,
        blob: &Blob,
        path: &Path,
    ) -> Result<u64, StorageError> {
        tokio::fs::create_dir_all(self.directory(vm)).await?;
        let dst = self.path(vm, blob);
        if tokio::fs::rename(path, &dst).await.is_err() {
            // Different file system: fall back to copy and delete.
            tokio::fs::copy(path, &dst)
                .await
                .map_err(|e| not_found(e, || path.display().to_string()))?;
            tokio::fs::remove_file(path).await?;
        }
        Ok(tokio::fs::metadata(&dst).await?.len())
    }

    fn location(&self, vm: IpAddr, blob: &Blob) -> PathBuf {
        self.path(vm, blob)
    }

    fn directory(&self, vm: IpAddr) -> PathBuf {
        self.root.join(vm.to_string())
    }

    async fn move_vm(
        &self,
        from: IpAddr,
        to: IpAddr,
    ) -> Result<(), StorageError> {
        let (from, to) = (self.directory(from), self.directory(to));
        match tokio::fs::rename(from, to).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn vm() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    async fn write(store: &DirectoryStore, blob: Blob, data: &[u8]) {
        let mut w = store.create(vm(), &blob).await.unwrap();
        w.write_all(data).await.unwrap();
        w.shutdown().await.unwrap();
    }

    async fn read(store: &DirectoryStore, blob: Blob) -> Vec<u8> {
        let mut r = store.open(vm(), &blob).await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn volume_names_parse() {
        assert_eq!(volume_index("volume-3"), Some((3, "")));
        assert_eq!(
            volume_index("volume-12.snapshot-a.b"),
            Some((12, ".snapshot-a.b"))
        );
        assert_eq!(volume_index("user-data"), None);
        assert_eq!(volume_index("volume-x"), None);
    }

    #[tokio::test]
    async fn write_read_and_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path(), 1000);
        write(&store, Blob::Volume(0), b"root image").await;
        assert_eq!(read(&store, Blob::Volume(0)).await, b"root image");
        assert_eq!(store.size(vm(), &Blob::Volume(0)).await.unwrap(), 10);

        let cap = store.capacity().await.unwrap();
        assert_eq!(cap, StoreCapacity { total_bytes: 1000, free_bytes: 990 });
        assert!(cap.check(900, 90).is_ok());
        assert!(matches!(
            cap.check(900, 91),
            Err(StorageError::InsufficientSpace { needed: 991, free: 990 })
        ));

        assert!(matches!(
            store.open(vm(), &Blob::UserData).await,
            Err(StorageError::NotFound(_))
        ));
        store.remove(vm(), &Blob::UserData).await.unwrap();
    }

    #[tokio::test]
    async fn reorder_moves_snapshots_with_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path(), 1 << 20);
        write(&store, Blob::Volume(0), b"zero").await;
        write(&store, Blob::Volume(1), b"one").await;
        write(&store, Blob::Volume(2), b"two").await;
        let snap = Blob::Snapshot { index: 2, name: "s".into() };
        write(&store, snap, b"two@s").await;

        store.reorder_volumes(vm(), &[2, 0, 1]).await.unwrap();
        assert_eq!(read(&store, Blob::Volume(0)).await, b"two");
        assert_eq!(read(&store, Blob::Volume(1)).await, b"zero");
        assert_eq!(read(&store, Blob::Volume(2)).await, b"one");
        assert_eq!(
            read(&store, Blob::Snapshot { index: 0, name: "s".into() }).await,
            b"two@s"
        );
    }

    #[tokio::test]
    async fn delete_shifts_later_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path(), 1 << 20);
        for (i, data) in [b"a", b"b", b"c"].iter().enumerate() {
            write(&store, Blob::Volume(i), *data).await;
        }
        store.delete_volume(vm(), 1).await.unwrap();
        assert_eq!(read(&store, Blob::Volume(0)).await, b"a");
        assert_eq!(read(&store, Blob::Volume(1)).await, b"c");
        assert!(!store.exists(vm(), &Blob::Volume(2)).await);
    }

    #[tokio::test]
    async fn adopt_and_move() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("vms"), 1 << 20);
        let outside = dir.path().join("import.img");
        std::fs::write(&outside, b"imported").unwrap();

        let size = store.adopt(vm(), &Blob::Volume(0), &outside).await.unwrap();
        assert_eq!(size, 8);
        assert!(!outside.exists());

        let new: IpAddr = "10.0.1.5".parse().unwrap();
        store.move_vm(vm(), new).await.unwrap();
        assert!(store.location(new, &Blob::Volume(0)).exists());
        store.remove_all(new).await.unwrap();
        assert!(!store.directory(new).exists());
    }
}
