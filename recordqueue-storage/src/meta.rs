//! Persistent queue metadata.
//!
//! Each queue keeps a small `<file_prefix>.meta` file next to its segments. It records the
//! generation of the sequence number space and the first sequence number that has not been
//! confirmed yet. The file is replaced atomically every time the confirmed position advances.

use std::mem;
use std::path::{Path, PathBuf};

use pack1::{U16LE, U32LE, U64LE};
use watto::Pod;

use crate::error::Result;
use crate::file;

const META_MAGIC: [u8; 2] = *b"\xf5M";
const META_VERSION: u16 = 1;

#[derive(Debug)]
#[repr(C)]
struct MetaHeader {
    magic: [u8; 2],
    version: U16LE,
    _reserved: [u8; 4],
    generation_id: U64LE,
    first_unconfirmed: U64LE,
    crc32: U32LE,
}
unsafe impl Pod for MetaHeader {}

const _: () = const {
    assert!(std::mem::align_of::<MetaHeader>() == 1);
    assert!(std::mem::size_of::<MetaHeader>() == 28);
};

const CHECKSUMMED: usize = mem::size_of::<MetaHeader>() - mem::size_of::<U32LE>();

/// Durable position of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMeta {
    /// Random tag of the sequence number space.
    pub generation_id: u64,
    /// Lowest sequence number that still needs to be uploaded.
    pub first_unconfirmed: u64,
}

/// Returns the path of the metadata file of a queue.
pub fn meta_path(directory: &Path, file_prefix: &str) -> PathBuf {
    directory.join(format!("{file_prefix}.meta"))
}

fn encode(meta: &QueueMeta) -> Vec<u8> {
    let mut header = MetaHeader {
        magic: META_MAGIC,
        version: META_VERSION.into(),
        _reserved: [0; 4],
        generation_id: meta.generation_id.into(),
        first_unconfirmed: meta.first_unconfirmed.into(),
        crc32: 0u32.into(),
    };
    header.crc32 = crc32fast::hash(&header.as_bytes()[..CHECKSUMMED]).into();
    header.as_bytes().to_owned()
}

fn decode(buf: &[u8]) -> Option<QueueMeta> {
    let header = MetaHeader::ref_from_bytes(buf)?;
    let valid = header.magic == META_MAGIC
        && header.version.get() == META_VERSION
        && crc32fast::hash(&buf[..CHECKSUMMED]) == header.crc32.get();

    valid.then(|| QueueMeta {
        generation_id: header.generation_id.get(),
        first_unconfirmed: header.first_unconfirmed.get(),
    })
}

/// Reads the metadata of a queue.
///
/// Returns `Ok(None)` if the file is missing or does not validate.
pub async fn read_meta(directory: &Path, file_prefix: &str) -> Result<Option<QueueMeta>> {
    let path = meta_path(directory, file_prefix);
    let Some(contents) = file::read_file_if_exists(&path).await? else {
        return Ok(None);
    };

    let meta = decode(&contents);
    if meta.is_none() {
        tracing::warn!(path = %path.display(), "ignoring invalid queue metadata");
    }
    Ok(meta)
}

/// Atomically replaces the metadata of a queue.
pub async fn write_meta(directory: &Path, file_prefix: &str, meta: &QueueMeta) -> Result<()> {
    let path = meta_path(directory, file_prefix);
    file::write_file_atomic(&path, &encode(meta)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let tempdir = tempfile::tempdir().unwrap();
        let meta = QueueMeta {
            generation_id: 0xdead_beef,
            first_unconfirmed: 42,
        };

        assert_eq!(read_meta(tempdir.path(), "P_Test").await.unwrap(), None);
        write_meta(tempdir.path(), "P_Test", &meta).await.unwrap();
        assert_eq!(
            read_meta(tempdir.path(), "P_Test").await.unwrap(),
            Some(meta)
        );
    }

    #[tokio::test]
    async fn corrupted_meta_is_ignored() {
        let tempdir = tempfile::tempdir().unwrap();
        let meta = QueueMeta {
            generation_id: 1,
            first_unconfirmed: 2,
        };
        write_meta(tempdir.path(), "P_Test", &meta).await.unwrap();

        let path = meta_path(tempdir.path(), "P_Test");
        let mut contents = tokio::fs::read(&path).await.unwrap();
        contents[12] ^= 0xff;
        tokio::fs::write(&path, &contents).await.unwrap();
        assert_eq!(read_meta(tempdir.path(), "P_Test").await.unwrap(), None);

        tokio::fs::write(&path, b"short").await.unwrap();
        assert_eq!(read_meta(tempdir.path(), "P_Test").await.unwrap(), None);
    }
}
