//! The flat table of every filesystem discovered during disk enumeration.
//!
//! Append-only. One distinguished entry, the *origin*, marks where the
//! configuration file was loaded from and is what absolute paths resolve
//! against.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::disk::{Disk, DiskHandle};
use crate::fs::path::{DiskIdentifier, FullPath, PartitionIdentifier};
use crate::fs::{FileSystem, Guid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEntryType {
    Raw,
    Mbr,
    Gpt,
}

#[derive(Clone)]
pub struct FsEntry {
    pub disk_handle: DiskHandle,
    pub disk_id: u32,
    pub partition_index: u32,
    pub entry_type: FsEntryType,
    pub disk_guid: Guid,
    pub partition_guid: Guid,
    pub fs: Arc<dyn FileSystem>,
}

#[derive(Default)]
pub struct FsTable {
    entries: Vec<FsEntry>,
    origin: Option<usize>,
}

impl FsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_raw_entry(&mut self, disk: &Disk, fs: Arc<dyn FileSystem>) {
        self.entries.push(FsEntry {
            disk_handle: disk.handle,
            disk_id: disk.id,
            partition_index: 0,
            entry_type: FsEntryType::Raw,
            disk_guid: Guid::NULL,
            partition_guid: Guid::NULL,
            fs,
        });
    }

    pub fn add_mbr_entry(&mut self, disk: &Disk, partition_index: u32, fs: Arc<dyn FileSystem>) {
        self.entries.push(FsEntry {
            disk_handle: disk.handle,
            disk_id: disk.id,
            partition_index,
            entry_type: FsEntryType::Mbr,
            disk_guid: Guid::NULL,
            partition_guid: Guid::NULL,
            fs,
        });
    }

    pub fn add_gpt_entry(
        &mut self,
        disk: &Disk,
        partition_index: u32,
        disk_guid: Guid,
        partition_guid: Guid,
        fs: Arc<dyn FileSystem>,
    ) {
        self.entries.push(FsEntry {
            disk_handle: disk.handle,
            disk_id: disk.id,
            partition_index,
            entry_type: FsEntryType::Gpt,
            disk_guid,
            partition_guid,
            fs,
        });
    }

    /// Marks the entry the config file was found on.
    pub fn set_origin(&mut self, index: usize) {
        assert!(index < self.entries.len());
        self.origin = Some(index);
    }

    pub fn origin(&self) -> Option<&FsEntry> {
        self.origin.map(|idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[FsEntry] {
        &self.entries
    }

    /// Resolves a parsed path to a registered filesystem.
    pub fn by_full_path(&self, path: &FullPath<'_>) -> Option<&FsEntry> {
        let mut by_disk_index = None;

        match path.disk {
            DiskIdentifier::Origin => {
                let origin = self.origin()?;

                if matches!(
                    path.partition,
                    PartitionIdentifier::Origin | PartitionIdentifier::Raw
                ) {
                    return Some(origin);
                }

                by_disk_index = Some(origin.disk_id);
            }
            DiskIdentifier::Index(index) => by_disk_index = Some(index),
            DiskIdentifier::Uuid(_) => {}
        }

        for entry in &self.entries {
            match by_disk_index {
                Some(index) => {
                    if index != entry.disk_id {
                        continue;
                    }
                }
                None => {
                    let DiskIdentifier::Uuid(guid) = path.disk else {
                        unreachable!();
                    };

                    if guid != entry.disk_guid {
                        continue;
                    }
                }
            }

            match path.partition {
                PartitionIdentifier::Raw => {
                    // The disk matched; raw access only works when the
                    // whole disk is one filesystem.
                    return (entry.entry_type == FsEntryType::Raw).then_some(entry);
                }
                PartitionIdentifier::Index(index) => {
                    if index != entry.partition_index {
                        continue;
                    }
                }
                PartitionIdentifier::Uuid(guid) => {
                    if guid != entry.partition_guid {
                        continue;
                    }
                }
                PartitionIdentifier::Origin => continue,
            }

            return Some(entry);
        }

        None
    }
}
