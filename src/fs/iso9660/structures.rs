//! On-disk ISO9660 (ECMA-119) structures.
//!
//! Multi-byte fields come in the standard's three encodings; the `_7xx`
//! suffixes mirror the section numbers of ECMA-119 chapter 7 (7.2.3
//! both-byte-order 16-bit, 7.3.3 both-byte-order 32-bit, 7.1.1 plain
//! 8-bit). We only ever read the little-endian half.

use bytemuck::{Pod, Zeroable};

/// Each logical sector is 2048 bytes or larger; we do not support larger.
pub const LOGICAL_SECTOR_SIZE: u64 = 2048;
pub const SYSTEM_AREA_BLOCKS: u64 = 16;

pub const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";

pub const VD_TYPE_PRIMARY: u8 = 1;
pub const VD_TYPE_TERMINATOR: u8 = 255;

/// 7.2.3: both-byte orders, 2 bytes each.
pub fn get_723(field: &[u8]) -> u16 {
    u16::from_le_bytes([field[0], field[1]])
}

/// 7.3.3: both-byte orders, 4 bytes each.
pub fn get_733(field: &[u8]) -> u32 {
    u32::from_le_bytes([field[0], field[1], field[2], field[3]])
}

/// The fixed prefix of the Primary Volume Descriptor, up to and including
/// the root directory record. The rest of the 2048-byte descriptor is
/// identifiers and dates we have no use for.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct PvdPrefix {
    pub descriptor_type: u8,
    pub standard_identifier: [u8; 5],
    pub version: u8,
    pub unused_field_1: u8,
    pub system_identifier: [u8; 32],
    pub volume_identifier: [u8; 32],
    pub unused_field_2: [u8; 8],
    pub volume_space_size_733: [u8; 8],
    pub unused_field_3: [u8; 32],
    pub volume_set_size_723: [u8; 4],
    pub volume_sequence_number_723: [u8; 4],
    pub logical_block_size_723: [u8; 4],
    pub path_table_size_733: [u8; 8],
    pub type_l_path_table_location_731: [u8; 4],
    pub optional_le_path_table_location_731: [u8; 4],
    pub be_path_table_location_732: [u8; 4],
    pub optional_be_path_table_location_732: [u8; 4],
    pub root_directory_entry: [u8; 34],
}

const _: () = assert!(core::mem::size_of::<PvdPrefix>() == 190);

/// The fixed part of a directory record; a variable-length identifier and
/// the System Use area follow it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct DirRecordHeader {
    pub record_length: u8,
    pub extended_attr_rec_length: u8,
    pub location_of_extent_733: [u8; 8],
    pub data_length_733: [u8; 8],
    pub date_and_time: [u8; 7],
    pub flags: u8,
    pub unit_size: u8,
    pub interleave_gap_size: u8,
    pub volume_seq_num_723: [u8; 4],
    pub identifier_length: u8,
}

pub const DIR_RECORD_HEADER_SIZE: usize = 33;
const _: () = assert!(core::mem::size_of::<DirRecordHeader>() == DIR_RECORD_HEADER_SIZE);

pub const ISO9660_HIDDEN: u8 = 1 << 0;
pub const ISO9660_SUBDIR: u8 = 1 << 1;
pub const ISO9660_ASSOC_FILE: u8 = 1 << 2;
pub const ISO9660_MULTI_EXT: u8 = 1 << 7;

pub const CURDIR_NAME_BYTE: u8 = 0;
pub const PARDIR_NAME_BYTE: u8 = 1;

impl DirRecordHeader {
    pub fn extent_block(&self) -> u32 {
        get_733(&self.location_of_extent_733) + u32::from(self.extended_attr_rec_length)
    }

    pub fn data_length(&self) -> u32 {
        get_733(&self.data_length_733)
    }

    /// Identifier length including the pad byte that keeps the System Use
    /// area 2-byte aligned.
    pub fn padded_identifier_length(&self) -> usize {
        let len = usize::from(self.identifier_length);

        if len % 2 == 0 {
            len + 1
        } else {
            len
        }
    }
}
