//! GUID partition table of the disk image.
//!
//! The image always carries two partitions: the ESP starting at 1 MiB and the
//! root partition spanning the rest of the disk.

use bytesize::ByteSize;
use gpt_disk_io::{BlockIo, BlockIoAdapter, Disk};
use gpt_disk_types::{
    guid, BlockSize, GptHeader, GptPartitionEntry, GptPartitionEntryArray, GptPartitionType,
    Guid, LbaLe, U32Le,
};
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use uuid::Uuid;

use super::core::Step;
use super::error::{DiskError, Result};
use super::filesystem::FsKind;
use super::host::Host;
use super::DiskContext;

/// Logical sector size.
pub const SECTOR_SIZE: u64 = 512;

/// Partition alignment in sectors (1 MiB).
const ALIGNMENT: u64 = 2048;

/// Size of the ESP in sectors (64 MiB).
const ESP_SECTORS: u64 = 64 * 2048;

/// Smallest root partition accepted when planning the layout (16 MiB).
const MIN_ROOT_SECTORS: u64 = 16 * 2048;

/// Number of entries in partition entry array.
const NUM_ENTRIES: u32 = 128;

/// Size of partition entry in bytes.
const ENTRY_SIZE: u32 = 128;

/// Sectors occupied by partition entry array.
const ENTRY_ARRAY_SECTORS: u64 = (NUM_ENTRIES as u64 * ENTRY_SIZE as u64) / SECTOR_SIZE;

/// Protective MBR, header and entry array.
const FIRST_USABLE_LBA: u64 = 2 + ENTRY_ARRAY_SECTORS;

const ENTRY_ARRAY_BYTES: usize = (NUM_ENTRIES * ENTRY_SIZE) as usize;


/// Linux filesystem data partition type.
const LINUX_FS: GptPartitionType =
    GptPartitionType(guid!("0fc63daf-8483-4772-8e79-3d69d8477de4"));

/// Fresh version 4 GUID for the disk or a partition.
fn random_guid() -> Guid {
    Guid::from_random_bytes(*Uuid::new_v4().as_bytes())
}

/// Role of a partition on the disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    Esp,
    Root,
}

impl PartitionRole {
    fn type_guid(&self) -> GptPartitionType {
        match self {
            Self::Esp => GptPartitionType::EFI_SYSTEM,
            Self::Root => LINUX_FS,
        }
    }
}

/// Partition on the disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionSpec {
    /// Partition number as seen by the kernel (starting from 1).
    pub number: u32,
    pub role: PartitionRole,
    pub filesystem: FsKind,
    /// First sector.
    pub start_lba: u64,
    /// Last sector (inclusive).
    pub end_lba: u64,
}

impl PartitionSpec {
    /// Inclusive starting offset in bytes.
    pub fn start(&self) -> u64 {
        self.start_lba * SECTOR_SIZE
    }

    /// Exclusive ending offset in bytes.
    pub fn end(&self) -> u64 {
        (self.end_lba + 1) * SECTOR_SIZE
    }

    pub fn size(&self) -> u64 {
        self.end() - self.start()
    }

    fn to_entry(self) -> GptPartitionEntry {
        GptPartitionEntry {
            partition_type_guid: self.role.type_guid(),
            unique_partition_guid: random_guid(),
            starting_lba: LbaLe::from_u64(self.start_lba),
            ending_lba: LbaLe::from_u64(self.end_lba),
            ..Default::default()
        }
    }
}

/// Two-partition layout of the disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionLayout {
    /// Total number of sectors on the disk.
    pub disk_sectors: u64,
    pub esp: PartitionSpec,
    pub root: PartitionSpec,
}

impl PartitionLayout {
    /// Plan layout for a disk of given number of sectors.
    pub fn plan(disk_sectors: u64) -> Option<Self> {
        let esp = PartitionSpec {
            number: 1,
            role: PartitionRole::Esp,
            filesystem: FsKind::Fat32,
            start_lba: ALIGNMENT,
            end_lba: ALIGNMENT + ESP_SECTORS - 1,
        };
        let root_start = (esp.end_lba + 1).next_multiple_of(ALIGNMENT);
        let root_end = last_usable_lba(disk_sectors)?;
        if root_end < root_start + MIN_ROOT_SECTORS - 1 {
            return None;
        }
        let root = PartitionSpec {
            number: 2,
            role: PartitionRole::Root,
            filesystem: FsKind::Ext4,
            start_lba: root_start,
            end_lba: root_end,
        };
        Some(Self {
            disk_sectors,
            esp,
            root,
        })
    }

    /// Smallest disk size this layout fits into.
    pub fn min_disk_size() -> u64 {
        (ALIGNMENT + ESP_SECTORS + MIN_ROOT_SECTORS + ENTRY_ARRAY_SECTORS + 1) * SECTOR_SIZE
    }

    /// Human readable table.
    pub fn pretty_print(&self) -> String {
        let mut output = format!(
            "Disk: {} sectors ({})\n{:<4} {:<6} {:<6} {:>10} {:>10} {:>10}\n",
            self.disk_sectors,
            ByteSize::b(self.disk_sectors * SECTOR_SIZE),
            "#",
            "role",
            "fs",
            "start",
            "end",
            "size",
        );
        for part in [&self.esp, &self.root] {
            output.push_str(&format!(
                "{:<4} {:<6} {:<6} {:>10} {:>10} {:>10}\n",
                part.number,
                format!("{:?}", part.role).to_lowercase(),
                part.filesystem.mount_type(),
                part.start_lba,
                part.end_lba,
                ByteSize::b(part.size()).to_string(),
            ));
        }
        output
    }
}

impl fmt::Display for PartitionLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty_print())
    }
}

/// Last usable sector on a disk of given size (before backup entry array).
fn last_usable_lba(disk_sectors: u64) -> Option<u64> {
    disk_sectors.checked_sub(ENTRY_ARRAY_SECTORS + 2)
}

fn tool_err<E: fmt::Display>(action: &'static str, path: &Path) -> impl FnOnce(E) -> DiskError {
    let resource = path.to_path_buf();
    move |err| DiskError::PartitionToolError {
        action,
        resource,
        message: err.to_string(),
    }
}

fn table_err(action: &'static str, path: &Path, message: &str) -> DiskError {
    DiskError::PartitionToolError {
        action,
        resource: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Number of whole sectors in the file.
fn disk_sectors(file: &File, path: &Path) -> Result<u64> {
    let meta = file.metadata().map_err(DiskError::io("get size of", path))?;
    Ok(meta.len() / SECTOR_SIZE)
}

/// Write primary and backup tables.
///
/// Backup header lives in the last sector, backup entry array right before it.
fn write_tables<B: BlockIo>(
    disk: &mut Disk<B>,
    header: &GptHeader,
    entries: &GptPartitionEntryArray,
    path: &Path,
) -> Result<()> {
    let action = "write partition table to";
    let mut block_buf = [0u8; SECTOR_SIZE as usize];

    disk.write_primary_gpt_header(header, &mut block_buf)
        .map_err(tool_err(action, path))?;
    disk.write_gpt_partition_entry_array(entries)
        .map_err(tool_err(action, path))?;

    let mut backup = header.clone();
    backup.my_lba = header.alternate_lba;
    backup.alternate_lba = header.my_lba;
    backup.partition_entry_lba =
        LbaLe::from_u64(header.alternate_lba.to_u64() - ENTRY_ARRAY_SECTORS);
    backup.update_header_crc32();

    disk.write_secondary_gpt_header(&backup, &mut block_buf)
        .map_err(tool_err(action, path))?;

    let backup_layout = backup
        .get_partition_entry_array_layout()
        .map_err(tool_err(action, path))?;
    let mut backup_buf = entries.storage().to_vec();
    let backup_entries =
        GptPartitionEntryArray::new(backup_layout, BlockSize::BS_512, &mut backup_buf)
            .map_err(tool_err(action, path))?;
    disk.write_gpt_partition_entry_array(&backup_entries)
        .map_err(tool_err(action, path))?;

    disk.flush().map_err(tool_err(action, path))?;
    Ok(())
}

/// Read and verify primary header.
fn read_header<B: BlockIo>(disk: &mut Disk<B>, path: &Path) -> Result<GptHeader> {
    let action = "read partition table of";
    let mut block_buf = [0u8; SECTOR_SIZE as usize];
    let header = disk
        .read_primary_gpt_header(&mut block_buf)
        .map_err(tool_err(action, path))?;
    if !header.is_signature_valid() {
        return Err(table_err(action, path, "no GPT signature"));
    }
    if header.header_crc32 != header.calculate_header_crc32() {
        return Err(table_err(action, path, "header checksum mismatch"));
    }
    if header.number_of_partition_entries.to_u32() != NUM_ENTRIES
        || header.size_of_partition_entry.to_u32() != ENTRY_SIZE
    {
        return Err(table_err(action, path, "unexpected partition entry geometry"));
    }
    Ok(header)
}

/// Create protective MBR and both GPT copies with ESP and root partitions.
///
/// The file must already have its final size.
pub fn create_layout(path: &Path) -> Result<PartitionLayout> {
    let action = "create partition table on";
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(DiskError::io("open", path))?;
    let sectors = disk_sectors(&file, path)?;
    let layout = PartitionLayout::plan(sectors).ok_or_else(|| {
        table_err(
            action,
            path,
            &format!(
                "disk too small for ESP and root partitions (at least {} required)",
                ByteSize::b(PartitionLayout::min_disk_size())
            ),
        )
    })?;

    let mut disk = Disk::new(BlockIoAdapter::new(&mut file, BlockSize::BS_512))
        .map_err(tool_err(action, path))?;

    let mut block_buf = [0u8; SECTOR_SIZE as usize];
    disk.write_protective_mbr(&mut block_buf)
        .map_err(tool_err(action, path))?;

    let mut header = GptHeader {
        my_lba: LbaLe::from_u64(1),
        alternate_lba: LbaLe::from_u64(sectors - 1),
        first_usable_lba: LbaLe::from_u64(FIRST_USABLE_LBA),
        last_usable_lba: LbaLe::from_u64(layout.root.end_lba),
        disk_guid: random_guid(),
        partition_entry_lba: LbaLe::from_u64(2),
        number_of_partition_entries: U32Le::from_u32(NUM_ENTRIES),
        size_of_partition_entry: U32Le::from_u32(ENTRY_SIZE),
        ..Default::default()
    };

    let entries_layout = header
        .get_partition_entry_array_layout()
        .map_err(tool_err(action, path))?;
    let mut entries_buf = vec![0u8; ENTRY_ARRAY_BYTES];
    let mut entries =
        GptPartitionEntryArray::new(entries_layout, BlockSize::BS_512, &mut entries_buf)
            .map_err(tool_err(action, path))?;

    for (index, part) in [(0, layout.esp), (1, layout.root)] {
        let entry = entries
            .get_partition_entry_mut(index)
            .ok_or_else(|| table_err(action, path, "partition entry out of range"))?;
        *entry = part.to_entry();
    }

    header.partition_entry_array_crc32 = entries.calculate_crc32();
    header.update_header_crc32();

    write_tables(&mut disk, &header, &entries, path)?;
    info!("partition table created on {}", path.display());
    debug!("layout:\n{}", layout.pretty_print());
    Ok(layout)
}

/// Read and verify the two-partition layout.
pub fn read_layout(path: &Path) -> Result<PartitionLayout> {
    let action = "read partition table of";
    let mut file = File::open(path).map_err(DiskError::io("open", path))?;
    let sectors = disk_sectors(&file, path)?;
    let mut disk = Disk::new(BlockIoAdapter::new(&mut file, BlockSize::BS_512))
        .map_err(tool_err(action, path))?;

    let header = read_header(&mut disk, path)?;
    let entries_layout = header
        .get_partition_entry_array_layout()
        .map_err(tool_err(action, path))?;
    let mut entries_buf = vec![0u8; ENTRY_ARRAY_BYTES];
    let entries = disk
        .read_gpt_partition_entry_array(entries_layout, &mut entries_buf)
        .map_err(tool_err(action, path))?;
    if entries.calculate_crc32() != header.partition_entry_array_crc32 {
        return Err(table_err(action, path, "partition entries checksum mismatch"));
    }

    let mut used = Vec::new();
    for index in 0..NUM_ENTRIES {
        if let Some(entry) = entries.get_partition_entry(index) {
            if entry.is_used() {
                used.push((index, entry.clone()));
            }
        }
    }

    let [(0, esp), (1, root)] = &used[..] else {
        return Err(table_err(
            action,
            path,
            &format!("expected 2 partitions, found {}", used.len()),
        ));
    };

    // Copy to avoid references into packed data
    let esp_type = esp.partition_type_guid;
    let root_type = root.partition_type_guid;
    if esp_type != GptPartitionType::EFI_SYSTEM {
        return Err(table_err(action, path, "first partition is not an ESP"));
    }
    if root_type != LINUX_FS {
        return Err(table_err(
            action,
            path,
            "second partition is not a Linux filesystem",
        ));
    }

    let esp = PartitionSpec {
        number: 1,
        role: PartitionRole::Esp,
        filesystem: FsKind::Fat32,
        start_lba: esp.starting_lba.to_u64(),
        end_lba: esp.ending_lba.to_u64(),
    };
    let root = PartitionSpec {
        number: 2,
        role: PartitionRole::Root,
        filesystem: FsKind::Ext4,
        start_lba: root.starting_lba.to_u64(),
        end_lba: root.ending_lba.to_u64(),
    };
    if esp.end_lba < esp.start_lba
        || root.end_lba < root.start_lba
        || esp.end_lba >= root.start_lba
        || root.end_lba > header.last_usable_lba.to_u64()
        || header.last_usable_lba.to_u64() >= sectors
    {
        return Err(table_err(action, path, "partitions out of bounds"));
    }

    Ok(PartitionLayout {
        disk_sectors: sectors,
        esp,
        root,
    })
}

/// Move backup GPT to the current end of the file.
///
/// Used after the file was extended. Partition entries are kept as is.
pub fn repair_backup(path: &Path) -> Result<()> {
    let action = "repair partition table of";
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(DiskError::io("open", path))?;
    let sectors = disk_sectors(&file, path)?;
    let mut disk = Disk::new(BlockIoAdapter::new(&mut file, BlockSize::BS_512))
        .map_err(tool_err(action, path))?;

    let mut header = read_header(&mut disk, path)?;
    let entries_layout = header
        .get_partition_entry_array_layout()
        .map_err(tool_err(action, path))?;
    let mut entries_buf = vec![0u8; ENTRY_ARRAY_BYTES];
    let entries = disk
        .read_gpt_partition_entry_array(entries_layout, &mut entries_buf)
        .map_err(tool_err(action, path))?;

    let last_usable = last_usable_lba(sectors)
        .ok_or_else(|| table_err(action, path, "disk too small"))?;
    if last_usable < header.last_usable_lba.to_u64() {
        return Err(table_err(action, path, "disk is smaller than its partition table"));
    }

    header.alternate_lba = LbaLe::from_u64(sectors - 1);
    header.last_usable_lba = LbaLe::from_u64(last_usable);
    header.update_header_crc32();

    write_tables(&mut disk, &header, &entries, path)?;
    debug!(
        "backup partition table moved to sector {} of {}",
        sectors - 1,
        path.display()
    );
    Ok(())
}

/// Extend root partition up to the last usable sector.
///
/// Never shrinks the partition.
pub fn resize_root(path: &Path) -> Result<PartitionLayout> {
    let action = "resize root partition of";
    {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(DiskError::io("open", path))?;
        let mut disk = Disk::new(BlockIoAdapter::new(&mut file, BlockSize::BS_512))
            .map_err(tool_err(action, path))?;

        let mut header = read_header(&mut disk, path)?;
        let entries_layout = header
            .get_partition_entry_array_layout()
            .map_err(tool_err(action, path))?;
        let mut entries_buf = vec![0u8; ENTRY_ARRAY_BYTES];
        let mut entries = disk
            .read_gpt_partition_entry_array(entries_layout, &mut entries_buf)
            .map_err(tool_err(action, path))?;

        let last_usable = header.last_usable_lba.to_u64();
        let root = entries
            .get_partition_entry_mut(1)
            .filter(|entry| entry.is_used())
            .ok_or_else(|| table_err(action, path, "root partition not found"))?;
        let old_end = root.ending_lba.to_u64();
        if last_usable < old_end {
            return Err(table_err(action, path, "partition would shrink"));
        }
        root.ending_lba = LbaLe::from_u64(last_usable);
        debug!("root partition end: {} -> {}", old_end, last_usable);

        header.partition_entry_array_crc32 = entries.calculate_crc32();
        header.update_header_crc32();
        write_tables(&mut disk, &header, &entries, path)?;
    }
    read_layout(path)
}

/// Create partition table on new image file.
pub struct CreatePartitionTable;

impl<H: Host> Step<DiskContext<'_, H>> for CreatePartitionTable {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        info!("creating partition table");
        let layout = create_layout(ctx.image("create partition table")?.path())?;
        ctx.layout = Some(layout);
        Ok(())
    }
}

/// Read partition table of existing image file.
pub struct ReadPartitionTable;

impl<H: Host> Step<DiskContext<'_, H>> for ReadPartitionTable {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        let layout = read_layout(ctx.image("read partition table")?.path())?;
        debug!("partition table:\n{}", layout.pretty_print());
        ctx.layout = Some(layout);
        Ok(())
    }
}

/// Repair backup GPT and extend root partition to the end of the file.
///
/// Image file must not be attached.
pub struct ExpandRootPartition;

impl<H: Host> Step<DiskContext<'_, H>> for ExpandRootPartition {
    fn run(&mut self, ctx: &mut DiskContext<'_, H>) -> Result<()> {
        if ctx.loopdev.is_some() {
            return Err(DiskError::invalid_context(
                "expand root partition",
                "detached image",
            ));
        }
        let path = ctx.image("expand root partition")?.path().to_path_buf();
        repair_backup(&path)?;
        let layout = resize_root(&path)?;
        info!(
            "root partition expanded to {}",
            ByteSize::b(layout.root.size())
        );
        ctx.layout = Some(layout);
        Ok(())
    }
}
