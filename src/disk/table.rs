//! DOS partition table derived from a profile.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::{Error, Result};
use crate::process::Cmd;
use crate::profile::{GenerationProfile, TableSlot};

/// sfdisk type shorthand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Linux,
    Extended,
}

impl EntryType {
    fn code(self) -> &'static str {
        match self {
            Self::Linux => "L",
            Self::Extended => "Ex",
        }
    }
}

/// One line of the table, in sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// Primary slot number; `None` for logical partitions.
    pub slot: Option<u8>,
    pub name: String,
    pub start_sector: u64,
    pub size_sectors: u64,
    pub entry_type: EntryType,
}

/// The full table in the order sfdisk must create it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub label_id: u32,
    pub entries: Vec<TableEntry>,
}

impl PartitionTable {
    /// Primaries in slot order; the extended container is followed by its
    /// logical partitions in offset order.
    pub fn from_profile(profile: &GenerationProfile) -> Result<Self> {
        let extended = profile.extended_extent();
        let mut entries = Vec::new();

        for slot in 1..=4u8 {
            if let Some(spec) = profile
                .partitions
                .iter()
                .find(|p| p.table == TableSlot::Primary(slot))
            {
                entries.push(TableEntry {
                    slot: Some(slot),
                    name: spec.name.clone(),
                    start_sector: spec.start_sector(),
                    size_sectors: spec.size_sectors(),
                    entry_type: EntryType::Linux,
                });
                continue;
            }

            if profile.extended_slot != Some(slot) {
                continue;
            }
            let Some((start_sector, size_sectors)) = extended else {
                continue;
            };
            entries.push(TableEntry {
                slot: Some(slot),
                name: "extended".into(),
                start_sector,
                size_sectors,
                entry_type: EntryType::Extended,
            });
            for spec in profile.logical_partitions() {
                entries.push(TableEntry {
                    slot: None,
                    name: spec.name.clone(),
                    start_sector: spec.start_sector(),
                    size_sectors: spec.size_sectors(),
                    entry_type: EntryType::Linux,
                });
            }
        }

        if extended.is_some() && !entries.iter().any(|e| e.entry_type == EntryType::Extended) {
            return Err(Error::disk_write(
                "partition-table",
                "logical partitions without an extended slot",
            ));
        }

        Ok(Self {
            label_id: 0,
            entries,
        })
    }

    /// Render as an sfdisk script.
    pub fn sfdisk_script(&self) -> String {
        let mut script = format!("label: dos\nlabel-id: {:#010x}\n", self.label_id);
        for entry in &self.entries {
            if let Some(slot) = entry.slot {
                let _ = write!(script, "{}: ", slot);
            }
            let _ = writeln!(
                script,
                "start={}, size={}, type={}",
                entry.start_sector,
                entry.size_sectors,
                entry.entry_type.code()
            );
        }
        script
    }
}

/// Writes a partition table onto an image file.
pub trait PartitionTableWriter: Send + Sync {
    fn write_table(&self, image: &Path, table: &PartitionTable) -> Result<()>;

    /// Host programs this writer needs.
    fn required_programs(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Writes the table with `sfdisk`, fed a script on stdin.
#[derive(Debug, Clone)]
pub struct Sfdisk {
    program: String,
}

impl Sfdisk {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Sfdisk {
    fn default() -> Self {
        Self::new("sfdisk")
    }
}

impl PartitionTableWriter for Sfdisk {
    fn write_table(&self, image: &Path, table: &PartitionTable) -> Result<()> {
        Cmd::new(&self.program)
            .args(["--no-reread", "--no-tell-kernel", "--"])
            .arg_path(image)
            .stdin(table.sfdisk_script())
            .error_msg("sfdisk failed to write the partition table")
            .run()
            .map_err(|e| Error::tool("partition-table", e))?;
        Ok(())
    }

    fn required_programs(&self) -> Vec<String> {
        vec![self.program.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::resolve;

    #[test]
    fn table_order_matches_slots() {
        let table = PartitionTable::from_profile(&resolve("AVH19", 1).unwrap()).unwrap();
        let names: Vec<&str> = table.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "boot-a",
                "boot-b",
                "extended",
                "recovery-a",
                "recovery-b",
                "platform",
                "cache",
                "userdata",
                "extdata"
            ]
        );
    }

    #[test]
    fn script_for_avh19() {
        let table = PartitionTable::from_profile(&resolve("AVH19", 1).unwrap()).unwrap();
        let script = table.sfdisk_script();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "label: dos");
        assert_eq!(lines[1], "label-id: 0x00000000");
        assert_eq!(lines[2], "1: start=1050624, size=20480, type=L");
        assert_eq!(lines[3], "2: start=1071104, size=20480, type=L");
        assert_eq!(lines[4], "3: start=1091584, size=3530752, type=Ex");
        assert_eq!(lines[5], "start=1091585, size=61439, type=L");
        assert_eq!(lines[8], "start=3311617, size=262143, type=L");
        assert_eq!(lines[10], "4: start=4622336, size=10420224, type=L");
        assert_eq!(lines.len(), 11);
    }

    #[test]
    fn missing_program_is_a_disk_write_error() {
        let table = PartitionTable::from_profile(&resolve("AVH19", 1).unwrap()).unwrap();
        let err = Sfdisk::new("nonexistent_sfdisk_12345")
            .write_table(Path::new("/tmp/none.img"), &table)
            .unwrap_err();
        assert_eq!(err.kind(), "DiskWrite");
    }
}
