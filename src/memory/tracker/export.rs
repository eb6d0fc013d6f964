/*!
 * Allocation Profile Export
 *
 * Text format: a `#` header line, then one tab-separated line per record:
 * tag, size_bytes, age_ms, address (0x-prefixed hex).
 * JSON lines: one object per record with the same fields.
 */

use super::record::AllocationRecord;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::types::Size;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Output layout of an allocation profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileFormat {
    #[default]
    Text,
    JsonLines,
}

pub const TEXT_HEADER: &str = "# tag\tsize_bytes\tage_ms\taddress";

#[derive(Serialize)]
struct ProfileLine<'a> {
    tag: &'a str,
    size_bytes: Size,
    age_ms: u128,
    address: String,
}

impl<'a> From<&'a AllocationRecord> for ProfileLine<'a> {
    fn from(record: &'a AllocationRecord) -> Self {
        Self {
            tag: record.tag.as_str(),
            size_bytes: record.size,
            age_ms: record.age().as_millis(),
            address: format!("0x{:x}", record.address),
        }
    }
}

/// Write `records` to `writer`, returning how many were written
pub fn write_profile<W: Write>(
    mut writer: W,
    records: &[AllocationRecord],
    format: ProfileFormat,
) -> io::Result<usize> {
    if format == ProfileFormat::Text {
        writeln!(writer, "{TEXT_HEADER}")?;
    }
    for record in records {
        let line = ProfileLine::from(record);
        match format {
            ProfileFormat::Text => {
                // Keep one record per line whatever the tag contains
                let tag = line.tag.replace(['\t', '\n', '\r'], " ");
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}",
                    tag, line.size_bytes, line.age_ms, line.address
                )?;
            }
            ProfileFormat::JsonLines => {
                serde_json::to_writer(&mut writer, &line)?;
                writer.write_all(b"\n")?;
            }
        }
    }
    writer.flush()?;
    Ok(records.len())
}

/// Create (or truncate) `path` and write the profile into it
pub fn export_profile(
    path: &Path,
    records: &[AllocationRecord],
    format: ProfileFormat,
) -> MemoryResult<usize> {
    let file = File::create(path).map_err(|e| MemoryError::io(path, e))?;
    write_profile(BufWriter::new(file), records, format).map_err(|e| MemoryError::io(path, e))
}
