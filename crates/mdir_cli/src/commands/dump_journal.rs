//! Dump journal command implementation.

use super::scan_journal;
use serde::Serialize;
use std::path::Path;

/// One journal record for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Byte offset of the record.
    pub offset: u64,
    /// Record length in bytes.
    pub len: usize,
    /// Version before the patch.
    pub old_version: i64,
    /// Version after the patch.
    pub new_version: i64,
    /// `ADD` or `REMOVE`.
    pub action: String,
    /// Document type.
    pub doc_type: String,
    /// Document fields, in order.
    pub fields: Vec<(String, String)>,
}

/// Runs the dump-journal command.
pub fn run(
    path: &Path,
    from_version: i64,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let scan = scan_journal(path)?;
    let records: Vec<RecordInfo> = scan
        .records
        .iter()
        .filter(|(_, patch)| patch.new_version > from_version)
        .take(limit.unwrap_or(usize::MAX))
        .map(|(location, patch)| RecordInfo {
            offset: location.offset,
            len: location.len,
            old_version: patch.old_version,
            new_version: patch.new_version,
            action: patch.action.to_string(),
            doc_type: patch.header.doc_type().to_string(),
            fields: patch
                .header
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        })
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => print_text_output(&records),
    }

    if let Some(e) = scan.error {
        return Err(format!("journal unreadable after offset {}: {e}", scan.valid_end).into());
    }
    Ok(())
}

fn print_text_output(records: &[RecordInfo]) {
    for record in records {
        let span = if record.new_version - record.old_version > 1 {
            format!(" (skips {})", record.new_version - record.old_version - 1)
        } else {
            String::new()
        };
        println!(
            "@{:<8} v{} -> v{}{} {} {}",
            record.offset, record.old_version, record.new_version, span, record.action, record.doc_type
        );
        for (name, value) in &record.fields {
            println!("    {name}: {value}");
        }
    }
    println!();
    println!("{} record(s)", records.len());
}
