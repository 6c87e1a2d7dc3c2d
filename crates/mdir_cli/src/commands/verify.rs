//! Verify command implementation.

use super::{scan_journal, JournalScan};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Bytes a crash left after the last complete record.
    pub torn_bytes: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let scan = scan_journal(path)?;
    println!("Verifying journal {}", scan.path.display());
    println!();

    let result = verify(&scan);
    println!("  Records checked: {}", result.records_checked);
    println!("  Last version:    {}", scan.last_version());
    if result.torn_bytes > 0 {
        println!(
            "  Torn tail:       {} byte(s), cut off on next open",
            result.torn_bytes
        );
    }
    for error in &result.errors {
        println!("  Error: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
        Ok(())
    } else {
        println!("✗ Journal verification failed");
        Err("verification failed".into())
    }
}

/// Checks record integrity and version contiguity.
pub fn verify(scan: &JournalScan) -> VerifyResult {
    let mut result = VerifyResult {
        records_checked: scan.records.len(),
        torn_bytes: scan.torn_bytes(),
        errors: Vec::new(),
    };

    let mut expected = 0;
    for (location, patch) in &scan.records {
        if patch.old_version != expected {
            result.errors.push(format!(
                "record at offset {} starts at version {}, expected {expected}",
                location.offset, patch.old_version
            ));
        }
        if patch.new_version <= patch.old_version {
            result.errors.push(format!(
                "record at offset {} does not advance the version",
                location.offset
            ));
        }
        expected = patch.new_version;
    }

    if let Some(e) = &scan.error {
        result
            .errors
            .push(format!("unreadable record at offset {}: {e}", scan.valid_end));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{sample, write_journal};
    use super::*;
    use mdir_codec::Header;
    use mdir_protocol::Patch;
    use tempfile::tempdir;

    #[test]
    fn clean_journal_passes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".journal");
        write_journal(&path, &sample());
        let result = verify(&scan_journal(&path).unwrap());
        assert!(result.is_ok());
        assert_eq!(result.records_checked, 3);
    }

    #[test]
    fn gap_in_versions_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".journal");
        let mut patches = sample();
        patches.push(Patch::add(7, Header::new().with("subject", "late")));
        write_journal(&path, &patches);
        let result = verify(&scan_journal(&path).unwrap());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("expected 3"));
    }

    #[test]
    fn corruption_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".journal");
        write_journal(&path, &sample());
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let result = verify(&scan_journal(&path).unwrap());
        assert_eq!(result.records_checked, 2);
        assert!(!result.is_ok());
    }
}
