//! In-memory assembly of a received file.

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::file::FileMetadata;

/// Joins chunk slots into the final payload.
#[derive(Debug, Clone, Copy)]
pub struct FileAssembler {
    tolerance: u64,
    strict: bool,
}

impl FileAssembler {
    /// Create an assembler accepting `tolerance` bytes of size slack.
    #[must_use]
    pub const fn new(tolerance: u64, strict: bool) -> Self {
        Self { tolerance, strict }
    }

    /// Create an assembler from the transfer settings.
    #[must_use]
    pub const fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.size_tolerance, config.strict_size_check)
    }

    /// Check an assembled byte count against the declared size.
    ///
    /// # Errors
    ///
    /// Returns `Error::SizeMismatch` when the difference exceeds the tolerance
    /// (or is non-zero in strict mode).
    pub fn check_size(&self, expected: u64, actual: u64) -> Result<()> {
        let slack = if self.strict { 0 } else { self.tolerance };
        if expected.abs_diff(actual) > slack {
            return Err(Error::SizeMismatch { expected, actual });
        }
        if expected != actual {
            tracing::debug!(expected, actual, "Size within tolerance");
        }
        Ok(())
    }

    /// Concatenate the chunks received after `resume_offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolViolation` if a slot is empty and
    /// `Error::SizeMismatch` if the result does not match the declared size.
    pub fn assemble(
        &self,
        meta: &FileMetadata,
        resume_offset: u64,
        slots: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let mut total = 0u64;
        for (index, slot) in slots.iter().enumerate() {
            match slot {
                Some(chunk) => total += chunk.len() as u64,
                None => {
                    return Err(Error::ProtocolViolation(format!(
                        "chunk {index} of '{}' missing at assembly",
                        meta.file_id
                    )))
                }
            }
        }

        self.check_size(meta.size.saturating_sub(resume_offset), total)?;

        let mut data = Vec::with_capacity(total as usize);
        for chunk in slots.into_iter().flatten() {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> FileMetadata {
        FileMetadata::new("a.txt", size, "text/plain", "a.txt", "")
    }

    #[test]
    fn test_assemble_in_slot_order() {
        let assembler = FileAssembler::new(0, true);
        let data = assembler
            .assemble(&meta(5), 0, vec![Some(b"ab".to_vec()), Some(b"cde".to_vec())])
            .unwrap();
        assert_eq!(data, b"abcde");
    }

    #[test]
    fn test_missing_slot() {
        let assembler = FileAssembler::new(1024, false);
        let err = assembler
            .assemble(&meta(4), 0, vec![Some(vec![0; 2]), None])
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_tolerance() {
        let lenient = FileAssembler::new(1024, false);
        assert!(lenient.check_size(10_000, 9_500).is_ok());
        assert!(matches!(
            lenient.check_size(10_000, 8_000),
            Err(Error::SizeMismatch { expected: 10_000, actual: 8_000 })
        ));

        let strict = FileAssembler::new(1024, true);
        assert!(strict.check_size(10_000, 9_999).is_err());
        assert!(strict.check_size(10_000, 10_000).is_ok());
    }

    #[test]
    fn test_resumed_assembly_covers_tail_only() {
        let assembler = FileAssembler::new(0, true);
        let data = assembler
            .assemble(&meta(10), 6, vec![Some(vec![1; 4])])
            .unwrap();
        assert_eq!(data.len(), 4);
    }
}
