//! Package verification.
//!
//! A downloaded package is accepted only when all three checks pass, in
//! this order:
//!
//! 1. the file length equals the size declared by the feed
//! 2. the SHA-256 digest matches the expected digest (constant-time compare)
//! 3. the archive carries the entries the platform installer needs
//!
//! For staged (A/B) packages the payload is applied straight out of the
//! archive, so the verifier also reports where `payload.bin` starts and the
//! contents of `payload_properties.txt`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zip::{CompressionMethod, ZipArchive};

use crate::error::VerifyFailure;
use crate::install::InstallMode;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

const PAYLOAD_ENTRY: &str = "payload.bin";
const PAYLOAD_PROPERTIES_ENTRY: &str = "payload_properties.txt";
const LEGACY_UPDATER_ENTRY: &str = "META-INF/com/google/android/update-binary";

/// Location of the staged payload inside the package archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    /// Byte offset of the payload data from the start of the file
    pub offset: u64,
    pub size: u64,
    /// `key=value` lines from the payload properties entry
    pub properties: Vec<String>,
}

/// A package that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPackage {
    pub mode: InstallMode,
    /// Present for staged packages only
    pub payload: Option<PayloadInfo>,
}

/// Checks downloaded packages for integrity and installability.
#[derive(Debug, Default, Clone)]
pub struct PackageVerifier;

impl PackageVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Run the size, digest, and structure checks.
    ///
    /// `expected_sha256` is hex encoded, either case. IO failures while
    /// reading the file are reported as a size mismatch against what could
    /// be read, since the package is unusable either way.
    pub fn verify(
        &self,
        path: &Path,
        expected_size: u64,
        expected_sha256: &str,
        mode: InstallMode,
    ) -> Result<VerifiedPackage, VerifyFailure> {
        self.verify_size(path, expected_size)?;
        self.verify_hash(path, expected_sha256)?;
        let payload = self.check_structure(path, mode)?;

        tracing::info!(path = %path.display(), ?mode, "Package verification complete");
        Ok(VerifiedPackage { mode, payload })
    }

    /// Verify the file length matches the declared size.
    pub fn verify_size(&self, path: &Path, expected_size: u64) -> Result<(), VerifyFailure> {
        let actual = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if actual != expected_size {
            tracing::error!(
                expected = expected_size,
                actual,
                path = %path.display(),
                "Package size mismatch"
            );
            return Err(VerifyFailure::SizeMismatch {
                expected: expected_size,
                actual,
            });
        }
        Ok(())
    }

    /// Verify the SHA-256 digest of the file.
    pub fn verify_hash(&self, path: &Path, expected_sha256: &str) -> Result<(), VerifyFailure> {
        let actual = self.compute_hash(path).map_err(|e| VerifyFailure::HashMismatch {
            expected: expected_sha256.to_ascii_lowercase(),
            actual: format!("unreadable: {}", e),
        })?;

        // A malformed expected digest can never match
        let expected = hex::decode(expected_sha256.trim()).unwrap_or_default();
        if expected.ct_eq(&actual[..]).unwrap_u8() != 1 {
            tracing::error!(
                expected = %expected_sha256,
                actual = %hex::encode(actual),
                path = %path.display(),
                "Package hash mismatch"
            );
            return Err(VerifyFailure::HashMismatch {
                expected: expected_sha256.to_ascii_lowercase(),
                actual: hex::encode(actual),
            });
        }

        tracing::debug!(hash = %hex::encode(actual), path = %path.display(), "Package hash verified");
        Ok(())
    }

    /// Compute SHA-256 hash of a file.
    ///
    /// Reads the file in chunks to handle large files efficiently
    /// without loading the entire file into memory.
    pub fn compute_hash(&self, path: &Path) -> std::io::Result<[u8; 32]> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; HASH_BUFFER_SIZE];

        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize().into())
    }

    /// Check the archive layout for `mode`.
    pub fn check_structure(
        &self,
        path: &Path,
        mode: InstallMode,
    ) -> Result<Option<PayloadInfo>, VerifyFailure> {
        let file = File::open(path).map_err(|e| VerifyFailure::NotAnArchive(e.to_string()))?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;

        match mode {
            InstallMode::Legacy => {
                require_entry(&archive, LEGACY_UPDATER_ENTRY)?;
                Ok(None)
            }
            InstallMode::Staged => {
                require_entry(&archive, PAYLOAD_ENTRY)?;
                require_entry(&archive, PAYLOAD_PROPERTIES_ENTRY)?;

                let (offset, size) = {
                    let payload = archive.by_name(PAYLOAD_ENTRY)?;
                    if payload.compression() != CompressionMethod::Stored {
                        return Err(VerifyFailure::StructureMismatch(format!(
                            "{} must be stored uncompressed",
                            PAYLOAD_ENTRY
                        )));
                    }
                    (payload.data_start(), payload.size())
                };

                let mut text = String::new();
                archive
                    .by_name(PAYLOAD_PROPERTIES_ENTRY)?
                    .read_to_string(&mut text)
                    .map_err(|e| VerifyFailure::StructureMismatch(e.to_string()))?;
                let properties = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();

                Ok(Some(PayloadInfo {
                    offset,
                    size,
                    properties,
                }))
            }
        }
    }
}

fn require_entry<R: Read + std::io::Seek>(
    archive: &ZipArchive<R>,
    name: &str,
) -> Result<(), VerifyFailure> {
    if archive.index_for_name(name).is_none() {
        return Err(VerifyFailure::StructureMismatch(format!(
            "missing entry {}",
            name
        )));
    }
    Ok(())
}
