//! Model directory handling
//!
//! Validates model files and resolves which configuration source an
//! engine should be constructed from.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Engine-specific configuration file name
pub const ENGINE_CONFIG_FILE: &str = "llm_config.json";

/// Generic configuration file name
pub const GENERIC_CONFIG_FILE: &str = "config.json";

/// Errors that can occur during model directory operations
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("No model file found in: {0}")]
    NoModelFile(PathBuf),

    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// The configuration source chosen for engine construction.
///
/// Selection order: engine-specific config file, then generic config
/// file, then the bare directory — first existing path wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// An engine-specific `llm_config.json`
    EngineConfig(PathBuf),
    /// A generic `config.json`
    GenericConfig(PathBuf),
    /// No config file present; the directory itself is the source
    BareDirectory(PathBuf),
}

impl ConfigSource {
    /// The path the engine should be pointed at
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::EngineConfig(p)
            | ConfigSource::GenericConfig(p)
            | ConfigSource::BareDirectory(p) => p,
        }
    }

    /// The config file to read overrides from, if the source is a file
    pub fn config_file(&self) -> Option<&Path> {
        match self {
            ConfigSource::EngineConfig(p) | ConfigSource::GenericConfig(p) => Some(p),
            ConfigSource::BareDirectory(_) => None,
        }
    }
}

/// Resolve the configuration source for a model directory.
///
/// Fails only if the directory itself is missing; absent config files
/// just fall through to the next priority.
pub fn resolve_config_source(model_dir: &Path) -> Result<ConfigSource, ModelError> {
    if !model_dir.is_dir() {
        return Err(ModelError::DirectoryNotFound(model_dir.to_path_buf()));
    }

    let engine_config = model_dir.join(ENGINE_CONFIG_FILE);
    if engine_config.is_file() {
        tracing::debug!("Using engine config: {}", engine_config.display());
        return Ok(ConfigSource::EngineConfig(engine_config));
    }

    let generic_config = model_dir.join(GENERIC_CONFIG_FILE);
    if generic_config.is_file() {
        tracing::debug!("Using generic config: {}", generic_config.display());
        return Ok(ConfigSource::GenericConfig(generic_config));
    }

    tracing::debug!("No config file found, using bare directory");
    Ok(ConfigSource::BareDirectory(model_dir.to_path_buf()))
}

/// Find the model weights file in a directory.
///
/// Returns the first `.gguf` file in filename order so repeated runs
/// pick the same file.
pub fn find_model_file(model_dir: &Path) -> Result<PathBuf, ModelError> {
    if !model_dir.is_dir() {
        return Err(ModelError::DirectoryNotFound(model_dir.to_path_buf()));
    }

    let mut candidates = vec![];
    for entry in std::fs::read_dir(model_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("gguf") {
            candidates.push(path);
        }
    }

    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::NoModelFile(model_dir.to_path_buf()))
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
///
/// # Arguments
/// * `path` - Path to the GGUF file
///
/// # Returns
/// * `Ok(GgufMetadata)` - Metadata extracted from valid GGUF file
/// * `Err(ModelError)` - If the file is not a valid GGUF file
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    // Check file size (minimum: magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8) = 24 bytes)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    // Read magic bytes (4 bytes, little-endian)
    let mut magic_bytes = [0u8; 4];
    file.read_exact(&mut magic_bytes)?;
    let magic = u32::from_le_bytes(magic_bytes);

    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // Read version (4 bytes, little-endian)
    let mut version_bytes = [0u8; 4];
    file.read_exact(&mut version_bytes)?;
    let version = u32::from_le_bytes(version_bytes);

    // GGUF v2 and v3 are supported
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    // Read tensor count (8 bytes, little-endian)
    let mut tensor_count_bytes = [0u8; 8];
    file.read_exact(&mut tensor_count_bytes)?;
    let tensor_count = u64::from_le_bytes(tensor_count_bytes);

    // Read metadata kv count (8 bytes, little-endian)
    let mut metadata_kv_count_bytes = [0u8; 8];
    file.read_exact(&mut metadata_kv_count_bytes)?;
    let metadata_kv_count = u64::from_le_bytes(metadata_kv_count_bytes);

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}
