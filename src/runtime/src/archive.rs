//! Stemcell archive extraction.
//!
//! A stemcell is a gzip-compressed tarball with two members:
//!
//! ```text
//! stemcell.tgz
//! ├── stemcell.MF   (YAML manifest)
//! └── image         (raw machine image)
//! ```

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde_yaml::{Mapping, Value};
use stemcell_core::error::{Result, StemcellError};
use tar::Archive;
use tempfile::TempDir;

/// Manifest member name inside the tarball.
pub const MANIFEST_FILE: &str = "stemcell.MF";

/// Image member name inside the tarball.
pub const IMAGE_FILE: &str = "image";

/// An extracted stemcell.
///
/// The image lives in a private temporary directory that is removed
/// when the archive is dropped.
#[derive(Debug)]
pub struct StemcellArchive {
    pub name: String,
    pub version: String,
    pub operating_system: Option<String>,
    /// Formats declared by `stemcell_formats`; `None` when absent
    pub formats: Option<BTreeSet<String>>,
    pub cloud_properties: serde_json::Map<String, serde_json::Value>,
    /// Digest embedded in the manifest (`sha1`)
    pub embedded_digest: Option<String>,
    pub api_version: Option<u32>,
    image_path: PathBuf,
    workdir: TempDir,
}

impl StemcellArchive {
    /// Extract a stemcell tarball into a fresh directory under `tmp_root`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArchive` if:
    /// - The tarball cannot be opened, decompressed or unpacked
    /// - A member is a link or special file
    /// - `stemcell.MF` or `image` is missing
    /// - The manifest lacks `name`, `version` or `cloud_properties`
    pub fn extract(archive_path: &Path, tmp_root: &Path) -> Result<Self> {
        if !archive_path.exists() {
            return Err(StemcellError::InvalidArchive(format!(
                "stemcell archive not found: {}",
                archive_path.display()
            )));
        }

        std::fs::create_dir_all(tmp_root).map_err(|e| {
            StemcellError::Other(format!(
                "Failed to create temp directory {}: {}",
                tmp_root.display(),
                e
            ))
        })?;
        let workdir = tempfile::Builder::new()
            .prefix("stemcell")
            .tempdir_in(tmp_root)?;

        let file = File::open(archive_path).map_err(|e| {
            StemcellError::InvalidArchive(format!(
                "failed to open {}: {}",
                archive_path.display(),
                e
            ))
        })?;

        let extract_error = |e: std::io::Error| {
            StemcellError::InvalidArchive(format!(
                "failed to extract {}: {}",
                archive_path.display(),
                e
            ))
        };

        // Only regular files and directories are unpacked
        let mut archive = Archive::new(GzDecoder::new(file));
        for entry in archive.entries().map_err(extract_error)? {
            let mut entry = entry.map_err(extract_error)?;
            let kind = entry.header().entry_type();
            if kind.is_pax_global_extensions() || kind.is_pax_local_extensions() {
                continue;
            }
            if !kind.is_file() && !kind.is_dir() {
                let member = entry
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                return Err(StemcellError::InvalidArchive(format!(
                    "unsupported member '{}' ({:?}) in {}",
                    member,
                    kind,
                    archive_path.display()
                )));
            }
            entry.unpack_in(workdir.path()).map_err(extract_error)?;
        }

        let manifest_path = workdir.path().join(MANIFEST_FILE);
        let image_path = workdir.path().join(IMAGE_FILE);
        if !is_regular_file(&manifest_path) {
            return Err(StemcellError::InvalidArchive(format!(
                "{} not found in archive",
                MANIFEST_FILE
            )));
        }
        if !is_regular_file(&image_path) {
            return Err(StemcellError::InvalidArchive(format!(
                "{} not found in archive",
                IMAGE_FILE
            )));
        }

        let data = std::fs::read_to_string(&manifest_path).map_err(|e| {
            StemcellError::InvalidArchive(format!("failed to read {}: {}", MANIFEST_FILE, e))
        })?;
        let manifest = StemcellManifest::parse(&data)?;

        tracing::debug!(
            archive = %archive_path.display(),
            name = %manifest.name,
            version = %manifest.version,
            "Extracted stemcell archive"
        );

        Ok(Self {
            name: manifest.name,
            version: manifest.version,
            operating_system: manifest.operating_system,
            formats: manifest.formats,
            cloud_properties: manifest.cloud_properties,
            embedded_digest: manifest.sha1,
            api_version: manifest.api_version,
            image_path,
            workdir,
        })
    }

    /// Path to the extracted image blob.
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Directory holding the extracted members.
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

/// Parsed `stemcell.MF`.
#[derive(Debug)]
struct StemcellManifest {
    name: String,
    version: String,
    operating_system: Option<String>,
    formats: Option<BTreeSet<String>>,
    cloud_properties: serde_json::Map<String, serde_json::Value>,
    sha1: Option<String>,
    api_version: Option<u32>,
}

impl StemcellManifest {
    fn parse(data: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(data).map_err(|e| {
            StemcellError::InvalidArchive(format!("{} is not valid YAML: {}", MANIFEST_FILE, e))
        })?;
        let Value::Mapping(map) = doc else {
            return Err(StemcellError::InvalidArchive(format!(
                "{} must be a mapping",
                MANIFEST_FILE
            )));
        };

        let name = required_string(&map, "name")?;
        let version = match map.get("version") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return Err(invalid_field("version", "a string or number")),
            None => return Err(missing_field("version")),
        };

        let cloud_properties = match map.get("cloud_properties") {
            Some(value @ Value::Mapping(_)) => match serde_json::to_value(value) {
                Ok(serde_json::Value::Object(props)) => props,
                _ => return Err(invalid_field("cloud_properties", "a mapping with string keys")),
            },
            Some(Value::Null) | None => return Err(missing_field("cloud_properties")),
            Some(_) => return Err(invalid_field("cloud_properties", "a mapping")),
        };

        let operating_system = optional_string(&map, "operating_system")?;
        let sha1 = optional_string(&map, "sha1")?;

        let formats = match map.get("stemcell_formats") {
            None | Some(Value::Null) => None,
            Some(Value::Sequence(items)) => {
                let mut formats = BTreeSet::new();
                for item in items {
                    match item.as_str() {
                        Some(format) => {
                            formats.insert(format.to_string());
                        }
                        None => return Err(invalid_field("stemcell_formats", "a list of strings")),
                    }
                }
                Some(formats)
            }
            Some(_) => return Err(invalid_field("stemcell_formats", "a list of strings")),
        };

        let api_version = match map.get("api_version") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_u64().and_then(|v| u32::try_from(v).ok()) {
                Some(v) => Some(v),
                None => return Err(invalid_field("api_version", "a positive integer")),
            },
            Some(_) => return Err(invalid_field("api_version", "an integer")),
        };

        Ok(Self {
            name,
            version,
            operating_system,
            formats,
            cloud_properties,
            sha1,
            api_version,
        })
    }
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_file())
        .unwrap_or(false)
}

fn required_string(map: &Mapping, key: &str) -> Result<String> {
    optional_string(map, key)?.ok_or_else(|| missing_field(key))
}

fn optional_string(map: &Mapping, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid_field(key, "a string")),
    }
}

fn missing_field(key: &str) -> StemcellError {
    StemcellError::InvalidArchive(format!("{} is missing '{}'", MANIFEST_FILE, key))
}

fn invalid_field(key: &str, expected: &str) -> StemcellError {
    StemcellError::InvalidArchive(format!(
        "{} field '{}' must be {}",
        MANIFEST_FILE, key, expected
    ))
}

/// Write a stemcell tarball with the given manifest and image.
#[cfg(test)]
pub(crate) fn write_test_stemcell(path: &Path, manifest: &str, image: &[u8]) {
    write_test_tarball(path, &[(MANIFEST_FILE, manifest.as_bytes()), (IMAGE_FILE, image)]);
}

#[cfg(test)]
pub(crate) fn write_test_tarball(path: &Path, files: &[(&str, &[u8])]) {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::Builder;

    let file = File::create(path).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }

    builder.into_inner().unwrap().finish().unwrap();
}
