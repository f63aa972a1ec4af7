//! Downloaded revisions of a resource and their on-disk body files.
//!
//! A revision row holds either an error record or HTTP response metadata.
//! Successful revisions also own a body file under `revisions/`: one file
//! per revision in major version 2, or an entry in a zip pack of 16
//! revisions in major version 3.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crystal_common::{http_date, mime};

use crate::error::{CrystalError, Result};
use crate::model::resource::ResourceId;

pub type RevisionId = i64;

/// Highest revision id the 15-hex-digit path encoding can store.
pub const MAX_REVISION_ID: i64 = (1 << 60) - 1;

/// Directory holding revision bodies, relative to the project root.
pub(crate) const REVISIONS_DIRNAME: &str = "revisions";

/// HTTP response metadata persisted with a successful revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionMetadata {
    /// 10 for HTTP/1.0, 11 for HTTP/1.1, 20 for HTTP/2.
    pub http_version: u32,
    pub status_code: u16,
    pub reason_phrase: String,
    /// Ordered (name, value) pairs, duplicates allowed.
    pub headers: Vec<(String, String)>,
}

impl RevisionMetadata {
    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every occurrence of a header with a single new value,
    /// appended at the end.
    pub fn replace_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }
}

/// An error record persisted with a failed download attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl PersistedError {
    pub fn from_error(error: &CrystalError) -> PersistedError {
        PersistedError {
            kind: error.kind_name().to_string(),
            message: error.to_string(),
        }
    }
}

/// One download attempt of a resource. Immutable once written, apart from
/// the narrow metadata repair path.
#[derive(Debug, Clone)]
pub struct ResourceRevision {
    pub id: RevisionId,
    pub resource_id: ResourceId,
    /// The resource's URL, carried for content-type sniffing and link joining.
    pub resource_url: String,
    pub request_cookie: Option<String>,
    pub error: Option<PersistedError>,
    pub metadata: Option<RevisionMetadata>,
}

impl ResourceRevision {
    pub(crate) fn from_row(row: &crate::store::RevisionRow, resource_url: String) -> Result<Self> {
        let error: Option<PersistedError> =
            serde_json::from_str(&row.error).map_err(|e| CrystalError::Other(e.into()))?;
        let metadata: Option<RevisionMetadata> =
            serde_json::from_str(&row.metadata).map_err(|e| CrystalError::Other(e.into()))?;
        Ok(ResourceRevision {
            id: row.id,
            resource_id: row.resource_id,
            resource_url,
            request_cookie: row.request_cookie.clone(),
            error,
            metadata,
        })
    }

    pub(crate) fn encode_error(error: Option<&PersistedError>) -> String {
        serde_json::to_string(&error).expect("error record serializes")
    }

    pub(crate) fn encode_metadata(metadata: Option<&RevisionMetadata>) -> String {
        serde_json::to_string(&metadata).expect("metadata serializes")
    }

    // === Metadata ===

    /// Whether this revision was fetched over HTTP. HTTP fetches are
    /// presently the only ones with metadata.
    pub fn is_http(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.metadata.as_ref().map(|m| m.status_code)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status_code(), Some(code) if (300..400).contains(&code))
    }

    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.metadata.as_ref()?.first_header(name)
    }

    /// The target of this revision's redirect, if it is one.
    pub fn redirect_url(&self) -> Option<&str> {
        if self.is_redirect() {
            self.first_header("location")
        } else {
            None
        }
    }

    /// `"301 Moved Permanently"`, for labeling synthetic redirect links.
    pub fn redirect_title(&self) -> Option<String> {
        let metadata = self.metadata.as_ref()?;
        if self.is_redirect() {
            Some(format!("{} {}", metadata.status_code, metadata.reason_phrase))
        } else {
            None
        }
    }

    pub fn declared_content_type_with_options(&self) -> Option<&str> {
        self.first_header("content-type")
    }

    pub fn declared_content_type(&self) -> Option<String> {
        self.declared_content_type_with_options()
            .map(|h| mime::parse_content_type(h).0)
    }

    pub fn declared_charset(&self) -> Option<String> {
        mime::parse_content_type(self.declared_content_type_with_options()?).1
    }

    /// Declared content type, falling back to URL-extension sniffing for
    /// revisions without HTTP metadata.
    pub fn content_type(&self) -> Option<String> {
        if let Some(declared) = self.declared_content_type() {
            return Some(declared);
        }
        mime::guess_content_type(&self.resource_url).map(str::to_string)
    }

    pub fn is_html(&self) -> bool {
        self.content_type().as_deref().is_some_and(mime::is_html)
    }

    pub fn is_recognized_binary_type(&self) -> bool {
        self.content_type()
            .as_deref()
            .is_some_and(mime::is_recognized_binary_type)
    }

    /// The datetime this revision was generated by the origin server.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        http_date::parse(self.first_header("date")?)
    }

    /// Seconds spent in a proxy cache, from the Age header.
    pub fn age(&self) -> Option<i64> {
        let age: i64 = self.first_header("age")?.parse().ok()?;
        if age < 0 {
            None
        } else {
            Some(age)
        }
    }

    /// Approximate fetch time: Date plus Age.
    pub fn date_plus_age(&self) -> Option<DateTime<Utc>> {
        let date = self.date()?;
        match self.age() {
            Some(age) => Some(date + Duration::seconds(age)),
            None => Some(date),
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.first_header("etag")
    }

    pub fn has_body(&self) -> bool {
        self.error.is_none()
    }

    /// Whether a fresh download should replace this revision.
    pub(crate) fn is_stale(
        &self,
        applicable_cookie: Option<&str>,
        min_fetch_date: Option<DateTime<Utc>>,
    ) -> bool {
        if let Some(cookie) = applicable_cookie {
            if self.request_cookie.as_deref() != Some(cookie) {
                return true;
            }
        }
        if let Some(min_fetch_date) = min_fetch_date {
            if let Some(fetch_date) = self.date_plus_age() {
                if fetch_date <= min_fetch_date {
                    return true;
                }
            }
        }
        false
    }

    // === HTTP 304 ===

    pub fn is_http_304(&self) -> bool {
        self.status_code() == Some(304)
    }

    /// If this revision is an HTTP 304 whose ETag names a known revision of
    /// the same resource, return an unsaved copy of that target revision
    /// with the RFC 7232 §4.1 headers from the 304 overlaid. Otherwise
    /// return a clone of self.
    pub fn resolve_http_304(
        &self,
        revisions_by_etag: &HashMap<String, ResourceRevision>,
    ) -> ResourceRevision {
        if !self.is_http_304() {
            return self.clone();
        }
        let Some(target_etag) = self.etag() else {
            return self.clone();
        };
        let Some(target) = revisions_by_etag.get(target_etag) else {
            return self.clone();
        };

        let mut metadata = target
            .metadata
            .clone()
            .expect("revision with an ETag has metadata");
        for name in ["Cache-Control", "Content-Location", "Date", "ETag", "Expires", "Vary"] {
            if let Some(value) = self.first_header(name) {
                let value = value.to_string();
                metadata.replace_header(name, &value);
            }
        }

        ResourceRevision {
            metadata: Some(metadata),
            ..target.clone()
        }
    }
}

// === Body file paths ===

fn hex_id(id: RevisionId) -> Result<String> {
    if !(0..=MAX_REVISION_ID).contains(&id) {
        return Err(CrystalError::ProjectHasTooManyRevisions(id));
    }
    Ok(format!("{id:015x}"))
}

/// Major version 2: one body file per revision, the 15-hex-digit id split
/// into five path segments.
pub(crate) fn body_filepath_v2(project_path: &Path, id: RevisionId) -> Result<PathBuf> {
    let hex = hex_id(id)?;
    Ok(project_path
        .join(REVISIONS_DIRNAME)
        .join(&hex[0..3])
        .join(&hex[3..6])
        .join(&hex[6..9])
        .join(&hex[9..12])
        .join(&hex[12..15]))
}

/// Major version 3: bodies are packed into zip files of 16 revisions.
/// Revisions sharing the top 14 hex digits share one pack file.
pub(crate) fn pack_filepath_v3(project_path: &Path, id: RevisionId) -> Result<PathBuf> {
    let hex = hex_id(id)?;
    Ok(project_path
        .join(REVISIONS_DIRNAME)
        .join(&hex[0..3])
        .join(&hex[3..6])
        .join(&hex[6..9])
        .join(&hex[9..12])
        .join(format!("{}_.zip", &hex[12..14])))
}

/// Entry name within a version-3 pack: the low 3 hex digits of the id.
pub(crate) fn pack_entry_name(id: RevisionId) -> Result<String> {
    let hex = hex_id(id)?;
    Ok(hex[12..15].to_string())
}

/// Publish a fully-written temporary body file at its final location.
/// The rename (or pack append) is flushed to stable storage.
pub(crate) fn publish_body_file(
    project_path: &Path,
    major_version: u32,
    id: RevisionId,
    tmp: tempfile::NamedTempFile,
) -> Result<()> {
    if major_version >= 3 {
        let pack_path = pack_filepath_v3(project_path, id)?;
        if let Some(parent) = pack_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entry = pack_entry_name(id)?;

        let pack_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&pack_path)?;
        let is_new = pack_file.metadata()?.len() == 0;
        let mut writer = if is_new {
            zip::ZipWriter::new(pack_file)
        } else {
            zip::ZipWriter::new_append(pack_file)
                .map_err(|e| CrystalError::Other(e.into()))?
        };
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer
            .start_file(&entry, options)
            .map_err(|e| CrystalError::Other(e.into()))?;
        let mut body = tmp.reopen()?;
        std::io::copy(&mut body, &mut writer)?;
        let pack_file = writer
            .finish()
            .map_err(|e| CrystalError::Other(e.into()))?;
        pack_file.sync_all()?;
        drop(tmp); // removes the temporary file
    } else {
        let final_path = body_filepath_v2(project_path, id)?;
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = tmp.persist(&final_path).map_err(|e| e.error)?;
        file.sync_all()?;
        // Flush the rename itself, in case the platform's rename is not
        // crash-safe across the containing directory.
        if let Some(parent) = final_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}

/// Read a revision's body bytes.
pub(crate) fn read_body_file(
    project_path: &Path,
    major_version: u32,
    rev: &ResourceRevision,
) -> Result<Vec<u8>> {
    if !rev.has_body() {
        return Err(CrystalError::NoRevisionBody(rev.id));
    }
    if major_version >= 3 {
        let pack_path = pack_filepath_v3(project_path, rev.id)?;
        let pack_file = match File::open(&pack_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CrystalError::RevisionBodyMissing(rev.id));
            }
            Err(e) => return Err(e.into()),
        };
        let mut archive =
            zip::ZipArchive::new(pack_file).map_err(|e| CrystalError::Other(e.into()))?;
        let entry = pack_entry_name(rev.id)?;
        let mut file = match archive.by_name(&entry) {
            Ok(f) => f,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(CrystalError::RevisionBodyMissing(rev.id));
            }
            Err(e) => return Err(CrystalError::Other(e.into())),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    } else {
        let path = body_filepath_v2(project_path, rev.id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CrystalError::RevisionBodyMissing(rev.id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether a revision's body file exists on disk.
pub(crate) fn body_file_exists(
    project_path: &Path,
    major_version: u32,
    id: RevisionId,
) -> Result<bool> {
    if major_version >= 3 {
        let pack_path = pack_filepath_v3(project_path, id)?;
        let Ok(pack_file) = File::open(&pack_path) else {
            return Ok(false);
        };
        let mut archive =
            zip::ZipArchive::new(pack_file).map_err(|e| CrystalError::Other(e.into()))?;
        let exists = archive.by_name(&pack_entry_name(id)?).is_ok();
        Ok(exists)
    } else {
        Ok(body_filepath_v2(project_path, id)?.exists())
    }
}

/// Remove a revision's body from disk. Missing files are fine; the revision
/// may have been partially deleted outside of Crystal.
pub(crate) fn remove_body_file(
    project_path: &Path,
    major_version: u32,
    id: RevisionId,
) -> Result<()> {
    if major_version >= 3 {
        // Pack entries cannot be removed in place; the row deletion alone
        // makes the entry unreachable.
        return Ok(());
    }
    let path = body_filepath_v2(project_path, id)?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
