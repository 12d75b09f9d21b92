//! Whole-document JSON persistence.
//!
//! Documents are rewritten in full on every mutation: serialized to a sibling
//! temp file and renamed over the target so a crash never leaves half a file.
//! Reads never fail; a missing or corrupt document yields `None` and a warning.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Reads and parses a JSON document, degrading to `None` on any problem.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no document yet");
            return None;
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read document; starting empty");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "malformed document; starting empty");
            None
        }
    }
}

/// Serializes `value` as pretty JSON and atomically replaces `path`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|err| Error::json(path, err))?;
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp).map_err(|err| Error::io(&tmp, err))?;
        file.write_all(&body).map_err(|err| Error::io(&tmp, err))?;
        file.write_all(b"\n").map_err(|err| Error::io(&tmp, err))?;
        file.sync_all().map_err(|err| Error::io(&tmp, err))?;
    }
    fs::rename(&tmp, path).map_err(|err| Error::io(path, err))
}

/// Copies the current document to `<path>.backup`, if there is one.
pub fn backup(path: &Path) -> Result<Option<PathBuf>> {
    if !path.is_file() {
        return Ok(None);
    }
    let target = backup_path(path);
    fs::copy(path, &target).map_err(|err| Error::io(&target, err))?;
    Ok(Some(target))
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Serde adapter for timestamps written either as RFC 3339 or as naive local
/// ISO-8601 (as older documents did).
pub mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => serializer.serialize_str(&value.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        // Unparseable values are dropped rather than failing the whole document.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            Ok(raw.as_deref().and_then(super::parse))
        }
    }
}
