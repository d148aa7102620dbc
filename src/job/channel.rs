//! Channel Classifier
//!
//! Turns a raw file entry into a typed channel: resolves the device's
//! access set, parses the path, and picks a content type.

use crate::error::{Error, Result};
use crate::path::{has_control_chars, parse_location};

use super::{device_access, Access, Channel, FileDef};

/// Classify one file entry for the named node.
///
/// Unknown devices come back with empty access and are left for the
/// planner to resolve against the configured system-image devices.
pub fn classify_channel(
    file: &FileDef,
    node_name: &str,
    default_content_type: &str,
) -> Result<Channel> {
    let device = file
        .device
        .as_deref()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| {
            Error::ConfigParse(format!("Must specify device for file in {}", node_name))
        })?;
    if has_control_chars(device) {
        return Err(Error::ConfigParse(format!(
            "Bad device name: {} in {}",
            device, node_name
        )));
    }
    let access = device_access(device).unwrap_or(Access::NONE);
    let path = parse_location(file.path.as_deref())?;
    let content_type = match &file.content_type {
        Some(ct) => ct.clone(),
        None if path.is_some() => default_content_type.to_string(),
        None => "text/html".to_string(),
    };
    if access.is_readable() {
        if let Some(loc) = &path {
            let storage = loc.as_storage().ok_or_else(|| {
                Error::ConfigParse("Readable device must be a stored object".to_string())
            })?;
            if storage.account.is_empty() || storage.container.is_empty() {
                return Err(Error::ConfigParse(format!(
                    "Invalid path {} in {}",
                    loc.url(),
                    node_name
                )));
            }
        }
    }
    Ok(Channel {
        device: device.to_string(),
        access,
        path,
        content_type,
        meta: file.meta.clone().unwrap_or_default(),
        mode: file.mode.clone(),
        removable: "no".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(device: &str, path: Option<&str>) -> FileDef {
        FileDef {
            device: Some(device.to_string()),
            path: path.map(String::from),
            mode: None,
            meta: None,
            content_type: None,
        }
    }

    #[test]
    fn test_classify_read_channel() {
        let ch = classify_channel(
            &file("input", Some("swift://acc/data/x")),
            "a",
            "application/octet-stream",
        )
        .unwrap();
        assert!(ch.access.is_readable());
        assert_eq!(ch.content_type, "application/octet-stream");
        assert_eq!(ch.path.unwrap().as_storage().unwrap().object, "x");
    }

    #[test]
    fn test_classify_pathless_channel_gets_html_type() {
        let ch = classify_channel(&file("stdout", None), "a", "application/octet-stream").unwrap();
        assert!(ch.access.is_writable());
        assert_eq!(ch.content_type, "text/html");
        assert!(ch.path.is_none());
    }

    #[test]
    fn test_classify_explicit_content_type_wins() {
        let mut f = file("stdout", None);
        f.content_type = Some("text/plain".to_string());
        let ch = classify_channel(&f, "a", "application/octet-stream").unwrap();
        assert_eq!(ch.content_type, "text/plain");
    }

    #[test]
    fn test_classify_unknown_device_passes_through() {
        let ch = classify_channel(&file("python", None), "a", "application/octet-stream").unwrap();
        assert!(ch.access.is_unknown());
    }

    #[test]
    fn test_classify_rejects_readable_non_storage_path() {
        let err = classify_channel(
            &file("input", Some("http://host/file")),
            "a",
            "application/octet-stream",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_classify_rejects_readable_container_less_path() {
        let err = classify_channel(
            &file("input", Some("swift://acc")),
            "a",
            "application/octet-stream",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_classify_rejects_control_chars_in_device() {
        let err = classify_channel(&file("std\x01in", None), "a", "application/octet-stream")
            .unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_classify_missing_device() {
        let f = FileDef::default();
        assert!(classify_channel(&f, "a", "application/octet-stream").is_err());
    }
}
