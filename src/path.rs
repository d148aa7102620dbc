//! Storage and Job Location Model
//!
//! Normalized references used by channels and executables: stored
//! objects, members of packaged images, in-job node endpoints, and
//! opaque URLs.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// URL scheme for stored objects
pub const STORAGE_SCHEME: &str = "swift://";
/// URL scheme for in-job node endpoints
pub const ENDPOINT_SCHEME: &str = "zvm://";
/// URL scheme for packaged-image members
pub const IMAGE_SCHEME: &str = "file://";

/// Reference to a stored object; `object` may be empty or carry `*`
/// wildcards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePath {
    pub account: String,
    pub container: String,
    pub object: String,
}

impl StoragePath {
    /// Build a path from components
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            object: object.into(),
        }
    }

    /// Slash-form path, `/account/container/object`
    pub fn path(&self) -> String {
        let mut out = format!("/{}", self.account);
        if !self.container.is_empty() {
            out.push('/');
            out.push_str(&self.container);
        }
        if !self.object.is_empty() {
            out.push('/');
            out.push_str(&self.object);
        }
        out
    }

    /// URL form, `swift://account/container/object`
    pub fn url(&self) -> String {
        format!("{}{}", STORAGE_SCHEME, &self.path()[1..])
    }

    /// True when container or object carries a `*` wildcard
    pub fn has_wildcard(&self) -> bool {
        self.container.contains('*') || self.object.contains('*')
    }
}

/// Reference to a file inside a packaged image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMember {
    /// Image device name the member lives in
    pub image: String,
    /// Member path inside the image
    pub member: String,
    /// Optional explicit device to mount the image at
    pub device: Option<String>,
}

impl ImageMember {
    /// URL form, `file://image:member`
    pub fn url(&self) -> String {
        match &self.device {
            Some(dev) => format!("{}{},{}:{}", IMAGE_SCHEME, self.image, dev, self.member),
            None => format!("{}{}:{}", IMAGE_SCHEME, self.image, self.member),
        }
    }
}

/// Reference to another node's device inside the same job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Peer node name
    pub node: String,
    /// Device path on the peer, `/dev/...`
    pub device: String,
}

impl NodeEndpoint {
    /// URL form, `zvm://node/device`
    pub fn url(&self) -> String {
        format!("{}{}{}", ENDPOINT_SCHEME, self.node, &self.device[4..])
    }
}

/// A parsed channel or executable location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// Stored object
    Storage(StoragePath),
    /// Member of a packaged image
    Image(ImageMember),
    /// Another node's device
    Endpoint(NodeEndpoint),
    /// Raw URL passed through untouched
    Opaque(String),
}

impl Location {
    /// URL form of the location
    pub fn url(&self) -> String {
        match self {
            Location::Storage(p) => p.url(),
            Location::Image(m) => m.url(),
            Location::Endpoint(e) => e.url(),
            Location::Opaque(u) => u.clone(),
        }
    }

    /// Storage path, if this is a stored object
    pub fn as_storage(&self) -> Option<&StoragePath> {
        match self {
            Location::Storage(p) => Some(p),
            _ => None,
        }
    }

    /// Node endpoint, if this points at another node
    pub fn as_endpoint(&self) -> Option<&NodeEndpoint> {
        match self {
            Location::Endpoint(e) => Some(e),
            _ => None,
        }
    }

    /// Image member, if this lives inside a packaged image
    pub fn as_image(&self) -> Option<&ImageMember> {
        match self {
            Location::Image(m) => Some(m),
            _ => None,
        }
    }

    /// True for stored objects
    pub fn is_storage(&self) -> bool {
        matches!(self, Location::Storage(_))
    }

    /// True for node endpoints
    pub fn is_endpoint(&self) -> bool {
        matches!(self, Location::Endpoint(_))
    }

    /// True for image members
    pub fn is_image(&self) -> bool {
        matches!(self, Location::Image(_))
    }
}

/// True when the string contains ASCII control characters
pub fn has_control_chars(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

/// Parse a location URL; `None` for an absent or empty path.
///
/// Recognized forms:
/// - `swift://account[/container[/object]]` stored object
/// - `zvm://node/device` peer endpoint
/// - `file://image:member` or `file://image,device:member` image member
/// - any other `scheme://...` kept opaque
pub fn parse_location(raw: Option<&str>) -> Result<Option<Location>> {
    let url = match raw {
        Some(u) if !u.is_empty() => u,
        _ => return Ok(None),
    };
    if has_control_chars(url) {
        return Err(Error::ConfigParse(format!(
            "Control characters in path {:?}",
            url
        )));
    }
    if let Some(rest) = url.strip_prefix(STORAGE_SCHEME) {
        let mut parts = rest.splitn(3, '/');
        let account = parts.next().unwrap_or_default();
        if account.is_empty() {
            return Err(Error::ConfigParse(format!("Invalid path {}", url)));
        }
        let container = parts.next().unwrap_or_default();
        let object = parts.next().unwrap_or_default();
        return Ok(Some(Location::Storage(StoragePath::new(
            account, container, object,
        ))));
    }
    if let Some(rest) = url.strip_prefix(ENDPOINT_SCHEME) {
        let (node, device) = rest
            .split_once('/')
            .ok_or_else(|| Error::ConfigParse(format!("Invalid path {}", url)))?;
        if node.is_empty() || device.is_empty() {
            return Err(Error::ConfigParse(format!("Invalid path {}", url)));
        }
        return Ok(Some(Location::Endpoint(NodeEndpoint {
            node: node.to_string(),
            device: format!("/dev/{}", device),
        })));
    }
    if let Some(rest) = url.strip_prefix(IMAGE_SCHEME) {
        let (image_part, member) = rest
            .split_once(':')
            .ok_or_else(|| Error::ConfigParse(format!("Invalid path {}", url)))?;
        if image_part.is_empty() || member.is_empty() {
            return Err(Error::ConfigParse(format!("Invalid path {}", url)));
        }
        let (image, device) = match image_part.split_once(',') {
            Some((img, dev)) => (img.to_string(), Some(dev.to_string())),
            None => (image_part.to_string(), None),
        };
        return Ok(Some(Location::Image(ImageMember {
            image,
            member: member.to_string(),
            device,
        })));
    }
    if url.contains("://") {
        return Ok(Some(Location::Opaque(url.to_string())));
    }
    Err(Error::ConfigParse(format!("Invalid path {}", url)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_path() {
        let loc = parse_location(Some("swift://acc/cont/dir/obj"))
            .unwrap()
            .unwrap();
        let path = loc.as_storage().unwrap();
        assert_eq!(path.account, "acc");
        assert_eq!(path.container, "cont");
        assert_eq!(path.object, "dir/obj");
        assert_eq!(path.path(), "/acc/cont/dir/obj");
        assert_eq!(loc.url(), "swift://acc/cont/dir/obj");
    }

    #[test]
    fn test_parse_storage_path_partial() {
        let loc = parse_location(Some("swift://acc")).unwrap().unwrap();
        let path = loc.as_storage().unwrap();
        assert_eq!(path.account, "acc");
        assert!(path.container.is_empty());
        assert!(path.object.is_empty());
        assert_eq!(path.path(), "/acc");
    }

    #[test]
    fn test_parse_endpoint() {
        let loc = parse_location(Some("zvm://dst/Y")).unwrap().unwrap();
        let ep = loc.as_endpoint().unwrap();
        assert_eq!(ep.node, "dst");
        assert_eq!(ep.device, "/dev/Y");
    }

    #[test]
    fn test_parse_image_member() {
        let loc = parse_location(Some("file://python:usr/bin/python"))
            .unwrap()
            .unwrap();
        let member = loc.as_image().unwrap();
        assert_eq!(member.image, "python");
        assert_eq!(member.member, "usr/bin/python");
        assert!(member.device.is_none());

        let loc = parse_location(Some("file://python,py:usr/bin/python"))
            .unwrap()
            .unwrap();
        let member = loc.as_image().unwrap();
        assert_eq!(member.device.as_deref(), Some("py"));
    }

    #[test]
    fn test_parse_opaque_and_absent() {
        let loc = parse_location(Some("http://host/file")).unwrap().unwrap();
        assert_eq!(loc.url(), "http://host/file");
        assert!(parse_location(None).unwrap().is_none());
        assert!(parse_location(Some("")).unwrap().is_none());
    }

    #[test]
    fn test_reject_control_chars() {
        assert!(parse_location(Some("swift://acc/c\x07ont/obj")).is_err());
    }

    #[test]
    fn test_reject_schemeless() {
        assert!(parse_location(Some("just/a/path")).is_err());
    }

    #[test]
    fn test_wildcard_detection() {
        let path = StoragePath::new("acc", "c*", "obj");
        assert!(path.has_wildcard());
        let path = StoragePath::new("acc", "cont", "part*");
        assert!(path.has_wildcard());
        let path = StoragePath::new("acc", "cont", "obj");
        assert!(!path.has_wildcard());
    }
}
