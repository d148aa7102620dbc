//! Sandbox Manifest Builder
//!
//! Renders the textual manifest and the companion nvram blob consumed
//! by the sandbox runtime. Formats are bit-level stable; change them
//! only together with the runtime.

use std::collections::HashMap;
use std::io::Write;

use tempfile::NamedTempFile;

use crate::config::{LimitsConfig, ManifestConfig};
use crate::error::{Error, Result};
use crate::job::{channel_type, Channel, Worker, STD_DEVICES};

/// Quotes commas as \x2c for the [env] stanza in the nvram file
pub fn quote_for_env(value: &str) -> String {
    value.replace(',', "\\x2c")
}

/// A stored object living on the worker's own host, bound to one of
/// its channels
pub struct LocalObject<'a> {
    pub channel: &'a Channel,
    pub size: u64,
    pub path_info: String,
}

/// Builds manifests and nvram blobs for planned workers
pub struct ManifestBuilder<'a> {
    manifest: &'a ManifestConfig,
    limits: LimitsConfig,
    sysimage_devices: &'a HashMap<String, String>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(
        manifest: &'a ManifestConfig,
        limits: LimitsConfig,
        sysimage_devices: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            manifest,
            limits,
            sysimage_devices,
        }
    }

    fn is_sysimage(&self, device: &str) -> bool {
        self.sysimage_devices.contains_key(device)
    }

    /// Render the manifest for one worker.
    ///
    /// `lpaths` maps device names to host file paths backing them,
    /// `program` is the executable path (`/dev/null` when booted from
    /// an image), `nvram_path` the path the nvram blob was written to,
    /// `local_device` names the channel bound to a host-local object.
    pub fn build_manifest(
        &self,
        worker: &Worker,
        lpaths: &HashMap<String, String>,
        program: Option<&str>,
        nvram_path: &str,
        local_device: Option<&str>,
    ) -> String {
        let limits = &self.limits;
        let mut out = format!(
            "Version={}\nProgram={}\nTimeout={}\nMemory={},0\n",
            self.manifest.version,
            program.unwrap_or("/dev/null"),
            self.manifest.timeout,
            self.manifest.memory,
        );

        let mut declared: Vec<&str> = Vec::new();
        for ch in &worker.channels {
            let ctype = match channel_type(&ch.device, self.is_sysimage(&ch.device)) {
                Some(t) => t,
                None => continue,
            };
            let lpath = lpaths
                .get(&ch.device)
                .map(|s| s.as_str())
                .unwrap_or("/dev/null");
            if ch.access.is_readable() {
                out.push_str(&format!(
                    "Channel={},/dev/{},{},0,{},{},0,0\n",
                    lpath, ch.device, ctype, limits.reads, limits.rbytes
                ));
            } else if ch.access.is_cdr() {
                out.push_str(&format!(
                    "Channel={},/dev/{},{},0,{},{},{},{}\n",
                    lpath, ch.device, ctype, limits.reads, limits.rbytes, limits.writes,
                    limits.wbytes
                ));
            } else if ch.access.is_writable() {
                let local = local_device.map(|d| d == ch.device).unwrap_or(false);
                let tag = if ch.path.is_none() || local { "1" } else { "0" };
                out.push_str(&format!(
                    "Channel={},/dev/{},{},{},0,0,{},{}\n",
                    lpath, ch.device, ctype, tag, limits.writes, limits.wbytes
                ));
            } else if ch.access.is_network() {
                out.push_str(&format!(
                    "Channel={},/dev/{},{},0,0,0,{},{}\n",
                    lpath, ch.device, ctype, limits.writes, limits.wbytes
                ));
            }
            declared.push(&ch.device);
        }

        // inter-node channels arrive pre-rendered as connect strings
        let mut network_devices: Vec<String> = Vec::new();
        for conn in worker.connect.iter().chain(worker.bind.iter()) {
            out.push_str(&format!("Channel={}\n", conn));
            if let Some(dev) = conn.splitn(3, ',').nth(1) {
                let dev = dev.trim_start_matches("/dev/");
                if STD_DEVICES.contains(&dev) {
                    network_devices.push(dev.to_string());
                }
            }
        }

        for dev in STD_DEVICES {
            if declared.contains(&dev) || network_devices.iter().any(|d| d == dev) {
                continue;
            }
            if dev == "stdin" {
                out.push_str(&format!(
                    "Channel=/dev/null,/dev/stdin,0,0,{},{},0,0\n",
                    limits.reads, limits.rbytes
                ));
            } else {
                out.push_str(&format!(
                    "Channel=/dev/null,/dev/{},0,0,0,0,{},{}\n",
                    dev, limits.writes, limits.wbytes
                ));
            }
        }

        if self.manifest.use_dev_self {
            if let Some(program) = program {
                out.push_str(&format!(
                    "Channel={},/dev/self,3,0,{},{},0,0\n",
                    program, limits.reads, limits.rbytes
                ));
            }
        }

        out.push_str(&format!(
            "Channel={},/dev/nvram,3,0,{},{},0,0\n",
            nvram_path, limits.reads, limits.rbytes
        ));
        out.push_str(&format!("Node={}\n", worker.id));
        if let Some(ns) = &worker.name_service {
            out.push_str(&format!("NameServer={}\n", ns));
        }
        out
    }

    /// Render the nvram blob: fstab, args, env and device-mode mapping
    pub fn build_nvram(&self, worker: &Worker, local_object: Option<&LocalObject>) -> String {
        let mut fstab = String::new();
        for ch in &worker.channels {
            if self.is_sysimage(&ch.device) {
                fstab.push_str(&format!(
                    "channel=/dev/{}, mountpoint=/, access=ro, removable=no\n",
                    ch.device
                ));
            } else if ch.device == "image" && ch.access.is_cdr() {
                fstab.push_str(&format!(
                    "channel=/dev/image, mountpoint=/, access=ro, removable={}\n",
                    ch.removable
                ));
            }
        }
        let mut out = String::new();
        if !fstab.is_empty() {
            out.push_str("[fstab]\n");
            out.push_str(&fstab);
        }

        out.push_str("[args]\nargs = ");
        out.push_str(&worker.name);
        if let Some(args) = &worker.args {
            out.push(' ');
            out.push_str(args);
        }
        out.push('\n');

        if worker.env.is_some() || local_object.is_some() {
            out.push_str("[env]\n");
            if let Some(local) = local_object {
                self.push_local_object_env(&mut out, local);
            }
            if let Some(env) = &worker.env {
                let mut keys: Vec<&String> = env.keys().collect();
                keys.sort();
                for key in keys {
                    let value = &env[key];
                    if value.is_empty() {
                        continue;
                    }
                    push_env(&mut out, key, value);
                }
            }
        }

        let mut mapping = String::new();
        for ch in &worker.channels {
            if let Some(mode) = &ch.mode {
                mapping.push_str(&format!("channel=/dev/{}, mode={}\n", ch.device, mode));
            }
        }
        if !mapping.is_empty() {
            out.push_str("[mapping]\n");
            out.push_str(&mapping);
        }
        out
    }

    fn push_local_object_env(&self, out: &mut String, local: &LocalObject) {
        let channel = local.channel;
        if channel.access.reads_data() {
            push_env(out, "CONTENT_LENGTH", &local.size.to_string());
            let content_type = channel
                .meta
                .get("Content-Type")
                .map(|s| s.as_str())
                .unwrap_or("application/octet-stream");
            push_env(out, "CONTENT_TYPE", content_type);
            let mut keys: Vec<&String> = channel.meta.keys().collect();
            keys.sort();
            for key in keys {
                let upper = key.to_uppercase();
                let value = &channel.meta[key];
                if upper.starts_with("X-OBJECT-META-") {
                    push_env(out, &format!("HTTP_{}", upper.replace('-', "_")), value);
                    continue;
                }
                for hdr in ["X-TIMESTAMP", "ETAG", "CONTENT-ENCODING"] {
                    if upper.contains(hdr) {
                        push_env(out, &format!("HTTP_{}", upper.replace('-', "_")), value);
                        break;
                    }
                }
            }
        } else if channel.access.is_writable() {
            push_env(out, "CONTENT_TYPE", &channel.content_type);
            let mut keys: Vec<&String> = channel.meta.keys().collect();
            keys.sort();
            for key in keys {
                push_env(
                    out,
                    &format!("HTTP_X_OBJECT_META_{}", key.to_uppercase().replace('-', "_")),
                    &channel.meta[key],
                );
            }
        }
        push_env(out, "DOCUMENT_ROOT", &format!("/dev/{}", channel.device));
        push_env(out, "REQUEST_METHOD", "POST");
        push_env(out, "PATH_INFO", &local.path_info);
    }

    /// Write the nvram blob to a scoped temp file; the file is removed
    /// when the returned handle drops
    pub fn write_nvram(
        &self,
        worker: &Worker,
        local_object: Option<&LocalObject>,
    ) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new().map_err(Error::Io)?;
        file.write_all(self.build_nvram(worker, local_object).as_bytes())
            .map_err(Error::Io)?;
        file.flush().map_err(Error::Io)?;
        Ok(file)
    }
}

fn push_env(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!("name={}, value={}\n", name, quote_for_env(value)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Access, NodeSpec};
    use crate::path::parse_location;

    fn worker_with_channels(channels: Vec<Channel>) -> Worker {
        let spec = NodeSpec {
            name: "a".into(),
            exe: parse_location(Some("swift://acc/bin/x.nexe")).unwrap().unwrap(),
            args: Some("-u".into()),
            env: None,
            replicate: 1,
        };
        let mut worker = Worker::from_spec(&spec, 1, "a".into());
        worker.channels = channels;
        worker
    }

    fn channel(device: &str, access: Access, path: Option<&str>) -> Channel {
        Channel {
            device: device.into(),
            access,
            path: path.map(|p| parse_location(Some(p)).unwrap().unwrap()),
            content_type: "application/octet-stream".into(),
            meta: HashMap::new(),
            mode: None,
            removable: "no".into(),
        }
    }

    fn builder<'a>(
        manifest: &'a ManifestConfig,
        sysimages: &'a HashMap<String, String>,
    ) -> ManifestBuilder<'a> {
        ManifestBuilder::new(manifest, LimitsConfig::default(), sysimages)
    }

    #[test]
    fn test_quote_for_env() {
        assert_eq!(quote_for_env("a,b,c"), "a\\x2cb\\x2cc");
        assert_eq!(quote_for_env("plain"), "plain");
    }

    #[test]
    fn test_manifest_has_one_line_per_device() {
        let manifest_cfg = ManifestConfig::default();
        let sysimages = HashMap::new();
        let builder = builder(&manifest_cfg, &sysimages);
        let worker = worker_with_channels(vec![
            channel(
                "input",
                Access::READ.union(Access::RANDOM),
                Some("swift://acc/data/x"),
            ),
            channel("stdout", Access::WRITE, None),
        ]);
        let mut lpaths = HashMap::new();
        lpaths.insert("input".to_string(), "/srv/objects/x".to_string());
        let text =
            builder.build_manifest(&worker, &lpaths, Some("/srv/prog.nexe"), "/tmp/nvram.1", None);

        assert!(text.starts_with("Version=20130611\nProgram=/srv/prog.nexe\n"));
        assert!(text.contains("Channel=/srv/objects/x,/dev/input,3,0,"));
        // pathless stdout carries the immediate-response tag
        assert!(text.contains(",/dev/stdout,0,1,0,0,"));
        // undeclared std devices default to /dev/null
        assert!(text.contains("Channel=/dev/null,/dev/stdin,0,0,"));
        assert!(text.contains("Channel=/dev/null,/dev/stderr,0,0,0,0,"));
        assert!(text.contains(",/dev/self,3,0,"));
        assert!(text.contains(",/dev/nvram,3,0,"));
        assert!(text.contains("Node=1\n"));
        assert_eq!(text.matches("/dev/stdout").count(), 1);
        assert_eq!(text.matches("/dev/nvram").count(), 1);
    }

    #[test]
    fn test_manifest_renders_network_lines_and_name_server() {
        let manifest_cfg = ManifestConfig::default();
        let sysimages = HashMap::new();
        let builder = builder(&manifest_cfg, &sysimages);
        let mut worker = worker_with_channels(vec![channel("stdout", Access::WRITE, None)]);
        worker.connect = vec!["tcp:2:,/dev/out/b,0,0,0,0,1024,1024".to_string()];
        worker.name_service = Some("udp:10.0.0.1:5353".to_string());
        let text = builder.build_manifest(&worker, &HashMap::new(), None, "/tmp/nvram.1", None);
        assert!(text.contains("Channel=tcp:2:,/dev/out/b,0,0,0,0,1024,1024\n"));
        assert!(text.contains("NameServer=udp:10.0.0.1:5353\n"));
        assert!(text.contains("Program=/dev/null\n"));
        // no /dev/self without a program path
        assert!(!text.contains("/dev/self"));
    }

    #[test]
    fn test_nvram_sections() {
        let manifest_cfg = ManifestConfig::default();
        let mut sysimages = HashMap::new();
        sysimages.insert("python".to_string(), "/opt/python.tar".to_string());
        let builder = builder(&manifest_cfg, &sysimages);
        let mut image = channel("image", Access::CDR, None);
        image.removable = "yes".into();
        let mut sysimage = channel("python", Access::READ.union(Access::RANDOM), None);
        sysimage.mode = Some("ro".into());
        let mut worker = worker_with_channels(vec![sysimage, image]);
        worker.env = Some(HashMap::from([(
            "PYTHONPATH".to_string(),
            "/lib,/usr/lib".to_string(),
        )]));

        let text = builder.build_nvram(&worker, None);
        assert!(text.starts_with("[fstab]\n"));
        assert!(text.contains(
            "channel=/dev/python, mountpoint=/, access=ro, removable=no\n"
        ));
        assert!(text.contains(
            "channel=/dev/image, mountpoint=/, access=ro, removable=yes\n"
        ));
        assert!(text.contains("[args]\nargs = a -u\n"));
        assert!(text.contains("name=PYTHONPATH, value=/lib\\x2c/usr/lib\n"));
        assert!(text.contains("[mapping]\nchannel=/dev/python, mode=ro\n"));
    }

    #[test]
    fn test_nvram_readable_local_object_env() {
        let manifest_cfg = ManifestConfig::default();
        let sysimages = HashMap::new();
        let builder = builder(&manifest_cfg, &sysimages);
        let mut ch = channel(
            "input",
            Access::READ.union(Access::RANDOM),
            Some("swift://acc/data/x"),
        );
        ch.meta = HashMap::from([
            ("X-Object-Meta-Tag".to_string(), "v1,v2".to_string()),
            ("X-Timestamp".to_string(), "123".to_string()),
        ]);
        let worker = worker_with_channels(vec![ch]);
        let local = LocalObject {
            channel: &worker.channels[0],
            size: 42,
            path_info: "/acc/data/x".to_string(),
        };
        let text = builder.build_nvram(&worker, Some(&local));
        assert!(text.contains("name=CONTENT_LENGTH, value=42\n"));
        assert!(text.contains("name=HTTP_X_OBJECT_META_TAG, value=v1\\x2cv2\n"));
        assert!(text.contains("name=HTTP_X_TIMESTAMP, value=123\n"));
        assert!(text.contains("name=DOCUMENT_ROOT, value=/dev/input\n"));
        assert!(text.contains("name=REQUEST_METHOD, value=POST\n"));
        assert!(text.contains("name=PATH_INFO, value=/acc/data/x\n"));
    }

    #[test]
    fn test_nvram_writable_local_object_env() {
        let manifest_cfg = ManifestConfig::default();
        let sysimages = HashMap::new();
        let builder = builder(&manifest_cfg, &sysimages);
        let mut ch = channel(
            "output",
            Access::WRITE.union(Access::RANDOM),
            Some("swift://acc/out/y"),
        );
        ch.content_type = "text/plain".into();
        ch.meta = HashMap::from([("Color".to_string(), "blue".to_string())]);
        let worker = worker_with_channels(vec![ch]);
        let local = LocalObject {
            channel: &worker.channels[0],
            size: 0,
            path_info: "/acc/out/y".to_string(),
        };
        let text = builder.build_nvram(&worker, Some(&local));
        assert!(text.contains("name=CONTENT_TYPE, value=text/plain\n"));
        assert!(text.contains("name=HTTP_X_OBJECT_META_COLOR, value=blue\n"));
        assert!(!text.contains("CONTENT_LENGTH"));
    }

    #[test]
    fn test_write_nvram_releases_file_on_drop() {
        let manifest_cfg = ManifestConfig::default();
        let sysimages = HashMap::new();
        let builder = builder(&manifest_cfg, &sysimages);
        let worker = worker_with_channels(vec![channel("stdout", Access::WRITE, None)]);
        let path = {
            let file = builder.write_nvram(&worker, None).unwrap();
            let path = file.path().to_path_buf();
            assert!(path.exists());
            path
        };
        assert!(!path.exists());
    }
}
