//! Job Config Templates
//!
//! Built-in templates turn a bare executable or script into a one-node
//! job; registry templates stored under the `.zvm` container map object
//! content types to "open with" configs. Placeholders: `{.key}`
//! substitutes a parameter, `{.key=default}` supplies a default,
//! `{.object_path}` is the target object URL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::StreamExt;
use regex::Regex;

use crate::error::{Error, Result};
use crate::storage::StorageBackend;

/// One-node config for a shebang script posted at an object URL
pub const OBJECT_SCRIPT_TEMPLATE: &str = r#"[{
    "name": "script",
    "exec": {"path": "{.exe_path}", "args": "{.args}"},
    "file_list": [
        {"device": "input", "path": "{.object_path}"},
        {"device": "stdout", "content_type": "text/plain"},
        {"device": "stderr"}
    ]
}]"#;

/// One-node config for a shebang script posted at an account URL
pub const ACCOUNT_SCRIPT_TEMPLATE: &str = r#"[{
    "name": "script",
    "exec": {"path": "{.exe_path}", "args": "{.args}"},
    "file_list": [
        {"device": "stdout", "content_type": "text/plain"},
        {"device": "stderr"}
    ]
}]"#;

/// One-node config for opening a stored executable directly
pub const DEFAULT_EXE_TEMPLATE: &str = r#"[{
    "name": "executable",
    "exec": {"path": "{.object_path}", "args": "{.args}"},
    "file_list": [
        {"device": "stdout", "content_type": "{.content_type=text/plain}"}
    ]
}]"#;

/// Expand a template with request parameters and the target object URL
pub fn expand_template(
    params: &HashMap<String, String>,
    template: &str,
    object_url: &str,
) -> String {
    let mut config = template.to_string();
    for (key, value) in params {
        if key == "object_path" {
            continue;
        }
        let pattern = format!(r"\{{\.{}(|=[^}}]+)\}}", regex::escape(key));
        if let Ok(re) = Regex::new(&pattern) {
            config = re
                .replace_all(&config, regex::NoExpand(value.as_str()))
                .into_owned();
        }
    }
    config = config.replace("{.object_path}", object_url);
    // unresolved placeholders collapse to their defaults
    let defaults = Regex::new(r"\{\.[^=}]+=?([^}]*)\}").unwrap();
    defaults.replace_all(&config, "$1").into_owned()
}

/// Pluggable key/value cache with TTL for registry templates; kept
/// injectable so tests stay hermetic
pub trait TemplateCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String, ttl: Duration);
}

/// Process-local cache used by default
#[derive(Default)]
pub struct MemoryTemplateCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl TemplateCache for MemoryTemplateCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }
}

/// Fetch the registry template for a content type, consulting the
/// cache first. `None` when no template is registered.
pub async fn content_type_template(
    storage: &dyn StorageBackend,
    cache: &dyn TemplateCache,
    account: &str,
    registry_container: &str,
    content_type: &str,
    max_size: usize,
    ttl: Duration,
) -> Result<Option<String>> {
    let config_path = format!("/{}/{}/{}/config", account, registry_container, content_type);
    let cache_key = format!("zvmconf{}", config_path);
    if let Some(template) = cache.get(&cache_key) {
        return Ok(Some(template));
    }
    let response = match storage.get_object(&config_path, false, false).await {
        Ok(response) if response.status == 200 => response,
        Ok(_) | Err(_) => return Ok(None),
    };
    let mut template = String::new();
    let mut body = response.body;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if template.len() + chunk.len() > max_size {
            return Err(Error::TemplateTooLarge {
                path: config_path,
            });
        }
        template.push_str(&String::from_utf8_lossy(&chunk));
    }
    cache.set(&cache_key, template.clone(), ttl);
    Ok(Some(template))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_substitutes_params() {
        let params = HashMap::from([("args".to_string(), "-u".to_string())]);
        let config = expand_template(
            &params,
            OBJECT_SCRIPT_TEMPLATE
                .replace("{.exe_path}", "swift://acc/bin/py.nexe")
                .as_str(),
            "swift://acc/cont/obj",
        );
        assert!(config.contains(r#""args": "-u""#));
        assert!(config.contains(r#""path": "swift://acc/cont/obj""#));
        assert!(!config.contains("{."));
    }

    #[test]
    fn test_expand_applies_defaults() {
        let config = expand_template(&HashMap::new(), DEFAULT_EXE_TEMPLATE, "swift://a/c/o");
        assert!(config.contains(r#""content_type": "text/plain""#));
        // parameterless placeholders collapse to empty
        assert!(config.contains(r#""args": """#));
    }

    #[test]
    fn test_expand_param_overrides_default() {
        let params = HashMap::from([("content_type".to_string(), "text/csv".to_string())]);
        let config = expand_template(&params, DEFAULT_EXE_TEMPLATE, "swift://a/c/o");
        assert!(config.contains(r#""content_type": "text/csv""#));
    }

    #[test]
    fn test_memory_cache_expires() {
        let cache = MemoryTemplateCache::default();
        cache.set("k", "v".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        cache.set("k2", "v2".to_string(), Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("k2").is_none());
    }

    #[test]
    fn test_templates_are_valid_json_after_expansion() {
        for template in [
            OBJECT_SCRIPT_TEMPLATE,
            ACCOUNT_SCRIPT_TEMPLATE,
            DEFAULT_EXE_TEMPLATE,
        ] {
            let params = HashMap::from([(
                "exe_path".to_string(),
                "swift://acc/bin/x.nexe".to_string(),
            )]);
            let config = expand_template(&params, template, "swift://a/c/o");
            let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
            assert!(parsed.is_array());
        }
    }
}
