#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

pub const SCAN_PAGE_SIZE_MAX: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingServiceConfig {
    pub scan_page_size: usize,
    pub store_path: PathBuf,
}

impl MappingServiceConfig {
    pub fn mvp_v1() -> Self {
        Self {
            scan_page_size: 256,
            store_path: default_store_path(|key| env::var(key).ok()),
        }
    }

    pub fn from_env() -> Result<Self, String> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    /// Reads `IDMAP_SCAN_PAGE_SIZE` and `IDMAP_STORE_PATH` through `env_getter`.
    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let scan_page_size = match trimmed(env_getter("IDMAP_SCAN_PAGE_SIZE")) {
            Some(raw) => {
                let v = raw
                    .parse::<usize>()
                    .map_err(|_| format!("IDMAP_SCAN_PAGE_SIZE must be an integer, got '{raw}'"))?;
                if v == 0 || v > SCAN_PAGE_SIZE_MAX {
                    return Err(format!(
                        "IDMAP_SCAN_PAGE_SIZE must be within 1..={SCAN_PAGE_SIZE_MAX}, got {v}"
                    ));
                }
                v
            }
            None => 256,
        };
        let store_path = match trimmed(env_getter("IDMAP_STORE_PATH")) {
            Some(raw) => PathBuf::from(raw),
            None => default_store_path(&mut env_getter),
        };
        Ok(Self {
            scan_page_size,
            store_path,
        })
    }
}

impl MappingServiceConfig {
    /// Audit journal kept beside the mapping journal: `pairs.jsonl` -> `pairs.audit.jsonl`.
    pub fn audit_path(&self) -> PathBuf {
        self.store_path.with_extension("audit.jsonl")
    }
}

fn trimmed(v: Option<String>) -> Option<String> {
    v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn default_store_path<F>(mut env_getter: F) -> PathBuf
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(home) = trimmed(env_getter("HOME")) {
        return PathBuf::from(home).join(".idmap/non_association.jsonl");
    }
    env::temp_dir().join("idmap/non_association.jsonl")
}
