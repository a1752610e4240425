// SPDX-License-Identifier: MIT
//! File family of one MX model run
//!
//! `dir/M-1-0-1.Y.MX1` yields:
//!
//! ```text
//! dir/M-1-0-1.MX2          object index
//! dir/M-1-0-1.Y.MXS        record stream
//! dir/M-1-0-1.Y.ZIP        zipped record streams
//! dir/M-1-0-1.h5           cache container
//! dir/M-1-0-1.h5.metadata  decoding plan sidecar
//! dir/M-1-0-1.Y.vec.h5     snapshot store
//! ```

use std::path::{Component, Path, PathBuf};

use crate::format::SectionType;

const KEY_SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    pub mx1: PathBuf,
    pub mx2: PathBuf,
    pub mxs: PathBuf,
    pub zip: PathBuf,
    pub cache: PathBuf,
    pub sidecar: PathBuf,
    pub store: PathBuf,
    key_prefix: String,
}

impl DatasetPaths {
    pub fn from_mx1(mx1: impl Into<PathBuf>) -> Self {
        let mx1 = mx1.into();
        let dir = mx1.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = mx1
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (base, dotres) = match stem.rfind('.') {
            Some(at) => (stem[..at].to_string(), stem[at..].to_string()),
            None => (stem.clone(), String::new()),
        };

        let sibling = |name: String| dir.join(name);
        Self {
            mx2: sibling(format!("{}.MX2", base)),
            mxs: sibling(format!("{}{}.MXS", base, dotres)),
            zip: sibling(format!("{}{}.ZIP", base, dotres)),
            cache: sibling(format!("{}.h5", base)),
            sidecar: sibling(format!("{}.h5.metadata", base)),
            store: sibling(format!("{}{}.vec.h5", base, dotres)),
            key_prefix: key_prefix(&mx1),
            mx1,
        }
    }

    /// Prefix of the cache's logical keys, e.g. `B1/V0/BZ1/M_1_0_1`
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Logical key of a cache section, e.g. `B1/V0/BZ1/M_1_0_1/MXS`
    pub fn section_key(&self, section: SectionType) -> String {
        format!("{}{}{}", self.key_prefix, KEY_SEPARATOR, section.name())
    }
}

fn key_prefix(mx1: &Path) -> String {
    let relative = std::env::current_dir()
        .ok()
        .and_then(|cwd| mx1.strip_prefix(&cwd).ok().map(Path::to_path_buf))
        .unwrap_or_else(|| mx1.to_path_buf());

    let joined = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string());

    let stripped = if joined.to_ascii_lowercase().ends_with(".mx1") {
        &joined[..joined.len() - 4]
    } else {
        joined.as_str()
    };
    stripped.replace(['-', '.'], "_")
}
