//! Lazy target discovery: filesystem images plus worker-reported components.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::job::string_array;
use crate::target::{ImageKind, Target, TargetClass};
use crate::worker::{self, WorkerConfig};

/// Root inode number of a btrfs subvolume.
const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

/// Where images of a class live, relative to the image root.
fn class_dir(class: TargetClass) -> &'static str {
    match class {
        TargetClass::Machine => "var/lib/machines",
        TargetClass::Portable => "var/lib/portables",
        TargetClass::Sysext => "var/lib/extensions",
        TargetClass::Confext => "var/lib/confexts",
        TargetClass::Host | TargetClass::Component => unreachable!("not an image class"),
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredImage {
    pub name: String,
    pub path: PathBuf,
    pub kind: ImageKind,
}

/// Enumerate images of one class under the image root. A missing class
/// directory means no images; unclassifiable entries are skipped.
pub async fn discover_images(root: &Path, class: TargetClass) -> Result<Vec<DiscoveredImage>> {
    let dir = root.join(class_dir(class));
    let mut images = Vec::new();

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
        Err(e) => return Err(Error::Io(e)),
    };

    while let Some(entry) = entries.next_entry().await.map_err(Error::Io)? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot stat image candidate, skipping");
                continue;
            }
        };

        let file_type = meta.file_type();
        let (name, kind) = if file_type.is_dir() {
            let kind = if meta.ino() == BTRFS_FIRST_FREE_OBJECTID {
                ImageKind::Subvolume
            } else {
                ImageKind::Directory
            };
            (name.to_string(), kind)
        } else if file_type.is_block_device() {
            (name.to_string(), ImageKind::Block)
        } else if file_type.is_file() && name.ends_with(".raw") {
            (name.trim_end_matches(".raw").to_string(), ImageKind::Raw)
        } else {
            debug!(path = %entry.path().display(), "skipping unrecognized directory entry");
            continue;
        };

        images.push(DiscoveredImage {
            name,
            path: entry.path(),
            kind,
        });
    }

    Ok(images)
}

/// Components reported by the worker for a target scope, or for the host
/// when `target` is None, plus whether a default component exists.
#[derive(Debug)]
pub struct ComponentListing {
    pub have_default: bool,
    pub components: Vec<String>,
}

pub async fn list_components(
    cfg: &WorkerConfig,
    target: Option<&Target>,
) -> Result<ComponentListing> {
    let json = worker::run_simple(cfg, target, &["components"], "components").await?;

    let have_default = json
        .get("default")
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::Protocol {
            verb: "components",
            message: "missing key 'default'".to_string(),
        })?;

    let components = match json.get("components") {
        Some(v) => string_array(v, "components", "components")?,
        None => {
            return Err(Error::Protocol {
                verb: "components",
                message: "missing key 'components'".to_string(),
            });
        }
    };

    Ok(ComponentListing {
        have_default,
        components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_images_classifies_entries() {
        let root = tempfile::tempdir().unwrap();
        let machines = root.path().join("var/lib/machines");
        tokio::fs::create_dir_all(&machines).await.unwrap();

        tokio::fs::create_dir(machines.join("web-1")).await.unwrap();
        tokio::fs::write(machines.join("base.raw"), b"raw").await.unwrap();
        tokio::fs::write(machines.join("notes.txt"), b"x").await.unwrap();
        tokio::fs::write(machines.join(".hidden.raw"), b"x").await.unwrap();

        let mut images = discover_images(root.path(), TargetClass::Machine)
            .await
            .unwrap();
        images.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "base");
        assert_eq!(images[0].kind, ImageKind::Raw);
        assert_eq!(images[1].name, "web-1");
        assert_eq!(images[1].kind, ImageKind::Directory);
    }

    #[tokio::test]
    async fn test_discover_images_missing_dir_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let images = discover_images(root.path(), TargetClass::Confext)
            .await
            .unwrap();
        assert!(images.is_empty());
    }
}
