//! Update targets: the host, its components, and discovered images.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetClass {
    Host,
    Component,
    Machine,
    Portable,
    Sysext,
    Confext,
}

impl TargetClass {
    /// Classes whose targets are discovered from the image directories.
    pub const IMAGE_CLASSES: [TargetClass; 4] = [
        TargetClass::Machine,
        TargetClass::Portable,
        TargetClass::Sysext,
        TargetClass::Confext,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetClass::Host => "host",
            TargetClass::Component => "component",
            TargetClass::Machine => "machine",
            TargetClass::Portable => "portable",
            TargetClass::Sysext => "sysext",
            TargetClass::Confext => "confext",
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, TargetClass::Host | TargetClass::Component)
    }
}

/// How an image-class target is stored on disk. Only meaningful for image
/// classes; host and component targets stay `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Directory,
    Subvolume,
    Raw,
    Block,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub class: TargetClass,
    pub name: String,
    pub path: String,
    /// Stable id: "host" for the host target, "<class>:<name>" otherwise.
    pub id: String,
    pub image_kind: ImageKind,
    /// True while a mutating job (update/vacuum) runs against this target.
    pub busy: bool,
}

impl Target {
    pub fn new(class: TargetClass, name: &str, path: &str) -> Self {
        let id = if class == TargetClass::Host {
            "host".to_string()
        } else {
            format!("{}:{}", class.as_str(), name)
        };
        Self {
            class,
            name: name.to_string(),
            path: path.to_string(),
            id,
            image_kind: ImageKind::Invalid,
            busy: false,
        }
    }

    pub fn object_path(&self) -> String {
        format!("/sysupdate1/target/{}", label_escape(&self.id))
    }

    /// The scope argument handed to the worker. The host target needs none,
    /// components are selected by name, images by their location.
    pub fn selector_arg(&self) -> Result<Option<String>> {
        match self.class {
            TargetClass::Host => Ok(None),
            TargetClass::Component => Ok(Some(format!("--component={}", self.name))),
            _ => match self.image_kind {
                ImageKind::Directory | ImageKind::Subvolume => {
                    Ok(Some(format!("--root={}", self.path)))
                }
                ImageKind::Raw | ImageKind::Block => Ok(Some(format!("--image={}", self.path))),
                ImageKind::Invalid => Err(Error::Internal(format!(
                    "image target {} has no usable image kind",
                    self.id
                ))),
            },
        }
    }
}

/// Escape an id for use as an object path component: alphanumerics pass
/// through, every other byte becomes `_xx`, the empty string becomes `_`.
pub fn label_escape(s: &str) -> String {
    if s.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02x}"));
        }
    }
    out
}
