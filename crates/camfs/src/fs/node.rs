//! Filesystem nodes, directory entries and attributes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{FileType, ObjectRef, ROOT_HANDLE};

/// Permission bits reported for files.
pub const FILE_MODE: u32 = 0o644;
/// Permission bits reported for directories.
pub const DIR_MODE: u32 = 0o755;

/// A node handed out to the mounting layer. Holds a reference to its object so the object's
/// metadata and cached content outlive an index eviction or delete while the node is open.
#[derive(Debug, Clone)]
pub struct FsNode {
    object: Option<ObjectRef>,
    root: bool,
}

impl FsNode {
    pub fn root() -> Self {
        Self {
            object: None,
            root: true,
        }
    }

    pub(crate) fn bound(object: ObjectRef) -> Self {
        Self {
            object: Some(object),
            root: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Object handle, or 0 for the root and for unbound nodes.
    pub fn handle(&self) -> u32 {
        self.object.as_ref().map_or(ROOT_HANDLE, |object| object.handle())
    }

    pub fn object(&self) -> Option<&ObjectRef> {
        self.object.as_ref()
    }

    pub fn is_dir(&self) -> bool {
        self.root || self.object.as_ref().is_some_and(|object| object.is_dir())
    }

    pub fn file_type(&self) -> FileType {
        if self.root {
            FileType::Folder
        } else {
            self.object.as_ref().map_or(FileType::Unknown, |object| object.file_type())
        }
    }

    pub fn name(&self) -> String {
        match &self.object {
            Some(object) => object.name(),
            None if self.root => "/".to_string(),
            None => String::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.object.as_ref().map_or(0, |object| object.size())
    }

    pub(crate) fn rebind(&mut self, object: ObjectRef) {
        self.object = Some(object);
    }

    pub(crate) fn unbind(&mut self) -> Option<ObjectRef> {
        self.object.take()
    }
}

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub handle: u32,
    pub file_type: FileType,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

impl DirectoryEntry {
    pub(crate) fn dot(name: &str, handle: u32) -> Self {
        Self {
            name: name.to_string(),
            handle,
            file_type: FileType::Folder,
            size: 0,
            modified: None,
            is_dir: true,
        }
    }

    pub(crate) fn for_object(object: &ObjectRef) -> Self {
        let metadata = object.metadata();
        Self {
            is_dir: metadata.is_dir(),
            name: metadata.name,
            handle: object.handle(),
            file_type: metadata.file_type,
            size: metadata.size,
            modified: metadata.modified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    File,
    Directory,
}

/// Attributes of a node, in the shape a mounting layer needs for `stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttr {
    pub handle: u32,
    pub kind: NodeKind,
    pub size: u64,
    /// 512-byte blocks.
    pub blocks: u64,
    pub mode: u32,
    pub nlink: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl NodeAttr {
    pub(crate) fn of(node: &FsNode) -> Self {
        let metadata = node.object().map(|object| object.metadata());
        let is_dir = node.is_dir();
        let size = metadata.as_ref().map_or(0, |m| m.size);
        Self {
            handle: node.handle(),
            kind: if is_dir { NodeKind::Directory } else { NodeKind::File },
            size,
            blocks: size.div_ceil(512),
            mode: if is_dir { DIR_MODE } else { FILE_MODE },
            nlink: if is_dir { 2 } else { 1 },
            created: metadata.as_ref().and_then(|m| m.created),
            modified: metadata.as_ref().and_then(|m| m.modified),
        }
    }
}
