//! A skeletal versioned directory tree mirroring the target repository.
//!
//! The mirror tracks which paths exist in every SVN revision; file contents
//! never enter it. Directory nodes live in an arena and are shared between
//! revisions by key; a copy is just a shared key. Nodes of finished
//! revisions are immutable: the revision being built clones nodes on first
//! write, so replaying history at any past revnum always gives the same
//! answers.

use std::collections::BTreeMap;
use std::collections::HashSet;

use anyhow::Result;
use slotmap::new_key_type;
use slotmap::SlotMap;
use thiserror::Error;

use crate::fill::FillTarget;
use crate::rcs::RevNum;

new_key_type! {
    pub struct NodeKey;
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("path already exists: {0}")]
    PathAlreadyExists(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("expected a file: {0}")]
    NotAFile(String),
    #[error("no such revision: r{0}")]
    NoSuchRevision(u32),
    #[error("refusing to remove project root: {0}")]
    ProtectedRoot(String),
}

#[derive(Debug, Clone)]
enum Node {
    Dir(BTreeMap<String, NodeKey>),
    File,
}

impl Node {
    fn entries(&self) -> Option<&BTreeMap<String, NodeKey>> {
        match self {
            Node::Dir(entries) => Some(entries),
            Node::File => None,
        }
    }

    fn kind(&self) -> NodeKind {
        match self {
            Node::Dir(_) => NodeKind::Dir,
            Node::File => NodeKind::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum NodeKind {
    Dir,
    File,
}

/// Revision properties attached to each commit.
#[derive(Debug, Clone)]
pub struct RevProps {
    pub author: Option<String>,
    pub date: i64,
    pub log: String,
}

/// A file path being added or changed, with what a content-producing
/// delegate needs to emit it.
#[derive(Debug, Clone)]
pub struct PathItem {
    pub path: String,
    pub rcs_path: String,
    pub rev: RevNum,
    pub executable: bool,
}

/// Side-effecting consumers of the operation stream, invoked in
/// registration order.
pub trait RepositoryDelegate {
    fn start_commit(&mut self, revnum: u32, props: &RevProps) -> Result<()>;
    fn mkdir(&mut self, path: &str) -> Result<()>;
    fn add_path(&mut self, item: &PathItem) -> Result<()>;
    fn change_path(&mut self, item: &PathItem) -> Result<()>;
    fn delete_path(&mut self, path: &str) -> Result<()>;
    fn copy_path(&mut self, src: &str, src_revnum: u32, dest: &str, kind: NodeKind) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

pub struct Mirror {
    nodes: SlotMap<NodeKey, Node>,
    /// Root node per revnum; index 0 is the empty pre-history root.
    revs: Vec<NodeKey>,
    /// Root of the revision being built, once something changed.
    open_root: Option<NodeKey>,
    /// Nodes created for the open revision; only these may be mutated.
    new_nodes: HashSet<NodeKey>,
    in_commit: bool,
    /// `trunk`, `branches`, `tags` and their ancestors; never pruned.
    protected: HashSet<String>,
    delegates: Vec<Box<dyn RepositoryDelegate>>,
}

impl Mirror {
    pub fn new(protected_roots: &[&str]) -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node::Dir(BTreeMap::new()));
        let mut protected = HashSet::new();
        for root_path in protected_roots {
            let mut prefix = String::new();
            for component in root_path.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(component);
                protected.insert(prefix.clone());
            }
        }
        Self {
            nodes,
            revs: vec![root],
            open_root: None,
            new_nodes: HashSet::new(),
            in_commit: false,
            protected,
            delegates: Vec::new(),
        }
    }

    pub fn add_delegate(&mut self, delegate: Box<dyn RepositoryDelegate>) {
        self.delegates.push(delegate);
    }

    pub fn youngest(&self) -> u32 {
        self.revs.len() as u32 - 1
    }

    pub fn start_commit(&mut self, revnum: u32, props: &RevProps) -> Result<()> {
        assert!(!self.in_commit, "start_commit inside an open commit");
        assert_eq!(revnum, self.youngest() + 1, "commits must arrive in revnum order");
        self.in_commit = true;
        for delegate in &mut self.delegates {
            delegate.start_commit(revnum, props)?;
        }
        Ok(())
    }

    /// Close the open revision: link the previous root when nothing changed,
    /// otherwise seal the shadow nodes.
    pub fn end_commit(&mut self) {
        assert!(self.in_commit, "end_commit without start_commit");
        let root = self.open_root.take().unwrap_or(*self.revs.last().unwrap());
        self.revs.push(root);
        self.new_nodes.clear();
        self.in_commit = false;
    }

    pub fn finish(&mut self) -> Result<()> {
        for delegate in &mut self.delegates {
            delegate.finish()?;
        }
        Ok(())
    }

    // -- Read operations -----------------------------------------------------

    pub fn path_exists(&self, path: &str) -> bool {
        self.resolve(self.current_root(), path).is_some()
    }

    pub fn path_exists_at(&self, path: &str, revnum: u32) -> Result<bool> {
        let root = self.root_at(revnum)?;
        Ok(self.resolve(root, path).is_some())
    }

    /// Child names of a directory at a past revision; empty for files and
    /// missing paths.
    pub fn entries_at(&self, path: &str, revnum: u32) -> Result<Vec<String>> {
        let root = self.root_at(revnum)?;
        Ok(self
            .resolve(root, path)
            .and_then(|key| self.nodes[key].entries())
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn root_at(&self, revnum: u32) -> Result<NodeKey, MirrorError> {
        self.revs.get(revnum as usize).copied().ok_or(MirrorError::NoSuchRevision(revnum))
    }

    fn current_root(&self) -> NodeKey {
        self.open_root.unwrap_or(*self.revs.last().unwrap())
    }

    fn resolve(&self, root: NodeKey, path: &str) -> Option<NodeKey> {
        let mut key = root;
        if path.is_empty() {
            return Some(key);
        }
        for component in path.split('/') {
            key = *self.nodes[key].entries()?.get(component)?;
        }
        Some(key)
    }

    // -- Write operations ----------------------------------------------------

    /// Create the directory at `path`, making missing parents as needed.
    /// Every directory actually created is reported to the delegates.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let components: Vec<&str> = path.split('/').collect();
        let mut key = self.writable_root();
        let mut prefix = String::new();
        for component in components {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            let existing = match &self.nodes[key] {
                Node::Dir(entries) => entries.get(component).copied(),
                Node::File => return Err(MirrorError::NotADirectory(prefix).into()),
            };
            match existing {
                Some(child) => {
                    if matches!(self.nodes[child], Node::File) {
                        return Err(MirrorError::NotADirectory(prefix).into());
                    }
                    key = self.make_writable(key, component, child);
                }
                None => {
                    let child = self.nodes.insert(Node::Dir(BTreeMap::new()));
                    self.new_nodes.insert(child);
                    self.insert_entry(key, component, child);
                    for delegate in &mut self.delegates {
                        delegate.mkdir(&prefix)?;
                    }
                    key = child;
                }
            }
        }
        Ok(())
    }

    /// Create any directories missing on the way to `path`'s parent.
    pub fn ensure_parent(&mut self, path: &str) -> Result<()> {
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !self.path_exists(parent) {
                self.mkdir(parent)?;
            }
        }
        Ok(())
    }

    /// Add a file leaf. Adding over an existing path is a bug in the
    /// conversion, not a recoverable condition.
    pub fn add_file(&mut self, item: &PathItem) -> Result<()> {
        let (parent, name) = self.open_parent(&item.path)?;
        if self.nodes[parent].entries().unwrap().contains_key(&name) {
            return Err(MirrorError::PathAlreadyExists(item.path.clone()).into());
        }
        let leaf = self.nodes.insert(Node::File);
        self.new_nodes.insert(leaf);
        self.insert_entry(parent, &name, leaf);
        for delegate in &mut self.delegates {
            delegate.add_path(item)?;
        }
        Ok(())
    }

    /// Record a content change; the tree structure does not move.
    pub fn change_file(&mut self, item: &PathItem) -> Result<()> {
        match self.resolve(self.current_root(), &item.path) {
            Some(key) if matches!(self.nodes[key], Node::File) => {}
            Some(_) => return Err(MirrorError::NotAFile(item.path.clone()).into()),
            None => return Err(MirrorError::PathNotFound(item.path.clone()).into()),
        }
        for delegate in &mut self.delegates {
            delegate.change_path(item)?;
        }
        Ok(())
    }

    /// Delete a path. With `prune`, the deepest ancestor directory that
    /// would be left empty is deleted instead, but the project roots are
    /// never removed.
    pub fn delete_path(&mut self, path: &str, prune: bool) -> Result<()> {
        if self.protected.contains(path) {
            return Err(MirrorError::ProtectedRoot(path.to_string()).into());
        }
        let components: Vec<&str> = path.split('/').collect();

        // Chain of node keys from the root down to the path itself.
        let mut chain = vec![self.current_root()];
        for component in &components {
            let key = *chain.last().unwrap();
            let child = self
                .nodes[key]
                .entries()
                .and_then(|e| e.get(*component))
                .copied()
                .ok_or_else(|| MirrorError::PathNotFound(path.to_string()))?;
            chain.push(child);
        }

        // Walk upward past parents that would become empty.
        let mut cut = components.len() - 1;
        while prune && cut > 0 {
            let parent_path = components[..cut].join("/");
            if self.protected.contains(&parent_path) {
                break;
            }
            let parent = chain[cut];
            if self.nodes[parent].entries().map_or(0, |e| e.len()) != 1 {
                break;
            }
            cut -= 1;
        }

        let target_path = components[..=cut].join("/");
        let (parent, name) = self.open_parent(&target_path)?;
        match &mut self.nodes[parent] {
            Node::Dir(entries) => {
                entries.remove(&name);
            }
            Node::File => unreachable!("open_parent returns a directory"),
        }
        for delegate in &mut self.delegates {
            delegate.delete_path(&target_path)?;
        }
        Ok(())
    }

    /// Share `src`'s node (as of `src_revnum`) under `dest`. The destination
    /// parent must exist and the destination must not.
    pub fn copy_path(&mut self, src: &str, src_revnum: u32, dest: &str) -> Result<NodeKind> {
        let src_root = self.root_at(src_revnum)?;
        let src_key = self
            .resolve(src_root, src)
            .ok_or_else(|| MirrorError::PathNotFound(format!("{}@{}", src, src_revnum)))?;
        let kind = self.nodes[src_key].kind();

        let (parent, name) = self.open_parent(dest)?;
        if self.nodes[parent].entries().unwrap().contains_key(&name) {
            return Err(MirrorError::PathAlreadyExists(dest.to_string()).into());
        }
        self.insert_entry(parent, &name, src_key);
        for delegate in &mut self.delegates {
            delegate.copy_path(src, src_revnum, dest, kind)?;
        }
        Ok(kind)
    }

    // -- Copy-on-write plumbing ----------------------------------------------

    fn writable_root(&mut self) -> NodeKey {
        match self.open_root {
            Some(root) if self.new_nodes.contains(&root) => root,
            _ => {
                let base = self.current_root();
                let clone = self.nodes[base].clone();
                let root = self.nodes.insert(clone);
                self.new_nodes.insert(root);
                self.open_root = Some(root);
                root
            }
        }
    }

    /// Open `path`'s parent directory for writing, returning its key and
    /// the final path component.
    fn open_parent(&mut self, path: &str) -> Result<(NodeKey, String)> {
        let mut components: Vec<&str> = path.split('/').collect();
        let name = components.pop().expect("paths are never empty").to_string();

        let mut key = self.writable_root();
        let mut prefix = String::new();
        for component in components {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            let child = match &self.nodes[key] {
                Node::Dir(entries) => entries.get(component).copied(),
                Node::File => None,
            };
            let child = match child {
                Some(child) if matches!(self.nodes[child], Node::Dir(_)) => child,
                Some(_) => return Err(MirrorError::NotADirectory(prefix).into()),
                None => return Err(MirrorError::PathNotFound(prefix).into()),
            };
            key = self.make_writable(key, component, child);
        }
        Ok((key, name))
    }

    /// Make a child node writable, cloning it into the open revision if it
    /// still belongs to a sealed one.
    fn make_writable(&mut self, parent: NodeKey, name: &str, child: NodeKey) -> NodeKey {
        if self.new_nodes.contains(&child) {
            return child;
        }
        let clone = self.nodes[child].clone();
        let new_child = self.nodes.insert(clone);
        self.new_nodes.insert(new_child);
        self.insert_entry(parent, name, new_child);
        new_child
    }

    fn insert_entry(&mut self, parent: NodeKey, name: &str, child: NodeKey) {
        match &mut self.nodes[parent] {
            Node::Dir(entries) => {
                entries.insert(name.to_string(), child);
            }
            Node::File => unreachable!("parents are opened as directories"),
        }
    }
}

impl FillTarget for Mirror {
    fn entries(&self, path: &str, revnum: u32) -> Vec<String> {
        self.entries_at(path, revnum).unwrap_or_default()
    }

    fn exists(&self, path: &str) -> bool {
        self.path_exists(path)
    }

    fn copy(&mut self, src: &str, src_revnum: u32, dest: &str) -> Result<()> {
        self.copy_path(src, src_revnum, dest).map(|_| ())
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        self.delete_path(path, false)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Records every delegate call as a readable line.
    #[derive(Default)]
    pub struct RecordingDelegate {
        pub ops: std::rc::Rc<std::cell::RefCell<Vec<String>>>,
    }

    impl RepositoryDelegate for RecordingDelegate {
        fn start_commit(&mut self, revnum: u32, _props: &RevProps) -> Result<()> {
            self.ops.borrow_mut().push(format!("start r{}", revnum));
            Ok(())
        }

        fn mkdir(&mut self, path: &str) -> Result<()> {
            self.ops.borrow_mut().push(format!("mkdir {}", path));
            Ok(())
        }

        fn add_path(&mut self, item: &PathItem) -> Result<()> {
            self.ops.borrow_mut().push(format!("add {}", item.path));
            Ok(())
        }

        fn change_path(&mut self, item: &PathItem) -> Result<()> {
            self.ops.borrow_mut().push(format!("change {}", item.path));
            Ok(())
        }

        fn delete_path(&mut self, path: &str) -> Result<()> {
            self.ops.borrow_mut().push(format!("delete {}", path));
            Ok(())
        }

        fn copy_path(&mut self, src: &str, rev: u32, dest: &str, kind: NodeKind) -> Result<()> {
            self.ops.borrow_mut().push(format!("copy {}@{} -> {} ({})", src, rev, dest, kind));
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.ops.borrow_mut().push("finish".to_string());
            Ok(())
        }
    }
}
