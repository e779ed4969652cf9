//! In-memory brick.
//!
//! A complete filesystem held in process memory: an inode table, directories as
//! name maps, hard links, symlinks, extended attributes, open-file and
//! directory handle tables, and owner-aware advisory byte-range locks. It backs
//! the configurable `memory` brick type and every test suite in the workspace.
//!
//! Permission checks are not performed; the caller context only supplies the
//! owner of newly created nodes.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::brick::Brick;
use crate::error::{BrickError, BrickResult};
use crate::locks::LockList;
use crate::types::{
    Context, DirEntry, FileAttr, FileHandle, FileKind, FileLock, LockCmd, LockKind, OpenFlags,
    StatFs, Timespec, XattrFlags,
};

const ROOT_INO: u64 = 1;
const BLOCK_SIZE: u64 = 4096;
const TOTAL_BLOCKS: u64 = 1 << 20;
const TOTAL_INODES: u64 = 1 << 20;
const NAME_MAX: usize = 255;

fn err(errno: i32) -> BrickError {
    BrickError::Os(errno)
}

#[derive(Debug)]
enum Content {
    File(Vec<u8>),
    Dir(BTreeMap<String, u64>),
    Symlink(String),
    Special,
}

#[derive(Debug)]
struct Node {
    kind: FileKind,
    perm: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    nlink: u32,
    atime: Timespec,
    mtime: Timespec,
    ctime: Timespec,
    content: Content,
    xattrs: BTreeMap<String, Vec<u8>>,
    /// Held locks, tagged with the handle they were taken through.
    locks: LockList,
    open_count: u32,
}

impl Node {
    fn new(kind: FileKind, perm: u32, ctx: &Context, content: Content) -> Self {
        let now = Timespec::now();
        Self {
            kind,
            perm: perm & 0o7777,
            uid: ctx.uid,
            gid: ctx.gid,
            rdev: 0,
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
            content,
            xattrs: BTreeMap::new(),
            locks: LockList::new(),
            open_count: 0,
        }
    }

    fn size(&self) -> u64 {
        match &self.content {
            Content::File(data) => data.len() as u64,
            Content::Dir(children) => children.len() as u64,
            Content::Symlink(target) => target.len() as u64,
            Content::Special => 0,
        }
    }

    fn attr(&self, ino: u64) -> FileAttr {
        let size = self.size();
        FileAttr {
            ino,
            kind: self.kind,
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            size,
            blocks: size.div_ceil(512),
            blksize: BLOCK_SIZE as u32,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    fn touch_change(&mut self) {
        self.ctime = Timespec::now();
    }

    fn touch_modify(&mut self) {
        let now = Timespec::now();
        self.mtime = now;
        self.ctime = now;
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenFile {
    ino: u64,
    flags: OpenFlags,
}

#[derive(Debug)]
struct State {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    files: HashMap<FileHandle, OpenFile>,
    dirs: HashMap<FileHandle, u64>,
    next_fh: u64,
}

/// Split a path into its components. Paths must be absolute.
fn components(path: &str) -> BrickResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(err(libc::EINVAL));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(err(libc::EACCES)),
            name if name.len() > NAME_MAX => return Err(err(libc::ENAMETOOLONG)),
            name => parts.push(name),
        }
    }
    Ok(parts)
}

impl State {
    fn new() -> Self {
        let root = Node::new(
            FileKind::Directory,
            0o755,
            &Context::default(),
            Content::Dir(BTreeMap::new()),
        );
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, root);
        Self {
            nodes,
            next_ino: ROOT_INO + 1,
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_fh: 1,
        }
    }

    fn node(&self, ino: u64) -> BrickResult<&Node> {
        self.nodes.get(&ino).ok_or_else(|| err(libc::ENOENT))
    }

    fn node_mut(&mut self, ino: u64) -> BrickResult<&mut Node> {
        self.nodes.get_mut(&ino).ok_or_else(|| err(libc::ENOENT))
    }

    fn children(&self, ino: u64) -> BrickResult<&BTreeMap<String, u64>> {
        match &self.node(ino)?.content {
            Content::Dir(children) => Ok(children),
            _ => Err(err(libc::ENOTDIR)),
        }
    }

    fn children_mut(&mut self, ino: u64) -> BrickResult<&mut BTreeMap<String, u64>> {
        match &mut self.node_mut(ino)?.content {
            Content::Dir(children) => Ok(children),
            _ => Err(err(libc::ENOTDIR)),
        }
    }

    fn lookup(&self, path: &str) -> BrickResult<u64> {
        let mut ino = ROOT_INO;
        for name in components(path)? {
            ino = *self.children(ino)?.get(name).ok_or_else(|| err(libc::ENOENT))?;
        }
        Ok(ino)
    }

    /// Resolve the parent directory of `path` and return it with the final name.
    fn lookup_parent<'a>(&self, path: &'a str) -> BrickResult<(u64, &'a str)> {
        let mut parts = components(path)?;
        let name = parts.pop().ok_or_else(|| err(libc::EEXIST))?;
        let mut ino = ROOT_INO;
        for part in parts {
            ino = *self.children(ino)?.get(part).ok_or_else(|| err(libc::ENOENT))?;
        }
        self.children(ino)?;
        Ok((ino, name))
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn alloc_fh(&mut self) -> FileHandle {
        let fh = FileHandle(self.next_fh);
        self.next_fh += 1;
        fh
    }

    fn create(&mut self, path: &str, node: Node) -> BrickResult<u64> {
        let (parent, name) = self.lookup_parent(path)?;
        if self.children(parent)?.contains_key(name) {
            return Err(err(libc::EEXIST));
        }
        let is_dir = node.kind == FileKind::Directory;
        let ino = self.alloc_ino();
        self.nodes.insert(ino, node);
        self.children_mut(parent)?.insert(name.to_string(), ino);
        let parent_node = self.node_mut(parent)?;
        if is_dir {
            parent_node.nlink += 1;
        }
        parent_node.touch_modify();
        Ok(ino)
    }

    /// Drop one link to `ino`, freeing the inode once unreferenced.
    fn drop_link(&mut self, ino: u64) {
        let free = match self.nodes.get_mut(&ino) {
            Some(node) => {
                node.nlink = node.nlink.saturating_sub(1);
                if node.kind == FileKind::Directory {
                    node.nlink = 0;
                }
                node.touch_change();
                node.nlink == 0 && node.open_count == 0
            }
            None => false,
        };
        if free {
            self.nodes.remove(&ino);
        }
    }

    fn open_file(&self, fh: FileHandle) -> BrickResult<OpenFile> {
        self.files.get(&fh).copied().ok_or_else(|| err(libc::EBADF))
    }

    fn is_ancestor(&self, ancestor: u64, path: &str) -> BrickResult<bool> {
        let mut ino = ROOT_INO;
        if ino == ancestor {
            return Ok(true);
        }
        for name in components(path)? {
            match self.children(ino).ok().and_then(|c| c.get(name)) {
                Some(next) => ino = *next,
                None => return Ok(false),
            }
            if ino == ancestor {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn used_blocks(&self) -> u64 {
        self.nodes
            .values()
            .filter(|n| matches!(n.content, Content::File(_)))
            .map(|n| n.size().div_ceil(BLOCK_SIZE))
            .sum()
    }
}

/// A brick that keeps a whole filesystem in memory.
pub struct MemoryBrick {
    state: Mutex<State>,
    lock_released: Condvar,
}

impl MemoryBrick {
    /// Create an empty filesystem holding only the root directory.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
            lock_released: Condvar::new(),
        }
    }

    /// Returns true if a node exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().lookup(path).is_ok()
    }

    /// Whole contents of the regular file at `path`.
    pub fn contents(&self, path: &str) -> BrickResult<Vec<u8>> {
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        match &state.node(ino)?.content {
            Content::File(data) => Ok(data.clone()),
            Content::Dir(_) => Err(err(libc::EISDIR)),
            _ => Err(err(libc::EINVAL)),
        }
    }

    /// Create or replace the regular file at `path` with `data`.
    pub fn put_file(&self, path: &str, data: &[u8]) -> BrickResult<()> {
        let mut state = self.state.lock();
        match state.lookup(path) {
            Ok(ino) => match &mut state.node_mut(ino)?.content {
                Content::File(existing) => {
                    *existing = data.to_vec();
                    Ok(())
                }
                Content::Dir(_) => Err(err(libc::EISDIR)),
                _ => Err(err(libc::EINVAL)),
            },
            Err(e) if e.is(libc::ENOENT) => {
                let node = Node::new(
                    FileKind::RegularFile,
                    0o644,
                    &Context::default(),
                    Content::File(data.to_vec()),
                );
                state.create(path, node).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Number of open file handles.
    pub fn open_files(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Number of open directory handles.
    pub fn open_dirs(&self) -> usize {
        self.state.lock().dirs.len()
    }
}

impl Default for MemoryBrick {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBrick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBrick")
            .field("nodes", &state.nodes.len())
            .field("open_files", &state.files.len())
            .finish()
    }
}

impl Brick for MemoryBrick {
    fn getattr(&self, _ctx: &Context, path: &str) -> BrickResult<FileAttr> {
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        Ok(state.node(ino)?.attr(ino))
    }

    fn readlink(&self, _ctx: &Context, path: &str) -> BrickResult<String> {
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        match &state.node(ino)?.content {
            Content::Symlink(target) => Ok(target.clone()),
            _ => Err(err(libc::EINVAL)),
        }
    }

    fn mknod(&self, ctx: &Context, path: &str, mode: u32, rdev: u64) -> BrickResult<()> {
        let kind = FileKind::from_mode(mode);
        let content = match kind {
            FileKind::RegularFile => Content::File(Vec::new()),
            FileKind::Directory | FileKind::Symlink => return Err(err(libc::EINVAL)),
            _ => Content::Special,
        };
        let mut node = Node::new(kind, mode, ctx, content);
        node.rdev = rdev;
        self.state.lock().create(path, node)?;
        debug!("memory mknod {} mode {:o}", path, mode);
        Ok(())
    }

    fn mkdir(&self, ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        let node = Node::new(
            FileKind::Directory,
            mode,
            ctx,
            Content::Dir(BTreeMap::new()),
        );
        self.state.lock().create(path, node)?;
        debug!("memory mkdir {}", path);
        Ok(())
    }

    fn unlink(&self, _ctx: &Context, path: &str) -> BrickResult<()> {
        let mut state = self.state.lock();
        let (parent, name) = state.lookup_parent(path)?;
        let ino = *state
            .children(parent)?
            .get(name)
            .ok_or_else(|| err(libc::ENOENT))?;
        if state.node(ino)?.kind == FileKind::Directory {
            return Err(err(libc::EISDIR));
        }
        state.children_mut(parent)?.remove(name);
        state.node_mut(parent)?.touch_modify();
        state.drop_link(ino);
        Ok(())
    }

    fn rmdir(&self, _ctx: &Context, path: &str) -> BrickResult<()> {
        let mut state = self.state.lock();
        let (parent, name) = match state.lookup_parent(path) {
            Ok(found) => found,
            Err(e) if e.is(libc::EEXIST) => return Err(err(libc::EBUSY)),
            Err(e) => return Err(e),
        };
        let ino = *state
            .children(parent)?
            .get(name)
            .ok_or_else(|| err(libc::ENOENT))?;
        if !state.children(ino)?.is_empty() {
            return Err(err(libc::ENOTEMPTY));
        }
        state.children_mut(parent)?.remove(name);
        let parent_node = state.node_mut(parent)?;
        parent_node.nlink = parent_node.nlink.saturating_sub(1);
        parent_node.touch_modify();
        state.drop_link(ino);
        Ok(())
    }

    fn symlink(&self, ctx: &Context, target: &str, link: &str) -> BrickResult<()> {
        let node = Node::new(
            FileKind::Symlink,
            0o777,
            ctx,
            Content::Symlink(target.to_string()),
        );
        self.state.lock().create(link, node)?;
        Ok(())
    }

    fn rename(&self, _ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        let mut state = self.state.lock();
        let (from_parent, from_name) = state.lookup_parent(from)?;
        let ino = *state
            .children(from_parent)?
            .get(from_name)
            .ok_or_else(|| err(libc::ENOENT))?;
        let (to_parent, to_name) = state.lookup_parent(to)?;
        let existing = state.children(to_parent)?.get(to_name).copied();
        if existing == Some(ino) {
            return Ok(());
        }
        let moving_dir = state.node(ino)?.kind == FileKind::Directory;
        if moving_dir && state.is_ancestor(ino, to)? {
            return Err(err(libc::EINVAL));
        }
        if let Some(existing) = existing {
            let existing_is_dir = state.node(existing)?.kind == FileKind::Directory;
            match (moving_dir, existing_is_dir) {
                (true, false) => return Err(err(libc::ENOTDIR)),
                (false, true) => return Err(err(libc::EISDIR)),
                (true, true) if !state.children(existing)?.is_empty() => {
                    return Err(err(libc::ENOTEMPTY))
                }
                _ => {}
            }
            state.children_mut(to_parent)?.remove(to_name);
            if existing_is_dir {
                let parent_node = state.node_mut(to_parent)?;
                parent_node.nlink = parent_node.nlink.saturating_sub(1);
            }
            state.drop_link(existing);
        }
        state.children_mut(from_parent)?.remove(from_name);
        state.children_mut(to_parent)?.insert(to_name.to_string(), ino);
        if moving_dir && from_parent != to_parent {
            let old_parent = state.node_mut(from_parent)?;
            old_parent.nlink = old_parent.nlink.saturating_sub(1);
            state.node_mut(to_parent)?.nlink += 1;
        }
        state.node_mut(from_parent)?.touch_modify();
        state.node_mut(to_parent)?.touch_modify();
        state.node_mut(ino)?.touch_change();
        Ok(())
    }

    fn link(&self, _ctx: &Context, from: &str, to: &str) -> BrickResult<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(from)?;
        if state.node(ino)?.kind == FileKind::Directory {
            return Err(err(libc::EPERM));
        }
        let (parent, name) = state.lookup_parent(to)?;
        if state.children(parent)?.contains_key(name) {
            return Err(err(libc::EEXIST));
        }
        state.children_mut(parent)?.insert(name.to_string(), ino);
        state.node_mut(parent)?.touch_modify();
        let node = state.node_mut(ino)?;
        node.nlink += 1;
        node.touch_change();
        Ok(())
    }

    fn chmod(&self, _ctx: &Context, path: &str, mode: u32) -> BrickResult<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        let node = state.node_mut(ino)?;
        node.perm = mode & 0o7777;
        node.touch_change();
        Ok(())
    }

    fn chown(&self, _ctx: &Context, path: &str, uid: u32, gid: u32) -> BrickResult<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        let node = state.node_mut(ino)?;
        // u32::MAX is the "leave unchanged" id of chown(2).
        if uid != u32::MAX {
            node.uid = uid;
        }
        if gid != u32::MAX {
            node.gid = gid;
        }
        node.touch_change();
        Ok(())
    }

    fn truncate(&self, _ctx: &Context, path: &str, size: u64) -> BrickResult<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        let node = state.node_mut(ino)?;
        match &mut node.content {
            Content::File(data) => data.resize(size as usize, 0),
            Content::Dir(_) => return Err(err(libc::EISDIR)),
            _ => return Err(err(libc::EINVAL)),
        }
        node.touch_modify();
        Ok(())
    }

    fn open(&self, _ctx: &Context, path: &str, flags: OpenFlags) -> BrickResult<FileHandle> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        let node = state.node_mut(ino)?;
        match &mut node.content {
            Content::Dir(_) if flags.is_write_capable() => return Err(err(libc::EISDIR)),
            Content::File(data) if flags.is_write_capable() && flags.extra & libc::O_TRUNC != 0 => {
                data.clear();
                node.touch_modify();
            }
            _ => {}
        }
        node.open_count += 1;
        let fh = state.alloc_fh();
        state.files.insert(fh, OpenFile { ino, flags });
        Ok(fh)
    }

    fn read(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        offset: u64,
        size: usize,
    ) -> BrickResult<Vec<u8>> {
        let mut state = self.state.lock();
        let file = state.open_file(fh)?;
        if !file.flags.is_readable() {
            return Err(err(libc::EBADF));
        }
        let node = state.node_mut(file.ino)?;
        let out = match &node.content {
            Content::File(data) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(size).min(data.len());
                data[start..end].to_vec()
            }
            Content::Dir(_) => return Err(err(libc::EISDIR)),
            _ => return Err(err(libc::EINVAL)),
        };
        node.atime = Timespec::now();
        Ok(out)
    }

    fn write(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> BrickResult<usize> {
        let mut state = self.state.lock();
        let file = state.open_file(fh)?;
        if !file.flags.is_write_capable() {
            return Err(err(libc::EBADF));
        }
        let node = state.node_mut(file.ino)?;
        match &mut node.content {
            Content::File(contents) => {
                let start = if file.flags.extra & libc::O_APPEND != 0 {
                    contents.len()
                } else {
                    offset as usize
                };
                let end = start + data.len();
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[start..end].copy_from_slice(data);
            }
            Content::Dir(_) => return Err(err(libc::EISDIR)),
            _ => return Err(err(libc::EINVAL)),
        }
        node.touch_modify();
        Ok(data.len())
    }

    fn statfs(&self, _ctx: &Context, _path: &str) -> BrickResult<StatFs> {
        let state = self.state.lock();
        let used = state.used_blocks().min(TOTAL_BLOCKS);
        let files = (state.nodes.len() as u64).min(TOTAL_INODES);
        Ok(StatFs {
            bsize: BLOCK_SIZE,
            frsize: BLOCK_SIZE,
            blocks: TOTAL_BLOCKS,
            bfree: TOTAL_BLOCKS - used,
            bavail: TOTAL_BLOCKS - used,
            files: TOTAL_INODES,
            ffree: TOTAL_INODES - files,
            namemax: NAME_MAX as u64,
        })
    }

    fn flush(&self, _ctx: &Context, _path: &str, fh: FileHandle) -> BrickResult<()> {
        self.state.lock().open_file(fh).map(|_| ())
    }

    fn release(&self, _ctx: &Context, _path: &str, fh: FileHandle) -> BrickResult<()> {
        let mut state = self.state.lock();
        let file = state.files.remove(&fh).ok_or_else(|| err(libc::EBADF))?;
        let free = match state.nodes.get_mut(&file.ino) {
            Some(node) => {
                node.open_count = node.open_count.saturating_sub(1);
                if node.locks.drop_handle(fh) {
                    self.lock_released.notify_all();
                }
                node.nlink == 0 && node.open_count == 0
            }
            None => false,
        };
        if free {
            state.nodes.remove(&file.ino);
        }
        Ok(())
    }

    fn fsync(&self, _ctx: &Context, _path: &str, fh: FileHandle, _datasync: bool) -> BrickResult<()> {
        self.state.lock().open_file(fh).map(|_| ())
    }

    fn setxattr(
        &self,
        _ctx: &Context,
        path: &str,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> BrickResult<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        let node = state.node_mut(ino)?;
        let exists = node.xattrs.contains_key(name);
        match flags {
            XattrFlags::Create if exists => return Err(err(libc::EEXIST)),
            XattrFlags::Replace if !exists => return Err(err(libc::ENODATA)),
            _ => {}
        }
        node.xattrs.insert(name.to_string(), value.to_vec());
        node.touch_change();
        Ok(())
    }

    fn getxattr(&self, _ctx: &Context, path: &str, name: &str) -> BrickResult<Vec<u8>> {
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        state
            .node(ino)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| err(libc::ENODATA))
    }

    fn listxattr(&self, _ctx: &Context, path: &str) -> BrickResult<Vec<String>> {
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        Ok(state.node(ino)?.xattrs.keys().cloned().collect())
    }

    fn removexattr(&self, _ctx: &Context, path: &str, name: &str) -> BrickResult<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        let node = state.node_mut(ino)?;
        node.xattrs
            .remove(name)
            .ok_or_else(|| err(libc::ENODATA))?;
        node.touch_change();
        Ok(())
    }

    fn opendir(&self, _ctx: &Context, path: &str) -> BrickResult<FileHandle> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        state.children(ino)?;
        state.node_mut(ino)?.open_count += 1;
        let fh = state.alloc_fh();
        state.dirs.insert(fh, ino);
        Ok(fh)
    }

    fn readdir(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        offset: u64,
    ) -> BrickResult<Vec<DirEntry>> {
        let state = self.state.lock();
        let ino = *state.dirs.get(&fh).ok_or_else(|| err(libc::EBADF))?;
        let children = state.children(ino)?;
        let dots = [
            (".".to_string(), ino, FileKind::Directory),
            ("..".to_string(), 0, FileKind::Directory),
        ];
        let named = children.iter().map(|(name, child)| {
            let kind = state
                .nodes
                .get(child)
                .map(|n| n.kind)
                .unwrap_or(FileKind::RegularFile);
            (name.clone(), *child, kind)
        });
        Ok(dots
            .into_iter()
            .chain(named)
            .enumerate()
            .skip(offset as usize)
            .map(|(idx, (name, ino, kind))| DirEntry {
                name,
                ino,
                kind,
                next_offset: idx as u64 + 1,
            })
            .collect())
    }

    fn releasedir(&self, _ctx: &Context, _path: &str, fh: FileHandle) -> BrickResult<()> {
        let mut state = self.state.lock();
        let ino = state.dirs.remove(&fh).ok_or_else(|| err(libc::EBADF))?;
        let free = match state.nodes.get_mut(&ino) {
            Some(node) => {
                node.open_count = node.open_count.saturating_sub(1);
                node.nlink == 0 && node.open_count == 0
            }
            None => false,
        };
        if free {
            state.nodes.remove(&ino);
        }
        Ok(())
    }

    fn fsyncdir(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        _datasync: bool,
    ) -> BrickResult<()> {
        let state = self.state.lock();
        state.dirs.get(&fh).map(|_| ()).ok_or_else(|| err(libc::EBADF))
    }

    fn lock(
        &self,
        _ctx: &Context,
        _path: &str,
        fh: FileHandle,
        cmd: LockCmd,
        lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        let mut state = self.state.lock();
        let ino = state.open_file(fh)?.ino;
        if lock.kind == LockKind::Unlock {
            if cmd == LockCmd::Get {
                return Err(err(libc::EINVAL));
            }
            state.node_mut(ino)?.locks.carve(lock);
            self.lock_released.notify_all();
            return Ok(None);
        }
        match cmd {
            LockCmd::Get => Ok(state.node(ino)?.locks.first_conflict(lock)),
            LockCmd::Set => {
                let node = state.node_mut(ino)?;
                if node.locks.first_conflict(lock).is_some() {
                    return Err(err(libc::EAGAIN));
                }
                node.locks.insert(fh, *lock);
                Ok(None)
            }
            LockCmd::SetWait => {
                while state.node(ino)?.locks.first_conflict(lock).is_some() {
                    self.lock_released.wait(&mut state);
                }
                state.node_mut(ino)?.locks.insert(fh, *lock);
                Ok(None)
            }
        }
    }

    fn utimens(
        &self,
        _ctx: &Context,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> BrickResult<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        let node = state.node_mut(ino)?;
        node.atime = atime;
        node.mtime = mtime;
        node.touch_change();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn reg(perm: u32) -> u32 {
        libc::S_IFREG as u32 | perm
    }

    #[test]
    fn test_root_exists() {
        let fs = MemoryBrick::new();
        let attr = fs.getattr(&Context::default(), "/").unwrap();
        assert_eq!(attr.ino, ROOT_INO);
        assert!(attr.is_dir());
    }

    #[test]
    fn test_mknod_and_duplicate() {
        let fs = MemoryBrick::new();
        let ctx = Context::new(1000, 100, 1);
        fs.mknod(&ctx, "/a", reg(0o640), 0).unwrap();
        let attr = fs.getattr(&ctx, "/a").unwrap();
        assert_eq!(attr.kind, FileKind::RegularFile);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.uid, 1000);
        assert!(fs.mknod(&ctx, "/a", reg(0o640), 0).unwrap_err().is(libc::EEXIST));
    }

    #[test]
    fn test_create_in_missing_parent() {
        let fs = MemoryBrick::new();
        let err = fs.mkdir(&Context::default(), "/no/such", 0o755).unwrap_err();
        assert!(err.is(libc::ENOENT));
    }

    #[test]
    fn test_create_under_file_is_enotdir() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"x").unwrap();
        assert!(fs.mkdir(&ctx, "/f/d", 0o755).unwrap_err().is(libc::ENOTDIR));
    }

    #[test]
    fn test_rmdir_rules() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.mkdir(&ctx, "/d", 0o755).unwrap();
        fs.put_file("/d/f", b"x").unwrap();
        assert!(fs.rmdir(&ctx, "/d").unwrap_err().is(libc::ENOTEMPTY));
        assert!(fs.rmdir(&ctx, "/d/f").unwrap_err().is(libc::ENOTDIR));
        assert!(fs.unlink(&ctx, "/d").unwrap_err().is(libc::EISDIR));
        fs.unlink(&ctx, "/d/f").unwrap();
        fs.rmdir(&ctx, "/d").unwrap();
        assert!(!fs.exists("/d"));
        assert!(fs.rmdir(&ctx, "/").unwrap_err().is(libc::EBUSY));
    }

    #[test]
    fn test_dir_nlink_tracks_subdirs() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.mkdir(&ctx, "/d", 0o755).unwrap();
        fs.mkdir(&ctx, "/d/e", 0o755).unwrap();
        assert_eq!(fs.getattr(&ctx, "/d").unwrap().nlink, 3);
        fs.rmdir(&ctx, "/d/e").unwrap();
        assert_eq!(fs.getattr(&ctx, "/d").unwrap().nlink, 2);
    }

    #[test]
    fn test_hard_link_shares_inode() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/a", b"data").unwrap();
        fs.link(&ctx, "/a", "/b").unwrap();
        let a = fs.getattr(&ctx, "/a").unwrap();
        let b = fs.getattr(&ctx, "/b").unwrap();
        assert_eq!(a.ino, b.ino);
        assert_eq!(b.nlink, 2);
        fs.unlink(&ctx, "/a").unwrap();
        assert_eq!(fs.contents("/b").unwrap(), b"data");
        assert_eq!(fs.getattr(&ctx, "/b").unwrap().nlink, 1);
    }

    #[test]
    fn test_symlink_readlink() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.symlink(&ctx, "../elsewhere", "/l").unwrap();
        assert_eq!(fs.readlink(&ctx, "/l").unwrap(), "../elsewhere");
        assert_eq!(fs.getattr(&ctx, "/l").unwrap().kind, FileKind::Symlink);
        fs.put_file("/f", b"").unwrap();
        assert!(fs.readlink(&ctx, "/f").unwrap_err().is(libc::EINVAL));
    }

    #[test]
    fn test_rename_replaces_and_moves_dirs() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/a", b"A").unwrap();
        fs.put_file("/b", b"B").unwrap();
        fs.rename(&ctx, "/a", "/b").unwrap();
        assert!(!fs.exists("/a"));
        assert_eq!(fs.contents("/b").unwrap(), b"A");

        fs.mkdir(&ctx, "/x", 0o755).unwrap();
        fs.mkdir(&ctx, "/y", 0o755).unwrap();
        fs.rename(&ctx, "/x", "/y/x").unwrap();
        assert!(fs.exists("/y/x"));
        assert!(fs.rename(&ctx, "/y", "/y/x/z").unwrap_err().is(libc::EINVAL));
        assert!(fs.rename(&ctx, "/b", "/y").unwrap_err().is(libc::EISDIR));
    }

    #[test]
    fn test_read_write_via_handles() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.mknod(&ctx, "/f", reg(0o644), 0).unwrap();
        let fh = fs.open(&ctx, "/f", OpenFlags::read_write()).unwrap();
        assert_eq!(fs.write(&ctx, "/f", fh, 2, b"xy").unwrap(), 2);
        assert_eq!(fs.read(&ctx, "/f", fh, 0, 10).unwrap(), b"\0\0xy");
        assert_eq!(fs.read(&ctx, "/f", fh, 10, 10).unwrap(), b"");
        fs.release(&ctx, "/f", fh).unwrap();
        assert!(fs.read(&ctx, "/f", fh, 0, 1).unwrap_err().is(libc::EBADF));
    }

    #[test]
    fn test_access_mode_enforced() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"abc").unwrap();
        let ro = fs.open(&ctx, "/f", OpenFlags::read_only()).unwrap();
        assert!(fs.write(&ctx, "/f", ro, 0, b"z").unwrap_err().is(libc::EBADF));
        let wo = fs.open(&ctx, "/f", OpenFlags::write_only()).unwrap();
        assert!(fs.read(&ctx, "/f", wo, 0, 1).unwrap_err().is(libc::EBADF));
    }

    #[test]
    fn test_open_trunc_and_append() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"abc").unwrap();
        let fh = fs
            .open(&ctx, "/f", OpenFlags::write_only().with_extra(libc::O_APPEND))
            .unwrap();
        fs.write(&ctx, "/f", fh, 0, b"d").unwrap();
        assert_eq!(fs.contents("/f").unwrap(), b"abcd");
        let fh = fs
            .open(&ctx, "/f", OpenFlags::write_only().with_extra(libc::O_TRUNC))
            .unwrap();
        assert!(fs.contents("/f").unwrap().is_empty());
        fs.release(&ctx, "/f", fh).unwrap();
    }

    #[test]
    fn test_unlinked_open_file_stays_readable() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"keep").unwrap();
        let fh = fs.open(&ctx, "/f", OpenFlags::read_only()).unwrap();
        fs.unlink(&ctx, "/f").unwrap();
        assert_eq!(fs.read(&ctx, "/f", fh, 0, 16).unwrap(), b"keep");
        fs.release(&ctx, "/f", fh).unwrap();
    }

    #[test]
    fn test_truncate() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"abcdef").unwrap();
        fs.truncate(&ctx, "/f", 2).unwrap();
        assert_eq!(fs.contents("/f").unwrap(), b"ab");
        fs.truncate(&ctx, "/f", 4).unwrap();
        assert_eq!(fs.contents("/f").unwrap(), b"ab\0\0");
    }

    #[test]
    fn test_xattr_flags() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"").unwrap();
        assert!(fs
            .setxattr(&ctx, "/f", "user.a", b"1", XattrFlags::Replace)
            .unwrap_err()
            .is(libc::ENODATA));
        fs.setxattr(&ctx, "/f", "user.a", b"1", XattrFlags::Create)
            .unwrap();
        assert!(fs
            .setxattr(&ctx, "/f", "user.a", b"2", XattrFlags::Create)
            .unwrap_err()
            .is(libc::EEXIST));
        fs.setxattr(&ctx, "/f", "user.a", b"2", XattrFlags::Either)
            .unwrap();
        assert_eq!(fs.getxattr(&ctx, "/f", "user.a").unwrap(), b"2");
        assert_eq!(fs.listxattr(&ctx, "/f").unwrap(), vec!["user.a".to_string()]);
        fs.removexattr(&ctx, "/f", "user.a").unwrap();
        assert!(fs.getxattr(&ctx, "/f", "user.a").unwrap_err().is(libc::ENODATA));
        assert!(fs.removexattr(&ctx, "/f", "user.a").unwrap_err().is(libc::ENODATA));
    }

    #[test]
    fn test_readdir_offsets() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/b", b"").unwrap();
        fs.mkdir(&ctx, "/a", 0o755).unwrap();
        let fh = fs.opendir(&ctx, "/").unwrap();
        let all = fs.readdir(&ctx, "/", fh, 0).unwrap();
        let names: Vec<_> = all.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a", "b"]);
        assert_eq!(all[2].kind, FileKind::Directory);
        let rest = fs.readdir(&ctx, "/", fh, all[2].next_offset).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "b");
        fs.releasedir(&ctx, "/", fh).unwrap();
        assert_eq!(fs.open_dirs(), 0);
        assert!(fs.releasedir(&ctx, "/", fh).unwrap_err().is(libc::EBADF));
    }

    #[test]
    fn test_opendir_on_file_is_enotdir() {
        let fs = MemoryBrick::new();
        fs.put_file("/f", b"").unwrap();
        assert!(fs
            .opendir(&Context::default(), "/f")
            .unwrap_err()
            .is(libc::ENOTDIR));
    }

    #[test]
    fn test_lock_conflicts_between_owners() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"0123456789").unwrap();
        let fh = fs.open(&ctx, "/f", OpenFlags::read_write()).unwrap();
        fs.lock(&ctx, "/f", fh, LockCmd::Set, &FileLock::write(0, 4, 1))
            .unwrap();
        let err = fs
            .lock(&ctx, "/f", fh, LockCmd::Set, &FileLock::write(2, 4, 2))
            .unwrap_err();
        assert!(err.is(libc::EAGAIN));
        let conflict = fs
            .lock(&ctx, "/f", fh, LockCmd::Get, &FileLock::read(3, 1, 2))
            .unwrap();
        assert_eq!(conflict.map(|l| l.owner), Some(1));
        fs.lock(&ctx, "/f", fh, LockCmd::Set, &FileLock::write(4, 4, 2))
            .unwrap();
    }

    #[test]
    fn test_unlock_splits_range() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"").unwrap();
        let fh = fs.open(&ctx, "/f", OpenFlags::read_write()).unwrap();
        fs.lock(&ctx, "/f", fh, LockCmd::Set, &FileLock::write(0, 10, 1))
            .unwrap();
        fs.lock(
            &ctx,
            "/f",
            fh,
            LockCmd::Set,
            &FileLock::write(3, 2, 1).unlocked(),
        )
        .unwrap();
        let probe = |start, len| {
            fs.lock(&ctx, "/f", fh, LockCmd::Get, &FileLock::write(start, len, 2))
                .unwrap()
        };
        assert!(probe(0, 3).is_some());
        assert!(probe(3, 2).is_none());
        assert!(probe(5, 5).is_some());
    }

    #[test]
    fn test_release_drops_handle_locks() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"").unwrap();
        let a = fs.open(&ctx, "/f", OpenFlags::read_write()).unwrap();
        let b = fs.open(&ctx, "/f", OpenFlags::read_write()).unwrap();
        fs.lock(&ctx, "/f", a, LockCmd::Set, &FileLock::write(0, 0, 1))
            .unwrap();
        fs.release(&ctx, "/f", a).unwrap();
        fs.lock(&ctx, "/f", b, LockCmd::Set, &FileLock::write(0, 0, 2))
            .unwrap();
    }

    #[test]
    fn test_set_wait_blocks_until_unlock() {
        let fs = Arc::new(MemoryBrick::new());
        let ctx = Context::default();
        fs.put_file("/f", b"").unwrap();
        let fh = fs.open(&ctx, "/f", OpenFlags::read_write()).unwrap();
        let held = FileLock::write(0, 0, 1);
        fs.lock(&ctx, "/f", fh, LockCmd::Set, &held).unwrap();

        let waiter = {
            let fs = fs.clone();
            thread::spawn(move || {
                fs.lock(
                    &Context::default(),
                    "/f",
                    fh,
                    LockCmd::SetWait,
                    &FileLock::write(0, 0, 2),
                )
            })
        };
        thread::sleep(Duration::from_millis(50));
        fs.lock(&ctx, "/f", fh, LockCmd::Set, &held.unlocked())
            .unwrap();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_statfs_reflects_usage() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        let before = fs.statfs(&ctx, "/").unwrap();
        fs.put_file("/f", &vec![1u8; 8192]).unwrap();
        let after = fs.statfs(&ctx, "/").unwrap();
        assert_eq!(before.bfree - after.bfree, 2);
        assert_eq!(before.ffree - after.ffree, 1);
        assert_eq!(after.namemax, 255);
    }

    #[test]
    fn test_chown_keeps_unchanged_ids() {
        let fs = MemoryBrick::new();
        let ctx = Context::new(5, 6, 1);
        fs.mknod(&ctx, "/f", reg(0o600), 0).unwrap();
        fs.chown(&ctx, "/f", 7, u32::MAX).unwrap();
        let attr = fs.getattr(&ctx, "/f").unwrap();
        assert_eq!((attr.uid, attr.gid), (7, 6));
    }

    #[test]
    fn test_utimens_sets_times() {
        let fs = MemoryBrick::new();
        let ctx = Context::default();
        fs.put_file("/f", b"").unwrap();
        fs.utimens(&ctx, "/f", Timespec::new(10, 1), Timespec::new(20, 2))
            .unwrap();
        let attr = fs.getattr(&ctx, "/f").unwrap();
        assert_eq!(attr.atime, Timespec::new(10, 1));
        assert_eq!(attr.mtime, Timespec::new(20, 2));
    }

    #[test]
    fn test_dotdot_rejected() {
        let fs = MemoryBrick::new();
        assert!(fs
            .getattr(&Context::default(), "/a/../b")
            .unwrap_err()
            .is(libc::EACCES));
    }
}
