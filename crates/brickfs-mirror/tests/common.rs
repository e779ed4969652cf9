//! Common fixtures for mirror integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use brickfs_core::{
    Brick, BrickResult, Context, FaultyBrick, FileHandle, FileLock, LockCmd, MemoryBrick,
    OpenFlags, Subvolume,
};
use brickfs_mirror::MirrorBrick;

/// A mirror over N fault-injectable in-memory subvolumes.
pub struct Rig {
    pub mirror: MirrorBrick,
    pub mems: Vec<Arc<MemoryBrick>>,
    pub faults: Vec<Arc<FaultyBrick>>,
}

impl Rig {
    pub fn new(n: usize) -> Self {
        let mems: Vec<Arc<MemoryBrick>> = (0..n).map(|_| Arc::new(MemoryBrick::new())).collect();
        let faults: Vec<Arc<FaultyBrick>> = mems
            .iter()
            .map(|m| Arc::new(FaultyBrick::new(m.clone())))
            .collect();
        let subvolumes = faults
            .iter()
            .enumerate()
            .map(|(i, f)| Subvolume::new(name(i), f.clone()))
            .collect();
        let mirror = MirrorBrick::new("mirror", subvolumes).unwrap();
        Self {
            mirror,
            mems,
            faults,
        }
    }

    /// Put the same file on every subvolume, bypassing the mirror.
    pub fn seed_file(&self, path: &str, data: &[u8]) {
        for mem in &self.mems {
            mem.put_file(path, data).unwrap();
        }
    }

    /// Forget the calls recorded while seeding.
    pub fn clear_calls(&self) {
        for f in &self.faults {
            f.clear_calls();
        }
    }
}

/// Name of subvolume `i`: "A", "B", "C", ...
pub fn name(i: usize) -> String {
    ((b'A' + i as u8) as char).to_string()
}

pub fn ctx() -> Context {
    Context::new(1000, 1000, 42)
}

pub fn regular(perm: u32) -> u32 {
    libc::S_IFREG as u32 | perm
}

/// Forwards file calls to `inner`; once armed, parks the next `write` until
/// the test lets it go.
pub struct GatedBrick {
    inner: Arc<dyn Brick>,
    armed: AtomicBool,
    parked: Barrier,
    resumed: Barrier,
}

impl GatedBrick {
    pub fn new(inner: Arc<dyn Brick>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            parked: Barrier::new(2),
            resumed: Barrier::new(2),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Block until the armed write is parked.
    pub fn wait_parked(&self) {
        self.parked.wait();
    }

    /// Let the parked write continue.
    pub fn resume(&self) {
        self.resumed.wait();
    }
}

impl Brick for GatedBrick {
    fn open(&self, ctx: &Context, path: &str, flags: OpenFlags) -> BrickResult<FileHandle> {
        self.inner.open(ctx, path, flags)
    }

    fn read(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        size: usize,
    ) -> BrickResult<Vec<u8>> {
        self.inner.read(ctx, path, fh, offset, size)
    }

    fn write(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> BrickResult<usize> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.parked.wait();
            self.resumed.wait();
        }
        self.inner.write(ctx, path, fh, offset, data)
    }

    fn release(&self, ctx: &Context, path: &str, fh: FileHandle) -> BrickResult<()> {
        self.inner.release(ctx, path, fh)
    }

    fn lock(
        &self,
        ctx: &Context,
        path: &str,
        fh: FileHandle,
        cmd: LockCmd,
        lock: &FileLock,
    ) -> BrickResult<Option<FileLock>> {
        self.inner.lock(ctx, path, fh, cmd, lock)
    }
}
