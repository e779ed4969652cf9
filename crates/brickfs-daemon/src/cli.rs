//! The `brickfs` command line.

use crate::config::DaemonConfig;
use crate::tree::BrickTree;
use anyhow::{Context as _, Result};
use brickfs_core::{Brick, Context, FileKind, OpenFlags, XattrFlags};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const CHUNK: usize = 64 * 1024;

/// Command-line arguments of `brickfs`.
#[derive(Parser)]
#[command(name = "brickfs")]
#[command(about = "Drive operations through a configured brick tree", long_about = None)]
pub struct Cli {
    /// Brick tree configuration (`.toml` or `.json`).
    #[arg(short, long, env = "BRICKFS_CONFIG", default_value = "/etc/brickfs/brickfs.toml")]
    pub config: PathBuf,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Operations against the root brick.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build the tree and report its state.
    Check,
    /// Show attributes of a path.
    Stat {
        /// Path inside the brick tree.
        path: String,
    },
    /// List a directory.
    Ls {
        /// Directory inside the brick tree.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file.
    Cat {
        /// File inside the brick tree.
        path: String,
    },
    /// Copy a local file into the tree.
    Put {
        /// Local source file.
        local: PathBuf,
        /// Destination inside the brick tree.
        path: String,
        /// Permission bits for a new file, in octal.
        #[arg(short, long, default_value = "644", value_parser = parse_mode)]
        mode: u32,
    },
    /// Create a directory.
    Mkdir {
        /// Directory to create.
        path: String,
        /// Permission bits, in octal.
        #[arg(short, long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },
    /// Remove a file.
    Rm {
        /// File to remove.
        path: String,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Directory to remove.
        path: String,
    },
    /// Rename a node.
    Mv {
        /// Current path.
        from: String,
        /// New path.
        to: String,
    },
    /// Change permission bits.
    Chmod {
        /// Permission bits, in octal.
        #[arg(value_parser = parse_mode)]
        mode: u32,
        /// Node to change.
        path: String,
    },
    /// Extended attributes.
    Xattr {
        /// Attribute operation.
        #[command(subcommand)]
        cmd: XattrCmd,
    },
    /// Run concurrent callers against the tree and report the outcome.
    Stress {
        /// Number of concurrent callers.
        #[arg(short = 'n', long, default_value = "8")]
        callers: usize,
        /// File cycles per caller.
        #[arg(short, long, default_value = "100")]
        ops: usize,
        /// Bytes written per file.
        #[arg(short, long, default_value = "4096")]
        size: usize,
    },
}

/// Extended attribute operations.
#[derive(Subcommand, Debug, Clone)]
pub enum XattrCmd {
    /// Print one attribute value, or every attribute name when `name` is omitted.
    Get {
        /// Node to inspect.
        path: String,
        /// Attribute name.
        name: Option<String>,
    },
    /// Set an attribute.
    Set {
        /// Node to change.
        path: String,
        /// Attribute name.
        name: String,
        /// New value.
        value: String,
    },
}

/// Outcome of a stress run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StressReport {
    /// File cycles that completed.
    pub successes: u64,
    /// File cycles that failed at some step.
    pub failures: u64,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("invalid octal mode {}", s)),
    }
}

impl Cli {
    /// Load and validate the configuration named on the command line.
    pub fn load_config(&self) -> Result<DaemonConfig> {
        DaemonConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))
    }

    /// Build the tree described by `config` and run the command.
    pub async fn run(self, config: DaemonConfig) -> Result<()> {
        let tree = BrickTree::build(&config.root)?;
        let mut stdout = std::io::stdout().lock();
        let result = self.command.execute(&tree, &mut stdout).await;
        tree.log_membership_events();
        result
    }
}

impl Command {
    /// Run this command against `tree`, writing its output to `out`.
    pub async fn execute(&self, tree: &BrickTree, out: &mut dyn Write) -> Result<()> {
        let ctx = Context::current();
        let root = tree.root();
        match self {
            Command::Check => check(tree, out),
            Command::Stat { path } => stat(root, &ctx, path, out),
            Command::Ls { path } => ls(root, &ctx, path, out),
            Command::Cat { path } => cat(root, &ctx, path, out),
            Command::Put { local, path, mode } => {
                let data = std::fs::read(local)
                    .with_context(|| format!("reading {}", local.display()))?;
                put(root, &ctx, path, *mode, &data)?;
                writeln!(out, "{} bytes -> {}", data.len(), path)?;
                Ok(())
            }
            Command::Mkdir { path, mode } => Ok(root
                .mkdir(&ctx, path, *mode)
                .with_context(|| format!("mkdir {}", path))?),
            Command::Rm { path } => Ok(root
                .unlink(&ctx, path)
                .with_context(|| format!("rm {}", path))?),
            Command::Rmdir { path } => Ok(root
                .rmdir(&ctx, path)
                .with_context(|| format!("rmdir {}", path))?),
            Command::Mv { from, to } => Ok(root
                .rename(&ctx, from, to)
                .with_context(|| format!("mv {} {}", from, to))?),
            Command::Chmod { mode, path } => Ok(root
                .chmod(&ctx, path, *mode)
                .with_context(|| format!("chmod {}", path))?),
            Command::Xattr { cmd } => xattr(root, &ctx, cmd, out),
            Command::Stress {
                callers,
                ops,
                size,
            } => {
                let started = Instant::now();
                let report = stress(tree.root_arc(), *callers, *ops, *size).await?;
                writeln!(
                    out,
                    "stress: {} callers x {} ops: {} ok, {} failed in {:.2?}",
                    callers,
                    ops,
                    report.successes,
                    report.failures,
                    started.elapsed()
                )?;
                report_mirrors(tree, out)
            }
        }
    }
}

fn check(tree: &BrickTree, out: &mut dyn Write) -> Result<()> {
    let ctx = Context::current();
    let root = tree.root();
    let attr = root
        .getattr(&ctx, "/")
        .with_context(|| format!("root of {} is not reachable", tree.root_name()))?;
    if !attr.is_dir() {
        anyhow::bail!("root of {} is not a directory", tree.root_name());
    }
    writeln!(out, "Root: {}", tree.root_name())?;
    match root.statfs(&ctx, "/") {
        Ok(st) => writeln!(
            out,
            "Blocks: {} total, {} free ({} byte blocks)",
            st.blocks, st.bfree, st.bsize
        )?,
        Err(e) => warn!("statfs on {} failed: {}", tree.root_name(), e),
    }
    report_mirrors(tree, out)?;
    for (name, stats) in tree.cache_stats() {
        writeln!(
            out,
            "Cache {}: {} hits, {} misses, {} invalidations, {} errors",
            name, stats.hits, stats.misses, stats.invalidations, stats.cache_errors
        )?;
    }
    Ok(())
}

fn report_mirrors(tree: &BrickTree, out: &mut dyn Write) -> Result<()> {
    for (name, stats) in tree.mirror_stats() {
        writeln!(
            out,
            "Mirror {}: {}/{} active, {} fan-outs, {} rollbacks, {} ejections",
            name, stats.active, stats.subvolumes, stats.fan_outs, stats.rollbacks, stats.ejections
        )?;
    }
    Ok(())
}

fn stat(root: &dyn Brick, ctx: &Context, path: &str, out: &mut dyn Write) -> Result<()> {
    let attr = root
        .getattr(ctx, path)
        .with_context(|| format!("stat {}", path))?;
    writeln!(out, "Path: {}", path)?;
    writeln!(out, "Type: {:?}", attr.kind)?;
    writeln!(out, "Mode: {:o}", attr.perm)?;
    writeln!(out, "Size: {}", attr.size)?;
    writeln!(out, "Links: {}", attr.nlink)?;
    writeln!(out, "Owner: {}:{}", attr.uid, attr.gid)?;
    writeln!(out, "Inode: {}", attr.ino)?;
    writeln!(out, "Modified: {}.{:09}", attr.mtime.secs, attr.mtime.nsecs)?;
    if attr.kind == FileKind::Symlink {
        writeln!(out, "Target: {}", root.readlink(ctx, path)?)?;
    }
    Ok(())
}

fn ls(root: &dyn Brick, ctx: &Context, path: &str, out: &mut dyn Write) -> Result<()> {
    let fh = root
        .opendir(ctx, path)
        .with_context(|| format!("opendir {}", path))?;
    let mut listing = Vec::new();
    let mut offset = 0;
    let listed = loop {
        match root.readdir(ctx, path, fh, offset) {
            Ok(entries) => match entries.last() {
                Some(last) => {
                    offset = last.next_offset;
                    listing.extend(entries);
                }
                None => break Ok(()),
            },
            Err(e) => break Err(e),
        }
    };
    if let Err(e) = root.releasedir(ctx, path, fh) {
        warn!("releasedir {} failed: {}", path, e);
    }
    listed.with_context(|| format!("readdir {}", path))?;

    for entry in listing {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        let marker = if entry.kind == FileKind::Directory { "/" } else { "" };
        writeln!(out, "{}{}", entry.name, marker)?;
    }
    Ok(())
}

fn cat(root: &dyn Brick, ctx: &Context, path: &str, out: &mut dyn Write) -> Result<()> {
    let fh = root
        .open(ctx, path, OpenFlags::read_only())
        .with_context(|| format!("open {}", path))?;
    let mut offset = 0u64;
    let copied: Result<()> = loop {
        match root.read(ctx, path, fh, offset, CHUNK) {
            Ok(chunk) if chunk.is_empty() => break Ok(()),
            Ok(chunk) => {
                offset += chunk.len() as u64;
                if let Err(e) = out.write_all(&chunk) {
                    break Err(e.into());
                }
            }
            Err(e) => break Err(anyhow::Error::new(e).context(format!("read {}", path))),
        }
    };
    if let Err(e) = root.release(ctx, path, fh) {
        warn!("release {} failed: {}", path, e);
    }
    copied
}

/// Create `path` if needed and replace its contents with `data`.
pub fn put(root: &dyn Brick, ctx: &Context, path: &str, mode: u32, data: &[u8]) -> Result<()> {
    match root.mknod(ctx, path, FileKind::RegularFile.type_bits() | mode, 0) {
        Ok(()) => {}
        Err(e) if e.is(libc::EEXIST) => {}
        Err(e) => return Err(anyhow::Error::new(e).context(format!("create {}", path))),
    }
    let fh = root
        .open(ctx, path, OpenFlags::read_write().with_extra(libc::O_TRUNC))
        .with_context(|| format!("open {}", path))?;
    let mut written = 0;
    let stored: Result<()> = loop {
        if written == data.len() {
            break root
                .flush(ctx, path, fh)
                .with_context(|| format!("flush {}", path));
        }
        let end = (written + CHUNK).min(data.len());
        match root.write(ctx, path, fh, written as u64, &data[written..end]) {
            Ok(0) => break Err(anyhow::anyhow!("write {}: no progress", path)),
            Ok(n) => written += n,
            Err(e) => break Err(anyhow::Error::new(e).context(format!("write {}", path))),
        }
    };
    let released = root
        .release(ctx, path, fh)
        .with_context(|| format!("release {}", path));
    stored.and(released)
}

fn xattr(root: &dyn Brick, ctx: &Context, cmd: &XattrCmd, out: &mut dyn Write) -> Result<()> {
    match cmd {
        XattrCmd::Get { path, name: None } => {
            for name in root
                .listxattr(ctx, path)
                .with_context(|| format!("listxattr {}", path))?
            {
                writeln!(out, "{}", name)?;
            }
        }
        XattrCmd::Get {
            path,
            name: Some(name),
        } => {
            let value = root
                .getxattr(ctx, path, name)
                .with_context(|| format!("getxattr {} {}", path, name))?;
            writeln!(out, "{}", String::from_utf8_lossy(&value))?;
        }
        XattrCmd::Set { path, name, value } => root
            .setxattr(ctx, path, name, value.as_bytes(), XattrFlags::Either)
            .with_context(|| format!("setxattr {} {}", path, name))?,
    }
    Ok(())
}

fn stress_cycle(root: &dyn Brick, ctx: &Context, path: &str, data: &[u8]) -> Result<()> {
    put(root, ctx, path, 0o644, data)?;
    let attr = root.getattr(ctx, path)?;
    if attr.size != data.len() as u64 {
        anyhow::bail!("{}: size {} after writing {}", path, attr.size, data.len());
    }
    root.unlink(ctx, path)?;
    Ok(())
}

/// Run `callers` blocking callers, each creating, checking and removing `ops` files.
pub async fn stress(
    root: Arc<dyn Brick>,
    callers: usize,
    ops: usize,
    size: usize,
) -> Result<StressReport> {
    info!("stress: {} callers, {} ops each", callers, ops);
    let mut tasks = Vec::with_capacity(callers);
    for caller in 0..callers {
        let root = root.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let ctx = Context::current();
            let data = vec![caller as u8; size];
            let mut report = StressReport::default();
            for op in 0..ops {
                let path = format!("/stress-{}-{}", caller, op);
                match stress_cycle(root.as_ref(), &ctx, &path, &data) {
                    Ok(()) => report.successes += 1,
                    Err(e) => {
                        warn!("stress caller {}: {:#}", caller, e);
                        report.failures += 1;
                    }
                }
            }
            report
        }));
    }

    let mut total = StressReport::default();
    for task in tasks {
        let report = task.await?;
        total.successes += report.successes;
        total.failures += report.failures;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755"), Ok(0o755));
        assert_eq!(parse_mode("0o640"), Ok(0o640));
        assert_eq!(parse_mode("4755"), Ok(0o4755));
        assert!(parse_mode("789").is_err());
        assert!(parse_mode("17777").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["brickfs", "-c", "/tmp/b.toml", "mv", "/a", "/b"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/b.toml"));
        assert!(matches!(cli.command, Command::Mv { ref from, ref to } if from == "/a" && to == "/b"));

        let cli = Cli::try_parse_from(["brickfs", "-c", "x.json", "chmod", "600", "/f"]).unwrap();
        assert!(matches!(cli.command, Command::Chmod { mode: 0o600, .. }));

        let cli =
            Cli::try_parse_from(["brickfs", "-c", "x.json", "xattr", "get", "/f"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Xattr {
                cmd: XattrCmd::Get { name: None, .. }
            }
        ));
    }

    #[test]
    fn test_stress_defaults() {
        let cli = Cli::try_parse_from(["brickfs", "-c", "x.toml", "stress"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Stress {
                callers: 8,
                ops: 100,
                size: 4096
            }
        ));
    }
}
