//! Builds a configured brick tree bottom-up.

use std::sync::Arc;

use brickfs_cache::{CacheBrick, CacheStats};
use brickfs_core::{Brick, MemoryBrick, PassBrick, Subvolume};
use brickfs_mirror::{MirrorBrick, MirrorError, MirrorStats};
use brickfs_posix::{PosixBrick, PosixError};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::BrickConfig;

/// A brick in the configuration could not be constructed.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A posix brick root is unusable.
    #[error("posix brick {name}: {source}")]
    Posix {
        /// Brick name.
        name: String,
        /// Cause.
        #[source]
        source: PosixError,
    },

    /// A mirror could not be set up.
    #[error("mirror brick {name}: {source}")]
    Mirror {
        /// Brick name.
        name: String,
        /// Cause.
        #[source]
        source: MirrorError,
    },
}

/// A constructed brick tree.
///
/// Keeps typed handles to the mirrors and caches inside so their counters can
/// be reported after a run.
pub struct BrickTree {
    root: Subvolume,
    mirrors: Vec<Arc<MirrorBrick>>,
    caches: Vec<(String, Arc<CacheBrick>)>,
}

#[derive(Default)]
struct Builder {
    mirrors: Vec<Arc<MirrorBrick>>,
    caches: Vec<(String, Arc<CacheBrick>)>,
}

impl Builder {
    fn build_node(&mut self, config: &BrickConfig) -> Result<Subvolume, BuildError> {
        debug!("building {} brick {}", config.kind(), config.name());
        let brick: Arc<dyn Brick> = match config {
            BrickConfig::Pass { child, .. } => Arc::new(PassBrick::new(self.build_node(child)?)),
            BrickConfig::Posix { name, path } => Arc::new(
                PosixBrick::new(name.clone(), path.clone()).map_err(|source| BuildError::Posix {
                    name: name.clone(),
                    source,
                })?,
            ),
            BrickConfig::Memory { .. } => Arc::new(MemoryBrick::new()),
            BrickConfig::Mirror { name, subvolumes } => {
                let subvolumes = subvolumes
                    .iter()
                    .map(|sub| self.build_node(sub))
                    .collect::<Result<Vec<_>, _>>()?;
                let mirror = Arc::new(MirrorBrick::new(name.clone(), subvolumes).map_err(
                    |source| BuildError::Mirror {
                        name: name.clone(),
                        source,
                    },
                )?);
                self.mirrors.push(mirror.clone());
                mirror
            }
            BrickConfig::Cache {
                name,
                origin,
                cache,
            } => {
                let origin = self.build_node(origin)?;
                let cache = self.build_node(cache)?;
                let brick = Arc::new(CacheBrick::new(origin, cache));
                self.caches.push((name.clone(), brick.clone()));
                brick
            }
        };
        Ok(Subvolume::new(config.name(), brick))
    }
}

impl BrickTree {
    /// Build every brick in `config`, children before parents.
    pub fn build(config: &BrickConfig) -> Result<Self, BuildError> {
        let mut builder = Builder::default();
        let root = builder.build_node(config)?;
        info!(
            "brick tree ready: root {} ({}), {} bricks",
            config.name(),
            config.kind(),
            config.count()
        );
        Ok(BrickTree {
            root,
            mirrors: builder.mirrors,
            caches: builder.caches,
        })
    }

    /// The top brick.
    pub fn root(&self) -> &dyn Brick {
        self.root.brick()
    }

    /// Shared handle to the top brick.
    pub fn root_arc(&self) -> Arc<dyn Brick> {
        self.root.brick_arc()
    }

    /// Name of the top brick.
    pub fn root_name(&self) -> &str {
        self.root.name()
    }

    /// Counters of every mirror in the tree, innermost first.
    pub fn mirror_stats(&self) -> Vec<(String, MirrorStats)> {
        self.mirrors
            .iter()
            .map(|m| (m.name().to_string(), m.stats()))
            .collect()
    }

    /// Counters of every cache in the tree, innermost first.
    pub fn cache_stats(&self) -> Vec<(String, CacheStats)> {
        self.caches
            .iter()
            .map(|(name, c)| (name.clone(), c.stats()))
            .collect()
    }

    /// Log membership changes every mirror recorded since the last call.
    pub fn log_membership_events(&self) {
        for mirror in &self.mirrors {
            for event in mirror.drain_events() {
                info!("mirror {}: {:?}", mirror.name(), event);
            }
        }
    }
}
