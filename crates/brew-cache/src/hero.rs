//! The hero slot: one always-available image for cold start.
//!
//! The slot lives in its own directory beside the general image store. It is not
//! subject to memory eviction, metadata caps, or the version guard, and it is read
//! synchronously so the very first frame can show the last known good image.

use crate::error::Result;
use crate::image_codec;
use crate::state::StateCell;
use crate::store::{DiskTier, Lookup};
use image::DynamicImage;
use std::sync::Arc;

const HERO_FILE: &str = "hero.img";

#[derive(Debug)]
pub struct HeroSlot {
    disk: DiskTier,
    state: Arc<StateCell>,
}

impl HeroSlot {
    pub(crate) fn new(disk: DiskTier, state: Arc<StateCell>) -> Self {
        Self { disk, state }
    }

    /// Blocking read and decode of the slot that never modifies it. The format is
    /// detected from the file's signature, so either PNG or JPEG contents are accepted.
    pub fn lookup(&self) -> Lookup<DynamicImage> {
        if !self.disk.exists(HERO_FILE) {
            return Lookup::Miss;
        }
        let Some(bytes) = self.disk.read(HERO_FILE) else {
            return Lookup::Damaged;
        };
        match image_codec::decompress(&bytes) {
            Ok(image) => Lookup::Hit(image),
            Err(err) => {
                tracing::debug!(
                    target = "brew.cache",
                    path = %self.disk.path_for(HERO_FILE).display(),
                    error = %err,
                    "undecodable hero image"
                );
                Lookup::Damaged
            }
        }
    }

    /// Like [`Self::lookup`], but deletes a slot that cannot be decoded. Must run on the
    /// owning cache's worker.
    pub(crate) fn load(&self) -> Option<DynamicImage> {
        match self.lookup() {
            Lookup::Hit(image) => Some(image),
            Lookup::Miss => None,
            Lookup::Damaged => {
                self.disk.delete(HERO_FILE, "hero.decode");
                None
            }
        }
    }

    pub fn identity(&self) -> Option<String> {
        self.state.snapshot().hero_identity
    }

    pub fn needs_replacement(&self, current: &str) -> bool {
        self.identity().as_deref() != Some(current) || !self.disk.exists(HERO_FILE)
    }

    /// Compresses and stores `image`, then records `identity`.
    ///
    /// The file is replaced atomically; the identity is only recorded once the file is in
    /// place, so a crash in between leaves a slot that reports it needs replacement.
    pub fn replace(&self, image: &DynamicImage, identity: &str, quality: u8) -> Result<()> {
        let (bytes, format) = image_codec::compress(image, quality)?;
        self.disk.write(HERO_FILE, &bytes)?;
        self.state.update(|state| {
            state.hero_identity = Some(identity.to_string());
        })?;
        tracing::debug!(
            target = "brew.cache",
            format = format.extension(),
            bytes = bytes.len(),
            "replaced hero image"
        );
        Ok(())
    }

    pub(crate) fn clear(&self) -> Result<()> {
        self.disk.delete(HERO_FILE, "hero.clear");
        self.state.update(|state| state.hero_identity = None)
    }
}
