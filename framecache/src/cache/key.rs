//! Cache key fingerprinting.
//!
//! Keys are reduced to a 64-bit fingerprint by appending the raw bits of each
//! contributing field, in a fixed order, into a running FNV-1a combiner.
//! Fingerprints may collide; tables always confirm a hash match with `==`.
//!
//! # Time-varying inputs
//!
//! The render time only contributes to an [`ImageKey`] when the producing node
//! declares its output as varying over time (or animated). Every call site that
//! builds a key for the same logical result must agree on that flag, otherwise
//! two keys for the same image diverge. [`ImageKey::new_checked`] asserts the
//! flag against a canonical source in debug builds.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::params::{BitDepth, RectI};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Running 64-bit hash combiner.
///
/// # Example
///
/// ```
/// use framecache::cache::Hash64;
///
/// let mut a = Hash64::new();
/// a.append(42u64).append(1.5f64).append(true);
///
/// let mut b = Hash64::new();
/// b.append(42u64).append(1.5f64).append(true);
///
/// assert_eq!(a.finish(), b.finish());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hash64 {
    state: u64,
}

impl Hash64 {
    /// Create an empty combiner.
    pub fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    /// Append a field's raw bits.
    pub fn append<T: HashField>(&mut self, value: T) -> &mut Self {
        value.append_to(self);
        self
    }

    /// Append raw bytes.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        for byte in bytes {
            self.state ^= u64::from(*byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
        self
    }

    /// The fingerprint of everything appended so far.
    pub fn finish(&self) -> u64 {
        self.state
    }
}

impl Default for Hash64 {
    fn default() -> Self {
        Self::new()
    }
}

/// A value that can be appended to a [`Hash64`].
pub trait HashField {
    fn append_to(&self, hash: &mut Hash64);
}

impl HashField for u64 {
    fn append_to(&self, hash: &mut Hash64) {
        hash.append_bytes(&self.to_le_bytes());
    }
}

impl HashField for u32 {
    fn append_to(&self, hash: &mut Hash64) {
        hash.append_bytes(&self.to_le_bytes());
    }
}

impl HashField for i32 {
    fn append_to(&self, hash: &mut Hash64) {
        hash.append_bytes(&self.to_le_bytes());
    }
}

impl HashField for f64 {
    fn append_to(&self, hash: &mut Hash64) {
        hash.append_bytes(&float_identity(*self).to_le_bytes());
    }
}

/// Bits a float field is hashed and compared by.
///
/// -0.0 folds into 0.0, and a NaN equals itself, so key equality stays
/// reflexive and agrees with the fingerprint.
fn float_identity(value: f64) -> u64 {
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

fn same_float(a: f64, b: f64) -> bool {
    float_identity(a) == float_identity(b)
}

impl HashField for bool {
    fn append_to(&self, hash: &mut Hash64) {
        hash.append_bytes(&[u8::from(*self)]);
    }
}

/// Identity of the node that produced an entry.
///
/// Not part of a key's fingerprint or equality; used to drop every entry a
/// node owns when it is deleted or its inputs change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HolderId(pub u64);

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "holder#{}", self.0)
    }
}

/// A key that can index a [`CacheTable`](super::CacheTable).
pub trait CacheKey:
    Clone + PartialEq + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// 64-bit fingerprint; equal keys must return equal fingerprints.
    fn hash64(&self) -> u64;

    /// Node that owns entries stored under this key.
    fn holder(&self) -> HolderId;

    /// Hash of the producing node's state at the time the key was built.
    fn node_hash(&self) -> u64;
}

/// Key of a node's rendered image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImageKey {
    pub holder: HolderId,
    pub node_hash: u64,
    pub frame_varying: bool,
    pub time: f64,
    pub view: i32,
    pub pixel_aspect: f64,
    pub draft: bool,
}

impl ImageKey {
    /// Build a key. `frame_varying` must be true when the node's output
    /// varies with time or is animated.
    pub fn new(
        holder: HolderId,
        node_hash: u64,
        frame_varying: bool,
        time: f64,
        view: i32,
        pixel_aspect: f64,
        draft: bool,
    ) -> Self {
        Self {
            holder,
            node_hash,
            frame_varying,
            time,
            view,
            pixel_aspect,
            draft,
        }
    }

    /// Like [`ImageKey::new`], but asserts in debug builds that the caller's
    /// `frame_varying` flag matches the node's declared metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn new_checked(
        holder: HolderId,
        node_hash: u64,
        frame_varying: bool,
        time: f64,
        view: i32,
        pixel_aspect: f64,
        draft: bool,
        declared_frame_varying: impl FnOnce() -> bool,
    ) -> Self {
        debug_assert_eq!(
            frame_varying,
            declared_frame_varying(),
            "time-varying flag for {holder} disagrees with the node's declared metadata"
        );
        Self::new(
            holder,
            node_hash,
            frame_varying,
            time,
            view,
            pixel_aspect,
            draft,
        )
    }
}

impl PartialEq for ImageKey {
    fn eq(&self, other: &Self) -> bool {
        let same_time = !self.frame_varying || same_float(self.time, other.time);
        self.node_hash == other.node_hash
            && self.frame_varying == other.frame_varying
            && same_time
            && self.view == other.view
            && same_float(self.pixel_aspect, other.pixel_aspect)
            && self.draft == other.draft
    }
}

impl CacheKey for ImageKey {
    fn hash64(&self) -> u64 {
        let mut hash = Hash64::new();
        hash.append(self.node_hash);
        if self.frame_varying {
            hash.append(self.time);
        }
        hash.append(self.view)
            .append(self.pixel_aspect)
            .append(self.draft);
        hash.finish()
    }

    fn holder(&self) -> HolderId {
        self.holder
    }

    fn node_hash(&self) -> u64 {
        self.node_hash
    }
}

/// Key of a viewer texture.
///
/// Like [`ImageKey`], the holder is carried along but does not take part in
/// equality, so two viewers showing the same texture share one entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameKey {
    pub holder: HolderId,
    pub node_hash: u64,
    pub time: f64,
    pub view: i32,
    pub gain: f64,
    pub gamma: f64,
    pub mipmap_level: u32,
    pub texture_rect: RectI,
    pub bit_depth: BitDepth,
    pub draft: bool,
}

impl PartialEq for FrameKey {
    fn eq(&self, other: &Self) -> bool {
        self.node_hash == other.node_hash
            && same_float(self.time, other.time)
            && self.view == other.view
            && same_float(self.gain, other.gain)
            && same_float(self.gamma, other.gamma)
            && self.mipmap_level == other.mipmap_level
            && self.texture_rect == other.texture_rect
            && self.bit_depth == other.bit_depth
            && self.draft == other.draft
    }
}

impl CacheKey for FrameKey {
    fn hash64(&self) -> u64 {
        let mut hash = Hash64::new();
        hash.append(self.node_hash)
            .append(self.time)
            .append(self.view)
            .append(self.gain)
            .append(self.gamma)
            .append(self.mipmap_level)
            .append(self.texture_rect.x1)
            .append(self.texture_rect.y1)
            .append(self.texture_rect.x2)
            .append(self.texture_rect.y2)
            .append(self.bit_depth as u32)
            .append(self.draft);
        hash.finish()
    }

    fn holder(&self) -> HolderId {
        self.holder
    }

    fn node_hash(&self) -> u64 {
        self.node_hash
    }
}
