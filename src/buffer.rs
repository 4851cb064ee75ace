//! Reference-counted, time-stamped data buffers.
//!
//! A [`Buffer`] is the unit of data flowing through links: a payload of
//! bytes, a presentation timestamp, an optional duration, flags, and the
//! format descriptor that was in effect when the buffer was produced.
//!
//! # Reference counting and copy-on-write
//!
//! `Buffer` is a cheap-to-clone handle (one `Arc` increment). The payload
//! is read-only for as long as more than one handle exists; any mutation
//! must go through [`Buffer::make_writable`], which deep-copies the shared
//! state first. The payload is freed exactly once, when the last handle is
//! dropped.
//!
//! ```rust
//! use aqueduct::buffer::Buffer;
//! use aqueduct::clock::ClockTime;
//!
//! let mut a = Buffer::from_bytes(vec![1, 2, 3]).with_pts(ClockTime::from_millis(40));
//! let b = a.clone();
//! assert_eq!(a.ref_count(), 2);
//!
//! // Mutation copies first; `b` keeps observing the original.
//! a.set_pts(ClockTime::from_millis(80));
//! assert_eq!(b.pts(), ClockTime::from_millis(40));
//! assert_eq!(a.pts(), ClockTime::from_millis(80));
//! ```

use crate::caps::Caps;
use crate::clock::ClockTime;
use bytes::Bytes;
use std::sync::Arc;

/// Flags indicating buffer properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// Buffer follows a discontinuity (seek, stream switch); timestamp
    /// monotonicity checks reset at this buffer.
    pub discont: bool,
    /// Buffer contains a sync point (keyframe equivalent).
    pub sync_point: bool,
    /// Buffer is a gap marker (silence, black frames) rather than data.
    pub gap: bool,
}

/// Shared buffer state behind the refcount.
#[derive(Debug, Clone)]
struct BufferInner {
    payload: Bytes,
    pts: ClockTime,
    duration: ClockTime,
    flags: BufferFlags,
    caps: Option<Arc<Caps>>,
}

/// A reference-counted, time-stamped chunk of data.
///
/// Created by a source stage, pushed downstream by ownership transfer, and
/// destroyed when the last handle drops. See the module docs for the
/// copy-on-write contract.
#[derive(Debug, Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Create a buffer from payload bytes. Timestamps start unset.
    pub fn from_bytes(payload: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                payload: payload.into(),
                pts: ClockTime::NONE,
                duration: ClockTime::NONE,
                flags: BufferFlags::default(),
                caps: None,
            }),
        }
    }

    /// Create an empty buffer (useful as a gap marker).
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    // ========================================================================
    // Builder-style constructors
    // ========================================================================

    /// Set the presentation timestamp (builder style).
    #[must_use]
    pub fn with_pts(mut self, pts: ClockTime) -> Self {
        self.writable_inner().pts = pts;
        self
    }

    /// Set the duration (builder style).
    #[must_use]
    pub fn with_duration(mut self, duration: ClockTime) -> Self {
        self.writable_inner().duration = duration;
        self
    }

    /// Set the flags (builder style).
    #[must_use]
    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.writable_inner().flags = flags;
        self
    }

    /// Set the format descriptor this buffer was produced under
    /// (builder style). Must be fixed caps.
    #[must_use]
    pub fn with_caps(mut self, caps: Arc<Caps>) -> Self {
        self.writable_inner().caps = Some(caps);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Get the payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    /// Get the payload as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner.payload
    }

    /// Get the payload length in bytes.
    pub fn len(&self) -> usize {
        self.inner.payload.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.payload.is_empty()
    }

    /// Get the presentation timestamp ([`ClockTime::NONE`] when unset).
    pub fn pts(&self) -> ClockTime {
        self.inner.pts
    }

    /// Get the duration ([`ClockTime::NONE`] when unset).
    pub fn duration(&self) -> ClockTime {
        self.inner.duration
    }

    /// Get the buffer flags.
    pub fn flags(&self) -> BufferFlags {
        self.inner.flags
    }

    /// Get the format descriptor this buffer was produced under.
    pub fn caps(&self) -> Option<&Arc<Caps>> {
        self.inner.caps.as_ref()
    }

    /// Get the number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Check if this handle is the only one (mutation allowed in place).
    pub fn is_writable(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    // ========================================================================
    // Copy-on-write mutation
    // ========================================================================

    /// Ensure this handle is uniquely owned, deep-copying shared state if
    /// necessary. After this call, [`Buffer::is_writable`] is true.
    pub fn make_writable(&mut self) {
        // Arc::make_mut clones the inner state when the refcount is > 1.
        // Bytes clones are cheap; the payload stays shared and read-only.
        Arc::make_mut(&mut self.inner);
    }

    /// Set the presentation timestamp, copying first if shared.
    pub fn set_pts(&mut self, pts: ClockTime) {
        self.writable_inner().pts = pts;
    }

    /// Set the duration, copying first if shared.
    pub fn set_duration(&mut self, duration: ClockTime) {
        self.writable_inner().duration = duration;
    }

    /// Set the flags, copying first if shared.
    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.writable_inner().flags = flags;
    }

    /// Set the format descriptor, copying first if shared.
    pub fn set_caps(&mut self, caps: Arc<Caps>) {
        self.writable_inner().caps = Some(caps);
    }

    /// Replace the payload, copying shared metadata first.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.writable_inner().payload = payload.into();
    }

    /// Create a sub-buffer viewing `range` of this buffer's payload.
    ///
    /// O(1): the payload bytes are shared, metadata is cloned.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Buffer {
        Buffer {
            inner: Arc::new(BufferInner {
                payload: self.inner.payload.slice(range),
                ..(*self.inner).clone()
            }),
        }
    }

    fn writable_inner(&mut self) -> &mut BufferInner {
        Arc::make_mut(&mut self.inner)
    }
}
