//! The latest encoded payload, shared between one writer and many readers.
//!
//! The writer encodes into a back buffer it owns outright. Committing copies
//! the finished bytes into an immutable [`Bytes`] and swaps it into the
//! published slot under a write lock held only for the swap. Readers clone
//! the `Bytes` handle under a read lock, so no request ever copies a payload
//! and no reader can see the back buffer.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// One published payload and when it was committed.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub payload: Bytes,
    /// Number of commits so far; 0 until the first frame is published.
    pub sequence: u64,
    pub published_at: Option<Instant>,
}

impl Snapshot {
    /// Time since this payload was committed
    pub fn age(&self) -> Option<Duration> {
        self.published_at.map(|at| at.elapsed())
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Only ever created together with its single [`FrameWriter`].
pub struct PublishedFrame {
    published: RwLock<Snapshot>,
}

impl PublishedFrame {
    /// A fresh frame together with its writer
    pub fn with_writer() -> (Arc<Self>, FrameWriter) {
        let published = Arc::new(Self {
            published: RwLock::default(),
        });
        let writer = FrameWriter {
            target: published.clone(),
            back: Vec::new(),
            sequence: 0,
        };
        (published, writer)
    }

    /// The last committed payload, or an empty one before the first commit.
    pub fn read_snapshot(&self) -> Snapshot {
        // A panic elsewhere cannot leave the slot half-written: it is only
        // ever replaced whole.
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, snapshot: Snapshot) {
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

/// Exclusive writer for a [`PublishedFrame`].
pub struct FrameWriter {
    target: Arc<PublishedFrame>,
    back: Vec<u8>,
    sequence: u64,
}

impl FrameWriter {
    /// Start a new payload in the back buffer. Dropping the handle without
    /// committing leaves the published payload untouched.
    pub fn begin_write(&mut self) -> WriteHandle<'_> {
        self.back.clear();
        WriteHandle { writer: self }
    }

    pub fn committed(&self) -> u64 {
        self.sequence
    }
}

/// Back buffer being filled; derefs to the underlying `Vec<u8>`.
pub struct WriteHandle<'a> {
    writer: &'a mut FrameWriter,
}

impl WriteHandle<'_> {
    /// Make the written bytes the new published payload.
    pub fn commit(self) -> u64 {
        let writer = self.writer;
        let payload = Bytes::copy_from_slice(&writer.back);
        writer.sequence += 1;
        writer.target.publish(Snapshot {
            payload,
            sequence: writer.sequence,
            published_at: Some(Instant::now()),
        });
        writer.back.clear();
        writer.sequence
    }
}

impl Deref for WriteHandle<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.writer.back
    }
}

impl DerefMut for WriteHandle<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.writer.back
    }
}
