mod published;

pub use published::{FrameWriter, PublishedFrame, Snapshot, WriteHandle};
