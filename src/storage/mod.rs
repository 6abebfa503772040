pub mod container;
pub mod engine;
pub mod ring;
pub mod video;

pub use container::{SessionContainer, SessionMetadata, VideoIndexRow};
pub use engine::{DrainReport, StorageEngine, StorageEvent, StorageHandle, StreamSink};
pub use ring::{RingProbe, RingReader, RingWriter, SampleRing};
pub use video::SidecarWriter;
