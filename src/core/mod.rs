pub mod clock;
pub mod sample;
pub mod session;
pub mod stream;

pub use clock::ReferenceClock;
pub use sample::{DataMessage, Payload, Sample};
pub use session::Session;
pub use stream::{topic_matches, Schema, StreamSpec};
