//! Live frame publishing
//!
//! - Overlay drawing (boxes, labels, bitmap font)
//! - `FramePublisher`: JPEG encoding and latest-wins fan-out to viewers
//! - `PublishPump`: the task feeding captured frames into the publisher

pub mod font;
pub mod overlay;
pub mod publisher;
pub mod pump;

pub use publisher::{EncodedFrame, FramePublisher, Subscription};
pub use pump::PublishPump;
