//! Datagram decoding, per-channel buffering, statistics and archival.
pub mod buffer;
pub mod datagram;
pub mod stats;
pub mod storage;

pub use buffer::ChannelBuffer;
pub use datagram::{parse_datagram, Datagram};
pub use stats::{format_message, summarize, Sample, SummaryRecord};
pub use storage::{open_sink, DatasetSink, NullSink};
