//! Wire protocols of streaming responses.
pub mod flush_writer;
pub(crate) mod json_patch;
pub mod sink;

pub use flush_writer::FlushWriter;
pub use flush_writer::FlushWriterOptions;
pub use sink::ChannelSink;
pub use sink::ResponseSink;
