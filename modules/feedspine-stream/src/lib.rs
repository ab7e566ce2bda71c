//! Backpressured streaming building blocks: a bounded buffer, lazy
//! combinators, a fan-in merger, and a chainable pipeline.

pub mod buffer;
pub mod combinators;
pub mod merge;
pub mod pipeline;

pub use buffer::{AsyncBuffer, BufferDone};
pub use combinators::{abatch, afilter, amap, atap};
pub use merge::{amerge, amerge_bounded};
pub use pipeline::Pipeline;
