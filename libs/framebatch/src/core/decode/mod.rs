//! Hardware decode of one stream, with a bounded output queue.

mod decoder;

pub use decoder::{DecodedFrame, DecoderStats, HardwareDecoder, VideoDecode};
