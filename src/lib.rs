//! GPU OA performance-counter streams: format registry, report decoding,
//! delta accumulation, stream sessions and recordings.

pub mod config;
pub mod device;
pub mod export;
pub mod load;
pub mod oa;
pub mod recorder;
pub mod recording;
pub mod session;
