//! OA report formats, decoding and the consumer-side drain protocol.

pub mod delta;
pub mod devinfo;
pub mod drain;
pub mod exponent;
pub mod format;
pub mod record;
pub mod report;
pub mod stats;
