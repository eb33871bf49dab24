mod handoff;
mod interface;
mod prefetch;
mod segment;

pub use interface::*;
pub use segment::*;
