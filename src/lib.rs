// isothread - closures on isolated worker threads with synchronized shared refs

pub mod threading;

pub use threading::*;
