mod aggregator;

pub use aggregator::{TextStreamAggregator, TextUpdate};
