mod codec;
mod conversation;
mod error;
mod metrics;
mod raw;
mod timefmt;

pub use codec::{CODEC_ZLIB, compress_events, decompress_events};
pub use conversation::{
    ConversationStore, ConversationTxn, SessionRow, SessionSummary, ToolUse, TurnRow,
};
pub use error::{Error, Result};
pub use metrics::{
    Bucket, HISTOGRAM_BOUNDS, HISTOGRAM_OVERFLOW, MetricKey, MetricOp, MetricsStore, Scope,
    histogram_bound_for,
};
pub use raw::{RawBatchMeta, RawStore, ScanIter};
