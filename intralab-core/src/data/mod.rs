//! Candle data: Parquet store, upstream sources, fetcher and gap reconciliation.

pub mod fetcher;
pub mod gaps;
pub mod http;
pub mod source;
pub mod store;
pub mod sync;

pub use fetcher::{CandleFetcher, FetchError, FetcherConfig};
pub use gaps::{find_gaps, CandleGap};
pub use http::HttpCandleSource;
pub use source::{CandleSource, SourceError};
pub use store::{CandleStore, StoreError, StoreMeta, StoredCandles, WriteSummary};
pub use sync::{sync_candles, SyncError, SyncReport};
