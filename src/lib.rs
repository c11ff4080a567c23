//! arachne: a distributed web-crawling framework.
//!
//! The core is a concurrent crawl execution engine: per-spider request
//! matrices scheduled under a global permit pool, persistent
//! success/failure history for dedup and retry, a latency-ranked per-host
//! proxy pool, a batched output pipeline, and master/worker task dispatch
//! over a long-lived framed socket.

pub mod cli;
pub mod config;
pub mod context;
pub mod counters;
pub mod crawler;
pub mod crawler_pool;
pub mod dispatch;
pub mod downloader;
pub mod engine;
pub mod history;
pub mod logging;
pub mod matrix;
pub mod output;
pub mod pipeline;
pub mod proxy;
pub mod request;
pub mod scheduler;
pub mod spider;
pub mod spider_queue;
pub mod status;
pub mod timer;

// Re-export the types an embedding application touches.
pub use config::AppConf;
pub use context::Context;
pub use downloader::{Downloader, DownloaderSet, FetchError, HttpDownloader, Response};
pub use engine::{Engine, EngineHandle};
pub use request::{DownloaderKind, Request};
pub use spider::{ParseFn, Rule, RuleTree, Spider, CUSTOM_LIMIT};
pub use status::Mode;
