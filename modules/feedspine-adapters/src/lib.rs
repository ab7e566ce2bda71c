//! Feed adapters for the capture engine: RSS/Atom, JSON APIs,
//! filesystem listings, and an in-memory fixture source.

pub mod file_listing;
pub mod json_api;
pub mod rss;
pub mod static_source;

pub use file_listing::FileListingAdapter;
pub use json_api::JsonApiAdapter;
pub use rss::{discover_feed_urls, RssAdapter};
pub use static_source::StaticAdapter;
