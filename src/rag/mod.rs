pub mod chunker;
pub mod embed;
pub mod indexer;
pub mod retriever;
pub mod store;
pub mod watcher;
