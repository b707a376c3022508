pub mod config;
pub mod extractor;
pub mod lifecycle;
pub mod provider;
pub mod reconciler;
pub mod store;
pub mod terminal;
pub mod vault;
