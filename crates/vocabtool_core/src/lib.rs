pub mod catalog;
pub mod config;
pub mod hierarchy;
pub mod loader;
pub mod plan;
pub mod records;
pub mod rest_store;
pub mod runtime;
pub mod script;
pub mod shape;
pub mod sqlite_store;
pub mod store;
