pub mod api;
pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod ontology;
pub mod store;
pub mod sync;
