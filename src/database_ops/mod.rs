pub mod codex;
pub mod db;
pub mod ipfs;
pub mod marketplace;
pub mod memory_store;
pub mod pg_store;
pub mod store;
pub mod subgraph;
pub mod worker_manager;
