pub mod config;
pub mod control;
pub mod crypto;
pub mod engine;
pub mod fleet;
pub mod ledger;
pub mod ledger_postgres;
pub mod ledger_redis;
pub mod liveness;
pub mod listing;
pub mod locks;
pub mod metrics;
pub mod notify;
pub mod notify_queue;
pub mod notify_queue_redis;
pub mod retry;
pub mod routes;
pub mod rpc;
pub mod state;
pub mod telemetry;
