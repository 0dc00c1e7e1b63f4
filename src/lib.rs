pub mod config;
pub mod fingerprint;
pub mod ingest;
pub mod ledger;
pub mod mail;
pub mod models;
pub mod notification;
pub mod orchestrator;
pub mod reconciler;
pub mod scheduler;
pub mod strategy;
