//! Archive ingestion and atomic release pipeline

pub mod archive;
pub mod executor;
pub mod fsm;
pub mod guard;
pub mod ledger;
pub mod locks;
pub mod stager;
pub mod swapper;
