//! Contains the differential expression functionality: the per gene tests,
//! the message driven engine and the job coordinating it with a data source.

pub mod dge;
pub mod dge_coordinator;
pub mod dge_engine;
