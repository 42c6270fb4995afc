//! Reading pagoda2 data containers over local files or HTTP range requests,
//! and running differential expression on the stored expression matrix.

pub mod core;
pub mod error;
pub mod single_cell;

pub use crate::core::container::reader::{ContainerReader, ReaderState};
pub use crate::core::data::controller::P2DataController;
pub use crate::core::data::sparse_accessor::SparseAccessor;
pub use crate::core::io::range_reader::{ContainerSource, RangeReader, RemoteConfig};
pub use crate::error::{P2Error, Result};
pub use crate::single_cell::dge::{DgeParams, TestResult};
pub use crate::single_cell::dge_coordinator::DgeJob;
pub use crate::single_cell::dge_engine::StatsEngine;
