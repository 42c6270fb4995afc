//! Core building blocks: byte range IO, the container format, sparse data
//! access and statistics.

pub mod base;
pub mod container;
pub mod data;
pub mod io;
