//! Module containing the sparse matrix access and the typed view on the
//! entries of a data container

pub mod controller;
pub mod sparse_accessor;
pub mod sparse_structures;
