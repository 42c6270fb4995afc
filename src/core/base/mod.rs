//! Module containing the statistical tests used for differential expression
//! between two groups of cells.

pub mod stats;
