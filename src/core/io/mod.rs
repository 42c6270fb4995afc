//! Byte range access to local or remote resources

pub mod range_reader;
