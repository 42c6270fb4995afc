pub mod format;
pub mod gate;
pub mod reader;

#[cfg(test)]
pub(crate) mod fixtures;
