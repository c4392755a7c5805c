//! Stemcell director CLI - operator harness for stemcell uploads.

pub mod commands;
pub mod output;
