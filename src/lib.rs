//! Allele filter engine and interpretation workflow for clinical variant
//! interpretation.

pub mod assessment;
pub mod cli;
pub mod common;
pub mod conf;
pub mod db;
pub mod err;
pub mod filterconfig;
pub mod filters;
pub mod genepanel;
pub mod shadow;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
