//! Linear algebra layer.
//!
//! Sparse matrix helpers, the ADMM KKT system and its LDLᵀ factorization.

pub mod kkt;
pub mod ldl;
pub mod sparse;
