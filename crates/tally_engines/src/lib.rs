#![forbid(unsafe_code)]

//! Pure building blocks of batch resolution and report emission. Nothing in
//! this crate touches storage or holds locks.

pub mod aggregate;
pub mod digest;
pub mod recalc;
pub mod render;
