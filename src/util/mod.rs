//! Small shared utilities that don't belong to any one subsystem.

pub mod arena;

pub use arena::Arena;
