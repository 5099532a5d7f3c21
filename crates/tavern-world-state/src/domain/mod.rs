//! Domain model for the World State context.

pub mod derived;
pub mod locks;
pub mod paths;
pub mod rows;
pub mod state;
pub mod table;
