pub mod vizql;

pub use vizql::*;
