pub mod config;
pub mod model;

pub use self::config::*;
pub use self::model::*;
