pub mod callback;
pub mod config;
pub mod downstream;
pub mod drip;
pub mod error;
pub mod worker;
