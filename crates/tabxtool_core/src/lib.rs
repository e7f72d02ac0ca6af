pub mod check;
pub mod config;
pub mod error;
pub mod estimate;
pub mod output;
pub mod pack;
pub mod record;
pub mod report;
pub mod runtime;
pub mod tabx;
pub mod upload;
