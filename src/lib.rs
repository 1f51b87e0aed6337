pub mod aws;
pub mod cache;
pub mod cli;
pub mod config;
pub mod constants;
pub mod run;
