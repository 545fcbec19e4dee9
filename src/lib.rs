pub mod app;
pub mod caches;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod fastqc;
pub mod files;
pub mod fs_util;
pub mod jobs;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod store;
pub mod update_sample;
