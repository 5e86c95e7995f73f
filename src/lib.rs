pub mod abort;
pub mod annotation;
pub mod app;
pub mod chains;
pub mod classify;
pub mod config;
pub mod domain;
pub mod error;
pub mod forestall;
pub mod fs_util;
pub(crate) mod http;
pub mod output;
pub mod store;
pub mod sync;
pub mod trace;
pub mod trajectory;
pub mod upload;
