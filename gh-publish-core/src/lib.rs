#![doc = "gh-publish-core: the upload pipeline behind gh-publish."]

//! This crate holds the resumable publish pipeline: scan the working tree,
//! commit the selected changes, push, and verify that the push landed on the
//! remote. Presentation, credentials and the concrete remote host client live
//! in the `gh-publish` CLI crate.
//!
//! # Usage
//! Build a [`runner::PipelineRunner`] from a [`contract::VcsPort`] (usually
//! [`git::GitCli`]), a [`contract::RemotePort`], a [`store::RunStore`] and a
//! [`config::PipelineConfig`], then call `publish` or `resume`.

pub mod cancel;
pub mod commit;
pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod git;
pub mod push;
pub mod retry;
pub mod run;
pub mod runner;
pub mod scan;
pub mod store;
pub mod verify;

pub use uuid::Uuid;
