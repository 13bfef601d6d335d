//! Domain core for the ComfyUI batch companion.
//!
//! Everything in this crate is pure: parsing of workflow documents and
//! INI files, parameter binding, batch item construction, result
//! bookkeeping, and output naming. Network access lives in
//! `comfybatch-comfyui`.

pub mod batch;
pub mod error;
pub mod hashing;
pub mod ini;
pub mod input_image;
pub mod job;
pub mod mapping;
pub mod naming;
pub mod types;
pub mod workflow;
