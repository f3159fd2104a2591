// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

pub mod bucket;
pub mod cache;
pub mod config;
pub mod distribution;
pub mod error;
pub mod granularity;
pub mod record;
pub mod report;
pub mod source;
pub mod summary;

#[cfg(test)]
mod testing;

pub use error::Error;
