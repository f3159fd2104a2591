// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use anyhow::Error as AnyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Any(#[from] AnyError),

    #[error("{0}")]
    IO(#[from] std::io::Error),

    #[error("{0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Bug(String),

    #[error("{0}")]
    Call(String),

    #[error("{0}")]
    InvalidConfig(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Unavailable(String),
}
