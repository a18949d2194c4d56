// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

pub mod config;
pub mod corpus;
pub mod http;
pub mod id;
pub mod jitter;
pub mod layout;
pub mod state;
pub mod stats;
