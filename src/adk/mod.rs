// SPDX-License-Identifier: MIT

//! Agent kit: the model, tool and agent seams the engine drives.

pub mod agent;
pub mod error;
pub mod model;
pub mod tool;
