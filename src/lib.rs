// SPDX-License-Identifier: MIT

//! ensemble-rs runs multi-agent workflows asynchronously.
//!
//! A workflow definition is normalized and validated by
//! [`ensemble::workflow::ConfigNormalizer`], then handed to the
//! [`ensemble::engine::ExecutionCoordinator`], which returns an execution id
//! immediately and drives the run in the background while recording its
//! lifecycle and trace.

pub mod adk;
pub mod ensemble;
