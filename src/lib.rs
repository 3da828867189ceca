// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod cli;
pub mod handlers;
pub mod reader;
pub mod supervisor;
pub mod telemetry;
pub mod template;
pub mod writer;
