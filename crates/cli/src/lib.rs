// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Reference driver for the rollback core: a sequential Time Warp dispatcher,
//! a PHOLD-style demo model and the `timewarp` commands built on them.

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod phold;
pub mod telemetry;
