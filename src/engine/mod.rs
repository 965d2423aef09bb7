//! Plan execution.
//!
//! This module provides the [`RunEngine`], which consumes a message stream
//! (a plan, optionally wrapped by preprocessors), writes and reads signals,
//! and reports the run as structured documents.
//!
//! # Example
//!
//! ```rust,ignore
//! use xafs_daq::engine::RunEngine;
//! use xafs_daq::plan::PlanStream;
//!
//! let engine = RunEngine::new();
//! let mut documents = engine.subscribe();
//! let summary = engine.run(&mut PlanStream::new(plan)).await?;
//! println!("{} events", summary.events().count());
//! ```

pub mod document;
pub mod run_engine;

pub use document::{DataKey, DescriptorDoc, Document, EventDoc, ExitStatus, StartDoc, StopDoc};
pub use run_engine::{RunEngine, RunSummary};
