//! Plan preprocessors.
//!
//! Preprocessors wrap a [`MessageStream`](crate::plan::MessageStream) and
//! return another one, so they compose by nesting:
//!
//! ```rust,ignore
//! let stream = PlanStream::new(plan);
//! let stream = secondary_mono_tracking_wrapper(stream, &secondary, &primary);
//! engine.run(&mut stream).await?;
//! ```

pub mod mono_tracking;

pub use mono_tracking::{fixed_offset_wrapper, secondary_mono_tracking_wrapper, MonoTracking};
