//! # calcgraph-prebuilt - Ready-to-Use Calculators
//!
//! Small, composable calculators covering the plumbing every streaming graph
//! ends up needing, so applications can focus on their own processing nodes:
//!
//! - [`PassThrough`] - copies inputs to outputs verbatim, preserving
//!   timestamps and propagating timestamp bounds (offset 0)
//! - [`CallbackSink`] - hands every arriving packet to a typed callback,
//!   packet by packet, without timestamp synchronization
//! - [`RangeSource`] - a source emitting a bounded integer range, then
//!   stopping gracefully
//! - [`ConstantSource`] - publishes a side packet value as the sole
//!   end-of-stream packet
//! - [`ImmediateMux`] - merges several streams in arrival order
//!
//! Register everything at once with [`register_prebuilt_calculators`], or
//! pick individual types:
//!
//! ```rust,ignore
//! use calcgraph_core::CalculatorRegistry;
//! use calcgraph_prebuilt::register_prebuilt_calculators;
//!
//! let mut registry = CalculatorRegistry::new();
//! register_prebuilt_calculators(&mut registry);
//! ```

mod callback_sink;
mod mux;
mod pass_through;
mod sources;

pub use callback_sink::{CallbackSink, SinkCallback};
pub use mux::ImmediateMux;
pub use pass_through::PassThrough;
pub use sources::{ConstantSource, RangeSource};

use calcgraph_core::CalculatorRegistry;

/// Registers every prebuilt calculator under its canonical name.
pub fn register_prebuilt_calculators(registry: &mut CalculatorRegistry) {
    registry.register::<PassThrough>("PassThrough");
    registry.register::<CallbackSink>("CallbackSink");
    registry.register::<RangeSource>("RangeSource");
    registry.register::<ConstantSource>("ConstantSource");
    registry.register::<ImmediateMux>("ImmediateMux");
}
