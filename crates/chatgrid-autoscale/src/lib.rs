//! chatgrid-autoscale — worker count decisions from channel load.
//!
//! The decision logic is a pure function over the live worker count and
//! the total joined channel count; the [`AutoScaler`] wraps it with a
//! scale callback and a re-entrancy guard so a slow scale operation is
//! never stacked on top of itself.

mod scaler;

pub use scaler::{AutoScaler, ScaleCallback, ScaleDecision, ScaleFuture, decide, usage};
