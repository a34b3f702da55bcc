pub(crate) mod accumulator;
pub mod builder;
pub mod defaults;
pub(crate) mod filter;
pub(crate) mod resegment;
pub mod runtime;
pub(crate) mod session;
pub mod traits;
