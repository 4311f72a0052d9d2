/// Testing utilities for the MinBFT workspace
/// 
/// Provides:
/// - Random data generators
/// - Proptest strategies for protocol inputs
/// - Tracing setup for tests

pub mod generators;
pub mod logging;
pub mod strategies;

pub use generators::*;
pub use logging::init_test_logging;
