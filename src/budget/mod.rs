//! Budget module - token accounting and model pricing.
//!
//! # Key Concepts
//! - Tokens: counts text with the cl100k tokenizer when the gateway does not
//!   report usage, and sizes the context window
//! - Pricing: static per-1K-token prices keyed by model name fragments

mod pricing;
mod tokens;

pub use pricing::{ModelPricing, PricingInfo};
pub use tokens::TokenCounter;
