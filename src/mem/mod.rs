//! Memory management: thread/handler stacks and the bare-metal heap.

pub mod heap;
pub mod stack;

pub use stack::{GrowthConvention, Stack, StackPool, StackSizeClass};
