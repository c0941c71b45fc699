//! Whole-kernel scenarios running on the host architecture.
