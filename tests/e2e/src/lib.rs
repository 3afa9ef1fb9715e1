//! End-to-end test support for the reverie workspace
//!
//! Mocks for the three provider seams (generator, embedder, session store)
//! and a tempdir-backed store harness. The mocks are deterministic: the
//! embedder hashes tokens into a fixed-dimension bag so lexically
//! overlapping texts land close in cosine space, and the generator replays
//! a script while recording every prompt it was shown.

pub mod mocks;
