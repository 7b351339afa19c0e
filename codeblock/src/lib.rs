// codeblock — user procedure blocks for circuit simulation
//
// Library root. Leaf-first: fragments and shape feed the assembler, the
// compile adapter turns units into artifacts, the cache decides when that
// is needed, the loader brings artifacts to life and the execution façade
// drives them once per solver step.

pub mod abi;
pub mod artifact;
pub mod assemble;
pub mod block;
pub mod cache;
pub mod compile;
pub mod diag;
pub mod exec;
pub mod fragments;
pub mod loader;
pub mod persist;
pub mod registry;
pub mod service;
pub mod shape;
pub mod state;
pub mod toolchain;
pub mod variant;
