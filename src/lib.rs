//! Quicksilver JIT: tiered compilation for the Quicksilver scripting VM
//!
//! Functions start in the bytecode interpreter, which profiles them. Hot
//! functions are promoted to a SimpleJIT tier and then to a FullJIT tier that
//! specializes on profile data, inlines small callees and guards every
//! assumption. A failed guard bails out to the interpreter for the rest of
//! the call; tiers never go back down.
//!
//! # Quick Start
//!
//! ```no_run
//! use quicksilver_jit::bytecode::Assembler;
//! use quicksilver_jit::bytecode::Program;
//! use quicksilver_jit::{Engine, JitConfig, Value};
//!
//! fn main() -> quicksilver_jit::Result<()> {
//!     let mut asm = Assembler::new("square", 1);
//!     asm.load_arg(0, 0).mul(1, 0, 0).ret(1);
//!     let program = Program {
//!         functions: vec![asm.finish()?],
//!         entry: 0,
//!     };
//!
//!     let mut engine = Engine::new(JitConfig::synchronous())?;
//!     let square = engine.load_program(&program)?;
//!     for i in 0..2000 {
//!         engine.call(square, &[Value::Int(i)])?;
//!     }
//!     println!("{}", engine.execution_mode(square));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`bytecode`] | Instruction set, function bodies, assembler |
//! | [`runtime`] | Values, object types, profiles, property guards |
//! | [`engine`] | Interpreter, dispatch through entry points, tiering glue |
//! | [`jit`] | Snapshots, IR, optimization, lowering, encoding, installation |
//! | [`config`] | Tier thresholds, inlining, hardening and code-page settings |
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod bytecode;
pub mod config;
pub mod engine;
pub mod jit;
pub mod runtime;

mod error;

pub use config::JitConfig;
pub use engine::{Engine, EngineStats};
pub use error::{CodeLocation, Error, ErrorKind, FailureCode, Result};
pub use jit::ExecutionMode;
pub use runtime::{FunctionId, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
