//! Register bytecode: encoding, the loadable `Program` artifact and the
//! `Runner` that executes one handler of it.

pub mod codegen;
pub mod instruction;
pub mod matcher;
pub mod params;
pub mod program;
pub mod runner;
pub mod runtime;

pub use codegen::{EncodeError, TargetCodeGenerator};
pub use instruction::{Instruction, Opcode, Operand};
pub use matcher::{MatchCaseDef, MatchDef, Matcher};
pub use params::{IntoRegister, Params};
pub use program::{CompiledHandler, ConstantPool, HandlerRef, LinkError, LoadError, Program};
pub use runner::{HEAP_TAG, RunError, RunResult, Runner, RunnerState};
pub use runtime::{NativeCallback, NativeFn, Runtime};
