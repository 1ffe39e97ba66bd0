//! Compiler core and register VM for the Flow request-routing language.
//!
//! The pipeline is `ast::Unit` -> [`ir::IrGenerator`] -> SSA [`ir::IrProgram`]
//! -> [`vm::TargetCodeGenerator`] -> [`vm::Program`], which is linked against a
//! [`vm::Runtime`] of native callbacks and executed one handler at a time by a
//! [`vm::Runner`]. [`compile`] runs the front half in one call.

pub mod ast;
pub mod config;
pub mod diagnostic;
pub mod ir;
pub mod types;
pub mod vm;

use tracing::debug;

use crate::ast::Unit;
use crate::config::CompileOptions;
use crate::diagnostic::Diagnostic;
use crate::ir::verify::VerifyError;
use crate::ir::{GenerateErrors, IrError, IrGenerator, IrProgram};
use crate::vm::{LoadError, Program, TargetCodeGenerator};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Generate(#[from] GenerateErrors),
    #[error("IR verification failed with {} error(s)", .0.len())]
    Verify(Vec<VerifyError>),
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl Error {
    /// Every problem as a renderable diagnostic.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Error::Generate(e) => e.diagnostics.clone(),
            Error::Verify(errors) => errors.iter().map(Diagnostic::from).collect(),
            Error::Ir(e) => vec![Diagnostic::from(e)],
            Error::Load(e) => vec![Diagnostic::from(e)],
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Generates, checks and optionally cleans up the IR for `exports`.
pub fn compile_ir(unit: &Unit, exports: &[&str], options: &CompileOptions) -> Result<IrProgram> {
    let mut ir = IrGenerator::new(options.clone()).generate(unit, exports)?;
    if options.verify {
        ir::verify::verify(&ir).map_err(Error::Verify)?;
    }
    if options.optimization_level >= 1 {
        let stats = ir::transform::optimize(&mut ir)?;
        debug!(?stats, "IR optimized");
        if options.verify {
            ir::verify::verify(&ir).map_err(Error::Verify)?;
        }
    }
    Ok(ir)
}

/// Full front half: AST to an unlinked `Program`.
pub fn compile(unit: &Unit, exports: &[&str], options: &CompileOptions) -> Result<Program> {
    let ir = compile_ir(unit, exports, options)?;
    Ok(TargetCodeGenerator::new().generate(&ir)?)
}
