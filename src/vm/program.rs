use std::fmt;
use std::net::IpAddr;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::RunnerLimits;
use crate::types::{Cidr, Signature};

use super::instruction::{self, Instruction, Opcode};
use super::matcher::{MatchDef, Matcher};
use super::runner::Runner;
use super::runtime::{NativeCallback, Runtime};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("invalid regular expression /{pattern}/: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("match table in handler #{handler} refers to missing label #{label}")]
    InvalidMatchLabel { handler: usize, label: usize },
    #[error("{handler}: jump at pc {pc} targets {target}, outside the handler")]
    InvalidJumpTarget { handler: String, pc: usize, target: usize },
    #[error("{handler}: handler call at pc {pc} names missing handler #{callee}")]
    InvalidHandlerCall { handler: String, pc: usize, callee: usize },
    #[error("match table #{index} targets pc {target}, outside handler #{handler}")]
    InvalidMatchTarget { index: usize, handler: usize, target: usize },
    #[error(transparent)]
    Encode(#[from] super::EncodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} native callback(s) not provided by the runtime", .unresolved.len())]
pub struct LinkError {
    pub unresolved: Vec<String>,
}

// ── Constant pool ────────────────────────────────────────────────────

/// Deduplicated constant tables of one program, addressed by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    numbers: Vec<i64>,
    strings: Vec<String>,
    ipaddrs: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
    regexes: Vec<String>,
    int_arrays: Vec<Vec<i64>>,
    string_arrays: Vec<Vec<String>>,
    ipaddr_arrays: Vec<Vec<IpAddr>>,
    cidr_arrays: Vec<Vec<Cidr>>,
    match_defs: Vec<MatchDef>,
    modules: Vec<(String, String)>,
    native_functions: Vec<Signature>,
    native_handlers: Vec<Signature>,
}

fn intern<T: PartialEq>(table: &mut Vec<T>, value: T) -> usize {
    if let Some(n) = table.iter().position(|v| *v == value) {
        return n;
    }
    table.push(value);
    table.len() - 1
}

impl ConstantPool {
    pub fn make_number(&mut self, n: i64) -> usize {
        intern(&mut self.numbers, n)
    }

    pub fn make_string(&mut self, s: &str) -> usize {
        match self.strings.iter().position(|v| v == s) {
            Some(n) => n,
            None => {
                self.strings.push(s.to_string());
                self.strings.len() - 1
            }
        }
    }

    pub fn make_ipaddr(&mut self, ip: IpAddr) -> usize {
        intern(&mut self.ipaddrs, ip)
    }

    pub fn make_cidr(&mut self, cidr: Cidr) -> usize {
        intern(&mut self.cidrs, cidr)
    }

    pub fn make_regex(&mut self, pattern: &str) -> usize {
        match self.regexes.iter().position(|v| v == pattern) {
            Some(n) => n,
            None => {
                self.regexes.push(pattern.to_string());
                self.regexes.len() - 1
            }
        }
    }

    pub fn make_int_array(&mut self, items: Vec<i64>) -> usize {
        intern(&mut self.int_arrays, items)
    }

    pub fn make_string_array(&mut self, items: Vec<String>) -> usize {
        intern(&mut self.string_arrays, items)
    }

    pub fn make_ipaddr_array(&mut self, items: Vec<IpAddr>) -> usize {
        intern(&mut self.ipaddr_arrays, items)
    }

    pub fn make_cidr_array(&mut self, items: Vec<Cidr>) -> usize {
        intern(&mut self.cidr_arrays, items)
    }

    /// Match tables are never shared; each call adds a new one.
    pub fn make_match_def(&mut self, def: MatchDef) -> usize {
        self.match_defs.push(def);
        self.match_defs.len() - 1
    }

    pub fn make_native_function(&mut self, signature: &Signature) -> usize {
        intern(&mut self.native_functions, signature.clone())
    }

    pub fn make_native_handler(&mut self, signature: &Signature) -> usize {
        intern(&mut self.native_handlers, signature.clone())
    }

    pub fn add_module(&mut self, module: &str, path: &str) {
        self.modules.push((module.to_string(), path.to_string()));
    }

    pub fn numbers(&self) -> &[i64] {
        &self.numbers
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn ipaddrs(&self) -> &[IpAddr] {
        &self.ipaddrs
    }

    pub fn cidrs(&self) -> &[Cidr] {
        &self.cidrs
    }

    pub fn regexes(&self) -> &[String] {
        &self.regexes
    }

    pub fn int_arrays(&self) -> &[Vec<i64>] {
        &self.int_arrays
    }

    pub fn string_arrays(&self) -> &[Vec<String>] {
        &self.string_arrays
    }

    pub fn ipaddr_arrays(&self) -> &[Vec<IpAddr>] {
        &self.ipaddr_arrays
    }

    pub fn cidr_arrays(&self) -> &[Vec<Cidr>] {
        &self.cidr_arrays
    }

    pub fn match_defs(&self) -> &[MatchDef] {
        &self.match_defs
    }

    pub(crate) fn match_def_mut(&mut self, index: usize) -> Option<&mut MatchDef> {
        self.match_defs.get_mut(index)
    }

    pub fn modules(&self) -> &[(String, String)] {
        &self.modules
    }

    pub fn native_functions(&self) -> &[Signature] {
        &self.native_functions
    }

    pub fn native_handlers(&self) -> &[Signature] {
        &self.native_handlers
    }
}

// ── Program ──────────────────────────────────────────────────────────

/// Bytecode of one handler.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledHandler {
    pub name: String,
    pub code: Vec<Instruction>,
    pub register_count: usize,
}

/// Loaded, immutable program. After `link` it can be shared by any number
/// of runners.
#[derive(Debug)]
pub struct Program {
    pool: ConstantPool,
    regexes: Vec<Regex>,
    matchers: Vec<Matcher>,
    handlers: Vec<CompiledHandler>,
    native_functions: Vec<Option<NativeCallback>>,
    native_handlers: Vec<Option<NativeCallback>>,
}

impl Program {
    /// Validates the code, sizes each register frame and compiles regexes
    /// and match tables.
    pub fn new(pool: ConstantPool, handlers: Vec<(String, Vec<Instruction>)>) -> Result<Program, LoadError> {
        let mut compiled = Vec::with_capacity(handlers.len());
        for (name, code) in handlers {
            for (pc, instr) in code.iter().enumerate() {
                let raw = instruction::opcode(*instr);
                if Opcode::from_raw(raw).is_none() {
                    return Err(super::EncodeError::UnknownOpcode { handler: name, pc, opcode: raw }.into());
                }
            }
            let register_count = instruction::compute_register_count(&code);
            compiled.push(CompiledHandler { name, code, register_count });
        }
        for handler in &compiled {
            check_transfers(handler, compiled.len())?;
        }
        for (index, def) in pool.match_defs().iter().enumerate() {
            let len = compiled.get(def.handler).map_or(0, |h| h.code.len());
            let mut targets = std::iter::once(def.else_pc).chain(def.cases.iter().map(|c| c.pc));
            if let Some(target) = targets.find(|pc| *pc >= len) {
                return Err(LoadError::InvalidMatchTarget { index, handler: def.handler, target });
            }
        }

        let regexes = pool
            .regexes()
            .iter()
            .map(|p| Regex::new(p).map_err(|source| LoadError::InvalidRegex { pattern: p.clone(), source }))
            .collect::<Result<Vec<_>, _>>()?;
        let matchers = pool
            .match_defs()
            .iter()
            .map(|def| Matcher::compile(def, &pool, &regexes))
            .collect::<Result<Vec<_>, _>>()?;

        let native_functions = vec![None; pool.native_functions().len()];
        let native_handlers = vec![None; pool.native_handlers().len()];
        debug!(handlers = compiled.len(), matchers = matchers.len(), "program loaded");
        Ok(Program { pool, regexes, matchers, handlers: compiled, native_functions, native_handlers })
    }

    /// Binds every native signature to its callback in `runtime`. Reports all
    /// missing signatures at once; bound ones stay bound either way.
    pub fn link(&mut self, runtime: &Runtime) -> Result<(), LinkError> {
        let mut unresolved = Vec::new();
        for (slot, sig) in self.native_functions.iter_mut().zip(self.pool.native_functions()) {
            *slot = runtime.find_function(sig).cloned();
            if slot.is_none() {
                unresolved.push(sig.to_string());
            }
        }
        for (slot, sig) in self.native_handlers.iter_mut().zip(self.pool.native_handlers()) {
            *slot = runtime.find_handler(sig).cloned();
            if slot.is_none() {
                unresolved.push(sig.to_string());
            }
        }
        if unresolved.is_empty() {
            debug!(
                functions = self.native_functions.len(),
                handlers = self.native_handlers.len(),
                "program linked"
            );
            Ok(())
        } else {
            warn!(unresolved = ?unresolved, "unresolved native callbacks");
            Err(LinkError { unresolved })
        }
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.pool
    }

    pub fn handlers(&self) -> &[CompiledHandler] {
        &self.handlers
    }

    pub fn handler(&self, index: usize) -> Option<&CompiledHandler> {
        self.handlers.get(index)
    }

    pub fn find_handler(&self, name: &str) -> Option<HandlerRef<'_>> {
        let index = self.handlers.iter().position(|h| h.name == name)?;
        Some(HandlerRef { program: self, index })
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.name.as_str())
    }

    pub(crate) fn matcher(&self, index: usize) -> Option<&Matcher> {
        self.matchers.get(index)
    }

    pub(crate) fn regex(&self, index: usize) -> Option<&Regex> {
        self.regexes.get(index)
    }

    pub(crate) fn native_function(&self, index: usize) -> Option<&NativeCallback> {
        self.native_functions.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn native_handler(&self, index: usize) -> Option<&NativeCallback> {
        self.native_handlers.get(index).and_then(Option::as_ref)
    }
}

/// Every jump must land inside its handler and every handler call must name
/// a handler of the program.
fn check_transfers(handler: &CompiledHandler, handler_count: usize) -> Result<(), LoadError> {
    for (pc, &instr) in handler.code.iter().enumerate() {
        let target = match Opcode::from_raw(instruction::opcode(instr)) {
            Some(Opcode::JMP) => instruction::operand_a(instr),
            Some(Opcode::JN | Opcode::JZ) => instruction::operand_b(instr),
            Some(Opcode::HCALL) => {
                let callee = instruction::operand_a(instr) as usize;
                if callee >= handler_count {
                    return Err(LoadError::InvalidHandlerCall { handler: handler.name.clone(), pc, callee });
                }
                continue;
            }
            _ => continue,
        } as usize;
        if target >= handler.code.len() {
            return Err(LoadError::InvalidJumpTarget { handler: handler.name.clone(), pc, target });
        }
    }
    Ok(())
}

/// Entry point into one handler of a program.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRef<'p> {
    program: &'p Program,
    index: usize,
}

impl<'p> HandlerRef<'p> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &'p str {
        self.program.handlers[self.index].name.as_str()
    }

    pub fn code(&self) -> &'p [Instruction] {
        &self.program.handlers[self.index].code
    }

    pub fn register_count(&self) -> usize {
        self.program.handlers[self.index].register_count
    }

    pub fn disassemble(&self) -> String {
        instruction::disassemble_all(self.code())
    }

    pub fn create_runner(&self) -> Runner<'p> {
        Runner::new(self.program, self.index, RunnerLimits::default())
    }

    pub fn create_runner_with(&self, limits: RunnerLimits) -> Runner<'p> {
        Runner::new(self.program, self.index, limits)
    }
}

// ── Listing ──────────────────────────────────────────────────────────

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = &self.pool;
        writeln!(f, "; Program")?;
        for (module, path) in pool.modules() {
            writeln!(f, "import {module} from {path:?}")?;
        }

        fn section<T>(f: &mut fmt::Formatter<'_>, title: &str, items: &[T], show: impl Fn(&T) -> String) -> fmt::Result {
            if items.is_empty() {
                return Ok(());
            }
            writeln!(f, "\n; {title}")?;
            for (n, item) in items.iter().enumerate() {
                writeln!(f, ".const {n:<4} = {}", show(item))?;
            }
            Ok(())
        }

        let list = |items: Vec<String>| format!("[{}]", items.join(", "));
        section(f, "numbers", pool.numbers(), |n| n.to_string())?;
        section(f, "strings", pool.strings(), |s| format!("{s:?}"))?;
        section(f, "ipaddrs", pool.ipaddrs(), |ip| ip.to_string())?;
        section(f, "cidrs", pool.cidrs(), |c| c.to_string())?;
        section(f, "regexes", pool.regexes(), |r| format!("/{r}/"))?;
        section(f, "int arrays", pool.int_arrays(), |a| list(a.iter().map(ToString::to_string).collect()))?;
        section(f, "string arrays", pool.string_arrays(), |a| list(a.iter().map(|s| format!("{s:?}")).collect()))?;
        section(f, "ipaddr arrays", pool.ipaddr_arrays(), |a| list(a.iter().map(ToString::to_string).collect()))?;
        section(f, "cidr arrays", pool.cidr_arrays(), |a| list(a.iter().map(ToString::to_string).collect()))?;
        section(f, "native functions", pool.native_functions(), ToString::to_string)?;
        section(f, "native handlers", pool.native_handlers(), ToString::to_string)?;

        for (n, def) in pool.match_defs().iter().enumerate() {
            let handler = self.handlers.get(def.handler).map_or("?", |h| h.name.as_str());
            writeln!(f, "\n; match {n} in {handler} ({})", def.class.operator())?;
            for case in &def.cases {
                let label = match def.class {
                    crate::ast::MatchClass::RegExp => pool.regexes().get(case.label).map(|r| format!("/{r}/")),
                    _ => pool.strings().get(case.label).map(|s| format!("{s:?}")),
                };
                writeln!(f, "  {:<20} -> {}", label.unwrap_or_else(|| "?".into()), case.pc)?;
            }
            writeln!(f, "  {:<20} -> {}", "else", def.else_pc)?;
        }

        for handler in &self.handlers {
            writeln!(f, "\n.handler {:<20} ; registers: {}", handler.name, handler.register_count)?;
            f.write_str(&instruction::disassemble_all(&handler.code))?;
        }
        Ok(())
    }
}
