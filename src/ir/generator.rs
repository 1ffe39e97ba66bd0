//! AST to SSA lowering.
//!
//! One depth-first walk per handler. Variables map straight to the value of
//! their latest write; `if` and `match` give each arm its own copy of the
//! scope and join the copies with phi nodes. Any new branching construct has
//! to do the same through `merge`, or values read after the join will not be
//! dominated by their definition (the verifier rejects that).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, instrument};

use crate::ast::{self, Expr, MatchCase, MatchClass, Span, Spanned, Stmt, Symbol, SymbolId, Unit};
use crate::config::{CompileOptions, HandlerCallMode, LocalsMode};
use crate::diagnostic::{Diagnostic, Severity};
use crate::types::LiteralType;

use super::{BinaryKind, BlockId, ConstId, Constant, HandlerId, IrBuilder, IrError, IrProgram, UnaryKind, Value};

/// Diagnostics from a failed generation run.
#[derive(Debug, thiserror::Error)]
#[error("{} error(s) while generating IR", .error_count)]
pub struct GenerateErrors {
    pub diagnostics: Vec<Diagnostic>,
    pub error_count: usize,
}

impl GenerateErrors {
    /// Formatted one-line messages, errors and warnings alike.
    pub fn messages(&self) -> Vec<String> {
        self.diagnostics.iter().map(ToString::to_string).collect()
    }
}

pub struct IrGenerator<'a> {
    options: CompileOptions,
    on_error: Option<Box<dyn FnMut(&str) + 'a>>,
}

impl<'a> IrGenerator<'a> {
    pub fn new(options: CompileOptions) -> Self {
        IrGenerator { options, on_error: None }
    }

    /// Installs a callback invoked with each formatted diagnostic as it is reported.
    pub fn with_error_handler(mut self, f: impl FnMut(&str) + 'a) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Lowers `unit`. An empty `exports` list exports every handler with a body.
    ///
    /// Generation does not stop at the first error: every handler is visited
    /// so one run reports everything wrong with the unit.
    #[instrument(skip_all, name = "generate", fields(exports = exports.len()))]
    pub fn generate(&mut self, unit: &Unit, exports: &[&str]) -> Result<IrProgram, GenerateErrors> {
        let mut program = IrProgram::new();
        let diagnostics = {
            let mut cx = Generation {
                unit,
                b: IrBuilder::new(&mut program),
                options: &self.options,
                on_error: self.on_error.as_mut().map(|f| &mut **f as &mut dyn FnMut(&str)),
                diagnostics: Vec::new(),
                scope: BTreeMap::new(),
                handler_stack: Vec::new(),
                handler_ids: HashMap::new(),
                pending: VecDeque::new(),
            };
            cx.run(exports);
            cx.diagnostics
        };

        let error_count = diagnostics.iter().filter(|d| d.severity == Severity::Error).count();
        if error_count > 0 {
            debug!(error_count, "generation failed");
            return Err(GenerateErrors { diagnostics, error_count });
        }
        debug!(handlers = program.handlers().count(), constants = program.constants().count(), "generation done");
        Ok(program)
    }
}

// ── Generation state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// SSA value of the latest write.
    Value(Value),
    /// Stack slot holding the variable.
    Slot(Value),
}

type Scope = BTreeMap<SymbolId, Binding>;

struct Generation<'g> {
    unit: &'g Unit,
    b: IrBuilder<'g>,
    options: &'g CompileOptions,
    on_error: Option<&'g mut dyn FnMut(&str)>,
    diagnostics: Vec<Diagnostic>,
    scope: Scope,
    /// Handlers currently being generated or inlined, outermost first.
    handler_stack: Vec<SymbolId>,
    handler_ids: HashMap<SymbolId, HandlerId>,
    /// Handlers referenced but not yet generated.
    pending: VecDeque<SymbolId>,
}

impl Generation<'_> {
    fn run(&mut self, exports: &[&str]) {
        for module in &self.unit.imports {
            let path = module.path.clone().unwrap_or_default();
            self.b.program_mut().add_import(module.module.clone(), path);
        }

        let mut roots = Vec::new();
        if exports.is_empty() {
            for (id, symbol) in self.unit.handlers() {
                if matches!(symbol, Symbol::Handler { body: Some(_), .. }) {
                    roots.push(id);
                }
            }
        } else {
            for name in exports {
                match self.unit.find(name) {
                    Some(id) if matches!(self.unit.symbol(id), Some(Symbol::Handler { .. })) => roots.push(id),
                    _ => self.report(
                        Diagnostic::error(format!("exported handler '{name}' is not defined"))
                            .with_code("FLOW-G001"),
                    ),
                }
            }
        }

        for id in &roots {
            self.handler_id(*id);
        }
        let mut done = HashSet::new();
        while let Some(id) = self.pending.pop_front() {
            if done.insert(id) {
                self.generate_handler(id);
            }
        }
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        if let Some(cb) = self.on_error.as_mut() {
            cb(&diagnostic.to_string());
        }
        self.diagnostics.push(diagnostic);
    }

    fn internal(&mut self, e: IrError, span: Span) {
        self.report(Diagnostic::from(&e).with_span(span, "while lowering this"));
    }

    /// Unwraps an IR builder result, reporting failures.
    fn ir<T>(&mut self, r: Result<T, IrError>, span: Span) -> Option<T> {
        match r {
            Ok(v) => Some(v),
            Err(e) => {
                self.internal(e, span);
                None
            }
        }
    }

    fn symbol_name(&self, id: SymbolId) -> String {
        self.unit.symbol(id).map_or_else(|| format!("#{}", id.0), |s| s.name().to_string())
    }

    /// IR handler for a handler symbol, created and queued on first request.
    fn handler_id(&mut self, sym: SymbolId) -> HandlerId {
        if let Some(id) = self.handler_ids.get(&sym) {
            return *id;
        }
        let name = self.symbol_name(sym);
        let id = self.b.program_mut().create_handler(name);
        self.handler_ids.insert(sym, id);
        self.pending.push_back(sym);
        id
    }

    // ── Handlers ─────────────────────────────────────────────────────

    fn generate_handler(&mut self, sym: SymbolId) {
        let unit = self.unit;
        let Some(Symbol::Handler { name, span, .. }) = unit.symbol(sym) else { return };
        let handler = self.handler_id(sym);
        let errors_before = self.error_count();

        self.b.set_handler(handler);
        self.scope.clear();
        self.handler_stack.clear();
        let entry = self.b.create_block("EntryPoint");
        let Some(entry) = self.ir(entry, *span) else { return };
        self.b.set_insert_point(entry);

        for var in &unit.scope {
            if let Some(Symbol::Variable { .. }) = unit.symbol(*var) {
                self.declare_variable(*var);
            }
        }

        self.codegen_inline(sym, *span);

        let f = self.b.program_mut().get_bool(false);
        let terminated = self.b.insert_point().is_some_and(|bb| self.b.program().is_terminated(bb));
        if !terminated {
            let r = self.b.create_ret(Value::Constant(f));
            self.ir(r, *span);
        }

        let blocks = self.b.program().handler(handler).map_or(0, |h| h.blocks().len());
        debug!(handler = %name, blocks, errors = self.error_count() - errors_before, "generated handler");
    }

    fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Error).count()
    }

    /// Emits the body of handler `sym` at the current insert point.
    fn codegen_inline(&mut self, sym: SymbolId, call_span: Span) {
        let unit = self.unit;
        let Some(Symbol::Handler { name, locals, body, span }) = unit.symbol(sym) else { return };

        if self.handler_stack.contains(&sym) {
            let chain: Vec<String> = self
                .handler_stack
                .iter()
                .chain(std::iter::once(&sym))
                .map(|h| self.symbol_name(*h))
                .collect();
            self.report(
                Diagnostic::error(format!("cannot recursively call handler '{name}'"))
                    .with_code("FLOW-G004")
                    .with_span(call_span, "recursive call")
                    .with_note(format!("call chain: {}", chain.join(" -> "))),
            );
            return;
        }

        let Some(body) = body else {
            self.report(
                Diagnostic::error(format!("handler '{name}' has no body"))
                    .with_code("FLOW-G009")
                    .with_span(*span, "declared here"),
            );
            return;
        };

        self.handler_stack.push(sym);
        for local in locals {
            self.declare_variable(*local);
        }
        self.codegen_stmt(body);
        self.handler_stack.pop();
    }

    fn declare_variable(&mut self, var: SymbolId) {
        let unit = self.unit;
        let Some(Symbol::Variable { name, initializer, span }) = unit.symbol(var) else {
            self.report(
                Diagnostic::error(format!("'{}' is not a variable", self.symbol_name(var))).with_code("FLOW-G010"),
            );
            return;
        };
        let Some(value) = self.codegen_expr(initializer) else { return };

        match self.options.locals {
            LocalsMode::Ssa => {
                self.scope.insert(var, Binding::Value(value));
            }
            LocalsMode::StackSlots => {
                let ty = self.b.program().type_of(value);
                let slot = self.b.create_alloca(ty, name);
                let Some(slot) = self.ir(slot, *span) else { return };
                let store = self.b.create_store(slot, value);
                self.ir(store, *span);
                self.scope.insert(var, Binding::Slot(slot));
            }
        }
    }

    // ── Statements ───────────────────────────────────────────────────

    fn codegen_stmt(&mut self, stmt: &Spanned<Stmt>) {
        match &stmt.node {
            Stmt::Expr(e) => {
                self.codegen_expr(e);
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.codegen_stmt(s);
                }
            }
            Stmt::Cond { condition, then_stmt, else_stmt } => {
                self.codegen_cond(condition, then_stmt, else_stmt.as_deref(), stmt.span)
            }
            Stmt::Match { condition, class, cases, else_stmt } => {
                self.codegen_match(condition, *class, cases, else_stmt.as_deref(), stmt.span)
            }
            Stmt::Assign { variable, value } => self.codegen_assign(*variable, value, stmt.span),
        }
    }

    fn codegen_assign(&mut self, var: SymbolId, value: &Spanned<Expr>, span: Span) {
        let Some(rhs) = self.codegen_expr(value) else { return };
        let Some(binding) = self.scope.get(&var).copied() else {
            self.report(
                Diagnostic::error(format!("cannot assign to '{}': not a variable in scope", self.symbol_name(var)))
                    .with_code("FLOW-G001")
                    .with_span(span, "assignment"),
            );
            return;
        };

        let (current, rhs_ty) = {
            let p = self.b.program();
            let current = match binding {
                Binding::Value(v) | Binding::Slot(v) => p.type_of(v),
            };
            (current, p.type_of(rhs))
        };
        if current != rhs_ty {
            self.report(
                Diagnostic::error(format!(
                    "cannot assign {rhs_ty} to variable '{}' of type {current}",
                    self.symbol_name(var)
                ))
                .with_code("FLOW-G003")
                .with_span(value.span, "this value"),
            );
            return;
        }

        match binding {
            Binding::Value(_) => {
                self.scope.insert(var, Binding::Value(rhs));
            }
            Binding::Slot(slot) => {
                let r = self.b.create_store(slot, rhs);
                self.ir(r, span);
            }
        }
    }

    fn codegen_cond(
        &mut self,
        condition: &Spanned<Expr>,
        then_stmt: &Spanned<Stmt>,
        else_stmt: Option<&Spanned<Stmt>>,
        span: Span,
    ) {
        let Some(cond) = self.codegen_expr(condition) else { return };
        if !self.expect_type(cond, LiteralType::Boolean, condition.span, "condition") {
            return;
        }

        let names: &[&str] = if else_stmt.is_some() { &["trueBlock", "falseBlock", "contBlock"] } else { &["trueBlock", "contBlock"] };
        let blocks = self.new_blocks(names);
        let Some(blocks) = self.ir(blocks, span) else { return };
        let (true_block, cont) = (blocks[0], blocks[blocks.len() - 1]);
        let else_target = if else_stmt.is_some() { blocks[1] } else { cont };
        let r = self.b.create_cond_br(cond, true_block, else_target);
        if self.ir(r, span).is_none() {
            return;
        }
        let Some(head) = self.b.insert_point() else { return };

        let snapshot = self.scope.clone();
        let mut arms = Vec::new();

        self.b.set_insert_point(true_block);
        self.codegen_stmt(then_stmt);
        self.close_arm(cont, &mut arms, span);

        self.scope = snapshot.clone();
        match else_stmt {
            Some(else_stmt) => {
                self.b.set_insert_point(else_target);
                self.codegen_stmt(else_stmt);
                self.close_arm(cont, &mut arms, span);
            }
            None => arms.push((head, snapshot)),
        }

        self.b.set_insert_point(cont);
        self.merge(arms, span);
    }

    fn codegen_match(
        &mut self,
        condition: &Spanned<Expr>,
        class: MatchClass,
        cases: &[MatchCase],
        else_stmt: Option<&Spanned<Stmt>>,
        span: Span,
    ) {
        let Some(subject) = self.codegen_expr(condition) else { return };
        if !self.expect_type(subject, LiteralType::String, condition.span, "match subject") {
            return;
        }
        let label_type = if class == MatchClass::RegExp { LiteralType::RegExp } else { LiteralType::String };

        let cont = self.b.create_block("match.cont");
        let Some(cont) = self.ir(cont, span) else { return };
        let mut table: Vec<(ConstId, BlockId)> = Vec::new();
        let mut seen: HashMap<ConstId, usize> = HashMap::new();
        let mut case_blocks = Vec::new();

        for (case_index, case) in cases.iter().enumerate() {
            let block = self.b.create_block("match.case");
            let Some(block) = self.ir(block, case.body.span) else { return };
            case_blocks.push(block);
            for label in &case.labels {
                let Some(id) = self.match_label(label, label_type) else { continue };
                match seen.get(&id) {
                    Some(prev) if *prev == case_index => {
                        self.report(
                            Diagnostic::warning("match label repeated within the same case")
                                .with_code("FLOW-G005")
                                .with_span(label.span, "repeated here"),
                        );
                    }
                    Some(_) => {
                        self.report(
                            Diagnostic::error("match label already handled by an earlier case")
                                .with_code("FLOW-G005")
                                .with_span(label.span, "duplicate label"),
                        );
                    }
                    None => {
                        seen.insert(id, case_index);
                        table.push((id, block));
                    }
                }
            }
        }

        let else_block = match else_stmt {
            Some(_) => {
                let b = self.b.create_block("match.else");
                let Some(b) = self.ir(b, span) else { return };
                b
            }
            None => cont,
        };

        let r = self.b.create_match(class, subject, table, else_block);
        if self.ir(r, span).is_none() {
            return;
        }
        let Some(head) = self.b.insert_point() else { return };

        let snapshot = self.scope.clone();
        let mut arms = Vec::new();
        for (case, block) in cases.iter().zip(case_blocks) {
            self.scope = snapshot.clone();
            self.b.set_insert_point(block);
            self.codegen_stmt(&case.body);
            self.close_arm(cont, &mut arms, span);
        }

        self.scope = snapshot.clone();
        match else_stmt {
            Some(else_stmt) => {
                self.b.set_insert_point(else_block);
                self.codegen_stmt(else_stmt);
                self.close_arm(cont, &mut arms, span);
            }
            None => arms.push((head, snapshot)),
        }

        self.b.set_insert_point(cont);
        self.merge(arms, span);
    }

    fn match_label(&mut self, label: &Spanned<Expr>, expected: LiteralType) -> Option<ConstId> {
        let value = self.codegen_expr(label)?;
        let ty = self.b.program().type_of(value);
        match value {
            Value::Constant(id) if ty == expected => Some(id),
            _ => {
                self.report(
                    Diagnostic::error(format!("match labels must be {expected} literals, found {ty}"))
                        .with_code("FLOW-G006")
                        .with_span(label.span, "this label"),
                );
                None
            }
        }
    }

    fn new_blocks(&mut self, names: &[&str]) -> Result<Vec<BlockId>, IrError> {
        names.iter().map(|n| self.b.create_block(n)).collect()
    }

    /// Ends the current arm with a branch to `cont` and records its scope.
    fn close_arm(&mut self, cont: BlockId, arms: &mut Vec<(BlockId, Scope)>, span: Span) {
        let r = self.b.create_br(cont);
        if self.ir(r, span).is_none() {
            return;
        }
        if let Some(end) = self.b.insert_point() {
            arms.push((end, self.scope.clone()));
        }
    }

    /// Joins the scopes of all arms reaching the current block.
    ///
    /// A variable bound to the same value on every arm keeps it; otherwise a
    /// phi node selects the incoming value per predecessor.
    fn merge(&mut self, arms: Vec<(BlockId, Scope)>, span: Span) {
        let Some((_, first)) = arms.first() else { return };
        let mut merged = Scope::new();
        for (var, binding) in first {
            let incoming: Option<Vec<(Value, BlockId)>> = arms
                .iter()
                .map(|(block, scope)| match scope.get(var) {
                    Some(Binding::Value(v)) => Some((*v, *block)),
                    _ => None,
                })
                .collect();

            let joined = match (binding, incoming) {
                (Binding::Slot(_), _) => *binding,
                (Binding::Value(v), Some(incoming)) if incoming.iter().all(|(x, _)| x == v) => *binding,
                (Binding::Value(_), Some(incoming)) => {
                    let name = self.symbol_name(*var);
                    match self.b.create_phi(incoming, &name) {
                        Ok(phi) => Binding::Value(phi),
                        Err(e) => {
                            self.internal(e, span);
                            continue;
                        }
                    }
                }
                // declared inside one arm only; not visible after the join
                (Binding::Value(_), None) => continue,
            };
            merged.insert(*var, joined);
        }
        self.scope = merged;
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn expect_type(&mut self, value: Value, expected: LiteralType, span: Span, what: &str) -> bool {
        let ty = self.b.program().type_of(value);
        if ty == expected {
            return true;
        }
        self.report(
            Diagnostic::error(format!("{what} must be {expected}, found {ty}"))
                .with_code("FLOW-G003")
                .with_span(span, format!("this is {ty}")),
        );
        false
    }

    fn codegen_expr(&mut self, expr: &Spanned<Expr>) -> Option<Value> {
        let span = expr.span;
        match &expr.node {
            Expr::Number(n) => Some(Value::Constant(self.b.program_mut().get_int(*n))),
            Expr::Bool(v) => Some(Value::Constant(self.b.program_mut().get_bool(*v))),
            Expr::String(s) => Some(Value::Constant(self.b.program_mut().get_string(s.clone()))),
            Expr::IPAddress(ip) => Some(Value::Constant(self.b.program_mut().get_ip(*ip))),
            Expr::Cidr(c) => Some(Value::Constant(self.b.program_mut().get_cidr(*c))),
            Expr::RegExp(pattern) => {
                if let Err(e) = regex::Regex::new(pattern) {
                    self.report(
                        Diagnostic::error(format!("invalid regular expression /{pattern}/"))
                            .with_code("FLOW-G008")
                            .with_span(span, "here")
                            .with_note(e.to_string()),
                    );
                    return None;
                }
                Some(Value::Constant(self.b.program_mut().get_regexp(pattern.clone())))
            }
            Expr::Array(items) => self.codegen_array(items, span),
            Expr::VariableRef(var) => self.codegen_variable(*var, span),
            Expr::HandlerRef(sym) => match self.unit.symbol(*sym) {
                Some(Symbol::Handler { .. }) => {
                    let h = self.handler_id(*sym);
                    Some(Value::Constant(self.b.program_mut().get_handler_ref(h)))
                }
                _ => {
                    self.report(
                        Diagnostic::error(format!("'{}' is not a handler", self.symbol_name(*sym)))
                            .with_code("FLOW-G010")
                            .with_span(span, "expected a handler"),
                    );
                    None
                }
            },
            Expr::RegExpGroup(group) => {
                let group_value = self.codegen_expr(group)?;
                if !self.expect_type(group_value, LiteralType::Number, group.span, "regex group index") {
                    return None;
                }
                let r = self.b.create_regexp_group(group_value, "group");
                self.ir(r, span)
            }
            Expr::Unary { op, operand } => self.codegen_unary(*op, operand, span),
            Expr::Binary { op, lhs, rhs } => self.codegen_binary(*op, lhs, rhs, span),
            Expr::Call { callee, args } => self.codegen_call(*callee, args, span),
        }
    }

    fn codegen_variable(&mut self, var: SymbolId, span: Span) -> Option<Value> {
        match self.scope.get(&var).copied() {
            Some(Binding::Value(v)) => Some(v),
            Some(Binding::Slot(slot)) => {
                let name = self.symbol_name(var);
                let r = self.b.create_load(slot, &name);
                self.ir(r, span)
            }
            None => {
                let d = match self.unit.symbol(var) {
                    Some(Symbol::Variable { name, .. }) => {
                        Diagnostic::error(format!("variable '{name}' is not in scope")).with_code("FLOW-G001")
                    }
                    Some(other) => Diagnostic::error(format!("'{}' is not a variable", other.name()))
                        .with_code("FLOW-G010")
                        .with_suggestion("refer to handlers by name only in calls or handler references"),
                    None => Diagnostic::error(format!("unknown symbol #{}", var.0)).with_code("FLOW-G001"),
                };
                self.report(d.with_span(span, "here"));
                None
            }
        }
    }

    fn codegen_array(&mut self, items: &[Spanned<Expr>], span: Span) -> Option<Value> {
        let mut ids = Vec::with_capacity(items.len());
        let mut element: Option<LiteralType> = None;
        for item in items {
            let value = self.codegen_expr(item)?;
            let Value::Constant(id) = value else {
                self.report(
                    Diagnostic::error("array elements must be constants")
                        .with_code("FLOW-G007")
                        .with_span(item.span, "not a constant"),
                );
                return None;
            };
            let ty = self.b.program().type_of(value);
            match element {
                None if ty.array_of().is_some() => element = Some(ty),
                Some(t) if t == ty => {}
                _ => {
                    self.report(
                        Diagnostic::error(format!("array element of type {ty} is not allowed here"))
                            .with_code("FLOW-G003")
                            .with_span(item.span, "this element"),
                    );
                    return None;
                }
            }
            ids.push(id);
        }
        let Some(element) = element else {
            self.report(
                Diagnostic::error("cannot infer the element type of an empty array")
                    .with_code("FLOW-G003")
                    .with_span(span, "empty array"),
            );
            return None;
        };
        Some(Value::Constant(self.b.program_mut().get_array(element, ids)))
    }

    fn codegen_unary(&mut self, op: ast::UnaryOp, operand: &Spanned<Expr>, span: Span) -> Option<Value> {
        let value = self.codegen_expr(operand)?;
        let ty = self.b.program().type_of(value);
        let result = match (op, ty) {
            (ast::UnaryOp::Neg, LiteralType::Number) => self.b.create_unary(UnaryKind::INeg, value, "neg"),
            (ast::UnaryOp::BitNot, LiteralType::Number) => self.b.create_unary(UnaryKind::INot, value, "not"),
            (ast::UnaryOp::Not, LiteralType::Boolean) => self.b.create_unary(UnaryKind::BNot, value, "not"),
            (ast::UnaryOp::Len, LiteralType::String) => self.b.create_unary(UnaryKind::SLen, value, "len"),
            (ast::UnaryOp::IsEmpty, LiteralType::String) => self.b.create_unary(UnaryKind::SIsEmpty, value, "empty"),
            (
                ast::UnaryOp::ToString,
                LiteralType::Number | LiteralType::IPAddress | LiteralType::Cidr | LiteralType::RegExp | LiteralType::String,
            ) => self.b.create_cast(LiteralType::String, value, "str"),
            (ast::UnaryOp::ToNumber, LiteralType::String | LiteralType::Number) => {
                self.b.create_cast(LiteralType::Number, value, "num")
            }
            _ => {
                self.report(
                    Diagnostic::error(format!("operator {op:?} is not defined for {ty}"))
                        .with_code("FLOW-G003")
                        .with_span(span, "here"),
                );
                return None;
            }
        };
        self.ir(result, span)
    }

    fn codegen_binary(
        &mut self,
        op: ast::BinaryOp,
        lhs: &Spanned<Expr>,
        rhs: &Spanned<Expr>,
        span: Span,
    ) -> Option<Value> {
        if op == ast::BinaryOp::Or {
            return self.codegen_or(lhs, rhs, span);
        }

        let l = self.codegen_expr(lhs)?;
        let r = self.codegen_expr(rhs)?;
        let (lt, rt) = (self.b.program().type_of(l), self.b.program().type_of(r));

        // bool equality has no opcode of its own: a == b is !(a ^ b)
        if lt == LiteralType::Boolean && rt == LiteralType::Boolean && op == ast::BinaryOp::Eq {
            let x = self.b.create_binary(BinaryKind::BXor, l, r, "xor");
            let x = self.ir(x, span)?;
            let n = self.b.create_unary(UnaryKind::BNot, x, "eq");
            return self.ir(n, span);
        }

        let Some(kind) = binary_kind(op, lt, rt) else {
            self.report(
                Diagnostic::error(format!("operator '{}' is not defined for {lt} and {rt}", op.symbol()))
                    .with_code("FLOW-G003")
                    .with_span(span, "here"),
            );
            return None;
        };
        let result = self.b.create_binary(kind, l, r, kind.mnemonic());
        self.ir(result, span)
    }

    /// `a or b` evaluates `b` only when `a` is false.
    fn codegen_or(&mut self, lhs: &Spanned<Expr>, rhs: &Spanned<Expr>, span: Span) -> Option<Value> {
        let l = self.codegen_expr(lhs)?;
        if !self.expect_type(l, LiteralType::Boolean, lhs.span, "left operand of 'or'") {
            return None;
        }
        if let Value::Constant(c) = l {
            return match self.b.program().constant(c) {
                Some(Constant::Boolean(true)) => Some(l),
                _ => {
                    let r = self.codegen_expr(rhs)?;
                    self.expect_type(r, LiteralType::Boolean, rhs.span, "right operand of 'or'").then_some(r)
                }
            };
        }

        let blocks = self.new_blocks(&["bor.right", "bor.cont"]);
        let blocks = self.ir(blocks, span)?;
        let (right, cont) = (blocks[0], blocks[1]);
        let br = self.b.create_cond_br(l, cont, right);
        self.ir(br, span)?;
        let left_end = self.b.insert_point()?;

        self.b.set_insert_point(right);
        let r = self.codegen_expr(rhs)?;
        if !self.expect_type(r, LiteralType::Boolean, rhs.span, "right operand of 'or'") {
            return None;
        }
        let br = self.b.create_br(cont);
        self.ir(br, span)?;
        let right_end = self.b.insert_point()?;

        self.b.set_insert_point(cont);
        let t = self.b.program_mut().get_bool(true);
        let phi = self.b.create_phi(vec![(Value::Constant(t), left_end), (r, right_end)], "bor");
        self.ir(phi, span)
    }

    fn codegen_call(&mut self, callee: SymbolId, args: &[Spanned<Expr>], span: Span) -> Option<Value> {
        let unit = self.unit;
        match unit.symbol(callee) {
            Some(Symbol::BuiltinFunction { signature, .. }) => {
                let values = self.codegen_args(&signature.to_string(), &signature.args, args, span)?;
                let id = self.b.program_mut().get_builtin_function(signature.clone());
                let r = self.b.create_call(id, values, &signature.name);
                self.ir(r, span)
            }
            Some(Symbol::BuiltinHandler { signature, .. }) => {
                let values = self.codegen_args(&signature.to_string(), &signature.args, args, span)?;
                let id = self.b.program_mut().get_builtin_handler(signature.clone());
                let r = self.b.create_invoke_handler(id, values);
                self.ir(r, span)
            }
            Some(Symbol::Handler { name, .. }) => {
                if !args.is_empty() {
                    self.report(
                        Diagnostic::error(format!("handler '{name}' takes no arguments, {} given", args.len()))
                            .with_code("FLOW-G002")
                            .with_span(span, "here"),
                    );
                    return None;
                }
                match self.options.handler_calls {
                    HandlerCallMode::Inline => {
                        self.codegen_inline(callee, span);
                        let f = self.b.program_mut().get_bool(false);
                        Some(Value::Constant(f))
                    }
                    HandlerCallMode::Call => {
                        let h = self.handler_id(callee);
                        let r = self.b.create_handler_call(h);
                        self.ir(r, span)
                    }
                }
            }
            Some(Symbol::Variable { name, .. }) => {
                self.report(
                    Diagnostic::error(format!("variable '{name}' is not callable"))
                        .with_code("FLOW-G010")
                        .with_span(span, "called here"),
                );
                None
            }
            None => {
                self.report(
                    Diagnostic::error(format!("call to unknown symbol #{}", callee.0))
                        .with_code("FLOW-G001")
                        .with_span(span, "here"),
                );
                None
            }
        }
    }

    /// Lowers call arguments and checks them against the callee's parameter types.
    fn codegen_args(
        &mut self,
        callee: &str,
        params: &[LiteralType],
        args: &[Spanned<Expr>],
        span: Span,
    ) -> Option<Vec<Value>> {
        if params.len() != args.len() {
            self.report(
                Diagnostic::error(format!("{callee} expects {} argument(s), {} given", params.len(), args.len()))
                    .with_code("FLOW-G002")
                    .with_span(span, "here"),
            );
            return None;
        }
        let mut values = Vec::with_capacity(args.len());
        let mut ok = true;
        for (arg, param) in args.iter().zip(params) {
            match self.codegen_expr(arg) {
                Some(v) => {
                    ok &= self.expect_type(v, *param, arg.span, "argument");
                    values.push(v);
                }
                None => ok = false,
            }
        }
        ok.then_some(values)
    }
}

/// Typed IR operation for a source operator over the given operand types.
fn binary_kind(op: ast::BinaryOp, lhs: LiteralType, rhs: LiteralType) -> Option<BinaryKind> {
    use LiteralType::{Boolean, Cidr, IPAddress, Number, RegExp, String};
    use ast::BinaryOp as Op;
    Some(match (op, lhs, rhs) {
        (Op::Add, Number, Number) => BinaryKind::IAdd,
        (Op::Sub, Number, Number) => BinaryKind::ISub,
        (Op::Mul, Number, Number) => BinaryKind::IMul,
        (Op::Div, Number, Number) => BinaryKind::IDiv,
        (Op::Rem, Number, Number) => BinaryKind::IRem,
        (Op::Pow, Number, Number) => BinaryKind::IPow,
        (Op::Shl, Number, Number) => BinaryKind::IShl,
        (Op::Shr, Number, Number) => BinaryKind::IShr,
        (Op::BitAnd, Number, Number) => BinaryKind::IAnd,
        (Op::BitOr, Number, Number) => BinaryKind::IOr,
        (Op::BitXor, Number, Number) => BinaryKind::IXor,
        (Op::Eq, Number, Number) => BinaryKind::ICmpEQ,
        (Op::Ne, Number, Number) => BinaryKind::ICmpNE,
        (Op::Le, Number, Number) => BinaryKind::ICmpLE,
        (Op::Ge, Number, Number) => BinaryKind::ICmpGE,
        (Op::Lt, Number, Number) => BinaryKind::ICmpLT,
        (Op::Gt, Number, Number) => BinaryKind::ICmpGT,
        (Op::And, Boolean, Boolean) => BinaryKind::BAnd,
        (Op::Xor | Op::Ne, Boolean, Boolean) => BinaryKind::BXor,
        (Op::Add, String, String) => BinaryKind::SAdd,
        (Op::Eq, String, String) => BinaryKind::SCmpEQ,
        (Op::Ne, String, String) => BinaryKind::SCmpNE,
        (Op::Le, String, String) => BinaryKind::SCmpLE,
        (Op::Ge, String, String) => BinaryKind::SCmpGE,
        (Op::Lt, String, String) => BinaryKind::SCmpLT,
        (Op::Gt, String, String) => BinaryKind::SCmpGT,
        (Op::PrefixMatch, String, String) => BinaryKind::SCmpBeg,
        (Op::SuffixMatch, String, String) => BinaryKind::SCmpEnd,
        (Op::In, String, String) => BinaryKind::SIn,
        (Op::RegexMatch, String, RegExp) => BinaryKind::SCmpRE,
        (Op::Eq, IPAddress, IPAddress) => BinaryKind::PCmpEQ,
        (Op::Ne, IPAddress, IPAddress) => BinaryKind::PCmpNE,
        (Op::In, IPAddress, Cidr) => BinaryKind::PInCidr,
        _ => return None,
    })
}
