//! Typed syntax tree handed to the compiler by the front end.
//!
//! The tree is produced by an external parser and is assumed to be
//! well-formed. It serializes through serde so a host can ship it as JSON.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::types::{Cidr, Signature};

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Wraps a node with its source span. Transparent to serde (serializes as inner node only).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }

    pub fn unknown(node: T) -> Self {
        Spanned { node, span: Span::UNKNOWN }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Spanned<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(|node| Spanned { node, span: Span::UNKNOWN })
    }
}

// ---- Symbols ----

/// Index into `Unit::symbols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// `import module from "path"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Symbol {
    /// `var name = initializer;`
    Variable {
        name: String,
        initializer: Spanned<Expr>,
        #[serde(skip)]
        span: Span,
    },

    /// `handler name { body }`; `locals` lists the variables declared in its scope.
    Handler {
        name: String,
        #[serde(default)]
        locals: Vec<SymbolId>,
        #[serde(default)]
        body: Option<Spanned<Stmt>>,
        #[serde(skip)]
        span: Span,
    },

    /// Native function provided by the host.
    BuiltinFunction {
        signature: Signature,
        #[serde(skip)]
        span: Span,
    },

    /// Native handler provided by the host.
    BuiltinHandler {
        signature: Signature,
        #[serde(skip)]
        span: Span,
    },
}

/// What a symbol reference resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Handler,
    BuiltinFunction,
    BuiltinHandler,
}

impl Symbol {
    pub fn name(&self) -> &str {
        match self {
            Symbol::Variable { name, .. } | Symbol::Handler { name, .. } => name,
            Symbol::BuiltinFunction { signature, .. } | Symbol::BuiltinHandler { signature, .. } => &signature.name,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Symbol::Variable { span, .. }
            | Symbol::Handler { span, .. }
            | Symbol::BuiltinFunction { span, .. }
            | Symbol::BuiltinHandler { span, .. } => *span,
        }
    }

    pub fn kind(&self) -> SymbolKind {
        match self {
            Symbol::Variable { .. } => SymbolKind::Variable,
            Symbol::Handler { .. } => SymbolKind::Handler,
            Symbol::BuiltinFunction { .. } => SymbolKind::BuiltinFunction,
            Symbol::BuiltinHandler { .. } => SymbolKind::BuiltinHandler,
        }
    }
}

/// Root of one compiled source: a flat symbol table plus the unit scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    #[serde(default)]
    pub imports: Vec<Import>,
    pub symbols: Vec<Symbol>,
    /// Unit-scope symbols in declaration order.
    pub scope: Vec<SymbolId>,
}

impl Unit {
    pub fn new() -> Self {
        Unit::default()
    }

    /// Appends `symbol` to the table and, if `unit_scope`, to the unit scope.
    pub fn declare(&mut self, symbol: Symbol, unit_scope: bool) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        if unit_scope {
            self.scope.push(id);
        }
        id
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.index())
    }

    pub fn resolve(&self, id: SymbolId) -> Option<SymbolKind> {
        self.symbol(id).map(Symbol::kind)
    }

    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.scope.iter().copied().find(|id| self.symbol(*id).is_some_and(|s| s.name() == name))
    }

    pub fn handlers(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.scope
            .iter()
            .filter_map(|id| self.symbol(*id).map(|s| (*id, s)))
            .filter(|(_, s)| matches!(s, Symbol::Handler { .. }))
    }

    /// Parses a unit from its JSON form.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// ---- Expressions ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `~x` on numbers
    BitNot,
    /// `not b`
    Not,
    /// `s.len`
    Len,
    /// `s.is_empty`
    IsEmpty,
    /// `string(x)`
    ToString,
    /// `int(s)`
    ToNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    /// `=^`
    PrefixMatch,
    /// `=$`
    SuffixMatch,
    /// `=~`
    RegexMatch,
    /// `in`
    In,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::PrefixMatch => "=^",
            BinaryOp::SuffixMatch => "=$",
            BinaryOp::RegexMatch => "=~",
            BinaryOp::In => "in",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Unary {
        op: UnaryOp,
        operand: Box<Spanned<Expr>>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Spanned<Expr>>,
        rhs: Box<Spanned<Expr>>,
    },
    /// Call of a builtin function, builtin handler or local handler.
    Call {
        callee: SymbolId,
        #[serde(default)]
        args: Vec<Spanned<Expr>>,
    },
    VariableRef(SymbolId),
    HandlerRef(SymbolId),
    /// `$N`: capture group of the most recent successful regex match.
    RegExpGroup(Box<Spanned<Expr>>),
    String(String),
    Number(i64),
    Bool(bool),
    RegExp(String),
    IPAddress(IpAddr),
    Cidr(Cidr),
    Array(Vec<Spanned<Expr>>),
}

// ---- Statements ----

/// Comparison a `match` statement applies between its subject and labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchClass {
    /// `==`
    Same,
    /// `=^`
    Head,
    /// `=$`
    Tail,
    /// `=~`
    RegExp,
}

impl MatchClass {
    pub fn operator(self) -> &'static str {
        match self {
            MatchClass::Same => "==",
            MatchClass::Head => "=^",
            MatchClass::Tail => "=$",
            MatchClass::RegExp => "=~",
        }
    }
}

/// `on "a", "b" { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub labels: Vec<Spanned<Expr>>,
    pub body: Spanned<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Expr(Spanned<Expr>),
    Compound(Vec<Spanned<Stmt>>),
    /// `if condition then_stmt [else else_stmt]`
    Cond {
        condition: Spanned<Expr>,
        then_stmt: Box<Spanned<Stmt>>,
        #[serde(default)]
        else_stmt: Option<Box<Spanned<Stmt>>>,
    },
    /// `match condition op { on ... }`
    Match {
        condition: Spanned<Expr>,
        class: MatchClass,
        cases: Vec<MatchCase>,
        #[serde(default)]
        else_stmt: Option<Box<Spanned<Stmt>>>,
    },
    /// `variable = value`
    Assign {
        variable: SymbolId,
        value: Spanned<Expr>,
    },
}
