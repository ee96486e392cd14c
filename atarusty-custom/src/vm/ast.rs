/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The syntax tree of a device configuration.
use super::bytecode::BinOp;

/// A position in the source text, stored as the length of the text remaining after it.
///
/// [Loc::line_col] resolves it against the complete source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Loc(pub usize);

impl Loc {
    pub fn from_rest(rest: &str) -> Self {
        Loc(rest.len())
    }
    /// Returns 1-based line and column numbers.
    pub fn line_col(self, source: &str) -> (u32, u32) {
        let offset = source.len().saturating_sub(self.0);
        let before = &source.as_bytes()[..offset];
        let line = memchr::memchr_iter(b'\n', before).count() as u32 + 1;
        let line_start = memchr::memrchr(b'\n', before).map(|p| p + 1).unwrap_or(0);
        let col = source[line_start..offset].chars().count() as u32 + 1;
        (line, col)
    }
}

/// A configuration value, used for options and object initializers.
#[derive(Clone, Debug, PartialEq)]
pub struct Data {
    pub loc: Loc,
    pub kind: DataKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DataKind {
    Int(i32),
    Str(String),
    Bool(bool),
    Array(Vec<Data>),
    Object(Vec<Member>),
    /// A reference to a declared name.
    Ident(String),
    Function(Box<FunctionDef>),
}

/// A `name: value` member of a data object.
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    pub loc: Loc,
    pub name: String,
    pub value: Data,
}

impl Data {
    pub fn describe(&self) -> &'static str {
        match self.kind {
            DataKind::Int(..) => "an integer",
            DataKind::Str(..) => "a string",
            DataKind::Bool(..) => "a boolean",
            DataKind::Array(..) => "an array",
            DataKind::Object(..) => "an object",
            DataKind::Ident(..) => "a name",
            DataKind::Function(..) => "a function",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub loc: Loc,
    /// `None` for anonymous functions.
    pub name: Option<String>,
    pub params: Vec<String>,
    /// `None` when not declared, anonymous functions infer it from their return statements.
    pub returns_int: Option<bool>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub loc: Loc,
    pub kind: StmtKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Update(BinOp),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    Local { name: String, init: Option<Expr> },
    Assign { target: String, op: AssignOp, value: Expr },
    If { cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    Loop(Vec<Stmt>),
    Break,
    Continue,
    Return(Option<Expr>),
    Block(Vec<Stmt>),
    Expr(Expr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub loc: Loc,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Int(i32),
    Str(String),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Logic(LogicOp, Box<Expr>, Box<Expr>),
    Call { name: String, args: Vec<Expr> },
    MethodCall { object: Box<Expr>, method: String, args: Vec<Expr> },
}

/// A top level declaration.
#[derive(Clone, Debug, PartialEq)]
pub enum Decl {
    /// `option "name": value;`
    Option { loc: Loc, name: String, value: Data },
    /// `Class name [: initializer];`
    Object { loc: Loc, class: String, name: String, init: Option<Data> },
    /// `int name [= expr];`
    Int { loc: Loc, name: String, init: Option<Expr> },
    Function(FunctionDef),
    /// `event "name": function { ... };`
    Event { loc: Loc, name: String, handler: Data },
}

impl Stmt {
    /// Returns `true` if this statement, or any nested one, returns a value.
    pub fn returns_value(&self) -> bool {
        match &self.kind {
            StmtKind::Return(value) => value.is_some(),
            StmtKind::If { then, otherwise, .. } => {
                then.iter().chain(otherwise.iter()).any(Stmt::returns_value)
            }
            StmtKind::While { body, .. }|StmtKind::Loop(body)|StmtKind::Block(body) => {
                body.iter().any(Stmt::returns_value)
            }
            _ => false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loc_resolves_lines_and_columns() {
        let src = "ab\ncde\n\nf";
        assert_eq!(Loc::from_rest(src).line_col(src), (1, 1));
        assert_eq!(Loc::from_rest(&src[1..]).line_col(src), (1, 2));
        assert_eq!(Loc::from_rest(&src[4..]).line_col(src), (2, 2));
        assert_eq!(Loc::from_rest(&src[8..]).line_col(src), (4, 1));
        assert_eq!(Loc::from_rest("").line_col(src), (4, 2));
    }
}
