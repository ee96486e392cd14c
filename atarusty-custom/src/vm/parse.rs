/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The configuration language parser.
//!
//! ```text
//! option "name": "Example";
//! Segment ram: { size: 256, persistence: "nonvolatile" };
//! int counter = 0;
//! function bump(int n): int { counter += n; return counter; }
//! event "cold_reset": function { counter = 0; };
//! ```
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{is_not, tag, take_until, take_while},
    character::complete::{char, digit1, hex_digit1, multispace1, satisfy},
    combinator::{cut, map, map_res, not, opt, recognize, verify},
    error::{context, ErrorKind, ParseError, VerboseError, VerboseErrorKind},
    multi::many0_count,
    sequence::{pair, preceded, terminated, tuple},
};

use super::ast::*;
use super::bytecode::BinOp;

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

const KEYWORDS: &[&str] = &[
    "int", "if", "else", "while", "loop", "break", "continue", "return",
    "function", "event", "option", "true", "false",
];

/// A syntax error with its location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntaxError {
    pub loc: Loc,
    pub message: String,
}

/// Parses a complete configuration.
pub fn parse(source: &str) -> Result<Vec<Decl>, SyntaxError> {
    let mut decls = Vec::new();
    let mut rest = source;
    loop {
        rest = match skip(rest) {
            Ok((rest, _)) => rest,
            Err(e) => return Err(to_syntax_error(e, rest))
        };
        if rest.is_empty() {
            break
        }
        match declaration(rest) {
            Ok((next, decl)) => {
                decls.push(decl);
                rest = next;
            }
            Err(e) => return Err(to_syntax_error(e, rest))
        }
    }
    Ok(decls)
}

fn to_syntax_error(err: nom::Err<VerboseError<&str>>, at: &str) -> SyntaxError {
    let err = match err {
        nom::Err::Error(e)|nom::Err::Failure(e) => e,
        nom::Err::Incomplete(..) => {
            return SyntaxError { loc: Loc::from_rest(""), message: "Unexpected end of input".into() }
        }
    };
    let loc = err.errors.first().map(|(i, _)| Loc::from_rest(i)).unwrap_or_else(|| Loc::from_rest(at));
    let message = err.errors.iter().find_map(|(_, kind)| match kind {
        VerboseErrorKind::Context(ctx) => Some(ctx.to_string()),
        _ => None
    }).unwrap_or_else(|| "Syntax error".to_string());
    SyntaxError { loc, message }
}

fn failure<'a, T>(input: &'a str, message: &'static str) -> Res<'a, T> {
    Err(nom::Err::Failure(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context(message))]
    }))
}

fn mismatch<T>(input: &str) -> Res<'_, T> {
    Err(nom::Err::Error(VerboseError::from_error_kind(input, ErrorKind::Tag)))
}

/// Skips white space and comments.
fn skip(input: &str) -> Res<'_, ()> {
    map(many0_count(alt((
        map(multispace1, |_| ()),
        map(pair(tag("//"), opt(is_not("\n"))), |_| ()),
        map(tuple((tag("/*"), take_until("*/"), tag("*/"))), |_| ()),
    ))), |_| ())(input)
}

fn located(input: &str) -> Res<'_, Loc> {
    let (rest, _) = skip(input)?;
    Ok((rest, Loc::from_rest(rest)))
}

/// Matches the symbol `t` unless it's followed by one of the `not_followed` characters.
fn sym<'a>(input: &'a str, t: &'static str, not_followed: &'static str) -> Res<'a, &'a str> {
    let (rest, _) = skip(input)?;
    let (after, s) = tag(t)(rest)?;
    if after.chars().next().map_or(false, |c| not_followed.contains(c)) {
        return mismatch(rest)
    }
    Ok((after, s))
}

fn expect<'a>(input: &'a str, t: &'static str, message: &'static str) -> Res<'a, ()> {
    match sym(input, t, "") {
        Ok((rest, _)) => Ok((rest, ())),
        Err(nom::Err::Error(..)) => {
            let (rest, _) = skip(input)?;
            failure(rest, message)
        }
        Err(e) => Err(e)
    }
}

fn raw_ident(input: &str) -> Res<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_')
    ))(input)
}

fn ident(input: &str) -> Res<'_, String> {
    let (rest, _) = skip(input)?;
    map(verify(raw_ident, |s: &str| !KEYWORDS.contains(&s)), str::to_string)(rest)
}

fn keyword<'a>(input: &'a str, kw: &'static str) -> Res<'a, &'a str> {
    let (rest, _) = skip(input)?;
    verify(raw_ident, move |s: &str| s == kw)(rest)
}

fn expect_ident<'a>(input: &'a str, message: &'static str) -> Res<'a, String> {
    match ident(input) {
        Err(nom::Err::Error(..)) => {
            let (rest, _) = skip(input)?;
            failure(rest, message)
        }
        res => res
    }
}

fn integer(input: &str) -> Res<'_, i32> {
    let (rest, _) = skip(input)?;
    let (rest, v) = terminated(alt((
        map_res(preceded(char('$'), hex_digit1), |s| u32::from_str_radix(s, 16)),
        map_res(preceded(alt((tag("0x"), tag("0X"))), hex_digit1), |s| u32::from_str_radix(s, 16)),
        map_res(digit1, |s: &str| s.parse::<u32>()),
    )), not(satisfy(|c| c.is_ascii_alphanumeric() || c == '_')))(rest)?;
    Ok((rest, v as i32))
}

fn string_lit(input: &str) -> Res<'_, String> {
    let (rest, _) = skip(input)?;
    let (mut rest, _) = char('"')(rest)?;
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None|Some('\n') => return failure(rest, "Unterminated string"),
            Some('"') => return Ok((chars.as_str(), out)),
            Some('\\') => {
                let c = match chars.next() {
                    Some('n') => '\n',
                    Some('t') => '\t',
                    Some('r') => '\r',
                    Some('0') => '\0',
                    Some('\\') => '\\',
                    Some('"') => '"',
                    _ => return failure(rest, "Invalid escape sequence")
                };
                out.push(c);
            }
            Some(c) => out.push(c)
        }
        rest = chars.as_str();
    }
}

/*************************** expressions ***************************/

pub(super) fn expression(input: &str) -> Res<'_, Expr> {
    logic_or(input)
}

fn fold_logic<'a>(input: &'a str, operand: fn(&'a str) -> Res<'a, Expr>, t: &'static str, lop: LogicOp) -> Res<'a, Expr> {
    let (mut rest, mut lhs) = operand(input)?;
    while let Ok((r, _)) = sym(rest, t, "") {
        let (r, rhs) = cut(operand)(r)?;
        let loc = lhs.loc;
        lhs = Expr { loc, kind: ExprKind::Logic(lop, Box::new(lhs), Box::new(rhs)) };
        rest = r;
    }
    Ok((rest, lhs))
}

fn fold_binary<'a>(
        input: &'a str,
        operand: fn(&'a str) -> Res<'a, Expr>,
        ops: &[(&'static str, &'static str, BinOp)]
    ) -> Res<'a, Expr>
{
    let (mut rest, mut lhs) = operand(input)?;
    'outer: loop {
        for &(t, not_followed, bop) in ops {
            if let Ok((r, _)) = sym(rest, t, not_followed) {
                let (r, rhs) = cut(operand)(r)?;
                let loc = lhs.loc;
                lhs = Expr { loc, kind: ExprKind::Binary(bop, Box::new(lhs), Box::new(rhs)) };
                rest = r;
                continue 'outer
            }
        }
        return Ok((rest, lhs))
    }
}

fn logic_or(input: &str) -> Res<'_, Expr> {
    fold_logic(input, logic_and, "||", LogicOp::Or)
}

fn logic_and(input: &str) -> Res<'_, Expr> {
    fold_logic(input, bit_or, "&&", LogicOp::And)
}

fn bit_or(input: &str) -> Res<'_, Expr> {
    fold_binary(input, bit_xor, &[("|", "|=", BinOp::Or)])
}

fn bit_xor(input: &str) -> Res<'_, Expr> {
    fold_binary(input, bit_and, &[("^", "=", BinOp::Xor)])
}

fn bit_and(input: &str) -> Res<'_, Expr> {
    fold_binary(input, equality, &[("&", "&=", BinOp::And)])
}

fn equality(input: &str) -> Res<'_, Expr> {
    fold_binary(input, relational, &[("==", "", BinOp::Eq), ("!=", "", BinOp::Ne)])
}

fn relational(input: &str) -> Res<'_, Expr> {
    fold_binary(input, shift, &[
        ("<=", "", BinOp::Le), (">=", "", BinOp::Ge),
        ("<", "<=", BinOp::Lt), (">", ">=", BinOp::Gt)
    ])
}

fn shift(input: &str) -> Res<'_, Expr> {
    fold_binary(input, additive, &[("<<", "=", BinOp::Shl), (">>", "=", BinOp::Shr)])
}

fn additive(input: &str) -> Res<'_, Expr> {
    fold_binary(input, multiplicative, &[("+", "=", BinOp::Add), ("-", "=", BinOp::Sub)])
}

fn multiplicative(input: &str) -> Res<'_, Expr> {
    fold_binary(input, unary, &[("*", "=", BinOp::Mul), ("/", "=", BinOp::Div), ("%", "=", BinOp::Mod)])
}

fn unary(input: &str) -> Res<'_, Expr> {
    let (rest, loc) = located(input)?;
    for &(t, op) in &[("-", UnaryOp::Neg), ("!", UnaryOp::Not), ("~", UnaryOp::BitNot)] {
        if let Ok((r, _)) = sym(rest, t, "=") {
            let (r, operand) = cut(unary)(r)?;
            let kind = match (op, operand.kind) {
                (UnaryOp::Neg, ExprKind::Int(v)) => ExprKind::Int(v.wrapping_neg()),
                (op, kind) => ExprKind::Unary(op, Box::new(Expr { loc: operand.loc, kind }))
            };
            return Ok((r, Expr { loc, kind }))
        }
    }
    postfix(rest)
}

fn arguments(input: &str) -> Res<'_, Vec<Expr>> {
    let (mut rest, _) = sym(input, "(", "")?;
    let mut args = Vec::new();
    if let Ok((r, _)) = sym(rest, ")", "") {
        return Ok((r, args))
    }
    loop {
        let (r, arg) = cut(expression)(rest)?;
        args.push(arg);
        if let Ok((r, _)) = sym(r, ",", "") {
            rest = r;
            continue
        }
        let (r, _) = expect(r, ")", "Expected ',' or ')' in argument list")?;
        return Ok((r, args))
    }
}

fn primary(input: &str) -> Res<'_, Expr> {
    let (rest, loc) = located(input)?;
    if let Ok((r, v)) = integer(rest) {
        return Ok((r, Expr { loc, kind: ExprKind::Int(v) }))
    }
    if rest.starts_with('"') {
        let (r, s) = string_lit(rest)?;
        return Ok((r, Expr { loc, kind: ExprKind::Str(s) }))
    }
    if let Ok((r, _)) = sym(rest, "(", "") {
        let (r, e) = cut(expression)(r)?;
        let (r, _) = expect(r, ")", "Expected ')'")?;
        return Ok((r, e))
    }
    let (r, name) = match ident(rest) {
        Err(nom::Err::Error(..)) => return context("Expected expression", fail_here)(rest),
        res => res?
    };
    if let Ok((r, args)) = arguments(r) {
        return Ok((r, Expr { loc, kind: ExprKind::Call { name, args } }))
    }
    Ok((r, Expr { loc, kind: ExprKind::Ident(name) }))
}

fn fail_here(input: &str) -> Res<'_, Expr> {
    Err(nom::Err::Failure(VerboseError::from_error_kind(input, ErrorKind::Verify)))
}

fn postfix(input: &str) -> Res<'_, Expr> {
    let (mut rest, mut e) = primary(input)?;
    while let Ok((r, _)) = sym(rest, ".", "") {
        let (r, method_loc) = located(r)?;
        let (r, method) = expect_ident(r, "Expected method name")?;
        let (r, args) = match arguments(r) {
            Err(nom::Err::Error(..)) => return failure(r, "Expected '(' after method name"),
            res => res?
        };
        e = Expr { loc: method_loc, kind: ExprKind::MethodCall { object: Box::new(e), method, args } };
        rest = r;
    }
    Ok((rest, e))
}

/*************************** statements ***************************/

fn block(input: &str) -> Res<'_, Vec<Stmt>> {
    let (mut rest, _) = expect(input, "{", "Expected '{'")?;
    let mut stmts = Vec::new();
    loop {
        if let Ok((r, _)) = sym(rest, "}", "") {
            return Ok((r, stmts))
        }
        let (r, _) = skip(rest)?;
        if r.is_empty() {
            return failure(r, "Expected '}'")
        }
        let (r, stmt) = statement(r)?;
        stmts.push(stmt);
        rest = r;
    }
}

/// A block or a single statement.
fn body(input: &str) -> Res<'_, Vec<Stmt>> {
    if sym(input, "{", "").is_ok() {
        return block(input)
    }
    map(statement, |s| vec![s])(input)
}

fn condition(input: &str) -> Res<'_, Expr> {
    let (rest, _) = expect(input, "(", "Expected '('")?;
    let (rest, cond) = cut(expression)(rest)?;
    let (rest, _) = expect(rest, ")", "Expected ')'")?;
    Ok((rest, cond))
}

fn semicolon(input: &str) -> Res<'_, ()> {
    expect(input, ";", "Expected ';'")
}

const ASSIGN_OPS: &[(&str, AssignOp)] = &[
    ("+=", AssignOp::Update(BinOp::Add)),
    ("-=", AssignOp::Update(BinOp::Sub)),
    ("*=", AssignOp::Update(BinOp::Mul)),
    ("/=", AssignOp::Update(BinOp::Div)),
    ("%=", AssignOp::Update(BinOp::Mod)),
    ("&=", AssignOp::Update(BinOp::And)),
    ("|=", AssignOp::Update(BinOp::Or)),
    ("^=", AssignOp::Update(BinOp::Xor)),
    ("<<=", AssignOp::Update(BinOp::Shl)),
    (">>=", AssignOp::Update(BinOp::Shr)),
];

fn assign_op(input: &str) -> Res<'_, AssignOp> {
    if let Ok((r, _)) = sym(input, "=", "=") {
        return Ok((r, AssignOp::Set))
    }
    for &(t, op) in ASSIGN_OPS {
        if let Ok((r, _)) = sym(input, t, "") {
            return Ok((r, op))
        }
    }
    mismatch(input)
}

fn statement(input: &str) -> Res<'_, Stmt> {
    let (rest, loc) = located(input)?;
    let stmt = |kind| Stmt { loc, kind };

    if let Ok((r, _)) = keyword(rest, "int") {
        let (r, name) = expect_ident(r, "Expected variable name")?;
        let (r, init) = match sym(r, "=", "=") {
            Ok((r, _)) => map(cut(expression), Some)(r)?,
            Err(..) => (r, None)
        };
        let (r, _) = semicolon(r)?;
        return Ok((r, stmt(StmtKind::Local { name, init })))
    }
    if let Ok((r, _)) = keyword(rest, "if") {
        let (r, cond) = condition(r)?;
        let (r, then) = body(r)?;
        let (r, otherwise) = match keyword(r, "else") {
            Ok((r, _)) => body(r)?,
            Err(..) => (r, Vec::new())
        };
        return Ok((r, stmt(StmtKind::If { cond, then, otherwise })))
    }
    if let Ok((r, _)) = keyword(rest, "while") {
        let (r, cond) = condition(r)?;
        let (r, body) = body(r)?;
        return Ok((r, stmt(StmtKind::While { cond, body })))
    }
    if let Ok((r, _)) = keyword(rest, "loop") {
        let (r, body) = body(r)?;
        return Ok((r, stmt(StmtKind::Loop(body))))
    }
    if let Ok((r, _)) = keyword(rest, "break") {
        let (r, _) = semicolon(r)?;
        return Ok((r, stmt(StmtKind::Break)))
    }
    if let Ok((r, _)) = keyword(rest, "continue") {
        let (r, _) = semicolon(r)?;
        return Ok((r, stmt(StmtKind::Continue)))
    }
    if let Ok((r, _)) = keyword(rest, "return") {
        if let Ok((r, _)) = sym(r, ";", "") {
            return Ok((r, stmt(StmtKind::Return(None))))
        }
        let (r, value) = cut(expression)(r)?;
        let (r, _) = semicolon(r)?;
        return Ok((r, stmt(StmtKind::Return(Some(value)))))
    }
    if sym(rest, "{", "").is_ok() {
        let (r, stmts) = block(rest)?;
        return Ok((r, stmt(StmtKind::Block(stmts))))
    }
    if let Ok((r, target)) = ident(rest) {
        if let Ok((r, op)) = assign_op(r) {
            let (r, value) = cut(expression)(r)?;
            let (r, _) = semicolon(r)?;
            return Ok((r, stmt(StmtKind::Assign { target, op, value })))
        }
    }
    let (r, e) = expression(rest)?;
    let (r, _) = semicolon(r)?;
    Ok((r, stmt(StmtKind::Expr(e))))
}

fn params(input: &str) -> Res<'_, Vec<String>> {
    let (mut rest, _) = expect(input, "(", "Expected '('")?;
    let mut params = Vec::new();
    if let Ok((r, _)) = sym(rest, ")", "") {
        return Ok((r, params))
    }
    loop {
        let (r, _) = match keyword(rest, "int") {
            Err(nom::Err::Error(..)) => {
                let (r, _) = skip(rest)?;
                return failure(r, "Expected 'int' parameter")
            }
            res => res?
        };
        let (r, name) = expect_ident(r, "Expected parameter name")?;
        params.push(name);
        if let Ok((r, _)) = sym(r, ",", "") {
            rest = r;
            continue
        }
        let (r, _) = expect(r, ")", "Expected ',' or ')' in parameter list")?;
        return Ok((r, params))
    }
}

fn return_type(input: &str) -> Res<'_, Option<bool>> {
    match sym(input, ":", "") {
        Ok((r, _)) => {
            let (r, _) = match keyword(r, "int") {
                Err(nom::Err::Error(..)) => {
                    let (r, _) = skip(r)?;
                    return failure(r, "Expected return type 'int'")
                }
                res => res?
            };
            Ok((r, Some(true)))
        }
        Err(..) => Ok((input, None))
    }
}

/// `function [name] [(params)] [: int] { body }`, after the `function` keyword.
fn function_rest(input: &str, loc: Loc, named: bool) -> Res<'_, FunctionDef> {
    let (rest, name) = if named {
        let (rest, name) = expect_ident(input, "Expected function name")?;
        (rest, Some(name))
    } else {
        (input, None)
    };
    let (rest, params) = if named || sym(rest, "(", "").is_ok() {
        params(rest)?
    } else {
        (rest, Vec::new())
    };
    let (rest, returns_int) = return_type(rest)?;
    let returns_int = match (named, returns_int) {
        (true, None) => Some(false),
        (_, r) => r
    };
    let (rest, body) = block(rest)?;
    Ok((rest, FunctionDef { loc, name, params, returns_int, body }))
}

/*************************** data ***************************/

fn data(input: &str) -> Res<'_, Data> {
    let (rest, loc) = located(input)?;
    let mk = |kind| Data { loc, kind };
    if let Ok((r, _)) = sym(rest, "-", "") {
        let (r, v) = match integer(r) {
            Err(nom::Err::Error(..)) => return failure(r, "Expected integer after '-'"),
            res => res?
        };
        return Ok((r, mk(DataKind::Int(v.wrapping_neg()))))
    }
    if let Ok((r, v)) = integer(rest) {
        return Ok((r, mk(DataKind::Int(v))))
    }
    if rest.starts_with('"') {
        let (r, s) = string_lit(rest)?;
        return Ok((r, mk(DataKind::Str(s))))
    }
    if let Ok((r, _)) = keyword(rest, "true") {
        return Ok((r, mk(DataKind::Bool(true))))
    }
    if let Ok((r, _)) = keyword(rest, "false") {
        return Ok((r, mk(DataKind::Bool(false))))
    }
    if let Ok((r, _)) = keyword(rest, "function") {
        let (r, f) = function_rest(r, loc, false)?;
        return Ok((r, mk(DataKind::Function(Box::new(f)))))
    }
    if let Ok((mut r, _)) = sym(rest, "[", "") {
        let mut items = Vec::new();
        loop {
            if let Ok((r2, _)) = sym(r, "]", "") {
                return Ok((r2, mk(DataKind::Array(items))))
            }
            let (r2, item) = data(r)?;
            items.push(item);
            r = match sym(r2, ",", "") {
                Ok((r3, _)) => r3,
                Err(..) => {
                    let (r3, _) = expect(r2, "]", "Expected ',' or ']'")?;
                    return Ok((r3, mk(DataKind::Array(items))))
                }
            };
        }
    }
    if let Ok((mut r, _)) = sym(rest, "{", "") {
        let mut members = Vec::new();
        loop {
            if let Ok((r2, _)) = sym(r, "}", "") {
                return Ok((r2, mk(DataKind::Object(members))))
            }
            let (r2, member_loc) = located(r)?;
            let (r2, name) = match ident(r2) {
                Ok(res) => res,
                Err(nom::Err::Error(..)) if r2.starts_with('"') => string_lit(r2)?,
                Err(nom::Err::Error(..)) => return failure(r2, "Expected member name"),
                Err(e) => return Err(e)
            };
            let (r2, _) = expect(r2, ":", "Expected ':' after member name")?;
            let (r2, value) = data(r2)?;
            members.push(Member { loc: member_loc, name, value });
            r = match sym(r2, ",", "") {
                Ok((r3, _)) => r3,
                Err(..) => {
                    let (r3, _) = expect(r2, "}", "Expected ',' or '}'")?;
                    return Ok((r3, mk(DataKind::Object(members))))
                }
            };
        }
    }
    match ident(rest) {
        Ok((r, name)) => Ok((r, mk(DataKind::Ident(name)))),
        Err(nom::Err::Error(..)) => failure(rest, "Expected a value"),
        Err(e) => Err(e)
    }
}

/*************************** declarations ***************************/

fn declaration(input: &str) -> Res<'_, Decl> {
    let (rest, loc) = located(input)?;
    if let Ok((r, _)) = keyword(rest, "option") {
        let (r, name) = match string_lit(r) {
            Err(nom::Err::Error(..)) => return failure(r, "Expected option name string"),
            res => res?
        };
        let (r, _) = expect(r, ":", "Expected ':'")?;
        let (r, value) = data(r)?;
        let (r, _) = semicolon(r)?;
        return Ok((r, Decl::Option { loc, name, value }))
    }
    if let Ok((r, _)) = keyword(rest, "event") {
        let (r, name) = match string_lit(r) {
            Err(nom::Err::Error(..)) => return failure(r, "Expected event name string"),
            res => res?
        };
        let (r, _) = expect(r, ":", "Expected ':'")?;
        let (r, handler) = data(r)?;
        let (r, _) = semicolon(r)?;
        return Ok((r, Decl::Event { loc, name, handler }))
    }
    if let Ok((r, _)) = keyword(rest, "int") {
        let (r, name) = expect_ident(r, "Expected variable name")?;
        let (r, init) = match sym(r, "=", "=") {
            Ok((r, _)) => map(cut(expression), Some)(r)?,
            Err(..) => (r, None)
        };
        let (r, _) = semicolon(r)?;
        return Ok((r, Decl::Int { loc, name, init }))
    }
    if let Ok((r, _)) = keyword(rest, "function") {
        let (r, f) = function_rest(r, loc, true)?;
        let r = sym(r, ";", "").map(|(r, _)| r).unwrap_or(r);
        return Ok((r, Decl::Function(f)))
    }
    let (r, class) = match ident(rest) {
        Err(nom::Err::Error(..)) => return failure(rest, "Expected declaration"),
        res => res?
    };
    let (r, name) = expect_ident(r, "Expected object name")?;
    let (r, init) = match sym(r, ":", "") {
        Ok((r, _)) => map(data, Some)(r)?,
        Err(..) => (r, None)
    };
    let (r, _) = semicolon(r)?;
    Ok((r, Decl::Object { loc, class, name, init }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(src: &str) -> Expr {
        let (rest, e) = expression(src).unwrap();
        assert!(rest.trim().is_empty(), "{:?}", rest);
        e
    }

    fn binary(e: &Expr) -> (BinOp, &Expr, &Expr) {
        match &e.kind {
            ExprKind::Binary(op, a, b) => (*op, a, b),
            k => panic!("not binary: {:?}", k)
        }
    }

    #[test]
    fn literals_work() {
        assert_eq!(expr("42").kind, ExprKind::Int(42));
        assert_eq!(expr("$D500").kind, ExprKind::Int(0xD500));
        assert_eq!(expr("0x1f").kind, ExprKind::Int(0x1F));
        assert_eq!(expr("$FFFFFFFF").kind, ExprKind::Int(-1));
        assert_eq!(expr("-5").kind, ExprKind::Int(-5));
        assert_eq!(expr(r#""a\"b\n""#).kind, ExprKind::Str("a\"b\n".into()));
        assert!(expression("12abc").is_err());
    }

    #[test]
    fn precedence_follows_c() {
        let e = expr("1 + 2 * 3 << 1");
        let (op, lhs, rhs) = binary(&e);
        assert_eq!(op, BinOp::Shl);
        assert_eq!(rhs.kind, ExprKind::Int(1));
        let (op, _, mul) = binary(lhs);
        assert_eq!(op, BinOp::Add);
        assert_eq!(binary(mul).0, BinOp::Mul);

        let e = expr("a & b == c");
        let (op, _, eq) = binary(&e);
        assert_eq!(op, BinOp::And);
        assert_eq!(binary(eq).0, BinOp::Eq);

        let e = expr("a < b && c || !d");
        match e.kind {
            ExprKind::Logic(LogicOp::Or, lhs, rhs) => {
                assert!(matches!(lhs.kind, ExprKind::Logic(LogicOp::And, ..)));
                assert!(matches!(rhs.kind, ExprKind::Unary(UnaryOp::Not, _)));
            }
            k => panic!("{:?}", k)
        }
        let e = expr("10 - 3 - 2");
        let (op, lhs, _) = binary(&e);
        assert_eq!(op, BinOp::Sub);
        assert_eq!(binary(lhs).0, BinOp::Sub);
    }

    #[test]
    fn calls_parse() {
        let e = expr("seg.read_byte(f(1, 2) + 3)");
        match e.kind {
            ExprKind::MethodCall { object, method, args } => {
                assert_eq!(object.kind, ExprKind::Ident("seg".into()));
                assert_eq!(method, "read_byte");
                assert_eq!(args.len(), 1);
            }
            k => panic!("{:?}", k)
        }
        let e = expr("debug.log(\"x\")");
        assert!(matches!(e.kind, ExprKind::MethodCall { .. }));
        let e = expr("f()");
        assert_eq!(e.kind, ExprKind::Call { name: "f".into(), args: vec![] });
    }

    #[test]
    fn declarations_parse() {
        let src = r#"
            // a comment
            option "name": "Test device";
            Segment ram: { size: $100, persistence: "nonvolatile", init_pattern: [1, 2, -1,] };
            Thread worker;
            int counter = 2 * 3;
            /* block
               comment */
            function bump(int n, int m): int {
                int t = n;
                counter += t << m;
                if (counter > 10) counter = 0; else { counter -= 1; }
                while (t) { t = t - 1; if (t == 3) break; else continue; }
                loop { return counter; }
            }
            event "cold_reset": function { counter = 0; worker.run(bump2); };
            MemoryLayer ctl: { control: [ { address: $D500, mode: "r", script: function { return 1; } } ] };
        "#;
        let decls = parse(src).unwrap();
        assert_eq!(decls.len(), 7);
        match &decls[0] {
            Decl::Option { name, value, .. } => {
                assert_eq!(name, "name");
                assert_eq!(value.kind, DataKind::Str("Test device".into()));
            }
            d => panic!("{:?}", d)
        }
        match &decls[1] {
            Decl::Object { class, name, init: Some(init), .. } => {
                assert_eq!((class.as_str(), name.as_str()), ("Segment", "ram"));
                match &init.kind {
                    DataKind::Object(members) => {
                        assert_eq!(members.len(), 3);
                        assert_eq!(members[0].value.kind, DataKind::Int(256));
                        match &members[2].value.kind {
                            DataKind::Array(items) => assert_eq!(items[2].kind, DataKind::Int(-1)),
                            k => panic!("{:?}", k)
                        }
                    }
                    k => panic!("{:?}", k)
                }
            }
            d => panic!("{:?}", d)
        }
        assert!(matches!(&decls[2], Decl::Object { init: None, .. }));
        assert!(matches!(&decls[3], Decl::Int { init: Some(..), .. }));
        match &decls[4] {
            Decl::Function(f) => {
                assert_eq!(f.name.as_deref(), Some("bump"));
                assert_eq!(f.params, ["n", "m"]);
                assert_eq!(f.returns_int, Some(true));
                assert_eq!(f.body.len(), 5);
                assert!(f.body.iter().any(Stmt::returns_value));
            }
            d => panic!("{:?}", d)
        }
        match &decls[5] {
            Decl::Event { name, handler, .. } => {
                assert_eq!(name, "cold_reset");
                match &handler.kind {
                    DataKind::Function(f) => {
                        assert_eq!(f.returns_int, None);
                        assert_eq!(f.body.len(), 2);
                    }
                    k => panic!("{:?}", k)
                }
            }
            d => panic!("{:?}", d)
        }
    }

    #[test]
    fn errors_have_locations() {
        let src = "int a = 1;\nint b = ;\n";
        let err = parse(src).unwrap_err();
        assert_eq!(err.loc.line_col(src), (2, 9));
        assert_eq!(err.message, "Expected expression");

        let src = "function f() {\n  a = 1\n}";
        let err = parse(src).unwrap_err();
        assert_eq!(err.message, "Expected ';'");
        assert_eq!(err.loc.line_col(src).0, 3);

        let err = parse("Segment s: { size 4 };").unwrap_err();
        assert_eq!(err.message, "Expected ':' after member name");

        let err = parse("option \"x\": \"abc;").unwrap_err();
        assert_eq!(err.message, "Unterminated string");
        assert!(parse("/* open").is_err());
    }
}
