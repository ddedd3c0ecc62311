//! Parley language engine: parsing and execution.
//!
//! This module provides the parser and executor for the declarative DSL
//! used to:
//! * declare entity types, constraints, relations and ownership
//! * define procedures over that schema (`Get`, `Create`, `Update`, `Set`,
//!   `If`, `For Each`, `return`)
//!
//! Schema blocks and procedure blocks share one source text. Parsing is
//! line-oriented; field declarations and expression tokens are covered by
//! the grammar in `parley.pest`, statement lines are classified by their
//! leading keyword. Expressions are evaluated via Shunting-Yard into
//! postfix and then a stack walk that dispatches every binary operator on
//! the **left** operand's kind.
//!
//! # Execution
//! `Engine::parse` runs the four schema passes (lexical parse, validation,
//! table/junction synthesis, orphan triggers) and compiles every procedure
//! into a statement tree. All text errors surface before the adapter sees
//! the first DDL call. `Engine::call` then runs one procedure as one
//! adapter transaction: commit on success, rollback on any error.
//!
//! # Example
//! ```no_run
//! use entwine::parley::{Argument, Engine};
//! use entwine::persist::{PersistenceMode, SqliteAdapter};
//! let source = "
//! Item { number:id [primary], str[50]:name }
//!
//! AddItem(number:id, str[50]:name):
//!     Create a Item with id of {id} and name of {name} as item
//!     return {item}
//! ";
//! let adapter = SqliteAdapter::new(PersistenceMode::InMemory).unwrap();
//! let engine = Engine::parse(source, adapter).unwrap();
//! let mut args = std::collections::HashMap::new();
//! args.insert("id".to_string(), Argument::from(1));
//! args.insert("name".to_string(), Argument::from("Sword"));
//! let tree = engine.call("AddItem", args).unwrap();
//! assert_eq!(tree["name"], "Sword");
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use pest::Parser;
use pest_derive::Parser;

use crate::adapter::{Adapter, Record};
use crate::datatype::{BinOp, CmpOp, Number, Raw, Text, Value, ValueKind};
use crate::entity::{raw_to_json, Binder, Entity};
use crate::error::{EntwineError, Result};
use crate::schema::{
    self, EntityDef, FieldAttribute, FieldDef, NameHasher, RelationDecl, RelationRegistry,
    SchemaDict,
};

#[derive(Parser)]
#[grammar = "parley.pest"] // relative to src
struct ParleyParser;

// ------------- Arguments -------------

/// One invocation argument: either an already-typed value (used as is) or
/// a raw JSON scalar wrapped by the declared parameter kind.
#[derive(Debug, Clone)]
pub enum Argument {
    Typed(Value),
    Raw(serde_json::Value),
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Typed(value)
    }
}
impl From<serde_json::Value> for Argument {
    fn from(value: serde_json::Value) -> Self {
        Argument::Raw(value)
    }
}
impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Argument::Raw(serde_json::Value::from(value))
    }
}
impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Raw(serde_json::Value::from(value))
    }
}
impl From<String> for Argument {
    fn from(value: String) -> Self {
        Argument::Raw(serde_json::Value::from(value))
    }
}
impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Argument::Raw(serde_json::Value::from(value))
    }
}

/// Argument mapping handed to `Engine::call`.
pub type Arguments = HashMap<String, Argument>;

// ------------- Procedure model -------------

#[derive(Debug, Clone)]
pub enum ParamKind {
    Scalar(ValueKind),
    /// `List[Target]`: a list of identifiers of the target entity.
    List(String),
}

#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<String>,
}

/// A compiled procedure: its parameter list and statement tree. Immutable
/// after `parse` returns.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub params: Vec<ParamDef>,
    body: Vec<Statement>,
}

#[derive(Debug, Clone)]
enum Statement {
    Get {
        entity: String,
        id_var: String,
        alias: String,
    },
    Create {
        entity: String,
        assignments: Vec<(String, Expr)>,
        alias: Option<String>,
    },
    Update {
        alias: String,
        assignments: Vec<(String, Expr)>,
    },
    Set {
        var: String,
        expr: Expr,
    },
    If {
        cond: Cond,
        body: Vec<Statement>,
    },
    ForEach {
        item: String,
        list: Expr,
        body: Vec<Statement>,
    },
    Return {
        expr: Expr,
    },
    Expression {
        expr: Expr,
    },
}

// ------------- Expressions -------------

/// Postfix token produced by the Shunting-Yard conversion.
#[derive(Debug, Clone)]
enum PTok {
    Num(String),
    Str(String),
    Var(String),
    Bin(BinOp),
    Neg,
}

#[derive(Debug, Clone)]
struct Expr {
    postfix: Vec<PTok>,
}

/// Lexical token as it comes out of the grammar.
#[derive(Debug, Clone)]
enum LexTok {
    Num(String),
    Str(String),
    Var(String),
    Op(BinOp),
    LParen,
    RParen,
}

fn tokenize_expression(text: &str) -> Result<Vec<LexTok>> {
    let parsed = ParleyParser::parse(Rule::expression, text.trim()).map_err(|e| {
        EntwineError::Resolution(format!("expression '{}' is unparsable: {}", text.trim(), e))
    })?;
    let mut tokens = Vec::new();
    for pair in parsed.into_iter().next().unwrap().into_inner() {
        match pair.as_rule() {
            Rule::number => tokens.push(LexTok::Num(pair.as_str().to_string())),
            Rule::string => {
                let quoted = pair.as_str();
                tokens.push(LexTok::Str(quoted[1..quoted.len() - 1].to_string()));
            }
            Rule::variable => {
                let braced = pair.as_str();
                tokens.push(LexTok::Var(braced[1..braced.len() - 1].trim().to_string()));
            }
            Rule::plus => tokens.push(LexTok::Op(BinOp::Add)),
            Rule::minus => tokens.push(LexTok::Op(BinOp::Sub)),
            Rule::times => tokens.push(LexTok::Op(BinOp::Mul)),
            Rule::divide => tokens.push(LexTok::Op(BinOp::Div)),
            Rule::lparen => tokens.push(LexTok::LParen),
            Rule::rparen => tokens.push(LexTok::RParen),
            Rule::EOI => (),
            other => {
                return Err(EntwineError::Resolution(format!(
                    "unexpected token {:?} in expression '{}'",
                    other, text
                )))
            }
        }
    }
    Ok(tokens)
}

fn precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Add | BinOp::Sub => 2,
        BinOp::Mul | BinOp::Div => 3,
    }
}

/// Shunting-Yard. A `-` at expression start, after an operator or after
/// `(` is unary negation, handled as a high-precedence prefix operator.
fn to_postfix(tokens: Vec<LexTok>) -> Result<Expr> {
    #[derive(Clone, Copy, PartialEq)]
    enum StackOp {
        Bin(BinOp),
        Neg,
        LParen,
    }
    let mut output: Vec<PTok> = Vec::new();
    let mut stack: Vec<StackOp> = Vec::new();
    let mut prev_was_operand = false;
    for token in tokens {
        match token {
            LexTok::Num(text) => {
                output.push(PTok::Num(text));
                prev_was_operand = true;
            }
            LexTok::Str(text) => {
                output.push(PTok::Str(text));
                prev_was_operand = true;
            }
            LexTok::Var(path) => {
                output.push(PTok::Var(path));
                prev_was_operand = true;
            }
            LexTok::Op(op) => {
                if op == BinOp::Sub && !prev_was_operand {
                    stack.push(StackOp::Neg);
                } else {
                    while let Some(top) = stack.last() {
                        let pops = match top {
                            StackOp::Neg => true,
                            StackOp::Bin(other) => precedence(*other) >= precedence(op),
                            StackOp::LParen => false,
                        };
                        if !pops {
                            break;
                        }
                        match stack.pop().unwrap() {
                            StackOp::Neg => output.push(PTok::Neg),
                            StackOp::Bin(other) => output.push(PTok::Bin(other)),
                            StackOp::LParen => unreachable!(),
                        }
                    }
                    stack.push(StackOp::Bin(op));
                }
                prev_was_operand = false;
            }
            LexTok::LParen => {
                stack.push(StackOp::LParen);
                prev_was_operand = false;
            }
            LexTok::RParen => {
                loop {
                    match stack.pop() {
                        Some(StackOp::Neg) => output.push(PTok::Neg),
                        Some(StackOp::Bin(op)) => output.push(PTok::Bin(op)),
                        Some(StackOp::LParen) => break,
                        None => {
                            return Err(EntwineError::Resolution(
                                "unbalanced parentheses in expression".into(),
                            ))
                        }
                    }
                }
                prev_was_operand = true;
            }
        }
    }
    while let Some(top) = stack.pop() {
        match top {
            StackOp::Neg => output.push(PTok::Neg),
            StackOp::Bin(op) => output.push(PTok::Bin(op)),
            StackOp::LParen => {
                return Err(EntwineError::Resolution(
                    "unbalanced parentheses in expression".into(),
                ))
            }
        }
    }
    Ok(Expr { postfix: output })
}

fn parse_expression(text: &str) -> Result<Expr> {
    to_postfix(tokenize_expression(text)?)
}

// ------------- Conditions -------------

#[derive(Debug, Clone)]
enum Cond {
    Cmp { lhs: Expr, op: CmpOp, rhs: Expr },
    Bare(Expr),
}

/// Rewrite the natural-language comparison phrases to their symbolic
/// forms. Longer phrases first so prefixes never shadow them.
fn normalize_condition(text: &str) -> String {
    let mut normalized = text.to_string();
    for (phrase, symbol) in [
        ("is not equal to", "!="),
        ("is greater than or equal to", ">="),
        ("is less than or equal to", "<="),
        ("is equal to", "=="),
        ("is greater than", ">"),
        ("is less than", "<"),
    ] {
        normalized = normalized.replace(phrase, symbol);
    }
    normalized
}

/// Find the top-level comparison operator, ignoring everything inside
/// quotes and braces.
fn find_comparison(text: &str) -> Option<(String, CmpOp, String)> {
    let bytes = text.as_bytes();
    let mut in_string = false;
    let mut in_variable = false;
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        match byte {
            b'"' => in_string = !in_string,
            b'{' if !in_string => in_variable = true,
            b'}' if !in_string => in_variable = false,
            _ if in_string || in_variable => {}
            _ => {
                // byte-level matching; every operator is ASCII
                let rest = &bytes[index..];
                let found = if rest.starts_with(b"==") {
                    Some((CmpOp::Eq, 2))
                } else if rest.starts_with(b"!=") {
                    Some((CmpOp::Ne, 2))
                } else if rest.starts_with(b"<=") {
                    Some((CmpOp::Le, 2))
                } else if rest.starts_with(b">=") {
                    Some((CmpOp::Ge, 2))
                } else if rest.starts_with(b"<") {
                    Some((CmpOp::Lt, 1))
                } else if rest.starts_with(b">") {
                    Some((CmpOp::Gt, 1))
                } else {
                    None
                };
                if let Some((op, width)) = found {
                    return Some((
                        text[..index].to_string(),
                        op,
                        text[index + width..].to_string(),
                    ));
                }
            }
        }
        index += 1;
    }
    None
}

fn parse_condition(text: &str) -> Result<Cond> {
    let normalized = normalize_condition(text);
    match find_comparison(&normalized) {
        Some((lhs, op, rhs)) => Ok(Cond::Cmp {
            lhs: parse_expression(&lhs)?,
            op,
            rhs: parse_expression(&rhs)?,
        }),
        None => Ok(Cond::Bare(parse_expression(&normalized)?)),
    }
}

// ------------- Line scanning helpers -------------

fn is_comment(trimmed: &str) -> bool {
    trimmed.starts_with('#') || trimmed.starts_with("//")
}

fn indent_of(line: &str) -> usize {
    let mut indent = 0;
    for character in line.chars() {
        match character {
            ' ' => indent += 1,
            '\t' => indent += 4,
            _ => break,
        }
    }
    indent
}

/// Split on a separator at depth zero, respecting quotes, braces,
/// brackets and parentheses.
fn split_top_level<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut start = 0;
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        match byte {
            b'"' => in_string = !in_string,
            b'(' | b'[' | b'{' if !in_string => depth += 1,
            b')' | b']' | b'}' if !in_string => depth -= 1,
            _ => {}
        }
        if !in_string && depth == 0 && bytes[index..].starts_with(separator.as_bytes()) {
            parts.push(&text[start..index]);
            index += separator.len();
            start = index;
            continue;
        }
        index += 1;
    }
    parts.push(&text[start..]);
    parts
}

// ------------- Schema text parsing (pass 1) -------------

lazy_static! {
    static ref RE_ENTITY_HEADER: Regex =
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*(?:\(([^)]*)\))?\s*\{(.*)$").unwrap();
    static ref RE_PROC_HEADER: Regex =
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*:\s*$").unwrap();
    static ref RE_LIST_TYPE: Regex = Regex::new(r"(?i)^list\[([A-Za-z0-9_]+)\]$").unwrap();
    static ref RE_GET: Regex = Regex::new(
        r"^Get\s+(?:(?:a|an|the)\s+)?([A-Za-z0-9_]+)\s+by\s+id\s+of\s+\{([^}]+)\}\s+as\s+([A-Za-z0-9_]+)\s*$"
    )
    .unwrap();
    static ref RE_CREATE: Regex =
        Regex::new(r"^Create\s+(?:(?:a|an)\s+)?([A-Za-z0-9_]+)\s+with\s+(.+)$").unwrap();
    static ref RE_CREATE_ALIAS: Regex = Regex::new(r"^(.*)\s+as\s+([A-Za-z0-9_]+)\s*$").unwrap();
    static ref RE_ASSIGN_OF: Regex = Regex::new(r"^([A-Za-z0-9_]+)\s+of\s+(.+)$").unwrap();
    static ref RE_UPDATE: Regex =
        Regex::new(r"^Update\s+(?:the\s+)?([A-Za-z0-9_]+)\s+to\s+set\s+(.+)$").unwrap();
    static ref RE_ASSIGN_EQ: Regex = Regex::new(r"^([A-Za-z0-9_]+)\s*=\s*(.+)$").unwrap();
    static ref RE_SET: Regex = Regex::new(r"^Set\s+\{([A-Za-z0-9_]+)\}\s*=\s*(.+)$").unwrap();
    static ref RE_IF: Regex = Regex::new(r"^If\s+(.+):\s*$").unwrap();
    static ref RE_FOREACH: Regex =
        Regex::new(r"^For\s+Each\s+([A-Za-z0-9_]+)\s+in\s+(.+):\s*$").unwrap();
    static ref RE_RETURN: Regex = Regex::new(r"^return\s+(.+)$").unwrap();
    static ref RE_PARAM: Regex =
        Regex::new(r"^([A-Za-z0-9_]+(?:\[[^\]]*\])?)\s*:\s*([A-Za-z0-9_]+)\s*(?:\((.*)\))?$")
            .unwrap();
}

/// Parse one field declaration chunk via the grammar. `List[Target]`
/// chunks come back as relations, everything else as a `FieldDef`.
enum FieldLine {
    Field(FieldDef),
    Relation(RelationDecl),
}

fn parse_field_chunk(chunk: &str, entity: &str) -> Result<FieldLine> {
    let parsed = ParleyParser::parse(Rule::field_line, chunk.trim()).map_err(|e| {
        EntwineError::Schema(format!(
            "entity '{}': malformed field declaration '{}': {}",
            entity,
            chunk.trim(),
            e
        ))
    })?;
    let mut type_token = String::new();
    let mut name = String::new();
    let mut attributes = Vec::new();
    let mut default_value = None;
    for pair in parsed.into_iter().next().unwrap().into_inner() {
        match pair.as_rule() {
            Rule::type_token => type_token = pair.as_str().to_string(),
            Rule::identifier => name = pair.as_str().to_string(),
            Rule::attribute => {
                let text = pair.into_inner().next().unwrap().as_str();
                attributes.push(FieldAttribute::parse(text)?);
            }
            Rule::default_clause => {
                default_value = Some(pair.into_inner().next().unwrap().as_str().to_string());
            }
            _ => {}
        }
    }
    if let Some(caps) = RE_LIST_TYPE.captures(&type_token) {
        if !attributes.is_empty() || default_value.is_some() {
            return Err(EntwineError::Schema(format!(
                "entity '{}': relation field '{}' cannot carry attributes or defaults",
                entity, name
            )));
        }
        return Ok(FieldLine::Relation(RelationDecl {
            field: name,
            target: caps[1].to_string(),
        }));
    }
    Ok(FieldLine::Field(FieldDef::new(
        name,
        type_token,
        default_value,
        attributes,
    )?))
}

fn parse_entity_body(
    name: String,
    owners: Vec<String>,
    first_chunk: &str,
    lines: &[&str],
    mut position: usize,
) -> Result<(EntityDef, usize)> {
    let mut fields = Vec::new();
    let mut relations = Vec::new();
    let mut body_lines: Vec<String> = Vec::new();
    let mut closed = false;

    let first = first_chunk.trim();
    if let Some(stripped) = first.strip_suffix('}') {
        body_lines.push(stripped.trim().to_string());
        closed = true;
    } else if !first.is_empty() {
        body_lines.push(first.to_string());
    }
    while !closed {
        let line = match lines.get(position) {
            Some(line) => *line,
            None => {
                return Err(EntwineError::Schema(format!(
                    "entity '{}': body is never closed with '}}'",
                    name
                )))
            }
        };
        position += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            continue;
        }
        if trimmed == "}" {
            closed = true;
        } else if let Some(stripped) = trimmed.strip_suffix('}') {
            body_lines.push(stripped.trim().to_string());
            closed = true;
        } else {
            body_lines.push(trimmed.to_string());
        }
    }

    for body_line in body_lines {
        for chunk in split_top_level(&body_line, ",") {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                continue;
            }
            match parse_field_chunk(chunk, &name)? {
                FieldLine::Field(field) => fields.push(field),
                FieldLine::Relation(relation) => relations.push(relation),
            }
        }
    }

    let def = EntityDef {
        name,
        fields,
        relations,
        owners,
    };
    if def.fields.iter().filter(|f| f.is_primary()).count() > 1 {
        return Err(EntwineError::Schema(format!(
            "entity '{}' declares more than one [primary] field",
            def.name
        )));
    }
    Ok((def, position))
}

// ------------- Procedure parsing -------------

fn parse_params(text: &str) -> Result<Vec<ParamDef>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let mut params = Vec::new();
    for part in split_top_level(text, ",") {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let caps = RE_PARAM.captures(part).ok_or_else(|| {
            EntwineError::Schema(format!("malformed parameter declaration '{}'", part))
        })?;
        let type_token = caps[1].to_string();
        let name = caps[2].to_string();
        let default = caps.get(3).map(|m| m.as_str().to_string());
        let kind = match RE_LIST_TYPE.captures(&type_token) {
            Some(list) => ParamKind::List(list[1].to_string()),
            None => ParamKind::Scalar(ValueKind::parse(&type_token)?),
        };
        params.push(ParamDef {
            name,
            kind,
            default,
        });
    }
    Ok(params)
}

#[derive(Debug)]
struct RawLine {
    indent: usize,
    text: String,
    number: usize,
}

fn classify_statement(line: &RawLine) -> Result<(Statement, bool)> {
    let text = line.text.as_str();
    if let Some(caps) = RE_GET.captures(text) {
        return Ok((
            Statement::Get {
                entity: caps[1].to_string(),
                id_var: caps[2].trim().to_string(),
                alias: caps[3].to_string(),
            },
            false,
        ));
    }
    if let Some(caps) = RE_CREATE.captures(text) {
        let entity = caps[1].to_string();
        let with_alias = caps[2].to_string();
        let (rest, alias) = match RE_CREATE_ALIAS.captures(&with_alias) {
            Some(alias_caps) => (alias_caps[1].to_string(), Some(alias_caps[2].to_string())),
            None => (with_alias, None),
        };
        let mut assignments = Vec::new();
        for part in split_top_level(&rest, " and ") {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let assign = RE_ASSIGN_OF.captures(part).ok_or_else(|| {
                EntwineError::Schema(format!(
                    "line {}: malformed assignment '{}' (expected FIELD of EXPR)",
                    line.number, part
                ))
            })?;
            assignments.push((assign[1].to_string(), parse_expression(&assign[2])?));
        }
        return Ok((
            Statement::Create {
                entity,
                assignments,
                alias,
            },
            false,
        ));
    }
    if let Some(caps) = RE_UPDATE.captures(text) {
        let alias = caps[1].to_string();
        let mut assignments = Vec::new();
        for part in split_top_level(&caps[2], ",") {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let assign = RE_ASSIGN_EQ.captures(part).ok_or_else(|| {
                EntwineError::Schema(format!(
                    "line {}: malformed assignment '{}' (expected FIELD = EXPR)",
                    line.number, part
                ))
            })?;
            assignments.push((assign[1].to_string(), parse_expression(&assign[2])?));
        }
        return Ok((Statement::Update { alias, assignments }, false));
    }
    if let Some(caps) = RE_SET.captures(text) {
        return Ok((
            Statement::Set {
                var: caps[1].to_string(),
                expr: parse_expression(&caps[2])?,
            },
            false,
        ));
    }
    if let Some(caps) = RE_IF.captures(text) {
        return Ok((
            Statement::If {
                cond: parse_condition(&caps[1])?,
                body: Vec::new(),
            },
            true,
        ));
    }
    if let Some(caps) = RE_FOREACH.captures(text) {
        return Ok((
            Statement::ForEach {
                item: caps[1].to_string(),
                list: parse_expression(&caps[2])?,
                body: Vec::new(),
            },
            true,
        ));
    }
    if let Some(caps) = RE_RETURN.captures(text) {
        return Ok((
            Statement::Return {
                expr: parse_expression(&caps[1])?,
            },
            false,
        ));
    }
    // escape hatch: a bare expression statement
    Ok((
        Statement::Expression {
            expr: parse_expression(text).map_err(|_| {
                EntwineError::Schema(format!(
                    "line {}: unrecognized statement '{}'",
                    line.number, text
                ))
            })?,
        },
        false,
    ))
}

/// Build one block: all lines sharing the first line's indent, recursing
/// into deeper blocks after `If`/`For Each` headers. A dedent pops back to
/// the enclosing block.
fn parse_block(lines: &[RawLine], position: &mut usize, parent_indent: usize) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();
    let mut block_indent: Option<usize> = None;
    while *position < lines.len() {
        let line = &lines[*position];
        if line.indent <= parent_indent {
            break;
        }
        let indent = *block_indent.get_or_insert(line.indent);
        if line.indent < indent {
            break;
        }
        if line.indent > indent {
            return Err(EntwineError::Schema(format!(
                "line {}: unexpected indentation",
                line.number
            )));
        }
        let (statement, opens_block) = classify_statement(line)?;
        *position += 1;
        if opens_block {
            let body = parse_block(lines, position, indent)?;
            match statement {
                Statement::If { cond, .. } => statements.push(Statement::If { cond, body }),
                Statement::ForEach { item, list, .. } => {
                    statements.push(Statement::ForEach { item, list, body })
                }
                _ => unreachable!(),
            }
        } else {
            statements.push(statement);
        }
    }
    Ok(statements)
}

fn parse_procedure_body(
    lines: &[&str],
    mut position: usize,
    header_indent: usize,
) -> Result<(Vec<Statement>, usize)> {
    let mut raw_lines = Vec::new();
    while position < lines.len() {
        let line = lines[position];
        let trimmed = line.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            position += 1;
            continue;
        }
        if indent_of(line) <= header_indent {
            break;
        }
        raw_lines.push(RawLine {
            indent: indent_of(line),
            text: trimmed.to_string(),
            number: position + 1,
        });
        position += 1;
    }
    let mut cursor = 0;
    let body = parse_block(&raw_lines, &mut cursor, header_indent)?;
    if cursor < raw_lines.len() {
        return Err(EntwineError::Schema(format!(
            "line {}: inconsistent indentation",
            raw_lines[cursor].number
        )));
    }
    Ok((body, position))
}

/// Pass 1: read the whole source into entity definitions and compiled
/// procedures. Never touches the adapter.
fn parse_source(source: &str) -> Result<(SchemaDict, Vec<Procedure>)> {
    let lines: Vec<&str> = source.lines().collect();
    let mut dict = SchemaDict::new();
    let mut procedures: Vec<Procedure> = Vec::new();
    let mut position = 0;
    while position < lines.len() {
        let line = lines[position];
        let trimmed = line.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            position += 1;
            continue;
        }
        if let Some(caps) = RE_PROC_HEADER.captures(trimmed) {
            let name = caps[1].to_string();
            if procedures.iter().any(|p| p.name == name) {
                return Err(EntwineError::Schema(format!(
                    "duplicate procedure name '{}'",
                    name
                )));
            }
            let params = parse_params(&caps[2])?;
            let (body, next) = parse_procedure_body(&lines, position + 1, indent_of(line))?;
            procedures.push(Procedure { name, params, body });
            position = next;
            continue;
        }
        if let Some(caps) = RE_ENTITY_HEADER.captures(trimmed) {
            let name = caps[1].to_string();
            let owners = caps
                .get(2)
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .map(|owner| owner.trim().to_string())
                        .filter(|owner| !owner.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            let first_chunk = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            let (def, next) = parse_entity_body(name, owners, first_chunk, &lines, position + 1)?;
            dict.insert(def)?;
            position = next;
            continue;
        }
        return Err(EntwineError::Schema(format!(
            "line {}: unrecognized top-level construct '{}'",
            position + 1,
            trimmed
        )));
    }
    Ok((dict, procedures))
}

// ------------- Bindings -------------

/// A name bound in a procedure scope.
#[derive(Debug, Clone)]
enum Binding {
    Value(Value),
    Entity(Arc<Entity>),
    Entities(Vec<Arc<Entity>>),
    Values(Vec<Value>),
    Null,
}

type Scope = HashMap<String, Binding, NameHasher>;

/// Control-flow result of executing a statement or block. `return`
/// travels as a sentinel so nested blocks unwind without exceptions.
enum Flow {
    Next,
    Return(Binding),
}

fn as_value(binding: Binding) -> Result<Value> {
    match binding {
        Binding::Value(value) => Ok(value),
        Binding::Null => Err(EntwineError::Resolution(
            "a null binding is not a scalar value".into(),
        )),
        Binding::Entity(entity) => Err(EntwineError::Resolution(format!(
            "a '{}' row is not a scalar value",
            entity.def().name
        ))),
        Binding::Entities(_) | Binding::Values(_) => Err(EntwineError::Resolution(
            "a list is not a scalar value".into(),
        )),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        other => raw_to_json(&other.to_raw()),
    }
}

fn binding_to_tree(binding: &Binding) -> serde_json::Value {
    match binding {
        Binding::Value(value) => value_to_json(value),
        Binding::Entity(entity) => entity.to_tree(),
        Binding::Entities(list) => {
            serde_json::Value::Array(list.iter().map(|entity| entity.to_tree()).collect())
        }
        Binding::Values(list) => serde_json::Value::Array(list.iter().map(value_to_json).collect()),
        Binding::Null => serde_json::Value::Null,
    }
}

// ------------- Engine -------------

/// The parsed engine: schema dictionary, relation registry and compiled
/// procedures over one adapter. Explicit lifecycle: `parse` once, `call`
/// any number of times, `close` at the end. Concurrent callers serialize
/// on the adapter; each call owns one transaction exclusively.
pub struct Engine<A: Adapter> {
    adapter: Mutex<A>,
    schema: Arc<SchemaDict>,
    registry: Arc<RelationRegistry>,
    binder: Arc<Binder>,
    procedures: HashMap<String, Procedure, NameHasher>,
}

impl<A: Adapter> std::fmt::Debug for Engine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("procedures", &self.procedures.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<A: Adapter> Engine<A> {
    /// Ingest a source text: four schema passes plus procedure
    /// compilation. Every parse and validation error surfaces before the
    /// adapter sees the first DDL call; on error the engine state is
    /// unchanged.
    pub fn parse(source: &str, mut adapter: A) -> Result<Engine<A>> {
        adapter.init()?;
        let (dict, procedure_list) = parse_source(source)?;
        schema::validate(&dict)?;
        schema::synthesize_tables(&dict, &mut adapter)?;
        let registry = schema::synthesize_relations(&dict, &mut adapter)?;
        schema::synthesize_orphan_triggers(&dict, &registry, &mut adapter)?;

        let schema = Arc::new(dict);
        let registry = Arc::new(registry);
        let binder = Arc::new(Binder {
            schema: Arc::clone(&schema),
            registry: Arc::clone(&registry),
        });
        let mut procedures: HashMap<String, Procedure, NameHasher> = HashMap::default();
        for procedure in procedure_list {
            procedures.insert(procedure.name.clone(), procedure);
        }
        Ok(Engine {
            adapter: Mutex::new(adapter),
            schema,
            registry,
            binder,
            procedures,
        })
    }

    /// Names of the compiled procedures.
    pub fn procedures(&self) -> Vec<&str> {
        self.procedures.keys().map(|name| name.as_str()).collect()
    }

    pub fn schema(&self) -> &SchemaDict {
        &self.schema
    }

    pub fn registry(&self) -> &RelationRegistry {
        &self.registry
    }

    /// Direct adapter access, mostly for seeding and inspection around
    /// procedure calls. The guard holds the engine's serialization lock.
    pub fn adapter(&self) -> MutexGuard<'_, A> {
        self.adapter.lock().unwrap()
    }

    /// Invoke a procedure as one ACID transaction and return its result
    /// tree. Any error rolls the transaction back and is re-raised.
    pub fn call(&self, name: &str, args: Arguments) -> Result<serde_json::Value> {
        let procedure = self.procedures.get(name).ok_or_else(|| {
            EntwineError::Resolution(format!("unknown procedure '{}'", name))
        })?;
        let mut adapter = self.adapter.lock().unwrap();
        self.invoke(procedure, args, &mut adapter)
    }

    /// Finalize the adapter.
    pub fn close(self) -> Result<()> {
        self.adapter.into_inner().unwrap().close()
    }

    fn invoke(
        &self,
        procedure: &Procedure,
        args: Arguments,
        adapter: &mut A,
    ) -> Result<serde_json::Value> {
        let mut scope = self.bind_parameters(procedure, args)?;
        adapter.begin_transaction()?;
        debug!(procedure = %procedure.name, "transaction begun");
        match self.exec_block(&procedure.body, &mut scope, adapter) {
            Ok(flow) => {
                let tree = match flow {
                    Flow::Return(binding) => binding_to_tree(&binding),
                    Flow::Next => serde_json::Value::Null,
                };
                match adapter.commit() {
                    Ok(()) => {
                        debug!(procedure = %procedure.name, "committed");
                        Ok(tree)
                    }
                    Err(commit_error) => {
                        if let Err(rollback_error) = adapter.rollback() {
                            warn!(error = %rollback_error, "rollback after failed commit also failed");
                        }
                        Err(commit_error)
                    }
                }
            }
            Err(error) => {
                if let Err(rollback_error) = adapter.rollback() {
                    warn!(error = %rollback_error, "rollback failed");
                }
                debug!(procedure = %procedure.name, error = %error, "rolled back");
                Err(error)
            }
        }
    }

    fn bind_parameters(&self, procedure: &Procedure, mut args: Arguments) -> Result<Scope> {
        let mut scope = Scope::default();
        for param in &procedure.params {
            let binding = match args.remove(&param.name) {
                Some(Argument::Typed(value)) => Binding::Value(value),
                Some(Argument::Raw(json)) => match &param.kind {
                    ParamKind::Scalar(kind) => Binding::Value(kind.wrap_json(&json)?),
                    ParamKind::List(target) => {
                        let items = json.as_array().ok_or_else(|| {
                            EntwineError::Resolution(format!(
                                "argument '{}' must be a list",
                                param.name
                            ))
                        })?;
                        let target_def = self.schema.resolve(target).ok_or_else(|| {
                            EntwineError::Resolution(format!(
                                "parameter '{}' references unknown entity '{}'",
                                param.name, target
                            ))
                        })?;
                        let element_kind = target_def.require_primary()?.kind.clone();
                        let values = items
                            .iter()
                            .map(|item| element_kind.wrap_json(item))
                            .collect::<Result<Vec<Value>>>()?;
                        Binding::Values(values)
                    }
                },
                None => match &param.kind {
                    ParamKind::List(_) => {
                        return Err(EntwineError::Resolution(format!(
                            "missing list argument '{}'",
                            param.name
                        )))
                    }
                    ParamKind::Scalar(kind) => match &param.default {
                        Some(default) => Binding::Value(kind.parse_literal(default)?),
                        None => {
                            return Err(EntwineError::Resolution(format!(
                                "missing argument '{}'",
                                param.name
                            )))
                        }
                    },
                },
            };
            scope.insert(param.name.clone(), binding);
        }
        Ok(scope)
    }

    /// Case-insensitive entity resolution with the trailing-`s`
    /// pluralization trim (a brittle but deliberate heuristic).
    fn resolve_entity(&self, name: &str) -> Result<Arc<EntityDef>> {
        if let Some(def) = self.schema.resolve(name) {
            return Ok(def);
        }
        if let Some(stripped) = name.strip_suffix('s').or_else(|| name.strip_suffix('S')) {
            if let Some(def) = self.schema.resolve(stripped) {
                return Ok(def);
            }
        }
        Err(EntwineError::Resolution(format!(
            "unknown entity '{}'",
            name
        )))
    }

    fn exec_block(
        &self,
        statements: &[Statement],
        scope: &mut Scope,
        adapter: &mut A,
    ) -> Result<Flow> {
        for statement in statements {
            if let Flow::Return(value) = self.exec_statement(statement, scope, adapter)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }

    fn exec_statement(
        &self,
        statement: &Statement,
        scope: &mut Scope,
        adapter: &mut A,
    ) -> Result<Flow> {
        match statement {
            Statement::Get {
                entity,
                id_var,
                alias,
            } => {
                let def = self.resolve_entity(entity)?;
                let pk = def.require_primary()?;
                let id_binding = self.resolve_path(id_var, scope, &*adapter)?;
                let id_value = as_value(id_binding)?;
                let id_raw = pk.kind.wrap(&id_value.to_raw())?.to_raw();
                let binding = match adapter.find_one(&def.name, &vec![(pk.name.clone(), id_raw)])? {
                    Some(record) => Binding::Entity(Arc::new(Entity::from_record(
                        Arc::clone(&def),
                        record,
                        Arc::clone(&self.binder),
                    ))),
                    None => Binding::Null,
                };
                scope.insert(alias.clone(), binding);
                Ok(Flow::Next)
            }
            Statement::Create {
                entity,
                assignments,
                alias,
            } => {
                let def = self.resolve_entity(entity)?;
                let mut record = Record::new();
                for field in &def.fields {
                    record.insert(field.name.clone(), Raw::Null);
                }
                for (field_name, expr) in assignments {
                    let field = def.field(field_name).ok_or_else(|| {
                        EntwineError::Resolution(format!(
                            "entity '{}' has no field '{}'",
                            def.name, field_name
                        ))
                    })?;
                    let value = as_value(self.eval_expr(expr, scope, &*adapter)?)?;
                    let coerced = field.kind.wrap(&value.to_raw())?;
                    record.insert(field_name.clone(), coerced.to_raw());
                }
                // declared defaults fill the fields the statement left out
                for field in &def.fields {
                    if record[&field.name].is_null() {
                        if let Some(default) = field.default()? {
                            record.insert(field.name.clone(), default.to_raw());
                        }
                    }
                }
                adapter.insert(&def.name, &record)?;
                if let Some(alias) = alias {
                    scope.insert(
                        alias.clone(),
                        Binding::Entity(Arc::new(Entity::from_record(
                            def,
                            record,
                            Arc::clone(&self.binder),
                        ))),
                    );
                }
                Ok(Flow::Next)
            }
            Statement::Update { alias, assignments } => {
                let entity = match scope.get(alias.as_str()) {
                    Some(Binding::Entity(entity)) => Arc::clone(entity),
                    _ => {
                        return Err(EntwineError::Resolution(format!(
                            "alias '{}' does not name a row",
                            alias
                        )))
                    }
                };
                let (pk_name, pk_raw) = entity.pk_raw()?;
                let mut updates = Record::new();
                for (field, expr) in assignments {
                    let value = as_value(self.eval_expr(expr, scope, &*adapter)?)?;
                    // the in-memory row and the store move in lock-step
                    entity.set(field, &value)?;
                    updates.insert(field.clone(), entity.raw(field)?);
                }
                adapter.update(
                    &entity.def().name,
                    &vec![(pk_name, pk_raw)],
                    &updates,
                )?;
                Ok(Flow::Next)
            }
            Statement::Set { var, expr } => {
                let binding = self.eval_expr(expr, scope, &*adapter)?;
                scope.insert(var.clone(), binding);
                Ok(Flow::Next)
            }
            Statement::If { cond, body } => {
                if self.eval_condition(cond, scope, &*adapter)? {
                    return self.exec_block(body, scope, adapter);
                }
                Ok(Flow::Next)
            }
            Statement::ForEach { item, list, body } => {
                let iterable = self.eval_expr(list, scope, &*adapter)?;
                let elements: Vec<Binding> = match iterable {
                    Binding::Entities(list) => list.into_iter().map(Binding::Entity).collect(),
                    Binding::Values(list) => list.into_iter().map(Binding::Value).collect(),
                    Binding::Null => Vec::new(),
                    other => {
                        warn!(
                            operand = ?other,
                            "For Each operand is not iterable; skipping the loop"
                        );
                        Vec::new()
                    }
                };
                for element in elements {
                    // the loop variable deliberately overwrites any prior
                    // binding of the same name and leaks past the loop
                    scope.insert(item.clone(), element);
                    if let Flow::Return(value) = self.exec_block(body, scope, adapter)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Next)
            }
            Statement::Return { expr } => {
                let binding = self.eval_expr(expr, scope, &*adapter)?;
                Ok(Flow::Return(binding))
            }
            Statement::Expression { expr } => {
                self.eval_expr(expr, scope, &*adapter)?;
                Ok(Flow::Next)
            }
        }
    }

    fn eval_condition(&self, cond: &Cond, scope: &Scope, adapter: &dyn Adapter) -> Result<bool> {
        match cond {
            Cond::Cmp { lhs, op, rhs } => {
                let left = as_value(self.eval_expr(lhs, scope, adapter)?)?;
                let right = as_value(self.eval_expr(rhs, scope, adapter)?)?;
                left.compare(*op, &right)
            }
            Cond::Bare(expr) => as_value(self.eval_expr(expr, scope, adapter)?)?.truthy(),
        }
    }

    fn eval_expr(&self, expr: &Expr, scope: &Scope, adapter: &dyn Adapter) -> Result<Binding> {
        let mut stack: Vec<Binding> = Vec::new();
        for token in &expr.postfix {
            match token {
                PTok::Num(text) => stack.push(Binding::Value(Value::Number(Number::parse(
                    text, None, None,
                )?))),
                PTok::Str(text) => {
                    stack.push(Binding::Value(Value::String(Text::new(text.clone(), None)?)))
                }
                PTok::Var(path) => stack.push(self.resolve_path(path, scope, adapter)?),
                PTok::Neg => {
                    let operand = as_value(stack.pop().ok_or_else(malformed)?)?;
                    stack.push(Binding::Value(operand.neg()?));
                }
                PTok::Bin(op) => {
                    let rhs = as_value(stack.pop().ok_or_else(malformed)?)?;
                    let lhs = as_value(stack.pop().ok_or_else(malformed)?)?;
                    stack.push(Binding::Value(lhs.apply(*op, &rhs)?));
                }
            }
        }
        if stack.len() != 1 {
            return Err(malformed());
        }
        Ok(stack.pop().unwrap())
    }

    /// Resolve `{root.path}`: the root comes from the scope, each dotted
    /// tail segment reads through the entity — a relation segment triggers
    /// the lazy loader.
    fn resolve_path(&self, path: &str, scope: &Scope, adapter: &dyn Adapter) -> Result<Binding> {
        let mut segments = path.split('.');
        let root = segments.next().unwrap().trim();
        let mut current = scope.get(root).cloned().ok_or_else(|| {
            EntwineError::Resolution(format!("undefined variable '{}'", root))
        })?;
        for segment in segments {
            let segment = segment.trim();
            current = match current {
                Binding::Entity(entity) => {
                    if entity.def().relation(segment).is_some() {
                        Binding::Entities(entity.relation(segment, adapter)?)
                    } else {
                        match entity.get(segment)? {
                            Some(value) => Binding::Value(value),
                            None => Binding::Null,
                        }
                    }
                }
                Binding::Null => {
                    return Err(EntwineError::Resolution(format!(
                        "cannot read '{}' of a null binding",
                        segment
                    )))
                }
                _ => {
                    return Err(EntwineError::Resolution(format!(
                        "'{}' has no member '{}'",
                        root, segment
                    )))
                }
            };
        }
        Ok(current)
    }
}

fn malformed() -> EntwineError {
    EntwineError::Resolution("malformed expression".into())
}
