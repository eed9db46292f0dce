//! SQL operators.
//!
//! This module defines the operators the compiler knows about: the logical
//! connectives used to combine conditions, and the comparison operators
//! accepted in structured `{field, operator, value}` conditions. It assigns
//! precedences to them and implements joining rendered operands with minimal
//! parenthesization.

use std::collections::HashMap;
use std::str::FromStr;

/// Operator precedence (zero is lowest).
pub type Precedence = u32;

/// Kinds of operators.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Kind {
    /// A logical operator.
    Logic,
    /// A binary comparison operator.
    Comp,
    /// An arithmetic operator.
    Arith,
}

/// The lowest operator precedence, reserved for special use.
pub const LOWEST_PRECEDENCE: Precedence = 0;

/// The highest operator precedence, used for atoms.
pub const HIGHEST_PRECEDENCE: Precedence = 7;

/// List of precedence tiers, in order of increasing precedence.
const PRECEDENCE_LIST: [&[&str]; (HIGHEST_PRECEDENCE - 1) as usize] = [
    &["OR"],
    &["AND"],
    &["NOT"],
    &[
        "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "IN", "NOT IN", "IS",
        "IS NOT",
    ],
    &["+", "-", "||"],
    &["*", "/", "%"],
];

/// List of operators organized by their kind.
const KIND_LIST: [(Kind, &[&str]); 3] = [
    (Kind::Logic, &["OR", "AND", "NOT"]),
    (
        Kind::Comp,
        &[
            "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "IN", "NOT IN", "IS",
            "IS NOT",
        ],
    ),
    (Kind::Arith, &["+", "-", "||", "*", "/", "%"]),
];

lazy_static! {
    /// A mapping from operators to their precedence.
    static ref PRECEDENCE_MAP: HashMap<&'static str, Precedence> = {
        let mut map = HashMap::new();
        for (i, &tier) in PRECEDENCE_LIST.iter().enumerate() {
            for &op in tier {
                map.insert(op, (i + 1) as Precedence);
            }
        }
        map
    };

    /// A mapping from operators to their kind.
    static ref KIND_MAP: HashMap<&'static str, Kind> = {
        let mut map = HashMap::new();
        for &(kind, ops) in KIND_LIST.iter() {
            for &op in ops {
                map.insert(op, kind);
            }
        }
        map
    };
}

/// Normalizes an operator as written in a document: trims it, collapses
/// inner whitespace and uppercases keyword operators.
pub fn normalize(op: &str) -> String {
    op.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Returns the precedence of the operator, or None if it is not an operator.
pub fn precedence(op: &str) -> Option<Precedence> {
    PRECEDENCE_MAP.get(op).cloned()
}

/// Returns the kind of the operator, or None if it is not an operator.
pub fn kind(op: &str) -> Option<Kind> {
    KIND_MAP.get(op).cloned()
}

/// Returns true if `op` is a comparison taking a parenthesized list.
pub fn takes_list(op: &str) -> bool {
    op == "IN" || op == "NOT IN"
}

/// The logical operators.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Logic {
    /// Negation.
    Not,
    /// Conjunction.
    And,
    /// Disjunction.
    Or,
}

impl Logic {
    /// Returns the SQL keyword for the operator.
    pub fn keyword(self) -> &'static str {
        match self {
            Logic::Not => "NOT",
            Logic::And => "AND",
            Logic::Or => "OR",
        }
    }

    /// Returns the precedence of the operator.
    pub fn precedence(self) -> Precedence {
        PRECEDENCE_MAP[self.keyword()]
    }
}

impl FromStr for Logic {
    type Err = ();

    fn from_str(s: &str) -> Result<Logic, ()> {
        match s.to_ascii_uppercase().as_str() {
            "NOT" => Ok(Logic::Not),
            "AND" => Ok(Logic::And),
            "OR" => Ok(Logic::Or),
            _ => Err(()),
        }
    }
}

/// An expression that may need to be parenthesized.
pub trait Parenthesize {
    /// Returns the precedence of the expression.
    fn precedence(&self) -> Precedence;
}

/// An operand that has already been rendered to SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// The SQL text.
    pub text: String,
    /// Precedence of the loosest top-level operator in `text`.
    pub precedence: Precedence,
}

impl Parenthesize for Rendered {
    fn precedence(&self) -> Precedence {
        self.precedence
    }
}

/// Joins operands with an associative binary operator.
///
/// A lone operand is written as is. Otherwise each operand binding more
/// loosely than `op` is wrapped in parentheses; operands at the same or a
/// tighter precedence are left alone. `sep` goes before the operator, which
/// lets pretty output break lines between conditions.
pub fn write_operation(op: Logic, sep: &str, args: &[Rendered]) -> String {
    let prec = op.precedence();
    let mut out = String::new();
    if let [arg] = args {
        out.push_str(&arg.text);
        return out;
    }
    for (i, arg) in args.iter().enumerate() {
        if i != 0 {
            out.push_str(sep);
            out.push_str(op.keyword());
            out.push(' ');
        }
        if prec > arg.precedence() {
            out.push('(');
            out.push_str(&arg.text);
            out.push(')');
        } else {
            out.push_str(&arg.text);
        }
    }
    out
}
