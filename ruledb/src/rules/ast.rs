use std::fmt;

/// A parsed rule or filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Two or more operands of one `&&` chain, left to right.
    And(Vec<Expr>),
    /// Two or more operands of one `||` chain, left to right.
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Literal),
    /// A column of the current collection, possibly reached through relation
    /// fields (`author.org.name`).
    Field(Vec<String>),
    /// `@request.auth.<field>`
    RequestAuth(String),
    /// `@request.data.<field>`
    RequestData(String),
    /// `@collection.<name>.<path>`
    Collection { collection: String, path: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    NotLike,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Like => "~",
            CompareOp::NotLike => "!~",
        }
    }
}

impl Expr {
    /// Split a chain of `&&` into its conjuncts, left to right. Parenthesized
    /// chains are flattened into the outer one.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        let mut pending = vec![self];
        while let Some(expr) = pending.pop() {
            match expr {
                Expr::And(parts) => pending.extend(parts.iter().rev()),
                other => out.push(other),
            }
        }
        out
    }
}

impl Operand {
    /// The `@collection` name referenced by this operand, if any.
    pub fn collection_ref(&self) -> Option<&str> {
        match self {
            Operand::Collection { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

// Display renders the canonical source form; parsing it yields an equal AST.

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::And(parts) => write_chain(f, parts, "&&"),
            Expr::Or(parts) => write_chain(f, parts, "||"),
            Expr::Not(inner) => write!(f, "!({inner})"),
            Expr::Compare { left, op, right } => write!(f, "{left} {} {right}", op.as_str()),
        }
    }
}

fn write_chain(f: &mut fmt::Formatter<'_>, parts: &[Expr], op: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, " {op} ")?;
        }
        write!(f, "{part}")?;
    }
    write!(f, ")")
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(lit) => write!(f, "{lit}"),
            Operand::Field(path) => write!(f, "{}", path.join(".")),
            Operand::RequestAuth(name) => write!(f, "@request.auth.{name}"),
            Operand::RequestData(name) => write!(f, "@request.data.{name}"),
            Operand::Collection { collection, path } => {
                write!(f, "@collection.{collection}.{}", path.join("."))
            }
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Literal::Num(n) => write!(f, "{n}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Null => write!(f, "null"),
        }
    }
}
