use super::ast::{CompareOp, Expr, Literal, Operand};
use super::lexer::{Lexer, Token, TokenKind};
use crate::error::{Result, RuleDbError};

/// Nesting limit for parentheses and `!`, keeps hostile input from
/// exhausting the stack.
const MAX_NESTING: usize = 64;

/// Limit on comparisons in one expression. SQLite caps expression trees
/// at a depth of 1000, and each chained comparison adds a level.
pub const MAX_COMPARISONS: usize = 256;

/// Parse a non-empty rule or filter expression.
pub fn parse_expression(input: &str) -> Result<Expr> {
    let tokens = Lexer::tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        comparisons: 0,
    };
    let expr = parser.parse_or()?;
    let tok = parser.peek();
    if tok.kind != TokenKind::Eof {
        return Err(parser.unexpected(tok.clone(), "end of expression"));
    }
    Ok(expr)
}

fn chain(mut parts: Vec<Expr>, wrap: fn(Vec<Expr>) -> Expr) -> Expr {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        wrap(parts)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    comparisons: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof, and advance never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, tok: Token, expected: &str) -> RuleDbError {
        let found = match tok.kind {
            TokenKind::Eof => "end of input".to_string(),
            other => format!("{other:?}"),
        };
        RuleDbError::Rule(format!(
            "expected {expected} but found {found} at position {}",
            tok.pos
        ))
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(RuleDbError::Rule(format!(
                "expression nested deeper than {MAX_NESTING} levels"
            )));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut parts = vec![self.parse_and()?];
        while self.eat(&TokenKind::Or) {
            parts.push(self.parse_and()?);
        }
        Ok(chain(parts, Expr::Or))
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut parts = vec![self.parse_not()?];
        while self.eat(&TokenKind::And) {
            parts.push(self.parse_not()?);
        }
        Ok(chain(parts, Expr::And))
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat(&TokenKind::Not) {
            self.enter()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        if self.eat(&TokenKind::LParen) {
            self.enter()?;
            let inner = self.parse_or()?;
            self.depth -= 1;
            if !self.eat(&TokenKind::RParen) {
                let tok = self.peek().clone();
                return Err(self.unexpected(tok, "')'"));
            }
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        self.comparisons += 1;
        if self.comparisons > MAX_COMPARISONS {
            return Err(RuleDbError::Rule(format!(
                "expression has more than {MAX_COMPARISONS} comparisons"
            )));
        }
        let left = self.parse_operand()?;
        let op = match self.peek().kind {
            TokenKind::Eq => CompareOp::Eq,
            TokenKind::Neq => CompareOp::Neq,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Gte => CompareOp::Gte,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Lte => CompareOp::Lte,
            TokenKind::Like => CompareOp::Like,
            TokenKind::NotLike => CompareOp::NotLike,
            _ => {
                let tok = self.peek().clone();
                return Err(self.unexpected(tok, "comparison operator"));
            }
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Expr::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Str(s) => Ok(Operand::Literal(Literal::Str(s))),
            TokenKind::Num(n) => Ok(Operand::Literal(Literal::Num(n))),
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Operand::Literal(Literal::Bool(true))),
                "false" => Ok(Operand::Literal(Literal::Bool(false))),
                "null" => Ok(Operand::Literal(Literal::Null)),
                _ => {
                    let mut path = vec![name];
                    path.extend(self.parse_dotted_tail()?);
                    Ok(Operand::Field(path))
                }
            },
            TokenKind::Macro(name) => self.parse_macro(&name, tok.pos),
            _ => Err(self.unexpected(tok, "operand")),
        }
    }

    /// Zero or more `.ident` segments.
    fn parse_dotted_tail(&mut self) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        while self.eat(&TokenKind::Dot) {
            let tok = self.advance();
            match tok.kind {
                TokenKind::Ident(name) => segments.push(name),
                _ => return Err(self.unexpected(tok, "identifier after '.'")),
            }
        }
        Ok(segments)
    }

    fn parse_macro(&mut self, name: &str, pos: usize) -> Result<Operand> {
        let segments = self.parse_dotted_tail()?;
        let invalid = |what: &str| {
            RuleDbError::Rule(format!("invalid macro @{name}.{} at position {pos}: {what}", segments.join(".")))
        };

        match name {
            "request" => match segments.as_slice() {
                [scope, field] if scope == "auth" => Ok(Operand::RequestAuth(field.clone())),
                [scope, field] if scope == "data" => Ok(Operand::RequestData(field.clone())),
                [scope, ..] if scope == "auth" || scope == "data" => {
                    Err(invalid("expected exactly one field name"))
                }
                _ => Err(invalid("supported forms are @request.auth.<field> and @request.data.<field>")),
            },
            "collection" => match segments.split_first() {
                Some((collection, path)) if !path.is_empty() => Ok(Operand::Collection {
                    collection: collection.clone(),
                    path: path.to_vec(),
                }),
                _ => Err(invalid("expected @collection.<name>.<field>")),
            },
            _ => Err(RuleDbError::Rule(format!(
                "unknown macro @{name} at position {pos}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(path: &str) -> Operand {
        Operand::Field(path.split('.').map(String::from).collect())
    }

    fn cmp(left: Operand, op: CompareOp, right: Operand) -> Expr {
        Expr::Compare { left, op, right }
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("a = 1 || b = 2 && !c = 3").unwrap();
        assert_eq!(
            expr,
            Expr::Or(vec![
                cmp(field("a"), CompareOp::Eq, Operand::Literal(Literal::Num(1.0))),
                Expr::And(vec![
                    cmp(field("b"), CompareOp::Eq, Operand::Literal(Literal::Num(2.0))),
                    Expr::Not(Box::new(cmp(
                        field("c"),
                        CompareOp::Eq,
                        Operand::Literal(Literal::Num(3.0))
                    ))),
                ]),
            ])
        );
    }

    #[test]
    fn test_parentheses_override() {
        let expr = parse_expression("(a = 1 || b = 2) && c = 3").unwrap();
        assert!(matches!(expr, Expr::And(ref parts) if matches!(parts[0], Expr::Or(_))));
    }

    #[test]
    fn test_macros_and_paths() {
        let expr = parse_expression("author.org.owner = @request.auth.id").unwrap();
        assert_eq!(
            expr,
            cmp(field("author.org.owner"), CompareOp::Eq, Operand::RequestAuth("id".into()))
        );

        let expr = parse_expression("@collection.members.user ~ @request.data.name").unwrap();
        assert_eq!(
            expr,
            cmp(
                Operand::Collection {
                    collection: "members".into(),
                    path: vec!["user".into()],
                },
                CompareOp::Like,
                Operand::RequestData("name".into())
            )
        );
    }

    #[test]
    fn test_literals() {
        let expr = parse_expression("active = true && deleted != null && n >= -2.5").unwrap();
        let conjuncts = expr.conjuncts();
        assert_eq!(conjuncts.len(), 3);
        assert_eq!(
            conjuncts[1],
            &cmp(field("deleted"), CompareOp::Neq, Operand::Literal(Literal::Null))
        );
    }

    #[test]
    fn test_display_roundtrip_is_stable() {
        let source = "!(a.b ~ 'x\\'y') || (@request.auth.id != '' && @collection.m.user = id)";
        let expr = parse_expression(source).unwrap();
        let reparsed = parse_expression(&expr.to_string()).unwrap();
        assert_eq!(expr, reparsed);
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "",
            "a =",
            "a = 1 &&",
            "(a = 1",
            "a = 1)",
            "a",
            "a = 1 b = 2",
            "@request.auth = 1",
            "@request.method = 'GET'",
            "@collection.members = 1",
            "@other.x = 1",
            "a. = 1",
        ] {
            assert!(
                matches!(parse_expression(bad), Err(RuleDbError::Rule(_))),
                "expected rule error for {bad:?}"
            );
        }
    }

    #[test]
    fn test_long_chains_stay_flat() {
        let source = vec!["a = 1"; 200].join(" || ");
        match parse_expression(&source).unwrap() {
            Expr::Or(parts) => assert_eq!(parts.len(), 200),
            other => panic!("expected an || chain, got {other:?}"),
        }

        let mixed = vec!["a = 1 && b = 2"; 100].join(" || ");
        match parse_expression(&mixed).unwrap() {
            Expr::Or(parts) => assert!(parts.iter().all(|p| matches!(p, Expr::And(c) if c.len() == 2))),
            other => panic!("expected an || chain, got {other:?}"),
        }
    }

    #[test]
    fn test_comparison_limit() {
        let at_limit = vec!["a = 1"; MAX_COMPARISONS].join(" || ");
        assert!(parse_expression(&at_limit).is_ok());

        let huge = vec!["body = 'a'"; 20_000].join(" || ");
        let err = parse_expression(&huge).unwrap_err();
        assert!(matches!(err, RuleDbError::Rule(ref m) if m.contains("comparisons")), "{err:?}");
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}a = 1{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(parse_expression(&deep), Err(RuleDbError::Rule(_))));
        let ok = format!("{}a = 1{}", "(".repeat(10), ")".repeat(10));
        assert!(parse_expression(&ok).is_ok());
    }
}
