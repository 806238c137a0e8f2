//! Rule and filter expressions.
//!
//! Rules are parsed and compiled fresh for every request: compilation binds
//! `@request.*` macros to the caller and payload, so a compiled predicate is
//! never reused across callers.

mod ast;
mod compiler;
mod lexer;
mod parser;

pub use ast::{CompareOp, Expr, Literal, Operand};
pub use compiler::{Compiler, Join, Predicate, RequestInfo, SqlFragment};
pub use parser::{parse_expression, MAX_COMPARISONS};

use crate::caller::CallerContext;
use crate::error::Result;
use crate::schema::{Collection, Operation, Schema};
use serde_json::Map;

/// Compile the rule guarding `op` on `collection` for one request.
///
/// Admins bypass every rule. A missing rule denies everyone else; an empty
/// rule allows everyone.
pub fn compile_rule(
    schema: &Schema,
    collection: &Collection,
    alias: &str,
    op: Operation,
    request: RequestInfo<'_>,
) -> Result<Predicate> {
    if request.caller.is_admin() {
        return Ok(Predicate::allow_all());
    }
    let predicate = match collection.rules.get(op) {
        None => Predicate::deny_all(),
        Some(rule) if rule.trim().is_empty() => Predicate::allow_all(),
        Some(rule) => {
            let expr = parse_expression(rule)?;
            Compiler::new(schema, Some(request)).compile(&expr, collection, alias)?
        }
    };
    log::debug!(
        "{} rule for {}: {} {:?}",
        op.as_str(),
        collection.name,
        predicate.condition.sql,
        predicate.condition.params
    );
    Ok(predicate)
}

/// Compile a caller-supplied filter. `@request.*` macros are rejected, and
/// fields hidden from `caller` compare as NULL.
pub fn compile_filter(
    schema: &Schema,
    collection: &Collection,
    alias: &str,
    filter: &str,
    caller: &CallerContext,
) -> Result<Predicate> {
    if filter.trim().is_empty() {
        return Ok(Predicate::allow_all());
    }
    let expr = parse_expression(filter)?;
    Compiler::new(schema, None)
        .viewer(caller)
        .compile(&expr, collection, alias)
}

/// Check that a rule parses and references only existing fields.
pub fn check_rule(schema: &Schema, collection: &Collection, rule: &str) -> Result<()> {
    if rule.trim().is_empty() {
        return Ok(());
    }
    let expr = parse_expression(rule)?;
    let guest = CallerContext::Guest;
    let data = Map::new();
    let request = RequestInfo {
        caller: &guest,
        data: Some(&data),
    };
    Compiler::new(schema, Some(request)).compile(&expr, collection, &collection.name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleDbError;
    use crate::schema::{CollectionType, Field, FieldType};

    fn posts() -> (Schema, Collection) {
        let mut posts = Collection::new("posts", CollectionType::Base);
        posts.id = "p".into();
        posts.fields.push(Field::new("title", FieldType::Text));
        posts.rules.list = Some(String::new());
        posts.rules.view = Some("title != ''".into());
        (Schema::new(1, vec![posts.clone()]), posts)
    }

    fn request(caller: &CallerContext) -> RequestInfo<'_> {
        RequestInfo { caller, data: None }
    }

    #[test]
    fn test_rule_edge_policy() {
        let (schema, posts) = posts();
        let guest = CallerContext::Guest;
        let list = compile_rule(&schema, &posts, "posts", Operation::List, request(&guest)).unwrap();
        assert_eq!(list, Predicate::allow_all());
        let delete = compile_rule(&schema, &posts, "posts", Operation::Delete, request(&guest)).unwrap();
        assert_eq!(delete, Predicate::deny_all());

        let admin = CallerContext::Admin;
        let delete = compile_rule(&schema, &posts, "posts", Operation::Delete, request(&admin)).unwrap();
        assert_eq!(delete, Predicate::allow_all());
    }

    #[test]
    fn test_filter_and_check() {
        let (schema, posts) = posts();
        assert_eq!(compile_filter(&schema, &posts, "posts", "  ", &CallerContext::Guest).unwrap(), Predicate::allow_all());
        assert!(compile_filter(&schema, &posts, "posts", "title ~ 'x'", &CallerContext::Guest).is_ok());
        assert!(matches!(
            compile_filter(&schema, &posts, "posts", "title = @request.auth.id", &CallerContext::Guest),
            Err(RuleDbError::Rule(_))
        ));
        assert!(check_rule(&schema, &posts, "title = @request.data.title").is_ok());
        assert!(check_rule(&schema, &posts, "body = 1").is_err());
    }
}
