use super::ast::{CompareOp, Expr, Literal, Operand};
use crate::caller::CallerContext;
use crate::error::{Result, RuleDbError};
use crate::record::json_to_sql;
use crate::schema::{Collection, FieldType, Schema, MAX_RELATION_DEPTH};
use crate::util::quote_ident;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// A piece of SQL with its positional `?` parameters, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>) -> Self {
        SqlFragment {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn param(value: SqlValue) -> Self {
        SqlFragment {
            sql: "?".into(),
            params: vec![value],
        }
    }

    /// Join fragments with an SQL keyword, keeping parameter order.
    fn join(parts: Vec<SqlFragment>, keyword: &str) -> SqlFragment {
        let mut sql = Vec::with_capacity(parts.len());
        let mut params = Vec::new();
        for part in parts {
            sql.push(part.sql);
            params.extend(part.params);
        }
        SqlFragment {
            sql: format!("({})", sql.join(&format!(" {keyword} "))),
            params,
        }
    }
}

/// A relation hop: `LEFT JOIN "table" AS "alias" ON "alias"."id" = "parent"."field"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: String,
    pub alias: String,
    pub parent_alias: String,
    pub field: String,
}

impl Join {
    pub fn to_sql(&self) -> String {
        format!(
            "LEFT JOIN {} AS {} ON {}.\"id\" = {}.{}",
            quote_ident(&self.table),
            quote_ident(&self.alias),
            quote_ident(&self.alias),
            quote_ident(&self.parent_alias),
            quote_ident(&self.field)
        )
    }
}

/// A compiled WHERE predicate plus the joins it references.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub condition: SqlFragment,
    pub joins: Vec<Join>,
}

impl Predicate {
    pub fn allow_all() -> Self {
        Predicate {
            condition: SqlFragment::new("1"),
            joins: Vec::new(),
        }
    }

    pub fn deny_all() -> Self {
        Predicate {
            condition: SqlFragment::new("0"),
            joins: Vec::new(),
        }
    }

    /// Conjunction of two predicates. Joins are deduplicated by alias, which
    /// is deterministic per relation path.
    pub fn and(mut self, other: Predicate) -> Predicate {
        for join in other.joins {
            if !self.joins.iter().any(|j| j.alias == join.alias) {
                self.joins.push(join);
            }
        }
        Predicate {
            condition: SqlFragment::join(vec![self.condition, other.condition], "AND"),
            joins: self.joins,
        }
    }

    pub fn joins_sql(&self) -> String {
        self.joins
            .iter()
            .map(Join::to_sql)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The request-time values rule macros bind to.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub caller: &'a CallerContext,
    /// Incoming payload; `Some` only for create and update.
    pub data: Option<&'a Map<String, JsonValue>>,
}

/// Deterministic alias for the relation hop `parent.field`.
fn join_alias(parent: &str, field: &str) -> String {
    if parent.starts_with("__") {
        format!("{parent}_{field}")
    } else {
        format!("__{parent}_{field}")
    }
}

enum Term {
    Str(String),
    Value(SqlFragment),
    Unresolved,
}

impl Term {
    fn into_fragment(self) -> SqlFragment {
        match self {
            Term::Str(s) => SqlFragment::param(SqlValue::Text(s)),
            Term::Value(frag) => frag,
            Term::Unresolved => SqlFragment::new("NULL"),
        }
    }
}

/// An `@collection.<name>` source inside one EXISTS subquery.
struct Source<'s> {
    name: String,
    alias: String,
    collection: &'s Collection,
    joins: Vec<Join>,
}

/// Compiles parsed expressions against one collection.
///
/// `request` is `None` for public filters, in which case `@request.*`
/// macros are rejected. The viewer decides whether hidden auth fields can be
/// compared; it defaults to the request caller, or a guest for filters.
pub struct Compiler<'a> {
    schema: &'a Schema,
    request: Option<RequestInfo<'a>>,
    viewer: Option<&'a CallerContext>,
    joins: Vec<Join>,
    subqueries: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(schema: &'a Schema, request: Option<RequestInfo<'a>>) -> Self {
        Compiler {
            schema,
            request,
            viewer: request.map(|r| r.caller),
            joins: Vec::new(),
            subqueries: 0,
        }
    }

    /// Compile on behalf of `viewer`.
    pub fn viewer(mut self, viewer: &'a CallerContext) -> Self {
        self.viewer = Some(viewer);
        self
    }

    pub fn compile(mut self, expr: &Expr, collection: &Collection, alias: &str) -> Result<Predicate> {
        let condition = self.expr(expr, collection, alias)?;
        Ok(Predicate {
            condition,
            joins: self.joins,
        })
    }

    fn expr(&mut self, expr: &Expr, collection: &Collection, alias: &str) -> Result<SqlFragment> {
        match expr {
            Expr::And(_) => self.conjunction(expr.conjuncts(), collection, alias),
            Expr::Or(parts) => {
                let mut compiled = Vec::with_capacity(parts.len());
                for part in parts {
                    compiled.push(self.expr(part, collection, alias)?);
                }
                Ok(SqlFragment::join(compiled, "OR"))
            }
            Expr::Not(inner) => {
                let inner = self.expr(inner, collection, alias)?;
                Ok(SqlFragment {
                    sql: format!("NOT {}", inner.sql),
                    params: inner.params,
                })
            }
            Expr::Compare { left, op, right } => {
                let names = collection_refs(left, right);
                if names.is_empty() {
                    let mut none = Vec::new();
                    self.comparison(left, *op, right, collection, alias, &mut none)
                } else {
                    self.exists(&names, &[expr], collection, alias)
                }
            }
        }
    }

    /// Comparisons in one `&&` chain that reference the same `@collection`
    /// sources share a single EXISTS, so they constrain the same row.
    fn conjunction(&mut self, parts: Vec<&Expr>, collection: &Collection, alias: &str) -> Result<SqlFragment> {
        enum Item<'e> {
            Plain(&'e Expr),
            Group(usize),
        }
        let mut items = Vec::new();
        let mut groups: Vec<(Vec<String>, Vec<&Expr>)> = Vec::new();

        for part in parts {
            let names = match part {
                Expr::Compare { left, right, .. } => collection_refs(left, right),
                _ => Vec::new(),
            };
            if names.is_empty() {
                items.push(Item::Plain(part));
                continue;
            }
            match groups.iter().position(|(key, _)| *key == names) {
                Some(idx) => groups[idx].1.push(part),
                None => {
                    groups.push((names, vec![part]));
                    items.push(Item::Group(groups.len() - 1));
                }
            }
        }

        let mut compiled = Vec::with_capacity(items.len());
        for item in items {
            compiled.push(match item {
                Item::Plain(expr) => self.expr(expr, collection, alias)?,
                Item::Group(idx) => {
                    let (names, exprs) = &groups[idx];
                    self.exists(names, exprs, collection, alias)?
                }
            });
        }
        if compiled.len() == 1 {
            return Ok(compiled.remove(0));
        }
        Ok(SqlFragment::join(compiled, "AND"))
    }

    fn exists(
        &mut self,
        names: &[String],
        comparisons: &[&Expr],
        collection: &Collection,
        alias: &str,
    ) -> Result<SqlFragment> {
        let schema = self.schema;
        let mut sources = Vec::with_capacity(names.len());
        for name in names {
            let target: &Arc<Collection> = schema
                .by_name(name)
                .ok_or_else(|| RuleDbError::Rule(format!("unknown collection '@collection.{name}'")))?;
            self.subqueries += 1;
            sources.push(Source {
                name: name.clone(),
                alias: format!("__c{}", self.subqueries),
                collection: target,
                joins: Vec::new(),
            });
        }

        let mut conditions = Vec::with_capacity(comparisons.len());
        for expr in comparisons {
            if let Expr::Compare { left, op, right } = expr {
                conditions.push(self.comparison(left, *op, right, collection, alias, &mut sources)?);
            }
        }
        let condition = SqlFragment::join(conditions, "AND");

        let from = sources
            .iter()
            .map(|s| {
                let mut sql = format!(
                    "{} AS {}",
                    quote_ident(&s.collection.name),
                    quote_ident(&s.alias)
                );
                for join in &s.joins {
                    sql.push(' ');
                    sql.push_str(&join.to_sql());
                }
                sql
            })
            .collect::<Vec<_>>()
            .join(", ");

        Ok(SqlFragment {
            sql: format!("EXISTS (SELECT 1 FROM {from} WHERE {})", condition.sql),
            params: condition.params,
        })
    }

    fn comparison(
        &mut self,
        left: &Operand,
        op: CompareOp,
        right: &Operand,
        collection: &Collection,
        alias: &str,
        sources: &mut [Source<'_>],
    ) -> Result<SqlFragment> {
        // Resolve both sides first so unknown fields are reported even when
        // the comparison ends up unresolved.
        let left = self.operand(left, collection, alias, sources)?;
        let right = self.operand(right, collection, alias, sources)?;
        if matches!(left, Term::Unresolved) || matches!(right, Term::Unresolved) {
            return Ok(SqlFragment::new("NULL"));
        }

        let left = left.into_fragment();
        let right = match (op, right) {
            (CompareOp::Like | CompareOp::NotLike, Term::Str(s)) => {
                let pattern = if s.contains('%') { s } else { format!("%{s}%") };
                SqlFragment::param(SqlValue::Text(pattern))
            }
            (CompareOp::Like | CompareOp::NotLike, other) => {
                let frag = other.into_fragment();
                SqlFragment {
                    sql: format!("('%' || {} || '%')", frag.sql),
                    params: frag.params,
                }
            }
            (_, other) => other.into_fragment(),
        };

        let sql_op = match op {
            CompareOp::Eq => "IS",
            CompareOp::Neq => "IS NOT",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
        };

        let mut params = left.params;
        params.extend(right.params);
        Ok(SqlFragment {
            sql: format!("({} {sql_op} {})", left.sql, right.sql),
            params,
        })
    }

    fn operand(
        &mut self,
        operand: &Operand,
        collection: &Collection,
        alias: &str,
        sources: &mut [Source<'_>],
    ) -> Result<Term> {
        match operand {
            Operand::Literal(Literal::Str(s)) => Ok(Term::Str(s.clone())),
            Operand::Literal(Literal::Num(n)) => Ok(Term::Value(SqlFragment::param(SqlValue::Real(*n)))),
            Operand::Literal(Literal::Bool(b)) => {
                Ok(Term::Value(SqlFragment::param(SqlValue::Integer(i64::from(*b)))))
            }
            Operand::Literal(Literal::Null) => Ok(Term::Value(SqlFragment::new("NULL"))),
            Operand::Field(path) => {
                let (owner, owner_alias, column) =
                    resolve_path(self.schema, collection, alias, path, &mut self.joins)?;
                Ok(Term::Value(self.column(owner, &owner_alias, &column)))
            }
            Operand::Collection { collection: name, path } => {
                let source = sources
                    .iter_mut()
                    .find(|s| s.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| RuleDbError::Rule(format!("unknown collection '@collection.{name}'")))?;
                let (owner, owner_alias, column) =
                    resolve_path(self.schema, source.collection, &source.alias, path, &mut source.joins)?;
                Ok(Term::Value(self.column(owner, &owner_alias, &column)))
            }
            Operand::RequestAuth(field) => {
                let request = self.request_info()?;
                let Some(auth) = request.caller.auth_record() else {
                    return Ok(Term::Unresolved);
                };
                let value = match field.as_str() {
                    "id" => SqlValue::Text(auth.id.clone()),
                    "collectionId" => SqlValue::Text(auth.collection_id.clone()),
                    "collectionName" => SqlValue::Text(auth.collection_name.clone()),
                    other => auth.data.get(other).map(json_to_sql).unwrap_or(SqlValue::Null),
                };
                Ok(Term::Value(SqlFragment::param(value)))
            }
            Operand::RequestData(field) => {
                let request = self.request_info()?;
                match request.data.and_then(|data| data.get(field)) {
                    Some(value) => Ok(Term::Value(SqlFragment::param(json_to_sql(value)))),
                    None => Ok(Term::Unresolved),
                }
            }
        }
    }

    /// A qualified column. The email of an auth record reads as NULL unless
    /// it is public or the viewer is that record; admins see every email.
    fn column(&self, owner: &Collection, alias: &str, name: &str) -> SqlFragment {
        let alias = quote_ident(alias);
        let column = format!("{alias}.{}", quote_ident(name));
        if name != "email" || !owner.is_auth() || self.viewer.is_some_and(CallerContext::is_admin) {
            return SqlFragment::new(column);
        }
        let own = self
            .viewer
            .and_then(CallerContext::auth_record)
            .filter(|record| record.collection_id == owner.id);
        match own {
            Some(record) => SqlFragment {
                sql: format!(
                    "(CASE WHEN {alias}.\"email_visibility\" = 1 OR {alias}.\"id\" = ? THEN {column} END)"
                ),
                params: vec![SqlValue::Text(record.id.clone())],
            },
            None => SqlFragment::new(format!(
                "(CASE WHEN {alias}.\"email_visibility\" = 1 THEN {column} END)"
            )),
        }
    }

    fn request_info(&self) -> Result<RequestInfo<'a>> {
        self.request
            .ok_or_else(|| RuleDbError::Rule("@request macros are not allowed in filters".into()))
    }
}

/// Distinct `@collection` names used by a comparison, lowercased and sorted.
fn collection_refs(left: &Operand, right: &Operand) -> Vec<String> {
    let mut names: Vec<String> = [left.collection_ref(), right.collection_ref()]
        .into_iter()
        .flatten()
        .map(str::to_ascii_lowercase)
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Resolve a dotted field path, adding a join for every relation hop.
/// Returns the collection owning the final column, its alias and the column
/// name.
fn resolve_path<'s>(
    schema: &'s Schema,
    collection: &'s Collection,
    alias: &str,
    path: &[String],
    joins: &mut Vec<Join>,
) -> Result<(&'s Collection, String, String)> {
    let Some((last, hops)) = path.split_last() else {
        return Err(RuleDbError::Rule("empty field path".into()));
    };
    if hops.len() > MAX_RELATION_DEPTH {
        return Err(RuleDbError::Rule(format!(
            "'{}' exceeds the maximum of {MAX_RELATION_DEPTH} relation hops",
            path.join(".")
        )));
    }

    let mut current = collection;
    let mut current_alias = alias.to_string();
    for hop in hops {
        let field = current.field(hop).ok_or_else(|| unknown_field(hop, current))?;
        if field.field_type != FieldType::Relation {
            return Err(RuleDbError::Rule(format!(
                "'{hop}' in collection '{}' is not a relation field",
                current.name
            )));
        }
        let target: &Collection = schema.relation_target(field).ok_or_else(|| {
            RuleDbError::Rule(format!("relation target of '{hop}' does not exist"))
        })?;
        let next_alias = join_alias(&current_alias, hop);
        if !joins.iter().any(|j| j.alias == next_alias) {
            joins.push(Join {
                table: target.name.clone(),
                alias: next_alias.clone(),
                parent_alias: current_alias.clone(),
                field: hop.clone(),
            });
        }
        current = target;
        current_alias = next_alias;
    }

    if current.column_type(last).is_none() {
        return Err(unknown_field(last, current));
    }
    Ok((current, current_alias, last.clone()))
}

fn unknown_field(name: &str, collection: &Collection) -> RuleDbError {
    RuleDbError::Rule(format!(
        "unknown field '{name}' in collection '{}'",
        collection.name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::AuthRecord;
    use crate::rules::parse_expression;
    use crate::schema::{CollectionType, Field};
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        let mut orgs = Collection::new("orgs", CollectionType::Base);
        orgs.id = "c_orgs".into();
        orgs.fields.push(Field::new("name", FieldType::Text));
        orgs.fields.push(Field::new("parent", FieldType::Relation).relation_to("c_orgs", false));

        let mut users = Collection::new("users", CollectionType::Auth);
        users.id = "c_users".into();
        users.fields.push(Field::new("org", FieldType::Relation).relation_to("c_orgs", false));
        users.fields.push(Field::new("role", FieldType::Text));

        let mut posts = Collection::new("posts", CollectionType::Base);
        posts.id = "c_posts".into();
        posts.fields.push(Field::new("title", FieldType::Text));
        posts.fields.push(Field::new("author", FieldType::Relation).relation_to("c_users", true));
        posts.fields.push(Field::new("views", FieldType::Number));

        let mut members = Collection::new("members", CollectionType::Base);
        members.id = "c_members".into();
        members.fields.push(Field::new("user", FieldType::Relation).relation_to("c_users", false));
        members.fields.push(Field::new("post", FieldType::Relation).relation_to("c_posts", false));

        Schema::new(1, vec![orgs, users, posts, members])
    }

    fn user_caller() -> CallerContext {
        let mut data = Map::new();
        data.insert("role".into(), JsonValue::String("editor".into()));
        CallerContext::Record(AuthRecord {
            collection_id: "c_users".into(),
            collection_name: "users".into(),
            id: "u1".into(),
            data,
        })
    }

    fn compile(src: &str, caller: &CallerContext, data: Option<&Map<String, JsonValue>>) -> Result<Predicate> {
        let schema = schema();
        let posts = schema.by_name("posts").unwrap().clone();
        let expr = parse_expression(src)?;
        let request = RequestInfo { caller, data };
        Compiler::new(&schema, Some(request)).compile(&expr, &posts, "posts")
    }

    #[test]
    fn test_equality_and_null() {
        let p = compile("title = 'a' && author != null", &CallerContext::Guest, None).unwrap();
        assert_eq!(
            p.condition.sql,
            "((\"posts\".\"title\" IS ?) AND (\"posts\".\"author\" IS NOT NULL))"
        );
        assert_eq!(p.condition.params, vec![SqlValue::Text("a".into())]);
        assert!(p.joins.is_empty());
    }

    #[test]
    fn test_like_wrapping() {
        let p = compile("title ~ 'rust' || title !~ 'a%'", &CallerContext::Guest, None).unwrap();
        assert_eq!(
            p.condition.sql,
            "((\"posts\".\"title\" LIKE ?) OR (\"posts\".\"title\" NOT LIKE ?))"
        );
        assert_eq!(
            p.condition.params,
            vec![SqlValue::Text("%rust%".into()), SqlValue::Text("a%".into())]
        );

        let p = compile("title ~ author.role", &CallerContext::Guest, None).unwrap();
        assert_eq!(
            p.condition.sql,
            "(\"posts\".\"title\" LIKE ('%' || \"__posts_author\".\"role\" || '%'))"
        );
    }

    #[test]
    fn test_relation_joins_are_deduplicated() {
        let p = compile(
            "author.role = 'x' && author.org.name = 'acme' && author.org.parent.name != ''",
            &CallerContext::Guest,
            None,
        )
        .unwrap();
        let aliases: Vec<&str> = p.joins.iter().map(|j| j.alias.as_str()).collect();
        assert_eq!(
            aliases,
            vec!["__posts_author", "__posts_author_org", "__posts_author_org_parent"]
        );
        assert_eq!(
            p.joins[1].to_sql(),
            "LEFT JOIN \"orgs\" AS \"__posts_author_org\" ON \"__posts_author_org\".\"id\" = \"__posts_author\".\"org\""
        );
    }

    #[test]
    fn test_relation_depth_limit() {
        let six = "author.org.parent.parent.parent.parent.name = ''";
        assert!(compile(six, &CallerContext::Guest, None).is_ok());
        let seven = "author.org.parent.parent.parent.parent.parent.name = ''";
        assert!(matches!(
            compile(seven, &CallerContext::Guest, None),
            Err(RuleDbError::Rule(_))
        ));
    }

    #[test]
    fn test_unknown_and_non_relation_fields() {
        assert!(matches!(compile("nope = 1", &CallerContext::Guest, None), Err(RuleDbError::Rule(_))));
        assert!(matches!(compile("title.x = 1", &CallerContext::Guest, None), Err(RuleDbError::Rule(_))));
        // Still reported when the other side is unresolved.
        assert!(matches!(
            compile("nope = @request.auth.id", &CallerContext::Guest, None),
            Err(RuleDbError::Rule(_))
        ));
    }

    #[test]
    fn test_auth_macros() {
        let caller = user_caller();
        let p = compile("author = @request.auth.id && @request.auth.role = 'editor' && @request.auth.missing = null", &caller, None).unwrap();
        assert_eq!(
            p.condition.params,
            vec![
                SqlValue::Text("u1".into()),
                SqlValue::Text("editor".into()),
                SqlValue::Text("editor".into()),
                SqlValue::Null,
            ]
        );

        let guest = compile("@request.auth.id != ''", &CallerContext::Guest, None).unwrap();
        assert_eq!(guest.condition.sql, "NULL");
        assert!(guest.condition.params.is_empty());

        let negated = compile("!(@request.auth.id = '')", &CallerContext::Guest, None).unwrap();
        assert_eq!(negated.condition.sql, "NOT NULL");
    }

    #[test]
    fn test_data_macros() {
        let mut data = Map::new();
        data.insert("author".into(), JsonValue::String("u2".into()));
        let caller = user_caller();

        let p = compile("@request.data.author = @request.auth.id", &caller, Some(&data)).unwrap();
        assert_eq!(p.condition.sql, "(? IS ?)");
        assert_eq!(
            p.condition.params,
            vec![SqlValue::Text("u2".into()), SqlValue::Text("u1".into())]
        );

        let absent = compile("@request.data.title = 'x'", &caller, Some(&data)).unwrap();
        assert_eq!(absent.condition.sql, "NULL");
        let no_payload = compile("@request.data.author = 'x'", &caller, None).unwrap();
        assert_eq!(no_payload.condition.sql, "NULL");
    }

    #[test]
    fn test_filters_reject_request_macros() {
        let schema = schema();
        let posts = schema.by_name("posts").unwrap().clone();
        let expr = parse_expression("author = @request.auth.id").unwrap();
        let err = Compiler::new(&schema, None).compile(&expr, &posts, "posts").unwrap_err();
        assert!(matches!(err, RuleDbError::Rule(_)));
    }

    #[test]
    fn test_collection_macro_groups_conjuncts() {
        let caller = user_caller();
        let p = compile(
            "@collection.members.user = @request.auth.id && @collection.members.post = id && title != ''",
            &caller,
            None,
        )
        .unwrap();
        assert_eq!(
            p.condition.sql,
            "(EXISTS (SELECT 1 FROM \"members\" AS \"__c1\" WHERE ((\"__c1\".\"user\" IS ?) AND (\"__c1\".\"post\" IS \"posts\".\"id\"))) AND (\"posts\".\"title\" IS NOT ?))"
        );
        assert_eq!(
            p.condition.params,
            vec![SqlValue::Text("u1".into()), SqlValue::Text("".into())]
        );
        assert!(p.joins.is_empty());
    }

    #[test]
    fn test_collection_macro_with_hops() {
        let p = compile("@collection.members.user.role = 'admin'", &CallerContext::Guest, None).unwrap();
        assert_eq!(
            p.condition.sql,
            "EXISTS (SELECT 1 FROM \"members\" AS \"__c1\" LEFT JOIN \"users\" AS \"__c1_user\" ON \"__c1_user\".\"id\" = \"__c1\".\"user\" WHERE ((\"__c1_user\".\"role\" IS ?)))"
        );
        assert!(matches!(
            compile("@collection.ghosts.x = 1", &CallerContext::Guest, None),
            Err(RuleDbError::Rule(_))
        ));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let caller = user_caller();
        let src = "author.org.name ~ 'a' || @collection.members.user = @request.auth.id";
        assert_eq!(compile(src, &caller, None).unwrap(), compile(src, &caller, None).unwrap());
    }

    #[test]
    fn test_long_or_chain_compiles_flat() {
        let src = vec!["title = 'a'"; 200].join(" || ");
        let p = compile(&src, &CallerContext::Guest, None).unwrap();
        assert_eq!(p.condition.params.len(), 200);
        assert_eq!(p.condition.sql.matches(" OR ").count(), 199);
    }

    #[test]
    fn test_hidden_email_reads_as_null() {
        let guest = compile("author.email = 'a@x.io'", &CallerContext::Guest, None).unwrap();
        assert_eq!(
            guest.condition.sql,
            "((CASE WHEN \"__posts_author\".\"email_visibility\" = 1 THEN \"__posts_author\".\"email\" END) IS ?)"
        );

        let own = compile("author.email = 'a@x.io'", &user_caller(), None).unwrap();
        assert_eq!(
            own.condition.sql,
            "((CASE WHEN \"__posts_author\".\"email_visibility\" = 1 OR \"__posts_author\".\"id\" = ? THEN \"__posts_author\".\"email\" END) IS ?)"
        );
        assert_eq!(
            own.condition.params,
            vec![SqlValue::Text("u1".into()), SqlValue::Text("a@x.io".into())]
        );

        let through_collection =
            compile("@collection.users.email ~ 'x.io'", &CallerContext::Guest, None).unwrap();
        assert!(through_collection
            .condition
            .sql
            .contains("CASE WHEN \"__c1\".\"email_visibility\" = 1 THEN \"__c1\".\"email\" END"));

        let schema = schema();
        let posts = schema.by_name("posts").unwrap().clone();
        let expr = parse_expression("author.email = 'a@x.io'").unwrap();
        let admin = Compiler::new(&schema, None)
            .viewer(&CallerContext::Admin)
            .compile(&expr, &posts, "posts")
            .unwrap();
        assert_eq!(admin.condition.sql, "(\"__posts_author\".\"email\" IS ?)");
    }

    #[test]
    fn test_predicate_and_merges_joins() {
        let a = compile("author.role = 'x'", &CallerContext::Guest, None).unwrap();
        let b = compile("author.org.name = 'y'", &CallerContext::Guest, None).unwrap();
        let merged = a.and(b);
        assert_eq!(merged.joins.len(), 2);
        assert_eq!(merged.condition.params.len(), 2);
        assert!(merged.condition.sql.contains(" AND "));
    }
}
