mod common;

use common::{blog_store, create_temp_store};
use pretty_assertions::assert_eq;
use ruledb::{ApplyOptions, CallerContext, ListQuery, RuleDbError, SchemaChange};
use serde_json::json;

#[test]
fn field_rename_preserves_values() {
    let (_dir, store) = blog_store();
    let posts = store.collection("posts").unwrap();
    let post = posts
        .create(&CallerContext::Admin, &json!({ "title": "Hello", "status": "published" }))
        .unwrap();

    // Same field id, new name: a rename rather than drop + add.
    let mut def = posts.definition().unwrap();
    let title = def.fields.iter_mut().find(|f| f.name == "title").unwrap();
    title.name = "headline".into();
    let applied = store.apply_schema(def, ApplyOptions::default()).unwrap();
    assert_eq!(
        applied.changes,
        vec![SchemaChange::FieldRenamed {
            collection: "posts".into(),
            from: "title".into(),
            to: "headline".into(),
        }]
    );
    assert!(applied.ledger.is_some());

    let posts = store.collection("posts").unwrap();
    let reloaded = posts.view(&CallerContext::Guest, &post.id, None).unwrap();
    assert_eq!(reloaded.get_str("headline"), Some("Hello"));
    assert!(reloaded.get("title").is_none());
}

#[test]
fn failed_apply_leaves_schema_and_data_unchanged() {
    let (_dir, store) = blog_store();
    let posts = store.collection("posts").unwrap();
    posts
        .create(&CallerContext::Admin, &json!({ "title": "12", "slug": "a" }))
        .unwrap();
    posts
        .create(&CallerContext::Admin, &json!({ "title": "not a number", "slug": "b" }))
        .unwrap();
    let ledger_before = store.ledger().unwrap();
    let schema_before = store.collections().unwrap();

    // Retyping a field with a non-castable value fails as a whole.
    let mut def = posts.definition().unwrap();
    def.fields
        .iter_mut()
        .find(|f| f.name == "title")
        .unwrap()
        .field_type = ruledb::FieldType::Number;
    let result = store.apply_schema(def.clone(), ApplyOptions::default());
    assert!(matches!(result, Err(RuleDbError::SchemaConflict(_))));
    assert_eq!(store.ledger().unwrap(), ledger_before);
    assert_eq!(store.collections().unwrap(), schema_before);
    let titles: Vec<Option<String>> = store
        .collection("posts")
        .unwrap()
        .list(&CallerContext::Admin, &ListQuery::new().sort("slug"))
        .unwrap()
        .items
        .iter()
        .map(|r| r.get_str("title").map(str::to_string))
        .collect();
    assert_eq!(titles, vec![Some("12".to_string()), Some("not a number".to_string())]);

    // A document whose second collection is invalid creates nothing.
    let result = store.apply_yaml(
        r#"
collections:
  - name: tags
    fields:
      - { name: label, type: text }
  - name: broken
    fields:
      - { name: target, type: relation, options: { collection_id: nowhere } }
"#,
        ApplyOptions::default(),
    );
    assert!(result.is_err());
    assert!(store.collection("tags").is_err());
    assert_eq!(store.ledger().unwrap(), ledger_before);

    // With truncation acknowledged the retype goes through.
    let applied = store
        .apply_schema(def, ApplyOptions { allow_truncation: true })
        .unwrap();
    assert!(applied.changes.iter().any(SchemaChange::is_destructive));
    let items = store
        .collection("posts")
        .unwrap()
        .list(&CallerContext::Admin, &ListQuery::new().sort("slug"))
        .unwrap()
        .items;
    assert_eq!(items[0].get("title"), Some(&json!(12)));
    assert_eq!(items[1].get("title"), Some(&serde_json::Value::Null));
}

#[test]
fn reapplying_a_definition_is_a_noop() {
    let (_dir, store) = blog_store();
    let before = store.ledger().unwrap().len();
    let posts = store.collection("posts").unwrap();
    let applied = store
        .apply_schema(posts.definition().unwrap(), ApplyOptions::default())
        .unwrap();
    assert!(applied.skipped);
    assert!(applied.ledger.is_none());
    assert_eq!(store.ledger().unwrap().len(), before);
}

#[test]
fn run_migrations_applies_each_step_once() {
    let (dir, store) = create_temp_store();
    let steps = dir.path().join("migrations");
    std::fs::create_dir_all(&steps).unwrap();
    std::fs::write(
        steps.join("001_users.yaml"),
        "collections:\n  - name: users\n    type: auth\n",
    )
    .unwrap();
    std::fs::write(
        steps.join("002_notes.yaml"),
        r#"
collections:
  - name: notes
    fields:
      - { name: body, type: text }
      - { name: author, type: relation, options: { collection_id: users } }
"#,
    )
    .unwrap();
    std::fs::write(steps.join("README.txt"), "not a step").unwrap();

    let outcomes = store.run_migrations(&steps).unwrap();
    let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["001_users", "002_notes"]);
    assert!(outcomes.iter().all(|o| !o.skipped));
    assert_eq!(store.ledger().unwrap().len(), 2);

    let again = store.run_migrations(&steps).unwrap();
    assert!(again.iter().all(|o| o.skipped));
    assert_eq!(store.ledger().unwrap().len(), 2);

    // Editing an applied step is refused.
    std::fs::write(
        steps.join("001_users.yaml"),
        "collections:\n  - name: members\n    type: auth\n",
    )
    .unwrap();
    assert!(matches!(
        store.run_migrations(&steps),
        Err(RuleDbError::SchemaConflict(_))
    ));
}

#[test]
fn delete_collection_refused_while_referenced() {
    let (_dir, store) = blog_store();
    assert!(matches!(
        store.delete_collection("users"),
        Err(RuleDbError::SchemaConflict(_))
    ));

    let entry = store.delete_collection("comments").unwrap();
    assert!(entry.name.starts_with("drop_comments_"));
    assert!(matches!(
        store.collection("comments"),
        Err(RuleDbError::CollectionNotFound(_))
    ));
}

#[test]
fn schema_changes_are_seen_by_other_store_instances() {
    let (dir, store) = blog_store();
    let other = ruledb::Store::open(dir.path()).unwrap();
    assert!(other.collection("posts").is_ok());

    store
        .apply_yaml("name: tags\nfields: [{ name: label, type: text }]\n", ApplyOptions::default())
        .unwrap();
    assert!(other.collection("tags").is_ok());
}
