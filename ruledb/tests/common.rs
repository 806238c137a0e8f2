#![allow(dead_code)]

use std::time::Duration;

use ruledb::{ApplyOptions, CallerContext, Config, Store};
use serde_json::json;

pub const BLOG_SCHEMA: &str = r#"
collections:
  - name: users
    type: auth
    fields:
      - { name: name, type: text }
    rules:
      list: ""
      view: ""
      create: ""
  - name: posts
    fields:
      - { name: title, type: text, required: true }
      - { name: slug, type: text, unique: true }
      - { name: owner, type: relation, options: { collection_id: users } }
      - { name: status, type: select, options: { values: [draft, published] } }
    rules:
      list: "status = 'published' || owner = @request.auth.id"
      view: "status = 'published' || owner = @request.auth.id"
      create: "@request.data.owner = @request.auth.id"
      update: "owner = @request.auth.id"
      delete: "owner = @request.auth.id"
  - name: comments
    fields:
      - { name: body, type: text }
    rules:
      list: ""
      view: ""
      create: ""
"#;

pub fn create_temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let store = Store::open(dir.path()).expect("open store");
    (dir, store)
}

pub fn create_temp_store_with_config(config: Config) -> (tempfile::TempDir, Store) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let store = Store::open_with_config(dir.path(), config).expect("open store");
    (dir, store)
}

pub fn blog_store() -> (tempfile::TempDir, Store) {
    let (dir, store) = create_temp_store();
    store
        .apply_yaml(BLOG_SCHEMA, ApplyOptions::default())
        .expect("apply blog schema");
    (dir, store)
}

/// Create a user and return it as a caller.
pub fn sign_up(store: &Store, name: &str) -> CallerContext {
    let record = store
        .collection("users")
        .expect("users collection")
        .create(
            &CallerContext::Guest,
            &json!({ "name": name, "username": name, "email": format!("{name}@example.com") }),
        )
        .expect("create user");
    store.auth_caller("users", &record.id).expect("load caller")
}

pub fn caller_id(caller: &CallerContext) -> String {
    caller.auth_record().map(|r| r.id.clone()).unwrap_or_default()
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
