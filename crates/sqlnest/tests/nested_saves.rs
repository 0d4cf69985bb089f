use sqlnest::prelude::*;
use sqlnest::{ConfigErrorKind, StatementKind};
use sqlnest_session::testing::MemoryConnection;

fn blog_schema() -> Schema {
    Schema::builder()
        .alias("author", "user")
        .primary("categorization", ["post_id", "category_id"])
        .required("post", "author_id")
        .required("categorization", "post_id")
        .required("categorization", "category_id")
        .build()
        .unwrap()
}

fn blog() -> Database<MemoryConnection> {
    Database::new(MemoryConnection::new(), blog_schema())
}

fn written_tables(db: &Database<MemoryConnection>) -> Vec<String> {
    db.connection()
        .statements()
        .iter()
        .filter_map(|sql| sql.strip_prefix("INSERT INTO \""))
        .filter_map(|rest| rest.split('"').next())
        .map(str::to_string)
        .collect()
}

#[test]
fn nested_data_is_written_parents_first() {
    let db = blog();
    let post = db
        .create_record(
            "post",
            json!({
                "title": "Hello",
                "author": {"name": "Ada"},
                "categorizationList": [
                    {"category": {"title": "Rust"}},
                    {"category": {"title": "SQL"}},
                ],
            }),
        )
        .unwrap();

    let report = post.save().unwrap();
    assert_eq!(report.inserted, 6);
    assert_eq!(
        written_tables(&db),
        vec!["user", "post", "category", "categorization", "category", "categorization"]
    );

    let stored = db.connection().rows("categorization");
    assert_eq!(stored.len(), 2);
    for row in &stored {
        assert_eq!(row.get("post_id"), Some(&Value::BigInt(1)));
    }
    assert_eq!(stored[1].get("category_id"), Some(&Value::BigInt(2)));
    assert_eq!(db.connection().rows("post")[0].get("author_id"), Some(&Value::BigInt(1)));
}

#[test]
fn saving_twice_writes_nothing_new() {
    let db = blog();
    let post = db
        .create_record("post", json!({"title": "Hello", "author": {"name": "Ada"}}))
        .unwrap();
    post.save().unwrap();
    db.reset_counters();

    let report = post.save().unwrap();
    assert!(report.statements.is_empty());
    assert_eq!(db.statement_count(), 0);
    assert_eq!(db.query_count(), 0);
}

#[test]
fn loaded_rows_save_only_their_changes() {
    let db = blog();
    db.create_record("post", json!({"title": "Hello", "author": {"name": "Ada"}}))
        .unwrap()
        .save()
        .unwrap();

    let post = db.find("post", 1).unwrap().unwrap();
    let author = post.reference("author").unwrap().unwrap();
    author.set("name", "Ada Lovelace");
    db.connection().clear_log();

    // the resolved author sits in the post's nested slot and is saved with it
    let report = post.save().unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(
        db.connection().statements(),
        vec![r#"UPDATE "user" SET "name" = $1 WHERE "id" = $2"#.to_string()]
    );
}

#[test]
fn new_children_of_loaded_rows_pick_up_its_key() {
    let db = blog();
    db.connection().seed("user", vec![("id", Value::BigInt(42)), ("name", "Ada".into())]);
    let user = db.find("user", 42).unwrap().unwrap();
    user.push_back_reference("post", db.record("post").unwrap().with("title", "One"));
    user.push_back_reference("post", db.record("post").unwrap().with("title", "Two"));

    let report = user.save().unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped, 1);
    let posts = db.connection().rows("post");
    assert!(posts.iter().all(|p| p.get("user_id") == Some(&Value::BigInt(42))));
}

#[test]
fn nullable_cycles_are_closed_with_a_follow_up_update() {
    let db = Database::new(MemoryConnection::new(), Schema::default());
    let user = db.record("user").unwrap().with("name", "Ada");
    let profile = db.record("profile").unwrap().with("bio", "mathematician");
    user.set_reference("profile", Some(profile.clone()));
    profile.set_reference("user", Some(user.clone()));

    let report = user.save().unwrap();
    let kinds: Vec<StatementKind> = report.statements.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![StatementKind::Insert, StatementKind::Insert, StatementKind::Update]
    );

    let users = db.connection().rows("user");
    let profiles = db.connection().rows("profile");
    assert_eq!(users[0].get("profile_id"), profiles[0].get("id"));
    assert_eq!(profiles[0].get("user_id"), users[0].get("id"));
}

#[test]
fn required_cycles_are_rejected_up_front() {
    let schema = Schema::builder()
        .required("user", "profile_id")
        .required("profile", "user_id")
        .build()
        .unwrap();
    let db = Database::new(MemoryConnection::new(), schema);
    let user = db
        .create_record("user", json!({"name": "Ada", "profile": {"bio": "x"}}))
        .unwrap();
    let nested = user.nested();
    let profile = nested["profile"].records()[0].clone();
    profile.set_reference("user", Some(user.clone()));

    let err = user.save().unwrap_err();
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::DependencyCycle));
    assert!(err.to_string().starts_with("Dependency cycle detected: "));
    assert!(db.connection().log().is_empty());
}

#[test]
fn failed_saves_roll_back_inside_a_transaction() {
    let db = blog();
    db.connection().fail_on("INSERT INTO \"categorization\"");
    let post = db
        .create_record(
            "post",
            json!({
                "title": "Hello",
                "author": {"name": "Ada"},
                "categorizationList": [{"category": {"title": "Rust"}}],
            }),
        )
        .unwrap();

    let err = db.transaction(|_| post.save()).unwrap_err();
    assert!(err.is_storage_error());
    assert!(db.connection().rows("user").is_empty());
    assert!(db.connection().rows("post").is_empty());
    let statements = db.connection().statements();
    assert_eq!(statements.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
}

#[test]
fn saved_graphs_export_as_json() {
    let db = blog();
    let post = db
        .create_record("post", json!({"title": "Hello", "author": {"name": "Ada"}}))
        .unwrap();
    post.save().unwrap();
    assert_eq!(
        post.to_json(),
        json!({
            "id": 1,
            "title": "Hello",
            "author_id": 1,
            "author": {"id": 1, "name": "Ada"},
        })
    );
}
