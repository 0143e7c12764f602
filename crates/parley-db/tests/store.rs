use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};
use parley_db::Database;
use parley_db::models::{MessageRow, format_ts, pair_key};
use uuid::Uuid;

fn user(db: &Database, email: &str) -> String {
    let (row, _) = db
        .find_or_create_user(&Uuid::new_v4().to_string(), email, "someone", &format_ts(Utc::now()))
        .unwrap();
    row.id
}

fn conversation(db: &Database, a: &str, b: &str) -> String {
    let key = pair_key(a.parse().unwrap(), b.parse().unwrap());
    let (row, _) = db
        .create_or_get_conversation(&Uuid::new_v4().to_string(), a, b, &key, &format_ts(Utc::now()))
        .unwrap();
    row.id
}

fn text_message(conversation_id: &str, sender_id: &str, text: &str, offset_ms: i64) -> MessageRow {
    MessageRow {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        kind: "text".into(),
        text: Some(text.into()),
        image_url: None,
        image_storage_id: None,
        seen: false,
        seen_at: None,
        created_at: format_ts(Utc::now() + Duration::milliseconds(offset_ms)),
        client_id: None,
    }
}

fn unseen_for(db: &Database, viewer: &str) -> u64 {
    db.list_conversations_for_user(viewer).unwrap()[0].1
}

#[test]
fn find_or_create_user_is_idempotent_per_email() {
    let db = Database::open_in_memory().unwrap();
    let now = format_ts(Utc::now());

    let (first, created) = db
        .find_or_create_user(&Uuid::new_v4().to_string(), "a@x.com", "a", &now)
        .unwrap();
    assert!(created);

    let (second, created) = db
        .find_or_create_user(&Uuid::new_v4().to_string(), "a@x.com", "other", &now)
        .unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);
    assert_eq!(second.name, "a");
}

#[test]
fn conversation_lookup_is_order_independent() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "a@x.com");
    let b = user(&db, "b@x.com");

    let ab = conversation(&db, &a, &b);
    let ba = conversation(&db, &b, &a);
    assert_eq!(ab, ba);
    assert_eq!(db.list_conversations_for_user(&a).unwrap().len(), 1);
}

#[test]
fn concurrent_first_contact_creates_one_conversation() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let a = user(&db, "a@x.com");
    let b = user(&db, "b@x.com");

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let db = db.clone();
            let (x, y) = if i % 2 == 0 { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
            thread::spawn(move || conversation(&db, &x, &y))
        })
        .collect();

    let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(db.list_conversations_for_user(&b).unwrap().len(), 1);
}

#[test]
fn listing_marks_only_counterpart_messages_seen() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "a@x.com");
    let b = user(&db, "b@x.com");
    let conv = conversation(&db, &a, &b);

    db.insert_message(&text_message(&conv, &a, "hi", 0), "hi").unwrap();
    db.insert_message(&text_message(&conv, &b, "hey", 1), "hey").unwrap();
    assert_eq!(unseen_for(&db, &b), 1);

    let first_read = format_ts(Utc::now());
    let (rows, marked) = db.mark_seen_and_list(&conv, &b, &first_read).unwrap();
    assert_eq!(marked, 1);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].text.as_deref(), Some("hi"));
    assert!(rows[0].seen);
    assert_eq!(rows[0].seen_at.as_deref(), Some(first_read.as_str()));
    // b's own message stays unseen until a reads it
    assert!(!rows[1].seen);
    assert_eq!(unseen_for(&db, &b), 0);
    assert_eq!(unseen_for(&db, &a), 1);

    let later = format_ts(Utc::now() + Duration::seconds(30));
    let (rows, marked) = db.mark_seen_and_list(&conv, &b, &later).unwrap();
    assert_eq!(marked, 0);
    assert_eq!(rows[0].seen_at.as_deref(), Some(first_read.as_str()));
}

#[test]
fn conversations_sorted_by_latest_activity() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "a@x.com");
    let b = user(&db, "b@x.com");
    let c = user(&db, "c@x.com");
    let with_b = conversation(&db, &a, &b);
    let with_c = conversation(&db, &a, &c);

    db.insert_message(&text_message(&with_c, &c, "first", 1_000), "first").unwrap();
    db.insert_message(&text_message(&with_b, &b, "second", 2_000), "second").unwrap();

    let listed = db.list_conversations_for_user(&a).unwrap();
    assert_eq!(listed[0].0.id, with_b);
    assert_eq!(listed[0].0.latest_text.as_deref(), Some("second"));
    assert_eq!(listed[0].1, 1);
    assert_eq!(listed[1].0.id, with_c);

    let converted = listed.into_iter().next().unwrap().0.into_conversation().unwrap();
    assert_eq!(converted.latest_message.unwrap().sender_id.to_string(), b);
}

#[test]
fn profile_update_keeps_unset_fields() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "a@x.com");

    db.update_profile(&a, None, Some("hello"), None).unwrap();
    let row = db.update_profile(&a, Some("Alice"), None, None).unwrap().unwrap();
    assert_eq!(row.name, "Alice");
    assert_eq!(row.bio.as_deref(), Some("hello"));

    assert!(db.update_profile(&Uuid::new_v4().to_string(), Some("x"), None, None).unwrap().is_none());
}

#[test]
fn search_excludes_caller_and_escapes_wildcards() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "alice@x.com");
    user(&db, "alfred@x.com");
    user(&db, "bob@x.com");

    let found = db.search_users("al", &a, 10).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].email, "alfred@x.com");

    assert!(db.search_users("%", &a, 10).unwrap().is_empty());
}

#[test]
fn client_id_is_stored_with_the_message() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "a@x.com");
    let b = user(&db, "b@x.com");
    let conv = conversation(&db, &a, &b);

    let mut tagged = text_message(&conv, &a, "hi", 0);
    tagged.client_id = Some("local-1".into());
    db.insert_message(&tagged, "hi").unwrap();
    db.insert_message(&text_message(&conv, &a, "untagged", 1), "untagged").unwrap();

    let (rows, _) = db.mark_seen_and_list(&conv, &a, &format_ts(Utc::now())).unwrap();
    assert_eq!(rows[0].client_id.as_deref(), Some("local-1"));
    assert_eq!(rows[1].client_id, None);
}
