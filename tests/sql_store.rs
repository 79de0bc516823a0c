//! Integration tests for the relational store
//!
//! These tests run `SqlStore` against an in-memory SQLite database:
//! - Save, lookup and lifecycle timestamps
//! - Filter predicates, sorting and paging
//! - Conflict-aware upserts, single and batched
//! - Update and delete semantics
//! - Transactions (commit, rollback, panic)
//! - Coercion policies on malformed rows

use std::panic::AssertUnwindSafe;

use assert_matches::assert_matches;
use chrono::{DateTime, Utc};
use futures::FutureExt;

use dbstore::db;
use dbstore::dialect::{OnDuplicateKey, ReplaceInto};
use dbstore::{
    CoercionPolicy, Entity, Filter, FindOptions, SortOrder, SqlStore, Store, StoreError,
    UpdateSpec, UpsertSpec, Value, WriteOrder, filter,
};

#[derive(Entity, Default, Debug, Clone, PartialEq)]
struct Person {
    #[store(primary_key, auto)]
    id: i64,
    name: Option<String>,
    email: String,
    age: i64,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[store(ignore)]
    scratch: String,
}

const SCHEMA: &str = r#"
CREATE TABLE people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    email TEXT NOT NULL UNIQUE,
    age INTEGER NOT NULL CHECK (age >= 0),
    active BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

async fn setup() -> SqlStore<Person> {
    let pool = db::connect_in_memory().await.unwrap();
    sqlx::query(SCHEMA).execute(&pool).await.unwrap();
    SqlStore::new(pool, "people")
}

fn person(name: Option<&str>, email: &str, age: i64) -> Person {
    Person {
        name: name.map(str::to_string),
        email: email.to_string(),
        age,
        active: true,
        ..Default::default()
    }
}

async fn seed_ages(store: &SqlStore<Person>) {
    for (index, age) in [20, 25, 30, 35].into_iter().enumerate() {
        let mut p = person(Some("seed"), &format!("seed{}@example.com", index), age);
        store.save(&mut p).await.unwrap();
    }
}

fn ages(people: &[Person]) -> Vec<i64> {
    people.iter().map(|p| p.age).collect()
}

// ============================================================================
// Save and lookup
// ============================================================================

#[tokio::test]
async fn test_save_writes_back_generated_fields() {
    let store = setup().await;
    let mut ana = person(Some("Ana"), "ana@example.com", 31);
    ana.scratch = "not persisted".into();

    let generated = store.save(&mut ana).await.unwrap();

    assert!(ana.id > 0);
    assert_eq!(generated.id, Value::Int(ana.id));
    assert_eq!(generated.created_at, Some(ana.created_at));
    assert_eq!(ana.created_at, ana.updated_at);

    let loaded = store.find_by_id(ana.id).await.unwrap();
    assert_eq!(loaded.name.as_deref(), Some("Ana"));
    assert_eq!(loaded.email, "ana@example.com");
    assert_eq!(loaded.created_at, ana.created_at);
    assert!(loaded.active);
    assert!(loaded.scratch.is_empty());
    assert!(store.has(ana.id).await.unwrap());
}

#[tokio::test]
async fn test_find_missing_record() {
    let store = setup().await;
    assert_matches!(store.find_by_id(42).await, Err(StoreError::NotFound(_)));
    assert_matches!(
        store.find_one(&filter! { "email" => "nobody@example.com" }).await,
        Err(StoreError::NotFound(_))
    );
    assert!(!store.has(42).await.unwrap());
}

#[tokio::test]
async fn test_update_stamps_and_requires_existing_row() {
    let store = setup().await;
    let mut ana = person(Some("Ana"), "ana@example.com", 31);
    store.save(&mut ana).await.unwrap();
    let created = ana.created_at;

    ana.age = 32;
    store.update(&mut ana).await.unwrap();
    assert!(ana.updated_at >= created);

    let loaded = store.find_by_id(ana.id).await.unwrap();
    assert_eq!(loaded.age, 32);
    assert_eq!(loaded.created_at, created);

    let mut ghost = person(None, "ghost@example.com", 1);
    ghost.id = 999;
    assert_matches!(store.update(&mut ghost).await, Err(StoreError::NotFound(_)));
}

// ============================================================================
// Predicates, sorting and paging
// ============================================================================

mod predicates {
    use super::*;

    #[tokio::test]
    async fn test_comparison_and_membership() {
        let store = setup().await;
        seed_ages(&store).await;

        let older = store
            .find_all(&filter! { "age__gte" => 30 }, FindOptions::new())
            .await
            .unwrap();
        assert_eq!(ages(&older), vec![30, 35]);

        let picked = store
            .find_all(&filter! { "age__in" => vec![25, 35] }, FindOptions::new())
            .await
            .unwrap();
        assert_eq!(ages(&picked), vec![25, 35]);

        let window = filter! { "age__gt" => 20, "age__lt" => 35 };
        assert_eq!(store.count(&window).await.unwrap(), 2);

        let none = filter! { "age__in" => Vec::<i64>::new() };
        assert_eq!(store.count(&none).await.unwrap(), 0);

        assert_eq!(store.count(&filter! { "age__not" => 20 }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_null_checks() {
        let store = setup().await;
        store.save(&mut person(Some("Ana"), "ana@example.com", 31)).await.unwrap();
        store.save(&mut person(None, "anon@example.com", 40)).await.unwrap();

        let unnamed = store
            .find_all(&filter! { "name__is_null" => true }, FindOptions::new())
            .await
            .unwrap();
        assert_eq!(unnamed.len(), 1);
        assert_eq!(unnamed[0].email, "anon@example.com");

        assert_eq!(store.count(&filter! { "name__is_not_null" => true }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pattern_matching() {
        let store = setup().await;
        store.save(&mut person(Some("Ana"), "ana@example.com", 31)).await.unwrap();
        store.save(&mut person(Some("Bruno"), "bruno@example.com", 40)).await.unwrap();

        assert_eq!(store.count(&filter! { "name__like" => "An%" }).await.unwrap(), 1);
        assert_eq!(store.count(&filter! { "name__ilike" => "%RUN%" }).await.unwrap(), 1);
        assert_eq!(store.count(&filter! { "name__not_like" => "An%" }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_operand_is_rejected() {
        let store = setup().await;
        assert_matches!(
            store.count(&filter! { "age__in" => 3 }).await,
            Err(StoreError::TypeMismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_sorting_and_paging() {
        let store = setup().await;
        seed_ages(&store).await;

        let options = FindOptions::new()
            .sort_by("age")
            .order(SortOrder::Desc)
            .limit(2)
            .page(2);
        let people = store.find_all(&Filter::new(), options).await.unwrap();
        assert_eq!(ages(&people), vec![25, 20]);

        let everyone = store.find_all(&Filter::new(), FindOptions::new()).await.unwrap();
        assert_eq!(ages(&everyone), vec![20, 25, 30, 35]);
    }

    #[tokio::test]
    async fn test_find_page_metadata() {
        let store = setup().await;
        seed_ages(&store).await;

        let page = store
            .find_page(&Filter::new(), FindOptions::new().limit(3).page(2))
            .await
            .unwrap();
        assert_eq!(ages(&page.items), vec![35]);
        assert_eq!(page.meta.total_items, 4);
        assert_eq!(page.meta.total_pages, 2);
        assert_eq!(page.meta.current_page, 2);
        assert_eq!(page.meta.item_count, 1);

        let empty = store
            .find_page(&filter! { "age__gt" => 100 }, FindOptions::new())
            .await
            .unwrap();
        assert!(empty.items.is_empty());
        assert_eq!(empty.meta.total_items, 0);
    }

    #[tokio::test]
    async fn test_page_far_past_the_end_is_empty() {
        let store = setup().await;
        seed_ages(&store).await;

        let page = store
            .find_page(&Filter::new(), FindOptions::new().limit(10).page(i64::MAX))
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.meta.total_items, 4);
        assert_eq!(page.meta.current_page, i64::MAX);
    }
}

// ============================================================================
// Upserts
// ============================================================================

mod upserts {
    use super::*;

    #[tokio::test]
    async fn test_upsert_on_unique_column() {
        let store = setup().await;
        let spec = UpsertSpec::on("email");

        let mut first = person(Some("Ana"), "ana@example.com", 31);
        let outcome = store.upsert(&mut first, &spec).await.unwrap();
        assert_eq!(outcome.result.upserted_count, 1);
        assert_eq!(outcome.result.matched_count, 0);
        assert_eq!(outcome.result.upserted_id, Some(Value::Int(first.id)));

        let mut second = person(Some("Ana Maria"), "ana@example.com", 32);
        let outcome = store.upsert(&mut second, &spec).await.unwrap();
        assert_eq!(outcome.result.matched_count, 1);
        assert_eq!(outcome.result.upserted_count, 0);
        assert_eq!(outcome.result.upserted_id, None);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);

        assert_eq!(store.count(&Filter::new()).await.unwrap(), 1);
        let stored = store.find_by_id(first.id).await.unwrap();
        assert_eq!(stored.name.as_deref(), Some("Ana Maria"));
        assert_eq!(stored.age, 32);
        assert_eq!(stored.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_upsert_rejects_unknown_conflict_field() {
        let store = setup().await;
        let mut ana = person(Some("Ana"), "ana@example.com", 31);
        assert_matches!(
            store.upsert(&mut ana, &UpsertSpec::on("nickname")).await,
            Err(StoreError::Validation(_))
        );
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_many_counts() {
        let store = setup().await;
        let spec = UpsertSpec::on("email");
        store.save(&mut person(Some("Ana"), "ana@example.com", 31)).await.unwrap();

        let mut batch = vec![
            person(Some("Ana"), "ana@example.com", 33),
            person(Some("Caio"), "caio@example.com", 27),
        ];
        let result = store
            .upsert_many(&mut batch, &spec, WriteOrder::Ordered)
            .await
            .unwrap();

        assert_eq!(result.matched_count, 1);
        assert_eq!(result.upserted_count, 1);
        assert_eq!(result.upserted_ids.len(), 1);
        assert_eq!(result.upserted_ids.get(&1), Some(&Value::Int(batch[1].id)));
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_many_is_all_or_nothing() {
        let store = setup().await;
        let mut batch = vec![
            person(Some("Ana"), "ana@example.com", 31),
            person(Some("Bad"), "bad@example.com", -1),
        ];
        let result = store
            .upsert_many(&mut batch, &UpsertSpec::on("email"), WriteOrder::Unordered)
            .await;
        assert_matches!(result, Err(StoreError::Database(_)));
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_strategy_must_support_dialect() {
        let store = setup().await;
        let rejected = store.clone().with_upsert_strategy(OnDuplicateKey).err();
        assert_matches!(rejected, Some(StoreError::UnsupportedDialect(_)));
    }

    #[tokio::test]
    async fn test_replace_into_recreates_row() {
        let store = setup().await.with_upsert_strategy(ReplaceInto).unwrap();
        let spec = UpsertSpec::on("email");

        let mut first = person(Some("Ana"), "ana@example.com", 31);
        store.upsert(&mut first, &spec).await.unwrap();
        let mut second = person(Some("Ana"), "ana@example.com", 40);
        let outcome = store.upsert(&mut second, &spec).await.unwrap();

        assert_eq!(outcome.result.matched_count, 1);
        assert_ne!(second.id, first.id);
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 1);
        assert_matches!(store.find_by_id(first.id).await, Err(StoreError::NotFound(_)));
    }
}

// ============================================================================
// Bulk updates and deletes
// ============================================================================

mod writes {
    use super::*;

    #[tokio::test]
    async fn test_update_many_validates_before_writing() {
        let store = setup().await;
        seed_ages(&store).await;

        let specs = vec![
            UpdateSpec::new(filter! { "age" => 20 }).set("age", 21),
            UpdateSpec::new(Filter::new()).set("age", 99),
        ];
        assert_matches!(store.update_many(&specs).await, Err(StoreError::Validation(_)));

        let specs = vec![UpdateSpec::new(filter! { "age" => 20 })];
        assert_matches!(store.update_many(&specs).await, Err(StoreError::Validation(_)));

        assert_eq!(store.count(&filter! { "age" => 20 }).await.unwrap(), 1);
        assert_eq!(store.count(&filter! { "age" => 21 }).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_many_applies_every_spec() {
        let store = setup().await;
        seed_ages(&store).await;

        let specs = vec![
            UpdateSpec::new(filter! { "age__lt" => 30 }).set("active", false),
            UpdateSpec::new(filter! { "age" => 35 }).set("name", "Eldest"),
        ];
        let result = store.update_many(&specs).await.unwrap();
        assert_eq!(result.matched_count, 3);
        assert_eq!(result.modified_count, 3);

        assert_eq!(store.count(&filter! { "active" => false }).await.unwrap(), 2);
        let eldest = store.find_one(&filter! { "age" => 35 }).await.unwrap();
        assert_eq!(eldest.name.as_deref(), Some("Eldest"));
        assert!(eldest.updated_at >= eldest.created_at);
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let store = setup().await;
        seed_ages(&store).await;
        let youngest = store.find_one(&filter! { "age" => 20 }).await.unwrap();

        store.delete(youngest.id).await.unwrap();
        assert_matches!(store.delete(youngest.id).await, Err(StoreError::NotFound(_)));

        assert_matches!(store.delete_many(&Filter::new()).await, Err(StoreError::Validation(_)));
        assert_matches!(store.delete_one(&Filter::new()).await, Err(StoreError::Validation(_)));

        store.delete_one(&filter! { "age__gte" => 30 }).await.unwrap();
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 2);
        assert_matches!(
            store.delete_one(&filter! { "age" => 99 }).await,
            Err(StoreError::NotFound(_))
        );

        let removed = store.delete_many(&filter! { "age__gt" => 0 }).await.unwrap();
        assert_eq!(removed.deleted_count, 2);
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_many_is_all_or_nothing() {
        let store = setup().await;
        let mut batch = vec![
            person(Some("Ana"), "ana@example.com", 31),
            person(Some("Bruno"), "bruno@example.com", 40),
            person(Some("Ana again"), "ana@example.com", 22),
        ];
        assert_matches!(store.save_many(&mut batch).await, Err(StoreError::DuplicateKey(_)));
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 0);

        let mut batch = vec![
            person(Some("Ana"), "ana@example.com", 31),
            person(Some("Bruno"), "bruno@example.com", 40),
        ];
        let result = store.save_many(&mut batch).await.unwrap();
        assert_eq!(
            result.inserted_ids,
            vec![Value::Int(batch[0].id), Value::Int(batch[1].id)]
        );
    }
}

// ============================================================================
// Transactions
// ============================================================================

mod transactions {
    use super::*;

    #[tokio::test]
    async fn test_commit_on_success() {
        let store = setup().await;

        let ids = store
            .with_transaction(|tx| {
                Box::pin(async move {
                    let mut ana = person(Some("Ana"), "ana@example.com", 31);
                    let mut bruno = person(Some("Bruno"), "bruno@example.com", 40);
                    tx.save(&mut ana).await?;
                    tx.save(&mut bruno).await?;
                    assert_eq!(tx.count(&Filter::new()).await?, 2);
                    Ok(vec![ana.id, bruno.id])
                })
            })
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        for id in ids {
            assert!(store.has(id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_rollback_returns_original_error() {
        let store = setup().await;

        let result = store
            .with_transaction(|tx| {
                Box::pin(async move {
                    let mut ana = person(Some("Ana"), "ana@example.com", 31);
                    tx.save(&mut ana).await?;
                    Err::<(), _>(StoreError::validation("abort"))
                })
            })
            .await;

        assert_matches!(result, Err(StoreError::Validation(message)) if message == "abort");
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_statement_rolls_back_earlier_writes() {
        let store = setup().await;

        let result = store
            .with_transaction(|tx| {
                Box::pin(async move {
                    tx.save(&mut person(Some("Ana"), "ana@example.com", 31)).await?;
                    tx.save(&mut person(Some("Twin"), "ana@example.com", 31)).await?;
                    Ok(())
                })
            })
            .await;

        assert_matches!(result, Err(StoreError::DuplicateKey(_)));
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panic_rolls_back() {
        let store = setup().await;

        let outcome = AssertUnwindSafe(store.with_transaction(|tx| {
            Box::pin(async move {
                let mut ana = person(Some("Ana"), "ana@example.com", 31);
                tx.save(&mut ana).await?;
                if ana.id > 0 {
                    panic!("unit of work failed");
                }
                Ok(())
            })
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 0);
    }
}

// ============================================================================
// Coercion
// ============================================================================

#[tokio::test]
async fn test_coercion_policies() {
    let store = setup().await;
    let id = sqlx::query(
        "INSERT INTO people (name, email, age, active, created_at, updated_at) \
         VALUES ('Zed', 'zed@example.com', 'old', 1, '2024-01-01 00:00:00', '2024-01-01 00:00:00')",
    )
    .execute(store.pool())
    .await
    .unwrap()
    .last_insert_rowid();

    let lenient = store.find_by_id(id).await.unwrap();
    assert_eq!(lenient.age, 0);
    assert_eq!(lenient.name.as_deref(), Some("Zed"));
    assert_eq!(lenient.created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");

    let strict = store.clone().with_coercion_policy(CoercionPolicy::Strict);
    assert_matches!(
        strict.find_by_id(id).await,
        Err(StoreError::TypeCoercion(issues)) if issues.len() == 1 && issues[0].field == "age"
    );
}
