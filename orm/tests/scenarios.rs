//! End-to-end scenarios over the mock driver: SQL shapes, caching,
//! identity mapping, hydration grouping and write paths.

use quarry_orm::context;
use quarry_orm::testing::MockDriver;
use quarry_orm::{
    CacheDirective, CacheSettings, DbKind, DbType, EntityMeta, EntityValue, Filter, FindOptions,
    HookKind, Orm, PropertyMeta, Registry,
};

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(
        EntityMeta::builder("User")
            .property(
                PropertyMeta::new("id", DbType::Serial)
                    .primary()
                    .auto_increment(),
            )
            .property(PropertyMeta::new("email", DbType::Text))
            .property(PropertyMeta::new("name", DbType::Text).nullable())
            .one_to_many("addresses", "Address", "user")
            .one_to_many("posts", "Post", "user")
            .build()
            .unwrap(),
    );
    registry.register(
        EntityMeta::builder("Address")
            .property(
                PropertyMeta::new("id", DbType::Serial)
                    .primary()
                    .auto_increment(),
            )
            .property(PropertyMeta::new("city", DbType::Text))
            .many_to_one("user", "User")
            .build()
            .unwrap(),
    );
    registry.register(
        EntityMeta::builder("Post")
            .property(
                PropertyMeta::new("id", DbType::Serial)
                    .primary()
                    .auto_increment(),
            )
            .property(PropertyMeta::new("title", DbType::Text))
            .many_to_one("user", "User")
            .build()
            .unwrap(),
    );
    registry
}

fn orm_with_mock(kind: DbKind) -> (Arc<Orm>, Arc<MockDriver>) {
    let driver = Arc::new(MockDriver::new(kind));
    let orm = Orm::with_driver(registry(), driver.clone(), CacheSettings::default());
    (orm, driver)
}

#[tokio::test]
async fn s1_simple_select_emits_the_expected_sql() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    driver.queue_rows(vec![MockDriver::row(&[
        ("u1_id", EntityValue::Int64(1)),
        ("u1_email", "a@b".into()),
        ("u1_name", EntityValue::Null),
    ])]);

    let users = orm
        .repository("User")
        .find(
            Filter::from_json(&json!({"email": "a@b"})).unwrap(),
            FindOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        driver.executed(),
        vec![
            "SELECT \"u1\".\"id\" as \"u1_id\", \"u1\".\"email\" as \"u1_email\", \
             \"u1\".\"name\" as \"u1_name\" FROM \"public\".\"user\" u1 \
             WHERE ((u1.email = 'a@b'))"
                .to_string()
        ]
    );
    assert_eq!(users.len(), 1);
    let user = users[0].lock();
    assert_eq!(user.get("email"), Some(&EntityValue::String("a@b".into())));
    assert!(user.persisted());
}

#[tokio::test]
async fn s2_joined_one_to_many_deduplicates_and_skips_limit() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    let rows = (1..=3)
        .map(|i| {
            MockDriver::row(&[
                ("u1_id", EntityValue::Int64(1)),
                ("u1_email", "a@b".into()),
                ("u1_name", EntityValue::Null),
                ("a2_id", EntityValue::Int64(i)),
                ("a2_city", format!("city-{i}").into()),
                ("a2_user_id", EntityValue::Int64(1)),
            ])
        })
        .collect();
    driver.queue_rows(rows);

    let users = orm
        .query("User")
        .load(&["addresses"])
        .limit(1)
        .execute_and_return_all()
        .await
        .unwrap();

    let sql = &driver.executed()[0];
    assert!(sql.contains("LEFT JOIN \"public\".\"address\" a2 ON a2.\"user_id\" = u1.\"id\""));
    assert!(!sql.contains("LIMIT"));

    assert_eq!(users.len(), 1);
    let user = users[0].lock();
    let addresses = user.get("addresses").unwrap().as_array().unwrap();
    assert_eq!(addresses.len(), 3);
}

#[tokio::test]
async fn s3_exists_filters_by_correlated_subquery() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    driver.queue_rows(vec![MockDriver::row(&[
        ("u1_id", EntityValue::Int64(1)),
        ("u1_email", "alice@x".into()),
        ("u1_name", "Alice".into()),
    ])]);

    let authors = orm
        .repository("User")
        .find(
            Filter::from_json(&json!({"posts": {"$exists": {}}})).unwrap(),
            FindOptions::default(),
        )
        .await
        .unwrap();

    let sql = &driver.executed()[0];
    assert!(sql.contains(
        "WHERE ((EXISTS (SELECT 1 FROM \"public\".\"post\" p2 WHERE p2.user_id = u1.id)))"
    ));
    assert_eq!(authors.len(), 1);
    assert_eq!(
        authors[0].lock().get("name"),
        Some(&EntityValue::String("Alice".into()))
    );
}

#[tokio::test]
async fn nexists_returns_the_complement_shape() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    driver.queue_rows(vec![]);

    orm.repository("User")
        .find(
            Filter::from_json(&json!({"posts": {"$nexists": {}}})).unwrap(),
            FindOptions::default(),
        )
        .await
        .unwrap();

    assert!(driver.executed()[0].contains("NOT EXISTS (SELECT 1 FROM"));
}

#[tokio::test]
async fn s4_cache_ttl_coalesces_driver_calls() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    let row = || {
        vec![MockDriver::row(&[
            ("u1_id", EntityValue::Int64(1)),
            ("u1_email", "a@b".into()),
            ("u1_name", EntityValue::Null),
        ])]
    };
    driver.queue_rows(row());
    driver.queue_rows(row());

    let options = || FindOptions::cached(CacheDirective::Ttl(100));
    let repo = orm.repository("User");

    repo.find(Filter::new(), options()).await.unwrap();
    repo.find(Filter::new(), options()).await.unwrap();
    assert_eq!(driver.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    repo.find(Filter::new(), options()).await.unwrap();
    assert_eq!(driver.call_count(), 2);
}

#[tokio::test]
async fn cache_invalidates_on_writes_to_the_same_table() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    let select_row = || {
        vec![MockDriver::row(&[
            ("u1_id", EntityValue::Int64(1)),
            ("u1_email", "a@b".into()),
            ("u1_name", EntityValue::Null),
        ])]
    };
    driver.queue_rows(select_row());

    let repo = orm.repository("User");
    let options = || FindOptions::cached(CacheDirective::Ttl(5_000));

    repo.find(Filter::new(), options()).await.unwrap();
    repo.find(Filter::new(), options()).await.unwrap();
    assert_eq!(driver.call_count(), 1);

    // The insert invalidates the `user` namespace.
    driver.queue_rows(vec![MockDriver::row(&[
        ("id", EntityValue::Int64(2)),
        ("email", "new@x".into()),
        ("name", EntityValue::Null),
    ])]);
    let mut values = quarry_orm::EntityMap::new();
    values.insert("email".into(), "new@x".into());
    repo.create(values).await.unwrap();

    driver.queue_rows(select_row());
    repo.find(Filter::new(), options()).await.unwrap();
    assert_eq!(driver.call_count(), 3);
}

#[tokio::test]
async fn s5_identity_map_returns_the_same_reference_within_a_scope() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    driver.queue_rows(vec![MockDriver::row(&[
        ("p1_id", EntityValue::Int64(1)),
        ("p1_title", "hello".into()),
        ("p1_user_id", EntityValue::Int64(7)),
        ("u2_id", EntityValue::Int64(7)),
        ("u2_email", "a@b".into()),
        ("u2_name", EntityValue::Null),
    ])]);
    driver.queue_rows(vec![MockDriver::row(&[
        ("u1_id", EntityValue::Int64(7)),
        ("u1_email", "a@b".into()),
        ("u1_name", EntityValue::Null),
    ])]);

    context::with_identity_map(async {
        let post = orm
            .repository("Post")
            .find_one(
                Filter::from_json(&json!({"id": 1})).unwrap(),
                FindOptions::load(&["user"]),
            )
            .await
            .unwrap()
            .unwrap();

        let user = orm.repository("User").find_by_id(7i64).await.unwrap().unwrap();

        let post = post.lock();
        let linked = post.get("user").unwrap().as_instance().unwrap();
        assert!(Arc::ptr_eq(linked, &user));
    })
    .await;
}

#[tokio::test]
async fn s6_nul_bytes_refuse_to_emit() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);

    let err = orm
        .repository("User")
        .find(
            Filter::from_json(&json!({"name": "x\u{0}y"})).unwrap(),
            FindOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, quarry_orm::Error::InjectionDetected));
    assert_eq!(driver.call_count(), 0);
}

#[tokio::test]
async fn create_round_trips_through_returning() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    driver.queue_rows(vec![MockDriver::row(&[
        ("id", EntityValue::Int64(42)),
        ("email", "a@b".into()),
        ("name", EntityValue::Null),
    ])]);

    let mut values = quarry_orm::EntityMap::new();
    values.insert("email".into(), "a@b".into());
    let user = orm.repository("User").create(values).await.unwrap();

    let sql = &driver.executed()[0];
    assert_eq!(
        sql,
        "INSERT INTO \"public\".\"user\" (\"email\") VALUES ('a@b') RETURNING *"
    );
    let user = user.lock();
    assert!(user.persisted());
    assert_eq!(user.get("id"), Some(&EntityValue::Int64(42)));
    assert!(user.changed_values().is_empty());
}

#[tokio::test]
async fn mysql_inserts_follow_up_by_last_insert_id() {
    let (orm, driver) = orm_with_mock(DbKind::MySql);
    driver.set_next_insert_id(5);
    driver.queue_rows(vec![]);
    driver.queue_rows(vec![MockDriver::row(&[
        ("u1_id", EntityValue::Int64(5)),
        ("u1_email", "a@b".into()),
        ("u1_name", EntityValue::Null),
    ])]);

    let mut values = quarry_orm::EntityMap::new();
    values.insert("email".into(), "a@b".into());
    let user = orm.repository("User").create(values).await.unwrap();

    let executed = driver.executed();
    assert_eq!(executed[0], "INSERT INTO `user` (`email`) VALUES ('a@b')");
    assert!(executed[1].contains("WHERE ((u1.id = 5))"));
    assert_eq!(user.lock().get("id"), Some(&EntityValue::Int64(5)));
}

#[tokio::test]
async fn hooks_fire_in_sequence_around_writes() {
    let mut registry = Registry::new();
    registry.register(
        EntityMeta::builder("Note")
            .property(
                PropertyMeta::new("id", DbType::Serial)
                    .primary()
                    .auto_increment(),
            )
            .property(PropertyMeta::new("body", DbType::Text))
            .hook(HookKind::BeforeCreate, "stamp", |instance| {
                instance.set("body", "hooked".into());
                Ok(())
            })
            .build()
            .unwrap(),
    );
    let driver = Arc::new(MockDriver::new(DbKind::Postgres));
    let orm = Orm::with_driver(registry, driver.clone(), CacheSettings::default());

    driver.queue_rows(vec![MockDriver::row(&[
        ("id", EntityValue::Int64(1)),
        ("body", "hooked".into()),
    ])]);

    let mut values = quarry_orm::EntityMap::new();
    values.insert("body".into(), "original".into());
    orm.repository("Note").create(values).await.unwrap();

    assert!(driver.executed()[0].contains("VALUES ('hooked')"));
}

#[tokio::test]
async fn update_by_id_targets_bare_columns() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);

    let mut values = quarry_orm::EntityMap::new();
    values.insert("email".into(), "new@x".into());
    orm.repository("User").update_by_id(1i64, values).await.unwrap();

    assert_eq!(
        driver.executed(),
        vec![
            "UPDATE \"public\".\"user\" SET \"email\" = 'new@x' WHERE ((id = 1))".to_string()
        ]
    );
}

#[tokio::test]
async fn transactions_flatten_and_commit_once() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    let engine = orm.engine().clone();

    let inner_engine = engine.clone();
    engine
        .transaction(async move {
            inner_engine.transaction(async { Ok(()) }).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(driver.begun(), 1);
    assert_eq!(driver.committed(), 1);
    assert_eq!(driver.rolled_back(), 0);
}

#[tokio::test]
async fn failed_transactions_roll_back() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);

    let result: quarry_orm::Result<()> = orm
        .transaction(async { Err(anyhow::anyhow!("boom").into()) })
        .await;

    assert!(result.is_err());
    assert_eq!(driver.begun(), 1);
    assert_eq!(driver.committed(), 0);
    assert_eq!(driver.rolled_back(), 1);
}

#[tokio::test]
async fn select_strategy_runs_a_batched_secondary_select() {
    let (orm, driver) = orm_with_mock(DbKind::Postgres);
    driver.queue_rows(vec![
        MockDriver::row(&[
            ("u1_id", EntityValue::Int64(1)),
            ("u1_email", "a@b".into()),
            ("u1_name", EntityValue::Null),
        ]),
        MockDriver::row(&[
            ("u1_id", EntityValue::Int64(2)),
            ("u1_email", "c@d".into()),
            ("u1_name", EntityValue::Null),
        ]),
    ]);
    driver.queue_rows(vec![
        MockDriver::row(&[
            ("a1_id", EntityValue::Int64(10)),
            ("a1_city", "Oslo".into()),
            ("a1_user_id", EntityValue::Int64(1)),
        ]),
        MockDriver::row(&[
            ("a1_id", EntityValue::Int64(11)),
            ("a1_city", "Bergen".into()),
            ("a1_user_id", EntityValue::Int64(2)),
        ]),
    ]);

    let users = orm
        .query("User")
        .set_strategy(quarry_orm::LoadStrategy::Select)
        .load(&["addresses"])
        .execute_and_return_all()
        .await
        .unwrap();

    let executed = driver.executed();
    assert_eq!(executed.len(), 2);
    assert!(!executed[0].contains("JOIN"));
    assert!(executed[1].contains("a1.user_id IN (1, 2)"));

    assert_eq!(users.len(), 2);
    let first = users[0].lock();
    let addresses = first.get("addresses").unwrap().as_array().unwrap();
    assert_eq!(addresses.len(), 1);
}
