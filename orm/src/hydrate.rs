// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::context;
use crate::driver::Row;
use crate::error::Result;
use crate::instance::{EntityInstance, SharedInstance};
use crate::meta::{EntityMeta, Registry, RelationKind};
use crate::statement::{Statement, SubSelectNode};
use crate::value::{EntityValue, ValueObject};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One entity participating in the statement: the root or a join target,
/// addressed by its alias in result-row keys.
struct AliasModel {
    alias: String,
    meta: Arc<EntityMeta>,
    /// (index of the parent model, property on the parent, relation kind).
    parent: Option<(usize, String, RelationKind)>,
}

/// Re-materialises result rows into instance graphs: one instance per
/// alias per distinct primary key, wired together along the join tree.
///
/// Rows of a joined one-to-many load repeat the root once per child; roots
/// are grouped by primary key and children deduplicated, in result order.
pub struct Hydrator<'a> {
    registry: &'a Registry,
    stmt: &'a Statement,
}

impl<'a> Hydrator<'a> {
    pub fn new(registry: &'a Registry, stmt: &'a Statement) -> Self {
        Self { registry, stmt }
    }

    fn alias_models(&self) -> Result<Vec<AliasModel>> {
        let mut models = vec![AliasModel {
            alias: self.stmt.alias.clone(),
            meta: self.registry.get(&self.stmt.entity)?,
            parent: None,
        }];
        for join in &self.stmt.joins {
            let parent = models
                .iter()
                .position(|m| m.alias == join.origin_alias)
                .expect("join origins precede their joins");
            models.push(AliasModel {
                alias: join.alias.clone(),
                meta: self.registry.get(&join.entity)?,
                parent: Some((parent, join.property.clone(), join.kind)),
            });
        }
        Ok(models)
    }

    pub fn hydrate(&self, rows: &[Row]) -> Result<Vec<SharedInstance>> {
        let models = self.alias_models()?;

        // Instances already materialised in this result set, per alias.
        let mut seen: HashMap<(usize, String), SharedInstance> = HashMap::new();
        let mut roots: Vec<SharedInstance> = vec![];
        let mut root_seen: HashSet<String> = HashSet::new();

        for row in rows {
            let mut resolved: Vec<Option<SharedInstance>> = Vec::with_capacity(models.len());

            for (idx, model) in models.iter().enumerate() {
                let pk_key = format!("{}_{}", model.alias, model.meta.primary_key_column());
                let pk = match row.get(&pk_key) {
                    Some(pk) if !pk.is_null() => pk.clone(),
                    // A missed LEFT JOIN: every column of this alias is
                    // NULL, including the key.
                    _ => {
                        resolved.push(None);
                        continue;
                    }
                };

                let seen_key = (idx, pk.canonical());
                let instance = if let Some(instance) = seen.get(&seen_key) {
                    instance.clone()
                } else if let Some(cached) = context::identity_lookup(&model.meta.name, &pk) {
                    // Identity-mapped instances are reused untouched.
                    seen.insert(seen_key, cached.clone());
                    cached
                } else {
                    let instance = self.materialise(model, row)?;
                    context::identity_register(&model.meta.name, &pk, instance.clone());
                    seen.insert(seen_key, instance.clone());
                    instance
                };

                if idx == 0 && root_seen.insert(pk.canonical()) {
                    roots.push(instance.clone());
                }
                resolved.push(Some(instance));
            }

            self.link(&models, &resolved);
        }

        Ok(roots)
    }

    /// Builds a fresh instance for `model` from the row, in hydration mode
    /// so change tracking stays clean.
    fn materialise(&self, model: &AliasModel, row: &Row) -> Result<SharedInstance> {
        let mut instance = EntityInstance::new(&model.meta.name);
        instance.begin_hydration();

        for prop in model.meta.properties.values() {
            let key = format!("{}_{}", model.alias, prop.column);
            let Some(value) = row.get(&key) else { continue };
            let value = match &prop.value_object {
                Some(class) if !value.is_null() => {
                    EntityValue::ValueObject(ValueObject::new(class.clone(), value.clone()))
                }
                _ => value.clone(),
            };
            instance.set(prop.name.clone(), value);
        }
        // Foreign keys land on the relation property as a placeholder; a
        // joined child overwrites it during linking.
        for relation in &model.meta.relations {
            if relation.kind != RelationKind::ManyToOne {
                continue;
            }
            let key = format!("{}_{}", model.alias, relation.column);
            if let Some(value) = row.get(&key) {
                instance.set(relation.name.clone(), value.clone());
            }
        }

        instance.mark_persisted();
        instance.reset_tracking();
        instance.end_hydration();
        Ok(Arc::new(Mutex::new(instance)))
    }

    fn link(&self, models: &[AliasModel], resolved: &[Option<SharedInstance>]) {
        for (idx, model) in models.iter().enumerate() {
            let Some((parent_idx, property, kind)) = &model.parent else {
                continue;
            };
            let (Some(child), Some(parent)) = (&resolved[idx], &resolved[*parent_idx]) else {
                continue;
            };
            if Arc::ptr_eq(child, parent) {
                continue;
            }
            let mut parent = parent.lock();
            let was_hydrating = parent.is_hydrating();
            parent.begin_hydration();
            match kind {
                RelationKind::ManyToOne => {
                    parent.set(property.clone(), EntityValue::Ref(child.clone()));
                }
                RelationKind::OneToMany => {
                    let mut items = match parent.get(property) {
                        Some(EntityValue::Array(items)) => items.clone(),
                        _ => vec![],
                    };
                    let child_pk = instance_pk_canonical(self.registry, child);
                    let already = items.iter().any(|item| match item {
                        EntityValue::Ref(existing) => {
                            Arc::ptr_eq(existing, child)
                                || instance_pk_canonical(self.registry, existing) == child_pk
                        }
                        _ => false,
                    });
                    if !already {
                        items.push(EntityValue::Ref(child.clone()));
                        parent.set(property.clone(), EntityValue::Array(items));
                    }
                }
            }
            if !was_hydrating {
                parent.end_hydration();
            }
        }
    }
}

fn instance_pk_canonical(registry: &Registry, instance: &SharedInstance) -> String {
    let instance = instance.lock();
    registry
        .get(instance.entity())
        .ok()
        .and_then(|meta| instance.primary_key(&meta).map(|pk| pk.canonical()))
        .unwrap_or_default()
}

/// Attaches secondary-SELECT results to their parents, grouping children
/// by the correlation key.
pub fn attach_children(
    registry: &Registry,
    node: &SubSelectNode,
    parents: &[SharedInstance],
    children: &[SharedInstance],
) -> Result<()> {
    match node.kind {
        RelationKind::OneToMany => {
            let parent_meta = registry.get(&node.origin_entity)?;
            for parent in parents {
                let pk = {
                    let parent = parent.lock();
                    parent.primary_key(&parent_meta).cloned()
                };
                let Some(pk) = pk else { continue };

                let matched: Vec<SharedInstance> = children
                    .iter()
                    .filter(|child| {
                        let child = child.lock();
                        match child.get(&node.fk_property) {
                            Some(EntityValue::Ref(linked)) => {
                                instance_pk_value(registry, linked).as_ref() == Some(&pk)
                            }
                            Some(value) => value == &pk,
                            None => false,
                        }
                    })
                    .cloned()
                    .collect();

                let mut parent = parent.lock();
                parent.begin_hydration();
                parent.set(
                    node.origin_property.clone(),
                    EntityValue::Array(matched.into_iter().map(EntityValue::Ref).collect()),
                );
                parent.end_hydration();
            }
        }
        RelationKind::ManyToOne => {
            for parent in parents {
                let fk = {
                    let parent = parent.lock();
                    parent.get(&node.origin_property).cloned()
                };
                let Some(fk) = fk else { continue };
                if fk.is_ref() {
                    continue;
                }

                let child_meta = registry.get(&node.statement.entity)?;
                let matched = children.iter().find(|child| {
                    let child = child.lock();
                    child.primary_key(&child_meta) == Some(&fk)
                });
                if let Some(child) = matched {
                    let mut parent = parent.lock();
                    parent.begin_hydration();
                    parent.set(node.origin_property.clone(), EntityValue::Ref(child.clone()));
                    parent.end_hydration();
                }
            }
        }
    }
    Ok(())
}

fn instance_pk_value(registry: &Registry, instance: &SharedInstance) -> Option<EntityValue> {
    let instance = instance.lock();
    let meta = registry.get(instance.entity()).ok()?;
    instance.primary_key(&meta).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbconn::DbKind;
    use crate::meta::{DbType, PropertyMeta};
    use crate::query::QueryPlan;
    use crate::statement::StatementKind;

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
                .one_to_many("addresses", "Address", "user")
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
        registry
    }

    fn joined_statement(registry: &Registry) -> Statement {
        let mut plan =
            QueryPlan::new(registry, DbKind::Postgres, StatementKind::Select, "User").unwrap();
        plan.load("addresses").unwrap();
        plan.into_statement().unwrap()
    }

    fn row(values: &[(&str, EntityValue)]) -> Row {
        values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn joined_to_many_rows_group_and_deduplicate() {
        let registry = registry();
        let stmt = joined_statement(&registry);
        let rows: Vec<Row> = (1..=3)
            .map(|i| {
                row(&[
                    ("u1_id", EntityValue::Int64(1)),
                    ("u1_email", "a@b".into()),
                    ("a2_id", EntityValue::Int64(i)),
                    ("a2_city", format!("city-{i}").into()),
                    ("a2_user_id", EntityValue::Int64(1)),
                ])
            })
            .collect();

        let roots = Hydrator::new(&registry, &stmt).hydrate(&rows).unwrap();
        assert_eq!(roots.len(), 1);

        let root = roots[0].lock();
        assert!(root.persisted());
        let addresses = root.get("addresses").unwrap().as_array().unwrap();
        assert_eq!(addresses.len(), 3);
        let first = addresses[0].as_instance().unwrap().lock();
        assert_eq!(first.get("city"), Some(&EntityValue::String("city-1".into())));
    }

    #[test]
    fn hydrated_instances_have_clean_change_tracking() {
        let registry = registry();
        let stmt = joined_statement(&registry);
        let rows = vec![row(&[
            ("u1_id", EntityValue::Int64(1)),
            ("u1_email", "a@b".into()),
            ("a2_id", EntityValue::Int64(10)),
            ("a2_city", "Oslo".into()),
            ("a2_user_id", EntityValue::Int64(1)),
        ])];

        let roots = Hydrator::new(&registry, &stmt).hydrate(&rows).unwrap();
        let root = roots[0].lock();
        assert!(root.changed_values().is_empty());
        let addresses = root.get("addresses").unwrap().as_array().unwrap();
        let child = addresses[0].as_instance().unwrap().lock();
        assert!(child.changed_values().is_empty());
    }

    #[test]
    fn missed_left_joins_leave_no_children() {
        let registry = registry();
        let stmt = joined_statement(&registry);
        let rows = vec![row(&[
            ("u1_id", EntityValue::Int64(1)),
            ("u1_email", "a@b".into()),
            ("a2_id", EntityValue::Null),
            ("a2_city", EntityValue::Null),
            ("a2_user_id", EntityValue::Null),
        ])];

        let roots = Hydrator::new(&registry, &stmt).hydrate(&rows).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].lock().get("addresses"), None);
    }

    #[tokio::test]
    async fn identity_mapped_instances_are_reused() {
        let registry = registry();
        let mut plan =
            QueryPlan::new(&registry, DbKind::Postgres, StatementKind::Select, "User").unwrap();
        plan.project(None).unwrap();
        let stmt = plan.into_statement().unwrap();
        let rows = vec![row(&[
            ("u1_id", EntityValue::Int64(1)),
            ("u1_email", "a@b".into()),
        ])];

        context::with_identity_map(async {
            let first = Hydrator::new(&registry, &stmt).hydrate(&rows).unwrap();
            let second = Hydrator::new(&registry, &stmt).hydrate(&rows).unwrap();
            assert!(Arc::ptr_eq(&first[0], &second[0]));
        })
        .await;

        // Without a scope, each hydration builds fresh instances.
        let first = Hydrator::new(&registry, &stmt).hydrate(&rows).unwrap();
        let second = Hydrator::new(&registry, &stmt).hydrate(&rows).unwrap();
        assert!(!Arc::ptr_eq(&first[0], &second[0]));
    }

    #[test]
    fn value_objects_are_reconstructed() {
        let mut registry = Registry::new();
        registry.register(
            EntityMeta::builder("Account")
                .property(PropertyMeta::new("id", DbType::Serial).primary())
                .property(PropertyMeta::new("email", DbType::Text).value_object("Email"))
                .build()
                .unwrap(),
        );
        let mut plan =
            QueryPlan::new(&registry, DbKind::Postgres, StatementKind::Select, "Account").unwrap();
        plan.project(None).unwrap();
        let stmt = plan.into_statement().unwrap();

        let rows = vec![row(&[
            ("a1_id", EntityValue::Int64(1)),
            ("a1_email", "a@b".into()),
        ])];
        let roots = Hydrator::new(&registry, &stmt).hydrate(&rows).unwrap();
        let root = roots[0].lock();
        match root.get("email") {
            Some(EntityValue::ValueObject(vo)) => {
                assert_eq!(vo.class, "Email");
                assert_eq!(vo.value(), &EntityValue::String("a@b".into()));
            }
            other => panic!("expected a value object, got {other:?}"),
        }
    }

    #[test]
    fn sub_select_children_attach_by_foreign_key() {
        let registry = registry();

        let mut plan =
            QueryPlan::new(&registry, DbKind::Postgres, StatementKind::Select, "User").unwrap();
        plan.set_strategy(crate::statement::LoadStrategy::Select);
        plan.load("addresses").unwrap();
        let stmt = plan.into_statement().unwrap();
        let node = &stmt.sub_selects[0];

        let root_rows = vec![
            row(&[("u1_id", EntityValue::Int64(1)), ("u1_email", "a@b".into())]),
            row(&[("u1_id", EntityValue::Int64(2)), ("u1_email", "c@d".into())]),
        ];
        let mut root_plan =
            QueryPlan::new(&registry, DbKind::Postgres, StatementKind::Select, "User").unwrap();
        root_plan.project(None).unwrap();
        let root_stmt = root_plan.into_statement().unwrap();
        let parents = Hydrator::new(&registry, &root_stmt)
            .hydrate(&root_rows)
            .unwrap();

        let child_rows = vec![
            row(&[
                ("a1_id", EntityValue::Int64(10)),
                ("a1_city", "Oslo".into()),
                ("a1_user_id", EntityValue::Int64(1)),
            ]),
            row(&[
                ("a1_id", EntityValue::Int64(11)),
                ("a1_city", "Bergen".into()),
                ("a1_user_id", EntityValue::Int64(2)),
            ]),
        ];
        let children = Hydrator::new(&registry, &node.statement)
            .hydrate(&child_rows)
            .unwrap();

        attach_children(&registry, node, &parents, &children).unwrap();

        let first = parents[0].lock();
        let addresses = first.get("addresses").unwrap().as_array().unwrap();
        assert_eq!(addresses.len(), 1);
        let address = addresses[0].as_instance().unwrap().lock();
        assert_eq!(address.get("city"), Some(&EntityValue::String("Oslo".into())));
    }
}
