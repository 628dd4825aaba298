//! Loading entity graphs from the datastore.
//!
//! `find` reads the root row by key, then follows every association eagerly:
//! single-valued ones by looking up the referenced columns with the values of
//! the local join columns, collections by looking up the target table's join
//! columns with the owner's referenced values. Everything read enters the
//! persistence context as managed, with its row as the flushed and committed
//! image. Entities the context already tracks are not read again.

use crate::context::{AssociationRef, PersistenceContext};
use crate::write::RowImage;
use asupersync::{Cx, Outcome};
use relmodel_core::{
    AssociationInfo, Datastore, EntityKey, Error, JoinSide, KeyResolver, Lookup, MappingRegistry,
    NotFoundError, Row, Value,
};
use std::collections::{BTreeMap, VecDeque};

struct Pending {
    entity: &'static str,
    key: EntityKey,
    row: Row,
}

/// Load the graph rooted at `entity`/`key` into `context`.
#[tracing::instrument(level = "debug", skip(cx, store, registry, context), fields(key = %key))]
pub(crate) async fn load_graph<D: Datastore>(
    cx: &Cx,
    store: &D,
    registry: &MappingRegistry,
    context: &mut PersistenceContext,
    entity: &'static str,
    key: &EntityKey,
) -> Outcome<usize, Error> {
    let (table, key_columns) = match registry
        .mapping(entity)
        .and_then(|m| registry.key_columns(entity).map(|c| (m.table, c.to_vec())))
    {
        Ok(found) => found,
        Err(e) => return Outcome::Err(e),
    };

    let lookup = Lookup::new(table, key_columns, key.values());
    tracing::trace!(sql = %lookup.to_sql(), "Loading root");
    let root = match store.query_one(cx, &lookup).await {
        Outcome::Ok(Some(row)) => row,
        Outcome::Ok(None) => {
            return Outcome::Err(Error::NotFound(NotFoundError {
                entity,
                key: key.clone(),
            }));
        }
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let mut queue = VecDeque::from([Pending {
        entity,
        key: key.clone(),
        row: root,
    }]);
    let mut loaded = 0;

    while let Some(next) = queue.pop_front() {
        if context.contains(next.entity, &next.key) {
            continue;
        }
        let associations = match registry.associations(next.entity) {
            Ok(associations) => associations,
            Err(e) => return Outcome::Err(e),
        };

        let mut refs = BTreeMap::new();
        for assoc in associations {
            let targets = match load_targets(cx, store, registry, assoc, &next.row).await {
                Outcome::Ok(targets) => targets,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let keys: Vec<EntityKey> = targets.iter().map(|t| t.key.clone()).collect();
            let value = if assoc.kind.is_collection() {
                AssociationRef::Many(keys)
            } else {
                AssociationRef::One(keys.into_iter().next())
            };
            refs.insert(assoc.name, value);
            queue.extend(targets);
        }

        let image = match RowImage::from_row(registry, next.entity, &next.row) {
            Ok(image) => image,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(entity = next.entity, key = %next.key, "Loaded");
        context.register_loaded(next.entity, next.key, image, refs);
        loaded += 1;
    }

    Outcome::Ok(loaded)
}

/// Rows reachable from `row` through `assoc`.
async fn load_targets<D: Datastore>(
    cx: &Cx,
    store: &D,
    registry: &MappingRegistry,
    assoc: &AssociationInfo,
    row: &Row,
) -> Outcome<Vec<Pending>, Error> {
    let target = match registry.mapping(assoc.target) {
        Ok(mapping) => mapping,
        Err(e) => return Outcome::Err(e),
    };

    // Columns to look up on the target table, and the values they must equal.
    let (columns, values): (Vec<&'static str>, Vec<Value>) = match assoc.join_side() {
        JoinSide::Source => assoc
            .join_columns
            .iter()
            .map(|j| (j.referenced, row.get_by_name(j.name).cloned().unwrap_or(Value::Null)))
            .unzip(),
        JoinSide::Target => assoc
            .join_columns
            .iter()
            .map(|j| (j.name, row.get_by_name(j.referenced).cloned().unwrap_or(Value::Null)))
            .unzip(),
    };
    if columns.is_empty() || values.iter().any(Value::is_null) {
        return Outcome::Ok(Vec::new());
    }

    let lookup = Lookup::new(target.table, columns, values);
    tracing::trace!(association = assoc.name, sql = %lookup.to_sql(), "Loading association");
    let rows = match store.query(cx, &lookup).await {
        Outcome::Ok(rows) => rows,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    if rows.is_empty() && !assoc.kind.is_collection() {
        tracing::warn!(
            association = assoc.name,
            target = assoc.target,
            "Referenced row is missing; association left empty"
        );
    }

    let key_columns = match registry.key_columns(assoc.target) {
        Ok(columns) => columns,
        Err(e) => return Outcome::Err(e),
    };
    let resolver = KeyResolver::new(registry);
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let values: Vec<Value> = key_columns
            .iter()
            .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
            .collect();
        let key = match resolver.key_from_values(target.name, &values) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };
        out.push(Pending {
            entity: target.name,
            key,
            row,
        });
        if !assoc.kind.is_collection() {
            break;
        }
    }
    Outcome::Ok(out)
}
