//! Parent/child links between counterparties, edited alongside the record.

use crate::core::{FieldMap, RecordId, Row, StoreError, StoreResult};
use crate::storage::{Filter, RecordStore};
use serde_json::Value;
use std::collections::HashMap;

pub const RELATIONSHIPS_TABLE: &str = "counterparty_relationships";

/// A link as seen from the owning counterparty.
///
/// `is_parent` is true when `counterparty_id` is the owner's parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipLink {
    /// Store id; `None` for links created during the edit.
    pub id: Option<RecordId>,
    pub counterparty_id: RecordId,
    pub role: String,
    pub is_parent: bool,
}

impl RelationshipLink {
    pub fn new(counterparty_id: impl Into<RecordId>, role: &str, is_parent: bool) -> Self {
        Self {
            id: None,
            counterparty_id: counterparty_id.into(),
            role: role.to_string(),
            is_parent,
        }
    }

    fn to_row(&self, owner: &RecordId) -> FieldMap {
        let (parent, child) = if self.is_parent {
            (&self.counterparty_id, owner)
        } else {
            (owner, &self.counterparty_id)
        };
        let mut row = FieldMap::new();
        row.insert("parent_id".to_string(), parent.to_value());
        row.insert("child_id".to_string(), child.to_value());
        row.insert("role".to_string(), Value::String(self.role.clone()));
        row
    }
}

/// Writes needed to turn the original links into the edited ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipPlan {
    pub to_insert: Vec<RelationshipLink>,
    pub to_delete: Vec<RelationshipLink>,
    pub to_update: Vec<RelationshipLink>,
}

impl RelationshipPlan {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_delete.is_empty() && self.to_update.is_empty()
    }
}

/// Compares stored links against the edited list.
///
/// Links without an id are inserted, stored links missing from the edit
/// are deleted, and a role change is an update. Flipping the direction
/// cannot be expressed as an update: the old row is deleted and a new one
/// inserted.
pub fn plan_relationship_changes(
    original: &[RelationshipLink],
    current: &[RelationshipLink],
) -> RelationshipPlan {
    let original_by_id: HashMap<&RecordId, &RelationshipLink> = original
        .iter()
        .filter_map(|link| link.id.as_ref().map(|id| (id, link)))
        .collect();
    let current_ids: Vec<&RecordId> = current.iter().filter_map(|l| l.id.as_ref()).collect();

    let mut plan = RelationshipPlan::default();

    for link in current {
        match link.id.as_ref().and_then(|id| original_by_id.get(id)) {
            None => plan.to_insert.push(RelationshipLink {
                id: None,
                ..link.clone()
            }),
            Some(orig) if orig.is_parent != link.is_parent => {
                plan.to_delete.push((*orig).clone());
                plan.to_insert.push(RelationshipLink {
                    id: None,
                    ..link.clone()
                });
            }
            Some(orig) if orig.role != link.role => plan.to_update.push(link.clone()),
            Some(_) => {}
        }
    }

    for link in original {
        if let Some(id) = &link.id {
            if !current_ids.contains(&id) {
                plan.to_delete.push(link.clone());
            }
        }
    }

    plan
}

/// Reads the owner's links in both directions.
pub async fn load_relationships(
    store: &dyn RecordStore,
    owner: &RecordId,
) -> StoreResult<Vec<RelationshipLink>> {
    let as_parent = store
        .select(RELATIONSHIPS_TABLE, &Filter::new().eq("parent_id", owner.to_value()))
        .await?;
    let as_child = store
        .select(RELATIONSHIPS_TABLE, &Filter::new().eq("child_id", owner.to_value()))
        .await?;

    let mut links = Vec::with_capacity(as_parent.len() + as_child.len());
    for row in &as_parent {
        links.push(link_from_row(row, "child_id", false)?);
    }
    for row in &as_child {
        links.push(link_from_row(row, "parent_id", true)?);
    }
    Ok(links)
}

/// Executes a plan. Returns the inserted links with their new ids.
pub async fn apply_relationship_plan(
    store: &dyn RecordStore,
    owner: &RecordId,
    plan: &RelationshipPlan,
) -> StoreResult<Vec<RelationshipLink>> {
    let mut inserted = Vec::with_capacity(plan.to_insert.len());
    for link in &plan.to_insert {
        let row = store.insert(RELATIONSHIPS_TABLE, link.to_row(owner)).await?;
        inserted.push(RelationshipLink {
            id: row.get("id").and_then(RecordId::from_value),
            ..link.clone()
        });
    }

    for link in &plan.to_delete {
        if let Some(id) = &link.id {
            store.delete(RELATIONSHIPS_TABLE, id).await?;
        }
    }

    for link in &plan.to_update {
        if let Some(id) = &link.id {
            let mut fields = FieldMap::new();
            fields.insert("role".to_string(), Value::String(link.role.clone()));
            store.update(RELATIONSHIPS_TABLE, id, fields).await?;
        }
    }

    Ok(inserted)
}

fn link_from_row(row: &Row, other_column: &str, is_parent: bool) -> StoreResult<RelationshipLink> {
    let counterparty_id = row
        .get(other_column)
        .and_then(RecordId::from_value)
        .ok_or_else(|| StoreError::Decode(format!("relationship without {other_column}")))?;
    Ok(RelationshipLink {
        id: row.get("id").and_then(RecordId::from_value),
        counterparty_id,
        role: row
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        is_parent,
    })
}
