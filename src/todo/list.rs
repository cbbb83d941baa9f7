//! TodoList: a flat, back-referencing plan.
//!
//! # Invariants
//! - item ids are unique
//! - a dependency may only name an item earlier in the list, so the plan is
//!   acyclic by construction
//! - an item becomes `Ready` only when every dependency is `Completed`

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::item::{TodoItem, TodoStatus};
use super::TodoError;

#[derive(Debug, Clone, Serialize)]
pub struct TodoList {
    id: Uuid,
    original_request: String,
    items: Vec<TodoItem>,
}

/// Check ids and back-references for a candidate item sequence.
pub fn validate_items(items: &[TodoItem]) -> Result<(), TodoError> {
    if items.is_empty() {
        return Err(TodoError::EmptyList);
    }

    let all: HashSet<&str> = items.iter().map(|i| i.id()).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(items.len());

    for item in items {
        for dep in item.dependencies() {
            if dep == item.id() {
                return Err(TodoError::SelfDependency(item.id().to_string()));
            }
            if !seen.contains(dep.as_str()) {
                let err = if all.contains(dep.as_str()) {
                    TodoError::ForwardDependency {
                        item: item.id().to_string(),
                        dependency: dep.clone(),
                    }
                } else {
                    TodoError::UnknownDependency {
                        item: item.id().to_string(),
                        dependency: dep.clone(),
                    }
                };
                return Err(err);
            }
        }
        if !seen.insert(item.id()) {
            return Err(TodoError::DuplicateId(item.id().to_string()));
        }
    }
    Ok(())
}

impl TodoList {
    /// # Errors
    /// Returns `Err` if the items violate the list invariants.
    pub fn new(original_request: impl Into<String>, items: Vec<TodoItem>) -> Result<Self, TodoError> {
        validate_items(&items)?;
        Ok(Self {
            id: Uuid::new_v4(),
            original_request: original_request.into(),
            items,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn original_request(&self) -> &str {
        &self.original_request
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    pub fn item(&self, id: &str) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.id() == id)
    }

    pub fn item_mut(&mut self, id: &str) -> Result<&mut TodoItem, TodoError> {
        self.items
            .iter_mut()
            .find(|i| i.id() == id)
            .ok_or_else(|| TodoError::UnknownItem(id.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.items.iter().all(|i| i.status().is_terminal())
    }

    /// Ids of items currently `Ready`, in list order.
    pub fn ready_ids(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| i.status() == TodoStatus::Ready)
            .map(|i| i.id().to_string())
            .collect()
    }

    /// Promote pending items whose dependencies all completed and skip those
    /// with a failed or skipped dependency. Returns the ids newly skipped.
    ///
    /// One pass suffices: dependencies always precede their dependents.
    pub fn refresh(&mut self) -> Result<Vec<String>, TodoError> {
        let mut statuses: HashMap<String, TodoStatus> = HashMap::with_capacity(self.items.len());
        let mut skipped = Vec::new();

        for item in &mut self.items {
            if item.status() == TodoStatus::Pending {
                let broken = item.dependencies().iter().find(|d| {
                    matches!(
                        statuses.get(d.as_str()),
                        Some(TodoStatus::Failed) | Some(TodoStatus::Skipped)
                    )
                });

                if let Some(dep) = broken {
                    let reason = format!("dependency {} did not complete", dep);
                    item.skip(reason)?;
                    skipped.push(item.id().to_string());
                } else if item
                    .dependencies()
                    .iter()
                    .all(|d| statuses.get(d.as_str()) == Some(&TodoStatus::Completed))
                {
                    item.mark_ready()?;
                }
            }
            statuses.insert(item.id().to_string(), item.status());
        }

        Ok(skipped)
    }

    /// Abort every non-terminal item. Returns the ids aborted.
    pub fn abort_remaining(&mut self, reason: &str) -> Vec<String> {
        let mut aborted = Vec::new();
        for item in &mut self.items {
            if !item.status().is_terminal() && item.abort(reason).is_ok() {
                aborted.push(item.id().to_string());
            }
        }
        aborted
    }

    /// Splice `replacements` in place of `failed_id`.
    ///
    /// Replacement ids become `{failed_id}-{tag}-{n}`; references between
    /// replacements are renamed to match, and items that depended on the
    /// replaced item now depend on the last replacement. The list is left
    /// untouched if the result would violate the invariants.
    ///
    /// Returns the removed item.
    pub fn replace_item(
        &mut self,
        failed_id: &str,
        replacements: Vec<TodoItem>,
        tag: &str,
    ) -> Result<TodoItem, TodoError> {
        let pos = self
            .items
            .iter()
            .position(|i| i.id() == failed_id)
            .ok_or_else(|| TodoError::UnknownItem(failed_id.to_string()))?;
        if replacements.is_empty() {
            return Err(TodoError::EmptyList);
        }

        let renames: HashMap<String, String> = replacements
            .iter()
            .enumerate()
            .map(|(n, r)| (r.id().to_string(), format!("{}-{}-{}", failed_id, tag, n + 1)))
            .collect();
        let last_id = format!("{}-{}-{}", failed_id, tag, replacements.len());

        let mut spliced: Vec<TodoItem> = Vec::with_capacity(self.items.len() + replacements.len());
        spliced.extend(self.items[..pos].iter().cloned());
        for mut replacement in replacements {
            let new_id = renames
                .get(replacement.id())
                .cloned()
                .unwrap_or_else(|| replacement.id().to_string());
            replacement.set_id(new_id);
            replacement.rename_dependencies(&|d| renames.get(d).cloned());
            spliced.push(replacement);
        }
        for item in &self.items[pos + 1..] {
            let mut item = item.clone();
            item.replace_dependency(failed_id, &last_id);
            spliced.push(item);
        }

        validate_items(&spliced)?;
        let removed = self.items[pos].clone();
        self.items = spliced;
        Ok(removed)
    }
}
