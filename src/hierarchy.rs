//! Category tree assembly.
//!
//! Categories are stored flat with an optional parent reference.  A row is
//! a root when it has no parent, names itself as parent, or names a parent
//! that is not part of the input set.  Siblings are ordered by name, then
//! id, so the same rows always produce the same tree.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::metadata::store::CategoryRow;

/// A category with its nested children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryNode {
    pub id: String,
    pub name: String,
    pub children: Vec<CategoryNode>,
}

fn parent_of(row: &CategoryRow) -> Option<&str> {
    row.parent_id.as_deref().filter(|p| *p != row.id)
}

/// Build the forest described by `rows`.
pub fn assemble(rows: &[CategoryRow]) -> Vec<CategoryNode> {
    let ids: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    let mut by_parent: HashMap<&str, Vec<&CategoryRow>> = HashMap::new();
    let mut roots = Vec::new();

    for row in rows {
        match parent_of(row) {
            Some(parent) if ids.contains(parent) => {
                by_parent.entry(parent).or_default().push(row)
            }
            _ => roots.push(row),
        }
    }

    let mut visited = HashSet::new();
    let mut forest: Vec<CategoryNode> = sorted(roots)
        .into_iter()
        .filter_map(|row| build(row, &by_parent, &mut visited))
        .collect();

    // Rows caught in a parent cycle are unreachable from any root; surface
    // them at the top level rather than dropping them.
    let mut stranded: Vec<&CategoryRow> = rows
        .iter()
        .filter(|r| !visited.contains(r.id.as_str()))
        .collect();
    while let Some(row) = sorted(std::mem::take(&mut stranded)).into_iter().next() {
        if let Some(node) = build(row, &by_parent, &mut visited) {
            forest.push(node);
        }
        stranded = rows
            .iter()
            .filter(|r| !visited.contains(r.id.as_str()))
            .collect();
    }

    forest
}

fn build<'a>(
    row: &'a CategoryRow,
    by_parent: &HashMap<&str, Vec<&'a CategoryRow>>,
    visited: &mut HashSet<&'a str>,
) -> Option<CategoryNode> {
    if !visited.insert(row.id.as_str()) {
        return None;
    }
    let children = by_parent
        .get(row.id.as_str())
        .map(|kids| {
            sorted(kids.clone())
                .into_iter()
                .filter_map(|kid| build(kid, by_parent, visited))
                .collect()
        })
        .unwrap_or_default();
    Some(CategoryNode {
        id: row.id.clone(),
        name: row.name.clone(),
        children,
    })
}

fn sorted(mut rows: Vec<&CategoryRow>) -> Vec<&CategoryRow> {
    rows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    rows
}

/// `id` followed by every category below it.  Empty when `id` is unknown.
pub fn descendants(rows: &[CategoryRow], id: &str) -> Vec<String> {
    if !rows.iter().any(|r| r.id == id) {
        return Vec::new();
    }
    let mut by_parent: HashMap<&str, Vec<&str>> = HashMap::new();
    for row in rows {
        if let Some(parent) = parent_of(row) {
            by_parent.entry(parent).or_default().push(row.id.as_str());
        }
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        out.push(current.to_string());
        if let Some(kids) = by_parent.get(current) {
            stack.extend(kids.iter().rev());
        }
    }
    out
}
