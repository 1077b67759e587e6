//! Read-only referral tree view.

use super::{fetch_user, LedgerStore};
use crate::{error::LedgerResult, models::ReferralNode};
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::warn;

/// Levels below the root shown by the dashboard tree.
pub const DEFAULT_TREE_DEPTH: usize = 5;

impl LedgerStore {
    /// Downline of `user_id`, at most `max_depth` levels below the root.
    pub async fn get_referral_tree(
        &self,
        user_id: i64,
        max_depth: usize,
    ) -> LedgerResult<ReferralNode> {
        self.read(|conn| {
            let root = fetch_user(conn, user_id)?;
            let mut visited = HashSet::from([root.id]);
            let children = downline(conn, root.id, max_depth, &mut visited)?;
            Ok(ReferralNode {
                id: root.id,
                name: root.name,
                email: root.email,
                referral_code: root.referral_code,
                total_invested: root.total_invested,
                children,
            })
        })
        .await
    }
}

fn downline(
    conn: &Connection,
    parent_id: i64,
    depth_left: usize,
    visited: &mut HashSet<i64>,
) -> LedgerResult<Vec<ReferralNode>> {
    if depth_left == 0 {
        return Ok(Vec::new());
    }

    let direct = {
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, email, referral_code, total_invested
             FROM users WHERE referred_by = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([parent_id], |row| {
                Ok(ReferralNode {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    referral_code: row.get(3)?,
                    total_invested: row.get(4)?,
                    children: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut nodes = Vec::with_capacity(direct.len());
    for mut node in direct {
        if !visited.insert(node.id) {
            warn!(user_id = node.id, parent_id, "Referral cycle in tree view, skipping");
            continue;
        }
        node.children = downline(conn, node.id, depth_left - 1, visited)?;
        nodes.push(node);
    }
    Ok(nodes)
}
