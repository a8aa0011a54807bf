use anyhow::{bail, Result};

use super::schema::Database;
use super::types::{Category, DatabaseError};
use crate::util::strip_control_chars;

impl Database {
    // ========================================================================
    // Category Operations
    // ========================================================================

    /// Maximum nesting depth for categories.
    /// Root = depth 0, child = depth 1, grandchild = depth 2.
    /// A category at depth 3 is rejected.
    const MAX_CATEGORY_DEPTH: i64 = 3;

    /// SEC-014: Sanitize and validate a category name.
    ///
    /// Strips control characters (ANSI escape injection prevention), trims
    /// whitespace, and rejects empty/whitespace-only names.
    fn sanitize_category_name(name: &str) -> Result<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            bail!("Category name cannot be empty or whitespace-only");
        }
        Ok(trimmed.to_owned())
    }

    /// Create a new category, returning its ID.
    ///
    /// If `parent_id` is `Some`, the parent must exist and the new category must
    /// stay within [`Self::MAX_CATEGORY_DEPTH`] levels.
    pub async fn create_category(&self, name: &str, parent_id: Option<i64>) -> Result<i64> {
        let clean_name = Self::sanitize_category_name(name)?;

        if let Some(pid) = parent_id {
            let depth = self.ancestor_depth(pid).await?;
            if depth + 1 >= Self::MAX_CATEGORY_DEPTH {
                bail!(
                    "Cannot create category: maximum nesting depth ({}) would be exceeded",
                    Self::MAX_CATEGORY_DEPTH
                );
            }
        }

        let row: (i64,) =
            sqlx::query_as("INSERT INTO categories (name, parent_id) VALUES (?, ?) RETURNING id")
                .bind(&clean_name)
                .bind(parent_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(row.0)
    }

    /// Rename an existing category.
    pub async fn rename_category(&self, id: i64, new_name: &str) -> Result<()> {
        let clean_name = Self::sanitize_category_name(new_name)?;

        let result = sqlx::query("UPDATE categories SET name = ? WHERE id = ?")
            .bind(&clean_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "Category",
                id,
            }
            .into());
        }
        Ok(())
    }

    /// Delete a category.
    ///
    /// Source links are removed by `ON DELETE CASCADE` on `source_categories`;
    /// child categories move to the root via `ON DELETE SET NULL`.
    pub async fn delete_category(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Link a source to a category. Linking twice is a no-op.
    pub async fn assign_source_category(&self, source_id: i64, category_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO source_categories (source_id, category_id) VALUES (?, ?)",
        )
        .bind(source_id)
        .bind(category_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a source/category link. Returns `false` if none existed.
    pub async fn unassign_source_category(&self, source_id: i64, category_id: i64) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM source_categories WHERE source_id = ? AND category_id = ?")
                .bind(source_id)
                .bind(category_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Categories a source belongs to.
    pub async fn categories_for_source(&self, source_id: i64) -> Result<Vec<Category>> {
        let rows: Vec<(i64, String, Option<i64>, i64)> = sqlx::query_as(
            r#"
            SELECT c.id, c.name, c.parent_id, c.sort_order
            FROM categories c
            INNER JOIN source_categories sc ON sc.category_id = c.id
            WHERE sc.source_id = ?
            ORDER BY c.sort_order, c.name
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(into_category).collect())
    }

    /// IDs of sources linked to a category.
    pub async fn sources_in_category(&self, category_id: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT source_id FROM source_categories WHERE category_id = ? ORDER BY source_id",
        )
        .bind(category_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Get all categories as a flat list ordered by sort_order.
    /// Callers build the tree from parent_id relationships.
    pub async fn get_categories_tree(&self) -> Result<Vec<Category>> {
        let rows: Vec<(i64, String, Option<i64>, i64)> = sqlx::query_as(
            "SELECT id, name, parent_id, sort_order FROM categories ORDER BY sort_order, name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(into_category).collect())
    }

    /// Compute the depth of a category by walking its ancestor chain.
    /// Root categories have depth 0.
    ///
    /// LIMIT 50 on the recursive CTE bounds the walk if corrupted data holds a cycle.
    async fn ancestor_depth(&self, category_id: i64) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            WITH RECURSIVE ancestors(id, parent_id, depth) AS (
                SELECT id, parent_id, 0 FROM categories WHERE id = ?
                UNION ALL
                SELECT c.id, c.parent_id, a.depth + 1
                FROM categories c
                JOIN ancestors a ON c.id = a.parent_id
                LIMIT 50
            )
            SELECT MAX(depth) FROM ancestors
            "#,
        )
        .bind(category_id)
        .fetch_one(&self.pool)
        .await?;

        match row.0 {
            Some(depth) => Ok(depth),
            None => bail!("Parent category {} not found", category_id),
        }
    }
}

fn into_category((id, name, parent_id, sort_order): (i64, String, Option<i64>, i64)) -> Category {
    Category {
        id,
        name,
        parent_id,
        sort_order,
    }
}
