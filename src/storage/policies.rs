use anyhow::{bail, Context, Result};

use super::schema::Database;
use super::types::{Policy, PolicyParams, PolicyScope};

type PolicyRow = (i64, String, Option<String>, String, String, i64);

fn into_policy(row: PolicyRow) -> Result<Policy> {
    let (id, name, description, scope, params, created_at) = row;
    let params: PolicyParams = serde_json::from_str(&params)
        .with_context(|| format!("Policy {} has malformed params", id))?;
    Ok(Policy {
        id,
        name,
        description,
        scope: scope.parse().unwrap_or_default(),
        params,
        created_at,
    })
}

impl Database {
    // ========================================================================
    // Policy Operations
    // ========================================================================

    /// Store a named policy, returning its ID.
    ///
    /// Params are validated first; names are unique.
    pub async fn create_policy(
        &self,
        name: &str,
        description: Option<&str>,
        scope: PolicyScope,
        params: &PolicyParams,
    ) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Policy name cannot be empty");
        }
        if let Err(reason) = params.validate() {
            bail!("Invalid policy params: {}", reason);
        }

        let json = serde_json::to_string(params)?;
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO policies (name, description, scope, params, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(description)
        .bind(scope.as_str())
        .bind(&json)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create policy '{}'", name))?;

        Ok(row.0)
    }

    pub async fn get_policy(&self, id: i64) -> Result<Option<Policy>> {
        let row: Option<PolicyRow> = sqlx::query_as(
            "SELECT id, name, description, scope, params, created_at FROM policies WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(into_policy).transpose()
    }

    pub async fn list_policies(&self) -> Result<Vec<Policy>> {
        let rows: Vec<PolicyRow> = sqlx::query_as(
            "SELECT id, name, description, scope, params, created_at FROM policies ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(into_policy).collect()
    }

    /// Delete a policy. Sources referencing it fall back to no policy.
    pub async fn delete_policy(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM policies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
