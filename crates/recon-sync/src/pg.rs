//! Postgres-backed record store.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{Attributes, Identifier, LocalRecord, RecordKind, WorkspaceId};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::store::{RecordFeed, RecordKey, RecordStore, RecordUpdate, StoreError};

pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying migrations")
}

const PEOPLE_COLUMNS: &str = "id, workspace_id, full_name, company_name, email, phone, job_title, \
     location, linkedin_url, skills, experience, custom_fields, updated_at, deleted_at";

const COMPANY_COLUMNS: &str = "id, workspace_id, name, website, phone, industry, description, \
     location, employee_count, linkedin_url, custom_fields, updated_at, deleted_at";

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn table(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Person => "people",
        RecordKind::Company => "companies",
    }
}

fn columns(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Person => PEOPLE_COLUMNS,
        RecordKind::Company => COMPANY_COLUMNS,
    }
}

/// Shares one pool with the rest of the process; never opens its own.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_row(kind: RecordKind, row: &PgRow) -> Result<LocalRecord, StoreError> {
        let workspace_id: String = row.try_get("workspace_id").map_err(db_err)?;
        let custom_fields: Option<JsonValue> = row.try_get("custom_fields").map_err(db_err)?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(db_err)?;
        let deleted_at: Option<DateTime<Utc>> = row.try_get("deleted_at").map_err(db_err)?;

        let (name, company_name, attributes) = match kind {
            RecordKind::Person => {
                let skills: Option<JsonValue> = row.try_get("skills").map_err(db_err)?;
                let attributes = Attributes {
                    email: row.try_get("email").map_err(db_err)?,
                    phone: row.try_get("phone").map_err(db_err)?,
                    headline: row.try_get("job_title").map_err(db_err)?,
                    location: row.try_get("location").map_err(db_err)?,
                    linkedin_url: row.try_get("linkedin_url").map_err(db_err)?,
                    skills: skills.and_then(|v| serde_json::from_value(v).ok()),
                    experience: row.try_get("experience").map_err(db_err)?,
                    ..Default::default()
                };
                (
                    row.try_get("full_name").map_err(db_err)?,
                    row.try_get("company_name").map_err(db_err)?,
                    attributes,
                )
            }
            RecordKind::Company => {
                let attributes = Attributes {
                    website: row.try_get("website").map_err(db_err)?,
                    phone: row.try_get("phone").map_err(db_err)?,
                    industry: row.try_get("industry").map_err(db_err)?,
                    description: row.try_get("description").map_err(db_err)?,
                    location: row.try_get("location").map_err(db_err)?,
                    employee_count: row.try_get("employee_count").map_err(db_err)?,
                    linkedin_url: row.try_get("linkedin_url").map_err(db_err)?,
                    ..Default::default()
                };
                (row.try_get("name").map_err(db_err)?, None, attributes)
            }
        };

        Ok(LocalRecord {
            id: row.try_get("id").map_err(db_err)?,
            workspace_id: WorkspaceId::new(workspace_id),
            kind,
            name,
            company_name,
            attributes,
            custom_fields: custom_fields.unwrap_or_else(|| JsonValue::Object(Default::default())),
            updated_at,
            deleted_at,
        })
    }

    /// Live record of `kind` in `workspace_id` matching `identifier`, first
    /// by id.
    fn identifier_query(
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        identifier: &Identifier,
    ) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(format!(
            "select {} from {} where deleted_at is null and workspace_id = ",
            columns(kind),
            table(kind)
        ));
        qb.push_bind(workspace_id.as_str().to_string());
        Self::push_identifier_filter(&mut qb, kind, identifier);
        qb.push(" order by id limit 1");
        qb
    }

    fn push_identifier_filter(
        qb: &mut QueryBuilder<'_, Postgres>,
        kind: RecordKind,
        identifier: &Identifier,
    ) {
        match identifier {
            Identifier::LinkedinUrl(_) => {
                qb.push(" and lower(rtrim(trim(linkedin_url), '/')) = ")
                    .push_bind(identifier.query_value());
            }
            Identifier::Email(_) => {
                qb.push(" and lower(trim(email)) = ")
                    .push_bind(identifier.query_value());
            }
            Identifier::Website(_) => {
                qb.push(
                    " and split_part(regexp_replace(lower(trim(website)), '^(https?://)?(www\\.)?', ''), '/', 1) = ",
                )
                .push_bind(identifier.query_value());
            }
            Identifier::NameAndCompany { name, company } => {
                let name_column = match kind {
                    RecordKind::Person => "full_name",
                    RecordKind::Company => "name",
                };
                qb.push(format!(" and lower(trim({name_column})) = "))
                    .push_bind(name.trim().to_lowercase());
                if let (RecordKind::Person, Some(company)) = (kind, company) {
                    qb.push(" and lower(trim(company_name)) = ")
                        .push_bind(company.trim().to_lowercase());
                }
            }
        }
    }

    async fn find_by_identifier(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        identifier: &Identifier,
    ) -> Result<Option<LocalRecord>, StoreError> {
        let mut qb = Self::identifier_query(workspace_id, kind, identifier);
        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| Self::map_row(kind, &row)).transpose()
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_local_record(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        key: &RecordKey,
    ) -> Result<Option<LocalRecord>, StoreError> {
        match key {
            RecordKey::Id(id) => {
                let sql = format!(
                    "select {} from {} where workspace_id = $1 and id = $2 and deleted_at is null",
                    columns(kind),
                    table(kind)
                );
                let row = sqlx::query(&sql)
                    .bind(workspace_id.as_str())
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?;
                row.map(|row| Self::map_row(kind, &row)).transpose()
            }
            RecordKey::Identifiers(identifiers) => {
                for identifier in identifiers.ordered(kind) {
                    if let Some(record) = self.find_by_identifier(workspace_id, kind, &identifier).await? {
                        return Ok(Some(record));
                    }
                }
                Ok(None)
            }
        }
    }

    async fn update_local_record(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        id: &str,
        update: RecordUpdate,
    ) -> Result<LocalRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let lock_sql = format!(
            "select updated_at from {} where workspace_id = $1 and id = $2 and deleted_at is null for update",
            table(kind)
        );
        let current = sqlx::query(&lock_sql)
            .bind(workspace_id.as_str())
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let Some(current) = current else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let updated_at: DateTime<Utc> = current.try_get("updated_at").map_err(db_err)?;
        if updated_at != update.expected_updated_at {
            return Err(StoreError::Conflict(id.to_string()));
        }

        let attrs = &update.attributes;
        let row = match kind {
            RecordKind::Person => {
                let skills = attrs
                    .skills
                    .as_ref()
                    .map(|s| serde_json::to_value(s).unwrap_or(JsonValue::Null));
                let sql = format!(
                    "update people
                        set email = $3, phone = $4, job_title = $5, location = $6,
                            linkedin_url = $7, skills = $8, experience = $9,
                            custom_fields = $10, updated_at = now()
                      where workspace_id = $1 and id = $2
                  returning {PEOPLE_COLUMNS}"
                );
                sqlx::query(&sql)
                    .bind(workspace_id.as_str())
                    .bind(id)
                    .bind(&attrs.email)
                    .bind(&attrs.phone)
                    .bind(&attrs.headline)
                    .bind(&attrs.location)
                    .bind(&attrs.linkedin_url)
                    .bind(skills)
                    .bind(&attrs.experience)
                    .bind(&update.custom_fields)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err)?
            }
            RecordKind::Company => {
                let sql = format!(
                    "update companies
                        set website = $3, phone = $4, industry = $5, description = $6,
                            location = $7, employee_count = $8, linkedin_url = $9,
                            custom_fields = $10, updated_at = now()
                      where workspace_id = $1 and id = $2
                  returning {COMPANY_COLUMNS}"
                );
                sqlx::query(&sql)
                    .bind(workspace_id.as_str())
                    .bind(id)
                    .bind(&attrs.website)
                    .bind(&attrs.phone)
                    .bind(&attrs.industry)
                    .bind(&attrs.description)
                    .bind(&attrs.location)
                    .bind(attrs.employee_count)
                    .bind(&attrs.linkedin_url)
                    .bind(&update.custom_fields)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err)?
            }
        };
        let record = Self::map_row(kind, &row)?;

        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }
}

#[async_trait]
impl RecordFeed for PgRecordStore {
    async fn list_record_ids(
        &self,
        workspace_id: &WorkspaceId,
        kind: RecordKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let sql = format!(
            "select id from {}
              where workspace_id = $1 and deleted_at is null
                and ($2::text is null or id > $2)
              order by id
              limit $3",
            table(kind)
        );
        let rows = sqlx::query(&sql)
            .bind(workspace_id.as_str())
            .bind(after)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(db_err))
            .collect()
    }
}
